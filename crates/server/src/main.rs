//! Realtime group-chat server.
//!
//! One axum binary: a WebSocket session endpoint for the live protocol and a
//! small REST surface for chat management (friends, groups, chat lists).
//! Message fan-out is participant-scoped through the connection registry;
//! presence and typing state are process-local.

mod app_state;
mod config;
mod presence;
mod registry;
mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use server_api::{ApiContext, LeaveOutcome};
use shared::domain::ChatId;
use shared::error::{ApiError, ErrorCode};
use shared::protocol::wire_timestamp;
use storage::Storage;

use crate::app_state::AppState;
use crate::config::{load_settings, prepare_database_url};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = Arc::new(AppState::new(ApiContext::new(storage)));
    let app = build_router(state);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws/:username", get(session::ws_handler))
        .route("/api/add_friend", post(http_add_friend))
        .route("/api/remove_friend", post(http_remove_friend))
        .route("/api/user/chats", get(http_user_chats))
        .route("/api/friends_list", get(http_friends_list))
        .route("/api/group_create", post(http_group_create))
        .route("/api/group_info", get(http_group_info))
        .route("/api/group_update_members", post(http_group_update_members))
        .route("/api/group_leave", post(http_group_leave))
        .route("/api/delete_chat", post(http_delete_chat))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Request/response errors surface as `{"error": message}` with a matching
/// status; session-protocol failures never reach the client at all.
struct ApiFailure(ApiError);

impl From<ApiError> for ApiFailure {
    fn from(err: ApiError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = match self.0.code {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::FORBIDDEN,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(serde_json::json!({ "error": self.0.message })),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
struct FriendForm {
    username: String,
    friend: String,
}

#[derive(Debug, Deserialize)]
struct UsernameQuery {
    username: String,
}

#[derive(Debug, Deserialize)]
struct GroupCreateForm {
    username: String,
    #[serde(default)]
    name: String,
    /// Comma-separated member names, as the client submits them.
    members: String,
}

#[derive(Debug, Deserialize)]
struct ChatIdQuery {
    chat_id: String,
}

#[derive(Debug, Deserialize)]
struct GroupMembersForm {
    chat_id: String,
    members: String,
}

#[derive(Debug, Deserialize)]
struct ChatMemberForm {
    chat_id: String,
    username: String,
}

#[derive(Debug, Serialize)]
struct FriendEntry {
    username: String,
    online: bool,
    last_seen: Option<String>,
}

fn split_members(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|member| member.trim().to_string())
        .filter(|member| !member.is_empty())
        .collect()
}

async fn http_add_friend(
    State(state): State<Arc<AppState>>,
    Form(form): Form<FriendForm>,
) -> Result<Json<server_api::FriendAdded>, ApiFailure> {
    let added = server_api::add_friend(&state.api, &form.username, &form.friend).await?;
    Ok(Json(added))
}

async fn http_remove_friend(
    State(state): State<Arc<AppState>>,
    Form(form): Form<FriendForm>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    server_api::remove_friend(&state.api, &form.username, &form.friend).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn http_user_chats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UsernameQuery>,
) -> Result<Json<server_api::UserChats>, ApiFailure> {
    let chats = server_api::user_chats(&state.api, &query.username).await?;
    Ok(Json(chats))
}

async fn http_friends_list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UsernameQuery>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let mut friends = Vec::new();
    for username in server_api::friends_of(&state.api, &query.username).await? {
        let last_seen = state
            .api
            .storage
            .last_seen(&username)
            .await
            .ok()
            .flatten()
            .map(wire_timestamp);
        friends.push(FriendEntry {
            online: state.presence.is_online(&username),
            username,
            last_seen,
        });
    }
    Ok(Json(serde_json::json!({ "friends": friends })))
}

async fn http_group_create(
    State(state): State<Arc<AppState>>,
    Form(form): Form<GroupCreateForm>,
) -> Result<Json<server_api::GroupInfo>, ApiFailure> {
    let members = split_members(&form.members);
    let group =
        server_api::create_group(&state.api, &form.username, &form.name, &members).await?;
    Ok(Json(group))
}

async fn http_group_info(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChatIdQuery>,
) -> Result<Json<server_api::GroupInfo>, ApiFailure> {
    let info =
        server_api::current_composition(&state.api, &ChatId::new(query.chat_id)).await?;
    Ok(Json(info))
}

async fn http_group_update_members(
    State(state): State<Arc<AppState>>,
    Form(form): Form<GroupMembersForm>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let members = split_members(&form.members);
    let participants =
        server_api::update_members(&state.api, &ChatId::new(form.chat_id), &members).await?;
    Ok(Json(
        serde_json::json!({ "success": true, "participants": participants }),
    ))
}

async fn http_group_leave(
    State(state): State<Arc<AppState>>,
    Form(form): Form<ChatMemberForm>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let outcome =
        server_api::leave_group(&state.api, &ChatId::new(form.chat_id), &form.username).await?;
    let body = match outcome {
        LeaveOutcome::Deleted => serde_json::json!({ "success": true, "chat_deleted": true }),
        LeaveOutcome::Remaining(participants) => {
            serde_json::json!({ "success": true, "participants": participants })
        }
    };
    Ok(Json(body))
}

async fn http_delete_chat(
    State(state): State<Arc<AppState>>,
    Form(form): Form<ChatMemberForm>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    server_api::delete_chat(&state.api, &ChatId::new(form.chat_id)).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
