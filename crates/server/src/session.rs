//! Per-connection session protocol handler.
//!
//! One task per live connection: authenticate, register, snapshot, then
//! dispatch client events until the transport closes. Malformed or
//! unauthorized events are dropped silently; only a transport disconnect or
//! an unrecoverable decode failure ends the session, and teardown runs on
//! every exit path.

use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use shared::domain::{ChatId, PUBLIC_CHAT_ID};
use shared::protocol::{parse_client_event, ClientEvent, ServerEvent};

use crate::app_state::AppState;

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session(state, socket, username))
}

async fn session(state: Arc<AppState>, mut socket: WebSocket, username: String) {
    let known = state
        .api
        .storage
        .user_exists(&username)
        .await
        .unwrap_or(false);
    if !known {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "unknown user".into(),
            })))
            .await;
        return;
    }

    if let Err(err) = state.api.storage.touch_last_seen(&username).await {
        warn!(user = %username, error = %err, "failed to persist last-seen on connect");
    }

    let (handle, mut queue) = state.registry.register(&username).await;
    state.presence.mark_online(&username);
    info!(user = %username, "session active");

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(event) = queue.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Initial snapshot: the public room's history (empty unless the legacy
    // broadcast room is in use). Clients request other chats explicitly.
    send_history(&state, &username, ChatId::new(PUBLIC_CHAT_ID)).await;

    while let Some(incoming) = stream.next().await {
        let message = match incoming {
            Ok(message) => message,
            Err(err) => {
                debug!(user = %username, error = %err, "transport error, closing session");
                break;
            }
        };
        match message {
            Message::Text(raw) => match parse_client_event(&raw) {
                Some(event) => dispatch(&state, &username, event).await,
                None => debug!(user = %username, "ignoring malformed event"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    // An evicted session must not tear down the presence its replacement
    // now owns.
    if state.registry.unregister(&handle).await {
        state.presence.mark_offline(&username);
        for (chat_id, users) in state.presence.clear_user(&username) {
            let chat_id = ChatId::new(chat_id);
            let event = ServerEvent::Typing {
                chat_id: chat_id.clone(),
                users,
            };
            emit_to_chat(&state, &chat_id, &event).await;
        }
    }
    if let Err(err) = state.api.storage.touch_last_seen(&username).await {
        warn!(user = %username, error = %err, "failed to persist last-seen on disconnect");
    }
    writer.abort();
    info!(user = %username, "session closed");
}

/// Applies one client event. Precondition failures are logged and dropped;
/// nothing is reported back to the client.
pub(crate) async fn dispatch(state: &AppState, username: &str, event: ClientEvent) {
    match event {
        ClientEvent::LoadChat { chat_id } => {
            send_history(state, username, chat_id).await;
        }
        ClientEvent::Typing { chat_id, is_typing } => {
            let users = state.presence.set_typing(chat_id.as_str(), username, is_typing);
            let event = ServerEvent::Typing {
                chat_id: chat_id.clone(),
                users,
            };
            emit_to_chat(state, &chat_id, &event).await;
        }
        ClientEvent::Send { chat_id, text } => {
            match server_api::post_message(&state.api, &chat_id, username, &text).await {
                Ok(event) => emit_to_chat(state, &chat_id, &event).await,
                Err(err) => debug!(user = username, code = ?err.code, "send dropped"),
            }
        }
        ClientEvent::Attachment {
            chat_id,
            url,
            filename,
            is_image,
        } => {
            match server_api::post_attachment(
                &state.api, &chat_id, username, &url, &filename, is_image,
            )
            .await
            {
                Ok(event) => emit_to_chat(state, &chat_id, &event).await,
                Err(err) => debug!(user = username, code = ?err.code, "attachment dropped"),
            }
        }
        ClientEvent::EditMessage { message_id, text } => {
            match server_api::edit_message(&state.api, username, message_id, &text).await {
                Ok((event, chat_id)) => emit_to_chat(state, &chat_id, &event).await,
                Err(err) => debug!(user = username, code = ?err.code, "edit dropped"),
            }
        }
        ClientEvent::DeleteMessage { message_id } => {
            match server_api::delete_message(&state.api, username, message_id).await {
                Ok((event, chat_id)) => emit_to_chat(state, &chat_id, &event).await,
                Err(err) => debug!(user = username, code = ?err.code, "delete dropped"),
            }
        }
    }
}

/// Unicast history reply through the requester's own queue.
async fn send_history(state: &AppState, username: &str, chat_id: ChatId) {
    match server_api::load_history(&state.api, &chat_id).await {
        Ok(messages) => {
            state
                .registry
                .send_to(
                    &[username.to_string()],
                    &ServerEvent::History { chat_id, messages },
                )
                .await;
        }
        Err(err) => debug!(user = username, code = ?err.code, "history request dropped"),
    }
}

/// Delivers a chat event to the chat's resolved participants, or to every
/// live connection when membership cannot be narrowed.
async fn emit_to_chat(state: &AppState, chat_id: &ChatId, event: &ServerEvent) {
    match server_api::recipients_for_chat(&state.api, chat_id).await {
        Ok(Some(recipients)) => state.registry.send_to(&recipients, event).await,
        Ok(None) => state.registry.broadcast(event).await,
        Err(err) => {
            debug!(chat = %chat_id, code = ?err.code, "recipient resolution failed, broadcasting");
            state.registry.broadcast(event).await;
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
