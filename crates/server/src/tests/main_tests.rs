use super::*;
use axum::{body, body::Body, http::Request};
use tower::ServiceExt;

async fn test_app() -> (Router, Arc<AppState>) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    for user in ["alice", "bob", "carol"] {
        storage.ensure_user(user).await.expect("user");
    }
    let state = Arc::new(AppState::new(ApiContext::new(storage)));
    (build_router(state.clone()), state)
}

fn form_post(uri: &str, body: &str) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn json_body(response: Response) -> serde_json::Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (app, _state) = test_app().await;
    let response = app
        .oneshot(Request::get("/healthz").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(bytes.as_ref(), b"ok");
}

#[tokio::test]
async fn add_friend_route_creates_the_private_chat_once() {
    let (app, state) = test_app().await;

    let response = app
        .clone()
        .oneshot(form_post("/api/add_friend", "username=alice&friend=bob"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let dto = json_body(response).await;
    assert_eq!(dto["success"], true);
    assert_eq!(dto["chat_id"], "alice:bob");
    assert_eq!(dto["friend"], "bob");

    let response = app
        .oneshot(form_post("/api/add_friend", "username=bob&friend=alice"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let history = state
        .api
        .storage
        .messages_for_chat(&ChatId::new("alice:bob"))
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn add_friend_errors_use_the_error_payload_shape() {
    let (app, _state) = test_app().await;

    let response = app
        .clone()
        .oneshot(form_post("/api/add_friend", "username=alice&friend=alice"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let dto = json_body(response).await;
    assert!(dto["error"].as_str().expect("message").contains("yourself"));

    let response = app
        .oneshot(form_post("/api/add_friend", "username=alice&friend=nobody"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn user_chats_route_lists_both_sides() {
    let (app, _state) = test_app().await;
    app.clone()
        .oneshot(form_post("/api/add_friend", "username=alice&friend=bob"))
        .await
        .expect("response");
    app.clone()
        .oneshot(form_post(
            "/api/group_create",
            "username=alice&name=Trip&members=bob,carol",
        ))
        .await
        .expect("response");

    let response = app
        .oneshot(
            Request::get("/api/user/chats?username=alice")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let dto = json_body(response).await;
    assert_eq!(dto["private_chats"][0]["name"], "bob");
    assert_eq!(dto["group_chats"][0]["name"], "Trip");
}

#[tokio::test]
async fn group_lifecycle_over_http() {
    let (app, state) = test_app().await;

    let response = app
        .clone()
        .oneshot(form_post(
            "/api/group_create",
            "username=alice&name=Trip&members=bob,carol",
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let created = json_body(response).await;
    let chat_id = created["chat_id"].as_str().expect("chat id").to_string();
    assert!(chat_id.starts_with("group:"));
    assert_eq!(chat_id.len(), "group:".len() + 8);

    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/api/group_info?chat_id={chat_id}"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let info = json_body(response).await;
    assert_eq!(info["name"], "Trip");
    assert_eq!(
        info["participants"],
        serde_json::json!(["alice", "bob", "carol"])
    );

    let response = app
        .clone()
        .oneshot(form_post(
            "/api/group_update_members",
            &format!("chat_id={chat_id}&members=alice,bob"),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let updated = json_body(response).await;
    assert_eq!(updated["participants"], serde_json::json!(["alice", "bob"]));

    let response = app
        .clone()
        .oneshot(form_post(
            "/api/group_leave",
            &format!("chat_id={chat_id}&username=bob"),
        ))
        .await
        .expect("response");
    let left = json_body(response).await;
    assert_eq!(left["chat_deleted"], true);

    let exists = state
        .api
        .storage
        .chat_exists(&ChatId::new(chat_id))
        .await
        .expect("exists");
    assert!(!exists);
}

#[tokio::test]
async fn group_update_below_two_members_is_a_bad_request() {
    let (app, _state) = test_app().await;
    let response = app
        .clone()
        .oneshot(form_post(
            "/api/group_create",
            "username=alice&name=Trip&members=bob",
        ))
        .await
        .expect("response");
    let created = json_body(response).await;
    let chat_id = created["chat_id"].as_str().expect("chat id").to_string();

    let response = app
        .oneshot(form_post(
            "/api/group_update_members",
            &format!("chat_id={chat_id}&members=alice"),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let dto = json_body(response).await;
    assert_eq!(dto["error"], "group needs at least 2 members");
}

#[tokio::test]
async fn friends_list_route_derives_presence() {
    let (app, state) = test_app().await;
    app.clone()
        .oneshot(form_post("/api/add_friend", "username=alice&friend=bob"))
        .await
        .expect("response");
    state.presence.mark_online("bob");

    let response = app
        .oneshot(
            Request::get("/api/friends_list?username=alice")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    let dto = json_body(response).await;
    assert_eq!(dto["friends"][0]["username"], "bob");
    assert_eq!(dto["friends"][0]["online"], true);
}

#[tokio::test]
async fn delete_chat_route_purges_everything() {
    let (app, state) = test_app().await;
    app.clone()
        .oneshot(form_post("/api/add_friend", "username=alice&friend=bob"))
        .await
        .expect("response");

    let response = app
        .oneshot(form_post(
            "/api/delete_chat",
            "chat_id=alice:bob&username=alice",
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let exists = state
        .api
        .storage
        .chat_exists(&ChatId::new("alice:bob"))
        .await
        .expect("exists");
    assert!(!exists);
}
