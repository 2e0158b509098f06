use super::*;

async fn memory_storage() -> Storage {
    Storage::new("sqlite::memory:").await.expect("db")
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = memory_storage().await;
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn ensure_user_is_idempotent() {
    let storage = memory_storage().await;
    storage.ensure_user("alice").await.expect("user");
    storage.ensure_user("alice").await.expect("user again");
    assert!(storage.user_exists("alice").await.expect("exists"));
    assert!(!storage.user_exists("nobody").await.expect("exists"));
}

#[tokio::test]
async fn touch_last_seen_records_an_instant() {
    let storage = memory_storage().await;
    storage.ensure_user("alice").await.expect("user");
    assert!(storage.last_seen("alice").await.expect("query").is_none());

    storage.touch_last_seen("alice").await.expect("touch");
    let seen = storage.last_seen("alice").await.expect("query").expect("instant");
    assert!((Utc::now() - seen).num_seconds() < 5);
}

#[tokio::test]
async fn appended_messages_get_increasing_ids_and_ordered_history() {
    let storage = memory_storage().await;
    let chat = ChatId::new("alice:bob");

    let first = storage.append_message(&chat, "alice", "hi").await.expect("append");
    let second = storage.append_message(&chat, "bob", "hey").await.expect("append");
    assert!(second.id.0 > first.id.0);

    let history = storage.messages_for_chat(&chat).await.expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].text, "hi");
    assert_eq!(history[1].text, "hey");
    assert!(history[0].timestamp <= history[1].timestamp);
}

#[tokio::test]
async fn history_is_partitioned_by_chat() {
    let storage = memory_storage().await;
    let one = ChatId::new("alice:bob");
    let other = ChatId::new("alice:carol");
    storage.append_message(&one, "alice", "to bob").await.expect("append");
    storage.append_message(&other, "alice", "to carol").await.expect("append");

    let history = storage.messages_for_chat(&one).await.expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].text, "to bob");
}

#[tokio::test]
async fn update_and_delete_report_whether_a_row_was_hit() {
    let storage = memory_storage().await;
    let chat = ChatId::new("alice:bob");
    let stored = storage.append_message(&chat, "alice", "hi").await.expect("append");

    assert!(storage.update_message_text(stored.id, "edited").await.expect("update"));
    let reloaded = storage
        .message_by_id(stored.id)
        .await
        .expect("query")
        .expect("message");
    assert_eq!(reloaded.text, "edited");

    assert!(storage.delete_message(stored.id).await.expect("delete"));
    assert!(!storage.delete_message(stored.id).await.expect("delete again"));
    assert!(storage.message_by_id(stored.id).await.expect("query").is_none());
}

#[tokio::test]
async fn delete_chat_purges_every_message() {
    let storage = memory_storage().await;
    let chat = ChatId::new("group:0a1b2c3d");
    storage.append_message(&chat, "system", "one").await.expect("append");
    storage.append_message(&chat, "alice", "two").await.expect("append");
    assert!(storage.chat_exists(&chat).await.expect("exists"));

    let purged = storage.delete_chat(&chat).await.expect("purge");
    assert_eq!(purged, 2);
    assert!(!storage.chat_exists(&chat).await.expect("exists"));
}

#[tokio::test]
async fn system_messages_come_back_newest_first() {
    let storage = memory_storage().await;
    let chat = ChatId::new("group:0a1b2c3d");
    storage.append_message(&chat, "system", "older").await.expect("append");
    storage.append_message(&chat, "alice", "user noise").await.expect("append");
    storage.append_message(&chat, "system", "newer").await.expect("append");

    let records = storage.system_messages_desc(&chat).await.expect("records");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].text, "newer");
    assert_eq!(records[1].text, "older");
}

#[tokio::test]
async fn chat_enumeration_queries_cover_author_and_substring() {
    let storage = memory_storage().await;
    storage
        .append_message(&ChatId::new("alice:bob"), "alice", "hi")
        .await
        .expect("append");
    storage
        .append_message(&ChatId::new("alice:carol"), "carol", "yo")
        .await
        .expect("append");
    storage
        .append_message(&ChatId::new("group:0a1b2c3d"), "system", "record")
        .await
        .expect("append");

    let authored = storage.chat_ids_for_author("alice").await.expect("authored");
    assert_eq!(authored, vec![ChatId::new("alice:bob")]);

    let containing = storage.chat_ids_containing("alice").await.expect("containing");
    assert_eq!(containing.len(), 2);

    let groups = storage.chat_ids_containing("group:").await.expect("groups");
    assert_eq!(groups, vec![ChatId::new("group:0a1b2c3d")]);
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let db_path = temp_root.path().join("nested").join("chat.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    storage.health_check().await.expect("health check");
    assert!(db_path.exists());
}
