use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};

use shared::domain::{ChatId, MessageId, SYSTEM_AUTHOR};

/// Durable append/read/update/delete surface over the message stream, plus
/// the user-existence and last-seen bits the session layer consumes.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: MessageId,
    pub author: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub chat_id: ChatId,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Users (consumed surface of the external auth collaborator)
    // -----------------------------------------------------------------------

    pub async fn ensure_user(&self, username: &str) -> Result<()> {
        sqlx::query("INSERT INTO users (username) VALUES (?) ON CONFLICT(username) DO NOTHING")
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn user_exists(&self, username: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM users WHERE username = ? LIMIT 1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn touch_last_seen(&self, username: &str) -> Result<()> {
        sqlx::query("UPDATE users SET last_seen = ? WHERE username = ?")
            .bind(encode_instant(Utc::now()))
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn last_seen(&self, username: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_seen FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let raw: Option<String> = row.get(0);
        raw.map(|text| decode_instant(&text)).transpose()
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    pub async fn append_message(
        &self,
        chat_id: &ChatId,
        author: &str,
        text: &str,
    ) -> Result<StoredMessage> {
        let timestamp = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO messages (author, text, timestamp, chat_id) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(author)
        .bind(text)
        .bind(encode_instant(timestamp))
        .bind(chat_id.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(StoredMessage {
            id: MessageId(rec.get::<i64, _>(0)),
            author: author.to_string(),
            text: text.to_string(),
            timestamp,
            chat_id: chat_id.clone(),
        })
    }

    /// Full ordered history of one chat, oldest first. Ids are assigned in
    /// insertion order, so the id tiebreak keeps same-instant messages
    /// consistent with that order.
    pub async fn messages_for_chat(&self, chat_id: &ChatId) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, author, text, timestamp, chat_id FROM messages
             WHERE chat_id = ?
             ORDER BY timestamp ASC, id ASC",
        )
        .bind(chat_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    pub async fn message_by_id(&self, id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT id, author, text, timestamp, chat_id FROM messages WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_message).transpose()
    }

    pub async fn update_message_text(&self, id: MessageId, text: &str) -> Result<bool> {
        let outcome = sqlx::query("UPDATE messages SET text = ? WHERE id = ?")
            .bind(text)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(outcome.rows_affected() > 0)
    }

    pub async fn delete_message(&self, id: MessageId) -> Result<bool> {
        let outcome = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(outcome.rows_affected() > 0)
    }

    /// Purges every message of a chat; the chat ceases to exist.
    pub async fn delete_chat(&self, chat_id: &ChatId) -> Result<u64> {
        let outcome = sqlx::query("DELETE FROM messages WHERE chat_id = ?")
            .bind(chat_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(outcome.rows_affected())
    }

    pub async fn chat_exists(&self, chat_id: &ChatId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM messages WHERE chat_id = ? LIMIT 1")
            .bind(chat_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// System-authored messages of one chat, newest first. The membership
    /// ledger folds over these to find the latest composition record.
    pub async fn system_messages_desc(&self, chat_id: &ChatId) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, author, text, timestamp, chat_id FROM messages
             WHERE chat_id = ? AND author = ?
             ORDER BY id DESC",
        )
        .bind(chat_id.as_str())
        .bind(SYSTEM_AUTHOR)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    pub async fn chat_ids_for_author(&self, author: &str) -> Result<Vec<ChatId>> {
        let rows = sqlx::query("SELECT DISTINCT chat_id FROM messages WHERE author = ?")
            .bind(author)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| ChatId::new(row.get::<String, _>(0)))
            .collect())
    }

    pub async fn chat_ids_containing(&self, fragment: &str) -> Result<Vec<ChatId>> {
        let rows = sqlx::query("SELECT DISTINCT chat_id FROM messages WHERE chat_id LIKE ?")
            .bind(format!("%{fragment}%"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| ChatId::new(row.get::<String, _>(0)))
            .collect())
    }
}

// Fixed-width UTC text keeps lexicographic and chronological order aligned.
fn encode_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_instant(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|instant| instant.with_timezone(&Utc))
        .with_context(|| format!("invalid stored timestamp '{raw}'"))
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<StoredMessage> {
    Ok(StoredMessage {
        id: MessageId(row.get::<i64, _>(0)),
        author: row.get::<String, _>(1),
        text: row.get::<String, _>(2),
        timestamp: decode_instant(&row.get::<String, _>(3))?,
        chat_id: ChatId::new(row.get::<String, _>(4)),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
