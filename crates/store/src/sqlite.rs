//! SQLite store.
//!
//! One row per conversation. Messages and metadata live in a JSON `body`
//! column; id, title and timestamps are real columns so listing never has to
//! decode bodies.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::info;
use weft_core::error::StoreError;
use weft_core::message::{Conversation, ConversationId, ConversationPatch, ConversationSummary, Message};
use weft_core::store::ChatStore;

pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Body {
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
}

fn storage(context: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |e| StoreError::Storage(format!("{context}: {e}"))
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path`.
    ///
    /// Pass `"sqlite::memory:"` for an ephemeral database.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let in_memory = path.contains(":memory:");
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // Every connection to ":memory:" is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .connect_with(options)
            .await
            .map_err(storage("Failed to open SQLite"))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite chat store initialized at {path}");
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id            TEXT PRIMARY KEY NOT NULL,
                title         TEXT,
                body          TEXT NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage("conversations table"))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversations_updated_at ON conversations(updated_at DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(storage("updated_at index"))?;

        Ok(())
    }

    fn encode_body(conversation: &Conversation) -> Result<String, StoreError> {
        let body = Body {
            messages: conversation.messages.clone(),
            metadata: conversation.metadata.clone(),
        };
        serde_json::to_string(&body).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Fixed-width so that `ORDER BY updated_at` sorts chronologically.
    fn format_time(t: &DateTime<Utc>) -> String {
        t.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StoreError::Serialization(format!("bad timestamp '{raw}': {e}")))
    }

    fn row_to_conversation(row: &sqlx::sqlite::SqliteRow) -> Result<Conversation, StoreError> {
        let id: String = row.try_get("id").map_err(storage("id"))?;
        let title: Option<String> = row.try_get("title").map_err(storage("title"))?;
        let body: String = row.try_get("body").map_err(storage("body"))?;
        let created_at: String = row.try_get("created_at").map_err(storage("created_at"))?;
        let updated_at: String = row.try_get("updated_at").map_err(storage("updated_at"))?;

        let body: Body =
            serde_json::from_str(&body).map_err(|e| StoreError::Serialization(format!("{id}: {e}")))?;

        Ok(Conversation {
            id: ConversationId(id),
            title,
            messages: body.messages,
            created_at: Self::parse_time(&created_at)?,
            updated_at: Self::parse_time(&updated_at)?,
            metadata: body.metadata,
        })
    }

    async fn fetch(
        executor: impl sqlx::SqliteExecutor<'_>,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(
            "SELECT id, title, body, created_at, updated_at FROM conversations WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(executor)
        .await
        .map_err(storage("select conversation"))?;

        row.as_ref().map(Self::row_to_conversation).transpose()
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_conversation(&self, conversation: Conversation) -> Result<Conversation, StoreError> {
        sqlx::query(
            "INSERT INTO conversations (id, title, body, message_count, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&conversation.id.0)
        .bind(&conversation.title)
        .bind(Self::encode_body(&conversation)?)
        .bind(conversation.messages.len() as i64)
        .bind(Self::format_time(&conversation.created_at))
        .bind(Self::format_time(&conversation.updated_at))
        .execute(&self.pool)
        .await
        .map_err(storage("insert conversation"))?;

        Ok(conversation)
    }

    async fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        Self::fetch(&self.pool, id).await
    }

    async fn update_conversation(
        &self,
        id: &ConversationId,
        patch: ConversationPatch,
    ) -> Result<Option<Conversation>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage("begin"))?;

        let Some(mut conversation) = Self::fetch(&mut *tx, id).await? else {
            return Ok(None);
        };
        patch.apply(&mut conversation);

        sqlx::query(
            "UPDATE conversations
             SET title = ?, body = ?, message_count = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&conversation.title)
        .bind(Self::encode_body(&conversation)?)
        .bind(conversation.messages.len() as i64)
        .bind(Self::format_time(&conversation.updated_at))
        .bind(&id.0)
        .execute(&mut *tx)
        .await
        .map_err(storage("update conversation"))?;

        tx.commit().await.map_err(storage("commit"))?;
        Ok(Some(conversation))
    }

    async fn list_conversations(&self, limit: usize) -> Result<Vec<ConversationSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, title, message_count, updated_at FROM conversations
             ORDER BY updated_at DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage("list conversations"))?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(storage("id"))?;
                let updated_at: String = row.try_get("updated_at").map_err(storage("updated_at"))?;
                let count: i64 = row.try_get("message_count").map_err(storage("message_count"))?;
                Ok(ConversationSummary {
                    id: ConversationId(id),
                    title: row.try_get("title").map_err(storage("title"))?,
                    message_count: count as usize,
                    updated_at: Self::parse_time(&updated_at)?,
                })
            })
            .collect()
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await
            .map_err(storage("delete conversation"))?;
        Ok(result.rows_affected() > 0)
    }
}
