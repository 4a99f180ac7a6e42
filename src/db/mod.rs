pub mod models;

use models::{
    ContentPart, Conversation, GenerationToken, Message, MessagePatch, MessageRole, NewMessage,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("message {0} is finalized and can no longer change")]
    Frozen(String),
    #[error("database lock poisoned")]
    LockPoisoned,
    #[error("failed to create data directory: {0}")]
    Io(#[from] std::io::Error),
}

pub type DbResult<T> = Result<T, DbError>;

pub struct Database {
    conn: Mutex<Connection>,
}

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, role, content, reasoning, is_streaming, seq, file_ids, parts, created_at";

const CONVERSATION_COLUMNS: &str = "id, owner, title, model, created_at, last_activity_at";

impl Database {
    pub fn new(app_dir: &std::path::Path) -> DbResult<Self> {
        std::fs::create_dir_all(app_dir)?;
        let db_path = app_dir.join("ai-box.db");
        let conn = Connection::open(db_path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    fn migrate(&self) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                title TEXT NOT NULL,
                model TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                last_activity_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_owner
                ON conversations(owner, last_activity_at);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
                content TEXT NOT NULL,
                reasoning TEXT,
                is_streaming INTEGER NOT NULL DEFAULT 0,
                seq INTEGER NOT NULL,
                file_ids TEXT,
                parts TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation_seq
                ON messages(conversation_id, seq);

            CREATE TABLE IF NOT EXISTS generation_tokens (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_generation_tokens_conversation
                ON generation_tokens(conversation_id);

            CREATE TABLE IF NOT EXISTS provider_credentials (
                owner TEXT PRIMARY KEY,
                api_key TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ── Conversations ──

    pub fn create_conversation(
        &self,
        owner: &str,
        title: &str,
        model: Option<&str>,
    ) -> DbResult<Conversation> {
        let conn = self.conn()?;
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO conversations (id, owner, title, model, last_activity_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, owner, title, model, now_millis()],
        )?;
        let conv = conn.query_row(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
            params![id],
            row_to_conversation,
        )?;
        Ok(conv)
    }

    pub fn get_conversation(&self, id: &str) -> DbResult<Option<Conversation>> {
        let conn = self.conn()?;
        let conv = conn
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id],
                row_to_conversation,
            )
            .optional()?;
        Ok(conv)
    }

    pub fn list_conversations(&self, owner: &str) -> DbResult<Vec<Conversation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE owner = ?1 ORDER BY last_activity_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map(params![owner], row_to_conversation)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn delete_conversation(&self, id: &str) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn update_conversation_title(&self, id: &str, title: &str) -> DbResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE conversations SET title = ?1 WHERE id = ?2",
            params![title, id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound {
                entity: "conversation",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    // ── Messages ──

    /// Appends at the end of the conversation and bumps its activity time.
    pub fn add_message(&self, conversation_id: &str, input: NewMessage) -> DbResult<Message> {
        let file_ids = input.file_ids.as_ref().map(serde_json::to_string).transpose()?;
        let parts = input.parts.as_ref().map(serde_json::to_string).transpose()?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?1)",
            params![conversation_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(DbError::NotFound {
                entity: "conversation",
                id: conversation_id.to_string(),
            });
        }

        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        let id = uuid::Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO messages (id, conversation_id, role, content, is_streaming, seq, file_ids, parts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                conversation_id,
                input.role.as_str(),
                input.content,
                input.is_streaming,
                seq,
                file_ids,
                parts
            ],
        )?;
        // Touch conversation activity; MAX keeps it from moving backwards on clock skew
        tx.execute(
            "UPDATE conversations SET last_activity_at = MAX(last_activity_at, ?1) WHERE id = ?2",
            params![now_millis(), conversation_id],
        )?;
        let msg = tx.query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            params![id],
            row_to_message,
        )?;
        tx.commit()?;
        Ok(msg)
    }

    pub fn get_message(&self, id: &str) -> DbResult<Option<Message>> {
        let conn = self.conn()?;
        let msg = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                row_to_message,
            )
            .optional()?;
        Ok(msg)
    }

    pub fn get_messages(&self, conversation_id: &str) -> DbResult<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 ORDER BY seq ASC"
        ))?;
        let rows = stmt.query_map(params![conversation_id], row_to_message)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Last-write-wins partial update. Only streaming messages accept patches,
    /// so `is_streaming` can go true -> false once and never back.
    pub fn patch_message(&self, id: &str, patch: &MessagePatch) -> DbResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE messages SET
                content = COALESCE(?1, content),
                reasoning = COALESCE(?2, reasoning),
                is_streaming = COALESCE(?3, is_streaming)
             WHERE id = ?4 AND is_streaming = 1",
            params![patch.content, patch.reasoning, patch.is_streaming, id],
        )?;
        if changed == 1 {
            return Ok(());
        }

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        if exists {
            Err(DbError::Frozen(id.to_string()))
        } else {
            Err(DbError::NotFound {
                entity: "message",
                id: id.to_string(),
            })
        }
    }

    /// Deletes a message. A user message takes the assistant reply that
    /// immediately follows it along. Returns the ids removed.
    pub fn delete_message_cascade(&self, id: &str) -> DbResult<Vec<String>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let target: Option<(String, String, i64)> = tx
            .query_row(
                "SELECT conversation_id, role, seq FROM messages WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((conversation_id, role, seq)) = target else {
            return Err(DbError::NotFound {
                entity: "message",
                id: id.to_string(),
            });
        };

        let mut deleted = vec![id.to_string()];
        if role == MessageRole::User.as_str() {
            let next: Option<(String, String)> = tx
                .query_row(
                    "SELECT id, role FROM messages WHERE conversation_id = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT 1",
                    params![conversation_id, seq],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if let Some((next_id, next_role)) = next {
                if next_role == MessageRole::Assistant.as_str() {
                    tx.execute("DELETE FROM messages WHERE id = ?1", params![next_id])?;
                    deleted.push(next_id);
                }
            }
        }

        tx.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(deleted)
    }

    // ── Generation tokens ──

    pub fn insert_generation_token(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> DbResult<GenerationToken> {
        let conn = self.conn()?;
        let token = GenerationToken {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            created_at: now_millis(),
        };
        conn.execute(
            "INSERT INTO generation_tokens (id, conversation_id, message_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![token.id, token.conversation_id, token.message_id, token.created_at],
        )?;
        Ok(token)
    }

    pub fn has_generation_token(&self, conversation_id: &str) -> DbResult<bool> {
        let conn = self.conn()?;
        let exists = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM generation_tokens WHERE conversation_id = ?1)",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn list_generation_tokens(&self, conversation_id: &str) -> DbResult<Vec<GenerationToken>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, message_id, created_at FROM generation_tokens WHERE conversation_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok(GenerationToken {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                message_id: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn delete_generation_tokens(&self, conversation_id: &str) -> DbResult<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM generation_tokens WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        Ok(removed)
    }

    // ── Credentials ──

    pub fn get_api_key(&self, owner: &str) -> DbResult<Option<String>> {
        let conn = self.conn()?;
        let key = conn
            .query_row(
                "SELECT api_key FROM provider_credentials WHERE owner = ?1",
                params![owner],
                |row| row.get(0),
            )
            .optional()?;
        Ok(key)
    }

    pub fn set_api_key(&self, owner: &str, api_key: &str) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO provider_credentials (owner, api_key, updated_at) VALUES (?1, ?2, datetime('now'))",
            params![owner, api_key],
        )?;
        Ok(())
    }

    pub fn delete_api_key(&self, owner: &str) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM provider_credentials WHERE owner = ?1",
            params![owner],
        )?;
        Ok(())
    }

    // ── Settings ──

    pub fn get_setting(&self, key: &str) -> DbResult<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> DbResult<()> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        owner: row.get(1)?,
        title: row.get(2)?,
        model: row.get(3)?,
        created_at: row.get(4)?,
        last_activity_at: row.get(5)?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(2)?;
    let role = role
        .parse::<MessageRole>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role,
        content: row.get(3)?,
        reasoning: row.get(4)?,
        is_streaming: row.get(5)?,
        seq: row.get(6)?,
        file_ids: json_column::<Vec<String>>(row, 7)?,
        parts: json_column::<Vec<ContentPart>>(row, 8)?,
        created_at: row.get(9)?,
    })
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|text| {
        serde_json::from_str(&text)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}
