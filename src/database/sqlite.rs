//! Embedded SQLite backend.
//!
//! Single connection behind a coarse mutex, driven through
//! `spawn_blocking` so row work never blocks the runtime. WAL journaling
//! keeps concurrent readers cheap.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::store::{
    AttachmentRef, ChatRecord, ChatStore, MessageRecord, MessageRole, SessionStatus,
    StreamSessionRecord, Visibility,
};

/// SQLite-backed [`ChatStore`].
#[derive(Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ready = self.conn.lock().map(|guard| guard.is_some()).unwrap_or(false);
        f.debug_struct("SqliteStore")
            .field("db_path", &self.db_path)
            .field("ready", &ready)
            .finish()
    }
}

impl SqliteStore {
    /// Create a store rooted at the given database file. [`Self::init`]
    /// must run before first use.
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            conn: Arc::new(Mutex::new(None)),
        }
    }

    /// Open the connection and apply schema.
    pub async fn init(&self) -> Result<()> {
        let conn_slot = Arc::clone(&self.conn);
        let db_path = self.db_path.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut guard = conn_slot.lock().unwrap();
            if guard.is_none() {
                if let Some(parent) = db_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let conn = Connection::open(&db_path)?;
                // WAL for concurrent readers while the relay writes.
                conn.pragma_update(None, "journal_mode", "WAL")?;

                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS chats (
                        id TEXT PRIMARY KEY,
                        user_id TEXT NOT NULL,
                        title TEXT NOT NULL,
                        visibility TEXT NOT NULL DEFAULT 'private',
                        created_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_chats_user_created
                        ON chats(user_id, created_at DESC);

                    CREATE TABLE IF NOT EXISTS messages (
                        id TEXT PRIMARY KEY,
                        chat_id TEXT NOT NULL,
                        role TEXT NOT NULL,
                        content TEXT NOT NULL,
                        reasoning TEXT,
                        attachments TEXT NOT NULL DEFAULT '[]',
                        model TEXT NOT NULL,
                        created_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_messages_chat_created
                        ON messages(chat_id, created_at);

                    CREATE TABLE IF NOT EXISTS stream_sessions (
                        id TEXT PRIMARY KEY,
                        chat_id TEXT NOT NULL,
                        user_id TEXT NOT NULL,
                        status TEXT NOT NULL,
                        streamed_content TEXT NOT NULL DEFAULT '',
                        streamed_reasoning TEXT NOT NULL DEFAULT '',
                        last_chunk_at TEXT NOT NULL,
                        message_id TEXT
                    );
                    CREATE INDEX IF NOT EXISTS idx_stream_sessions_lookup
                        ON stream_sessions(chat_id, user_id, status);
                    ",
                )?;
                *guard = Some(conn);
            }
            Ok(())
        })
        .await
        .context("Tokio spawn_blocking failed")??;

        Ok(())
    }

    fn with_conn<T, F>(&self, f: F) -> impl std::future::Future<Output = Result<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn_slot = Arc::clone(&self.conn);
        async move {
            tokio::task::spawn_blocking(move || -> Result<T> {
                let guard = conn_slot.lock().unwrap();
                let conn = guard
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("SQLite not initialized"))?;
                f(conn)
            })
            .await
            .context("Tokio spawn_blocking failed")?
        }
    }
}

fn parse_datetime(value: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn chat_from_row(row: &Row<'_>) -> rusqlite::Result<ChatRecord> {
    Ok(ChatRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        visibility: Visibility::parse(&row.get::<_, String>(3)?),
        created_at: parse_datetime(row.get(4)?),
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let attachments: Vec<AttachmentRef> =
        serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default();
    Ok(MessageRecord {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        role: MessageRole::parse(&row.get::<_, String>(2)?).unwrap_or(MessageRole::User),
        content: row.get(3)?,
        reasoning: row.get(4)?,
        attachments,
        model: row.get(6)?,
        created_at: parse_datetime(row.get(7)?),
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<StreamSessionRecord> {
    Ok(StreamSessionRecord {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        user_id: row.get(2)?,
        status: SessionStatus::parse(&row.get::<_, String>(3)?).unwrap_or(SessionStatus::Error),
        streamed_content: row.get(4)?,
        streamed_reasoning: row.get(5)?,
        last_chunk_at: parse_datetime(row.get(6)?),
        message_id: row.get(7)?,
    })
}

const MESSAGE_COLUMNS: &str =
    "id, chat_id, role, content, reasoning, attachments, model, created_at";
const SESSION_COLUMNS: &str =
    "id, chat_id, user_id, status, streamed_content, streamed_reasoning, last_chunk_at, message_id";

#[async_trait]
impl ChatStore for SqliteStore {
    async fn create_chat(&self, chat: &ChatRecord) -> Result<()> {
        let chat = chat.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO chats (id, user_id, title, visibility, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    chat.id,
                    chat.user_id,
                    chat.title,
                    chat.visibility.as_str(),
                    chat.created_at.to_rfc3339()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_chat(&self, chat_id: &str) -> Result<Option<ChatRecord>> {
        let chat_id = chat_id.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, title, visibility, created_at FROM chats WHERE id = ?1",
            )?;
            let mut rows = stmt.query(params![chat_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(chat_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_chats(&self, user_id: &str) -> Result<Vec<ChatRecord>> {
        let user_id = user_id.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, title, visibility, created_at FROM chats
                 WHERE user_id = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![user_id], chat_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn delete_chat(&self, chat_id: &str) -> Result<bool> {
        let chat_id = chat_id.to_owned();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM messages WHERE chat_id = ?1", params![chat_id])?;
            conn.execute(
                "DELETE FROM stream_sessions WHERE chat_id = ?1",
                params![chat_id],
            )?;
            let deleted = conn.execute("DELETE FROM chats WHERE id = ?1", params![chat_id])?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn insert_message(&self, message: &MessageRecord) -> Result<()> {
        let message = message.clone();
        self.with_conn(move |conn| {
            let attachments = serde_json::to_string(&message.attachments)?;
            conn.execute(
                "INSERT INTO messages (id, chat_id, role, content, reasoning, attachments, model, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    message.id,
                    message.chat_id,
                    message.role.as_str(),
                    message.content,
                    message.reasoning,
                    attachments,
                    message.model,
                    message.created_at.to_rfc3339()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<MessageRecord>> {
        let message_id = message_id.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"
            ))?;
            let mut rows = stmt.query(params![message_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(message_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<MessageRecord>> {
        let chat_id = chat_id.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE chat_id = ?1 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let rows = stmt.query_map(params![chat_id], message_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn update_message_content(&self, message_id: &str, content: &str) -> Result<()> {
        let message_id = message_id.to_owned();
        let content = content.to_owned();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE messages SET content = ?2 WHERE id = ?1",
                params![message_id, content],
            )?;
            if updated == 0 {
                anyhow::bail!("message not found: {message_id}");
            }
            Ok(())
        })
        .await
    }

    async fn delete_messages_after(&self, chat_id: &str, after: DateTime<Utc>) -> Result<u64> {
        let chat_id = chat_id.to_owned();
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM messages WHERE chat_id = ?1 AND created_at > ?2",
                params![chat_id, after.to_rfc3339()],
            )?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn upsert_session(&self, session: &StreamSessionRecord) -> Result<()> {
        let session = session.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO stream_sessions
                 (id, chat_id, user_id, status, streamed_content, streamed_reasoning, last_chunk_at, message_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                   status = excluded.status,
                   streamed_content = excluded.streamed_content,
                   streamed_reasoning = excluded.streamed_reasoning,
                   last_chunk_at = excluded.last_chunk_at,
                   message_id = excluded.message_id",
                params![
                    session.id,
                    session.chat_id,
                    session.user_id,
                    session.status.as_str(),
                    session.streamed_content,
                    session.streamed_reasoning,
                    session.last_chunk_at.to_rfc3339(),
                    session.message_id
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<StreamSessionRecord>> {
        let session_id = session_id.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM stream_sessions WHERE id = ?1"
            ))?;
            let mut rows = stmt.query(params![session_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(session_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn finalize_session(&self, session_id: &str, message_id: &str) -> Result<()> {
        let session_id = session_id.to_owned();
        let message_id = message_id.to_owned();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE stream_sessions
                 SET status = 'completed', message_id = ?2, last_chunk_at = ?3
                 WHERE id = ?1",
                params![session_id, message_id, Utc::now().to_rfc3339()],
            )?;
            if updated == 0 {
                anyhow::bail!("session not found: {session_id}");
            }
            Ok(())
        })
        .await
    }

    async fn mark_session_error(
        &self,
        session_id: &str,
        content: &str,
        reasoning: &str,
    ) -> Result<()> {
        let session_id = session_id.to_owned();
        let content = content.to_owned();
        let reasoning = reasoning.to_owned();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE stream_sessions
                 SET status = 'error', streamed_content = ?2, streamed_reasoning = ?3,
                     last_chunk_at = ?4
                 WHERE id = ?1",
                params![session_id, content, reasoning, Utc::now().to_rfc3339()],
            )?;
            if updated == 0 {
                anyhow::bail!("session not found: {session_id}");
            }
            Ok(())
        })
        .await
    }

    async fn latest_session(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> Result<Option<StreamSessionRecord>> {
        let chat_id = chat_id.to_owned();
        let user_id = user_id.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM stream_sessions
                 WHERE chat_id = ?1 AND user_id = ?2
                 ORDER BY last_chunk_at DESC LIMIT 1"
            ))?;
            let mut rows = stmt.query(params![chat_id, user_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(session_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn supersede_streaming_sessions(&self, chat_id: &str, user_id: &str) -> Result<u64> {
        let chat_id = chat_id.to_owned();
        let user_id = user_id.to_owned();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE stream_sessions SET status = 'error'
                 WHERE chat_id = ?1 AND user_id = ?2 AND status = 'streaming'",
                params![chat_id, user_id],
            )?;
            Ok(updated as u64)
        })
        .await
    }
}
