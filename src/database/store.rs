//! Row types and the storage trait.
//!
//! Chats and messages are the authoritative conversation history; stream
//! sessions record in-flight relay progress so an interrupted stream
//! leaves recoverable state. All backends implement [`ChatStore`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Shared handle to whichever backend the deployment uses.
pub type SharedStore = Arc<dyn ChatStore>;

/// Chat visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Visible to anyone with the link.
    Public,
    /// Owner only.
    #[default]
    Private,
}

impl Visibility {
    /// Stable string form for storage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }

    /// Parse the stored string form, defaulting to private.
    pub fn parse(value: &str) -> Self {
        match value {
            "public" => Self::Public,
            _ => Self::Private,
        }
    }
}

/// Role of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Authored by the end user.
    User,
    /// Produced by a model through the relay.
    Assistant,
}

impl MessageRole {
    /// Stable string form for storage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Parse the stored string form.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// Lifecycle status of a stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Relay is consuming upstream output.
    Streaming,
    /// Finalized with a persisted message.
    Completed,
    /// Terminated by an error (or superseded by a newer stream).
    Error,
}

impl SessionStatus {
    /// Stable string form for storage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Parse the stored string form.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "streaming" => Some(Self::Streaming),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Attachment reference carried on a message. Bytes live in the object
/// store; rows only hold the URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Original filename.
    pub name: String,
    /// MIME type.
    #[serde(rename = "type")]
    pub content_type: String,
    /// Publicly resolvable location.
    pub url: String,
}

/// MIME types the relay accepts as attachments.
pub const ALLOWED_ATTACHMENT_TYPES: [&str; 4] =
    ["image/png", "image/jpeg", "image/webp", "application/pdf"];

impl AttachmentRef {
    /// Whether the MIME type is accepted at all.
    pub fn is_allowed(&self) -> bool {
        ALLOWED_ATTACHMENT_TYPES.contains(&self.content_type.as_str())
    }

    /// Whether this is an image attachment.
    pub fn is_image(&self) -> bool {
        matches!(
            self.content_type.as_str(),
            "image/png" | "image/jpeg" | "image/webp"
        )
    }

    /// Whether this is a PDF document.
    pub fn is_pdf(&self) -> bool {
        self.content_type == "application/pdf"
    }
}

/// Chat row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    /// Unique chat identifier.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Display title.
    pub title: String,
    /// Visibility setting.
    pub visibility: Visibility,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Message row. Immutable once persisted, except that the edit flow may
/// replace the content of a user message in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Unique message identifier.
    pub id: String,
    /// Chat this message belongs to.
    pub chat_id: String,
    /// Author role.
    pub role: MessageRole,
    /// Message text.
    pub content: String,
    /// Reasoning text, assistant messages only.
    pub reasoning: Option<String>,
    /// Ordered attachment references.
    pub attachments: Vec<AttachmentRef>,
    /// Model that produced or received the message.
    pub model: String,
    /// Creation timestamp; messages in a chat are ordered by it.
    pub created_at: DateTime<Utc>,
}

/// Stream session row: durable snapshot of in-flight relay progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSessionRecord {
    /// Unique session identifier, fresh per relay call.
    pub id: String,
    /// Chat being streamed into.
    pub chat_id: String,
    /// User the stream belongs to.
    pub user_id: String,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Content accumulated as of the last snapshot.
    pub streamed_content: String,
    /// Reasoning accumulated as of the last snapshot.
    pub streamed_reasoning: String,
    /// Time of the last snapshot write.
    pub last_chunk_at: DateTime<Utc>,
    /// Finalized message id, set on completion.
    pub message_id: Option<String>,
}

/// Storage operations shared by all backends.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Insert a chat row.
    async fn create_chat(&self, chat: &ChatRecord) -> anyhow::Result<()>;

    /// Fetch a chat by id.
    async fn get_chat(&self, chat_id: &str) -> anyhow::Result<Option<ChatRecord>>;

    /// List a user's chats, newest first.
    async fn list_chats(&self, user_id: &str) -> anyhow::Result<Vec<ChatRecord>>;

    /// Delete a chat with its messages and sessions. Returns whether the
    /// chat existed.
    async fn delete_chat(&self, chat_id: &str) -> anyhow::Result<bool>;

    /// Insert a message row.
    async fn insert_message(&self, message: &MessageRecord) -> anyhow::Result<()>;

    /// Fetch a message by id.
    async fn get_message(&self, message_id: &str) -> anyhow::Result<Option<MessageRecord>>;

    /// List a chat's messages in timeline order.
    async fn list_messages(&self, chat_id: &str) -> anyhow::Result<Vec<MessageRecord>>;

    /// Replace the content of a message (edit flow, user messages only).
    async fn update_message_content(&self, message_id: &str, content: &str) -> anyhow::Result<()>;

    /// Delete every message in the chat created strictly after the given
    /// instant. Returns the number of rows removed.
    async fn delete_messages_after(
        &self,
        chat_id: &str,
        after: DateTime<Utc>,
    ) -> anyhow::Result<u64>;

    /// Idempotent snapshot write keyed by session id.
    async fn upsert_session(&self, session: &StreamSessionRecord) -> anyhow::Result<()>;

    /// Fetch a session by id.
    async fn get_session(&self, session_id: &str) -> anyhow::Result<Option<StreamSessionRecord>>;

    /// Terminal transition to completed, linking the persisted message.
    async fn finalize_session(&self, session_id: &str, message_id: &str) -> anyhow::Result<()>;

    /// Terminal transition to error, keeping accumulated partials.
    async fn mark_session_error(
        &self,
        session_id: &str,
        content: &str,
        reasoning: &str,
    ) -> anyhow::Result<()>;

    /// The most recent session for a chat+user pair, regardless of
    /// status. Pollers use this to observe progress and completion.
    async fn latest_session(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<StreamSessionRecord>>;

    /// Mark all streaming sessions for a chat+user pair as error. Used to
    /// keep at most one active session per pair. Returns the number of
    /// sessions superseded.
    async fn supersede_streaming_sessions(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> anyhow::Result<u64>;
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    chats: Arc<RwLock<HashMap<String, ChatRecord>>>,
    messages: Arc<RwLock<Vec<MessageRecord>>>,
    sessions: Arc<RwLock<HashMap<String, StreamSessionRecord>>>,
}

impl MemoryStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_chat(&self, chat: &ChatRecord) -> anyhow::Result<()> {
        self.chats.write().insert(chat.id.clone(), chat.clone());
        Ok(())
    }

    async fn get_chat(&self, chat_id: &str) -> anyhow::Result<Option<ChatRecord>> {
        Ok(self.chats.read().get(chat_id).cloned())
    }

    async fn list_chats(&self, user_id: &str) -> anyhow::Result<Vec<ChatRecord>> {
        let mut chats: Vec<ChatRecord> = self
            .chats
            .read()
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        chats.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(chats)
    }

    async fn delete_chat(&self, chat_id: &str) -> anyhow::Result<bool> {
        let existed = self.chats.write().remove(chat_id).is_some();
        self.messages.write().retain(|m| m.chat_id != chat_id);
        self.sessions.write().retain(|_, s| s.chat_id != chat_id);
        Ok(existed)
    }

    async fn insert_message(&self, message: &MessageRecord) -> anyhow::Result<()> {
        self.messages.write().push(message.clone());
        Ok(())
    }

    async fn get_message(&self, message_id: &str) -> anyhow::Result<Option<MessageRecord>> {
        Ok(self
            .messages
            .read()
            .iter()
            .find(|m| m.id == message_id)
            .cloned())
    }

    async fn list_messages(&self, chat_id: &str) -> anyhow::Result<Vec<MessageRecord>> {
        let mut messages: Vec<MessageRecord> = self
            .messages
            .read()
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps.
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn update_message_content(&self, message_id: &str, content: &str) -> anyhow::Result<()> {
        let mut messages = self.messages.write();
        let message = messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| anyhow::anyhow!("message not found: {message_id}"))?;
        message.content = content.to_owned();
        Ok(())
    }

    async fn delete_messages_after(
        &self,
        chat_id: &str,
        after: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let mut messages = self.messages.write();
        let before = messages.len();
        messages.retain(|m| m.chat_id != chat_id || m.created_at <= after);
        Ok((before - messages.len()) as u64)
    }

    async fn upsert_session(&self, session: &StreamSessionRecord) -> anyhow::Result<()> {
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> anyhow::Result<Option<StreamSessionRecord>> {
        Ok(self.sessions.read().get(session_id).cloned())
    }

    async fn finalize_session(&self, session_id: &str, message_id: &str) -> anyhow::Result<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow::anyhow!("session not found: {session_id}"))?;
        session.status = SessionStatus::Completed;
        session.message_id = Some(message_id.to_owned());
        session.last_chunk_at = Utc::now();
        Ok(())
    }

    async fn mark_session_error(
        &self,
        session_id: &str,
        content: &str,
        reasoning: &str,
    ) -> anyhow::Result<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow::anyhow!("session not found: {session_id}"))?;
        session.status = SessionStatus::Error;
        session.streamed_content = content.to_owned();
        session.streamed_reasoning = reasoning.to_owned();
        session.last_chunk_at = Utc::now();
        Ok(())
    }

    async fn latest_session(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<StreamSessionRecord>> {
        Ok(self
            .sessions
            .read()
            .values()
            .filter(|s| s.chat_id == chat_id && s.user_id == user_id)
            .max_by_key(|s| s.last_chunk_at)
            .cloned())
    }

    async fn supersede_streaming_sessions(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> anyhow::Result<u64> {
        let mut superseded = 0;
        for session in self.sessions.write().values_mut() {
            if session.chat_id == chat_id
                && session.user_id == user_id
                && session.status == SessionStatus::Streaming
            {
                session.status = SessionStatus::Error;
                superseded += 1;
            }
        }
        Ok(superseded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn chat(id: &str, user: &str) -> ChatRecord {
        ChatRecord {
            id: id.into(),
            user_id: user.into(),
            title: "test chat".into(),
            visibility: Visibility::Private,
            created_at: Utc::now(),
        }
    }

    fn message(id: &str, chat_id: &str, at: DateTime<Utc>) -> MessageRecord {
        MessageRecord {
            id: id.into(),
            chat_id: chat_id.into(),
            role: MessageRole::User,
            content: format!("content of {id}"),
            reasoning: None,
            attachments: Vec::new(),
            model: "openai/gpt-4o-mini".into(),
            created_at: at,
        }
    }

    #[test]
    fn attachment_type_helpers_partition_the_allow_list() {
        for mime in ALLOWED_ATTACHMENT_TYPES {
            let attachment = AttachmentRef {
                name: "f".into(),
                content_type: mime.into(),
                url: "https://files.example/f".into(),
            };
            assert!(attachment.is_allowed());
            // Every admitted type is exactly one of image or PDF.
            assert_ne!(attachment.is_image(), attachment.is_pdf());
        }
        let zip = AttachmentRef {
            name: "a.zip".into(),
            content_type: "application/zip".into(),
            url: "https://files.example/a.zip".into(),
        };
        assert!(!zip.is_allowed());
        assert!(!zip.is_image());
        assert!(!zip.is_pdf());
    }

    #[tokio::test]
    async fn messages_listed_in_timeline_order() {
        let store = MemoryStore::new();
        let base = Utc::now();
        store
            .insert_message(&message("m2", "c1", base + Duration::seconds(1)))
            .await
            .unwrap();
        store.insert_message(&message("m1", "c1", base)).await.unwrap();
        store
            .insert_message(&message("m3", "c2", base))
            .await
            .unwrap();

        let listed = store.list_messages("c1").await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2"]);
    }

    #[tokio::test]
    async fn delete_messages_after_is_strict() {
        let store = MemoryStore::new();
        let base = Utc::now();
        store.insert_message(&message("m1", "c1", base)).await.unwrap();
        store
            .insert_message(&message("m2", "c1", base + Duration::seconds(1)))
            .await
            .unwrap();
        store
            .insert_message(&message("m3", "c1", base + Duration::seconds(2)))
            .await
            .unwrap();
        store
            .insert_message(&message("other", "c2", base + Duration::seconds(2)))
            .await
            .unwrap();

        let removed = store.delete_messages_after("c1", base).await.unwrap();
        assert_eq!(removed, 2);
        let ids: Vec<String> = store
            .list_messages("c1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, ["m1"]);
        // Other chats untouched.
        assert_eq!(store.list_messages("c2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn supersede_marks_only_streaming_sessions() {
        let store = MemoryStore::new();
        let session = StreamSessionRecord {
            id: "s1".into(),
            chat_id: "c1".into(),
            user_id: "u1".into(),
            status: SessionStatus::Streaming,
            streamed_content: String::new(),
            streamed_reasoning: String::new(),
            last_chunk_at: Utc::now(),
            message_id: None,
        };
        store.upsert_session(&session).await.unwrap();
        let mut completed = session.clone();
        completed.id = "s2".into();
        completed.status = SessionStatus::Completed;
        store.upsert_session(&completed).await.unwrap();

        assert_eq!(store.supersede_streaming_sessions("c1", "u1").await.unwrap(), 1);
        assert_eq!(
            store.get_session("s1").await.unwrap().unwrap().status,
            SessionStatus::Error
        );
        assert_eq!(
            store.get_session("s2").await.unwrap().unwrap().status,
            SessionStatus::Completed
        );
        let latest = store.latest_session("c1", "u1").await.unwrap().unwrap();
        assert_ne!(latest.status, SessionStatus::Streaming);
    }

    #[tokio::test]
    async fn finalize_links_message() {
        let store = MemoryStore::new();
        let session = StreamSessionRecord {
            id: "s1".into(),
            chat_id: "c1".into(),
            user_id: "u1".into(),
            status: SessionStatus::Streaming,
            streamed_content: "partial".into(),
            streamed_reasoning: String::new(),
            last_chunk_at: Utc::now(),
            message_id: None,
        };
        store.upsert_session(&session).await.unwrap();
        store.finalize_session("s1", "m9").await.unwrap();
        let session = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.message_id.as_deref(), Some("m9"));
    }

    #[tokio::test]
    async fn delete_chat_cascades() {
        let store = MemoryStore::new();
        store.create_chat(&chat("c1", "u1")).await.unwrap();
        store
            .insert_message(&message("m1", "c1", Utc::now()))
            .await
            .unwrap();
        assert!(store.delete_chat("c1").await.unwrap());
        assert!(store.get_chat("c1").await.unwrap().is_none());
        assert!(store.list_messages("c1").await.unwrap().is_empty());
        assert!(!store.delete_chat("c1").await.unwrap());
    }
}
