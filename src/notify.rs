//! In-process change notifications.
//!
//! Writes to the store are announced on a broadcast bus so connected
//! clients can be pushed fresh state over `/api/v1/chats/{id}/updates`.
//! The bus is best-effort: no subscribers and lagging subscribers are
//! both fine, and pollers always have the store itself as fallback.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::database::{MessageRecord, StreamSessionRecord};

/// Broadcast channel capacity.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// A change some client may care about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// A message was inserted or rewritten.
    MessageUpserted { message: MessageRecord },
    /// Messages at and after a point in a chat were removed.
    MessagesTruncated { chat_id: String },
    /// A whole chat went away.
    ChatDeleted { chat_id: String },
    /// A stream session advanced (snapshot, completion or error).
    SessionProgress { session: StreamSessionRecord },
}

impl ChangeEvent {
    /// Chat the change belongs to.
    pub fn chat_id(&self) -> &str {
        match self {
            Self::MessageUpserted { message } => &message.chat_id,
            Self::MessagesTruncated { chat_id } | Self::ChatDeleted { chat_id } => chat_id,
            Self::SessionProgress { session } => &session.chat_id,
        }
    }

    /// Event name used on the update stream.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MessageUpserted { .. } => "message_upserted",
            Self::MessagesTruncated { .. } => "messages_truncated",
            Self::ChatDeleted { .. } => "chat_deleted",
            Self::SessionProgress { .. } => "session_progress",
        }
    }
}

/// Handle on the change bus. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<ChangeEvent>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish a change. Dropped silently when nobody listens.
    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}
