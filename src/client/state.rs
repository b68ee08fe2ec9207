//! Client-side view of one chat.
//!
//! Holds the ordered message timeline a UI renders. Messages dedup by
//! id with last-write-wins; a refetch replaces the whole list. While a
//! relay stream is in flight the list carries optimistic placeholder
//! rows that the authoritative refetch later overwrites.

use chrono::Utc;
use uuid::Uuid;

use crate::database::{AttachmentRef, MessageRecord, MessageRole, StreamSessionRecord};
use crate::notify::ChangeEvent;

/// What a change-feed event did to the local view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The event was folded into the local view.
    Applied,
    /// The local view cannot represent the change; refetch the chat.
    RefetchNeeded,
}

/// Ids of the optimistic rows inserted for an in-flight turn.
#[derive(Debug, Clone)]
pub struct TurnHandles {
    pub user_message_id: String,
    pub assistant_message_id: String,
}

/// One chat's local state.
#[derive(Debug, Default)]
pub struct ChatState {
    chat_id: Option<String>,
    messages: Vec<MessageRecord>,
    session: Option<StreamSessionRecord>,
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_chat(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: Some(chat_id.into()),
            ..Self::default()
        }
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.chat_id.as_deref()
    }

    pub fn set_chat_id(&mut self, chat_id: impl Into<String>) {
        self.chat_id = Some(chat_id.into());
    }

    /// The timeline in render order.
    pub fn messages(&self) -> &[MessageRecord] {
        &self.messages
    }

    /// The last stream session observed on the change feed.
    pub fn session(&self) -> Option<&StreamSessionRecord> {
        self.session.as_ref()
    }

    /// Insert or replace a message by id, keeping timestamp order.
    ///
    /// Last write wins; ties on `created_at` keep their arrival order.
    pub fn upsert(&mut self, message: MessageRecord) {
        if let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) {
            *existing = message;
        } else {
            self.messages.push(message);
        }
        self.messages.sort_by_key(|m| m.created_at);
    }

    /// Replace the whole timeline with an authoritative fetch.
    pub fn replace_all(&mut self, mut messages: Vec<MessageRecord>) {
        messages.sort_by_key(|m| m.created_at);
        self.messages = messages;
    }

    /// Fold one change-feed event into the view.
    ///
    /// Events for other chats are ignored. Truncation and deletion
    /// carry no boundary on the wire, so they ask for a refetch.
    pub fn apply(&mut self, event: &ChangeEvent) -> ApplyOutcome {
        match self.chat_id.as_deref() {
            Some(chat_id) if chat_id == event.chat_id() => {}
            _ => return ApplyOutcome::Applied,
        }
        match event {
            ChangeEvent::MessageUpserted { message } => {
                self.upsert(message.clone());
                ApplyOutcome::Applied
            }
            ChangeEvent::SessionProgress { session } => {
                self.session = Some(session.clone());
                ApplyOutcome::Applied
            }
            ChangeEvent::MessagesTruncated { .. } | ChangeEvent::ChatDeleted { .. } => {
                ApplyOutcome::RefetchNeeded
            }
        }
    }

    /// Insert the optimistic rows for a turn: the user message as sent
    /// and an empty assistant reply the stream fills in.
    pub fn begin_turn(
        &mut self,
        content: &str,
        model: &str,
        attachments: Vec<AttachmentRef>,
    ) -> TurnHandles {
        let chat_id = self.chat_id.clone().unwrap_or_default();
        let now = Utc::now();
        let user_message = MessageRecord {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.clone(),
            role: MessageRole::User,
            content: content.to_string(),
            reasoning: None,
            attachments,
            model: model.to_string(),
            created_at: now,
        };
        let assistant_message = MessageRecord {
            id: Uuid::new_v4().to_string(),
            chat_id,
            role: MessageRole::Assistant,
            content: String::new(),
            reasoning: None,
            attachments: Vec::new(),
            model: model.to_string(),
            created_at: now,
        };
        let handles = TurnHandles {
            user_message_id: user_message.id.clone(),
            assistant_message_id: assistant_message.id.clone(),
        };
        self.upsert(user_message);
        self.upsert(assistant_message);
        handles
    }

    /// Append a streamed content delta to the placeholder reply.
    pub fn append_assistant_content(&mut self, message_id: &str, delta: &str) {
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == message_id) {
            message.content.push_str(delta);
        }
    }

    /// Replace the placeholder's reasoning with the full text so far.
    pub fn set_assistant_reasoning(&mut self, message_id: &str, reasoning: &str) {
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == message_id) {
            message.reasoning = Some(reasoning.to_string());
        }
    }

    /// Remove a single message by id, used to roll back an optimistic
    /// row the server never confirmed.
    pub fn remove_message(&mut self, message_id: &str) {
        self.messages.retain(|m| m.id != message_id);
    }

    /// Drop the optimistic rows after a failed send.
    pub fn clear_turn(&mut self, handles: &TurnHandles) {
        self.messages
            .retain(|m| m.id != handles.user_message_id && m.id != handles.assistant_message_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn message(id: &str, at_offset_secs: i64, content: &str) -> MessageRecord {
        MessageRecord {
            id: id.into(),
            chat_id: "c1".into(),
            role: MessageRole::User,
            content: content.into(),
            reasoning: None,
            attachments: Vec::new(),
            model: "m".into(),
            created_at: Utc::now() + Duration::seconds(at_offset_secs),
        }
    }

    #[test]
    fn upsert_dedups_by_id_last_write_wins() {
        let mut state = ChatState::for_chat("c1");
        state.upsert(message("a", 0, "first"));
        state.upsert(message("b", 1, "second"));
        state.upsert(message("a", 0, "rewritten"));

        assert_eq!(state.messages().len(), 2);
        assert_eq!(state.messages()[0].content, "rewritten");
        assert_eq!(state.messages()[1].id, "b");
    }

    #[test]
    fn upsert_keeps_timestamp_order() {
        let mut state = ChatState::for_chat("c1");
        state.upsert(message("late", 10, "late"));
        state.upsert(message("early", 1, "early"));

        let ids: Vec<&str> = state.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[test]
    fn replace_all_is_authoritative() {
        let mut state = ChatState::for_chat("c1");
        state.upsert(message("stale", 0, "stale"));
        state.replace_all(vec![message("b", 2, "b"), message("a", 1, "a")]);

        let ids: Vec<&str> = state.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn apply_routes_by_chat_and_flags_truncation() {
        let mut state = ChatState::for_chat("c1");

        let other_chat = ChangeEvent::MessageUpserted {
            message: MessageRecord {
                chat_id: "c2".into(),
                ..message("x", 0, "elsewhere")
            },
        };
        assert_eq!(state.apply(&other_chat), ApplyOutcome::Applied);
        assert!(state.messages().is_empty());

        let upsert = ChangeEvent::MessageUpserted {
            message: message("m1", 0, "hello"),
        };
        assert_eq!(state.apply(&upsert), ApplyOutcome::Applied);
        assert_eq!(state.messages().len(), 1);

        let truncated = ChangeEvent::MessagesTruncated {
            chat_id: "c1".into(),
        };
        assert_eq!(state.apply(&truncated), ApplyOutcome::RefetchNeeded);
    }

    #[test]
    fn optimistic_turn_lifecycle() {
        let mut state = ChatState::for_chat("c1");
        let handles = state.begin_turn("question", "m", Vec::new());
        assert_eq!(state.messages().len(), 2);
        assert_eq!(state.messages()[0].role, MessageRole::User);
        assert_eq!(state.messages()[1].content, "");

        state.append_assistant_content(&handles.assistant_message_id, "Hel");
        state.append_assistant_content(&handles.assistant_message_id, "lo");
        state.set_assistant_reasoning(&handles.assistant_message_id, "think");
        state.set_assistant_reasoning(&handles.assistant_message_id, "thinking");

        let reply = &state.messages()[1];
        assert_eq!(reply.content, "Hello");
        assert_eq!(reply.reasoning.as_deref(), Some("thinking"));

        state.clear_turn(&handles);
        assert!(state.messages().is_empty());
    }

    #[test]
    fn error_rollback_keeps_the_user_message() {
        let mut state = ChatState::for_chat("c1");
        let handles = state.begin_turn("question", "m", Vec::new());
        state.append_assistant_content(&handles.assistant_message_id, "partial");

        state.remove_message(&handles.assistant_message_id);

        assert_eq!(state.messages().len(), 1);
        assert_eq!(state.messages()[0].id, handles.user_message_id);
        assert_eq!(state.messages()[0].content, "question");
    }
}
