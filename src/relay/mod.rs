//! Core relay: drives one upstream generation into a chat.
//!
//! A relay call validates the request, lazily creates the chat, persists
//! the user's message, then hands off to a detached [`stream::StreamJob`]
//! that consumes the upstream stream, re-emits wire events, snapshots
//! progress, and finalizes the reply. The hand-off is deliberate: the
//! job's lifetime is tied to the upstream stream, not to the HTTP
//! response, so a client disconnect never loses the reply.

mod stream;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::database::{
    AttachmentRef, ChatRecord, MessageRecord, MessageRole, SessionStatus, SharedStore,
    StreamSessionRecord, Visibility,
};
use crate::error::ApiError;
use crate::llm::SharedDriver;
use crate::models::{with_web_search, ModelCatalog};
use crate::notify::{ChangeEvent, Notifier};
use crate::storage::SharedObjects;
use crate::wire::RelayEvent;

use stream::StreamJob;

/// Longest chat title derived from the first message.
const TITLE_MAX_CHARS: usize = 80;

/// Wire events buffered between the producer and the response body.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// System preamble sent ahead of every conversation.
const SYSTEM_PREAMBLE: &str = "You are a helpful assistant. Format every answer in Markdown. \
    Think through the problem first when that helps, but keep the thinking strictly separate \
    from the answer and never repeat it there.";

/// An incoming relay call, already decoded but not yet validated.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    /// Target chat, or `None` to create one.
    pub chat_id: Option<String>,
    /// Calling user.
    pub user_id: String,
    /// The new user message.
    pub user_message_content: String,
    /// Requested model; unknown or missing models fall back to the
    /// default.
    pub model: Option<String>,
    /// Whether to route the request through upstream web search.
    pub web_search_enabled: bool,
    /// Attachments already uploaded to the object store.
    pub attached_files: Vec<AttachmentRef>,
}

/// An edit-and-regenerate call.
#[derive(Debug, Clone)]
pub struct EditRequest {
    /// The user message being rewritten.
    pub message_id: String,
    /// Replacement content.
    pub new_content: String,
    /// Optional model override for the regeneration.
    pub model_override: Option<String>,
}

/// The relay engine. One instance serves the whole process.
pub struct Relay {
    store: SharedStore,
    objects: SharedObjects,
    notifier: Notifier,
    catalog: Arc<ModelCatalog>,
    driver: Option<SharedDriver>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("catalog", &self.catalog)
            .field("driver_configured", &self.driver.is_some())
            .finish()
    }
}

impl Relay {
    pub fn new(
        store: SharedStore,
        objects: SharedObjects,
        notifier: Notifier,
        catalog: Arc<ModelCatalog>,
        driver: Option<SharedDriver>,
    ) -> Self {
        Self {
            store,
            objects,
            notifier,
            catalog,
            driver,
        }
    }

    fn driver(&self) -> Result<SharedDriver, ApiError> {
        self.driver
            .clone()
            .ok_or_else(|| ApiError::Config("OPENROUTER_API_KEY is not set".to_string()))
    }

    /// Start a relay stream for a new user message.
    ///
    /// Returns the receiver the HTTP response drains. By the time this
    /// returns, the chat exists, the user message is persisted, and a
    /// streaming session row is in place.
    pub async fn start(
        &self,
        request: RelayRequest,
    ) -> Result<mpsc::Receiver<RelayEvent>, ApiError> {
        validate_request(&request)?;
        let driver = self.driver()?;

        let model = self
            .catalog
            .resolve(request.model.as_deref().unwrap_or_default());
        let upstream_model = with_web_search(&model, request.web_search_enabled);

        let (chat, created) = match &request.chat_id {
            Some(id) => {
                let chat = self
                    .store
                    .get_chat(id)
                    .await
                    .map_err(ApiError::Internal)?
                    .ok_or_else(|| ApiError::NotFound(format!("chat not found: {id}")))?;
                if chat.user_id != request.user_id {
                    return Err(ApiError::forbidden("chat belongs to another user"));
                }
                (chat, false)
            }
            None => {
                let chat = ChatRecord {
                    id: Uuid::new_v4().to_string(),
                    user_id: request.user_id.clone(),
                    title: derive_title(&request.user_message_content),
                    visibility: Visibility::Private,
                    created_at: Utc::now(),
                };
                self.store
                    .create_chat(&chat)
                    .await
                    .map_err(ApiError::Internal)?;
                (chat, true)
            }
        };

        // Prior turns first; the new message is appended after them.
        let history = self
            .store
            .list_messages(&chat.id)
            .await
            .map_err(ApiError::Internal)?;

        let user_message = MessageRecord {
            id: Uuid::new_v4().to_string(),
            chat_id: chat.id.clone(),
            role: MessageRole::User,
            content: request.user_message_content.clone(),
            reasoning: None,
            attachments: request.attached_files.clone(),
            model: model.clone(),
            created_at: Utc::now(),
        };
        self.store
            .insert_message(&user_message)
            .await
            .map_err(ApiError::Internal)?;
        self.notifier.publish(ChangeEvent::MessageUpserted {
            message: user_message.clone(),
        });

        let mut conversation = history;
        conversation.push(user_message);

        Ok(self
            .spawn_stream(
                driver,
                chat.id,
                request.user_id,
                created,
                model,
                upstream_model,
                conversation,
            )
            .await)
    }

    /// Rewrite a user message in place, drop everything after it, and
    /// stream a fresh reply against the truncated history.
    pub async fn regenerate(
        &self,
        user: &AuthenticatedUser,
        request: EditRequest,
    ) -> Result<mpsc::Receiver<RelayEvent>, ApiError> {
        if !user.has_user_role() {
            return Err(ApiError::forbidden("only the user role may edit messages"));
        }
        if request.new_content.trim().is_empty() {
            return Err(ApiError::validation("newContent must not be empty"));
        }
        let driver = self.driver()?;

        let message = self
            .store
            .get_message(&request.message_id)
            .await
            .map_err(ApiError::Internal)?
            .ok_or_else(|| {
                ApiError::NotFound(format!("message not found: {}", request.message_id))
            })?;
        if message.role != MessageRole::User {
            return Err(ApiError::forbidden("only user messages can be edited"));
        }

        let chat = self
            .store
            .get_chat(&message.chat_id)
            .await
            .map_err(ApiError::Internal)?
            .ok_or_else(|| ApiError::NotFound(format!("chat not found: {}", message.chat_id)))?;
        if chat.user_id != user.user_id {
            return Err(ApiError::forbidden("chat belongs to another user"));
        }

        let model = self
            .catalog
            .resolve(request.model_override.as_deref().unwrap_or(&message.model));

        // In-place rewrite keeps the id and timestamp, so ordering and
        // the truncation boundary both stay stable.
        self.store
            .update_message_content(&message.id, &request.new_content)
            .await
            .map_err(ApiError::Internal)?;
        let removed = self
            .store
            .delete_messages_after(&chat.id, message.created_at)
            .await
            .map_err(ApiError::Internal)?;
        tracing::debug!(chat_id = %chat.id, removed, "truncated chat for regeneration");

        let mut edited = message;
        edited.content = request.new_content.clone();
        self.notifier
            .publish(ChangeEvent::MessageUpserted { message: edited });
        self.notifier.publish(ChangeEvent::MessagesTruncated {
            chat_id: chat.id.clone(),
        });

        let conversation = self
            .store
            .list_messages(&chat.id)
            .await
            .map_err(ApiError::Internal)?;

        let upstream_model = model.clone();
        Ok(self
            .spawn_stream(
                driver,
                chat.id,
                user.user_id.clone(),
                false,
                model,
                upstream_model,
                conversation,
            )
            .await)
    }

    async fn spawn_stream(
        &self,
        driver: SharedDriver,
        chat_id: String,
        user_id: String,
        announce_chat_id: bool,
        model: String,
        upstream_model: String,
        conversation: Vec<MessageRecord>,
    ) -> mpsc::Receiver<RelayEvent> {
        // At most one live stream per chat+user; older ones lose.
        match self
            .store
            .supersede_streaming_sessions(&chat_id, &user_id)
            .await
        {
            Ok(0) => {}
            Ok(superseded) => {
                tracing::debug!(chat_id = %chat_id, superseded, "superseded stale stream sessions");
            }
            Err(err) => {
                tracing::warn!(error = ?err, chat_id = %chat_id, "failed to supersede stream sessions");
            }
        }

        let session = StreamSessionRecord {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.clone(),
            user_id,
            status: SessionStatus::Streaming,
            streamed_content: String::new(),
            streamed_reasoning: String::new(),
            last_chunk_at: Utc::now(),
            message_id: None,
        };
        if let Err(err) = self.store.upsert_session(&session).await {
            tracing::warn!(error = ?err, session_id = %session.id, "failed to persist stream session");
        }
        self.notifier.publish(ChangeEvent::SessionProgress {
            session: session.clone(),
        });

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let job = StreamJob::new(
            self.store.clone(),
            self.objects.clone(),
            self.notifier.clone(),
            driver,
            session,
            chat_id,
            announce_chat_id,
            model,
            upstream_model,
            conversation,
            tx,
        );
        tokio::spawn(job.run());
        rx
    }
}

fn validate_request(request: &RelayRequest) -> Result<(), ApiError> {
    if request.user_message_content.trim().is_empty() {
        return Err(ApiError::validation("userMessageContent must not be empty"));
    }
    if request.user_id.trim().is_empty() {
        return Err(ApiError::validation("userId must not be empty"));
    }
    for attachment in &request.attached_files {
        if !attachment.is_allowed() {
            return Err(ApiError::validation(format!(
                "unsupported attachment type: {}",
                attachment.content_type
            )));
        }
    }
    Ok(())
}

/// Title for a lazily created chat: the first message, clipped.
fn derive_title(content: &str) -> String {
    let trimmed = content.trim();
    trimmed.chars().take(TITLE_MAX_CHARS).collect()
}
