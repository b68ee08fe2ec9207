//! The detached producer behind every relay stream.
//!
//! A [`StreamJob`] owns the upstream stream and the accumulators for one
//! generation. It keeps running when the HTTP client goes away: wire
//! sends become no-ops, but consumption, snapshots, and the final
//! message row all still happen.

use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time;
use uuid::Uuid;

use crate::database::{MessageRecord, MessageRole, SessionStatus, SharedStore, StreamSessionRecord};
use crate::llm::{ContentPart, Message, SharedDriver, UpstreamEvent};
use crate::notify::{ChangeEvent, Notifier};
use crate::storage::SharedObjects;
use crate::wire::RelayEvent;

/// Cadence for persisting in-flight accumulators.
const SNAPSHOT_INTERVAL: Duration = Duration::from_millis(1500);

/// Accumulated characters that force a snapshot between ticks.
const SNAPSHOT_CHAR_THRESHOLD: usize = 800;

/// Finalize is the one persistence step that must not be dropped.
const FINALIZE_ATTEMPTS: u32 = 3;
const FINALIZE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// One in-flight generation, detached from the HTTP response.
pub(super) struct StreamJob {
    store: SharedStore,
    objects: SharedObjects,
    notifier: Notifier,
    driver: SharedDriver,
    session: StreamSessionRecord,
    chat_id: String,
    announce_chat_id: bool,
    model: String,
    upstream_model: String,
    conversation: Vec<MessageRecord>,
    tx: mpsc::Sender<RelayEvent>,
    client_gone: bool,
    content: String,
    reasoning: String,
    unsnapshotted: usize,
}

impl StreamJob {
    #[allow(clippy::too_many_arguments, reason = "constructed once, at the spawn site")]
    pub(super) fn new(
        store: SharedStore,
        objects: SharedObjects,
        notifier: Notifier,
        driver: SharedDriver,
        session: StreamSessionRecord,
        chat_id: String,
        announce_chat_id: bool,
        model: String,
        upstream_model: String,
        conversation: Vec<MessageRecord>,
        tx: mpsc::Sender<RelayEvent>,
    ) -> Self {
        Self {
            store,
            objects,
            notifier,
            driver,
            session,
            chat_id,
            announce_chat_id,
            model,
            upstream_model,
            conversation,
            tx,
            client_gone: false,
            content: String::new(),
            reasoning: String::new(),
            unsnapshotted: 0,
        }
    }

    pub(super) async fn run(mut self) {
        if self.announce_chat_id {
            self.send(RelayEvent::chat_id(self.chat_id.clone())).await;
        }

        let upstream = match build_upstream_messages(&self.objects, &self.conversation).await {
            Ok(messages) => messages,
            Err(err) => {
                self.fail(format!("failed to prepare attachments: {err:#}"))
                    .await;
                return;
            }
        };

        let mut stream = match self
            .driver
            .stream_chat(&self.upstream_model, &upstream)
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                self.fail(format!("upstream request failed: {err:#}")).await;
                return;
            }
        };

        let mut snapshots = time::interval(SNAPSHOT_INTERVAL);
        // The first tick completes immediately.
        snapshots.tick().await;

        loop {
            tokio::select! {
                event = stream.next() => match event {
                    Some(Ok(UpstreamEvent::Reasoning { delta })) => {
                        self.reasoning.push_str(&delta);
                        self.unsnapshotted += delta.len();
                        // Reasoning goes out whole each time; clients replace it.
                        let full = self.reasoning.clone();
                        self.send(RelayEvent::reasoning(full)).await;
                        self.maybe_snapshot().await;
                    }
                    Some(Ok(UpstreamEvent::Content { delta })) => {
                        self.content.push_str(&delta);
                        self.unsnapshotted += delta.len();
                        self.send(RelayEvent::content(delta)).await;
                        self.maybe_snapshot().await;
                    }
                    Some(Ok(UpstreamEvent::Done)) | None => break,
                    Some(Err(err)) => {
                        self.fail(format!("upstream stream failed: {err:#}")).await;
                        return;
                    }
                },
                _ = snapshots.tick() => {
                    if self.unsnapshotted > 0 {
                        self.snapshot().await;
                    }
                }
            }
        }

        self.complete().await;
    }

    /// The stream ended normally: persist the reply, finalize the
    /// session, then emit `done`. Persisting first means a client that
    /// refetches on `done` always finds the row it was told about.
    async fn complete(&mut self) {
        let assistant = MessageRecord {
            id: Uuid::new_v4().to_string(),
            chat_id: self.chat_id.clone(),
            role: MessageRole::Assistant,
            content: self.content.clone(),
            reasoning: if self.reasoning.is_empty() {
                None
            } else {
                Some(self.reasoning.clone())
            },
            attachments: Vec::new(),
            model: self.model.clone(),
            created_at: Utc::now(),
        };
        if let Err(err) = self.store.insert_message(&assistant).await {
            self.fail(format!("failed to persist the reply: {err:#}"))
                .await;
            return;
        }
        self.notifier.publish(ChangeEvent::MessageUpserted {
            message: assistant.clone(),
        });

        self.finalize(&assistant.id).await;

        self.send(RelayEvent::done(
            self.content.clone(),
            self.reasoning.clone(),
            self.chat_id.clone(),
        ))
        .await;
    }

    async fn finalize(&mut self, message_id: &str) {
        for attempt in 1..=FINALIZE_ATTEMPTS {
            match self.store.finalize_session(&self.session.id, message_id).await {
                Ok(()) => {
                    self.session.status = SessionStatus::Completed;
                    self.session.message_id = Some(message_id.to_string());
                    self.session.streamed_content = self.content.clone();
                    self.session.streamed_reasoning = self.reasoning.clone();
                    self.session.last_chunk_at = Utc::now();
                    self.notifier.publish(ChangeEvent::SessionProgress {
                        session: self.session.clone(),
                    });
                    return;
                }
                Err(err) if attempt < FINALIZE_ATTEMPTS => {
                    tracing::warn!(
                        error = ?err,
                        session_id = %self.session.id,
                        attempt,
                        "finalize failed, retrying"
                    );
                    time::sleep(FINALIZE_RETRY_DELAY).await;
                }
                Err(err) => {
                    tracing::error!(
                        error = ?err,
                        session_id = %self.session.id,
                        message_id,
                        "failed to finalize stream session"
                    );
                }
            }
        }
    }

    /// The stream broke: tell the client and record the partials.
    async fn fail(&mut self, message: String) {
        tracing::error!(chat_id = %self.chat_id, error = %message, "relay stream failed");
        self.send(RelayEvent::error(message)).await;
        self.mark_error().await;
    }

    async fn mark_error(&mut self) {
        if let Err(err) = self
            .store
            .mark_session_error(&self.session.id, &self.content, &self.reasoning)
            .await
        {
            tracing::error!(
                error = ?err,
                session_id = %self.session.id,
                "failed to mark stream session errored"
            );
        }
        self.session.status = SessionStatus::Error;
        self.session.streamed_content = self.content.clone();
        self.session.streamed_reasoning = self.reasoning.clone();
        self.session.last_chunk_at = Utc::now();
        self.notifier.publish(ChangeEvent::SessionProgress {
            session: self.session.clone(),
        });
    }

    async fn maybe_snapshot(&mut self) {
        if self.unsnapshotted >= SNAPSHOT_CHAR_THRESHOLD {
            self.snapshot().await;
        }
    }

    /// Persist the accumulators. Losing a snapshot only widens the
    /// window a poller can lag behind, so failures are logged and
    /// swallowed.
    async fn snapshot(&mut self) {
        self.session.streamed_content = self.content.clone();
        self.session.streamed_reasoning = self.reasoning.clone();
        self.session.last_chunk_at = Utc::now();
        if let Err(err) = self.store.upsert_session(&self.session).await {
            tracing::warn!(
                error = ?err,
                session_id = %self.session.id,
                "failed to persist stream snapshot"
            );
        }
        self.unsnapshotted = 0;
        self.notifier.publish(ChangeEvent::SessionProgress {
            session: self.session.clone(),
        });
    }

    async fn send(&mut self, event: RelayEvent) {
        if self.client_gone {
            return;
        }
        if self.tx.send(event).await.is_err() {
            // Receiver dropped. Keep consuming upstream so the reply is
            // still persisted.
            self.client_gone = true;
            tracing::debug!(chat_id = %self.chat_id, "client disconnected mid-stream");
        }
    }
}

/// Map stored messages to the upstream chat payload, resolving
/// attachments into inline parts.
///
/// Images ride as URLs; PDFs are fetched from the object store and
/// inlined as base64 data URLs. Part order follows the stored
/// attachment order, text first.
pub(super) async fn build_upstream_messages(
    objects: &SharedObjects,
    conversation: &[MessageRecord],
) -> anyhow::Result<Vec<Message>> {
    let mut messages = Vec::with_capacity(conversation.len() + 1);
    messages.push(Message::system(super::SYSTEM_PREAMBLE));

    for record in conversation {
        match record.role {
            MessageRole::Assistant => messages.push(Message::assistant(&record.content)),
            MessageRole::User if record.attachments.is_empty() => {
                messages.push(Message::user(&record.content));
            }
            MessageRole::User => {
                // Validation admits only images and PDFs.
                let mut parts = vec![ContentPart::text(&record.content)];
                for attachment in &record.attachments {
                    if attachment.is_pdf() {
                        let bytes = objects.fetch(&attachment.url).await?;
                        let data_url = format!(
                            "data:application/pdf;base64,{}",
                            general_purpose::STANDARD.encode(&bytes)
                        );
                        parts.push(ContentPart::file(&attachment.name, data_url));
                    } else if attachment.is_image() {
                        parts.push(ContentPart::image_url(&attachment.url));
                    }
                }
                messages.push(Message::user_parts(parts));
            }
        }
    }

    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::AttachmentRef;
    use crate::llm::MessageContent;
    use crate::storage::MemoryObjectStore;
    use std::sync::Arc;

    fn record(role: MessageRole, content: &str, attachments: Vec<AttachmentRef>) -> MessageRecord {
        MessageRecord {
            id: Uuid::new_v4().to_string(),
            chat_id: "c1".into(),
            role,
            content: content.into(),
            reasoning: None,
            attachments,
            model: "openai/gpt-4o-mini".into(),
            created_at: Utc::now(),
        }
    }

    fn attachment(name: &str, content_type: &str, url: &str) -> AttachmentRef {
        AttachmentRef {
            name: name.into(),
            content_type: content_type.into(),
            url: url.into(),
        }
    }

    #[tokio::test]
    async fn conversation_maps_roles_and_leads_with_system() {
        let objects: SharedObjects = Arc::new(MemoryObjectStore::default());
        let conversation = vec![
            record(MessageRole::User, "question", Vec::new()),
            record(MessageRole::Assistant, "answer", Vec::new()),
        ];
        let messages = build_upstream_messages(&objects, &conversation)
            .await
            .unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, crate::llm::Role::System);
        assert_eq!(messages[1].role, crate::llm::Role::User);
        assert_eq!(messages[2].role, crate::llm::Role::Assistant);
    }

    #[tokio::test]
    async fn attachments_become_parts_in_stored_order() {
        let store = MemoryObjectStore::default();
        store.insert("https://files.example/doc.pdf", b"%PDF-1.4 fake".to_vec());
        let objects: SharedObjects = Arc::new(store);

        let conversation = vec![record(
            MessageRole::User,
            "see attached",
            vec![
                attachment("shot.png", "image/png", "https://files.example/shot.png"),
                attachment("doc.pdf", "application/pdf", "https://files.example/doc.pdf"),
            ],
        )];
        let messages = build_upstream_messages(&objects, &conversation)
            .await
            .unwrap();

        let parts = match &messages[1].content {
            MessageContent::Parts(parts) => parts,
            other => panic!("expected parts, got {other:?}"),
        };
        assert_eq!(parts.len(), 3);
        match &parts[0] {
            ContentPart::Text { text } => assert_eq!(text, "see attached"),
            other => panic!("expected text first, got {other:?}"),
        }
        match &parts[1] {
            ContentPart::ImageUrl { image_url } => {
                assert_eq!(image_url.url, "https://files.example/shot.png");
            }
            other => panic!("expected image part, got {other:?}"),
        }
        match &parts[2] {
            ContentPart::File { file } => {
                assert_eq!(file.filename, "doc.pdf");
                assert!(file.file_data.starts_with("data:application/pdf;base64,"));
                let encoded = file
                    .file_data
                    .strip_prefix("data:application/pdf;base64,")
                    .unwrap();
                assert_eq!(
                    general_purpose::STANDARD.decode(encoded).unwrap(),
                    b"%PDF-1.4 fake"
                );
            }
            other => panic!("expected file part, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_pdf_fails_message_preparation() {
        let objects: SharedObjects = Arc::new(MemoryObjectStore::default());
        let conversation = vec![record(
            MessageRole::User,
            "see attached",
            vec![attachment(
                "gone.pdf",
                "application/pdf",
                "https://files.example/gone.pdf",
            )],
        )];
        let err = build_upstream_messages(&objects, &conversation)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("gone.pdf"));
    }
}
