//! Drives a relay response body through the wire decoder, dispatching
//! typed callbacks as events arrive.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};

use super::state::ChatState;
use crate::wire::{RelayEvent, StreamDecoder};

/// Typed callbacks for relay stream events.
///
/// All methods default to no-ops; implement the ones the caller cares
/// about.
#[async_trait]
pub trait StreamHandler: Send {
    async fn on_chat_id(&mut self, _chat_id: &str) {}
    /// Full reasoning so far; replaces what was shown, never appends.
    async fn on_reasoning(&mut self, _reasoning: &str) {}
    /// One content delta; append to the running answer.
    async fn on_content(&mut self, _delta: &str) {}
    async fn on_done(&mut self, _content: &str, _reasoning: &str, _chat_id: &str) {}
    async fn on_error(&mut self, _message: &str) {}
}

/// Terminal summary of one consumed stream.
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    /// Chat id announced on the stream, if any.
    pub chat_id: Option<String>,
    /// Accumulated answer; on completion this is the authoritative
    /// text from the `done` event.
    pub content: String,
    /// Reasoning text as last replaced.
    pub reasoning: String,
    /// The in-stream error message, when the stream ended with one.
    pub error: Option<String>,
    /// Whether a `done` event arrived.
    pub completed: bool,
}

/// Consume a relay HTTP response to its terminal event.
pub async fn consume<H: StreamHandler>(
    response: reqwest::Response,
    handler: &mut H,
) -> anyhow::Result<StreamOutcome> {
    consume_stream(response.bytes_stream(), handler).await
}

/// Consume an already-opened byte stream of wire frames.
pub async fn consume_stream<S, E, H>(
    mut stream: S,
    handler: &mut H,
) -> anyhow::Result<StreamOutcome>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<anyhow::Error>,
    H: StreamHandler,
{
    let mut decoder = StreamDecoder::new();
    let mut outcome = StreamOutcome::default();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => return Err(err.into().context("relay stream read failed")),
        };
        for event in decoder.feed(&chunk) {
            dispatch(&event, handler, &mut outcome).await;
        }
        if decoder.is_finished() {
            return Ok(outcome);
        }
    }
    if let Some(event) = decoder.finish() {
        dispatch(&event, handler, &mut outcome).await;
    }
    Ok(outcome)
}

async fn dispatch<H: StreamHandler>(
    event: &RelayEvent,
    handler: &mut H,
    outcome: &mut StreamOutcome,
) {
    match event {
        RelayEvent::ChatId { chat_id } => {
            outcome.chat_id = Some(chat_id.clone());
            handler.on_chat_id(chat_id).await;
        }
        RelayEvent::Reasoning { reasoning } => {
            outcome.reasoning = reasoning.clone();
            handler.on_reasoning(reasoning).await;
        }
        RelayEvent::Content { content } => {
            outcome.content.push_str(content);
            handler.on_content(content).await;
        }
        RelayEvent::Done {
            content,
            reasoning,
            chat_id,
        } => {
            outcome.content = content.clone();
            outcome.reasoning = reasoning.clone();
            outcome.chat_id = Some(chat_id.clone());
            outcome.completed = true;
            handler.on_done(content, reasoning, chat_id).await;
        }
        RelayEvent::Error { error } => {
            outcome.error = Some(error.clone());
            handler.on_error(error).await;
        }
    }
}

/// A [`StreamHandler`] that maintains the optimistic placeholder rows
/// in a [`ChatState`] while the stream runs.
#[derive(Debug)]
pub struct StateHandler<'a> {
    state: &'a mut ChatState,
    assistant_id: String,
}

impl<'a> StateHandler<'a> {
    pub fn new(state: &'a mut ChatState, assistant_id: impl Into<String>) -> Self {
        Self {
            state,
            assistant_id: assistant_id.into(),
        }
    }
}

#[async_trait]
impl StreamHandler for StateHandler<'_> {
    async fn on_chat_id(&mut self, chat_id: &str) {
        self.state.set_chat_id(chat_id);
    }

    async fn on_reasoning(&mut self, reasoning: &str) {
        self.state
            .set_assistant_reasoning(&self.assistant_id, reasoning);
    }

    async fn on_content(&mut self, delta: &str) {
        self.state.append_assistant_content(&self.assistant_id, delta);
    }
}
