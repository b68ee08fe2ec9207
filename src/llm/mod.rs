//! Upstream LLM types and the streaming client.
//!
//! The relay speaks to a single OpenRouter-compatible aggregator. This
//! module defines the outgoing message model (including multimodal
//! attachment parts) and the normalized per-frame events the rest of the
//! crate consumes; [`openrouter`] holds the HTTP driver.

pub mod openrouter;

pub use openrouter::OpenRouterClient;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

/// Connection settings for the upstream aggregator.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// Base URL, e.g. `https://openrouter.ai/api`.
    pub base_url: String,
    /// Bearer key for the aggregator.
    pub api_key: String,
    /// Optional `HTTP-Referer` attribution header.
    pub referer: Option<String>,
    /// Optional `X-Title` attribution header.
    pub title: Option<String>,
    /// Connect timeout in seconds. Streams themselves are not capped.
    pub connect_timeout_secs: u64,
}

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System preamble.
    System,
    /// End-user message.
    User,
    /// Model reply.
    Assistant,
}

/// A message in the outgoing upstream conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Author role.
    pub role: Role,
    /// Text or multimodal content.
    pub content: MessageContent,
}

impl Message {
    /// Preamble message carrying behavioral instructions.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(content.into()),
        }
    }

    /// Create a plain-text user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(content.into()),
        }
    }

    /// Create a multimodal user message.
    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
        }
    }

    /// Prior model reply, replayed for context.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(content.into()),
        }
    }
}

/// Message content, either plain text or multimodal parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// A bare string, the common case.
    Text(String),
    /// Multimodal content parts.
    Parts(Vec<ContentPart>),
}

/// One part of a multimodal message, in the aggregator's wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text segment.
    Text {
        /// The text.
        text: String,
    },
    /// Image referenced by URL.
    ImageUrl {
        /// Image location.
        image_url: ImageUrl,
    },
    /// Document embedded as a data URL.
    File {
        /// Embedded file payload.
        file: FilePayload,
    },
}

impl ContentPart {
    /// Text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Image part pointing at a URL.
    pub fn image_url(url: impl Into<String>) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }

    /// Base64-embedded file part.
    pub fn file(filename: impl Into<String>, data_url: impl Into<String>) -> Self {
        Self::File {
            file: FilePayload {
                filename: filename.into(),
                file_data: data_url.into(),
            },
        }
    }
}

/// Wrapper object the wire format requires around an image location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    /// HTTP URL or base64 data URL.
    pub url: String,
}

/// Embedded file payload for document parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePayload {
    /// Original filename, used by the upstream for type hints.
    pub filename: String,
    /// Base64 data URL with the document bytes.
    pub file_data: String,
}

/// A normalized event parsed from one upstream stream frame.
///
/// An upstream frame can carry a reasoning delta and a content delta in
/// the same choice; they are split into separate events here so the relay
/// can re-emit each the moment it arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// Reasoning token delta.
    Reasoning {
        /// The newest reasoning fragment.
        delta: String,
    },
    /// Content token delta.
    Content {
        /// The newest content fragment.
        delta: String,
    },
    /// The upstream stream finished.
    Done,
}

/// Boxed stream of normalized upstream events.
pub type UpstreamEventStream = Pin<Box<dyn Stream<Item = anyhow::Result<UpstreamEvent>> + Send>>;

/// Streaming driver for the upstream aggregator.
///
/// The relay needs exactly one operation. Keeping it behind a trait lets
/// tests script upstream behavior without a network.
#[async_trait]
pub trait ChatDriver: Send + Sync {
    /// Start one streaming completion for the given conversation.
    async fn stream_chat(
        &self,
        model: &str,
        messages: &[Message],
    ) -> anyhow::Result<UpstreamEventStream>;
}

pub type SharedDriver = Arc<dyn ChatDriver>;
