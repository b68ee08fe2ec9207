//! OpenRouter-compatible streaming driver.
//!
//! Issues the `chat/completions` call with `stream: true` and normalizes
//! the SSE chunk stream into [`UpstreamEvent`]s. Any OpenAI-compatible
//! aggregator works; the attribution headers are OpenRouter conventions.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;

use super::{ChatDriver, Message, UpstreamEvent, UpstreamEventStream, UpstreamSettings};

/// HTTP client for the upstream aggregator.
#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    settings: UpstreamSettings,
    http: Client,
}

impl OpenRouterClient {
    /// Build a client from settings. Streams are not given an overall
    /// timeout; only connection establishment is bounded.
    pub fn new(settings: UpstreamSettings) -> anyhow::Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .build()
            .context("failed to build upstream HTTP client")?;
        Ok(Self { settings, http })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ChatDriver for OpenRouterClient {
    /// Start a streaming completion and return the normalized event
    /// stream. Fails before yielding anything on a non-2xx preflight.
    async fn stream_chat(
        &self,
        model: &str,
        messages: &[Message],
    ) -> anyhow::Result<UpstreamEventStream> {
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": true,
        });

        let mut request = self
            .http
            .post(self.completions_url())
            .header("Authorization", format!("Bearer {}", self.settings.api_key))
            .json(&body);
        if let Some(ref referer) = self.settings.referer {
            request = request.header("HTTP-Referer", referer.clone());
        }
        if let Some(ref title) = self.settings.title {
            request = request.header("X-Title", title.clone());
        }

        let response = request.send().await.context("upstream request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("upstream error ({status}): {text}");
        }

        let stream = response.bytes_stream();

        let event_stream = async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();

            futures::pin_mut!(stream);

            while let Some(chunk_result) = stream.next().await {
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(anyhow::anyhow!("upstream stream error: {e}"));
                        break;
                    }
                };

                buffer.extend_from_slice(&chunk);

                // Frames end on a blank line. Buffering bytes rather than
                // text keeps multi-byte characters split across chunks
                // intact.
                while let Some(pos) = buffer.windows(2).position(|w| w == b"\n\n") {
                    let frame: Vec<u8> = buffer.drain(..pos + 2).collect();
                    let frame = String::from_utf8_lossy(&frame);

                    for data_line in frame.lines() {
                        if let Some(data) = data_line.strip_prefix("data: ") {
                            if data.trim() == "[DONE]" {
                                yield Ok(UpstreamEvent::Done);
                                continue;
                            }

                            match serde_json::from_str::<StreamChunk>(data) {
                                Ok(chunk) => {
                                    for event in chunk.into_events() {
                                        yield Ok(event);
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!("failed to parse upstream chunk: {e} - {data}");
                                }
                            }
                        }
                    }
                }
            }

            // Reader exhaustion without a [DONE] sentinel still completes
            // the reply.
            yield Ok(UpstreamEvent::Done);
        };

        Ok(Box::pin(event_stream))
    }
}

/// One parsed frame of the upstream SSE stream.
#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    reasoning: Option<String>,
    // Some providers surface reasoning under this name instead.
    reasoning_content: Option<String>,
}

impl StreamDelta {
    fn reasoning_delta(&self) -> Option<&str> {
        self.reasoning
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.reasoning_content.as_deref().filter(|s| !s.is_empty()))
    }
}

impl StreamChunk {
    /// Split a frame into per-field events, reasoning before content so
    /// emission order matches generation order.
    fn into_events(self) -> Vec<UpstreamEvent> {
        let mut events = Vec::new();
        for choice in self.choices.unwrap_or_default() {
            if let Some(ref delta) = choice.delta {
                if let Some(reasoning) = delta.reasoning_delta() {
                    events.push(UpstreamEvent::Reasoning {
                        delta: reasoning.to_owned(),
                    });
                }
                if let Some(ref content) = delta.content {
                    if !content.is_empty() {
                        events.push(UpstreamEvent::Content {
                            delta: content.clone(),
                        });
                    }
                }
            }
            if choice.finish_reason.is_some() {
                events.push(UpstreamEvent::Done);
            }
        }
        events
    }
}
