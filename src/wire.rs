//! Relay wire protocol: typed SSE events, encoder, and decoder.
//!
//! The relay and its clients speak a closed vocabulary of five named
//! server-sent events: `chatId`, `reasoning`, `content`, `done`, `error`.
//! Payloads are JSON except `chatId`, which is a raw string. `reasoning`
//! carries the full reasoning text accumulated so far (absolute
//! replacement), while `content` carries only the newest delta (appended
//! by the consumer). That asymmetry is part of the protocol, not an
//! implementation detail.
//!
//! Everything in this module is pure and synchronous; I/O lives in the
//! relay producer and the client consumer.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A typed event on the relay's client-facing stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Announces the id of a lazily created chat. Always the first event
    /// on a stream that created its chat.
    ChatId {
        /// The new chat id.
        chat_id: String,
    },

    /// Full reasoning text accumulated so far. Each event supersedes all
    /// prior reasoning.
    Reasoning {
        /// The complete reasoning as of this event.
        reasoning: String,
    },

    /// Incremental content delta. Consumers append, never replace.
    Content {
        /// The newest content fragment.
        content: String,
    },

    /// Terminal success event carrying the full final texts.
    Done {
        /// Full content of the completed reply.
        content: String,
        /// Full reasoning of the completed reply (may be empty).
        reasoning: String,
        /// Id of the chat the reply belongs to.
        chat_id: String,
    },

    /// Terminal failure event.
    Error {
        /// Human-readable error message.
        error: String,
    },
}

#[derive(Serialize, Deserialize)]
struct ReasoningPayload {
    reasoning: String,
}

#[derive(Serialize, Deserialize)]
struct ContentPayload {
    content: String,
}

#[derive(Serialize, Deserialize)]
struct DonePayload {
    content: String,
    #[serde(default)]
    reasoning: String,
    #[serde(rename = "chatId")]
    chat_id: String,
}

#[derive(Serialize, Deserialize)]
struct ErrorPayload {
    error: String,
}

impl RelayEvent {
    /// Create a chat-id announcement.
    pub fn chat_id(id: impl Into<String>) -> Self {
        Self::ChatId { chat_id: id.into() }
    }

    /// Create a reasoning event carrying the full reasoning so far.
    pub fn reasoning(reasoning: impl Into<String>) -> Self {
        Self::Reasoning {
            reasoning: reasoning.into(),
        }
    }

    /// Create a content delta event.
    pub fn content(content: impl Into<String>) -> Self {
        Self::Content {
            content: content.into(),
        }
    }

    /// Create the terminal done event.
    pub fn done(
        content: impl Into<String>,
        reasoning: impl Into<String>,
        chat_id: impl Into<String>,
    ) -> Self {
        Self::Done {
            content: content.into(),
            reasoning: reasoning.into(),
            chat_id: chat_id.into(),
        }
    }

    /// Create the terminal error event.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    /// The SSE event name for this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ChatId { .. } => "chatId",
            Self::Reasoning { .. } => "reasoning",
            Self::Content { .. } => "content",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// The payload for the `data:` line. JSON for everything except
    /// `chatId`, which goes over the wire as a raw string.
    pub fn payload(&self) -> String {
        match self {
            Self::ChatId { chat_id } => chat_id.clone(),
            Self::Reasoning { reasoning } => serde_json::json!({ "reasoning": reasoning }).to_string(),
            Self::Content { content } => serde_json::json!({ "content": content }).to_string(),
            Self::Done {
                content,
                reasoning,
                chat_id,
            } => serde_json::json!({
                "content": content,
                "reasoning": reasoning,
                "chatId": chat_id,
            })
            .to_string(),
            Self::Error { error } => serde_json::json!({ "error": error }).to_string(),
        }
    }

    /// Encode this event as a complete SSE frame.
    pub fn encode(&self) -> Bytes {
        Bytes::from(format!(
            "event: {}\ndata: {}\n\n",
            self.event_type(),
            self.payload()
        ))
    }
}

/// Incremental decoder for the relay wire protocol.
///
/// Input arrives in arbitrary-sized chunks; frames are reassembled across
/// chunk boundaries. Both the blank-line separator and the single-newline
/// fallback (a new `event:` line starting while a complete name+payload
/// pair is pending) are accepted. Malformed JSON payloads are dropped
/// silently, except `done`/`error` payloads which fall back to a raw-text
/// error. Once a terminal event has been decoded, all further input is
/// ignored.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    pending_event: Option<String>,
    pending_data: Option<String>,
    finished: bool,
}

impl StreamDecoder {
    /// Create a decoder in its initial state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a terminal event has been decoded.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed a chunk of bytes, returning all events completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<RelayEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.buffer.extend_from_slice(chunk);

        // Split on '\n' only; multi-byte UTF-8 sequences never contain a
        // newline byte, so lines stay valid even when chunks split a
        // character.
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.take_line(line) {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    self.finished = true;
                    self.buffer.clear();
                    break;
                }
            }
        }
        events
    }

    /// Flush a trailing name+payload pair at end of input, if any.
    pub fn finish(&mut self) -> Option<RelayEvent> {
        if self.finished {
            return None;
        }
        let event = self.flush_pending();
        if event.as_ref().is_some_and(RelayEvent::is_terminal) {
            self.finished = true;
        }
        event
    }

    fn take_line(&mut self, line: &str) -> Option<RelayEvent> {
        if line.is_empty() {
            return self.flush_pending();
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(name) = field_value(line, "event") {
            // Single-newline fallback: a new event begins while a full
            // pair is still pending.
            let flushed = if self.pending_data.is_some() {
                self.flush_pending()
            } else {
                None
            };
            self.pending_event = Some(name.to_owned());
            self.pending_data = None;
            return flushed;
        }
        if let Some(data) = field_value(line, "data") {
            match &mut self.pending_data {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(data);
                }
                None => self.pending_data = Some(data.to_owned()),
            }
        }
        None
    }

    fn flush_pending(&mut self) -> Option<RelayEvent> {
        let name = self.pending_event.take()?;
        let data = self.pending_data.take()?;
        decode_event(&name, &data)
    }
}

/// Extract the value of an SSE field line, honoring the optional single
/// space after the colon.
fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

fn decode_event(name: &str, data: &str) -> Option<RelayEvent> {
    match name {
        "chatId" => Some(RelayEvent::ChatId {
            chat_id: data.to_owned(),
        }),
        "reasoning" => serde_json::from_str::<ReasoningPayload>(data)
            .ok()
            .map(|p| RelayEvent::Reasoning {
                reasoning: p.reasoning,
            }),
        "content" => serde_json::from_str::<ContentPayload>(data)
            .ok()
            .map(|p| RelayEvent::Content { content: p.content }),
        "done" => match serde_json::from_str::<DonePayload>(data) {
            Ok(p) => Some(RelayEvent::Done {
                content: p.content,
                reasoning: p.reasoning,
                chat_id: p.chat_id,
            }),
            // An unreadable terminal frame still has to terminate the
            // stream, so surface it as an error instead of dropping it.
            Err(_) => Some(RelayEvent::Error {
                error: data.to_owned(),
            }),
        },
        "error" => match serde_json::from_str::<ErrorPayload>(data) {
            Ok(p) => Some(RelayEvent::Error { error: p.error }),
            Err(_) => Some(RelayEvent::Error {
                error: data.to_owned(),
            }),
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sequence() -> Vec<RelayEvent> {
        vec![
            RelayEvent::chat_id("3f2a9b1c-0000-4000-8000-c0ffee000001"),
            RelayEvent::reasoning("thinking"),
            RelayEvent::content("Hel"),
            RelayEvent::reasoning("thinking harder"),
            RelayEvent::content("lo 😀 wörld"),
            RelayEvent::done(
                "Hello 😀 wörld",
                "thinking harder",
                "3f2a9b1c-0000-4000-8000-c0ffee000001",
            ),
        ]
    }

    fn encode_all(events: &[RelayEvent]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for event in events {
            bytes.extend_from_slice(&event.encode());
        }
        bytes
    }

    fn decode_chunked(bytes: &[u8], chunk_size: usize) -> Vec<RelayEvent> {
        let mut decoder = StreamDecoder::new();
        let mut out = Vec::new();
        for chunk in bytes.chunks(chunk_size) {
            out.extend(decoder.feed(chunk));
        }
        out.extend(decoder.finish());
        out
    }

    #[test]
    fn round_trip_whole_stream() {
        let events = sample_sequence();
        let bytes = encode_all(&events);
        let mut decoder = StreamDecoder::new();
        let decoded = decoder.feed(&bytes);
        assert_eq!(decoded, events);
        assert!(decoder.is_finished());
    }

    #[test]
    fn chunk_boundary_independence() {
        let events = sample_sequence();
        let bytes = encode_all(&events);
        // Byte-by-byte splits multi-byte UTF-8 characters across feeds.
        for chunk_size in [1, 2, 3, 7, 16, 61] {
            assert_eq!(decode_chunked(&bytes, chunk_size), events, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn chat_id_payload_is_raw() {
        let frame = RelayEvent::chat_id("abc-123").encode();
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert_eq!(text, "event: chatId\ndata: abc-123\n\n");
    }

    #[test]
    fn single_newline_separator_fallback() {
        let input = "event: content\ndata: {\"content\":\"a\"}\nevent: content\ndata: {\"content\":\"b\"}\n\n";
        let mut decoder = StreamDecoder::new();
        let decoded = decoder.feed(input.as_bytes());
        assert_eq!(decoded, vec![RelayEvent::content("a"), RelayEvent::content("b")]);
    }

    #[test]
    fn malformed_payload_dropped_silently() {
        let input = "event: content\ndata: {not json\n\nevent: content\ndata: {\"content\":\"ok\"}\n\n";
        let mut decoder = StreamDecoder::new();
        let decoded = decoder.feed(input.as_bytes());
        assert_eq!(decoded, vec![RelayEvent::content("ok")]);
    }

    #[test]
    fn malformed_error_payload_falls_back_to_raw_text() {
        let input = "event: error\ndata: upstream exploded\n\n";
        let mut decoder = StreamDecoder::new();
        let decoded = decoder.feed(input.as_bytes());
        assert_eq!(decoded, vec![RelayEvent::error("upstream exploded")]);
        assert!(decoder.is_finished());
    }

    #[test]
    fn malformed_done_payload_falls_back_to_raw_text() {
        let input = "event: done\ndata: oops\n\n";
        let mut decoder = StreamDecoder::new();
        let decoded = decoder.feed(input.as_bytes());
        assert_eq!(decoded, vec![RelayEvent::error("oops")]);
        assert!(decoder.is_finished());
    }

    #[test]
    fn terminal_event_stops_decoding() {
        let mut bytes = RelayEvent::done("full", "", "chat-1").encode().to_vec();
        bytes.extend_from_slice(&RelayEvent::content("ignored").encode());
        let mut decoder = StreamDecoder::new();
        let decoded = decoder.feed(&bytes);
        assert_eq!(decoded, vec![RelayEvent::done("full", "", "chat-1")]);
        assert!(decoder.feed(&RelayEvent::content("more").encode()).is_empty());
    }

    #[test]
    fn comment_and_unknown_lines_ignored() {
        let input = ": keep-alive\nevent: ping\ndata: {}\n\nevent: content\ndata: {\"content\":\"x\"}\n\n";
        let mut decoder = StreamDecoder::new();
        let decoded = decoder.feed(input.as_bytes());
        assert_eq!(decoded, vec![RelayEvent::content("x")]);
    }

    #[test]
    fn finish_flushes_trailing_pair() {
        let input = "event: content\ndata: {\"content\":\"tail\"}";
        let mut decoder = StreamDecoder::new();
        assert!(decoder.feed(input.as_bytes()).is_empty());
        // The final line never got its newline; feed pushes it through on
        // the next boundary, finish handles true end-of-input.
        assert!(decoder.feed(b"\n").is_empty());
        assert_eq!(decoder.finish(), Some(RelayEvent::content("tail")));
    }

    #[test]
    fn crlf_lines_accepted() {
        let input = "event: content\r\ndata: {\"content\":\"x\"}\r\n\r\n";
        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.feed(input.as_bytes()), vec![RelayEvent::content("x")]);
    }
}
