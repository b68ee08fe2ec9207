//! Reference client for the relay API.
//!
//! [`ChatClient`] wraps the HTTP surface; [`consumer`] drives the wire
//! decoder with typed callbacks; [`state`] keeps the local timeline a
//! UI renders. `run_turn` ties the three together for the common case.

pub mod consumer;
pub mod state;

pub use consumer::{consume, consume_stream, StateHandler, StreamHandler, StreamOutcome};
pub use state::{ApplyOutcome, ChatState, TurnHandles};

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::chats::ModelsResponse;
use crate::database::{AttachmentRef, ChatRecord, MessageRecord, StreamSessionRecord};

/// A relay call as the client sends it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    /// Existing chat to continue, or `None` to create one.
    pub chat_id: Option<String>,
    /// The new user message.
    pub user_message_content: String,
    /// Calling user.
    pub user_id: String,
    /// Requested model id; the server substitutes its default for
    /// anything it does not allow.
    pub model: Option<String>,
    /// Route the request through upstream web search.
    pub web_search_enabled: bool,
    /// Already-uploaded attachments, in display order.
    pub attached_files: Vec<AttachmentRef>,
}

impl SendMessage {
    pub fn new(user_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            chat_id: None,
            user_message_content: content.into(),
            user_id: user_id.into(),
            model: None,
            web_search_enabled: false,
            attached_files: Vec::new(),
        }
    }
}

/// An edit-and-regenerate call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessage {
    /// Id of the user message to rewrite.
    pub id: String,
    /// Replacement content.
    pub new_content: String,
    /// Optional model override for the regeneration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
}

/// HTTP client for the relay service.
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build relay HTTP client")?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            http,
            base_url,
            bearer_token: None,
        })
    }

    /// Attach the bearer token used by edit and delete calls.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let token = self
            .bearer_token
            .as_ref()
            .context("no bearer token configured")?;
        Ok(request.bearer_auth(token))
    }

    /// POST the relay call and hand back the streaming response.
    ///
    /// Pre-stream failures (validation, config) arrive as non-2xx and
    /// surface here; everything after headers arrives as wire events.
    pub async fn send_message(&self, message: &SendMessage) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(self.url("/api/v1/chat"))
            .json(message)
            .send()
            .await
            .context("relay request failed")?;
        check_status(response).await
    }

    /// POST an edit and hand back the regeneration stream.
    pub async fn edit_message(&self, edit: &EditMessage) -> Result<reqwest::Response> {
        let request = self.http.post(self.url("/api/v1/chat/edit")).json(edit);
        let response = self
            .authorize(request)?
            .send()
            .await
            .context("edit request failed")?;
        check_status(response).await
    }

    /// Delete a chat and everything hanging off it.
    pub async fn delete_chat(&self, chat_id: &str) -> Result<()> {
        let request = self
            .http
            .post(self.url("/api/v1/chat/delete"))
            .json(&json!({ "chatId": chat_id }));
        let response = self
            .authorize(request)?
            .send()
            .await
            .context("delete request failed")?;
        let response = check_status(response).await?;
        let body: serde_json::Value = response
            .json()
            .await
            .context("delete response was not JSON")?;
        if !body
            .get("success")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
        {
            bail!("delete did not report success: {body}");
        }
        Ok(())
    }

    pub async fn fetch_models(&self) -> Result<ModelsResponse> {
        let response = self
            .http
            .get(self.url("/api/v1/models"))
            .send()
            .await
            .context("models request failed")?;
        let response = check_status(response).await?;
        response.json().await.context("models response was not JSON")
    }

    pub async fn fetch_chats(&self, user_id: &str) -> Result<Vec<ChatRecord>> {
        let response = self
            .http
            .get(self.url("/api/v1/chats"))
            .query(&[("userId", user_id)])
            .send()
            .await
            .context("chats request failed")?;
        let response = check_status(response).await?;
        response.json().await.context("chats response was not JSON")
    }

    pub async fn fetch_messages(&self, chat_id: &str) -> Result<Vec<MessageRecord>> {
        let response = self
            .http
            .get(self.url(&format!("/api/v1/chats/{chat_id}/messages")))
            .send()
            .await
            .context("messages request failed")?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .context("messages response was not JSON")
    }

    /// Poll the latest stream session for a chat, `None` when the chat
    /// has never streamed.
    pub async fn fetch_session(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> Result<Option<StreamSessionRecord>> {
        let response = self
            .http
            .get(self.url(&format!("/api/v1/chats/{chat_id}/session")))
            .query(&[("userId", user_id)])
            .send()
            .await
            .context("session poll failed")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;
        Ok(Some(
            response
                .json()
                .await
                .context("session response was not JSON")?,
        ))
    }

    /// Run one full optimistic turn against `state`: placeholders in,
    /// stream applied as it arrives, authoritative refetch on `done`.
    /// A stream that ends in an error rolls back the assistant
    /// placeholder; the user message stays, the server persisted it
    /// before contacting upstream.
    pub async fn run_turn(
        &self,
        state: &mut ChatState,
        message: SendMessage,
    ) -> Result<StreamOutcome> {
        let handles = state.begin_turn(
            &message.user_message_content,
            message.model.as_deref().unwrap_or_default(),
            message.attached_files.clone(),
        );

        let response = match self.send_message(&message).await {
            Ok(response) => response,
            Err(err) => {
                // The call never started; drop both placeholders.
                state.clear_turn(&handles);
                return Err(err);
            }
        };

        let result = {
            let mut handler =
                StateHandler::new(state, handles.assistant_message_id.clone());
            consume(response, &mut handler).await
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                state.remove_message(&handles.assistant_message_id);
                return Err(err);
            }
        };

        if outcome.completed {
            if let Some(chat_id) = &outcome.chat_id {
                state.set_chat_id(chat_id);
                let messages = self.fetch_messages(chat_id).await?;
                state.replace_all(messages);
            }
        } else {
            state.remove_message(&handles.assistant_message_id);
        }
        Ok(outcome)
    }
}

/// Promote a non-2xx response to an error carrying the server's
/// `{"error"}` body when present.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|e| e.error)
        .unwrap_or(body);
    bail!("relay call failed ({status}): {message}")
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}
