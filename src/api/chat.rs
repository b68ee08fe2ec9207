//! Mutating chat endpoints: start a relay stream, edit-and-regenerate,
//! delete a chat.

use std::convert::Infallible;

use axum::{
    body::Body,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::auth::require_user;
use crate::database::AttachmentRef;
use crate::error::{ApiError, ApiResult};
use crate::notify::ChangeEvent;
use crate::relay::{EditRequest, RelayRequest};
use crate::wire::RelayEvent;
use crate::AppState;

/// Routes whose responses stream for the lifetime of a generation.
pub fn streaming_router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/chat", post(relay_chat))
        .route("/api/v1/chat/edit", post(edit_message))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/v1/chat/delete", post(delete_chat))
}

/// Relay call body. Field names follow the web client's JSON.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayChatRequest {
    /// Existing chat to continue, or `null` to create one.
    #[serde(default)]
    pub chat_id: Option<String>,
    /// The new user message.
    pub user_message_content: String,
    /// Calling user.
    pub user_id: String,
    /// Requested model id.
    #[serde(default)]
    pub model: Option<String>,
    /// Route the request through upstream web search.
    #[serde(default)]
    pub web_search_enabled: bool,
    /// Already-uploaded attachments, in display order.
    #[serde(default)]
    pub attached_files: Vec<AttachmentRef>,
}

/// Start a relay stream for a new user message.
async fn relay_chat(
    State(state): State<AppState>,
    Json(req): Json<RelayChatRequest>,
) -> ApiResult<Response> {
    let rx = state
        .relay
        .start(RelayRequest {
            chat_id: req.chat_id,
            user_id: req.user_id,
            user_message_content: req.user_message_content,
            model: req.model,
            web_search_enabled: req.web_search_enabled,
            attached_files: req.attached_files,
        })
        .await?;
    Ok(event_stream_response(rx))
}

/// Edit-and-regenerate call body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessageRequest {
    /// Id of the user message to rewrite.
    pub id: String,
    /// Replacement content.
    pub new_content: String,
    /// Optional model override for the regeneration.
    #[serde(default)]
    pub model_override: Option<String>,
}

/// Rewrite a user message and stream the regenerated reply.
async fn edit_message(
    State(state): State<AppState>,
    TypedHeader(bearer): TypedHeader<Authorization<Bearer>>,
    Json(req): Json<EditMessageRequest>,
) -> ApiResult<Response> {
    let user = require_user(&state.identity, bearer.token()).await?;
    let rx = state
        .relay
        .regenerate(
            &user,
            EditRequest {
                message_id: req.id,
                new_content: req.new_content,
                model_override: req.model_override,
            },
        )
        .await?;
    Ok(event_stream_response(rx))
}

/// Delete-chat call body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteChatRequest {
    pub chat_id: String,
}

/// Delete a chat, its messages, and their attachment blobs.
async fn delete_chat(
    State(state): State<AppState>,
    TypedHeader(bearer): TypedHeader<Authorization<Bearer>>,
    Json(req): Json<DeleteChatRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let user = require_user(&state.identity, bearer.token()).await?;
    let chat = state
        .store
        .get_chat(&req.chat_id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::NotFound(format!("chat not found: {}", req.chat_id)))?;
    if chat.user_id != user.user_id {
        return Err(ApiError::forbidden("chat belongs to another user"));
    }

    // Blob cleanup is best-effort; the chat row is the authority.
    let messages = state
        .store
        .list_messages(&chat.id)
        .await
        .map_err(ApiError::Internal)?;
    for message in &messages {
        for attachment in &message.attachments {
            if let Err(err) = state.objects.delete(&attachment.url).await {
                tracing::warn!(
                    error = ?err,
                    url = %attachment.url,
                    "failed to delete attachment blob"
                );
            }
        }
    }

    state
        .store
        .delete_chat(&chat.id)
        .await
        .map_err(ApiError::Internal)?;
    state.notifier.publish(ChangeEvent::ChatDeleted {
        chat_id: chat.id.clone(),
    });
    tracing::info!(chat_id = %chat.id, messages = messages.len(), "deleted chat");

    Ok(Json(json!({ "success": true })))
}

/// Stream relay events as a hand-encoded SSE body.
///
/// The relay owns its wire format, so the body carries the encoded
/// frames directly instead of going through `axum::response::Sse`.
fn event_stream_response(rx: mpsc::Receiver<RelayEvent>) -> Response {
    let frames =
        ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(event.encode()));
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}
