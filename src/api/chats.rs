//! Read endpoints: the model catalog, chat lists, message timelines,
//! session polling, and the per-chat update stream.

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;

use crate::database::{ChatRecord, MessageRecord, StreamSessionRecord};
use crate::error::{ApiError, ApiResult};
use crate::models::ModelEntry;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/models", get(list_models))
        .route("/api/v1/chats", get(list_chats))
        .route("/api/v1/chats/{id}/messages", get(list_messages))
        .route("/api/v1/chats/{id}/session", get(poll_session))
}

/// The update stream lives as long as the client keeps it open.
pub fn updates_router() -> Router<AppState> {
    Router::new().route("/api/v1/chats/{id}/updates", get(chat_updates))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuery {
    pub user_id: String,
}

/// Model catalog response. Also deserialized by the bundled client.
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelEntry>,
    pub default_model: String,
}

/// The allow-listed models and the substitution default.
async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.models.entries(),
        default_model: state.models.default_model().to_string(),
    })
}

/// A user's chats, newest first.
async fn list_chats(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> ApiResult<Json<Vec<ChatRecord>>> {
    let chats = state
        .store
        .list_chats(&query.user_id)
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(chats))
}

/// A chat's messages in timeline order.
async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<MessageRecord>>> {
    let messages = state
        .store
        .list_messages(&id)
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(messages))
}

/// The most recent stream session for a chat+user pair.
///
/// Completed and errored sessions stay visible here so a reconnecting
/// client can pick up the final state and its `message_id`.
async fn poll_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<UserQuery>,
) -> ApiResult<Json<StreamSessionRecord>> {
    let session = state
        .store
        .latest_session(&id, &query.user_id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::NotFound(format!("no stream session for chat {id}")))?;
    Ok(Json(session))
}

/// Per-chat change feed.
///
/// Lagged subscribers silently drop events; clients treat the feed as a
/// hint and refetch whatever they cannot apply.
async fn chat_updates(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.notifier.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(move |result| {
        let chat_id = id.clone();
        async move {
            match result {
                Ok(event) if event.chat_id() == chat_id => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    Some(Ok::<_, Infallible>(
                        Event::default().event(event.event_type()).data(data),
                    ))
                }
                // Other chats' events and lag gaps both fall out here.
                _ => None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
