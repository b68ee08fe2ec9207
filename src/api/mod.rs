//! HTTP API endpoints.

pub mod chat;
pub mod chats;
pub mod health;

use axum::Router;

use crate::AppState;

/// Routes that answer promptly and can sit behind a request timeout.
pub fn create_router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(chat::router())
        .merge(chats::router())
}

/// Routes whose responses stay open for the life of a stream. These
/// must not sit behind the request timeout layer.
pub fn create_streaming_router() -> Router<AppState> {
    Router::new()
        .merge(chat::streaming_router())
        .merge(chats::updates_router())
}
