//! Estuary - Chat relay service
//!
//! Estuary sits between a web chat client and an upstream LLM provider.
//! It turns one relay call into a durable conversation turn: the user
//! message is persisted, the upstream stream is re-emitted as typed SSE
//! events, progress is snapshotted while tokens flow, and the finished
//! reply lands as a message row even if the client went away mid-stream.
//!
//! - **Relay**: lazy chat creation, model allow-list, web search routing,
//!   attachment handling, detached stream production
//! - **Durability**: SQLite-backed chats, messages, and stream sessions
//! - **Recovery**: pollable session rows plus a per-chat SSE update feed
//! - **Client**: a typed consumer for the relay wire format
//!
//! # Architecture
//!
//! The service is organized into several key modules:
//!
//! - [`config`]: Configuration management and environment loading
//! - [`wire`]: The SSE event model, encoder, and chunk-tolerant decoder
//! - [`relay`]: The stream engine that drives one generation per call
//! - [`database`]: Chat/message/session records and their stores
//! - [`llm`]: Upstream message model and the OpenRouter driver
//! - [`auth`]: Bearer-token identity resolution
//! - [`storage`]: Attachment blob access
//! - [`api`]: HTTP API endpoints
//! - [`client`]: Reference consumer for the relay wire format
//!
//! # Example
//!
//! ```rust,ignore
//! use estuary::{config::AppConfig, server::create_app};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let app = create_app(config).await?;
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod database;
pub mod error;
pub mod llm;
pub mod logging;
pub mod models;
pub mod notify;
pub mod relay;
pub mod server;
pub mod storage;
pub mod wire;

use std::sync::Arc;

use auth::SharedIdentity;
use config::AppConfig;
use database::SharedStore;
use llm::SharedDriver;
use models::ModelCatalog;
use notify::Notifier;
use relay::Relay;
use storage::SharedObjects;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Durable chat/message/session store.
    pub store: SharedStore,
    /// The relay engine driving upstream generations.
    pub relay: Arc<Relay>,
    /// Bearer-token identity resolution.
    pub identity: SharedIdentity,
    /// Attachment blob access.
    pub objects: SharedObjects,
    /// Broadcast bus for row changes and session progress.
    pub notifier: Notifier,
    /// Model allow-list and substitution default.
    pub models: Arc<ModelCatalog>,
    /// Upstream driver, absent when no API key is configured.
    pub driver: Option<SharedDriver>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"AppConfig")
            .field("store", &"ChatStore")
            .field("relay", &"Relay")
            .field("identity", &"IdentityProvider")
            .field("objects", &"ObjectStore")
            .field("models", &self.models)
            .field("driver", &self.driver.is_some())
            .finish()
    }
}
