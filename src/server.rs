//! HTTP server setup and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::api;
use crate::auth::{HttpIdentityProvider, SharedIdentity, StaticIdentityProvider};
use crate::config::AppConfig;
use crate::database::{SharedStore, SqliteStore};
use crate::llm::{OpenRouterClient, SharedDriver};
use crate::logging::{BootLog, Timed};
use crate::models::ModelCatalog;
use crate::notify::Notifier;
use crate::relay::Relay;
use crate::storage::{HttpObjectStore, SharedObjects};
use crate::AppState;

/// Estuary version (from Cargo.toml).
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create the application with all routes and middleware.
pub async fn create_app(config: AppConfig) -> anyhow::Result<Router> {
    tracing::info!("🚀 estuary v{}", VERSION);
    let mut boot = BootLog::new(6);

    let timed = Timed::start("sqlite init");
    let sqlite = SqliteStore::new(config.database.path.clone());
    let init_result = sqlite.init().await;
    timed.record(&init_result);
    init_result?;
    let store: SharedStore = Arc::new(sqlite);
    boot.phase(
        "Database",
        format!("🗄️  SQLite at {}", config.database.path.display()),
    );

    let models = Arc::new(ModelCatalog::new(
        config.models.allowed.clone(),
        config.models.default_model.clone(),
    ));
    boot.phase(
        "Models",
        format!(
            "{} allowed, default {}",
            models.entries().len(),
            models.default_model()
        ),
    );

    let driver: Option<SharedDriver> = match config.upstream_settings() {
        Some(settings) => {
            let client: SharedDriver = Arc::new(OpenRouterClient::new(settings)?);
            Some(client)
        }
        None => None,
    };
    if driver.is_some() {
        boot.phase("Upstream", "⚙️  OpenRouter ✓");
    } else {
        boot.warn("OPENROUTER_API_KEY is not set. Relay requests will fail.");
        boot.phase("Upstream", "⚙️  No API key ✗");
    }

    let identity: SharedIdentity = match &config.identity.endpoint {
        Some(endpoint) => {
            boot.phase("Identity", format!("🔐 verifier at {endpoint}"));
            Arc::new(HttpIdentityProvider::new(
                endpoint.clone(),
                config.identity.timeout_secs,
            )?)
        }
        None => {
            boot.phase(
                "Identity",
                format!("🔐 {} static tokens", config.identity.static_tokens.len()),
            );
            Arc::new(StaticIdentityProvider::from_config(
                &config.identity.static_tokens,
            ))
        }
    };

    let objects: SharedObjects = Arc::new(HttpObjectStore::new(
        config.upstream.connect_timeout_secs,
    )?);
    let notifier = Notifier::new();
    let relay = Arc::new(Relay::new(
        store.clone(),
        objects.clone(),
        notifier.clone(),
        models.clone(),
        driver.clone(),
    ));
    boot.phase("Relay", "stream engine ready");

    let state = AppState {
        config: Arc::new(config.clone()),
        store,
        relay,
        identity,
        objects,
        notifier,
        models,
        driver,
    };

    // The request timeout wraps only the prompt routes; relay and
    // update streams outlive any fixed deadline.
    let timed_routes = api::create_router().layer(TimeoutLayer::with_status_code(
        axum::http::StatusCode::REQUEST_TIMEOUT,
        Duration::from_secs(config.server.request_timeout_secs),
    ));
    let app = Router::new()
        .merge(timed_routes)
        .merge(api::create_streaming_router())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    boot.phase("Router", "🌐 routes + middleware configured");

    boot.finish();
    Ok(app)
}
