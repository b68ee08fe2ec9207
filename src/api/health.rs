//! Liveness and readiness probes.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
}

/// Liveness: the process is up and serving.
async fn health() -> Json<Health> {
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Serialize)]
struct Readiness {
    status: &'static str,
    database: bool,
    upstream_configured: bool,
}

/// Readiness: the store answers and an upstream driver exists. Without
/// a driver every relay call fails closed, so traffic should not be
/// routed here yet.
async fn ready(State(state): State<AppState>) -> Json<Readiness> {
    let database = state.store.get_chat("readiness-probe").await.is_ok();
    let upstream_configured = state.driver.is_some();
    Json(Readiness {
        status: if database && upstream_configured {
            "ready"
        } else {
            "degraded"
        },
        database,
        upstream_configured,
    })
}
