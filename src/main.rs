//! Estuary - Main Entry Point
//!
//! Chat relay between a web client and an upstream LLM provider:
//! durable conversations, typed SSE streaming, and disconnect-proof
//! reply persistence.

use clap::Parser;
use mimalloc::MiMalloc;

use estuary::config::AppConfig;
use estuary::logging;
use estuary::server::create_app;

// Use mimalloc for better performance
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "estuary")]
#[command(about = "Estuary - chat relay service")]
#[command(version)]
struct Args {
    /// Host to bind to (overrides config).
    #[arg(long, env = "ESTUARY_HOST")]
    host: Option<String>,

    /// Port to listen on (overrides config).
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level used when RUST_LOG is unset (overrides config).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Config loads before tracing so its logging section can shape the
    // subscriber; load failures print through anyhow's reporter.
    let mut config = AppConfig::load()?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.json_logs {
        config.logging.json = true;
    }
    logging::init_tracing(&config.logging);

    tracing::info!("Starting estuary v{}", env!("CARGO_PKG_VERSION"));

    let addr = config.bind_addr();
    let app = create_app(config).await?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Estuary stopped cleanly");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM; axum then drains open connections.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl+C received, draining"),
        _ = terminate => tracing::info!("SIGTERM received, draining"),
    }
}
