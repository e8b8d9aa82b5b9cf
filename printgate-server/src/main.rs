//! printgate-server: gateway between a print dashboard and Repetier Server
//!
//! This server sits between browser dashboards and the printer server:
//! - Holds one upstream session and renews it when the server rejects it
//! - Exposes printer operations as JSON routes
//! - Streams printer state to each connected observer over WebSocket

mod handlers;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use printgate_core::{BroadcastScheduler, Config, PrinterClient};

use crate::handlers::SharedState;
use crate::state::AppState;

/// Largest G-code upload accepted
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "printgate_server=debug,printgate_core=debug,tower_http=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration; a bad value must not fall back to another identity
    let config = Config::load().context("Invalid configuration")?;

    tracing::info!("Repetier Server endpoint: {}", config.upstream.endpoint());
    if !config.upstream.credentials().has_login() {
        tracing::warn!("No upstream login configured, requests use the API key only");
    }

    let client = PrinterClient::from_config(&config.upstream)?;

    // Create shared application state
    let state = Arc::new(AppState::new(
        client.clone(),
        config.server.poll_interval(),
        config.server.allowed_origin.clone(),
    ));

    let app = build_router(Arc::clone(&state));

    // Start server; failing to bind is fatal
    let addr = SocketAddr::from((
        config.server.listen_addr.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("printgate-server listening on {}", addr);
    tracing::info!("Observer feed available on ws://{}/ws", addr);

    // Authenticate with the upstream server at startup
    tokio::spawn(async move {
        if client.authenticate().await {
            tracing::info!("Upstream session established");
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.scheduler.clone()))
        .await?;

    tracing::info!("printgate-server stopped");
    Ok(())
}

pub(crate) fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(handlers::root_handler))
        .route("/health", get(handlers::health_handler))
        .route("/ws", get(handlers::ws_handler))
        .route("/api/status", get(handlers::status_handler))
        .route("/api/printers", get(handlers::printers_handler))
        .route("/api/jobs", get(handlers::jobs_handler))
        .route("/api/models", get(handlers::models_handler))
        .route("/api/models/{id}", get(handlers::model_info_handler))
        .route("/api/logs", get(handlers::logs_handler))
        .route("/api/print/{id}", post(handlers::print_handler))
        .route("/api/stop", post(handlers::stop_handler))
        .route("/api/pause", post(handlers::pause_handler))
        .route("/api/resume", post(handlers::resume_handler))
        .route("/api/home", post(handlers::home_handler))
        .route(
            "/api/temperature/extruder",
            post(handlers::extruder_temperature_handler),
        )
        .route("/api/temperature/bed", post(handlers::bed_temperature_handler))
        .route("/api/gcode", post(handlers::gcode_handler))
        .route(
            "/api/upload/{filename}",
            post(handlers::upload_handler).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Resolve on Ctrl-C after stopping every observer loop, so open feeds close
async fn shutdown_signal(scheduler: BroadcastScheduler) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }

    tracing::info!("Shutdown signal received");
    scheduler.shutdown().await;
}
