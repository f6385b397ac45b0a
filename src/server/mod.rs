//! Translation server
//!
//! This module provides the HTTP server with:
//! - Streaming translation over WebSocket at /ws/translate
//! - One-shot translation at /api/translate
//! - Model switching at /api/model/switch
//! - Status and language discovery at /api/status and /api/languages

use anyhow::{Context, Result};
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

pub mod middleware;
pub mod orchestrator;
pub mod routes;
pub mod state;

use crate::api::HealthResponse;
use state::ServerState;

/// Create the main application router
pub fn create_app(state: ServerState) -> Router {
    let cors_config = state.config.server.cors.clone();
    let timeout_duration = Duration::from_secs(state.config.server.request_timeout_secs);

    let mut app = Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .merge(routes::translate::create_router())
        .merge(routes::status::create_router())
        .merge(routes::models::create_router())
        // Upgraded sockets outlive the request, so the timeout only bounds REST calls
        .layer(TimeoutLayer::new(timeout_duration))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Add CORS middleware if enabled (should be outermost)
    if cors_config.enabled {
        app = app.layer(middleware::cors_layer(&cors_config));
    }

    app
}

/// Health check endpoint
pub async fn health_check(State(state): State<ServerState>) -> impl IntoResponse {
    Json(HealthResponse::healthy(state.metrics.snapshot()))
}

/// Run the server until SIGINT/SIGTERM, then release the model.
pub async fn start_server(state: ServerState) -> Result<()> {
    let addr = state.config.listen_addr();
    let host = state.model_host.clone();
    let _preload = state.preload();
    let app = create_app(state);

    let listener = TcpListener::bind(addr.as_str())
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Starting translation server on {}", addr);
    info!("Streaming translation available at ws://{}/ws/translate", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down, releasing model");
    host.unload();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
