//! secbox orchestrator - disposable security-tooling container service
//!
//! This is the main entry point for the secbox orchestrator service.
//! It manages the tooling container and serves the REST and WebSocket API.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::HeaderName;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use secbox_orchestrator::api::{create_router, handlers::health::mark_started};
use secbox_orchestrator::config::AppConfig;
use secbox_orchestrator::container::{ContainerEngine, DockerEngine};
use secbox_orchestrator::logging::init_logging;
use secbox_orchestrator::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::load()?;

    // Initialize logging
    let log_path = init_logging(&config.log_level, &config.log_dir)?;
    mark_started();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        "Starting secbox orchestrator"
    );

    // Initialize metrics system
    if config.metrics.enabled {
        secbox_orchestrator::metrics::init_metrics()?;
        info!("Prometheus metrics initialized");
    }

    // Connect to the container engine
    let engine = DockerEngine::connect(
        config.docker_socket.as_deref(),
        config.container.stop_timeout_seconds,
    )
    .context("Failed to connect to container engine")?;

    match engine.version().await {
        Ok(version) => info!(engine_version = %version, "Container engine connected"),
        Err(e) => warn!(error = %e, "Container engine not reachable yet; requests will fail until it is"),
    }

    // Create shared application state
    let state = Arc::new(AppState::new(config.clone(), Arc::new(engine)));

    // Build the router with all routes and middleware
    let x_request_id = HeaderName::from_static("x-request-id");
    let app = create_router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Bind to address
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(%addr, terminal_path = %config.terminal.path, "Listening");

    // Start server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down...");

    if state.tasks.current_status().await.is_active() {
        if let Err(e) = state.tasks.stop().await {
            warn!(error = %e, "Failed to stop background task");
        }
    }

    if config.stop_container_on_shutdown {
        warn!(container = %config.container.name, "Stopping managed container...");
        if let Err(e) = state
            .container_manager
            .stop(&config.container.name, config.container.remove_on_stop)
            .await
        {
            error!(error = %e, "Failed to stop container");
        }
    }

    info!("secbox orchestrator stopped");
    Ok(())
}

/// Handle shutdown signals gracefully
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
