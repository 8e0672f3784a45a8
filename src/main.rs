use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use taskmaster_core::config::Config;
use taskmaster_core::Core;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    core: Arc<Core>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter("taskmaster_core=debug,taskmaster_daemon=debug,info")
        .init();

    info!("Starting taskmaster orchestration daemon");

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!("Configuration loaded: {}", config.summary());

    let http_port = config.http_port;
    let core = Arc::new(Core::new(config));

    if let Ok(snapshot_path) = std::env::var("SNAPSHOT_PATH") {
        match core.restore_from_path(&snapshot_path).await {
            Ok(count) => info!("Restored {} work items from {}", count, snapshot_path),
            Err(e) => info!("No snapshot restored from {}: {}", snapshot_path, e),
        }
    }

    let handles = core.spawn_background_loops();
    let state = AppState { core: core.clone() };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let port = std::env::var("PORT").unwrap_or_else(|_| http_port.to_string());
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().expect("invalid bind address");
    let listener = tokio::net::TcpListener::bind(&addr).await.expect("failed to bind http listener");
    info!("taskmaster daemon listening on http://{}", addr);

    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = serve.await {
        error!("http server exited with an error: {}", e);
    }

    core.shutdown(handles).await;

    if let Ok(snapshot_path) = std::env::var("SNAPSHOT_PATH") {
        if let Err(e) = core.snapshot_to_path(&snapshot_path).await {
            error!("Failed to write snapshot to {}: {}", snapshot_path, e);
        }
    }
}

/// Health check endpoint: liveness plus the metrics snapshot (§4.J).
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.core.metrics_snapshot().await;
    Json(serde_json::json!({
        "status": "healthy",
        "service": "taskmaster-daemon",
        "timestamp": chrono::Utc::now(),
        "metrics": snapshot,
    }))
}

/// Prometheus text exposition (§4.J).
async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.core.metrics_text())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining in-flight work");
}
