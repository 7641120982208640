use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use eyre::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::health::HealthStatus;
use crate::metrics::Metrics;
use crate::shutdown::Shutdown;
use crate::spawn_service::spawn_service;

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

#[derive(Clone)]
struct AppState {
    health: HealthStatus,
    metrics: Arc<Metrics>,
}

fn router(health: HealthStatus, metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/drainz", get(drainz_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(AppState { health, metrics })
}

/// Serve health endpoints and metrics until shutdown. Returns the bound address.
pub async fn start_server(
    bind: SocketAddr,
    health: HealthStatus,
    metrics: Arc<Metrics>,
    shutdown: &Shutdown,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    let local_addr = listener.local_addr()?;
    info!("listening {}", local_addr);

    let app = router(health, metrics);
    spawn_service(shutdown, "http", {
        let shutdown = shutdown.clone();

        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown.wait_shutdown_triggered().await;
                })
                .await?;
            Ok(())
        }
    })?;

    Ok(local_addr)
}

async fn healthz_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "Ok")
}

async fn readyz_handler(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.health.is_ready() {
        (StatusCode::OK, "Ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Drain in progress")
    }
}

async fn drainz_handler(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.health.is_drained() {
        (StatusCode::SERVICE_UNAVAILABLE, "Instance is drained")
    } else {
        (StatusCode::OK, "Ok")
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => ([(CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], body).into_response(),
        Err(err) => {
            error!(?err, "unable to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
