//! HTTP control endpoint.
//!
//! `PUT /vnet/{key}` with the new value as body applies a setting through
//! [`Event::apply`] and answers `1`, the reply a Redis `HSET` of a new
//! field gives. A leading `vnet.` on the key is accepted and stripped.
//! `GET /health` and `GET /metrics` serve liveness and Prometheus text.

use crate::error::{Result, SettingError, VnetdError};
use crate::event::Event;
use crate::metrics::MetricsCollector;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Key prefix stripped from incoming settings.
pub const KEY_PREFIX: &str = "vnet.";

/// Shared handler state.
#[derive(Clone)]
pub struct ControlState {
    pub event: Event,
    pub metrics: Arc<MetricsCollector>,
}

/// HTTP status for a failed setting.
pub fn status_for(error: &SettingError) -> StatusCode {
    match error {
        SettingError::Validation { .. } | SettingError::UnknownSetting { .. } => {
            StatusCode::BAD_REQUEST
        }
        SettingError::UnknownInterface(_) => StatusCode::NOT_FOUND,
        SettingError::Platform(_) => StatusCode::BAD_GATEWAY,
        SettingError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub async fn put_setting(
    State(state): State<ControlState>,
    Path(key): Path<String>,
    value: String,
) -> (StatusCode, String) {
    let key = key.strip_prefix(KEY_PREFIX).unwrap_or(&key);
    let value = value.trim();
    debug!(key, value, "control request");
    match state.event.apply(key, value).await {
        Ok(()) => (StatusCode::OK, "1".to_string()),
        Err(e) => (status_for(&e), e.to_string()),
    }
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn metrics(State(state): State<ControlState>) -> String {
    state.metrics.gather_metrics()
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/vnet/{key}", put(put_setting))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Binds the control listener.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| VnetdError::Configuration(format!("Failed to bind to {}: {}", addr, e)))
}

/// Serves until `shutdown` fires.
pub async fn serve(listener: TcpListener, state: ControlState, shutdown: CancellationToken) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Control server listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("Control server stopped");
    Ok(())
}
