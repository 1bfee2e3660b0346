use axum::extract::State;
use axum::http::StatusCode;

use crate::AppState;

pub mod ws;

pub async fn health() -> &'static str {
    "ok"
}

/// GET /metrics: Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> Result<String, (StatusCode, &'static str)> {
    state.metrics.render().map_err(|e| {
        tracing::error!("render metrics: {:?}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, "Failed to render metrics")
    })
}
