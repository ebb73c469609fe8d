use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use std::sync::Arc;

use super::state::ApiState;

/// GET /api/v1/health -- unauthenticated liveness probe.
pub(crate) async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let storage_ok = state.store.ping().await.is_ok();
    let status = if storage_ok { "ok" } else { "degraded" };
    let code = if storage_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(serde_json::json!({
            "status": status,
            "version": env!("CARGO_PKG_VERSION"),
            "storage": storage_ok,
            "uptime_secs": (chrono::Utc::now() - state.started_at).num_seconds(),
            "websocket_connections": state.hub.connection_count(),
        })),
    )
}
