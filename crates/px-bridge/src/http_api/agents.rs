use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use std::sync::Arc;

use super::state::ApiState;
use super::types::AgentView;
use crate::api_error::ApiError;

/// GET /api/v1/agents -- the registry, with liveness derived at read time.
pub(crate) async fn list_agents(
    State(state): State<Arc<ApiState>>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let degraded = state.config.agents.degraded_after_secs as i64;
    let offline = state.config.agents.offline_after_secs as i64;
    let agents = state
        .store
        .list_agents()
        .await?
        .into_iter()
        .map(|agent| AgentView {
            derived_status: agent.derived_status(now, degraded, offline),
            agent,
        })
        .collect::<Vec<_>>();
    Ok(Json(agents))
}

/// GET /api/v1/agents/{host_id}/tasks -- everything targeted at or held
/// by a host.
pub(crate) async fn list_agent_tasks(
    State(state): State<Arc<ApiState>>,
    Path(host_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.store.get_agent(&host_id).await?.is_none() {
        return Err(ApiError::not_found(format!("agent {host_id}")));
    }
    let tasks = state.store.list_tasks_for_host(&host_id).await?;
    Ok(Json(tasks))
}
