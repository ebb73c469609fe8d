//! Agent protocol endpoints: long-poll task acquisition, heartbeats, and
//! status/metric ingestion. Authenticated by `X-Agent-Host-ID`, not JWT.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use std::time::Duration;

use px_core::bus::{topics, Event};
use px_core::types::{AgentStatus, CollectorInfo};
use px_core::CoreError;

use super::state::ApiState;
use super::types::{
    AgentHeartbeatRequest, AgentHeartbeatResponse, LeasedTaskResponse, PollRequest, ReportMetricsRequest,
    ReportPhase, ReportStatusRequest, TaskLeaseAck,
};
use crate::agent_auth::AgentIdentity;
use crate::api_error::ApiError;

const MAX_POLL_WAIT_SECS: u64 = 60;

/// Refresh the agent row; announce the unregistered/offline -> online
/// transition exactly once.
async fn touch(
    state: &ApiState,
    host_id: &str,
    capabilities: Option<Vec<String>>,
    collector_info: Option<CollectorInfo>,
) -> Result<(), CoreError> {
    let (agent, prior) = state
        .store
        .touch_agent(host_id, capabilities, collector_info)
        .await?;
    if !matches!(prior, Some(AgentStatus::Online)) {
        state.bus.publish(Event::new(
            topics::AGENT_ONLINE,
            serde_json::json!({"host_id": agent.host_id, "hostname": agent.hostname}),
        ));
    }
    Ok(())
}

/// POST /api/v1/agent/tasks/poll -- long-poll for the next task.
///
/// `204 No Content` on timeout, `200` with the task on a hit. Every poll
/// refreshes the agent's heartbeat and marks it online.
pub(crate) async fn poll_task(
    State(state): State<Arc<ApiState>>,
    identity: AgentIdentity,
    Json(req): Json<PollRequest>,
) -> Result<impl IntoResponse, ApiError> {
    touch(&state, &identity.host_id, Some(req.capabilities.clone()), None).await?;

    let wait = Duration::from_secs(req.wait_seconds.min(MAX_POLL_WAIT_SECS));
    let leased = state
        .queue
        .lease(&identity.host_id, &req.capabilities, wait)
        .await?;
    match leased {
        Some(task) => Ok(Json(LeasedTaskResponse::from(task)).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// POST /api/v1/agent/tasks/{id}/heartbeat -- extend one task lease.
pub(crate) async fn heartbeat_task(
    State(state): State<Arc<ApiState>>,
    identity: AgentIdentity,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.queue.heartbeat(&task_id, &identity.host_id).await?;
    Ok(Json(serde_json::json!({
        "task_id": task.id,
        "lease_expires_at": task.lease_expires_at,
    })))
}

/// POST /api/v1/agent/tasks/{id}/status -- report progress or a terminal
/// outcome. `in_progress` only refreshes the lease.
pub(crate) async fn report_status(
    State(state): State<Arc<ApiState>>,
    identity: AgentIdentity,
    Path(task_id): Path<String>,
    Json(req): Json<ReportStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    touch(&state, &identity.host_id, None, None).await?;
    let task = match req.phase {
        ReportPhase::InProgress => state.queue.heartbeat(&task_id, &identity.host_id).await?,
        ReportPhase::Succeeded => {
            let task = state
                .queue
                .complete(&task_id, &identity.host_id, req.result)
                .await?;
            state.engine.handle_task_update(&task).await?;
            task
        }
        ReportPhase::Failed => {
            let error = req.error.as_deref().unwrap_or("agent reported failure");
            let task = state
                .queue
                .fail(&task_id, &identity.host_id, error, req.retriable)
                .await?;
            state.engine.handle_task_update(&task).await?;
            task
        }
    };
    Ok(Json(serde_json::json!({
        "task_id": task.id,
        "status": task.status,
        "attempts": task.attempts,
    })))
}

/// POST /api/v1/agent/heartbeat -- agent-level heartbeat; refreshes each
/// listed task lease with per-task outcomes (partial success).
pub(crate) async fn agent_heartbeat(
    State(state): State<Arc<ApiState>>,
    identity: AgentIdentity,
    Json(req): Json<AgentHeartbeatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    touch(
        &state,
        &identity.host_id,
        req.capabilities.clone(),
        req.collector_info.clone(),
    )
    .await?;

    let mut acks = Vec::with_capacity(req.task_ids.len());
    for task_id in &req.task_ids {
        match state.queue.heartbeat(task_id, &identity.host_id).await {
            Ok(task) => acks.push(TaskLeaseAck {
                task_id: task.id,
                ok: true,
                error: None,
                lease_expires_at: task.lease_expires_at,
            }),
            Err(err @ (CoreError::LeaseLost { .. } | CoreError::NotFound(_))) => {
                acks.push(TaskLeaseAck {
                    task_id: task_id.clone(),
                    ok: false,
                    error: Some(err.to_string()),
                    lease_expires_at: None,
                })
            }
            Err(err) => return Err(ApiError(err)),
        }
    }
    Ok(Json(AgentHeartbeatResponse {
        host_id: identity.host_id,
        tasks: acks,
    }))
}

/// POST /api/v1/agent/metrics -- batch sample ingestion.
pub(crate) async fn report_metrics(
    State(state): State<Arc<ApiState>>,
    identity: AgentIdentity,
    Json(req): Json<ReportMetricsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    touch(&state, &identity.host_id, None, None).await?;
    let samples = req
        .samples
        .into_iter()
        .map(|body| body.into_sample(&identity.host_id))
        .collect();
    let (accepted, rejected) = state.engine.record_metrics(&identity.host_id, samples).await?;
    Ok(Json(serde_json::json!({
        "accepted": accepted,
        "rejected": rejected,
    })))
}
