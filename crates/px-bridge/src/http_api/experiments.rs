use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use std::sync::Arc;

use px_core::types::{ExperimentPhase, Variant};
use px_engine::analysis;
use px_engine::engine::{ExperimentPatch, NewExperiment};

use super::state::ApiState;
use super::types::{
    CreateExperimentRequest, ExperimentResponse, ExperimentStatusResponse, ListQuery, TaskCounts,
    UpdateExperimentRequest,
};
use crate::api_error::ApiError;
use crate::auth::{require_role, Claims};

/// POST /api/v1/experiments -- record a new A/B experiment.
pub(crate) async fn create_experiment(
    State(state): State<Arc<ApiState>>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateExperimentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&claims, "operator")?;
    let (experiment, warnings) = state
        .engine
        .create(NewExperiment {
            name: req.name,
            description: req.description,
            baseline_pipeline: req.baseline_pipeline,
            candidate_pipeline: req.candidate_pipeline,
            target_hosts: req.target_hosts,
            selectors: req.selectors,
            parameters: req.parameters,
            duration_secs: req.duration_secs,
            success_criteria: req.success_criteria.unwrap_or_default(),
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ExperimentResponse {
            experiment,
            warnings,
        }),
    ))
}

/// GET /api/v1/experiments -- list with optional phase filter and paging.
pub(crate) async fn list_experiments(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let phase = match query.phase.as_deref() {
        Some(raw) => Some(
            serde_json::from_value::<ExperimentPhase>(serde_json::Value::String(raw.into()))
                .map_err(|_| ApiError::bad_request("phase", format!("unknown phase `{raw}`")))?,
        ),
        None => None,
    };
    let experiments = state
        .store
        .list_experiments(phase, query.limit.unwrap_or(50), query.offset.unwrap_or(0))
        .await?;
    Ok(Json(experiments))
}

/// GET /api/v1/experiments/{id}
pub(crate) async fn get_experiment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let experiment = state
        .store
        .get_experiment(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("experiment {id}")))?;
    Ok(Json(experiment))
}

/// PATCH /api/v1/experiments/{id} -- pending experiments only.
pub(crate) async fn update_experiment(
    State(state): State<Arc<ApiState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(req): Json<UpdateExperimentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&claims, "operator")?;
    let experiment = state
        .engine
        .update(
            &id,
            ExperimentPatch {
                name: req.name,
                description: req.description,
                target_hosts: req.target_hosts,
                selectors: req.selectors,
                parameters: req.parameters,
                duration_secs: req.duration_secs,
                success_criteria: req.success_criteria,
            },
        )
        .await?;
    Ok(Json(experiment))
}

/// DELETE /api/v1/experiments/{id} -- cancels an in-flight experiment;
/// removes a pending or terminal one.
pub(crate) async fn delete_experiment(
    State(state): State<Arc<ApiState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&claims, "operator")?;
    let experiment = state
        .store
        .get_experiment(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("experiment {id}")))?;
    if !experiment.phase.is_terminal() && experiment.phase != ExperimentPhase::Pending {
        let cancelled = state.engine.cancel(&id).await?;
        return Ok(Json(serde_json::json!({
            "status": "cancelled",
            "experiment": cancelled,
        })));
    }
    state.engine.delete(&id).await?;
    Ok(Json(serde_json::json!({"status": "deleted", "id": id})))
}

/// POST /api/v1/experiments/{id}/start
pub(crate) async fn start_experiment(
    State(state): State<Arc<ApiState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&claims, "operator")?;
    let experiment = state.engine.start(&id).await?;
    Ok(Json(experiment))
}

/// POST /api/v1/experiments/{id}/stop -- early stop into analysis.
pub(crate) async fn stop_experiment(
    State(state): State<Arc<ApiState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&claims, "operator")?;
    let experiment = state.engine.stop(&id).await?;
    Ok(Json(experiment))
}

/// POST /api/v1/experiments/{id}/promote
pub(crate) async fn promote_experiment(
    State(state): State<Arc<ApiState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&claims, "operator")?;
    let experiment = state.engine.promote(&id, &claims.sub).await?;
    Ok(Json(experiment))
}

/// POST /api/v1/experiments/{id}/rollback
pub(crate) async fn rollback_experiment(
    State(state): State<Arc<ApiState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&claims, "operator")?;
    let experiment = state.engine.rollback(&id, &claims.sub).await?;
    Ok(Json(experiment))
}

/// GET /api/v1/experiments/{id}/status -- phase plus task tallies.
pub(crate) async fn experiment_status(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let experiment = state
        .store
        .get_experiment(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("experiment {id}")))?;
    let tasks = state.store.list_tasks_for_experiment(&id).await?;
    Ok(Json(ExperimentStatusResponse {
        experiment_id: experiment.id,
        phase: experiment.phase,
        started_at: experiment.started_at,
        completed_at: experiment.completed_at,
        failure_reason: experiment.failure_reason,
        tasks: TaskCounts::tally(&tasks),
    }))
}

/// GET /api/v1/experiments/{id}/metrics -- stored results when terminal,
/// live per-variant aggregates otherwise.
pub(crate) async fn experiment_metrics(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let experiment = state
        .store
        .get_experiment(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("experiment {id}")))?;
    let baseline = state.store.list_metric_samples(&id, Variant::Baseline).await?;
    let candidate = state
        .store
        .list_metric_samples(&id, Variant::Candidate)
        .await?;
    Ok(Json(serde_json::json!({
        "experiment_id": experiment.id,
        "results": experiment.results,
        "live": {
            "baseline": analysis::summarize(&baseline),
            "candidate": analysis::summarize(&candidate),
        },
    })))
}
