use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use std::sync::Arc;

use px_engine::registry::DeploymentSpec;

use super::state::ApiState;
use super::types::{CreateDeploymentRequest, ListQuery, RollbackRequest, UpdateDeploymentRequest};
use crate::api_error::ApiError;
use crate::auth::{require_role, Claims};

/// POST /api/v1/pipelines/deployments
pub(crate) async fn create_deployment(
    State(state): State<Arc<ApiState>>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateDeploymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&claims, "operator")?;
    let (deployment, version) = state
        .registry
        .create(
            DeploymentSpec {
                name: req.name,
                pipeline_template: req.pipeline_template,
                namespace: req.namespace,
                target_nodes: req.target_nodes,
                parameters: req.parameters,
            },
            &claims.sub,
            None,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "deployment": deployment,
            "version": version,
        })),
    ))
}

/// GET /api/v1/pipelines/deployments
pub(crate) async fn list_deployments(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let deployments = state
        .store
        .list_deployments(
            query.include_deleted,
            query.limit.unwrap_or(50),
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(deployments))
}

/// GET /api/v1/pipelines/deployments/{id}
pub(crate) async fn get_deployment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment = state
        .store
        .get_deployment(&id, false)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("deployment {id}")))?;
    Ok(Json(deployment))
}

/// PATCH /api/v1/pipelines/deployments/{id} -- appends a new version.
pub(crate) async fn update_deployment(
    State(state): State<Arc<ApiState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(req): Json<UpdateDeploymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&claims, "operator")?;
    let current = state
        .store
        .get_deployment(&id, false)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("deployment {id}")))?;
    let spec = DeploymentSpec {
        name: req.name.unwrap_or(current.name),
        pipeline_template: req.pipeline_template.unwrap_or(current.pipeline_template),
        namespace: req.namespace.unwrap_or(current.namespace),
        target_nodes: req.target_nodes.unwrap_or(current.target_nodes),
        parameters: req.parameters.unwrap_or(current.parameters),
    };
    let (deployment, version) = state
        .registry
        .update(&id, spec, &claims.sub, req.note)
        .await?;
    Ok(Json(serde_json::json!({
        "deployment": deployment,
        "version": version,
    })))
}

/// DELETE /api/v1/pipelines/deployments/{id} -- soft delete.
pub(crate) async fn delete_deployment(
    State(state): State<Arc<ApiState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&claims, "operator")?;
    let deployment = state.registry.soft_delete(&id).await?;
    Ok(Json(serde_json::json!({
        "status": "deleted",
        "deployment": deployment,
    })))
}

/// POST /api/v1/pipelines/deployments/{id}/rollback
pub(crate) async fn rollback_deployment(
    State(state): State<Arc<ApiState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(req): Json<RollbackRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&claims, "operator")?;
    let (deployment, version) = state
        .registry
        .rollback(&id, req.target_version, &claims.sub, req.note)
        .await?;
    Ok(Json(serde_json::json!({
        "deployment": deployment,
        "version": version,
    })))
}

/// GET /api/v1/pipelines/deployments/{id}/versions -- newest first.
pub(crate) async fn list_versions(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let versions = state.registry.list_versions(&id).await?;
    Ok(Json(versions))
}

/// GET /api/v1/pipelines/deployments/{id}/config -- the active snapshot.
pub(crate) async fn get_active_config(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let config = state.registry.get_active_config(&id).await?;
    Ok(Json(config))
}
