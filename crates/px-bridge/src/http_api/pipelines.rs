use axum::{extract::State, response::IntoResponse, Json};
use std::sync::Arc;

use px_core::pipeline;

use super::state::ApiState;
use super::types::{RenderRequest, ValidateRequest};
use crate::api_error::ApiError;

/// GET /api/v1/pipelines/templates -- the built-in catalog.
pub(crate) async fn list_templates(State(_state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(pipeline::builtin_templates())
}

/// POST /api/v1/pipelines/validate
pub(crate) async fn validate_pipeline(
    State(_state): State<Arc<ApiState>>,
    Json(req): Json<ValidateRequest>,
) -> impl IntoResponse {
    Json(pipeline::validate(&req.config))
}

/// POST /api/v1/pipelines/render -- substitute `${NAME}` tokens into a
/// named template or an inline config.
pub(crate) async fn render_pipeline(
    State(_state): State<Arc<ApiState>>,
    Json(req): Json<RenderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let config = match (&req.template, req.config) {
        (Some(name), None) => {
            pipeline::find_template(name)
                .ok_or_else(|| {
                    ApiError::bad_request("template", format!("unknown template `{name}`"))
                })?
                .config
        }
        (None, Some(config)) => config,
        _ => {
            return Err(ApiError::bad_request(
                "template",
                "provide exactly one of `template` or `config`",
            ))
        }
    };
    let rendered = pipeline::render(&config, &req.variables)
        .map_err(|e| ApiError::bad_request("variables", e.to_string()))?;
    Ok(Json(rendered))
}
