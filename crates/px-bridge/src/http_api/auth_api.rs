use axum::{extract::State, response::IntoResponse, Extension, Json};
use std::sync::Arc;

use super::state::ApiState;
use super::types::{LoginRequest, TokenResponse};
use crate::api_error::ApiError;
use crate::auth::Claims;

/// POST /api/v1/auth/login -- exchange configured operator credentials
/// for a JWT.
pub(crate) async fn login(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(user) = state.authority.authenticate(&req.username, &req.password) else {
        return Err(ApiError::unauthorized("invalid credentials"));
    };
    let roles = user.roles.clone();
    let (token, claims) = state.authority.issue(&user.username, roles.clone())?;
    tracing::info!(user = %claims.sub, "login");
    Ok(Json(TokenResponse {
        token,
        expires_at: claims.expires_at(),
        roles,
    }))
}

/// POST /api/v1/auth/refresh -- re-issue for a still-valid token; the old
/// `jti` is revoked so the previous token cannot outlive the exchange.
pub(crate) async fn refresh(
    State(state): State<Arc<ApiState>>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let (token, new_claims) = state
        .authority
        .issue(&claims.sub, claims.roles.clone())?;
    state
        .store
        .revoke_token(&claims.jti, claims.expires_at())
        .await?;
    Ok(Json(TokenResponse {
        token,
        expires_at: new_claims.expires_at(),
        roles: new_claims.roles,
    }))
}

/// POST /api/v1/auth/logout -- revoke the presented token's `jti`.
pub(crate) async fn logout(
    State(state): State<Arc<ApiState>>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .store
        .revoke_token(&claims.jti, claims.expires_at())
        .await?;
    tracing::info!(user = %claims.sub, jti = %claims.jti, "logout");
    Ok(Json(serde_json::json!({"status": "logged_out"})))
}
