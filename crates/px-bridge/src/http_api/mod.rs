// ---------------------------------------------------------------------------
// HTTP API module directory
// ---------------------------------------------------------------------------
//
// Domain-oriented handler modules wired together here. This file owns the
// Axum router and the middleware stack; `state` owns the aggregate the
// handlers work against.

mod agent_api;
mod agents;
mod auth_api;
mod deployments;
mod experiments;
mod misc;
mod pipelines;
pub mod state;
pub mod types;
mod websocket;

pub use state::ApiState;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Extension, Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;

use px_telemetry::middleware::{metrics_middleware, request_id_middleware};

use crate::auth::AuthLayer;

/// Build the full `/api/v1` router: REST resources, the agent protocol,
/// auth endpoints, the WebSocket upgrade, and the middleware stack
/// (metrics, request ids, JWT auth, CORS).
pub fn api_router(state: Arc<ApiState>) -> Router {
    let auth_layer = AuthLayer::new(state.authority.clone(), state.store.clone());
    let allowed_origins = state.config.server.allowed_origins.clone();
    let metrics = state.metrics.clone();
    let request_timeout = Duration::from_secs(state.config.server.request_timeout_secs.max(1));

    Router::new()
        // Health (unauthenticated)
        .route("/api/v1/health", get(misc::health))
        // Auth
        .route("/api/v1/auth/login", post(auth_api::login))
        .route("/api/v1/auth/refresh", post(auth_api::refresh))
        .route("/api/v1/auth/logout", post(auth_api::logout))
        // Experiments
        .route(
            "/api/v1/experiments",
            get(experiments::list_experiments).post(experiments::create_experiment),
        )
        .route(
            "/api/v1/experiments/{id}",
            get(experiments::get_experiment)
                .patch(experiments::update_experiment)
                .delete(experiments::delete_experiment),
        )
        .route(
            "/api/v1/experiments/{id}/start",
            post(experiments::start_experiment),
        )
        .route(
            "/api/v1/experiments/{id}/stop",
            post(experiments::stop_experiment),
        )
        .route(
            "/api/v1/experiments/{id}/promote",
            post(experiments::promote_experiment),
        )
        .route(
            "/api/v1/experiments/{id}/rollback",
            post(experiments::rollback_experiment),
        )
        .route(
            "/api/v1/experiments/{id}/status",
            get(experiments::experiment_status),
        )
        .route(
            "/api/v1/experiments/{id}/metrics",
            get(experiments::experiment_metrics),
        )
        // Pipeline deployments
        .route(
            "/api/v1/pipelines/deployments",
            get(deployments::list_deployments).post(deployments::create_deployment),
        )
        .route(
            "/api/v1/pipelines/deployments/{id}",
            get(deployments::get_deployment)
                .patch(deployments::update_deployment)
                .delete(deployments::delete_deployment),
        )
        .route(
            "/api/v1/pipelines/deployments/{id}/rollback",
            post(deployments::rollback_deployment),
        )
        .route(
            "/api/v1/pipelines/deployments/{id}/versions",
            get(deployments::list_versions),
        )
        .route(
            "/api/v1/pipelines/deployments/{id}/config",
            get(deployments::get_active_config),
        )
        // Pipeline tooling
        .route("/api/v1/pipelines/templates", get(pipelines::list_templates))
        .route("/api/v1/pipelines/validate", post(pipelines::validate_pipeline))
        .route("/api/v1/pipelines/render", post(pipelines::render_pipeline))
        // Agent registry (operator-facing)
        .route("/api/v1/agents", get(agents::list_agents))
        .route("/api/v1/agents/{host_id}/tasks", get(agents::list_agent_tasks))
        // Agent protocol (X-Agent-Host-ID auth)
        .route("/api/v1/agent/tasks/poll", post(agent_api::poll_task))
        .route(
            "/api/v1/agent/tasks/{id}/heartbeat",
            post(agent_api::heartbeat_task),
        )
        .route(
            "/api/v1/agent/tasks/{id}/status",
            post(agent_api::report_status),
        )
        .route("/api/v1/agent/heartbeat", post(agent_api::agent_heartbeat))
        .route("/api/v1/agent/metrics", post(agent_api::report_metrics))
        // WebSocket
        .route("/api/v1/ws", get(websocket::ws_handler))
        // Middleware (innermost first)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(axum_middleware::from_fn(metrics_middleware))
        .layer(Extension(metrics))
        .layer(axum_middleware::from_fn(request_id_middleware))
        .layer(auth_layer)
        .layer(cors_layer(allowed_origins))
        .with_state(state)
}

fn cors_layer(allowed_origins: Vec<String>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::predicate(
            move |origin: &axum::http::HeaderValue, _| {
                let Ok(origin) = origin.to_str() else {
                    return false;
                };
                origin.starts_with("http://localhost")
                    || origin.starts_with("http://127.0.0.1")
                    || allowed_origins.iter().any(|allowed| origin == allowed)
            },
        ))
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
            axum::http::Method::PATCH,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ])
}
