#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use tower::ServiceExt;

use px_bridge::http_api::{api_router, ApiState};
use px_core::config::{AuthConfig, Config, UserEntry};
use px_core::store::Store;
use px_engine::shutdown::ShutdownSignal;

/// State with auth in development mode (no key material -> admin).
pub async fn dev_state() -> Arc<ApiState> {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    ApiState::build(Config::default(), store, ShutdownSignal::new()).unwrap()
}

/// State with an HS256 secret and one operator + one viewer account.
pub async fn secured_state(secret: &str) -> Arc<ApiState> {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let config = Config {
        auth: AuthConfig {
            jwt_secret: secret.into(),
            users: vec![
                UserEntry {
                    username: "alice".into(),
                    password: "hunter2".into(),
                    roles: vec!["operator".into()],
                },
                UserEntry {
                    username: "bob".into(),
                    password: "view-only".into(),
                    roles: vec!["viewer".into()],
                },
            ],
            ..AuthConfig::default()
        },
        ..Config::default()
    };
    ApiState::build(config, store, ShutdownSignal::new()).unwrap()
}

pub fn app(state: Arc<ApiState>) -> Router {
    api_router(state)
}

pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response: Response<Body> = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

pub fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

pub fn post_json(path: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn patch_json(path: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("PATCH")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn delete(path: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(path)
        .body(Body::empty())
        .unwrap()
}

/// Agent-authenticated POST.
pub fn agent_post(path: &str, host_id: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header("X-Agent-Host-ID", host_id)
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn experiment_body() -> serde_json::Value {
    serde_json::json!({
        "name": "cut-cardinality",
        "baseline_pipeline": "process-baseline-v1",
        "candidate_pipeline": "process-topk-v1",
        "target_hosts": ["h1", "h2"],
        "duration_secs": 60,
        "success_criteria": {"min_cardinality_reduction": 50.0},
        "parameters": {
            "COLLECTION_INTERVAL": "10s",
            "METRICS_ENDPOINT": "http://pushgateway:9091"
        }
    })
}

pub fn deployment_body(name: &str, template: &str) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "pipeline_template": template,
        "target_nodes": ["h1"],
        "parameters": {
            "COLLECTION_INTERVAL": "10s",
            "METRICS_ENDPOINT": "http://pushgateway:9091"
        }
    })
}
