use axum::{body::Body, extract::Request, middleware::Next, response::Response};
use tracing::Instrument;
use uuid::Uuid;

use crate::metrics::ApiMetrics;

/// Generate a request id (32 hex characters).
pub fn generate_request_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// Axum middleware that injects `X-Request-Id` headers and creates a
/// tracing span for each request.
///
/// If the incoming request already has an `X-Request-Id` header, that value
/// is reused; the response always carries the header for correlation.
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(generate_request_id);

    request.headers_mut().insert(
        "x-request-id",
        request_id
            .parse()
            .unwrap_or_else(|_| axum::http::HeaderValue::from_static("unknown")),
    );

    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %method,
        path = %path,
    );

    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Axum middleware layer that feeds [`ApiMetrics`].
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let metrics = request.extensions().get::<ApiMetrics>().cloned();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    if let Some(metrics) = metrics {
        metrics.observe(&path, response.status().as_u16());
    }
    response
}
