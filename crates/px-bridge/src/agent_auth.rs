//! Agent identity extraction.
//!
//! Agents authenticate with the `X-Agent-Host-ID` header; the value IS the
//! identity (network trust model — TLS/mTLS terminates in front of the
//! control plane). A missing or empty header is rejected before any
//! handler runs.

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::api_error::ApiError;

pub const AGENT_HOST_HEADER: &str = "x-agent-host-id";

/// Extractor for the authenticated agent identity.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub host_id: String,
}

impl<S> FromRequestParts<S> for AgentIdentity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let host_id = parts
            .headers
            .get(AGENT_HOST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .unwrap_or_default();
        if host_id.is_empty() {
            return Err(ApiError::unauthorized("X-Agent-Host-ID header required"));
        }
        Ok(AgentIdentity {
            host_id: host_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(req: Request<()>) -> Result<AgentIdentity, ApiError> {
        let (mut parts, _) = req.into_parts();
        AgentIdentity::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn present_header_is_identity() {
        let req = Request::builder()
            .header("X-Agent-Host-ID", "edge-7")
            .body(())
            .unwrap();
        let identity = extract(req).await.unwrap();
        assert_eq!(identity.host_id, "edge-7");
    }

    #[tokio::test]
    async fn missing_or_blank_header_is_unauthorized() {
        let req = Request::builder().body(()).unwrap();
        assert!(extract(req).await.is_err());

        let req = Request::builder()
            .header("X-Agent-Host-ID", "   ")
            .body(())
            .unwrap();
        assert!(extract(req).await.is_err());
    }
}
