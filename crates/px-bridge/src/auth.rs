//! JWT authentication for the operator-facing REST surface.
//!
//! Tokens are HS256 against the configured shared secret (or RS256 against
//! a configured public key, verification-only). Every request checks the
//! signature, expiry, and that the token's `jti` has not been revoked.
//! When no secret and no public key are configured, the layer runs in
//! development mode and waves requests through with an `admin` identity.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    http::{Request, Response},
    response::IntoResponse,
};
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tower::{Layer, Service};

use px_core::config::{AuthConfig, UserEntry};
use px_core::store::Store;
use px_core::{ids, CoreError};

use crate::api_error::ApiError;

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub jti: String,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role || r == "admin")
    }
}

/// Reject unless the authenticated principal carries `role` (or `admin`).
pub fn require_role(claims: &Claims, role: &str) -> Result<(), ApiError> {
    if claims.has_role(role) {
        Ok(())
    } else {
        Err(ApiError::forbidden(format!("role `{role}` required")))
    }
}

// ---------------------------------------------------------------------------
// TokenAuthority — issue and verify
// ---------------------------------------------------------------------------

pub struct TokenAuthority {
    encoding: Option<EncodingKey>,
    decoding: Option<DecodingKey>,
    algorithm: Algorithm,
    ttl_secs: u64,
    users: Vec<UserEntry>,
}

impl TokenAuthority {
    pub fn from_config(cfg: &AuthConfig) -> Result<Self, CoreError> {
        if let Some(pem) = &cfg.public_key_pem {
            let decoding = DecodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|e| CoreError::Internal(format!("invalid auth public key: {e}")))?;
            return Ok(Self {
                encoding: None,
                decoding: Some(decoding),
                algorithm: Algorithm::RS256,
                ttl_secs: cfg.token_ttl_secs,
                users: cfg.users.clone(),
            });
        }
        if cfg.jwt_secret.is_empty() {
            // Development mode: no verification material configured.
            return Ok(Self {
                encoding: None,
                decoding: None,
                algorithm: Algorithm::HS256,
                ttl_secs: cfg.token_ttl_secs,
                users: Vec::new(),
            });
        }
        Ok(Self {
            encoding: Some(EncodingKey::from_secret(cfg.jwt_secret.as_bytes())),
            decoding: Some(DecodingKey::from_secret(cfg.jwt_secret.as_bytes())),
            algorithm: Algorithm::HS256,
            ttl_secs: cfg.token_ttl_secs,
            users: cfg.users.clone(),
        })
    }

    /// `true` when no verification material is configured (dev mode).
    pub fn is_open(&self) -> bool {
        self.decoding.is_none()
    }

    /// Check a username/password pair against the configured users,
    /// comparing the password in constant time.
    pub fn authenticate(&self, username: &str, password: &str) -> Option<&UserEntry> {
        self.users.iter().find(|u| {
            u.username == username
                && bool::from(u.password.as_bytes().ct_eq(password.as_bytes()))
        })
    }

    /// Issue a fresh token for `sub` with the given roles.
    pub fn issue(&self, sub: &str, roles: Vec<String>) -> Result<(String, Claims), CoreError> {
        let Some(encoding) = &self.encoding else {
            return Err(CoreError::Unauthorized(
                "token issuance is not configured".into(),
            ));
        };
        let now = Utc::now();
        let claims = Claims {
            sub: sub.to_string(),
            roles,
            jti: ids::jwt_id(),
            exp: (now + chrono::Duration::seconds(self.ttl_secs as i64)).timestamp(),
            iat: now.timestamp(),
        };
        let token = encode(&Header::new(self.algorithm), &claims, encoding)
            .map_err(|e| CoreError::Internal(format!("token encoding failed: {e}")))?;
        Ok((token, claims))
    }

    /// Verify signature and expiry. Revocation is checked separately
    /// against the store.
    pub fn verify(&self, token: &str) -> Result<Claims, CoreError> {
        let Some(decoding) = &self.decoding else {
            return Err(CoreError::Unauthorized("no verification key".into()));
        };
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = true;
        decode::<Claims>(token, decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| CoreError::Unauthorized(format!("invalid token: {e}")))
    }
}

// ---------------------------------------------------------------------------
// AuthLayer
// ---------------------------------------------------------------------------

/// Route prefixes that bypass JWT auth: health is public, the agent
/// protocol authenticates by host identity, and login bootstraps tokens.
const PUBLIC_PREFIXES: [&str; 3] = ["/api/v1/health", "/api/v1/auth/login", "/api/v1/agent/"];

/// A [`tower::Layer`] that verifies bearer tokens and injects [`Claims`]
/// into request extensions.
#[derive(Clone)]
pub struct AuthLayer {
    authority: Arc<TokenAuthority>,
    store: Arc<Store>,
}

impl AuthLayer {
    pub fn new(authority: Arc<TokenAuthority>, store: Arc<Store>) -> Self {
        Self { authority, store }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            authority: self.authority.clone(),
            store: self.store.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    authority: Arc<TokenAuthority>,
    store: Arc<Store>,
}

/// Pull the bearer token from `Authorization` or, for WebSocket upgrades,
/// the `token` query parameter.
fn extract_token(req: &Request<Body>) -> Option<String> {
    if let Some(token) = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(token.to_string());
    }
    req.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("token=")
                .map(|value| value.to_string())
        })
    })
}

impl<S> Service<Request<Body>> for AuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let authority = self.authority.clone();
        let store = self.store.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let path = req.uri().path().to_string();
            if PUBLIC_PREFIXES.iter().any(|prefix| path.starts_with(prefix)) {
                return inner.call(req).await;
            }

            // Development mode: no key material, everyone is admin.
            if authority.is_open() {
                req.extensions_mut().insert(Claims {
                    sub: "dev".into(),
                    roles: vec!["admin".into()],
                    jti: "dev".into(),
                    exp: i64::MAX,
                    iat: 0,
                });
                return inner.call(req).await;
            }

            let Some(token) = extract_token(&req) else {
                return Ok(ApiError::unauthorized("missing bearer token").into_response());
            };
            let claims = match authority.verify(&token) {
                Ok(claims) => claims,
                Err(err) => return Ok(ApiError(err).into_response()),
            };
            match store.is_token_revoked(&claims.jti).await {
                Ok(false) => {}
                Ok(true) => {
                    return Ok(ApiError::unauthorized("token has been revoked").into_response())
                }
                Err(err) => return Ok(ApiError(err).into_response()),
            }

            req.extensions_mut().insert(claims);
            inner.call(req).await
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn authority(secret: &str) -> TokenAuthority {
        TokenAuthority::from_config(&AuthConfig {
            jwt_secret: secret.into(),
            users: vec![UserEntry {
                username: "alice".into(),
                password: "hunter2".into(),
                roles: vec!["operator".into()],
            }],
            ..AuthConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn issue_verify_round_trip() {
        let authority = authority("test-secret");
        let (token, claims) = authority.issue("alice", vec!["operator".into()]).unwrap();
        let verified = authority.verify(&token).unwrap();
        assert_eq!(verified.sub, "alice");
        assert_eq!(verified.jti, claims.jti);
        assert!(verified.has_role("operator"));
        assert!(!verified.has_role("admin"));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let issuer = authority("secret-a");
        let (token, _) = issuer.issue("alice", vec![]).unwrap();
        let verifier = authority("secret-b");
        assert!(matches!(
            verifier.verify(&token),
            Err(CoreError::Unauthorized(_))
        ));
    }

    #[test]
    fn admin_implies_every_role() {
        let claims = Claims {
            sub: "root".into(),
            roles: vec!["admin".into()],
            jti: "x".into(),
            exp: i64::MAX,
            iat: 0,
        };
        assert!(require_role(&claims, "operator").is_ok());
    }

    #[test]
    fn authenticate_matches_configured_user() {
        let authority = authority("s");
        assert!(authority.authenticate("alice", "hunter2").is_some());
        assert!(authority.authenticate("alice", "wrong").is_none());
        assert!(authority.authenticate("bob", "hunter2").is_none());
    }
}
