use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.phoenix/config.toml`.
///
/// Every section has serde defaults so a missing file or a partial file is
/// always usable. A handful of environment variables override the file for
/// containerized deployments: `PHOENIX_DATABASE_PATH`, `PHOENIX_JWT_SECRET`,
/// `PHOENIX_HTTP_PORT`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub experiments: ExperimentsConfig,
}

impl Config {
    /// Load config from `~/.phoenix/config.toml`, falling back to defaults
    /// when the file does not exist, then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        let mut cfg = if path.exists() {
            let text =
                std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            Config::default()
        };
        cfg.apply_env();
        Ok(cfg)
    }

    /// Load from a specific path (no env overrides).
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("PHOENIX_DATABASE_PATH") {
            if !v.is_empty() {
                self.database.path = v;
            }
        }
        if let Ok(v) = std::env::var("PHOENIX_JWT_SECRET") {
            if !v.is_empty() {
                self.auth.jwt_secret = v;
            }
        }
        if let Ok(v) = std::env::var("PHOENIX_HTTP_PORT") {
            if let Ok(port) = v.parse() {
                self.server.port = port;
            }
        }
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".phoenix")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            allowed_origins: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8080
}
fn default_request_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.phoenix/phoenix.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for HS256 tokens. Empty disables login (verification-only
    /// deployments configure `public_key_pem` instead).
    #[serde(default)]
    pub jwt_secret: String,
    /// Optional RSA public key (PEM) for RS256 verification.
    #[serde(default)]
    pub public_key_pem: Option<String>,
    /// Token lifetime in seconds.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    /// Operator accounts allowed to log in.
    #[serde(default)]
    pub users: Vec<UserEntry>,
    /// Interval for the revoked-token sweep.
    #[serde(default = "default_revocation_sweep")]
    pub revocation_sweep_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            public_key_pem: None,
            token_ttl_secs: default_token_ttl(),
            users: Vec::new(),
            revocation_sweep_secs: default_revocation_sweep(),
        }
    }
}

fn default_token_ttl() -> u64 {
    3600
}
fn default_revocation_sweep() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub password: String,
    #[serde(default = "default_roles")]
    pub roles: Vec<String>,
}

fn default_roles() -> Vec<String> {
    vec!["operator".into()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Lease duration granted to an agent per task, in seconds.
    #[serde(default = "default_lease")]
    pub lease_duration_secs: u64,
    /// Ceiling for a long poll's `wait_seconds`.
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,
    /// Retry backoff base, in seconds.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    /// Retry backoff cap, in seconds.
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
    /// How often expired leases are reaped, in seconds.
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_duration_secs: default_lease(),
            max_wait_secs: default_max_wait(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

fn default_lease() -> u64 {
    300
}
fn default_max_wait() -> u64 {
    30
}
fn default_backoff_base() -> u64 {
    5
}
fn default_backoff_cap() -> u64 {
    300
}
fn default_reap_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Heartbeat age after which an agent is `degraded`, in seconds.
    #[serde(default = "default_degraded")]
    pub degraded_after_secs: u64,
    /// Heartbeat age after which an agent is `offline`, in seconds.
    #[serde(default = "default_offline")]
    pub offline_after_secs: u64,
    /// How often the liveness loop runs, in seconds.
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval_secs: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            degraded_after_secs: default_degraded(),
            offline_after_secs: default_offline(),
            liveness_interval_secs: default_liveness_interval(),
        }
    }
}

fn default_degraded() -> u64 {
    30
}
fn default_offline() -> u64 {
    90
}
fn default_liveness_interval() -> u64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentsConfig {
    /// Grace period in `analyzing` before failing with insufficient data.
    #[serde(default = "default_analysis_grace")]
    pub analysis_grace_secs: u64,
    /// How often the experiment ticker runs, in seconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
}

impl Default for ExperimentsConfig {
    fn default() -> Self {
        Self {
            analysis_grace_secs: default_analysis_grace(),
            tick_interval_secs: default_tick_interval(),
        }
    }
}

fn default_analysis_grace() -> u64 {
    300
}
fn default_tick_interval() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.queue.lease_duration_secs, 300);
        assert_eq!(cfg.queue.max_wait_secs, 30);
        assert_eq!(cfg.agents.offline_after_secs, 90);
        assert_eq!(cfg.experiments.analysis_grace_secs, 300);
        assert_eq!(cfg.auth.token_ttl_secs, 3600);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [server]
            port = 9999
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9999);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.queue.backoff_base_secs, 5);
    }
}
