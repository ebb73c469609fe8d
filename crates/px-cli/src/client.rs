//! Thin REST client shared by every command.

use std::path::PathBuf;

use serde_json::Value;

/// CLI failure classes, mapped onto process exit codes:
/// 0 success, 1 validation, 2 auth required, 3 server error, 4 cancelled.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    AuthRequired(String),
    #[error("{0}")]
    Server(String),
    #[error("cancelled")]
    Cancelled,
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Validation(_) => 1,
            CliError::AuthRequired(_) => 2,
            CliError::Server(_) => 3,
            CliError::Cancelled => 4,
        }
    }
}

pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            token: load_token(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    pub async fn get(&self, path: &str) -> Result<Value, CliError> {
        self.send(self.request(reqwest::Method::GET, path)).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value, CliError> {
        self.send(self.request(reqwest::Method::POST, path).json(&body))
            .await
    }

    pub async fn patch(&self, path: &str, body: Value) -> Result<Value, CliError> {
        self.send(self.request(reqwest::Method::PATCH, path).json(&body))
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, CliError> {
        self.send(self.request(reqwest::Method::DELETE, path)).await
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Value, CliError> {
        let response = req
            .send()
            .await
            .map_err(|e| CliError::Server(format!("request failed: {e}")))?;
        let status = response.status();
        let body: Value = if status == reqwest::StatusCode::NO_CONTENT {
            Value::Null
        } else {
            response
                .json()
                .await
                .map_err(|e| CliError::Server(format!("invalid response body: {e}")))?
        };
        if status.is_success() {
            return Ok(body);
        }
        let message = body["error"]["message"]
            .as_str()
            .unwrap_or("request failed")
            .to_string();
        match status.as_u16() {
            401 | 403 => Err(CliError::AuthRequired(message)),
            400..=499 => Err(CliError::Validation(message)),
            _ => Err(CliError::Server(message)),
        }
    }
}

// ---------------------------------------------------------------------------
// Token cache
// ---------------------------------------------------------------------------

fn token_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".phoenix")
        .join("token")
}

pub fn load_token() -> Option<String> {
    std::fs::read_to_string(token_path())
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn save_token(token: &str) -> std::io::Result<()> {
    let path = token_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, token)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

pub fn clear_token() -> std::io::Result<()> {
    match std::fs::remove_file(token_path()) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Pretty-print a JSON payload to stdout.
pub fn print_json(value: &Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

/// Parse repeated `KEY=VALUE` flags into a JSON object.
pub fn parse_kv_pairs(pairs: &[String]) -> Result<serde_json::Map<String, Value>, CliError> {
    let mut map = serde_json::Map::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(CliError::Validation(format!(
                "`{pair}` is not KEY=VALUE"
            )));
        };
        map.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok(map)
}
