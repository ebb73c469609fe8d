use serde_json::json;

use crate::client::{clear_token, print_json, save_token, ApiClient, CliError};

pub async fn login(client: &ApiClient, username: &str, password: &str) -> Result<(), CliError> {
    let response = client
        .post(
            "/api/v1/auth/login",
            json!({"username": username, "password": password}),
        )
        .await?;
    let token = response["token"]
        .as_str()
        .ok_or_else(|| CliError::Server("login response missing token".into()))?;
    save_token(token).map_err(|e| CliError::Server(format!("cannot cache token: {e}")))?;
    println!("logged in as {username} (token cached)");
    Ok(())
}

pub async fn logout(client: &ApiClient) -> Result<(), CliError> {
    let result = client.post("/api/v1/auth/logout", json!({})).await;
    clear_token().map_err(|e| CliError::Server(format!("cannot clear token: {e}")))?;
    match result {
        Ok(body) => print_json(&body),
        // Token already dead server-side; local cache is cleared either way.
        Err(CliError::AuthRequired(_)) => println!("logged out"),
        Err(err) => return Err(err),
    }
    Ok(())
}
