use crate::client::{print_json, ApiClient, CliError};

pub async fn list(client: &ApiClient) -> Result<(), CliError> {
    print_json(&client.get("/api/v1/agents").await?);
    Ok(())
}

pub async fn tasks(client: &ApiClient, host_id: &str) -> Result<(), CliError> {
    print_json(&client.get(&format!("/api/v1/agents/{host_id}/tasks")).await?);
    Ok(())
}
