use serde_json::{json, Value};

use crate::client::{parse_kv_pairs, print_json, ApiClient, CliError};

pub async fn create(
    client: &ApiClient,
    name: &str,
    template: &str,
    namespace: &str,
    nodes: Vec<String>,
    params: Vec<String>,
) -> Result<(), CliError> {
    let body = json!({
        "name": name,
        "pipeline_template": template,
        "namespace": namespace,
        "target_nodes": nodes,
        "parameters": Value::Object(parse_kv_pairs(&params)?),
    });
    print_json(&client.post("/api/v1/pipelines/deployments", body).await?);
    Ok(())
}

pub async fn list(client: &ApiClient, include_deleted: bool) -> Result<(), CliError> {
    let path = if include_deleted {
        "/api/v1/pipelines/deployments?include_deleted=true"
    } else {
        "/api/v1/pipelines/deployments"
    };
    print_json(&client.get(path).await?);
    Ok(())
}

pub async fn get(client: &ApiClient, id: &str) -> Result<(), CliError> {
    print_json(&client.get(&format!("/api/v1/pipelines/deployments/{id}")).await?);
    Ok(())
}

pub async fn update(
    client: &ApiClient,
    id: &str,
    template: Option<String>,
    params: Vec<String>,
    note: Option<String>,
) -> Result<(), CliError> {
    let mut body = json!({});
    if let Some(template) = template {
        body["pipeline_template"] = json!(template);
    }
    if !params.is_empty() {
        body["parameters"] = Value::Object(parse_kv_pairs(&params)?);
    }
    if let Some(note) = note {
        body["note"] = json!(note);
    }
    print_json(
        &client
            .patch(&format!("/api/v1/pipelines/deployments/{id}"), body)
            .await?,
    );
    Ok(())
}

pub async fn delete(client: &ApiClient, id: &str) -> Result<(), CliError> {
    print_json(&client.delete(&format!("/api/v1/pipelines/deployments/{id}")).await?);
    Ok(())
}

pub async fn rollback(
    client: &ApiClient,
    id: &str,
    target_version: i64,
    note: Option<String>,
) -> Result<(), CliError> {
    let mut body = json!({"target_version": target_version});
    if let Some(note) = note {
        body["note"] = json!(note);
    }
    print_json(
        &client
            .post(&format!("/api/v1/pipelines/deployments/{id}/rollback"), body)
            .await?,
    );
    Ok(())
}

pub async fn versions(client: &ApiClient, id: &str) -> Result<(), CliError> {
    print_json(
        &client
            .get(&format!("/api/v1/pipelines/deployments/{id}/versions"))
            .await?,
    );
    Ok(())
}

pub async fn config(client: &ApiClient, id: &str) -> Result<(), CliError> {
    print_json(
        &client
            .get(&format!("/api/v1/pipelines/deployments/{id}/config"))
            .await?,
    );
    Ok(())
}
