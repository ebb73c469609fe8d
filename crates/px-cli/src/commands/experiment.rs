use serde_json::{json, Value};

use crate::client::{parse_kv_pairs, print_json, ApiClient, CliError};

#[allow(clippy::too_many_arguments)]
pub async fn create(
    client: &ApiClient,
    name: &str,
    baseline: &str,
    candidate: &str,
    hosts: Vec<String>,
    selectors: Vec<String>,
    duration_secs: u64,
    params: Vec<String>,
    min_reduction: Option<f64>,
) -> Result<(), CliError> {
    let mut body = json!({
        "name": name,
        "baseline_pipeline": baseline,
        "candidate_pipeline": candidate,
        "target_hosts": hosts,
        "selectors": selectors,
        "duration_secs": duration_secs,
        "parameters": Value::Object(parse_kv_pairs(&params)?),
    });
    if let Some(min) = min_reduction {
        body["success_criteria"] = json!({"min_cardinality_reduction": min});
    }
    let created = client.post("/api/v1/experiments", body).await?;
    print_json(&created);
    Ok(())
}

pub async fn list(client: &ApiClient, phase: Option<&str>) -> Result<(), CliError> {
    let path = match phase {
        Some(phase) => format!("/api/v1/experiments?phase={phase}"),
        None => "/api/v1/experiments".to_string(),
    };
    print_json(&client.get(&path).await?);
    Ok(())
}

pub async fn get(client: &ApiClient, id: &str) -> Result<(), CliError> {
    print_json(&client.get(&format!("/api/v1/experiments/{id}")).await?);
    Ok(())
}

pub async fn delete(client: &ApiClient, id: &str) -> Result<(), CliError> {
    print_json(&client.delete(&format!("/api/v1/experiments/{id}")).await?);
    Ok(())
}

/// start | stop | promote | rollback
pub async fn action(client: &ApiClient, id: &str, action: &str) -> Result<(), CliError> {
    print_json(
        &client
            .post(&format!("/api/v1/experiments/{id}/{action}"), json!({}))
            .await?,
    );
    Ok(())
}

pub async fn status(client: &ApiClient, id: &str) -> Result<(), CliError> {
    print_json(&client.get(&format!("/api/v1/experiments/{id}/status")).await?);
    Ok(())
}

pub async fn metrics(client: &ApiClient, id: &str) -> Result<(), CliError> {
    print_json(&client.get(&format!("/api/v1/experiments/{id}/metrics")).await?);
    Ok(())
}
