use serde_json::{json, Value};

use crate::client::{parse_kv_pairs, print_json, ApiClient, CliError};

pub async fn templates(client: &ApiClient) -> Result<(), CliError> {
    print_json(&client.get("/api/v1/pipelines/templates").await?);
    Ok(())
}

pub async fn validate(client: &ApiClient, file: &str) -> Result<(), CliError> {
    let text = std::fs::read_to_string(file)
        .map_err(|e| CliError::Validation(format!("cannot read {file}: {e}")))?;
    let config: Value = serde_json::from_str(&text)
        .map_err(|e| CliError::Validation(format!("{file} is not valid JSON: {e}")))?;
    let report = client
        .post("/api/v1/pipelines/validate", json!({"config": config}))
        .await?;
    print_json(&report);
    if report["valid"] != json!(true) {
        return Err(CliError::Validation("pipeline configuration is invalid".into()));
    }
    Ok(())
}

pub async fn render(
    client: &ApiClient,
    template: &str,
    variables: Vec<String>,
) -> Result<(), CliError> {
    let body = json!({
        "template": template,
        "variables": Value::Object(parse_kv_pairs(&variables)?),
    });
    print_json(&client.post("/api/v1/pipelines/render", body).await?);
    Ok(())
}
