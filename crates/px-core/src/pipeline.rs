//! Collector pipeline configuration tooling: structural validation of a
//! pipeline document, `${NAME}` template rendering, and the built-in
//! template catalog.
//!
//! A pipeline document is a nested mapping (the collector's YAML, already
//! parsed into JSON) with `receivers`, `processors`, `exporters`, and
//! `service.pipelines` sections. Validation and rendering are pure
//! functions; nothing here touches storage or the network.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Dotted path to the offending node, e.g. `processors.batch.send_batch_size`.
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn from_errors(errors: Vec<ValidationIssue>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

const SECTIONS: [&str; 3] = ["receivers", "processors", "exporters"];

/// Validate a pipeline configuration document.
///
/// Checks section presence, that every component referenced by a service
/// pipeline is defined, and that numeric limits and durations fall in their
/// documented ranges.
pub fn validate(config: &Value) -> ValidationReport {
    let mut errors = Vec::new();

    let Some(root) = config.as_object() else {
        errors.push(ValidationIssue {
            path: String::new(),
            message: "pipeline configuration must be a mapping".into(),
        });
        return ValidationReport::from_errors(errors);
    };

    for section in SECTIONS {
        match root.get(section) {
            Some(Value::Object(_)) => {}
            Some(_) => errors.push(ValidationIssue {
                path: section.into(),
                message: "section must be a mapping of component name to config".into(),
            }),
            None => errors.push(ValidationIssue {
                path: section.into(),
                message: "required section is missing".into(),
            }),
        }
    }

    let pipelines = root
        .get("service")
        .and_then(|s| s.get("pipelines"))
        .and_then(|p| p.as_object());
    match pipelines {
        Some(pipelines) if !pipelines.is_empty() => {
            for (name, pipeline) in pipelines {
                check_pipeline_refs(root, name, pipeline, &mut errors);
            }
        }
        _ => errors.push(ValidationIssue {
            path: "service.pipelines".into(),
            message: "at least one service pipeline must be declared".into(),
        }),
    }

    check_limits(config, String::new(), &mut errors);

    ValidationReport::from_errors(errors)
}

fn check_pipeline_refs(
    root: &serde_json::Map<String, Value>,
    pipeline_name: &str,
    pipeline: &Value,
    errors: &mut Vec<ValidationIssue>,
) {
    for section in SECTIONS {
        let path = format!("service.pipelines.{pipeline_name}.{section}");
        let Some(refs) = pipeline.get(section) else {
            // Processors are optional in a pipeline; receivers/exporters are not.
            if section != "processors" {
                errors.push(ValidationIssue {
                    path,
                    message: "pipeline must reference at least one component".into(),
                });
            }
            continue;
        };
        let Some(refs) = refs.as_array() else {
            errors.push(ValidationIssue {
                path,
                message: "component references must be a list".into(),
            });
            continue;
        };
        let defined = root.get(section).and_then(|s| s.as_object());
        for reference in refs {
            let Some(reference) = reference.as_str() else {
                errors.push(ValidationIssue {
                    path: path.clone(),
                    message: "component reference must be a string".into(),
                });
                continue;
            };
            let exists = defined.is_some_and(|d| d.contains_key(reference));
            if !exists {
                errors.push(ValidationIssue {
                    path: path.clone(),
                    message: format!("references undefined component `{reference}`"),
                });
            }
        }
    }
}

// Recursive range/format checks on well-known keys anywhere in the tree.
fn check_limits(node: &Value, path: String, errors: &mut Vec<ValidationIssue>) {
    let Some(map) = node.as_object() else {
        return;
    };
    for (key, value) in map {
        let child_path = if path.is_empty() {
            key.clone()
        } else {
            format!("{path}.{key}")
        };
        match key.as_str() {
            "send_batch_size" | "send_batch_max_size" => {
                if value.as_u64().is_none() {
                    errors.push(ValidationIssue {
                        path: child_path.clone(),
                        message: "batch size must be a non-negative integer".into(),
                    });
                }
            }
            "limit" | "cardinality_limit" | "max_cardinality" => {
                if !value.as_u64().is_some_and(|v| v > 0) {
                    errors.push(ValidationIssue {
                        path: child_path.clone(),
                        message: "cardinality limit must be a positive integer".into(),
                    });
                }
            }
            "k" | "top_k" => {
                if !value.as_u64().is_some_and(|v| v > 0) {
                    errors.push(ValidationIssue {
                        path: child_path.clone(),
                        message: "k must be a positive integer".into(),
                    });
                }
            }
            "endpoint" => {
                if !value.as_str().is_some_and(|s| !s.is_empty()) {
                    errors.push(ValidationIssue {
                        path: child_path.clone(),
                        message: "endpoint must be a non-empty string".into(),
                    });
                }
            }
            _ if key == "timeout"
                || key == "interval"
                || key.ends_with("_timeout")
                || key.ends_with("_interval") =>
            {
                if let Some(s) = value.as_str() {
                    if parse_duration_secs(s).is_none() {
                        errors.push(ValidationIssue {
                            path: child_path.clone(),
                            message: format!("`{s}` is not a valid duration"),
                        });
                    }
                }
            }
            _ => {}
        }
        check_limits(value, child_path, errors);
    }
}

/// Parse a collector-style duration (`300ms`, `10s`, `1m30s`, `2h`) into
/// seconds. Returns `None` for anything malformed.
pub fn parse_duration_secs(input: &str) -> Option<f64> {
    if input.is_empty() {
        return None;
    }
    let mut total = 0.0;
    let mut rest = input;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if digits_end == 0 {
            return None;
        }
        let number: f64 = rest[..digits_end].parse().ok()?;
        rest = &rest[digits_end..];
        let unit_end = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let multiplier = match &rest[..unit_end] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        total += number * multiplier;
        rest = &rest[unit_end..];
    }
    Some(total)
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("undeclared variables: {}", missing.join(", "))]
    MissingVariables { missing: Vec<String> },
    #[error("unterminated ${{ token at {path}")]
    UnterminatedToken { path: String },
}

/// Substitute `${NAME}` tokens from `vars` into every string of `template`.
///
/// Returns the rendered document, or an error naming every variable the
/// template references but `vars` does not declare.
pub fn render(template: &Value, vars: &BTreeMap<String, String>) -> Result<Value, RenderError> {
    let mut missing = Vec::new();
    let rendered = render_node(template, vars, String::new(), &mut missing)?;
    if missing.is_empty() {
        Ok(rendered)
    } else {
        missing.sort();
        missing.dedup();
        Err(RenderError::MissingVariables { missing })
    }
}

fn render_node(
    node: &Value,
    vars: &BTreeMap<String, String>,
    path: String,
    missing: &mut Vec<String>,
) -> Result<Value, RenderError> {
    match node {
        Value::String(s) => Ok(Value::String(render_string(s, vars, &path, missing)?)),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                out.push(render_node(item, vars, format!("{path}[{i}]"), missing)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                out.insert(key.clone(), render_node(value, vars, child, missing)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn render_string(
    input: &str,
    vars: &BTreeMap<String, String>,
    path: &str,
    missing: &mut Vec<String>,
) -> Result<String, RenderError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(RenderError::UnterminatedToken { path: path.into() });
        };
        let name = &after[..end];
        match vars.get(name) {
            Some(value) => out.push_str(value),
            None => missing.push(name.to_string()),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// List every `${NAME}` token referenced anywhere in a template.
pub fn template_variables(template: &Value) -> Vec<String> {
    let mut names = Vec::new();
    collect_variables(template, &mut names);
    names.sort();
    names.dedup();
    names
}

fn collect_variables(node: &Value, names: &mut Vec<String>) {
    match node {
        Value::String(s) => {
            let mut rest = s.as_str();
            while let Some(start) = rest.find("${") {
                let after = &rest[start + 2..];
                let Some(end) = after.find('}') else { break };
                names.push(after[..end].to_string());
                rest = &after[end + 1..];
            }
        }
        Value::Array(items) => items.iter().for_each(|i| collect_variables(i, names)),
        Value::Object(map) => map.values().for_each(|v| collect_variables(v, names)),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Built-in template catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineTemplate {
    pub name: String,
    pub description: String,
    pub variables: Vec<String>,
    pub config: Value,
}

/// The templates shipped with the control plane. The documents themselves
/// are conventional collector configs; the control plane only validates and
/// renders them.
pub fn builtin_templates() -> Vec<PipelineTemplate> {
    let baseline = serde_json::json!({
        "receivers": {
            "hostmetrics": {
                "collection_interval": "${COLLECTION_INTERVAL}",
                "scrapers": {"process": {}}
            }
        },
        "processors": {
            "batch": {"send_batch_size": 1024, "timeout": "10s"}
        },
        "exporters": {
            "prometheusremotewrite": {"endpoint": "${METRICS_ENDPOINT}"}
        },
        "service": {
            "pipelines": {
                "metrics": {
                    "receivers": ["hostmetrics"],
                    "processors": ["batch"],
                    "exporters": ["prometheusremotewrite"]
                }
            }
        }
    });

    let topk = serde_json::json!({
        "receivers": {
            "hostmetrics": {
                "collection_interval": "${COLLECTION_INTERVAL}",
                "scrapers": {"process": {}}
            }
        },
        "processors": {
            "batch": {"send_batch_size": 1024, "timeout": "10s"},
            "filter/topk": {"top_k": {"k": 20, "metric": "process.cpu.utilization"}}
        },
        "exporters": {
            "prometheusremotewrite": {"endpoint": "${METRICS_ENDPOINT}"}
        },
        "service": {
            "pipelines": {
                "metrics": {
                    "receivers": ["hostmetrics"],
                    "processors": ["batch", "filter/topk"],
                    "exporters": ["prometheusremotewrite"]
                }
            }
        }
    });

    let priority = serde_json::json!({
        "receivers": {
            "hostmetrics": {
                "collection_interval": "${COLLECTION_INTERVAL}",
                "scrapers": {"process": {}}
            }
        },
        "processors": {
            "batch": {"send_batch_size": 1024, "timeout": "10s"},
            "transform/priority": {
                "critical_processes": "${CRITICAL_PROCESSES}",
                "cardinality_limit": 5000
            }
        },
        "exporters": {
            "prometheusremotewrite": {"endpoint": "${METRICS_ENDPOINT}"}
        },
        "service": {
            "pipelines": {
                "metrics": {
                    "receivers": ["hostmetrics"],
                    "processors": ["batch", "transform/priority"],
                    "exporters": ["prometheusremotewrite"]
                }
            }
        }
    });

    [
        ("process-baseline-v1", "Full-fidelity process metrics", baseline),
        ("process-topk-v1", "Top-K processes by CPU, everything else aggregated", topk),
        ("process-priority-v1", "Critical processes retained, remainder capped", priority),
    ]
    .into_iter()
    .map(|(name, description, config)| PipelineTemplate {
        name: name.into(),
        description: description.into(),
        variables: template_variables(&config),
        config,
    })
    .collect()
}

/// Look up a built-in template by name.
pub fn find_template(name: &str) -> Option<PipelineTemplate> {
    builtin_templates().into_iter().find(|t| t.name == name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
