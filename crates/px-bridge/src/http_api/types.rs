//! Request and response bodies for the REST surface.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use px_core::types::{
    Agent, AgentStatus, CollectorInfo, Experiment, MetricSample, SuccessCriteria, Task, Variant,
};

// ---------------------------------------------------------------------------
// Experiments
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateExperimentRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub baseline_pipeline: String,
    pub candidate_pipeline: String,
    #[serde(default)]
    pub target_hosts: Vec<String>,
    #[serde(default)]
    pub selectors: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    pub duration_secs: u64,
    #[serde(default)]
    pub success_criteria: Option<SuccessCriteria>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateExperimentRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub target_hosts: Option<Vec<String>>,
    pub selectors: Option<Vec<String>>,
    pub parameters: Option<BTreeMap<String, String>>,
    pub duration_secs: Option<u64>,
    pub success_criteria: Option<SuccessCriteria>,
}

#[derive(Debug, Serialize)]
pub struct ExperimentResponse {
    #[serde(flatten)]
    pub experiment: Experiment,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub phase: Option<String>,
    #[serde(default)]
    pub include_deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct ExperimentStatusResponse {
    pub experiment_id: String,
    pub phase: px_core::types::ExperimentPhase,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub failure_reason: Option<String>,
    pub tasks: TaskCounts,
}

#[derive(Debug, Default, Serialize)]
pub struct TaskCounts {
    pub pending: u64,
    pub leased: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl TaskCounts {
    pub fn tally(tasks: &[Task]) -> Self {
        use px_core::types::TaskStatus::*;
        let mut counts = TaskCounts::default();
        for task in tasks {
            match task.status {
                Pending => counts.pending += 1,
                Leased => counts.leased += 1,
                Succeeded => counts.succeeded += 1,
                Failed => counts.failed += 1,
                Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }
}

// ---------------------------------------------------------------------------
// Deployments
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    pub name: String,
    pub pipeline_template: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub target_nodes: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

fn default_namespace() -> String {
    "default".into()
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateDeploymentRequest {
    pub name: Option<String>,
    pub pipeline_template: Option<String>,
    pub namespace: Option<String>,
    pub target_nodes: Option<Vec<String>>,
    pub parameters: Option<BTreeMap<String, String>>,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub target_version: i64,
    #[serde(default)]
    pub note: Option<String>,
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub config: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct RenderRequest {
    /// Name of a built-in template, or an inline config document.
    pub template: Option<String>,
    pub config: Option<serde_json::Value>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct AgentView {
    #[serde(flatten)]
    pub agent: Agent,
    /// Status derived from heartbeat age at read time.
    pub derived_status: AgentStatus,
}

// ---------------------------------------------------------------------------
// Agent protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct PollRequest {
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// 0..=60; clamped server-side.
    #[serde(default)]
    pub wait_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct LeasedTaskResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: px_core::types::TaskType,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    pub lease_expires_at: chrono::DateTime<chrono::Utc>,
}

impl From<Task> for LeasedTaskResponse {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            task_type: task.task_type,
            payload: task.payload,
            experiment_id: task.experiment_id,
            deployment_id: task.deployment_id,
            lease_expires_at: task.lease_expires_at.unwrap_or_else(chrono::Utc::now),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReportStatusRequest {
    pub phase: ReportPhase,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default = "default_true")]
    pub retriable: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportPhase {
    Succeeded,
    Failed,
    InProgress,
}

#[derive(Debug, Deserialize)]
pub struct AgentHeartbeatRequest {
    #[serde(default)]
    pub task_ids: Vec<String>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
    #[serde(default)]
    pub collector_info: Option<CollectorInfo>,
}

#[derive(Debug, Serialize)]
pub struct AgentHeartbeatResponse {
    pub host_id: String,
    pub tasks: Vec<TaskLeaseAck>,
}

/// Per-task heartbeat outcome; unknown or lost leases are reported
/// individually (partial success).
#[derive(Debug, Serialize)]
pub struct TaskLeaseAck {
    pub task_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ReportMetricsRequest {
    pub samples: Vec<MetricSampleBody>,
}

#[derive(Debug, Deserialize)]
pub struct MetricSampleBody {
    pub experiment_id: String,
    pub variant: Variant,
    #[serde(default)]
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
    pub cardinality: u64,
    #[serde(default)]
    pub cost_per_minute: f64,
    #[serde(default)]
    pub dropped_count: u64,
    #[serde(default)]
    pub extra: BTreeMap<String, f64>,
}

impl MetricSampleBody {
    pub fn into_sample(self, host_id: &str) -> MetricSample {
        MetricSample {
            experiment_id: self.experiment_id,
            variant: self.variant,
            host_id: host_id.to_string(),
            timestamp: self.timestamp.unwrap_or_else(chrono::Utc::now),
            cardinality: self.cardinality,
            cost_per_minute: self.cost_per_minute,
            dropped_count: self.dropped_count,
            extra: self.extra,
        }
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub roles: Vec<String>,
}
