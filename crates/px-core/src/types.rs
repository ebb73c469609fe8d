use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids;

// ---------------------------------------------------------------------------
// ExperimentPhase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentPhase {
    Pending,
    Initializing,
    Deploying,
    Running,
    Analyzing,
    Completed,
    Failed,
    Cancelled,
}

impl ExperimentPhase {
    /// Terminal phases are absorbing: no transition ever leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExperimentPhase::Completed | ExperimentPhase::Failed | ExperimentPhase::Cancelled
        )
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// `Cancelled` is reachable from every non-terminal phase; the forward
    /// path is pending -> initializing -> deploying -> running -> analyzing
    /// -> completed/failed, with deploying and analyzing also able to fail.
    pub fn can_transition_to(&self, target: ExperimentPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if target == ExperimentPhase::Cancelled {
            return true;
        }
        matches!(
            (self, target),
            (ExperimentPhase::Pending, ExperimentPhase::Initializing)
                | (ExperimentPhase::Initializing, ExperimentPhase::Deploying)
                | (ExperimentPhase::Initializing, ExperimentPhase::Failed)
                | (ExperimentPhase::Deploying, ExperimentPhase::Running)
                | (ExperimentPhase::Deploying, ExperimentPhase::Failed)
                | (ExperimentPhase::Running, ExperimentPhase::Analyzing)
                | (ExperimentPhase::Running, ExperimentPhase::Failed)
                | (ExperimentPhase::Analyzing, ExperimentPhase::Completed)
                | (ExperimentPhase::Analyzing, ExperimentPhase::Failed)
        )
    }
}

// ---------------------------------------------------------------------------
// Variant / Recommendation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Baseline,
    Candidate,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Baseline => "baseline",
            Variant::Candidate => "candidate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Promote,
    Reject,
    Inconclusive,
}

// ---------------------------------------------------------------------------
// SuccessCriteria
// ---------------------------------------------------------------------------

/// Thresholds an A/B experiment must clear for a `promote` recommendation.
/// All percentage fields are expressed as percents (50.0 == 50%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessCriteria {
    #[serde(default)]
    pub min_cardinality_reduction: Option<f64>,
    #[serde(default)]
    pub max_cost_increase: Option<f64>,
    #[serde(default)]
    pub max_latency_increase: Option<f64>,
    #[serde(default)]
    pub min_critical_process_retention: Option<f64>,
    /// Minimum samples per variant before a promote is allowed.
    #[serde(default = "default_min_samples")]
    pub min_samples: u32,
    /// Minimum distinct reporting hosts per variant before a promote is allowed.
    #[serde(default = "default_min_hosts")]
    pub min_hosts: u32,
}

fn default_min_samples() -> u32 {
    30
}
fn default_min_hosts() -> u32 {
    1
}

impl Default for SuccessCriteria {
    fn default() -> Self {
        Self {
            min_cardinality_reduction: None,
            max_cost_increase: None,
            max_latency_increase: None,
            min_critical_process_retention: None,
            min_samples: default_min_samples(),
            min_hosts: default_min_hosts(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExperimentResults
// ---------------------------------------------------------------------------

/// Per-variant aggregates computed over the experiment window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantSummary {
    pub mean_cardinality: f64,
    pub p95_cardinality: f64,
    pub mean_cost_per_minute: f64,
    pub total_dropped: u64,
    pub sample_count: u64,
    pub host_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub baseline: VariantSummary,
    pub candidate: VariantSummary,
    /// (baseline mean - candidate mean) / baseline mean * 100, clamped at 0.
    pub cardinality_reduction_pct: f64,
    pub cost_savings_pct: f64,
    pub recommendation: Recommendation,
    pub analyzed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Experiment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub phase: ExperimentPhase,
    pub baseline_pipeline: String,
    pub candidate_pipeline: String,
    /// Literal host ids the experiment targets.
    pub target_hosts: Vec<String>,
    /// Capability selectors (`cap:<name>`) resolved at lease time.
    pub selectors: Vec<String>,
    /// Opaque vendor parameters, forwarded verbatim into task payloads.
    pub parameters: BTreeMap<String, String>,
    pub duration_secs: u64,
    pub success_criteria: SuccessCriteria,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when the experiment entered `analyzing`; drives the grace window.
    pub analyzing_since: Option<DateTime<Utc>>,
    pub results: Option<ExperimentResults>,
    pub failure_reason: Option<String>,
    /// Deployment created/updated by a promote, kept for rollback.
    pub promoted_deployment_id: Option<String>,
}

impl Experiment {
    pub fn new(name: impl Into<String>, baseline: impl Into<String>, candidate: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ids::experiment_id(),
            name: name.into(),
            description: None,
            phase: ExperimentPhase::Pending,
            baseline_pipeline: baseline.into(),
            candidate_pipeline: candidate.into(),
            target_hosts: Vec::new(),
            selectors: Vec::new(),
            parameters: BTreeMap::new(),
            duration_secs: 3600,
            success_criteria: SuccessCriteria::default(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            analyzing_since: None,
            results: None,
            failure_reason: None,
            promoted_deployment_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    DeployPipeline,
    UpdatePipeline,
    RollbackPipeline,
    DeletePipeline,
    LoadsimStart,
    LoadsimStop,
    CollectMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Leased,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Literal host id, or a `cap:<capability>` selector.
    pub target_host_id: String,
    pub priority: i32,
    /// Opaque payload, defined by convention per task type.
    pub payload: serde_json::Value,
    pub experiment_id: Option<String>,
    pub deployment_id: Option<String>,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest dispatch time; set by retry backoff.
    pub not_before: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub leased_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl Task {
    pub fn new(task_type: TaskType, target_host_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ids::task_id(),
            task_type,
            target_host_id: target_host_id.into(),
            priority: 0,
            payload: serde_json::Value::Null,
            experiment_id: None,
            deployment_id: None,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            not_before: None,
            lease_expires_at: None,
            leased_by: None,
            created_at: now,
            updated_at: now,
            last_error: None,
            result: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Degraded,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorInfo {
    #[serde(rename = "type")]
    pub collector_type: String,
    pub version: String,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// The authentication identity (`X-Agent-Host-ID`); primary key.
    pub host_id: String,
    pub hostname: String,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    pub last_heartbeat_at: DateTime<Utc>,
    pub collector_info: Option<CollectorInfo>,
    pub metadata: BTreeMap<String, String>,
}

impl Agent {
    pub fn new(host_id: impl Into<String>) -> Self {
        let host_id = host_id.into();
        Self {
            hostname: host_id.clone(),
            host_id,
            capabilities: Vec::new(),
            status: AgentStatus::Online,
            last_heartbeat_at: Utc::now(),
            collector_info: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Derive the status implied by heartbeat age against the configured
    /// thresholds (degraded after `degraded_secs`, offline after `offline_secs`).
    pub fn derived_status(&self, now: DateTime<Utc>, degraded_secs: i64, offline_secs: i64) -> AgentStatus {
        let stale = now.signed_duration_since(self.last_heartbeat_at).num_seconds();
        if stale > offline_secs {
            AgentStatus::Offline
        } else if stale > degraded_secs {
            AgentStatus::Degraded
        } else {
            AgentStatus::Online
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineDeployment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutPhase {
    Pending,
    Deploying,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDeployment {
    pub id: String,
    pub name: String,
    pub pipeline_template: String,
    pub namespace: String,
    pub target_nodes: Vec<String>,
    pub parameters: BTreeMap<String, String>,
    pub status: DeploymentStatus,
    pub phase: RolloutPhase,
    pub current_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl PipelineDeployment {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ids::deployment_id(),
            name: name.into(),
            pipeline_template: template.into(),
            namespace: "default".into(),
            target_nodes: Vec::new(),
            parameters: BTreeMap::new(),
            status: DeploymentStatus::Active,
            phase: RolloutPhase::Pending,
            current_version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// An append-only snapshot of a deployment at a given version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentVersion {
    pub deployment_id: String,
    pub version: i64,
    pub config_snapshot: serde_json::Value,
    pub parameters_snapshot: BTreeMap<String, String>,
    pub deployed_by: String,
    pub deployed_at: DateTime<Utc>,
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// MetricSample
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub experiment_id: String,
    pub variant: Variant,
    pub host_id: String,
    pub timestamp: DateTime<Utc>,
    /// Distinct time series produced by the pipeline at this instant.
    pub cardinality: u64,
    pub cost_per_minute: f64,
    pub dropped_count: u64,
    /// Additional numeric series, keyed by name.
    #[serde(default)]
    pub extra: BTreeMap<String, f64>,
}

// ---------------------------------------------------------------------------
// RevokedToken
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokedToken {
    pub jti: String,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phases_are_absorbing() {
        for phase in [
            ExperimentPhase::Completed,
            ExperimentPhase::Failed,
            ExperimentPhase::Cancelled,
        ] {
            for target in [
                ExperimentPhase::Pending,
                ExperimentPhase::Running,
                ExperimentPhase::Cancelled,
                ExperimentPhase::Completed,
            ] {
                assert!(!phase.can_transition_to(target), "{phase:?} -> {target:?}");
            }
        }
    }

    #[test]
    fn cancel_reachable_from_any_non_terminal() {
        for phase in [
            ExperimentPhase::Pending,
            ExperimentPhase::Initializing,
            ExperimentPhase::Deploying,
            ExperimentPhase::Running,
            ExperimentPhase::Analyzing,
        ] {
            assert!(phase.can_transition_to(ExperimentPhase::Cancelled));
        }
    }

    #[test]
    fn forward_path_is_linear() {
        assert!(ExperimentPhase::Pending.can_transition_to(ExperimentPhase::Initializing));
        assert!(!ExperimentPhase::Pending.can_transition_to(ExperimentPhase::Running));
        assert!(ExperimentPhase::Deploying.can_transition_to(ExperimentPhase::Failed));
        assert!(!ExperimentPhase::Running.can_transition_to(ExperimentPhase::Completed));
    }

    #[test]
    fn agent_status_derivation() {
        let mut agent = Agent::new("h1");
        let now = Utc::now();
        agent.last_heartbeat_at = now - chrono::Duration::seconds(10);
        assert_eq!(agent.derived_status(now, 30, 90), AgentStatus::Online);
        agent.last_heartbeat_at = now - chrono::Duration::seconds(45);
        assert_eq!(agent.derived_status(now, 30, 90), AgentStatus::Degraded);
        agent.last_heartbeat_at = now - chrono::Duration::seconds(120);
        assert_eq!(agent.derived_status(now, 30, 90), AgentStatus::Offline);
    }

    #[test]
    fn task_type_serializes_snake_case() {
        let json = serde_json::to_string(&TaskType::DeployPipeline).unwrap();
        assert_eq!(json, "\"deploy_pipeline\"");
    }

    #[test]
    fn success_criteria_defaults() {
        let c: SuccessCriteria = serde_json::from_str("{}").unwrap();
        assert_eq!(c.min_samples, 30);
        assert_eq!(c.min_hosts, 1);
        assert!(c.min_cardinality_reduction.is_none());
    }
}
