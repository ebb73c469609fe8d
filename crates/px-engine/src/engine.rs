//! Experiment lifecycle engine: the state machine over A/B experiments,
//! deployment task generation, result analysis, promotion, and rollback.
//!
//! Every phase transition happens through a guarded storage transaction
//! that re-reads the row and asserts the expected phase, so concurrent
//! operators, agents, and scheduler ticks can never double-transition an
//! experiment.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use px_core::bus::{topics, Event, EventBus};
use px_core::config::ExperimentsConfig;
use px_core::store::Store;
use px_core::types::{
    Experiment, ExperimentPhase, MetricSample, Recommendation, SuccessCriteria, Task, TaskStatus,
    TaskType, Variant,
};
use px_core::CoreError;

use crate::queue::TaskDispatch;
use crate::registry::{DeploymentRegistry, DeploymentSpec};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewExperiment {
    pub name: String,
    pub description: Option<String>,
    pub baseline_pipeline: String,
    pub candidate_pipeline: String,
    pub target_hosts: Vec<String>,
    pub selectors: Vec<String>,
    pub parameters: BTreeMap<String, String>,
    pub duration_secs: u64,
    pub success_criteria: SuccessCriteria,
}

/// Partial update; only allowed while the experiment is still `pending`.
#[derive(Debug, Clone, Default)]
pub struct ExperimentPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub target_hosts: Option<Vec<String>>,
    pub selectors: Option<Vec<String>>,
    pub parameters: Option<BTreeMap<String, String>>,
    pub duration_secs: Option<u64>,
    pub success_criteria: Option<SuccessCriteria>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// How long an `analyzing` experiment may wait for data before failing
    /// with `insufficient_data`.
    pub analysis_grace: Duration,
}

impl EngineSettings {
    pub fn from_config(cfg: &ExperimentsConfig) -> Self {
        Self {
            analysis_grace: Duration::seconds(cfg.analysis_grace_secs as i64),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&ExperimentsConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ExperimentEngine {
    store: Arc<Store>,
    bus: EventBus,
    dispatch: Arc<dyn TaskDispatch>,
    registry: Arc<DeploymentRegistry>,
    settings: EngineSettings,
}

impl ExperimentEngine {
    pub fn new(
        store: Arc<Store>,
        bus: EventBus,
        dispatch: Arc<dyn TaskDispatch>,
        registry: Arc<DeploymentRegistry>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            bus,
            dispatch,
            registry,
            settings,
        }
    }

    fn publish(&self, kind: &str, experiment: &Experiment) {
        self.bus.publish(Event::new(
            kind,
            serde_json::json!({
                "experiment_id": experiment.id,
                "name": experiment.name,
                "phase": experiment.phase,
            }),
        ));
    }

    // -----------------------------------------------------------------------
    // CRUD
    // -----------------------------------------------------------------------

    /// Validate and record a new experiment. Returns the experiment plus
    /// soft warnings (a baseline==candidate comparison is accepted but
    /// flagged — it can only ever measure noise).
    pub async fn create(
        &self,
        req: NewExperiment,
    ) -> Result<(Experiment, Vec<String>), CoreError> {
        let mut fields = BTreeMap::new();
        if req.name.trim().is_empty() {
            fields.insert("name".into(), "must not be empty".into());
        }
        if req.baseline_pipeline.trim().is_empty() {
            fields.insert("baseline_pipeline".into(), "must not be empty".into());
        }
        if req.candidate_pipeline.trim().is_empty() {
            fields.insert("candidate_pipeline".into(), "must not be empty".into());
        }
        if req.target_hosts.is_empty() && req.selectors.is_empty() {
            fields.insert(
                "target_hosts".into(),
                "at least one target host or selector is required".into(),
            );
        }
        if req.target_hosts.iter().any(|h| h.trim().is_empty()) {
            fields.insert("target_hosts".into(), "host ids must not be empty".into());
        }
        for selector in &req.selectors {
            if !selector.starts_with("cap:") || selector.len() <= 4 {
                fields.insert(
                    "selectors".into(),
                    format!("`{selector}` is not a capability selector (expected cap:<name>)"),
                );
            }
        }
        if req.duration_secs == 0 {
            fields.insert("duration_secs".into(), "must be positive".into());
        }
        if !fields.is_empty() {
            return Err(CoreError::Validation {
                message: "invalid experiment".into(),
                fields,
            });
        }

        let mut warnings = Vec::new();
        if req.baseline_pipeline == req.candidate_pipeline {
            warn!(
                pipeline = %req.baseline_pipeline,
                "experiment compares a pipeline against itself"
            );
            warnings.push("baseline and candidate pipelines are identical".to_string());
        }

        let mut experiment =
            Experiment::new(req.name, req.baseline_pipeline, req.candidate_pipeline);
        experiment.description = req.description;
        experiment.target_hosts = req.target_hosts;
        experiment.selectors = req.selectors;
        experiment.parameters = req.parameters;
        experiment.duration_secs = req.duration_secs;
        experiment.success_criteria = req.success_criteria;
        self.store.insert_experiment(&experiment).await?;
        info!(experiment_id = %experiment.id, name = %experiment.name, "experiment created");
        self.publish(topics::EXPERIMENT_CREATED, &experiment);
        Ok((experiment, warnings))
    }

    /// Patch a pending experiment. Anything past `pending` is immutable
    /// apart from state-machine operations.
    pub async fn update(&self, id: &str, patch: ExperimentPatch) -> Result<Experiment, CoreError> {
        let updated = self
            .store
            .update_experiment_guarded(id, vec![ExperimentPhase::Pending], move |e| {
                if let Some(name) = patch.name {
                    if name.trim().is_empty() {
                        return Err(CoreError::validation("name", "must not be empty"));
                    }
                    e.name = name;
                }
                if let Some(description) = patch.description {
                    e.description = Some(description);
                }
                if let Some(hosts) = patch.target_hosts {
                    e.target_hosts = hosts;
                }
                if let Some(selectors) = patch.selectors {
                    e.selectors = selectors;
                }
                if let Some(parameters) = patch.parameters {
                    e.parameters = parameters;
                }
                if let Some(duration) = patch.duration_secs {
                    if duration == 0 {
                        return Err(CoreError::validation("duration_secs", "must be positive"));
                    }
                    e.duration_secs = duration;
                }
                if let Some(criteria) = patch.success_criteria {
                    e.success_criteria = criteria;
                }
                Ok(())
            })
            .await?;
        self.publish(topics::EXPERIMENT_UPDATED, &updated);
        Ok(updated)
    }

    /// Remove an experiment that is not mid-flight; owned tasks are
    /// cancelled first.
    pub async fn delete(&self, id: &str) -> Result<(), CoreError> {
        let Some(experiment) = self.store.get_experiment(id).await? else {
            return Err(CoreError::NotFound(format!("experiment {id}")));
        };
        if !experiment.phase.is_terminal() && experiment.phase != ExperimentPhase::Pending {
            return Err(CoreError::StateMachineViolation(format!(
                "experiment {id} is still active; cancel it first"
            )));
        }
        self.dispatch.cancel_for_experiment(id).await?;
        self.store.delete_experiment(id).await
    }

    // -----------------------------------------------------------------------
    // State machine operations
    // -----------------------------------------------------------------------

    /// `pending -> initializing -> deploying`: generate and enqueue the
    /// per-host deployment tasks for both variants.
    pub async fn start(&self, id: &str) -> Result<Experiment, CoreError> {
        let experiment = self
            .store
            .update_experiment_guarded(id, vec![ExperimentPhase::Pending], |e| {
                e.phase = ExperimentPhase::Initializing;
                Ok(())
            })
            .await?;
        self.publish(topics::EXPERIMENT_UPDATED, &experiment);

        if let Err(err) = self.enqueue_deploy_tasks(&experiment).await {
            warn!(experiment_id = %id, error = %err, "deployment task generation failed");
            let _ = self.dispatch.cancel_for_experiment(id).await;
            let failed = self
                .store
                .update_experiment_guarded(id, vec![ExperimentPhase::Initializing], |e| {
                    e.phase = ExperimentPhase::Failed;
                    e.failure_reason = Some("failed to enqueue deployment tasks".into());
                    e.completed_at = Some(Utc::now());
                    Ok(())
                })
                .await?;
            self.publish(topics::EXPERIMENT_FAILED, &failed);
            return Err(err);
        }

        let deploying = self
            .store
            .update_experiment_guarded(id, vec![ExperimentPhase::Initializing], |e| {
                e.phase = ExperimentPhase::Deploying;
                Ok(())
            })
            .await?;
        info!(experiment_id = %id, "experiment deploying");
        self.publish(topics::EXPERIMENT_UPDATED, &deploying);
        Ok(deploying)
    }

    fn targets(experiment: &Experiment) -> Vec<String> {
        experiment
            .target_hosts
            .iter()
            .cloned()
            .chain(experiment.selectors.iter().cloned())
            .collect()
    }

    async fn enqueue_deploy_tasks(&self, experiment: &Experiment) -> Result<(), CoreError> {
        for target in Self::targets(experiment) {
            for (variant, template) in [
                (Variant::Baseline, &experiment.baseline_pipeline),
                (Variant::Candidate, &experiment.candidate_pipeline),
            ] {
                let mut task = Task::new(TaskType::DeployPipeline, target.clone());
                task.priority = 10;
                task.experiment_id = Some(experiment.id.clone());
                task.payload = serde_json::json!({
                    "template": template,
                    "variant": variant,
                    "parameters": experiment.parameters,
                    "experiment_id": experiment.id,
                });
                self.dispatch.enqueue(task).await?;
            }
            if let Some(profile) = experiment.parameters.get("loadsim_profile") {
                let mut task = Task::new(TaskType::LoadsimStart, target.clone());
                task.priority = 5;
                task.experiment_id = Some(experiment.id.clone());
                task.payload = serde_json::json!({
                    "profile": profile,
                    "duration": experiment.duration_secs,
                    "process_count": experiment
                        .parameters
                        .get("loadsim_process_count")
                        .and_then(|v| v.parse::<u64>().ok()),
                });
                self.dispatch.enqueue(task).await?;
            }
        }
        Ok(())
    }

    /// Teardown for cancel/rollback: stop load generation and remove the
    /// candidate pipeline, in reverse target order. Best-effort — failures
    /// surface as `task.failed` events only.
    async fn enqueue_teardown_tasks(&self, experiment: &Experiment, rollback: bool) {
        for target in Self::targets(experiment).into_iter().rev() {
            if experiment.parameters.contains_key("loadsim_profile") {
                let mut task = Task::new(TaskType::LoadsimStop, target.clone());
                task.priority = 20;
                task.experiment_id = Some(experiment.id.clone());
                task.payload = serde_json::json!({});
                if let Err(err) = self.dispatch.enqueue(task).await {
                    warn!(experiment_id = %experiment.id, error = %err, "teardown enqueue failed");
                }
            }
            let task_type = if rollback {
                TaskType::RollbackPipeline
            } else {
                TaskType::DeletePipeline
            };
            let mut task = Task::new(task_type, target);
            task.priority = 20;
            task.experiment_id = Some(experiment.id.clone());
            task.payload = serde_json::json!({
                "template": experiment.candidate_pipeline,
                "variant": Variant::Candidate,
                "experiment_id": experiment.id,
            });
            if let Err(err) = self.dispatch.enqueue(task).await {
                warn!(experiment_id = %experiment.id, error = %err, "teardown enqueue failed");
            }
        }
    }

    /// `running -> analyzing` on operator stop; analysis runs immediately.
    pub async fn stop(&self, id: &str) -> Result<Experiment, CoreError> {
        let experiment = self
            .store
            .update_experiment_guarded(id, vec![ExperimentPhase::Running], |e| {
                e.phase = ExperimentPhase::Analyzing;
                e.analyzing_since = Some(Utc::now());
                Ok(())
            })
            .await?;
        self.publish(topics::EXPERIMENT_UPDATED, &experiment);
        self.try_analyze(&experiment).await?;
        self.store
            .get_experiment(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("experiment {id}")))
    }

    /// Cancel from any non-terminal phase. Teardown is enqueued best-effort
    /// and not awaited; the terminal transition never blocks on it.
    pub async fn cancel(&self, id: &str) -> Result<Experiment, CoreError> {
        let experiment = self
            .store
            .update_experiment_guarded(
                id,
                vec![
                    ExperimentPhase::Pending,
                    ExperimentPhase::Initializing,
                    ExperimentPhase::Deploying,
                    ExperimentPhase::Running,
                    ExperimentPhase::Analyzing,
                ],
                |e| {
                    e.phase = ExperimentPhase::Cancelled;
                    e.completed_at = Some(Utc::now());
                    Ok(())
                },
            )
            .await?;
        self.dispatch.cancel_for_experiment(id).await?;
        self.enqueue_teardown_tasks(&experiment, false).await;
        info!(experiment_id = %id, "experiment cancelled");
        self.publish(topics::EXPERIMENT_CANCELLED, &experiment);
        Ok(experiment)
    }

    /// Convert a winning candidate into a standing deployment.
    pub async fn promote(
        &self,
        id: &str,
        promoted_by: &str,
    ) -> Result<Experiment, CoreError> {
        let Some(experiment) = self.store.get_experiment(id).await? else {
            return Err(CoreError::NotFound(format!("experiment {id}")));
        };
        if experiment.phase != ExperimentPhase::Completed {
            return Err(CoreError::StateMachineViolation(format!(
                "experiment {id} is not completed"
            )));
        }
        let recommendation = experiment.results.as_ref().map(|r| r.recommendation);
        if recommendation != Some(Recommendation::Promote) {
            return Err(CoreError::StateMachineViolation(format!(
                "experiment {id} has no promote recommendation"
            )));
        }

        let spec = DeploymentSpec {
            name: format!("{}-promoted", experiment.name),
            pipeline_template: experiment.candidate_pipeline.clone(),
            namespace: "default".into(),
            target_nodes: experiment.target_hosts.clone(),
            parameters: experiment.parameters.clone(),
        };
        let note = format!("promoted from experiment {id}");
        let deployment_id = match &experiment.promoted_deployment_id {
            Some(existing) => {
                let (deployment, _) = self
                    .registry
                    .update(existing, spec, promoted_by, Some(note))
                    .await?;
                deployment.id
            }
            None => {
                let (deployment, _) = self
                    .registry
                    .create(spec, promoted_by, Some(note))
                    .await?;
                deployment.id
            }
        };

        let updated = self
            .store
            .update_experiment_guarded(id, vec![ExperimentPhase::Completed], move |e| {
                e.promoted_deployment_id = Some(deployment_id);
                Ok(())
            })
            .await?;
        info!(experiment_id = %id, deployment_id = ?updated.promoted_deployment_id, "experiment promoted");
        self.publish(topics::EXPERIMENT_UPDATED, &updated);
        Ok(updated)
    }

    /// Operator rollback of a terminal experiment: tear the candidate down
    /// and, when a promotion exists, restore the promoted deployment to its
    /// pre-promotion version.
    pub async fn rollback(&self, id: &str, rolled_back_by: &str) -> Result<Experiment, CoreError> {
        let Some(experiment) = self.store.get_experiment(id).await? else {
            return Err(CoreError::NotFound(format!("experiment {id}")));
        };
        if !experiment.phase.is_terminal() {
            return Err(CoreError::StateMachineViolation(format!(
                "experiment {id} is still active; stop or cancel it first"
            )));
        }
        self.enqueue_teardown_tasks(&experiment, true).await;

        if let Some(deployment_id) = &experiment.promoted_deployment_id {
            match self.store.get_deployment(deployment_id, false).await? {
                Some(deployment) if deployment.current_version > 1 => {
                    self.registry
                        .rollback(
                            deployment_id,
                            deployment.current_version - 1,
                            rolled_back_by,
                            Some(format!("rollback of experiment {id} promotion")),
                        )
                        .await?;
                }
                Some(_) => {
                    // Promotion created the deployment outright; retire it.
                    self.registry.soft_delete(deployment_id).await?;
                }
                None => {}
            }
        }
        info!(experiment_id = %id, "experiment rolled back");
        self.publish(topics::EXPERIMENT_UPDATED, &experiment);
        Ok(experiment)
    }

    // -----------------------------------------------------------------------
    // Task and metric feedback
    // -----------------------------------------------------------------------

    /// Route a task's terminal transition back into the experiment state
    /// machine. Invoked by the agent endpoint after Complete/Fail and by
    /// the reaper for timed-out tasks.
    pub async fn handle_task_update(&self, task: &Task) -> Result<(), CoreError> {
        let Some(experiment_id) = &task.experiment_id else {
            return Ok(());
        };
        match task.status {
            TaskStatus::Succeeded if task.task_type == TaskType::DeployPipeline => {
                self.maybe_mark_running(experiment_id).await
            }
            TaskStatus::Failed => self.handle_task_failure(experiment_id, task).await,
            _ => Ok(()),
        }
    }

    /// `deploying -> running` once the last deployment task succeeds.
    async fn maybe_mark_running(&self, experiment_id: &str) -> Result<(), CoreError> {
        let Some(experiment) = self.store.get_experiment(experiment_id).await? else {
            return Ok(());
        };
        if experiment.phase != ExperimentPhase::Deploying {
            return Ok(());
        }
        let tasks = self.store.list_tasks_for_experiment(experiment_id).await?;
        let deploys: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.task_type == TaskType::DeployPipeline)
            .collect();
        if deploys.is_empty() || !deploys.iter().all(|t| t.status == TaskStatus::Succeeded) {
            return Ok(());
        }
        match self
            .store
            .update_experiment_guarded(experiment_id, vec![ExperimentPhase::Deploying], |e| {
                e.phase = ExperimentPhase::Running;
                e.started_at = Some(Utc::now());
                Ok(())
            })
            .await
        {
            Ok(running) => {
                info!(experiment_id = %experiment_id, "experiment running");
                self.publish(topics::EXPERIMENT_STARTED, &running);
                Ok(())
            }
            // A concurrent completion already moved it on; nothing to do.
            Err(CoreError::StateMachineViolation(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn handle_task_failure(&self, experiment_id: &str, task: &Task) -> Result<(), CoreError> {
        let Some(experiment) = self.store.get_experiment(experiment_id).await? else {
            return Ok(());
        };
        if !matches!(
            experiment.phase,
            ExperimentPhase::Initializing | ExperimentPhase::Deploying
        ) {
            warn!(
                experiment_id = %experiment_id,
                task_id = %task.id,
                phase = ?experiment.phase,
                "task failed outside deployment; leaving experiment alone"
            );
            return Ok(());
        }
        let reason = format!(
            "deployment task {} failed: {}",
            task.id,
            task.last_error.as_deref().unwrap_or("unknown error")
        );
        match self
            .store
            .update_experiment_guarded(
                experiment_id,
                vec![ExperimentPhase::Initializing, ExperimentPhase::Deploying],
                move |e| {
                    e.phase = ExperimentPhase::Failed;
                    e.failure_reason = Some(reason);
                    e.completed_at = Some(Utc::now());
                    Ok(())
                },
            )
            .await
        {
            Ok(failed) => {
                let _ = self.dispatch.cancel_for_experiment(experiment_id).await;
                self.enqueue_teardown_tasks(&failed, true).await;
                warn!(experiment_id = %experiment_id, "experiment failed during deployment");
                self.publish(topics::EXPERIMENT_FAILED, &failed);
                Ok(())
            }
            Err(CoreError::StateMachineViolation(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Validate and record agent-reported samples. Samples for experiments
    /// that are not `running` are rejected individually; valid ones are
    /// written and announced with one `metrics.update` per experiment.
    pub async fn record_metrics(
        &self,
        host_id: &str,
        samples: Vec<MetricSample>,
    ) -> Result<(usize, Vec<String>), CoreError> {
        let mut accepted: Vec<MetricSample> = Vec::with_capacity(samples.len());
        let mut rejected = Vec::new();
        let mut running: BTreeMap<String, bool> = BTreeMap::new();

        for mut sample in samples {
            let cached = running.get(&sample.experiment_id).copied();
            let is_running = match cached {
                Some(flag) => flag,
                None => {
                    let flag = matches!(
                        self.store.get_experiment(&sample.experiment_id).await?,
                        Some(e) if e.phase == ExperimentPhase::Running
                    );
                    running.insert(sample.experiment_id.clone(), flag);
                    flag
                }
            };
            if !is_running {
                rejected.push(format!(
                    "experiment {} is not running",
                    sample.experiment_id
                ));
                continue;
            }
            sample.host_id = host_id.to_string();
            accepted.push(sample);
        }

        if accepted.is_empty() {
            return Ok((0, rejected));
        }

        let mut per_experiment: BTreeMap<String, u64> = BTreeMap::new();
        for sample in &accepted {
            *per_experiment.entry(sample.experiment_id.clone()).or_default() += 1;
        }
        let count = accepted.len();
        self.store.insert_metric_samples(accepted).await?;
        for (experiment_id, sample_count) in per_experiment {
            self.bus.publish(Event::new(
                topics::METRICS_UPDATE,
                serde_json::json!({
                    "experiment_id": experiment_id,
                    "host_id": host_id,
                    "samples": sample_count,
                }),
            ));
        }
        Ok((count, rejected))
    }

    // -----------------------------------------------------------------------
    // Scheduler tick
    // -----------------------------------------------------------------------

    /// Periodic pass: elapse running experiments into `analyzing`, and
    /// drive `analyzing` experiments to a terminal verdict.
    pub async fn tick(&self) -> Result<(), CoreError> {
        let now = Utc::now();
        for experiment in self
            .store
            .experiments_in_phase(ExperimentPhase::Running)
            .await?
        {
            if duration_elapsed(&experiment, now) {
                match self
                    .store
                    .update_experiment_guarded(
                        &experiment.id,
                        vec![ExperimentPhase::Running],
                        |e| {
                            e.phase = ExperimentPhase::Analyzing;
                            e.analyzing_since = Some(Utc::now());
                            Ok(())
                        },
                    )
                    .await
                {
                    Ok(analyzing) => {
                        info!(experiment_id = %analyzing.id, "experiment duration elapsed; analyzing");
                        self.publish(topics::EXPERIMENT_UPDATED, &analyzing);
                        self.try_analyze(&analyzing).await?;
                    }
                    // Stop() raced the ticker; the experiment moved on.
                    Err(CoreError::StateMachineViolation(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        }

        for experiment in self
            .store
            .experiments_in_phase(ExperimentPhase::Analyzing)
            .await?
        {
            self.try_analyze(&experiment).await?;
        }
        Ok(())
    }

    /// Attempt the `analyzing -> completed` transition; fall to `failed`
    /// with `insufficient_data` once the grace window closes.
    async fn try_analyze(&self, experiment: &Experiment) -> Result<(), CoreError> {
        let baseline = self
            .store
            .list_metric_samples(&experiment.id, Variant::Baseline)
            .await?;
        let candidate = self
            .store
            .list_metric_samples(&experiment.id, Variant::Candidate)
            .await?;

        match crate::analysis::analyze(&baseline, &candidate, &experiment.success_criteria) {
            Some(results) => {
                let recommendation = results.recommendation;
                match self
                    .store
                    .update_experiment_guarded(
                        &experiment.id,
                        vec![ExperimentPhase::Analyzing],
                        move |e| {
                            e.phase = ExperimentPhase::Completed;
                            e.results = Some(results);
                            e.completed_at = Some(Utc::now());
                            Ok(())
                        },
                    )
                    .await
                {
                    Ok(completed) => {
                        info!(
                            experiment_id = %completed.id,
                            recommendation = ?recommendation,
                            "experiment completed"
                        );
                        self.bus.publish(Event::new(
                            topics::EXPERIMENT_COMPLETED,
                            serde_json::json!({
                                "experiment_id": completed.id,
                                "name": completed.name,
                                "recommendation": recommendation,
                            }),
                        ));
                        Ok(())
                    }
                    Err(CoreError::StateMachineViolation(_)) => Ok(()),
                    Err(err) => Err(err),
                }
            }
            None => {
                let grace_start = experiment
                    .analyzing_since
                    .unwrap_or(experiment.updated_at);
                if Utc::now() < grace_start + self.settings.analysis_grace {
                    return Ok(());
                }
                match self
                    .store
                    .update_experiment_guarded(
                        &experiment.id,
                        vec![ExperimentPhase::Analyzing],
                        |e| {
                            e.phase = ExperimentPhase::Failed;
                            e.failure_reason = Some("insufficient_data".into());
                            e.completed_at = Some(Utc::now());
                            Ok(())
                        },
                    )
                    .await
                {
                    Ok(failed) => {
                        warn!(experiment_id = %failed.id, "experiment failed: insufficient data");
                        self.publish(topics::EXPERIMENT_FAILED, &failed);
                        Ok(())
                    }
                    Err(CoreError::StateMachineViolation(_)) => Ok(()),
                    Err(err) => Err(err),
                }
            }
        }
    }
}

fn duration_elapsed(experiment: &Experiment, now: DateTime<Utc>) -> bool {
    match experiment.started_at {
        Some(started) => started + Duration::seconds(experiment.duration_secs as i64) <= now,
        None => false,
    }
}
