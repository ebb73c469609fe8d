use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use px_core::bus::EventBus;
use px_core::store::Store;
use px_core::types::*;
use px_core::CoreError;
use px_engine::engine::{EngineSettings, ExperimentEngine, ExperimentPatch, NewExperiment};
use px_engine::queue::{QueueSettings, TaskQueue};
use px_engine::registry::DeploymentRegistry;
use px_engine::shutdown::ShutdownSignal;

struct Harness {
    store: Arc<Store>,
    bus: EventBus,
    queue: Arc<TaskQueue>,
    engine: ExperimentEngine,
}

async fn harness() -> Harness {
    harness_with_grace(chrono::Duration::zero()).await
}

async fn harness_with_grace(grace: chrono::Duration) -> Harness {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let bus = EventBus::new();
    let queue = Arc::new(TaskQueue::new(
        store.clone(),
        bus.clone(),
        QueueSettings::default(),
        ShutdownSignal::new(),
    ));
    let registry = Arc::new(DeploymentRegistry::new(store.clone(), bus.clone()));
    let engine = ExperimentEngine::new(
        store.clone(),
        bus.clone(),
        queue.clone(),
        registry,
        EngineSettings {
            analysis_grace: grace,
        },
    );
    Harness {
        store,
        bus,
        queue,
        engine,
    }
}

fn new_experiment(hosts: &[&str], duration_secs: u64) -> NewExperiment {
    let mut parameters = BTreeMap::new();
    parameters.insert("COLLECTION_INTERVAL".into(), "10s".into());
    parameters.insert("METRICS_ENDPOINT".into(), "http://pushgateway:9091".into());
    NewExperiment {
        name: "cut-process-cardinality".into(),
        description: None,
        baseline_pipeline: "process-baseline-v1".into(),
        candidate_pipeline: "process-topk-v1".into(),
        target_hosts: hosts.iter().map(|h| h.to_string()).collect(),
        selectors: vec![],
        parameters,
        duration_secs,
        success_criteria: SuccessCriteria {
            min_cardinality_reduction: Some(50.0),
            ..SuccessCriteria::default()
        },
    }
}

fn samples(experiment_id: &str, variant: Variant, cardinality: u64, count: usize) -> Vec<MetricSample> {
    (0..count)
        .map(|_| MetricSample {
            experiment_id: experiment_id.into(),
            variant,
            host_id: String::new(), // overwritten by record_metrics
            timestamp: Utc::now(),
            cardinality,
            cost_per_minute: cardinality as f64 * 0.001,
            dropped_count: 0,
            extra: BTreeMap::new(),
        })
        .collect()
}

/// Drive every pending deploy task to completion through the agent path.
async fn complete_deploys(h: &Harness, hosts: &[&str]) {
    for host in hosts {
        loop {
            let Some(task) = h.queue.lease(host, &[], StdDuration::ZERO).await.unwrap() else {
                break;
            };
            let done = h
                .queue
                .complete(&task.id, host, Some(serde_json::json!({"applied": true})))
                .await
                .unwrap();
            h.engine.handle_task_update(&done).await.unwrap();
        }
    }
}

// ---------------------------------------------------------------------------
// Creation and validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_validates_fields() {
    let h = harness().await;
    let mut bad = new_experiment(&[], 60);
    bad.name = "".into();
    let err = h.engine.create(bad).await.unwrap_err();
    match err {
        CoreError::Validation { fields, .. } => {
            assert!(fields.contains_key("name"));
            assert!(fields.contains_key("target_hosts"));
        }
        other => panic!("expected validation, got {other:?}"),
    }
}

#[tokio::test]
async fn identical_pipelines_warn_but_are_accepted() {
    let h = harness().await;
    let mut req = new_experiment(&["h1"], 60);
    req.candidate_pipeline = req.baseline_pipeline.clone();
    let (experiment, warnings) = h.engine.create(req).await.unwrap();
    assert_eq!(experiment.phase, ExperimentPhase::Pending);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("identical"));
}

#[tokio::test]
async fn create_emits_experiment_created() {
    let h = harness().await;
    let sub = h.bus.subscribe(&["experiment.*"]);
    let (experiment, _) = h.engine.create(new_experiment(&["h1"], 60)).await.unwrap();
    let event = sub.recv().await.unwrap();
    assert_eq!(event.kind, "experiment.created");
    assert_eq!(event.data["experiment_id"], experiment.id.as_str());
}

#[tokio::test]
async fn update_only_while_pending() {
    let h = harness().await;
    let (experiment, _) = h.engine.create(new_experiment(&["h1"], 60)).await.unwrap();
    let updated = h
        .engine
        .update(
            &experiment.id,
            ExperimentPatch {
                duration_secs: Some(120),
                ..ExperimentPatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.duration_secs, 120);

    h.engine.start(&experiment.id).await.unwrap();
    let err = h
        .engine
        .update(
            &experiment.id,
            ExperimentPatch {
                duration_secs: Some(30),
                ..ExperimentPatch::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::StateMachineViolation(_)));
}

// ---------------------------------------------------------------------------
// Happy-path A/B (seed scenario 1, with a compressed duration)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_ab_experiment_promotes() {
    let h = harness().await;
    let (experiment, _) = h.engine.create(new_experiment(&["h1", "h2"], 1)).await.unwrap();

    let started = h.engine.start(&experiment.id).await.unwrap();
    assert_eq!(started.phase, ExperimentPhase::Deploying);

    // Two hosts, two variants each.
    let tasks = h.store.list_tasks_for_experiment(&experiment.id).await.unwrap();
    assert_eq!(tasks.len(), 4);
    assert!(tasks.iter().all(|t| t.task_type == TaskType::DeployPipeline));

    complete_deploys(&h, &["h1", "h2"]).await;
    let running = h.store.get_experiment(&experiment.id).await.unwrap().unwrap();
    assert_eq!(running.phase, ExperimentPhase::Running);
    assert!(running.started_at.is_some());

    // 30 samples per variant per host: baseline ~10000, candidate ~3000.
    for host in ["h1", "h2"] {
        let (accepted, rejected) = h
            .engine
            .record_metrics(host, samples(&experiment.id, Variant::Baseline, 10_000, 30))
            .await
            .unwrap();
        assert_eq!((accepted, rejected.len()), (30, 0));
        h.engine
            .record_metrics(host, samples(&experiment.id, Variant::Candidate, 3_000, 30))
            .await
            .unwrap();
    }

    tokio::time::sleep(StdDuration::from_millis(1100)).await;
    h.engine.tick().await.unwrap();

    let completed = h.store.get_experiment(&experiment.id).await.unwrap().unwrap();
    assert_eq!(completed.phase, ExperimentPhase::Completed);
    assert!(completed.completed_at.is_some());
    assert!(completed.started_at.unwrap() <= completed.completed_at.unwrap());
    let results = completed.results.unwrap();
    assert_eq!(results.recommendation, Recommendation::Promote);
    assert!((results.cardinality_reduction_pct - 70.0).abs() < 0.5);

    // A second tick must not double-transition the terminal experiment.
    h.engine.tick().await.unwrap();
    let still = h.store.get_experiment(&experiment.id).await.unwrap().unwrap();
    assert_eq!(still.phase, ExperimentPhase::Completed);
}

// ---------------------------------------------------------------------------
// Insufficient data (seed scenario 2)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn baseline_only_metrics_fail_with_insufficient_data() {
    let h = harness().await; // zero grace
    let (experiment, _) = h.engine.create(new_experiment(&["h1"], 1)).await.unwrap();
    h.engine.start(&experiment.id).await.unwrap();
    complete_deploys(&h, &["h1"]).await;

    h.engine
        .record_metrics("h1", samples(&experiment.id, Variant::Baseline, 10_000, 30))
        .await
        .unwrap();

    tokio::time::sleep(StdDuration::from_millis(1100)).await;
    h.engine.tick().await.unwrap();

    let failed = h.store.get_experiment(&experiment.id).await.unwrap().unwrap();
    assert_eq!(failed.phase, ExperimentPhase::Failed);
    assert_eq!(failed.failure_reason.as_deref(), Some("insufficient_data"));
}

#[tokio::test]
async fn grace_period_defers_insufficient_data_verdict() {
    let h = harness_with_grace(chrono::Duration::minutes(5)).await;
    let (experiment, _) = h.engine.create(new_experiment(&["h1"], 1)).await.unwrap();
    h.engine.start(&experiment.id).await.unwrap();
    complete_deploys(&h, &["h1"]).await;

    tokio::time::sleep(StdDuration::from_millis(1100)).await;
    h.engine.tick().await.unwrap();

    // No data at all, but the grace window is open: still analyzing.
    let analyzing = h.store.get_experiment(&experiment.id).await.unwrap().unwrap();
    assert_eq!(analyzing.phase, ExperimentPhase::Analyzing);
}

// ---------------------------------------------------------------------------
// Deployment failure during deploying
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deploy_failure_fails_experiment_and_enqueues_rollback() {
    let h = harness().await;
    let (experiment, _) = h.engine.create(new_experiment(&["h1"], 60)).await.unwrap();
    h.engine.start(&experiment.id).await.unwrap();

    let task = h.queue.lease("h1", &[], StdDuration::ZERO).await.unwrap().unwrap();
    let failed_task = h
        .queue
        .fail(&task.id, "h1", "collector refused config", false)
        .await
        .unwrap();
    h.engine.handle_task_update(&failed_task).await.unwrap();

    let experiment = h.store.get_experiment(&experiment.id).await.unwrap().unwrap();
    assert_eq!(experiment.phase, ExperimentPhase::Failed);
    assert!(experiment
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("collector refused config"));

    // Best-effort rollback tasks were enqueued for the candidate.
    let tasks = h.store.list_tasks_for_experiment(&experiment.id).await.unwrap();
    assert!(tasks
        .iter()
        .any(|t| t.task_type == TaskType::RollbackPipeline && t.status == TaskStatus::Pending));
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_cascades_tasks_and_enqueues_teardown() {
    let h = harness().await;
    let (experiment, _) = h.engine.create(new_experiment(&["h1", "h2"], 60)).await.unwrap();
    h.engine.start(&experiment.id).await.unwrap();

    let cancelled = h.engine.cancel(&experiment.id).await.unwrap();
    assert_eq!(cancelled.phase, ExperimentPhase::Cancelled);
    assert!(cancelled.completed_at.is_some());

    let tasks = h.store.list_tasks_for_experiment(&experiment.id).await.unwrap();
    // Deploy tasks were cancelled; teardown delete tasks were added after.
    assert!(tasks
        .iter()
        .filter(|t| t.task_type == TaskType::DeployPipeline)
        .all(|t| t.status == TaskStatus::Cancelled));
    assert!(tasks
        .iter()
        .any(|t| t.task_type == TaskType::DeletePipeline && t.status == TaskStatus::Pending));

    // Cancel of a terminal experiment is refused.
    let err = h.engine.cancel(&experiment.id).await.unwrap_err();
    assert!(matches!(err, CoreError::StateMachineViolation(_)));
}

// ---------------------------------------------------------------------------
// Promote + rollback
// ---------------------------------------------------------------------------

async fn drive_to_completed(h: &Harness) -> Experiment {
    let (experiment, _) = h.engine.create(new_experiment(&["h1"], 1)).await.unwrap();
    h.engine.start(&experiment.id).await.unwrap();
    complete_deploys(h, &["h1"]).await;
    h.engine
        .record_metrics("h1", samples(&experiment.id, Variant::Baseline, 10_000, 30))
        .await
        .unwrap();
    h.engine
        .record_metrics("h1", samples(&experiment.id, Variant::Candidate, 3_000, 30))
        .await
        .unwrap();
    tokio::time::sleep(StdDuration::from_millis(1100)).await;
    h.engine.tick().await.unwrap();
    h.store.get_experiment(&experiment.id).await.unwrap().unwrap()
}

#[tokio::test]
async fn promote_creates_deployment_from_candidate() {
    let h = harness().await;
    let completed = drive_to_completed(&h).await;
    assert_eq!(completed.phase, ExperimentPhase::Completed);

    let promoted = h.engine.promote(&completed.id, "alice").await.unwrap();
    let deployment_id = promoted.promoted_deployment_id.unwrap();
    let deployment = h.store.get_deployment(&deployment_id, false).await.unwrap().unwrap();
    assert_eq!(deployment.pipeline_template, "process-topk-v1");

    let versions = h.store.list_deployment_versions(&deployment_id).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert!(versions[0]
        .notes
        .as_deref()
        .unwrap()
        .contains(&format!("promoted from experiment {}", completed.id)));
}

#[tokio::test]
async fn promote_requires_promote_recommendation() {
    let h = harness().await;
    let (experiment, _) = h.engine.create(new_experiment(&["h1"], 60)).await.unwrap();
    let err = h.engine.promote(&experiment.id, "alice").await.unwrap_err();
    assert!(matches!(err, CoreError::StateMachineViolation(_)));
}

#[tokio::test]
async fn rollback_retires_promotion_and_enqueues_teardown() {
    let h = harness().await;
    let completed = drive_to_completed(&h).await;
    let promoted = h.engine.promote(&completed.id, "alice").await.unwrap();
    let deployment_id = promoted.promoted_deployment_id.clone().unwrap();

    h.engine.rollback(&completed.id, "alice").await.unwrap();

    // Fresh promotion (version 1): the deployment is retired outright.
    assert!(h
        .store
        .get_deployment(&deployment_id, false)
        .await
        .unwrap()
        .is_none());
    let tasks = h.store.list_tasks_for_experiment(&completed.id).await.unwrap();
    assert!(tasks.iter().any(|t| t.task_type == TaskType::RollbackPipeline));
}

// ---------------------------------------------------------------------------
// Metrics validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn metrics_for_non_running_experiment_are_rejected() {
    let h = harness().await;
    let (experiment, _) = h.engine.create(new_experiment(&["h1"], 60)).await.unwrap();

    let (accepted, rejected) = h
        .engine
        .record_metrics("h1", samples(&experiment.id, Variant::Baseline, 100, 3))
        .await
        .unwrap();
    assert_eq!(accepted, 0);
    assert_eq!(rejected.len(), 3);

    let (accepted, rejected) = h
        .engine
        .record_metrics("h1", samples("exp-unknown", Variant::Baseline, 100, 1))
        .await
        .unwrap();
    assert_eq!(accepted, 0);
    assert_eq!(rejected.len(), 1);
}

#[tokio::test]
async fn metrics_update_event_emitted_per_experiment() {
    let h = harness().await;
    let sub = h.bus.subscribe(&["metrics.update"]);
    let (experiment, _) = h.engine.create(new_experiment(&["h1"], 60)).await.unwrap();
    h.engine.start(&experiment.id).await.unwrap();
    complete_deploys(&h, &["h1"]).await;

    h.engine
        .record_metrics("h1", samples(&experiment.id, Variant::Baseline, 100, 5))
        .await
        .unwrap();
    let event = sub.recv().await.unwrap();
    assert_eq!(event.kind, "metrics.update");
    assert_eq!(event.data["experiment_id"], experiment.id.as_str());
    assert_eq!(event.data["samples"], 5);
}
