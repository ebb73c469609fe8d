use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use px_core::store::Store;
use px_core::types::*;
use px_core::CoreError;

async fn store() -> Store {
    Store::open_in_memory().await.unwrap()
}

fn sample(experiment_id: &str, variant: Variant, host: &str, cardinality: u64) -> MetricSample {
    MetricSample {
        experiment_id: experiment_id.into(),
        variant,
        host_id: host.into(),
        timestamp: Utc::now(),
        cardinality,
        cost_per_minute: cardinality as f64 * 0.001,
        dropped_count: 0,
        extra: BTreeMap::new(),
    }
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn migrations_apply_once_and_are_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("phoenix.db");
    {
        let store = Store::open(&path).await.unwrap();
        assert_eq!(store.applied_migrations().await.unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }
    // Re-open: nothing new to apply, schema intact.
    let store = Store::open(&path).await.unwrap();
    assert_eq!(store.applied_migrations().await.unwrap(), vec![1, 2, 3, 4, 5, 6]);
    store.ping().await.unwrap();
}

// ---------------------------------------------------------------------------
// Experiments
// ---------------------------------------------------------------------------

#[tokio::test]
async fn experiment_round_trip() {
    let store = store().await;
    let mut experiment = Experiment::new("cut-cardinality", "process-baseline-v1", "process-topk-v1");
    experiment.target_hosts = vec!["h1".into(), "h2".into()];
    experiment
        .parameters
        .insert("collector_type".into(), "nrdot".into());
    store.insert_experiment(&experiment).await.unwrap();

    let loaded = store.get_experiment(&experiment.id).await.unwrap().unwrap();
    assert_eq!(loaded.name, "cut-cardinality");
    assert_eq!(loaded.phase, ExperimentPhase::Pending);
    assert_eq!(loaded.target_hosts, vec!["h1", "h2"]);
    assert_eq!(loaded.parameters["collector_type"], "nrdot");
}

#[tokio::test]
async fn guarded_transition_enforces_expected_phase() {
    let store = store().await;
    let experiment = Experiment::new("e", "a", "b");
    store.insert_experiment(&experiment).await.unwrap();

    let updated = store
        .update_experiment_guarded(&experiment.id, vec![ExperimentPhase::Pending], |e| {
            e.phase = ExperimentPhase::Initializing;
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(updated.phase, ExperimentPhase::Initializing);

    // Same precondition again: the phase moved on, so the guard refuses.
    let err = store
        .update_experiment_guarded(&experiment.id, vec![ExperimentPhase::Pending], |e| {
            e.phase = ExperimentPhase::Initializing;
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::StateMachineViolation(_)));
}

#[tokio::test]
async fn guarded_transition_missing_experiment_is_not_found() {
    let store = store().await;
    let err = store
        .update_experiment_guarded("exp-missing", vec![], |_| Ok(()))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
}

#[tokio::test]
async fn list_experiments_filters_by_phase() {
    let store = store().await;
    for i in 0..3 {
        let mut e = Experiment::new(format!("e{i}"), "a", "b");
        if i == 0 {
            e.phase = ExperimentPhase::Running;
        }
        store.insert_experiment(&e).await.unwrap();
    }
    let running = store
        .list_experiments(Some(ExperimentPhase::Running), 50, 0)
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    let all = store.list_experiments(None, 50, 0).await.unwrap();
    assert_eq!(all.len(), 3);
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dequeue_honors_priority_then_age_then_id() {
    let store = store().await;
    let mut low = Task::new(TaskType::DeployPipeline, "h1");
    low.priority = 1;
    let mut high = Task::new(TaskType::DeployPipeline, "h1");
    high.priority = 10;
    high.created_at = low.created_at + Duration::seconds(5);
    store.insert_task(&low).await.unwrap();
    store.insert_task(&high).await.unwrap();

    let first = store
        .dequeue_task("h1", vec!["h1".into()], Duration::minutes(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.id, high.id);
    assert_eq!(first.status, TaskStatus::Leased);
    assert_eq!(first.attempts, 1);
    assert_eq!(first.leased_by.as_deref(), Some("h1"));
    assert!(first.lease_expires_at.is_some());

    let second = store
        .dequeue_task("h1", vec!["h1".into()], Duration::minutes(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.id, low.id);

    // Queue drained.
    assert!(store
        .dequeue_task("h1", vec!["h1".into()], Duration::minutes(5))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn dequeue_skips_other_hosts_and_backoff_rows() {
    let store = store().await;
    let other_host = Task::new(TaskType::DeployPipeline, "h2");
    store.insert_task(&other_host).await.unwrap();

    let mut backed_off = Task::new(TaskType::DeployPipeline, "h1");
    backed_off.not_before = Some(Utc::now() + Duration::minutes(5));
    store.insert_task(&backed_off).await.unwrap();

    assert!(store
        .dequeue_task("h1", vec!["h1".into()], Duration::minutes(5))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn dequeue_matches_capability_selectors() {
    let store = store().await;
    let task = Task::new(TaskType::LoadsimStart, "cap:loadsim");
    store.insert_task(&task).await.unwrap();

    // Agent without the capability sees nothing.
    assert!(store
        .dequeue_task("h1", vec!["h1".into()], Duration::minutes(5))
        .await
        .unwrap()
        .is_none());

    let leased = store
        .dequeue_task("h1", vec!["h1".into(), "cap:loadsim".into()], Duration::minutes(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(leased.id, task.id);
    assert_eq!(leased.leased_by.as_deref(), Some("h1"));
}

#[tokio::test]
async fn lease_guards_reject_non_holders() {
    let store = store().await;
    let task = Task::new(TaskType::DeployPipeline, "h1");
    store.insert_task(&task).await.unwrap();
    store
        .dequeue_task("h1", vec!["h1".into()], Duration::minutes(5))
        .await
        .unwrap()
        .unwrap();

    // A different agent cannot heartbeat or complete the task.
    let err = store
        .extend_lease(&task.id, "h2", Duration::minutes(5))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::LeaseLost { .. }));
    let err = store.complete_task(&task.id, "h2", None).await.unwrap_err();
    assert!(matches!(err, CoreError::LeaseLost { .. }));

    // The holder can.
    store
        .extend_lease(&task.id, "h1", Duration::minutes(5))
        .await
        .unwrap();
    let done = store
        .complete_task(&task.id, "h1", Some(serde_json::json!({"ok": true})))
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Succeeded);

    // Duplicate complete after the terminal transition is refused.
    let err = store.complete_task(&task.id, "h1", None).await.unwrap_err();
    assert!(matches!(err, CoreError::LeaseLost { .. }));
}

#[tokio::test]
async fn retriable_failure_requeues_with_backoff() {
    let store = store().await;
    let task = Task::new(TaskType::DeployPipeline, "h1");
    store.insert_task(&task).await.unwrap();
    store
        .dequeue_task("h1", vec!["h1".into()], Duration::minutes(5))
        .await
        .unwrap()
        .unwrap();

    let failed = store
        .fail_task(
            &task.id,
            "h1",
            "collector restart timed out",
            true,
            Duration::seconds(5),
            Duration::minutes(5),
        )
        .await
        .unwrap();
    assert_eq!(failed.status, TaskStatus::Pending);
    assert_eq!(failed.attempts, 1);
    assert!(failed.not_before.unwrap() > Utc::now());
    assert_eq!(failed.last_error.as_deref(), Some("collector restart timed out"));
    assert!(failed.leased_by.is_none());
}

#[tokio::test]
async fn exhausted_attempts_fail_terminally() {
    let store = store().await;
    let mut task = Task::new(TaskType::DeployPipeline, "h1");
    task.max_attempts = 1;
    store.insert_task(&task).await.unwrap();
    store
        .dequeue_task("h1", vec!["h1".into()], Duration::minutes(5))
        .await
        .unwrap()
        .unwrap();

    let failed = store
        .fail_task(
            &task.id,
            "h1",
            "boom",
            true,
            Duration::seconds(5),
            Duration::minutes(5),
        )
        .await
        .unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.attempts, 1);
}

#[tokio::test]
async fn cancel_is_idempotent_and_preserves_attempts() {
    let store = store().await;
    let task = Task::new(TaskType::LoadsimStop, "h1");
    store.insert_task(&task).await.unwrap();

    let once = store.cancel_task(&task.id).await.unwrap();
    assert_eq!(once.status, TaskStatus::Cancelled);
    let twice = store.cancel_task(&task.id).await.unwrap();
    assert_eq!(twice.status, TaskStatus::Cancelled);
    assert_eq!(once.attempts, twice.attempts);
}

#[tokio::test]
async fn reaper_requeues_or_fails_expired_leases() {
    let store = store().await;
    let recoverable = Task::new(TaskType::DeployPipeline, "h1");
    store.insert_task(&recoverable).await.unwrap();
    let mut exhausted = Task::new(TaskType::DeployPipeline, "h2");
    exhausted.max_attempts = 1;
    store.insert_task(&exhausted).await.unwrap();

    // Lease both with an already-expired lease.
    store
        .dequeue_task("h1", vec!["h1".into()], Duration::seconds(-1))
        .await
        .unwrap()
        .unwrap();
    store
        .dequeue_task("h2", vec!["h2".into()], Duration::seconds(-1))
        .await
        .unwrap()
        .unwrap();

    let outcome = store.reap_expired_leases().await.unwrap();
    assert_eq!(outcome.requeued.len(), 1);
    assert_eq!(outcome.requeued[0].id, recoverable.id);
    assert_eq!(outcome.requeued[0].status, TaskStatus::Pending);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].id, exhausted.id);
    assert_eq!(outcome.failed[0].status, TaskStatus::Failed);

    // The requeued task can be leased again; attempts keep growing.
    let again = store
        .dequeue_task("h1", vec!["h1".into()], Duration::minutes(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.attempts, 2);
}

#[tokio::test]
async fn cancel_cascade_for_experiment() {
    let store = store().await;
    let mut t1 = Task::new(TaskType::DeployPipeline, "h1");
    t1.experiment_id = Some("exp-1".into());
    let mut t2 = Task::new(TaskType::LoadsimStart, "h1");
    t2.experiment_id = Some("exp-1".into());
    store.insert_task(&t1).await.unwrap();
    store.insert_task(&t2).await.unwrap();

    let cancelled = store.cancel_tasks_for_experiment("exp-1").await.unwrap();
    assert_eq!(cancelled, 2);
    assert_eq!(
        store.get_task(&t1.id).await.unwrap().unwrap().status,
        TaskStatus::Cancelled
    );
}

// ---------------------------------------------------------------------------
// Deployments
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deployment_versioning_and_rollback_snapshots() {
    let store = store().await;
    let deployment = PipelineDeployment::new("edge-metrics", "process-baseline-v1");
    let v1 = DeploymentVersion {
        deployment_id: deployment.id.clone(),
        version: 1,
        config_snapshot: serde_json::json!({"template": "A"}),
        parameters_snapshot: BTreeMap::new(),
        deployed_by: "alice".into(),
        deployed_at: Utc::now(),
        notes: None,
    };
    store.create_deployment(&deployment, &v1).await.unwrap();

    // Update to template B -> version 2.
    let (after_update, v2) = store
        .append_deployment_version(
            &deployment.id,
            serde_json::json!({"template": "B"}),
            BTreeMap::new(),
            "alice",
            Some("switch to B".into()),
        )
        .await
        .unwrap();
    assert_eq!(v2.version, 2);
    assert_eq!(after_update.current_version, 2);

    // Roll back to v1's snapshot -> version 3 equal to version 1.
    let target = store
        .get_deployment_version(&deployment.id, 1)
        .await
        .unwrap()
        .unwrap();
    let (after_rollback, v3) = store
        .append_deployment_version(
            &deployment.id,
            target.config_snapshot.clone(),
            target.parameters_snapshot.clone(),
            "alice",
            Some("rollback to v1".into()),
        )
        .await
        .unwrap();
    assert_eq!(v3.version, 3);
    assert_eq!(after_rollback.current_version, 3);
    assert_eq!(v3.config_snapshot, target.config_snapshot);

    // ListVersions returns [3, 2, 1].
    let versions = store.list_deployment_versions(&deployment.id).await.unwrap();
    assert_eq!(versions.iter().map(|v| v.version).collect::<Vec<_>>(), vec![3, 2, 1]);
}

#[tokio::test]
async fn soft_deleted_deployments_hidden_from_default_listing() {
    let store = store().await;
    let deployment = PipelineDeployment::new("doomed", "process-baseline-v1");
    let v1 = DeploymentVersion {
        deployment_id: deployment.id.clone(),
        version: 1,
        config_snapshot: serde_json::json!({}),
        parameters_snapshot: BTreeMap::new(),
        deployed_by: "alice".into(),
        deployed_at: Utc::now(),
        notes: None,
    };
    store.create_deployment(&deployment, &v1).await.unwrap();
    store.soft_delete_deployment(&deployment.id).await.unwrap();

    assert!(store.list_deployments(false, 50, 0).await.unwrap().is_empty());
    assert_eq!(store.list_deployments(true, 50, 0).await.unwrap().len(), 1);
    assert!(store
        .get_deployment(&deployment.id, false)
        .await
        .unwrap()
        .is_none());
    // Versions survive a soft delete for audit.
    assert_eq!(store.list_deployment_versions(&deployment.id).await.unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_contact_registers_agent() {
    let store = store().await;
    assert!(store.get_agent("h1").await.unwrap().is_none());
    let (agent, prior) = store
        .touch_agent("h1", Some(vec!["loadsim".into()]), None)
        .await
        .unwrap();
    assert_eq!(agent.status, AgentStatus::Online);
    assert_eq!(agent.capabilities, vec!["loadsim"]);
    assert!(prior.is_none());

    let loaded = store.get_agent("h1").await.unwrap().unwrap();
    assert_eq!(loaded.host_id, "h1");

    // Second contact reports the prior status.
    let (_, prior) = store.touch_agent("h1", None, None).await.unwrap();
    assert_eq!(prior, Some(AgentStatus::Online));
}

#[tokio::test]
async fn liveness_marks_stale_agents_offline() {
    let store = store().await;
    let mut agent = Agent::new("h1");
    agent.last_heartbeat_at = Utc::now() - Duration::seconds(120);
    store.upsert_agent(&agent).await.unwrap();

    let transitions = store.refresh_agent_liveness(30, 90).await.unwrap();
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].1, AgentStatus::Offline);
    assert_eq!(
        store.get_agent("h1").await.unwrap().unwrap().status,
        AgentStatus::Offline
    );

    // Second pass: no further transitions.
    assert!(store.refresh_agent_liveness(30, 90).await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Metric samples + revoked tokens
// ---------------------------------------------------------------------------

#[tokio::test]
async fn metric_samples_round_trip() {
    let store = store().await;
    store
        .insert_metric_samples(vec![
            sample("exp-1", Variant::Baseline, "h1", 10_000),
            sample("exp-1", Variant::Candidate, "h1", 3_000),
        ])
        .await
        .unwrap();

    let baseline = store
        .list_metric_samples("exp-1", Variant::Baseline)
        .await
        .unwrap();
    assert_eq!(baseline.len(), 1);
    assert_eq!(baseline[0].cardinality, 10_000);
    assert_eq!(store.count_metric_samples("exp-1").await.unwrap(), 2);
}

#[tokio::test]
async fn prune_only_touches_terminal_experiments() {
    let store = store().await;
    let mut done = Experiment::new("done", "a", "b");
    done.phase = ExperimentPhase::Completed;
    let live = Experiment::new("live", "a", "b");
    store.insert_experiment(&done).await.unwrap();
    store.insert_experiment(&live).await.unwrap();

    let mut old = sample(&done.id, Variant::Baseline, "h1", 100);
    old.timestamp = Utc::now() - Duration::days(60);
    let mut old_live = sample(&live.id, Variant::Baseline, "h1", 100);
    old_live.timestamp = Utc::now() - Duration::days(60);
    store.insert_metric_samples(vec![old, old_live]).await.unwrap();

    let pruned = store
        .prune_metric_samples(Utc::now() - Duration::days(30))
        .await
        .unwrap();
    assert_eq!(pruned, 1);
    assert_eq!(store.count_metric_samples(&live.id).await.unwrap(), 1);
}

#[tokio::test]
async fn token_revocation_and_sweep() {
    let store = store().await;
    store
        .revoke_token("jti-live", Utc::now() + Duration::hours(1))
        .await
        .unwrap();
    store
        .revoke_token("jti-stale", Utc::now() - Duration::hours(1))
        .await
        .unwrap();

    assert!(store.is_token_revoked("jti-live").await.unwrap());
    assert!(!store.is_token_revoked("jti-unknown").await.unwrap());

    let swept = store.sweep_revoked_tokens().await.unwrap();
    assert_eq!(swept, 1);
    assert!(store.is_token_revoked("jti-live").await.unwrap());
    assert!(!store.is_token_revoked("jti-stale").await.unwrap());
}
