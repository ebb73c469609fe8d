use std::collections::BTreeMap;
use std::sync::Arc;

use px_core::bus::EventBus;
use px_core::store::Store;
use px_core::CoreError;
use px_engine::registry::{DeploymentRegistry, DeploymentSpec};

async fn registry() -> (DeploymentRegistry, EventBus) {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let bus = EventBus::new();
    (DeploymentRegistry::new(store, bus.clone()), bus)
}

fn parameters() -> BTreeMap<String, String> {
    let mut p = BTreeMap::new();
    p.insert("COLLECTION_INTERVAL".into(), "10s".into());
    p.insert("METRICS_ENDPOINT".into(), "http://pushgateway:9091".into());
    p
}

fn spec(name: &str, template: &str) -> DeploymentSpec {
    DeploymentSpec {
        name: name.into(),
        pipeline_template: template.into(),
        namespace: "default".into(),
        target_nodes: vec!["h1".into()],
        parameters: parameters(),
    }
}

#[tokio::test]
async fn create_renders_template_into_version_one() {
    let (registry, _bus) = registry().await;
    let (deployment, version) = registry
        .create(spec("edge", "process-baseline-v1"), "alice", None)
        .await
        .unwrap();
    assert_eq!(deployment.current_version, 1);
    assert_eq!(version.version, 1);
    // Variables were substituted into the snapshot.
    assert_eq!(
        version.config_snapshot["exporters"]["prometheusremotewrite"]["endpoint"],
        "http://pushgateway:9091"
    );

    let active = registry.get_active_config(&deployment.id).await.unwrap();
    assert_eq!(active, version.config_snapshot);
}

#[tokio::test]
async fn unknown_template_is_a_validation_error() {
    let (registry, _bus) = registry().await;
    let err = registry
        .create(spec("edge", "no-such-template"), "alice", None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation { .. }));
}

#[tokio::test]
async fn missing_template_variables_are_a_validation_error() {
    let (registry, _bus) = registry().await;
    let mut bad = spec("edge", "process-baseline-v1");
    bad.parameters.remove("METRICS_ENDPOINT");
    let err = registry.create(bad, "alice", None).await.unwrap_err();
    match err {
        CoreError::Validation { fields, .. } => {
            assert!(fields["parameters"].contains("METRICS_ENDPOINT"));
        }
        other => panic!("expected validation, got {other:?}"),
    }
}

#[tokio::test]
async fn update_then_rollback_reproduces_prior_snapshot() {
    // Seed scenario 4: create A (v1), update to B (v2), rollback to v1 ->
    // v3 whose snapshot equals v1's; ListVersions returns [3, 2, 1].
    let (registry, _bus) = registry().await;
    let (deployment, v1) = registry
        .create(spec("edge", "process-baseline-v1"), "alice", None)
        .await
        .unwrap();

    let (_, v2) = registry
        .update(
            &deployment.id,
            spec("edge", "process-topk-v1"),
            "alice",
            Some("try topk".into()),
        )
        .await
        .unwrap();
    assert_eq!(v2.version, 2);
    assert_ne!(v2.config_snapshot, v1.config_snapshot);

    let (rolled, v3) = registry
        .rollback(&deployment.id, 1, "alice", None)
        .await
        .unwrap();
    assert_eq!(v3.version, 3);
    assert_eq!(rolled.current_version, 3);
    assert_eq!(v3.config_snapshot, v1.config_snapshot);
    assert_eq!(v3.notes.as_deref(), Some("rollback to v1"));

    let versions = registry.list_versions(&deployment.id).await.unwrap();
    assert_eq!(
        versions.iter().map(|v| v.version).collect::<Vec<_>>(),
        vec![3, 2, 1]
    );

    // Round trip: the active config now equals the v1 snapshot.
    let active = registry.get_active_config(&deployment.id).await.unwrap();
    assert_eq!(active, v1.config_snapshot);
}

#[tokio::test]
async fn rollback_to_missing_version_is_not_found() {
    let (registry, _bus) = registry().await;
    let (deployment, _) = registry
        .create(spec("edge", "process-baseline-v1"), "alice", None)
        .await
        .unwrap();
    let err = registry
        .rollback(&deployment.id, 7, "alice", None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
}

#[tokio::test]
async fn soft_delete_hides_but_keeps_history() {
    let (registry, bus) = registry().await;
    let sub = bus.subscribe(&["deployment.*"]);
    let (deployment, _) = registry
        .create(spec("edge", "process-baseline-v1"), "alice", None)
        .await
        .unwrap();

    registry.soft_delete(&deployment.id).await.unwrap();
    let err = registry.get_active_config(&deployment.id).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
    // History remains for audit.
    assert_eq!(registry.list_versions(&deployment.id).await.unwrap().len(), 1);

    let kinds: Vec<String> = std::iter::from_fn(|| sub.try_recv().map(|e| e.kind)).collect();
    assert!(kinds.contains(&"deployment.created".to_string()));
    assert!(kinds.contains(&"deployment.deleted".to_string()));
}
