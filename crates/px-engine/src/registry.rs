//! Versioned pipeline deployment registry.
//!
//! Deployments are mutable pointers over an append-only version table:
//! every update or rollback appends a snapshot and advances
//! `current_version`, so history is never rewritten and any prior
//! configuration can be recovered verbatim.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use px_core::bus::{topics, Event, EventBus};
use px_core::pipeline;
use px_core::store::Store;
use px_core::types::{DeploymentVersion, PipelineDeployment, RolloutPhase};
use px_core::CoreError;

/// Fields accepted when creating or updating a deployment.
#[derive(Debug, Clone)]
pub struct DeploymentSpec {
    pub name: String,
    pub pipeline_template: String,
    pub namespace: String,
    pub target_nodes: Vec<String>,
    pub parameters: BTreeMap<String, String>,
}

pub struct DeploymentRegistry {
    store: Arc<Store>,
    bus: EventBus,
}

impl DeploymentRegistry {
    pub fn new(store: Arc<Store>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    /// Resolve a template name and render it with the deployment's
    /// parameters into the immutable config snapshot.
    fn render_snapshot(
        template: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value, CoreError> {
        let Some(found) = pipeline::find_template(template) else {
            return Err(CoreError::validation(
                "pipeline_template",
                format!("unknown template `{template}`"),
            ));
        };
        pipeline::render(&found.config, parameters).map_err(|e| match e {
            pipeline::RenderError::MissingVariables { missing } => CoreError::validation(
                "parameters",
                format!("missing template variables: {}", missing.join(", ")),
            ),
            other => CoreError::validation("pipeline_template", other.to_string()),
        })
    }

    /// Insert a deployment with its version 1 snapshot.
    pub async fn create(
        &self,
        spec: DeploymentSpec,
        deployed_by: &str,
        note: Option<String>,
    ) -> Result<(PipelineDeployment, DeploymentVersion), CoreError> {
        if spec.name.trim().is_empty() {
            return Err(CoreError::validation("name", "must not be empty"));
        }
        let snapshot = Self::render_snapshot(&spec.pipeline_template, &spec.parameters)?;

        let mut deployment = PipelineDeployment::new(spec.name, spec.pipeline_template);
        deployment.namespace = spec.namespace;
        deployment.target_nodes = spec.target_nodes;
        deployment.parameters = spec.parameters;
        deployment.phase = RolloutPhase::Pending;

        let version = DeploymentVersion {
            deployment_id: deployment.id.clone(),
            version: 1,
            config_snapshot: snapshot,
            parameters_snapshot: deployment.parameters.clone(),
            deployed_by: deployed_by.to_string(),
            deployed_at: deployment.created_at,
            notes: note,
        };
        self.store.create_deployment(&deployment, &version).await?;
        info!(deployment_id = %deployment.id, name = %deployment.name, "deployment created");
        self.bus.publish(Event::new(
            topics::DEPLOYMENT_CREATED,
            serde_json::json!({"deployment_id": deployment.id, "name": deployment.name}),
        ));
        Ok((deployment, version))
    }

    /// Apply a new spec as version N+1 and advance the pointer. Prior
    /// versions are never mutated.
    pub async fn update(
        &self,
        id: &str,
        spec: DeploymentSpec,
        deployed_by: &str,
        note: Option<String>,
    ) -> Result<(PipelineDeployment, DeploymentVersion), CoreError> {
        let Some(mut deployment) = self.store.get_deployment(id, false).await? else {
            return Err(CoreError::NotFound(format!("deployment {id}")));
        };
        let snapshot = Self::render_snapshot(&spec.pipeline_template, &spec.parameters)?;

        deployment.name = spec.name;
        deployment.pipeline_template = spec.pipeline_template;
        deployment.namespace = spec.namespace;
        deployment.target_nodes = spec.target_nodes;
        deployment.parameters = spec.parameters.clone();
        deployment.phase = RolloutPhase::Deploying;
        self.store.update_deployment(&deployment).await?;

        let (deployment, version) = self
            .store
            .append_deployment_version(id, snapshot, spec.parameters, deployed_by, note)
            .await?;
        info!(deployment_id = %id, version = version.version, "deployment updated");
        self.bus.publish(Event::new(
            topics::DEPLOYMENT_UPDATED,
            serde_json::json!({"deployment_id": id, "version": version.version}),
        ));
        Ok((deployment, version))
    }

    /// Append a new version whose snapshot equals `target_version`'s.
    pub async fn rollback(
        &self,
        id: &str,
        target_version: i64,
        deployed_by: &str,
        note: Option<String>,
    ) -> Result<(PipelineDeployment, DeploymentVersion), CoreError> {
        let Some(target) = self.store.get_deployment_version(id, target_version).await? else {
            return Err(CoreError::NotFound(format!(
                "deployment {id} version {target_version}"
            )));
        };
        let note = match note {
            Some(extra) => format!("rollback to v{target_version}: {extra}"),
            None => format!("rollback to v{target_version}"),
        };
        let (mut deployment, version) = self
            .store
            .append_deployment_version(
                id,
                target.config_snapshot.clone(),
                target.parameters_snapshot.clone(),
                deployed_by,
                Some(note),
            )
            .await?;
        deployment.parameters = target.parameters_snapshot;
        deployment.phase = RolloutPhase::Deploying;
        self.store.update_deployment(&deployment).await?;
        info!(deployment_id = %id, target_version, new_version = version.version, "deployment rolled back");
        self.bus.publish(Event::new(
            topics::DEPLOYMENT_ROLLED_BACK,
            serde_json::json!({
                "deployment_id": id,
                "target_version": target_version,
                "version": version.version,
            }),
        ));
        Ok((deployment, version))
    }

    /// Versions newest-first.
    pub async fn list_versions(&self, id: &str) -> Result<Vec<DeploymentVersion>, CoreError> {
        if self.store.get_deployment(id, true).await?.is_none() {
            return Err(CoreError::NotFound(format!("deployment {id}")));
        }
        self.store.list_deployment_versions(id).await
    }

    /// Hide a deployment from default listings, keeping its history.
    pub async fn soft_delete(&self, id: &str) -> Result<PipelineDeployment, CoreError> {
        let deployment = self.store.soft_delete_deployment(id).await?;
        info!(deployment_id = %id, "deployment soft-deleted");
        self.bus.publish(Event::new(
            topics::DEPLOYMENT_DELETED,
            serde_json::json!({"deployment_id": id}),
        ));
        Ok(deployment)
    }

    /// The `current_version` snapshot, verbatim.
    pub async fn get_active_config(&self, id: &str) -> Result<serde_json::Value, CoreError> {
        let Some(deployment) = self.store.get_deployment(id, false).await? else {
            return Err(CoreError::NotFound(format!("deployment {id}")));
        };
        let Some(version) = self
            .store
            .get_deployment_version(id, deployment.current_version)
            .await?
        else {
            // current_version must always resolve; a miss is corruption.
            return Err(CoreError::Internal(format!(
                "deployment {id} current_version {} has no snapshot",
                deployment.current_version
            )));
        };
        Ok(version.config_snapshot)
    }
}
