use std::sync::Arc;

use chrono::{DateTime, Utc};

use px_core::bus::EventBus;
use px_core::config::Config;
use px_core::store::Store;
use px_engine::engine::{EngineSettings, ExperimentEngine};
use px_engine::queue::{QueueSettings, TaskQueue};
use px_engine::registry::DeploymentRegistry;
use px_engine::shutdown::ShutdownSignal;
use px_telemetry::ApiMetrics;

use crate::auth::TokenAuthority;
use crate::hub::{Hub, HubSettings};

/// The aggregate every request handler works against.
///
/// Built once at startup and injected through Axum state — no module-level
/// singletons anywhere.
pub struct ApiState {
    pub store: Arc<Store>,
    pub bus: EventBus,
    pub queue: Arc<TaskQueue>,
    pub engine: Arc<ExperimentEngine>,
    pub registry: Arc<DeploymentRegistry>,
    pub hub: Arc<Hub>,
    pub authority: Arc<TokenAuthority>,
    pub metrics: ApiMetrics,
    pub config: Config,
    pub started_at: DateTime<Utc>,
}

impl ApiState {
    /// Wire the full core from a loaded config and an opened store.
    pub fn build(
        config: Config,
        store: Arc<Store>,
        shutdown: ShutdownSignal,
    ) -> Result<Arc<Self>, px_core::CoreError> {
        let bus = EventBus::new();
        let queue = Arc::new(TaskQueue::new(
            store.clone(),
            bus.clone(),
            QueueSettings::from_config(&config.queue),
            shutdown,
        ));
        let registry = Arc::new(DeploymentRegistry::new(store.clone(), bus.clone()));
        let engine = Arc::new(ExperimentEngine::new(
            store.clone(),
            bus.clone(),
            queue.clone(),
            registry.clone(),
            EngineSettings::from_config(&config.experiments),
        ));
        let hub = Hub::spawn(&bus, HubSettings::default());
        let authority = Arc::new(TokenAuthority::from_config(&config.auth)?);

        Ok(Arc::new(Self {
            store,
            bus,
            queue,
            engine,
            registry,
            hub,
            authority,
            metrics: ApiMetrics::new(),
            config,
            started_at: Utc::now(),
        }))
    }
}
