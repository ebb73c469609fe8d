//! Durable, ordered, per-host work dispatch with lease semantics.
//!
//! The queue persists tasks through the storage layer and keeps only
//! ephemeral wake-up state in memory: one [`Notify`] per dispatch target,
//! signalled on every enqueue so a blocked long poll re-checks immediately
//! instead of busy-polling the database.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use dashmap::DashMap;
use futures_util::future::select_all;
use tokio::sync::Notify;
use tracing::{debug, info};

use px_core::bus::{topics, Event, EventBus};
use px_core::config::QueueConfig;
use px_core::store::{ReapOutcome, Store};
use px_core::types::{Task, TaskStatus};
use px_core::CoreError;

use crate::shutdown::ShutdownSignal;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Lease granted per dequeue; extended by heartbeats.
    pub lease_duration: Duration,
    /// Ceiling on a caller-requested long-poll wait.
    pub max_wait: StdDuration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl QueueSettings {
    pub fn from_config(cfg: &QueueConfig) -> Self {
        Self {
            lease_duration: Duration::seconds(cfg.lease_duration_secs as i64),
            max_wait: StdDuration::from_secs(cfg.max_wait_secs),
            backoff_base: Duration::seconds(cfg.backoff_base_secs as i64),
            backoff_cap: Duration::seconds(cfg.backoff_cap_secs as i64),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

// ---------------------------------------------------------------------------
// TaskDispatch — the seam the engine depends on
// ---------------------------------------------------------------------------

/// The narrow queue contract the experiment engine needs: hand work in,
/// take work back. Lease/heartbeat/report traffic stays on the concrete
/// [`TaskQueue`], which only the agent protocol endpoint talks to.
#[async_trait]
pub trait TaskDispatch: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<Task, CoreError>;
    async fn cancel(&self, task_id: &str) -> Result<Task, CoreError>;
    async fn cancel_for_experiment(&self, experiment_id: &str) -> Result<u64, CoreError>;
}

// ---------------------------------------------------------------------------
// TaskQueue
// ---------------------------------------------------------------------------

pub struct TaskQueue {
    store: Arc<Store>,
    bus: EventBus,
    settings: QueueSettings,
    /// Per-target wake-up channels; `entry().or_default()` on first wait.
    wakeups: DashMap<String, Arc<Notify>>,
    shutdown: ShutdownSignal,
}

impl TaskQueue {
    pub fn new(
        store: Arc<Store>,
        bus: EventBus,
        settings: QueueSettings,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            store,
            bus,
            settings,
            wakeups: DashMap::new(),
            shutdown,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    fn waiter(&self, target: &str) -> Arc<Notify> {
        self.wakeups
            .entry(target.to_string())
            .or_default()
            .clone()
    }

    fn wake(&self, target: &str) {
        if let Some(notify) = self.wakeups.get(target) {
            notify.notify_waiters();
        }
    }

    /// The `target_host_id` values an agent can serve: its own id plus a
    /// `cap:` selector per advertised capability.
    fn targets_for(agent_host_id: &str, capabilities: &[String]) -> Vec<String> {
        let mut targets = Vec::with_capacity(1 + capabilities.len());
        targets.push(agent_host_id.to_string());
        for capability in capabilities {
            targets.push(format!("cap:{capability}"));
        }
        targets
    }

    /// Insert a task with `status=pending` and wake any poller blocked on
    /// its target.
    pub async fn enqueue(&self, mut task: Task) -> Result<Task, CoreError> {
        if task.target_host_id.trim().is_empty() {
            return Err(CoreError::validation(
                "target_host_id",
                "must not be empty",
            ));
        }
        if task.max_attempts == 0 {
            return Err(CoreError::validation("max_attempts", "must be at least 1"));
        }
        task.status = TaskStatus::Pending;
        self.store.insert_task(&task).await?;
        debug!(task_id = %task.id, task_type = ?task.task_type, target = %task.target_host_id, "task enqueued");
        self.bus.publish(Event::new(
            topics::TASK_CREATED,
            serde_json::json!({
                "task_id": task.id,
                "type": task.task_type,
                "target_host_id": task.target_host_id,
                "experiment_id": task.experiment_id,
            }),
        ));
        self.wake(&task.target_host_id);
        Ok(task)
    }

    /// Atomically lease the best matching task for an agent, blocking up to
    /// `max_wait` for one to arrive. Returns `None` on timeout, shutdown,
    /// or a zero wait against an empty queue.
    pub async fn lease(
        &self,
        agent_host_id: &str,
        capabilities: &[String],
        max_wait: StdDuration,
    ) -> Result<Option<Task>, CoreError> {
        if agent_host_id.trim().is_empty() {
            return Err(CoreError::Unauthorized("agent host id missing".into()));
        }
        let targets = Self::targets_for(agent_host_id, capabilities);
        let deadline = tokio::time::Instant::now() + max_wait.min(self.settings.max_wait);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            // Register interest before polling so an enqueue that lands
            // between the poll and the wait still wakes us.
            let notifies: Vec<Arc<Notify>> = targets.iter().map(|t| self.waiter(t)).collect();
            let mut waits: Vec<_> = notifies.iter().map(|n| Box::pin(n.notified())).collect();
            for wait in &mut waits {
                wait.as_mut().enable();
            }

            if let Some(task) = self
                .store
                .dequeue_task(agent_host_id, targets.clone(), self.settings.lease_duration)
                .await?
            {
                debug!(task_id = %task.id, agent = %agent_host_id, attempts = task.attempts, "task leased");
                return Ok(Some(task));
            }

            if self.shutdown.is_shutting_down() {
                return Ok(None);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = select_all(waits) => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
                _ = shutdown_rx.recv() => return Ok(None),
            }
        }
    }

    /// Extend the caller's lease by one lease duration.
    pub async fn heartbeat(&self, task_id: &str, agent_host_id: &str) -> Result<Task, CoreError> {
        self.store
            .extend_lease(task_id, agent_host_id, self.settings.lease_duration)
            .await
    }

    /// Transition a held task to `succeeded`.
    pub async fn complete(
        &self,
        task_id: &str,
        agent_host_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<Task, CoreError> {
        let task = self
            .store
            .complete_task(task_id, agent_host_id, result)
            .await?;
        info!(task_id = %task.id, agent = %agent_host_id, "task succeeded");
        self.bus.publish(Event::new(
            topics::TASK_COMPLETED,
            serde_json::json!({
                "task_id": task.id,
                "experiment_id": task.experiment_id,
                "leased_by": agent_host_id,
            }),
        ));
        Ok(task)
    }

    /// Record a failure; retriable failures requeue with backoff, the rest
    /// land terminally and emit `task.failed`.
    pub async fn fail(
        &self,
        task_id: &str,
        agent_host_id: &str,
        error: &str,
        retriable: bool,
    ) -> Result<Task, CoreError> {
        let task = self
            .store
            .fail_task(
                task_id,
                agent_host_id,
                error,
                retriable,
                self.settings.backoff_base,
                self.settings.backoff_cap,
            )
            .await?;
        match task.status {
            TaskStatus::Pending => {
                debug!(task_id = %task.id, attempts = task.attempts, "task requeued with backoff");
            }
            _ => {
                info!(task_id = %task.id, error, "task failed terminally");
                self.bus.publish(Event::new(
                    topics::TASK_FAILED,
                    serde_json::json!({
                        "task_id": task.id,
                        "experiment_id": task.experiment_id,
                        "error": error,
                    }),
                ));
            }
        }
        Ok(task)
    }

    /// Scheduler-invoked: requeue or terminally fail every expired lease.
    /// Requeued targets are woken so idle pollers pick the work back up.
    pub async fn reap_expired_leases(&self) -> Result<ReapOutcome, CoreError> {
        let outcome = self.store.reap_expired_leases().await?;
        for task in &outcome.requeued {
            self.wake(&task.target_host_id);
        }
        for task in &outcome.failed {
            self.bus.publish(Event::new(
                topics::TASK_FAILED,
                serde_json::json!({
                    "task_id": task.id,
                    "experiment_id": task.experiment_id,
                    "error": task.last_error,
                }),
            ));
        }
        if !outcome.requeued.is_empty() || !outcome.failed.is_empty() {
            info!(
                requeued = outcome.requeued.len(),
                failed = outcome.failed.len(),
                "reaped expired leases"
            );
        }
        Ok(outcome)
    }
}

#[async_trait]
impl TaskDispatch for TaskQueue {
    async fn enqueue(&self, task: Task) -> Result<Task, CoreError> {
        TaskQueue::enqueue(self, task).await
    }

    async fn cancel(&self, task_id: &str) -> Result<Task, CoreError> {
        self.store.cancel_task(task_id).await
    }

    async fn cancel_for_experiment(&self, experiment_id: &str) -> Result<u64, CoreError> {
        self.store.cancel_tasks_for_experiment(experiment_id).await
    }
}
