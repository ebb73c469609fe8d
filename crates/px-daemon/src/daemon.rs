use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use px_bridge::http_api::{api_router, ApiState};
use px_core::bus::{topics, Event};
use px_core::config::Config;
use px_core::store::Store;
use px_core::types::AgentStatus;
use px_engine::shutdown::ShutdownSignal;

/// Cadences for the background loops, in seconds.
#[derive(Debug, Clone)]
pub struct LoopIntervals {
    pub reap_secs: u64,
    pub tick_secs: u64,
    pub liveness_secs: u64,
    pub token_sweep_secs: u64,
}

impl LoopIntervals {
    pub fn from_config(config: &Config) -> Self {
        Self {
            reap_secs: config.queue.reap_interval_secs,
            tick_secs: config.experiments.tick_interval_secs,
            liveness_secs: config.agents.liveness_interval_secs,
            token_sweep_secs: config.auth.revocation_sweep_secs,
        }
    }
}

/// The control-plane daemon.
///
/// Owns the shared [`ApiState`] aggregate, serves the HTTP API, and runs
/// the scheduler loops until the shutdown signal fires. A storage error
/// inside a loop is logged and retried on the next tick, never fatal.
pub struct Daemon {
    config: Config,
    state: Arc<ApiState>,
    intervals: LoopIntervals,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Open the store from config and wire the full core.
    pub async fn new(config: Config) -> Result<Self> {
        let path = resolve_db_path(&config.database.path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let store = Arc::new(
            Store::open(&path)
                .await
                .with_context(|| format!("opening database at {}", path.display()))?,
        );
        info!(path = %path.display(), "database ready");
        Ok(Self::with_store(config, store)?)
    }

    /// Wire the daemon around an already-open store (tests use an
    /// in-memory one).
    pub fn with_store(config: Config, store: Arc<Store>) -> Result<Self> {
        let shutdown = ShutdownSignal::new();
        let state = ApiState::build(config.clone(), store, shutdown.clone())
            .context("building core state")?;
        let intervals = LoopIntervals::from_config(&config);
        Ok(Self {
            config,
            state,
            intervals,
            shutdown,
        })
    }

    pub fn state(&self) -> &Arc<ApiState> {
        &self.state
    }

    /// Handle for triggering shutdown from another task (e.g. ctrl-c).
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Serve the API on a pre-bound listener and run the loops until
    /// shutdown (blocking).
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let bind_addr = listener.local_addr()?;
        let router = api_router(self.state.clone());
        let api_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!(error = %e, "API server error");
            }
        });
        info!(%bind_addr, "API server listening");

        Self::run_loops(self.state.clone(), self.intervals.clone(), self.shutdown.clone()).await;

        api_handle.abort();
        info!("daemon stopped");
        Ok(())
    }

    /// Bind from config and run (blocking).
    pub async fn run(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("binding {bind_addr}"))?;
        self.run_with_listener(listener).await
    }

    /// The scheduler: lease reaper, experiment ticker, agent liveness,
    /// and revoked-token sweep on independent cadences.
    pub async fn run_loops(state: Arc<ApiState>, intervals: LoopIntervals, shutdown: ShutdownSignal) {
        info!(
            reap_secs = intervals.reap_secs,
            tick_secs = intervals.tick_secs,
            liveness_secs = intervals.liveness_secs,
            token_sweep_secs = intervals.token_sweep_secs,
            "daemon starting scheduler loops"
        );

        let mut reap = tokio::time::interval(Duration::from_secs(intervals.reap_secs.max(1)));
        let mut tick = tokio::time::interval(Duration::from_secs(intervals.tick_secs.max(1)));
        let mut liveness =
            tokio::time::interval(Duration::from_secs(intervals.liveness_secs.max(1)));
        let mut sweep =
            tokio::time::interval(Duration::from_secs(intervals.token_sweep_secs.max(1)));

        // Consume the first immediate tick so loops don't all fire at t=0.
        reap.tick().await;
        tick.tick().await;
        liveness.tick().await;
        sweep.tick().await;

        let mut shutdown_rx = shutdown.subscribe();

        loop {
            tokio::select! {
                _ = reap.tick() => {
                    Self::reap_once(&state).await;
                }
                _ = tick.tick() => {
                    if let Err(e) = state.engine.tick().await {
                        error!(error = %e, "experiment tick failed");
                    }
                }
                _ = liveness.tick() => {
                    Self::liveness_once(&state).await;
                }
                _ = sweep.tick() => {
                    match state.store.sweep_revoked_tokens().await {
                        Ok(0) => {}
                        Ok(swept) => info!(swept, "revoked-token sweep"),
                        Err(e) => error!(error = %e, "revoked-token sweep failed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, stopping scheduler loops");
                    break;
                }
            }
        }
    }

    /// One reaper pass: expired leases requeue or fail; failed tasks are
    /// routed back into the experiment engine.
    pub async fn reap_once(state: &Arc<ApiState>) {
        match state.queue.reap_expired_leases().await {
            Ok(outcome) => {
                for task in &outcome.failed {
                    if let Err(e) = state.engine.handle_task_update(task).await {
                        error!(task_id = %task.id, error = %e, "failed-task routing error");
                    }
                }
            }
            Err(e) => error!(error = %e, "lease reap failed"),
        }
    }

    /// One liveness pass: downgrade stale agents and announce transitions.
    pub async fn liveness_once(state: &Arc<ApiState>) {
        let degraded = state.config.agents.degraded_after_secs as i64;
        let offline = state.config.agents.offline_after_secs as i64;
        match state.store.refresh_agent_liveness(degraded, offline).await {
            Ok(transitions) => {
                for (agent, status) in transitions {
                    warn!(
                        host_id = %agent.host_id,
                        status = ?status,
                        last_heartbeat_at = %agent.last_heartbeat_at,
                        "agent liveness transition"
                    );
                    if status == AgentStatus::Offline {
                        state.bus.publish(Event::new(
                            topics::AGENT_OFFLINE,
                            serde_json::json!({
                                "host_id": agent.host_id,
                                "hostname": agent.hostname,
                                "last_heartbeat_at": agent.last_heartbeat_at,
                            }),
                        ));
                    }
                }
            }
            Err(e) => error!(error = %e, "agent liveness check failed"),
        }
    }
}

/// Expand a leading `~` to the home directory.
fn resolve_db_path(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}
