//! `Core`: the in-process library facade spec.md §6 describes. External
//! collaborators (REST gateway, plugin host, CLI — all out of scope per
//! spec.md §1) talk to the four engineered subsystems only through the
//! methods on `Core`.

pub mod agents;
pub mod autoscaler;
pub mod breakdown;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod priority;
pub mod registry;
pub mod scheduler;
pub mod types;
pub mod worker_pool;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use agents::AgentDirectory;
use autoscaler::{AutoScaler, SystemStatus};
use cache::BreakdownCache;
use config::Config;
use dispatcher::Dispatcher;
use error::{CoreError, CoreResult};
use metrics::{Metrics, MetricsSnapshot};
use registry::WorkRegistry;
use scheduler::Scheduler;
use types::{Agent, Job, WorkItem, WorkItemSnapshot, WorkKind, WorkStatus};
use worker_pool::{MicroTaskExecutor, NoopExecutor, WorkerPool};

/// The Worker hook for the Scheduler's Job plane (§6.3, generalized): a
/// Job is opaque work a collaborator knows how to run, the same way a
/// MicroTask is for the Worker Pool. The Scheduler itself never executes
/// anything (§4.G) — this trait is what closes that gap inside `Core`.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<(), String>;
}

/// Default executor wired in when no collaborator Job executor is
/// registered (tests, or a daemon with only the WorkItem pipeline in
/// use). Always succeeds immediately.
pub struct NoopJobExecutor;

#[async_trait]
impl JobExecutor for NoopJobExecutor {
    async fn execute(&self, _job: &Job) -> Result<(), String> {
        Ok(())
    }
}

/// Filter accepted by `Core::list` (§6.1). All fields are conjunctive;
/// `None` means "don't filter on this dimension".
#[derive(Debug, Default, Clone)]
pub struct WorkItemFilter {
    pub status: Option<WorkStatus>,
    pub kind: Option<WorkKind>,
}

/// On-disk shape of the optional periodic snapshot (§6.6). Deliberately
/// flat and versioned so a future format change can branch on `version`.
#[derive(Serialize, Deserialize)]
struct PersistedState {
    version: u32,
    items: Vec<WorkItem>,
}

/// Wires the four engineered subsystems (Registry, Dispatcher, Worker
/// Pool, Auto-Scaler) plus the Scheduler job plane and the ambient
/// Breakdown Cache / Metrics into one daemon instance. One `Core` per
/// process (§9 "globals -> injected dependencies").
pub struct Core {
    pub config: Config,
    pub registry: Arc<WorkRegistry>,
    pub cache: Arc<BreakdownCache>,
    pub worker_pool: Arc<WorkerPool>,
    pub directory: Arc<AgentDirectory>,
    pub scheduler: Arc<Scheduler>,
    pub autoscaler: Arc<AutoScaler>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<Metrics>,
    job_executor: Arc<dyn JobExecutor>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Core {
    /// Constructs every subsystem from `config`, wiring the fixed lock
    /// order of §5 (Breakdown Cache is never locked while the Registry
    /// lock is held; neither holds the other's lock across an await).
    pub fn new(config: Config) -> Self {
        Self::with_executors(config, Arc::new(NoopExecutor), Arc::new(NoopJobExecutor))
    }

    /// Same as `new`, but lets the caller register the collaborator
    /// Worker/Job hooks (§6.3) instead of the no-op defaults.
    pub fn with_executors(config: Config, micro_task_executor: Arc<dyn MicroTaskExecutor>, job_executor: Arc<dyn JobExecutor>) -> Self {
        let registry = Arc::new(WorkRegistry::new());
        let cache = Arc::new(BreakdownCache::new(config.cache.cache_ttl_seconds, config.cache.cache_max));
        let directory = Arc::new(AgentDirectory::new());
        let metrics = Arc::new(Metrics::new().expect("prometheus registration never fails for fixed metric names"));

        let worker_pool = Arc::new(WorkerPool::new(
            config.worker_pool.max_workers,
            config.worker_pool.max_queue,
            config.worker_pool.max_retries,
            Duration::from_secs_f64(config.worker_pool.min_task_timeout_seconds),
            micro_task_executor,
        ));

        let scheduler = Arc::new(Scheduler::new(config.scheduler.clone(), directory.clone()));
        let autoscaler = Arc::new(AutoScaler::new(config.autoscaler.clone()));

        let dispatcher = Arc::new(Dispatcher::new(
            "dispatcher-0",
            config.dispatcher.clone(),
            registry.clone(),
            cache.clone(),
            worker_pool.clone(),
            directory.clone(),
            metrics.clone(),
        ));

        for _ in 0..config.autoscaler.min_agents {
            directory.register("bootstrap-agent", std::collections::HashSet::from(["general_purpose".to_string()]));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            registry,
            cache,
            worker_pool,
            directory,
            scheduler,
            autoscaler,
            dispatcher,
            metrics,
            job_executor,
            shutdown_tx,
            shutdown_rx,
        }
    }

    // ---- Work producer API (§6.1) ----------------------------------

    #[instrument(skip(self, item))]
    pub async fn submit_work(&self, item: WorkItem) -> CoreResult<String> {
        let id = self.registry.insert(item).await?;
        self.metrics.record_work_submitted();
        Ok(id)
    }

    /// Cancels a live WorkItem: signals the Worker Pool to abort its
    /// pending MicroTasks and marks the item `cancelled` (§5 cancellation
    /// level 2). Returns `false` if the id doesn't exist.
    #[instrument(skip(self))]
    pub async fn cancel_work(&self, id: &str) -> bool {
        if self.registry.get(id).await.is_err() {
            return false;
        }
        self.worker_pool.cancel_parent(id);
        self.registry.update_status(id, WorkStatus::Cancelled).await.is_ok()
    }

    pub async fn query_status(&self, id: &str) -> CoreResult<WorkItemSnapshot> {
        self.registry.snapshot(id).await
    }

    pub async fn list(&self, filter: WorkItemFilter) -> Vec<WorkItemSnapshot> {
        self.registry
            .export()
            .await
            .into_iter()
            .filter(|s| filter.status.map(|st| st == s.status).unwrap_or(true))
            .filter(|s| filter.kind.map(|k| k == s.kind).unwrap_or(true))
            .collect()
    }

    // ---- Agent registration API (§6.2) -----------------------------

    pub fn register_agent(&self, name: impl Into<String>, capabilities: std::collections::HashSet<String>) -> Agent {
        self.directory.register(name, capabilities)
    }

    pub fn heartbeat(&self, agent_id: &str) -> CoreResult<()> {
        self.directory.heartbeat(agent_id)
    }

    pub fn deregister(&self, agent_id: &str) -> CoreResult<Agent> {
        self.directory.deregister(agent_id)
    }

    // ---- Scheduler job plane (§4.G) ---------------------------------

    pub async fn schedule_job(&self, job: Job) -> CoreResult<String> {
        self.scheduler.schedule(job).await
    }

    pub async fn cancel_job(&self, job_id: &str) -> CoreResult<()> {
        self.scheduler.cancel(job_id).await
    }

    // ---- Metrics (§4.J) ----------------------------------------------

    pub async fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.refresh_metrics().await;
        self.metrics.snapshot()
    }

    pub fn metrics_text(&self) -> String {
        self.metrics.export()
    }

    async fn refresh_metrics(&self) {
        let counts = self.registry.counts_by_status().await;
        self.metrics.set_work_item_counts(&counts);
        self.metrics.set_agent_counts(self.directory.count(), self.directory.idle_count());
        self.metrics.record_cache_stats(&self.cache.stats());
        self.metrics.set_queue_depths(self.worker_pool.queue_depth(), self.scheduler.queue_depth().await);
    }

    // ---- Background loops --------------------------------------------

    /// Spawns the Dispatcher tick loop, the Scheduler's dispatch and
    /// monitor loops (kept as two tasks per SPEC_FULL.md §1), and the
    /// Auto-Scaler loop. Returns their join handles so the caller can
    /// await a clean shutdown.
    pub fn spawn_background_loops(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let dispatcher = self.dispatcher.clone();
        let dispatcher_shutdown = self.shutdown_rx.clone();
        handles.push(tokio::spawn(dispatcher.run_loop(dispatcher_shutdown)));

        let this = self.clone();
        let mut scheduler_shutdown = self.shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    (job_id, agent_id) = async {
                        loop {
                            if let Some(pair) = this.scheduler.dispatch_next().await {
                                break pair;
                            }
                            tokio::time::sleep(Duration::from_millis(200)).await;
                        }
                    } => {
                        this.run_job(&job_id, &agent_id).await;
                    }
                    _ = scheduler_shutdown.changed() => {
                        if *scheduler_shutdown.borrow() {
                            info!("scheduler dispatch loop stopping");
                            break;
                        }
                    }
                }
            }
        }));

        let monitor_scheduler = self.scheduler.clone();
        let mut monitor_shutdown = self.shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        monitor_scheduler.monitor_tick().await;
                    }
                    _ = monitor_shutdown.changed() => {
                        if *monitor_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        let this = self.clone();
        let mut autoscaler_shutdown = self.shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        this.autoscaler_tick().await;
                    }
                    _ = autoscaler_shutdown.changed() => {
                        if *autoscaler_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        handles
    }

    async fn run_job(&self, job_id: &str, _agent_id: &str) {
        let job = match self.scheduler.get(job_id).await {
            Ok(job) => job,
            Err(_) => return,
        };
        match self.job_executor.execute(&job).await {
            Ok(()) => {
                let _ = self.scheduler.on_complete(job_id).await;
            }
            Err(message) => {
                let _ = self.scheduler.on_fail(job_id, message).await;
            }
        }
    }

    /// One Auto-Scaler decision cycle (§4.H): builds the snapshot from
    /// live Registry/Scheduler/Agent state and applies the decision.
    #[instrument(skip(self))]
    pub async fn autoscaler_tick(&self) -> autoscaler::ScalingDecision {
        let counts = self.registry.counts_by_status().await;
        let pending = counts.get(&WorkStatus::Pending).copied().unwrap_or(0) + self.scheduler.queue_depth().await;
        let in_progress = counts.get(&WorkStatus::InProgress).copied().unwrap_or(0);
        let status = SystemStatus {
            pending_tasks: pending,
            total_agents: self.directory.count(),
            in_progress_tasks: in_progress,
        };
        let decision = self.autoscaler.make_scaling_decision(status);
        if let Some(affected) = self.autoscaler.apply(decision, &self.directory) {
            match decision {
                autoscaler::ScalingDecision::ScaleUp => {
                    self.metrics.record_scale_up();
                    info!(agent_id = %affected.agent_id, "auto-scaler added an agent");
                }
                autoscaler::ScalingDecision::ScaleDown => {
                    self.metrics.record_scale_down();
                    info!(agent_id = %affected.agent_id, "auto-scaler removed an agent");
                }
                autoscaler::ScalingDecision::Hold => {}
            }
        }
        self.metrics.set_scaler_last_action(decision);
        decision
    }

    /// Signals every background loop to stop, then waits up to
    /// `DRAIN_TIMEOUT_SECONDS` for in-flight parents to finish before
    /// giving up (§5 "System shutdown", §6.5).
    #[instrument(skip(self, handles))]
    pub async fn shutdown(&self, handles: Vec<tokio::task::JoinHandle<()>>) {
        info!("shutdown requested, stopping background loops");
        let _ = self.shutdown_tx.send(true);

        let drain = Duration::from_secs(self.config.drain_timeout_seconds);
        let join_all = futures::future::join_all(handles);
        if tokio::time::timeout(drain, join_all).await.is_err() {
            warn!(drain_timeout_seconds = self.config.drain_timeout_seconds, "drain timeout exceeded, forcing shutdown");
        }

        let snapshot = self.registry.export_full().await;
        info!(work_items = snapshot.len(), "final registry snapshot taken at shutdown");
    }

    // ---- Persisted state (§6.6) ---------------------------------------

    #[instrument(skip(self))]
    pub async fn snapshot_to_path(&self, path: impl AsRef<Path>) -> CoreResult<()> {
        let state = PersistedState {
            version: 1,
            items: self.registry.export_full().await,
        };
        let json = serde_json::to_vec_pretty(&state)?;
        tokio::fs::write(path.as_ref(), json)
            .await
            .map_err(|e| CoreError::Internal(format!("failed to write snapshot: {e}")))?;
        Ok(())
    }

    /// Loads a prior snapshot and resets all `in_progress` items to
    /// `pending`, since no claim of at-most-once execution survives a
    /// restart (§6.6).
    #[instrument(skip(self))]
    pub async fn restore_from_path(&self, path: impl AsRef<Path>) -> CoreResult<usize> {
        let bytes = tokio::fs::read(path.as_ref())
            .await
            .map_err(|e| CoreError::Internal(format!("failed to read snapshot: {e}")))?;
        let state: PersistedState = serde_json::from_slice(&bytes)?;
        let count = state.items.len();
        self.registry.restore(state.items).await;
        info!(work_items = count, "registry restored from snapshot");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Complexity, Priority};

    fn test_core() -> Core {
        Core::new(Config::default())
    }

    #[tokio::test]
    async fn submit_then_query_round_trips() {
        let core = test_core();
        let item = WorkItem::new_task("do it", "a simple task", 0.5);
        let id = core.submit_work(item).await.unwrap();
        let snapshot = core.query_status(&id).await.unwrap();
        assert_eq!(snapshot.status, WorkStatus::Pending);
    }

    #[tokio::test]
    async fn duplicate_submission_rejected() {
        let core = test_core();
        let item = WorkItem::new_task("A", "shared", 0.5);
        core.submit_work(item.clone()).await.unwrap();
        let mut dup = WorkItem::new_task("A", "shared", 0.5);
        dup.id = "task_other".to_string();
        assert!(core.submit_work(dup).await.is_err());
    }

    #[tokio::test]
    async fn cancel_unknown_work_item_returns_false() {
        let core = test_core();
        assert!(!core.cancel_work("does-not-exist").await);
    }

    #[tokio::test]
    async fn list_filters_by_kind() {
        let core = test_core();
        core.submit_work(WorkItem::new_task("t", "d", 0.1)).await.unwrap();
        core.submit_work(WorkItem::new_todo("u", "d", Complexity::Medium, Priority::Medium, 1.0)).await.unwrap();

        let tasks_only = core.list(WorkItemFilter { status: None, kind: Some(WorkKind::Task) }).await;
        assert_eq!(tasks_only.len(), 1);
    }

    #[tokio::test]
    async fn autoscaler_tick_scales_up_under_load() {
        let mut config = Config::default();
        config.autoscaler.min_agents = 1;
        config.autoscaler.tasks_per_agent_up = 1.0;
        let core = test_core_with(config);
        for i in 0..5 {
            core.submit_work(WorkItem::new_task(format!("t{i}"), "d", 0.1)).await.unwrap();
        }
        let decision = core.autoscaler_tick().await;
        assert_eq!(decision, autoscaler::ScalingDecision::ScaleUp);
    }

    fn test_core_with(config: Config) -> Core {
        Core::new(config)
    }

    #[tokio::test]
    async fn snapshot_round_trips_and_resets_in_progress() {
        let core = test_core();
        let id = core.submit_work(WorkItem::new_task("t", "d", 0.1)).await.unwrap();
        core.registry.assign(&id, "agent_x").await.unwrap();
        core.registry.update_status(&id, WorkStatus::InProgress).await.unwrap();

        let dir = std::env::temp_dir().join(format!("taskmaster-test-{id}.json"));
        core.snapshot_to_path(&dir).await.unwrap();

        let restored_core = test_core();
        let count = restored_core.restore_from_path(&dir).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(restored_core.query_status(&id).await.unwrap().status, WorkStatus::Pending);

        let _ = tokio::fs::remove_file(&dir).await;
    }
}
