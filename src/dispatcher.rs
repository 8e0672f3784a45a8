//! Dispatcher (§4.E): the Scan / Mark / Batch-Load / Decompose / Aggregate
//! / Self-heal tick loop. Grounded on `collective_worker_processor.py`'s
//! `scan_and_mark_todo_master` / `load_work_items_batch` /
//! `detect_agent_conflicts` / `resolve_conflicts`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tracing::{debug, info, instrument, warn};

use crate::breakdown::BreakdownEngine;
use crate::cache::BreakdownCache;
use crate::config::DispatcherConfig;
use crate::error::CoreResult;
use crate::metrics::Metrics;
use crate::priority::PriorityScorer;
use crate::registry::WorkRegistry;
use crate::types::{Complexity, Priority, WorkItem, WorkKind, WorkStatus};
use crate::worker_pool::WorkerPool;

/// Counts emitted by one `scan()` pass (§4.E.1).
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanStats {
    pub scanned: usize,
    pub marked: usize,
    pub errors: usize,
}

/// Summary of one full dispatcher tick, for logging and the `/health`
/// surface.
#[derive(Debug, Default, Clone)]
pub struct TickReport {
    pub scan: ScanStats,
    pub loaded: usize,
    pub completed: usize,
    pub requeued: usize,
    pub conflicts_resolved: usize,
    pub backfilled: usize,
    pub exceeded_hard_cap: bool,
}

/// The three conflict shapes the self-heal step can observe on a live
/// WorkItem (SPEC_FULL.md §1: three cases, not two).
#[derive(Debug, Clone)]
struct DetectedConflict {
    id: String,
    kind: crate::types::ConflictKind,
    candidate_agent: String,
}

pub struct Dispatcher {
    self_agent_id: String,
    config: DispatcherConfig,
    registry: Arc<WorkRegistry>,
    cache: Arc<BreakdownCache>,
    breakdown: BreakdownEngine,
    worker_pool: Arc<WorkerPool>,
    directory: Arc<crate::agents::AgentDirectory>,
    metrics: Arc<Metrics>,
    /// Ids this dispatcher currently holds MicroTasks out for — the
    /// "active queue" `_resolve_orphaned_assignment` checks against.
    active_parents: DashSet<String>,
}

impl Dispatcher {
    pub fn new(
        self_agent_id: impl Into<String>,
        config: DispatcherConfig,
        registry: Arc<WorkRegistry>,
        cache: Arc<BreakdownCache>,
        worker_pool: Arc<WorkerPool>,
        directory: Arc<crate::agents::AgentDirectory>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            self_agent_id: self_agent_id.into(),
            config,
            breakdown: BreakdownEngine::new(cache.clone()),
            registry,
            cache,
            worker_pool,
            directory,
            metrics,
            active_parents: DashSet::new(),
        }
    }

    /// §4.E.1: mark every live `pending`, unowned item with this
    /// dispatcher's identity and a freshly computed priority score.
    #[instrument(skip(self))]
    async fn scan(&self) -> ScanStats {
        let mut stats = ScanStats::default();
        for kind in [WorkKind::Task, WorkKind::Todo, WorkKind::ComplexTodo] {
            for item in self.registry.by_kind(kind).await {
                stats.scanned += 1;
                if item.status != WorkStatus::Pending || item.assigned_agent.is_some() {
                    continue;
                }
                if let Err(e) = self.mark(&item).await {
                    stats.errors += 1;
                    warn!(work_item_id = %item.id, error = %e, "failed to mark work item during scan");
                    continue;
                }
                stats.marked += 1;
            }
        }
        info!(scanned = stats.scanned, marked = stats.marked, errors = stats.errors, "scan complete");
        stats
    }

    async fn mark(&self, item: &WorkItem) -> CoreResult<()> {
        self.registry.assign(&item.id, &self.self_agent_id).await?;
        let available = self.directory.available_with_capabilities(&item.required_capabilities).len();
        let blocks_others = self.registry.blocks_others(&item.id).await;
        let fresh = self.registry.get(&item.id).await?;
        let breakdown = PriorityScorer::score(&fresh, available, blocks_others);
        self.registry.set_priority(&item.id, breakdown).await?;
        Ok(())
    }

    /// §4.E.2: drain up to the configured per-kind quota, highest score
    /// first, transitioning each to `in_progress`.
    #[instrument(skip(self))]
    async fn batch_load(&self) -> Vec<WorkItem> {
        let quotas = [
            (WorkKind::Task, self.config.batch_quota_task),
            (WorkKind::ComplexTodo, self.config.batch_quota_complex_todo),
            (WorkKind::Todo, self.config.batch_quota_todo),
        ];
        let mut loaded = Vec::new();
        for (kind, limit) in quotas {
            let candidates = self
                .registry
                .pending_of_kind(kind, limit)
                .await
                .into_iter()
                .filter(|i| i.assigned_agent.as_deref() == Some(self.self_agent_id.as_str()));
            for item in candidates {
                if self.registry.update_status(&item.id, WorkStatus::InProgress).await.is_ok() {
                    debug!(work_item_id = %item.id, kind = ?kind, "loaded for dispatch");
                    loaded.push(item);
                }
            }
        }
        info!(count = loaded.len(), "batch load complete");
        loaded
    }

    /// §4.E.3/4: break `item` into MicroTasks, run them through the
    /// Worker Pool, and fold the ParentResult back into the Registry and
    /// Cache.
    #[instrument(skip(self, item), fields(work_item_id = %item.id))]
    async fn decompose_and_dispatch(&self, item: WorkItem) {
        self.active_parents.insert(item.id.clone());

        let tasks = self.breakdown.breakdown(&item);
        let cache_key = crate::cache::cache_key(
            &item.id,
            &item.name,
            &item.description,
            item.estimated_hours,
            &format!("{:?}", item.complexity).to_lowercase(),
        );
        if let Err(e) = self.registry.set_subtasks(&item.id, tasks.clone(), cache_key).await {
            warn!(work_item_id = %item.id, error = %e, "failed to record subtasks");
            self.active_parents.remove(&item.id);
            return;
        }

        let parent_timeout = Duration::from_secs(self.config.parent_timeout_seconds);
        let mut result = self.worker_pool.run_parent(&item.id, tasks, parent_timeout).await;
        self.metrics.observe_work_item_processing(result.collaboration_time_seconds);

        for (worker_id, results) in &result.worker_results {
            for r in results {
                let progress = if r.success { 1.0 } else { 0.0 };
                let _ = self.registry.update_subtask_progress(&item.id, &r.task_id, progress).await;
                let _ = worker_id; // round-robin assignment only matters for the assignment map, not progress
            }
        }

        if result.successful > 0 && result.failed == 0 {
            let _ = self.registry.update_status(&item.id, WorkStatus::Completed).await;
            let cleared = self.cache.purge_parent(&item.id);
            result.cache_cleared = cleared > 0;
            debug!(work_item_id = %item.id, cleared, "parent completed, cache purged");
            self.metrics.record_work_completed();
        } else if result.successful > 0 {
            // Partial success: some microtasks failed. Retry the whole
            // parent if retries remain, otherwise mark it failed.
            let retry_count = self.registry.increment_retry(&item.id).await.unwrap_or(u32::MAX);
            if retry_count <= self.worker_pool.max_retries() {
                let _ = self.registry.record_error(&item.id, format!("{} of {} microtasks failed", result.failed, result.total_micro_tasks)).await;
                let _ = self.registry.update_status(&item.id, WorkStatus::Retrying).await;
                let _ = self.registry.release(&item.id).await;
                let _ = self.registry.update_status(&item.id, WorkStatus::Pending).await;
            } else {
                let _ = self.registry.update_status(&item.id, WorkStatus::Failed).await;
                self.metrics.record_work_failed();
            }
        } else {
            let _ = self.registry.record_error(&item.id, "all microtasks failed".to_string()).await;
            let _ = self.registry.update_status(&item.id, WorkStatus::Failed).await;
            self.metrics.record_work_failed();
        }

        self.active_parents.remove(&item.id);
    }

    /// §4.E.5 / SPEC_FULL.md §1: detect and resolve all three conflict
    /// shapes the original's `detect_agent_conflicts` /
    /// `resolve_conflicts` distinguish. Dual assignment is read off
    /// `contested_by` — the actual competing claimant `assign()` recorded
    /// without overwriting the incumbent — rather than re-deriving it by
    /// calling `check_overlap` with the item's own current owner, which
    /// can never disagree with itself.
    #[instrument(skip(self))]
    async fn self_heal(&self) -> usize {
        let mut conflicts = Vec::new();
        for item in self.registry.by_status(WorkStatus::InProgress).await {
            match &item.assigned_agent {
                None => {
                    conflicts.push(DetectedConflict {
                        id: item.id.clone(),
                        kind: crate::types::ConflictKind::Unknown,
                        candidate_agent: self.self_agent_id.clone(),
                    });
                }
                Some(owner) => {
                    if let Some(contender) = &item.contested_by {
                        conflicts.push(DetectedConflict {
                            id: item.id.clone(),
                            kind: crate::types::ConflictKind::DualAssignment,
                            candidate_agent: contender.clone(),
                        });
                    } else if owner == &self.self_agent_id && !self.active_parents.contains(&item.id) {
                        conflicts.push(DetectedConflict {
                            id: item.id.clone(),
                            kind: crate::types::ConflictKind::OrphanedAssignment,
                            candidate_agent: owner.clone(),
                        });
                    }
                }
            }
        }

        if conflicts.is_empty() {
            debug!("no agent conflicts detected");
            return 0;
        }
        warn!(count = conflicts.len(), "agent conflicts detected, resolving");

        let mut resolved = 0;
        for conflict in conflicts {
            let outcome = match conflict.kind {
                crate::types::ConflictKind::DualAssignment => {
                    self.registry.resolve_overlap(&conflict.id, &conflict.candidate_agent).await.map(|_| ())
                }
                crate::types::ConflictKind::OrphanedAssignment => {
                    let r1 = self.registry.release(&conflict.id).await;
                    let r2 = self.registry.update_status(&conflict.id, WorkStatus::Pending).await;
                    r1.and(r2)
                }
                crate::types::ConflictKind::Unknown => self.registry.record_error(&conflict.id, "unresolved conflict, marked seen".to_string()).await,
            };
            match outcome {
                Ok(()) => resolved += 1,
                Err(e) => warn!(work_item_id = %conflict.id, error = %e, "failed to resolve conflict"),
            }
        }
        resolved
    }

    /// Optional, disabled-by-default pipeline warm-up
    /// (`ENABLE_AUTOGEN_BACKFILL`, §4.E.5, §6.5). Synthesizes a small,
    /// clearly flagged set of `auto_generated` items when the pending
    /// backlog drops below `refill_threshold`.
    #[instrument(skip(self))]
    async fn maybe_backfill(&self) -> usize {
        if !self.config.enable_autogen_backfill {
            return 0;
        }
        let pending = self.registry.by_status(WorkStatus::Pending).await.len();
        if pending >= self.config.refill_threshold {
            return 0;
        }

        let templates = autogen_templates();
        let mut created = 0;
        for mut item in templates {
            item.auto_generated = true;
            if self.registry.insert(item).await.is_ok() {
                created += 1;
            }
        }
        info!(created, "auto-generated backfill items inserted to keep the pipeline warm");
        created
    }

    /// One full iteration of the tick loop (§4.E), capped at
    /// `tick_hard_cap_seconds`; a tick that exceeds it logs a warning and
    /// yields rather than blocking forever (§5 Timeouts).
    #[instrument(skip(self))]
    pub async fn tick(&self) -> TickReport {
        let hard_cap = Duration::from_secs(self.config.tick_hard_cap_seconds);
        let start = std::time::Instant::now();

        let body = async {
            let scan = self.scan().await;
            let loaded = self.batch_load().await;
            let loaded_count = loaded.len();

            let mut completed = 0usize;
            let mut requeued = 0usize;
            for item in loaded {
                let before = self.registry.get(&item.id).await.map(|i| i.status).unwrap_or(WorkStatus::Pending);
                self.decompose_and_dispatch(item.clone()).await;
                let after = self.registry.get(&item.id).await.map(|i| i.status).unwrap_or(before);
                match after {
                    WorkStatus::Completed => completed += 1,
                    WorkStatus::Pending | WorkStatus::Retrying => requeued += 1,
                    _ => {}
                }
            }

            let conflicts_resolved = self.self_heal().await;
            let backfilled = self.maybe_backfill().await;

            TickReport {
                scan,
                loaded: loaded_count,
                completed,
                requeued,
                conflicts_resolved,
                backfilled,
                exceeded_hard_cap: false,
            }
        };

        let report = match tokio::time::timeout(hard_cap, body).await {
            Ok(report) => report,
            Err(_) => {
                warn!(hard_cap_seconds = self.config.tick_hard_cap_seconds, "dispatcher tick exceeded hard cap, yielding");
                TickReport {
                    exceeded_hard_cap: true,
                    ..Default::default()
                }
            }
        };

        self.metrics.observe_dispatcher_tick(start.elapsed().as_secs_f64());
        report
    }

    /// Runs `tick()` every `poll_interval_seconds` until `shutdown` fires.
    pub async fn run_loop(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.poll_interval_seconds));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick().await;
                    debug!(?report, "dispatcher tick finished");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("dispatcher loop stopping");
                        break;
                    }
                }
            }
        }
    }
}

/// Fixed template for optional auto-generated backfill items, scaled down
/// from the original's longer sample list (SPEC_FULL.md §1).
fn autogen_templates() -> Vec<WorkItem> {
    vec![
        WorkItem::new_task("Update README.md", "Update project README with latest setup instructions", 1.0),
        WorkItem::new_todo(
            "Setup Development Environment",
            "Configure development environment with proper tooling and documentation",
            Complexity::Medium,
            Priority::Medium,
            3.0,
        ),
        WorkItem::new_complex_todo(
            "Harden Authentication Flow",
            "Review and harden the authentication and authorization flow end to end",
            Complexity::High,
            Priority::High,
            8.0,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentDirectory;

    fn dispatcher() -> Dispatcher {
        let config = DispatcherConfig {
            poll_interval_seconds: 30,
            batch_quota_task: 1,
            batch_quota_complex_todo: 3,
            batch_quota_todo: 10,
            parent_timeout_seconds: 5,
            tick_hard_cap_seconds: 10,
            enable_autogen_backfill: false,
            refill_threshold: 2,
        };
        let registry = Arc::new(WorkRegistry::new());
        let cache = Arc::new(BreakdownCache::new(3600, 100));
        let worker_pool = Arc::new(WorkerPool::new(
            2,
            64,
            1,
            Duration::from_millis(20),
            Arc::new(crate::worker_pool::NoopExecutor),
        ));
        let directory = Arc::new(AgentDirectory::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        Dispatcher::new("dispatcher-1", config, registry, cache, worker_pool, directory, metrics)
    }

    #[tokio::test]
    async fn scan_marks_pending_items_with_priority() {
        let dispatcher = dispatcher();
        let item = WorkItem::new_task("fix bug", "null pointer in parser", 0.5);
        let id = dispatcher.registry.insert(item).await.unwrap();

        let stats = dispatcher.scan().await;
        assert_eq!(stats.marked, 1);
        let fetched = dispatcher.registry.get(&id).await.unwrap();
        assert_eq!(fetched.assigned_agent.as_deref(), Some("dispatcher-1"));
        assert!(fetched.priority_breakdown.is_some());
    }

    #[tokio::test]
    async fn batch_load_respects_per_kind_quota() {
        let dispatcher = dispatcher();
        for i in 0..5 {
            let item = WorkItem::new_todo(format!("todo {i}"), "work", Complexity::Medium, Priority::Medium, 1.0);
            dispatcher.registry.insert(item).await.unwrap();
        }
        dispatcher.scan().await;
        let loaded = dispatcher.batch_load().await;
        assert_eq!(loaded.len(), 5); // below the quota of 10, all load
    }

    #[tokio::test]
    async fn full_tick_completes_a_simple_task() {
        let dispatcher = dispatcher();
        let item = WorkItem::new_task("do the thing", "a small unit of work", 0.25);
        let id = dispatcher.registry.insert(item).await.unwrap();

        let report = dispatcher.tick().await;
        assert_eq!(report.loaded, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(dispatcher.registry.get(&id).await.unwrap().status, WorkStatus::Completed);
    }

    #[tokio::test]
    async fn self_heal_resolves_dual_assignment() {
        let dispatcher = dispatcher();
        let item = WorkItem::new_task("x", "y", 1.0);
        let id = dispatcher.registry.insert(item).await.unwrap();
        dispatcher.registry.assign(&id, "dispatcher-1").await.unwrap();
        dispatcher.registry.update_status(&id, WorkStatus::InProgress).await.unwrap();
        dispatcher.registry.assign(&id, "dispatcher-2").await.unwrap();

        let resolved = dispatcher.self_heal().await;
        assert_eq!(resolved, 1);
        let fetched = dispatcher.registry.get(&id).await.unwrap();
        assert!(fetched.assigned_agent.is_some());
    }

    #[tokio::test]
    async fn backfill_disabled_by_default_creates_nothing() {
        let dispatcher = dispatcher();
        assert_eq!(dispatcher.maybe_backfill().await, 0);
    }

    #[tokio::test]
    async fn backfill_enabled_tops_up_when_below_threshold() {
        let mut dispatcher = dispatcher();
        dispatcher.config.enable_autogen_backfill = true;
        dispatcher.config.refill_threshold = 5;
        let created = dispatcher.maybe_backfill().await;
        assert!(created > 0);
    }
}
