//! Collective Worker Pool (§4.F): a bounded, fixed-size executor for
//! MicroTasks. Grounded on `agentaskit-production/core/src/execution/mod.rs`'s
//! `ExecutionEngine` — a semaphore-bounded pool with per-task timeout and
//! an `Arc`-cloneable handle so task futures can run independently of the
//! caller's stack frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::error::{CoreError, CoreResult};
use crate::types::{MicroTask, MicroTaskResult, ParentResult};

/// The Worker hook (§6.3): the shape every collaborator implements to
/// actually run a MicroTask. The core never inspects `data`'s contents.
#[async_trait]
pub trait MicroTaskExecutor: Send + Sync {
    async fn execute(&self, task: &MicroTask, ctx: &WorkerContext) -> Result<serde_json::Value, String>;
}

/// Context handed to a Worker hook implementation (§6.3): cancellation
/// signal, deadline, and a field identifying the owning worker for logging.
#[derive(Clone)]
pub struct WorkerContext {
    pub worker_id: usize,
    pub cancellation: Arc<AtomicBool>,
    pub deadline: Duration,
}

impl WorkerContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.load(Ordering::Relaxed)
    }
}

/// A no-op executor used where no collaborator worker hook is wired in
/// (tests, or a daemon started without an external Worker implementation
/// registered). Always succeeds immediately.
pub struct NoopExecutor;

#[async_trait]
impl MicroTaskExecutor for NoopExecutor {
    async fn execute(&self, task: &MicroTask, _ctx: &WorkerContext) -> Result<serde_json::Value, String> {
        Ok(serde_json::json!({ "task_id": task.task_id, "noop": true }))
    }
}

/// Fixed-size pool of N workers (§4.F). Cheaply `Clone`-able: every field
/// is an `Arc`, so a handle can be moved into each spawned MicroTask
/// future without the pool itself needing a `'static` lifetime trick.
#[derive(Clone)]
pub struct WorkerPool {
    max_workers: usize,
    max_queue: usize,
    max_retries: u32,
    min_task_timeout: Duration,
    semaphore: Arc<Semaphore>,
    queue_depth: Arc<AtomicUsize>,
    executor: Arc<dyn MicroTaskExecutor>,
    parent_cancellations: Arc<DashMap<String, Arc<AtomicBool>>>,
}

impl WorkerPool {
    pub fn new(max_workers: usize, max_queue: usize, max_retries: u32, min_task_timeout: Duration, executor: Arc<dyn MicroTaskExecutor>) -> Self {
        Self {
            max_workers,
            max_queue,
            max_retries,
            min_task_timeout,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            queue_depth: Arc::new(AtomicUsize::new(0)),
            executor,
            parent_cancellations: Arc::new(DashMap::new()),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.max_workers
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Signals cooperative cancellation of every pending/in-flight MicroTask
    /// belonging to `parent_id` (§5 cancellation level 2).
    pub fn cancel_parent(&self, parent_id: &str) {
        if let Some(flag) = self.parent_cancellations.get(parent_id) {
            flag.store(true, Ordering::Relaxed);
        }
    }

    fn task_deadline(&self, task: &MicroTask) -> Duration {
        let scaled = Duration::from_secs_f64(task.estimated_minutes as f64 * 60.0 * 0.8);
        scaled.max(self.min_task_timeout)
    }

    /// Runs a single MicroTask to completion, retrying on
    /// timeout/transient failure up to `max_retries`, matching §4.F's
    /// per-task timeout and §7's retry policy.
    #[instrument(skip(self, task, cancel_flag), fields(task_id = %task.task_id))]
    async fn run_one(&self, worker_id: usize, task: MicroTask, cancel_flag: Arc<AtomicBool>) -> MicroTaskResult {
        let deadline = self.task_deadline(&task);
        let mut attempt = 0u32;

        loop {
            if cancel_flag.load(Ordering::Relaxed) {
                return MicroTaskResult {
                    task_id: task.task_id.clone(),
                    success: false,
                    error: Some("cancelled".to_string()),
                    data: serde_json::Value::Null,
                    started_at: Utc::now(),
                    completed_at: Utc::now(),
                };
            }

            if self.queue_depth.load(Ordering::Relaxed) >= self.max_queue {
                return MicroTaskResult {
                    task_id: task.task_id.clone(),
                    success: false,
                    error: Some(format!("{}", CoreError::Overloaded { depth: self.queue_depth.load(Ordering::Relaxed), max: self.max_queue })),
                    data: serde_json::Value::Null,
                    started_at: Utc::now(),
                    completed_at: Utc::now(),
                };
            }

            self.queue_depth.fetch_add(1, Ordering::Relaxed);
            let permit = self.semaphore.acquire().await;
            self.queue_depth.fetch_sub(1, Ordering::Relaxed);
            let _permit = match permit {
                Ok(p) => p,
                Err(_) => {
                    return MicroTaskResult {
                        task_id: task.task_id.clone(),
                        success: false,
                        error: Some("worker pool closed".to_string()),
                        data: serde_json::Value::Null,
                        started_at: Utc::now(),
                        completed_at: Utc::now(),
                    }
                }
            };

            let started_at = Utc::now();
            let ctx = WorkerContext {
                worker_id,
                cancellation: cancel_flag.clone(),
                deadline,
            };
            let outcome = tokio::time::timeout(deadline, self.executor.execute(&task, &ctx)).await;
            let completed_at = Utc::now();

            match outcome {
                Ok(Ok(data)) => {
                    return MicroTaskResult {
                        task_id: task.task_id.clone(),
                        success: true,
                        error: None,
                        data,
                        started_at,
                        completed_at,
                    };
                }
                Ok(Err(message)) => {
                    if attempt < self.max_retries {
                        attempt += 1;
                        warn!(task_id = %task.task_id, attempt, "transient worker error, retrying");
                        continue;
                    }
                    return MicroTaskResult {
                        task_id: task.task_id.clone(),
                        success: false,
                        error: Some(format!("fatal worker error: {message}")),
                        data: serde_json::Value::Null,
                        started_at,
                        completed_at,
                    };
                }
                Err(_elapsed) => {
                    if attempt < self.max_retries {
                        attempt += 1;
                        warn!(task_id = %task.task_id, attempt, "microtask deadline exceeded, retrying");
                        continue;
                    }
                    return MicroTaskResult {
                        task_id: task.task_id.clone(),
                        success: false,
                        error: Some(format!("{}", CoreError::Timeout { elapsed_ms: deadline.as_millis() as u64, deadline_ms: deadline.as_millis() as u64 })),
                        data: serde_json::Value::Null,
                        started_at,
                        completed_at,
                    };
                }
            }
        }
    }

    /// Distributes `tasks` round-robin across worker ids `0..N-1`, runs
    /// them concurrently, and aggregates into a ParentResult under a
    /// global per-parent timeout (§4.E.4, §4.F).
    #[instrument(skip(self, tasks), fields(parent_id = %parent_id, count = tasks.len()))]
    pub async fn run_parent(&self, parent_id: &str, tasks: Vec<MicroTask>, parent_timeout: Duration) -> ParentResult {
        let total_micro_tasks = tasks.len();
        let total_estimated_hours: f64 = tasks.iter().map(|t| t.estimated_minutes as f64 / 60.0).sum();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.parent_cancellations.insert(parent_id.to_string(), cancel_flag.clone());

        let start = std::time::Instant::now();
        let mut joins = JoinSet::new();
        for (i, task) in tasks.into_iter().enumerate() {
            let worker_id = i % self.max_workers.max(1);
            let pool = self.clone();
            let cancel = cancel_flag.clone();
            joins.spawn(async move { (worker_id, pool.run_one(worker_id, task, cancel).await) });
        }

        let mut worker_results: HashMap<usize, Vec<MicroTaskResult>> = HashMap::new();
        let aggregate = async {
            while let Some(joined) = joins.join_next().await {
                if let Ok((worker_id, result)) = joined {
                    worker_results.entry(worker_id).or_default().push(result);
                }
            }
        };

        if tokio::time::timeout(parent_timeout, aggregate).await.is_err() {
            warn!(parent_id = %parent_id, "parent aggregation exceeded its deadline, cancelling stragglers");
            cancel_flag.store(true, Ordering::Relaxed);
            joins.abort_all();
            while let Some(joined) = joins.join_next().await {
                if let Ok((worker_id, result)) = joined {
                    worker_results.entry(worker_id).or_default().push(result);
                }
            }
        }

        self.parent_cancellations.remove(parent_id);

        let mut successful = 0usize;
        let mut failed = 0usize;
        for results in worker_results.values() {
            for r in results {
                if r.success {
                    successful += 1;
                } else {
                    failed += 1;
                }
            }
        }

        debug!(parent_id = %parent_id, successful, failed, "parent aggregation complete");

        ParentResult {
            parent_id: parent_id.to_string(),
            total_workers: worker_results.len(),
            successful,
            failed,
            total_micro_tasks,
            total_estimated_hours,
            collaboration_time_seconds: start.elapsed().as_secs_f64(),
            // The Worker Pool has no handle on the Breakdown Cache; the
            // Dispatcher fills this in once it purges the parent's entries.
            cache_cleared: false,
            worker_results,
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }
}
