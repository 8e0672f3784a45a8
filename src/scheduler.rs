//! Scheduler / Job plane (§4.G): a `BinaryHeap` priority queue of Jobs,
//! separate from the Work Registry's WorkItems (Open Question decision:
//! the Scheduler orders strictly on `Job.priority_score`, never
//! recomputing it — that's the Dispatcher's job via `PriorityScorer`).
//! Queue ordering is grounded on `vision-resource-manager/src/task_queue.rs`'s
//! `QueuedTask` wrapper; retry/backoff and the dual scheduler/monitor
//! loops are grounded on `job_scheduler.py`.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::agents::AgentDirectory;
use crate::config::SchedulerConfig;
use crate::error::{CoreError, CoreResult};
use crate::types::{Job, JobAttempt, JobStatus};

#[derive(Debug, Clone)]
struct QueueEntry {
    job_id: String,
    score: f64,
    scheduled_time: DateTime<Utc>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.job_id == other.job_id
    }
}
impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Orders by score descending (a `BinaryHeap` is a max-heap, so the
/// highest score pops first); ties broken by earliest `scheduled_time`,
/// then by `job_id` — a total order, matching `QueuedTask`'s FIFO
/// tie-break in the task-queue reference plus spec.md's `(scheduled_time,
/// id)` tie-break requirement.
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.scheduled_time.cmp(&self.scheduled_time))
            .then_with(|| other.job_id.cmp(&self.job_id))
    }
}

struct SchedulerState {
    jobs: HashMap<String, Job>,
    queue: BinaryHeap<QueueEntry>,
    /// Jobs not yet eligible to run: unmet dependencies or a future
    /// `scheduled_time` (retry backoff). Rechecked by `monitor_tick`.
    delayed: HashSet<String>,
}

pub struct Scheduler {
    config: SchedulerConfig,
    state: RwLock<SchedulerState>,
    directory: Arc<AgentDirectory>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, directory: Arc<AgentDirectory>) -> Self {
        Self {
            config,
            state: RwLock::new(SchedulerState {
                jobs: HashMap::new(),
                queue: BinaryHeap::new(),
                delayed: HashSet::new(),
            }),
            directory,
        }
    }

    fn effective_score(&self, job: &Job) -> f64 {
        if let Some(deadline) = job.deadline {
            if (deadline - Utc::now()).num_seconds() <= self.config.deadline_epsilon_seconds {
                return f64::MAX;
            }
        }
        job.priority_score
    }

    fn is_ready(jobs: &HashMap<String, Job>, job: &Job) -> bool {
        if Utc::now() < job.scheduled_time {
            return false;
        }
        job.dependencies
            .iter()
            .all(|dep| jobs.get(dep).map(|d| d.status == JobStatus::Completed).unwrap_or(false))
    }

    /// Admits a Job onto the Scheduler plane: parked in the delayed set
    /// if its dependencies aren't met yet or its `scheduled_time` is in
    /// the future, otherwise pushed straight onto the priority queue.
    #[instrument(skip(self, job))]
    pub async fn schedule(&self, job: Job) -> CoreResult<String> {
        let id = job.id.clone();
        let mut state = self.state.write().await;
        let ready = Self::is_ready(&state.jobs, &job);
        let score = self.effective_score(&job);
        let scheduled_time = job.scheduled_time;

        state.jobs.insert(id.clone(), job);
        if ready {
            state.queue.push(QueueEntry { job_id: id.clone(), score, scheduled_time });
        } else {
            state.delayed.insert(id.clone());
            if let Some(j) = state.jobs.get_mut(&id) {
                j.status = JobStatus::Delayed;
            }
        }
        debug!(job_id = %id, ready, "scheduled job");
        Ok(id)
    }

    pub async fn cancel(&self, job_id: &str) -> CoreResult<()> {
        let mut state = self.state.write().await;
        let job = state.jobs.get_mut(job_id).ok_or_else(|| CoreError::NotFound { kind: "Job", id: job_id.to_string() })?;
        job.status = JobStatus::Cancelled;
        state.delayed.remove(job_id);
        state.queue = state.queue.iter().filter(|e| e.job_id != job_id).cloned().collect();
        Ok(())
    }

    /// Pops the highest-scoring ready Job and assigns it to the first
    /// agent whose capabilities satisfy it at or above the configured
    /// overlap threshold (§4.G). Jobs that can't find a candidate are
    /// re-queued rather than dropped.
    #[instrument(skip(self))]
    pub async fn dispatch_next(&self) -> Option<(String, String)> {
        let mut state = self.state.write().await;
        let mut deferred = Vec::new();
        let mut result = None;

        while let Some(entry) = state.queue.pop() {
            let job_status = state.jobs.get(&entry.job_id).map(|j| j.status);
            match job_status {
                Some(JobStatus::Pending) | Some(JobStatus::Retrying) => {}
                _ => continue, // cancelled/completed/no-longer-pending entries are stale
            }

            let required = state.jobs.get(&entry.job_id).map(|j| j.required_capabilities.clone()).unwrap_or_default();
            let candidate = best_capability_match(&self.directory.list(), &required, self.config.capability_overlap_threshold);

            match candidate {
                Some(agent_id) => {
                    if let Some(job) = state.jobs.get_mut(&entry.job_id) {
                        job.status = JobStatus::Running;
                        job.assigned_agent = Some(agent_id.clone());
                    }
                    result = Some((entry.job_id, agent_id));
                    break;
                }
                None => deferred.push(entry),
            }
        }

        for entry in deferred {
            state.queue.push(entry);
        }
        result
    }

    #[instrument(skip(self))]
    pub async fn on_complete(&self, job_id: &str) -> CoreResult<()> {
        let mut state = self.state.write().await;
        let job = state.jobs.get_mut(job_id).ok_or_else(|| CoreError::NotFound { kind: "Job", id: job_id.to_string() })?;
        let now = Utc::now();
        job.history.push(JobAttempt {
            attempt: job.retry_count + 1,
            started_at: job.scheduled_time,
            finished_at: now,
            outcome: JobStatus::Completed,
            error: None,
        });
        job.status = JobStatus::Completed;
        info!(job_id = %job_id, "job completed");
        Ok(())
    }

    /// Retries with exponential backoff (`retry_backoff_base *
    /// 2^(attempt-1)`, attempt-indexed per `_handle_job_failure`) while
    /// `retry_count < max_retries`, else marks the job permanently Failed.
    #[instrument(skip(self))]
    pub async fn on_fail(&self, job_id: &str, error: String) -> CoreResult<()> {
        let mut state = self.state.write().await;
        let job = state.jobs.get_mut(job_id).ok_or_else(|| CoreError::NotFound { kind: "Job", id: job_id.to_string() })?;
        let now = Utc::now();
        job.history.push(JobAttempt {
            attempt: job.retry_count + 1,
            started_at: job.scheduled_time,
            finished_at: now,
            outcome: JobStatus::Failed,
            error: Some(error.clone()),
        });

        if job.enable_retries && job.retry_count < job.max_retries {
            job.retry_count += 1;
            let delay_seconds = self.config.retry_backoff_base_seconds * 2f64.powi((job.retry_count - 1) as i32);
            job.scheduled_time = now + ChronoDuration::milliseconds((delay_seconds * 1000.0) as i64);
            job.status = JobStatus::Delayed;
            state.delayed.insert(job_id.to_string());
            warn!(job_id = %job_id, retry_count = job.retry_count, delay_seconds, "job failed, retrying with backoff");
        } else {
            job.status = JobStatus::Failed;
            warn!(job_id = %job_id, "job failed permanently");
        }
        Ok(())
    }

    /// Promotes delayed jobs whose dependencies are now met and whose
    /// `scheduled_time` has arrived onto the live queue. Meant to run on
    /// a timer from `monitor_loop`.
    #[instrument(skip(self))]
    pub async fn monitor_tick(&self) -> usize {
        let mut state = self.state.write().await;
        let ready_ids: Vec<String> = state
            .delayed
            .iter()
            .filter(|id| state.jobs.get(*id).map(|j| Self::is_ready(&state.jobs, j)).unwrap_or(false))
            .cloned()
            .collect();

        for id in &ready_ids {
            state.delayed.remove(id);
            let (score, scheduled_time) = if let Some(job) = state.jobs.get_mut(id) {
                job.status = JobStatus::Pending;
                (self.effective_score(job), job.scheduled_time)
            } else {
                continue;
            };
            state.queue.push(QueueEntry { job_id: id.clone(), score, scheduled_time });
        }
        ready_ids.len()
    }

    pub async fn queue_depth(&self) -> usize {
        self.state.read().await.queue.len()
    }

    pub async fn get(&self, job_id: &str) -> CoreResult<Job> {
        self.state
            .read()
            .await
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound { kind: "Job", id: job_id.to_string() })
    }
}

/// Finds the first agent whose capability overlap with `required` meets
/// `threshold` (§6.5's `capability_overlap_threshold`). An empty
/// `required` set always matches.
fn best_capability_match(agents: &[crate::types::Agent], required: &HashSet<String>, threshold: f64) -> Option<String> {
    if required.is_empty() {
        return agents.first().map(|a| a.agent_id.clone());
    }
    agents
        .iter()
        .filter(|a| a.status == crate::types::AgentStatus::Available)
        .find(|a| {
            let overlap = required.intersection(&a.capabilities).count() as f64;
            overlap / required.len() as f64 >= threshold
        })
        .map(|a| a.agent_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;
    use std::collections::HashSet;

    fn scheduler() -> Scheduler {
        let config = SchedulerConfig {
            retry_backoff_base_seconds: 0.01,
            deadline_epsilon_seconds: 5,
            capability_overlap_threshold: 0.7,
        };
        Scheduler::new(config, Arc::new(AgentDirectory::new()))
    }

    #[tokio::test]
    async fn schedule_without_dependencies_is_immediately_ready() {
        let scheduler = scheduler();
        let job = Job::new("build", Priority::High, HashSet::new());
        let id = scheduler.schedule(job).await.unwrap();
        assert_eq!(scheduler.get(&id).await.unwrap().status, JobStatus::Pending);
        assert_eq!(scheduler.queue_depth().await, 1);
    }

    #[tokio::test]
    async fn schedule_with_unmet_dependency_is_delayed() {
        let scheduler = scheduler();
        let mut job = Job::new("deploy", Priority::High, HashSet::new());
        job.dependencies.insert("job_missing".to_string());
        let id = scheduler.schedule(job).await.unwrap();
        assert_eq!(scheduler.get(&id).await.unwrap().status, JobStatus::Delayed);
        assert_eq!(scheduler.queue_depth().await, 0);
    }

    #[tokio::test]
    async fn higher_priority_score_dequeues_first() {
        let scheduler = scheduler();
        scheduler.directory.register("agent-a", HashSet::new());
        let mut low = Job::new("low", Priority::Low, HashSet::new());
        low.priority_score = 10.0;
        let mut high = Job::new("high", Priority::Critical, HashSet::new());
        high.priority_score = 90.0;
        scheduler.schedule(low).await.unwrap();
        scheduler.schedule(high.clone()).await.unwrap();

        let (job_id, _agent) = scheduler.dispatch_next().await.unwrap();
        assert_eq!(job_id, high.id);
    }

    #[tokio::test]
    async fn on_fail_schedules_retry_with_backoff_then_fails_permanently() {
        let scheduler = scheduler();
        let mut job = Job::new("flaky", Priority::Medium, HashSet::new());
        job.max_retries = 1;
        let id = scheduler.schedule(job).await.unwrap();

        scheduler.on_fail(&id, "boom".to_string()).await.unwrap();
        assert_eq!(scheduler.get(&id).await.unwrap().status, JobStatus::Delayed);

        scheduler.on_fail(&id, "boom again".to_string()).await.unwrap();
        assert_eq!(scheduler.get(&id).await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn monitor_tick_promotes_jobs_once_dependency_completes() {
        let scheduler = scheduler();
        let dep = Job::new("dep", Priority::Medium, HashSet::new());
        let dep_id = scheduler.schedule(dep).await.unwrap();

        let mut job = Job::new("dependent", Priority::Medium, HashSet::new());
        job.dependencies.insert(dep_id.clone());
        let id = scheduler.schedule(job).await.unwrap();
        assert_eq!(scheduler.queue_depth().await, 1); // only dep is queued

        scheduler.on_complete(&dep_id).await.unwrap();
        let promoted = scheduler.monitor_tick().await;
        assert_eq!(promoted, 1);
        assert_eq!(scheduler.get(&id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_removes_job_from_queue() {
        let scheduler = scheduler();
        let job = Job::new("x", Priority::Medium, HashSet::new());
        let id = scheduler.schedule(job).await.unwrap();
        scheduler.cancel(&id).await.unwrap();
        assert_eq!(scheduler.queue_depth().await, 0);
        assert_eq!(scheduler.get(&id).await.unwrap().status, JobStatus::Cancelled);
    }
}
