//! Core data model: WorkItem, MicroTask, WorkerAssignment, Agent, Job,
//! ParentResult, and the closed enums that classify them (§3).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The three kinds of work the Registry accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    Task,
    Todo,
    ComplexTodo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// WorkItem lifecycle states (§3 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Blocked,
    Retrying,
}

/// Per sub-score breakdown the Priority Scorer leaves on a WorkItem so
/// the final number is inspectable, not just an opaque integer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityBreakdown {
    pub complexity_score: f64,
    pub priority_multiplier: f64,
    pub urgency_score: f64,
    pub resource_score: f64,
    pub dependency_score: f64,
    pub business_value_score: f64,
    pub final_priority: f64,
    pub calculated_at: DateTime<Utc>,
}

/// A short unit of work produced by the Breakdown Engine from a parent
/// WorkItem (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroTask {
    pub task_id: String,
    pub parent_id: String,
    pub title: String,
    pub description: String,
    pub estimated_minutes: u32,
    pub required_capabilities: HashSet<String>,
    pub complexity_score: u8,
    pub status: WorkStatus,
}

/// Opaque per-microtask execution result. The shape of `data` is owned by
/// the collaborator that implements the Worker hook (§6.3); the core only
/// ever reads `success`/`error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroTaskResult {
    pub task_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub data: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// The authoritative record for a unit of work in the Registry (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub name: String,
    pub description: String,

    pub kind: WorkKind,
    pub complexity: Complexity,
    pub priority: Priority,

    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub estimated_hours: f64,

    pub assigned_agent: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    /// An agent that attempted to claim this item while it was already
    /// assigned to someone else (§4.B); the original assignment is kept,
    /// the contender is recorded here for `self_heal` to find and resolve.
    pub contested_by: Option<String>,
    pub work_type: String,

    pub status: WorkStatus,
    pub progress: f64,
    pub retry_count: u32,

    pub subtasks: Vec<MicroTask>,
    pub subtask_progress: HashMap<String, f64>,
    pub subtask_assignments: HashMap<String, usize>,

    pub priority_breakdown: Option<PriorityBreakdown>,
    pub breakdown_cache_key: Option<String>,

    pub required_capabilities: HashSet<String>,
    pub dependencies: HashSet<String>,

    pub auto_generated: bool,
    pub last_error: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl WorkItem {
    /// Builder used by the three `new_*` constructors below; validation
    /// (non-empty id/name, estimated_hours >= 0, complexity-kind
    /// consistency) lives in `Registry::insert`, not here, since the
    /// Registry is the single mutation boundary (§4.A).
    fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        kind: WorkKind,
        complexity: Complexity,
        priority: Priority,
        estimated_hours: f64,
    ) -> Self {
        let now = Utc::now();
        let work_type = format!("{complexity:?}").to_lowercase();
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            kind,
            complexity,
            priority,
            created_at: now,
            last_updated: now,
            deadline: None,
            estimated_hours,
            assigned_agent: None,
            assigned_at: None,
            contested_by: None,
            work_type,
            status: WorkStatus::Pending,
            progress: 0.0,
            retry_count: 0,
            subtasks: Vec::new(),
            subtask_progress: HashMap::new(),
            subtask_assignments: HashMap::new(),
            priority_breakdown: None,
            breakdown_cache_key: None,
            required_capabilities: HashSet::new(),
            dependencies: HashSet::new(),
            auto_generated: false,
            last_error: None,
            metadata: HashMap::new(),
        }
    }

    pub fn new_task(name: impl Into<String>, description: impl Into<String>, estimated_hours: f64) -> Self {
        Self::new(
            format!("task_{}", short_id()),
            name,
            description,
            WorkKind::Task,
            Complexity::Low,
            Priority::Medium,
            estimated_hours,
        )
    }

    pub fn new_todo(
        name: impl Into<String>,
        description: impl Into<String>,
        complexity: Complexity,
        priority: Priority,
        estimated_hours: f64,
    ) -> Self {
        Self::new(
            format!("todo_{}", short_id()),
            name,
            description,
            WorkKind::Todo,
            complexity,
            priority,
            estimated_hours,
        )
    }

    pub fn new_complex_todo(
        name: impl Into<String>,
        description: impl Into<String>,
        complexity: Complexity,
        priority: Priority,
        estimated_hours: f64,
    ) -> Self {
        Self::new(
            format!("complex_todo_{}", short_id()),
            name,
            description,
            WorkKind::ComplexTodo,
            complexity,
            priority,
            estimated_hours,
        )
    }

    /// `sum(subtask_progress) / |subtasks|`, the right-hand side of
    /// invariant 2 (§3).
    pub fn mean_subtask_progress(&self) -> f64 {
        if self.subtasks.is_empty() {
            return self.progress;
        }
        let total: f64 = self
            .subtasks
            .iter()
            .map(|t| self.subtask_progress.get(&t.task_id).copied().unwrap_or(0.0))
            .sum();
        total / self.subtasks.len() as f64
    }

    pub fn age_hours(&self) -> f64 {
        (Utc::now() - self.created_at).num_seconds() as f64 / 3600.0
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Read-only projection of a WorkItem returned across the public API
/// boundary (§6.1) — never exposes internal pointers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemSnapshot {
    pub id: String,
    pub name: String,
    pub kind: WorkKind,
    pub status: WorkStatus,
    pub priority: Priority,
    pub progress: f64,
    pub assigned_agent: Option<String>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl From<&WorkItem> for WorkItemSnapshot {
    fn from(item: &WorkItem) -> Self {
        Self {
            id: item.id.clone(),
            name: item.name.clone(),
            kind: item.kind,
            status: item.status,
            priority: item.priority,
            progress: item.progress,
            assigned_agent: item.assigned_agent.clone(),
            retry_count: item.retry_count,
            last_error: item.last_error.clone(),
        }
    }
}

/// Ephemeral binding of MicroTasks to a single Worker Pool slot (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAssignment {
    pub worker_id: usize,
    pub tasks: Vec<MicroTask>,
    pub assigned_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub results: HashMap<String, MicroTaskResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Available,
    Busy,
    Draining,
    Dead,
}

/// A logical executor registered with the Scheduler (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: String,
    pub name: String,
    pub capabilities: HashSet<String>,
    pub current_task_ids: HashSet<String>,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
}

impl Agent {
    pub fn new(name: impl Into<String>, capabilities: HashSet<String>) -> Self {
        Self {
            agent_id: format!("agent_{}", short_id()),
            name: name.into(),
            capabilities,
            current_task_ids: HashSet::new(),
            status: AgentStatus::Available,
            last_heartbeat: Utc::now(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.current_task_ids.is_empty() && self.status == AgentStatus::Available
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Delayed,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

/// A single attempt record appended to a Job's history on completion or
/// failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttempt {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: JobStatus,
    pub error: Option<String>,
}

/// A first-class schedulable item on the Scheduler plane, distinct from a
/// WorkItem (§3, §4.G).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub required_capabilities: HashSet<String>,
    pub dependencies: HashSet<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub priority_score: f64,
    pub scheduled_time: DateTime<Utc>,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub enable_retries: bool,
    pub history: Vec<JobAttempt>,
    pub assigned_agent: Option<String>,
}

impl Job {
    pub fn new(name: impl Into<String>, priority: Priority, required_capabilities: HashSet<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("job_{}", short_id()),
            name: name.into(),
            required_capabilities,
            dependencies: HashSet::new(),
            deadline: None,
            priority,
            priority_score: 0.0,
            scheduled_time: now,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            enable_retries: true,
            history: Vec::new(),
            assigned_agent: None,
        }
    }
}

/// Aggregate outcome over all MicroTasks of one parent WorkItem (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentResult {
    pub parent_id: String,
    pub total_workers: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_micro_tasks: usize,
    pub total_estimated_hours: f64,
    pub collaboration_time_seconds: f64,
    pub cache_cleared: bool,
    pub worker_results: HashMap<usize, Vec<MicroTaskResult>>,
}

/// One of the three overlap/conflict outcomes the Registry's
/// `check_overlap` can return (§4.B).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlapOutcome {
    None,
    DualAssignment { other_agent: String },
    AlreadyImplemented { other_agent: String },
    SimilarInProgress { other_id: String, other_agent: String },
}

/// The three conflict shapes the Dispatcher's self-heal step resolves
/// (supplemented from `collective_worker_processor.py`'s
/// `detect_agent_conflicts`; see SPEC_FULL.md §1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    DualAssignment,
    OrphanedAssignment,
    Unknown,
}
