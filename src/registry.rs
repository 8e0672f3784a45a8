//! Work Registry (§4.B): the single in-memory store of WorkItems. One
//! coarse `RwLock` guards the map, matching `agent-registry/src/registry.rs`'s
//! struct-behind-a-lock shape; overlap/similarity semantics are grounded on
//! `simple_registry.py`'s `check_implementation_overlap` /
//! `_are_todos_similar`.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::error::{CoreError, CoreResult};
use crate::types::{OverlapOutcome, PriorityBreakdown, WorkItem, WorkItemSnapshot, WorkKind, WorkStatus};

/// Keywords whose co-occurrence in two descriptions, above `SIMILARITY_KEYWORD_THRESHOLD`,
/// flags them as similar work (§4.B).
const COMMON_KEYWORDS: &[&str] = &["agent", "implementation", "setup", "configuration", "development"];
const SIMILARITY_KEYWORD_THRESHOLD: usize = 2;

fn description_hash(description: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(description.as_bytes());
    format!("{:x}", hasher.finalize())
}

struct RegistryState {
    items: HashMap<String, WorkItem>,
    /// `id -> set of ids that declare a dependency on id`, used by the
    /// Priority Scorer's `blocks_others` and the Scheduler's dependency
    /// gating (§3 invariant 6).
    dependents: HashMap<String, HashSet<String>>,
}

/// The authoritative store of work items (§2.B). A single `RwLock` is the
/// only synchronization primitive; it is never held while calling into the
/// Breakdown Cache (§5's fixed lock order).
pub struct WorkRegistry {
    state: RwLock<RegistryState>,
}

impl Default for WorkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState {
                items: HashMap::new(),
                dependents: HashMap::new(),
            }),
        }
    }

    /// Rejects if another live item shares (name, description-hash) and is
    /// `pending` or `in_progress` (§4.B).
    #[instrument(skip(self, item))]
    pub async fn insert(&self, item: WorkItem) -> CoreResult<String> {
        if item.id.trim().is_empty() || item.name.trim().is_empty() {
            return Err(CoreError::Validation("id and name must be non-empty".into()));
        }
        if item.estimated_hours < 0.0 {
            return Err(CoreError::Validation("estimated_hours must be >= 0".into()));
        }
        validate_complexity_for_kind(&item)?;

        let name_hash = (item.name.clone(), description_hash(&item.description));
        let mut state = self.state.write().await;
        if let Some(existing) = state.items.values().find(|other| {
            (other.name.clone(), description_hash(&other.description)) == name_hash
                && matches!(other.status, WorkStatus::Pending | WorkStatus::InProgress)
        }) {
            return Err(CoreError::Duplicate {
                existing_id: existing.id.clone(),
            });
        }

        for dep in &item.dependencies {
            state.dependents.entry(dep.clone()).or_default().insert(item.id.clone());
        }

        let id = item.id.clone();
        state.items.insert(id.clone(), item);
        debug!(work_item_id = %id, "inserted work item");
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> CoreResult<WorkItem> {
        let state = self.state.read().await;
        state
            .items
            .get(id)
            .cloned()
            .ok_or(CoreError::NotFound { kind: "WorkItem", id: id.to_string() })
    }

    pub async fn snapshot(&self, id: &str) -> CoreResult<WorkItemSnapshot> {
        self.get(id).await.map(|item| WorkItemSnapshot::from(&item))
    }

    pub async fn update_status(&self, id: &str, status: WorkStatus) -> CoreResult<()> {
        self.mutate(id, |item| {
            item.status = status;
            item.last_updated = Utc::now();
            Ok(())
        })
        .await
    }

    /// Claims `id` for `agent_id`, enforcing invariant 1 (at most one
    /// owner): first claim wins and is recorded normally. A later claim by
    /// a *different* agent does not overwrite the recorded owner — under
    /// `mutate`'s single write lock this is a true compare-and-set, so a
    /// race between two callers can never silently drop the loser's claim.
    /// Instead it's captured in `contested_by`, for `self_heal` to find and
    /// resolve via `resolve_overlap`.
    pub async fn assign(&self, id: &str, agent_id: &str) -> CoreResult<()> {
        self.mutate(id, |item| {
            let contested = matches!(&item.assigned_agent, Some(current) if current != agent_id);
            if contested {
                item.contested_by = Some(agent_id.to_string());
            } else {
                item.assigned_agent = Some(agent_id.to_string());
                item.assigned_at = Some(Utc::now());
                item.contested_by = None;
            }
            item.last_updated = Utc::now();
            Ok(())
        })
        .await
    }

    pub async fn release(&self, id: &str) -> CoreResult<()> {
        self.mutate(id, |item| {
            item.assigned_agent = None;
            item.assigned_at = None;
            item.contested_by = None;
            item.last_updated = Utc::now();
            Ok(())
        })
        .await
    }

    pub async fn update_progress(&self, id: &str, progress: f64) -> CoreResult<()> {
        self.mutate(id, |item| {
            item.progress = progress.clamp(0.0, 1.0);
            item.last_updated = Utc::now();
            Ok(())
        })
        .await
    }

    /// Updates one subtask's progress and recomputes the parent's overall
    /// `progress` as the mean, preserving invariant 2.
    pub async fn update_subtask_progress(&self, id: &str, subtask_id: &str, progress: f64) -> CoreResult<()> {
        self.mutate(id, |item| {
            item.subtask_progress.insert(subtask_id.to_string(), progress.clamp(0.0, 1.0));
            item.progress = item.mean_subtask_progress();
            item.last_updated = Utc::now();
            Ok(())
        })
        .await
    }

    pub async fn set_subtasks(&self, id: &str, subtasks: Vec<crate::types::MicroTask>, cache_key: String) -> CoreResult<()> {
        self.mutate(id, |item| {
            item.subtask_progress = subtasks.iter().map(|t| (t.task_id.clone(), 0.0)).collect();
            item.subtasks = subtasks;
            item.breakdown_cache_key = Some(cache_key);
            item.last_updated = Utc::now();
            Ok(())
        })
        .await
    }

    /// Writes the Priority Scorer's output back onto the item so it's
    /// inspectable via the public API, and feeds `pending_of_kind`'s sort.
    pub async fn set_priority(&self, id: &str, breakdown: PriorityBreakdown) -> CoreResult<()> {
        self.mutate(id, |item| {
            item.priority_breakdown = Some(breakdown);
            item.last_updated = Utc::now();
            Ok(())
        })
        .await
    }

    pub async fn record_error(&self, id: &str, message: String) -> CoreResult<()> {
        self.mutate(id, |item| {
            item.last_error = Some(message);
            item.last_updated = Utc::now();
            Ok(())
        })
        .await
    }

    pub async fn increment_retry(&self, id: &str) -> CoreResult<u32> {
        let mut state = self.state.write().await;
        let item = state
            .items
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound { kind: "WorkItem", id: id.to_string() })?;
        item.retry_count += 1;
        item.last_updated = Utc::now();
        Ok(item.retry_count)
    }

    async fn mutate(&self, id: &str, f: impl FnOnce(&mut WorkItem) -> CoreResult<()>) -> CoreResult<()> {
        let mut state = self.state.write().await;
        let item = state
            .items
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound { kind: "WorkItem", id: id.to_string() })?;
        f(item)
    }

    pub async fn by_status(&self, status: WorkStatus) -> Vec<WorkItem> {
        let state = self.state.read().await;
        state.items.values().filter(|i| i.status == status).cloned().collect()
    }

    pub async fn by_kind(&self, kind: WorkKind) -> Vec<WorkItem> {
        let state = self.state.read().await;
        state.items.values().filter(|i| i.kind == kind).cloned().collect()
    }

    /// Pending items of `kind`, highest `priority_breakdown.final_priority`
    /// first, ties by `created_at` ascending (§4.E.2), capped at `limit`.
    pub async fn pending_of_kind(&self, kind: WorkKind, limit: usize) -> Vec<WorkItem> {
        let state = self.state.read().await;
        let mut items: Vec<WorkItem> = state
            .items
            .values()
            .filter(|i| i.kind == kind && i.status == WorkStatus::Pending)
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            let pa = a.priority_breakdown.as_ref().map(|b| b.final_priority).unwrap_or(0.0);
            let pb = b.priority_breakdown.as_ref().map(|b| b.final_priority).unwrap_or(0.0);
            pb.partial_cmp(&pa).unwrap_or(std::cmp::Ordering::Equal).then(a.created_at.cmp(&b.created_at))
        });
        items.truncate(limit);
        items
    }

    pub async fn add_dependency(&self, id: &str, dep_id: &str) -> CoreResult<()> {
        let mut state = self.state.write().await;
        if !state.items.contains_key(id) {
            return Err(CoreError::NotFound { kind: "WorkItem", id: id.to_string() });
        }
        state.dependents.entry(dep_id.to_string()).or_default().insert(id.to_string());
        if let Some(item) = state.items.get_mut(id) {
            item.dependencies.insert(dep_id.to_string());
        }
        Ok(())
    }

    /// Dependencies of `id` that are not yet `completed` (§3 invariant 6).
    pub async fn unmet(&self, id: &str) -> CoreResult<HashSet<String>> {
        let state = self.state.read().await;
        let item = state.items.get(id).ok_or_else(|| CoreError::NotFound { kind: "WorkItem", id: id.to_string() })?;
        Ok(item
            .dependencies
            .iter()
            .filter(|dep| !state.items.get(*dep).map(|d| d.status == WorkStatus::Completed).unwrap_or(false))
            .cloned()
            .collect())
    }

    /// Whether anything else declares a dependency on `id` — the Priority
    /// Scorer's `blocks_others` input (§4.D).
    pub async fn blocks_others(&self, id: &str) -> bool {
        let state = self.state.read().await;
        state.dependents.get(id).map(|s| !s.is_empty()).unwrap_or(false)
    }

    /// Deep-copy snapshot for the Metrics component; never exposes internal
    /// pointers (§4.B).
    pub async fn export(&self) -> Vec<WorkItemSnapshot> {
        let state = self.state.read().await;
        state.items.values().map(WorkItemSnapshot::from).collect()
    }

    /// Full-fidelity deep copy for the optional persisted-state snapshot
    /// (§6.6), as opposed to `export`'s read-only projection.
    pub async fn export_full(&self) -> Vec<WorkItem> {
        let state = self.state.read().await;
        state.items.values().cloned().collect()
    }

    /// Replaces the Registry's contents with `items`, resetting every
    /// `in_progress` item back to `pending` and clearing its assignment —
    /// at-most-once per parent is not claimed across restarts (§6.6).
    pub async fn restore(&self, items: Vec<WorkItem>) {
        let mut state = self.state.write().await;
        state.items.clear();
        state.dependents.clear();
        for mut item in items {
            if item.status == WorkStatus::InProgress {
                item.status = WorkStatus::Pending;
                item.assigned_agent = None;
                item.assigned_at = None;
            }
            for dep in &item.dependencies {
                state.dependents.entry(dep.clone()).or_default().insert(item.id.clone());
            }
            state.items.insert(item.id.clone(), item);
        }
    }

    pub async fn counts_by_status(&self) -> HashMap<WorkStatus, usize> {
        let state = self.state.read().await;
        let mut counts = HashMap::new();
        for item in state.items.values() {
            *counts.entry(item.status).or_insert(0) += 1;
        }
        counts
    }

    /// Detects the overlap/conflict shape for an attempted assignment of
    /// `id` to `agent_id` (§4.B): dual assignment, already-implemented, or
    /// a similar item already in progress.
    pub async fn check_overlap(&self, id: &str, agent_id: &str) -> CoreResult<OverlapOutcome> {
        let state = self.state.read().await;
        let item = state.items.get(id).ok_or_else(|| CoreError::NotFound { kind: "WorkItem", id: id.to_string() })?;

        if let Some(current) = &item.assigned_agent {
            if current != agent_id {
                return Ok(OverlapOutcome::DualAssignment { other_agent: current.clone() });
            }
        }
        if item.status == WorkStatus::Completed {
            if let Some(owner) = &item.assigned_agent {
                return Ok(OverlapOutcome::AlreadyImplemented { other_agent: owner.clone() });
            }
        }
        for other in state.items.values() {
            if other.id == item.id || other.status != WorkStatus::InProgress {
                continue;
            }
            if are_similar(item, other) {
                if let Some(other_agent) = &other.assigned_agent {
                    return Ok(OverlapOutcome::SimilarInProgress {
                        other_id: other.id.clone(),
                        other_agent: other_agent.clone(),
                    });
                }
            }
        }
        Ok(OverlapOutcome::None)
    }

    /// Resolves a dual-assignment conflict per spec.md §9's tie-break:
    /// the earliest `assigned_at` wins; ties broken lexicographically by
    /// `agent_id`. The losing assignment is cleared atomically.
    #[instrument(skip(self))]
    pub async fn resolve_overlap(&self, id: &str, candidate_agent: &str) -> CoreResult<String> {
        let mut state = self.state.write().await;
        let item = state.items.get_mut(id).ok_or_else(|| CoreError::NotFound { kind: "WorkItem", id: id.to_string() })?;

        let current_agent = item.assigned_agent.clone();
        let current_assigned_at = item.assigned_at;

        match (current_agent, current_assigned_at) {
            (Some(current), Some(current_at)) if current != candidate_agent => {
                // The candidate has no recorded `assigned_at` of its own here
                // since it lost the race before being written; treat `now`
                // as its claim time for the comparison.
                let now = Utc::now();
                let winner = if current_at < now {
                    current.clone()
                } else if now < current_at {
                    candidate_agent.to_string()
                } else if current <= candidate_agent.to_string() {
                    current.clone()
                } else {
                    candidate_agent.to_string()
                };
                if winner != current {
                    item.assigned_agent = Some(winner.clone());
                    item.assigned_at = Some(now);
                } else {
                    warn!(work_item_id = %id, loser = %candidate_agent, "overlap resolved in favor of incumbent");
                }
                item.contested_by = None;
                item.last_updated = Utc::now();
                Ok(winner)
            }
            _ => {
                item.contested_by = None;
                Ok(candidate_agent.to_string())
            }
        }
    }
}

fn validate_complexity_for_kind(item: &WorkItem) -> CoreResult<()> {
    use crate::types::Complexity;
    match item.kind {
        WorkKind::Task if item.complexity != Complexity::Low => Err(CoreError::Validation(
            "task kind requires low complexity".into(),
        )),
        WorkKind::ComplexTodo if !matches!(item.complexity, Complexity::High | Complexity::Critical) => Err(
            CoreError::Validation("complex_todo kind requires high or critical complexity".into()),
        ),
        _ => Ok(()),
    }
}

/// Shared capability set is non-empty AND shared description keywords meet
/// `SIMILARITY_KEYWORD_THRESHOLD` (§4.B), grounded on `_are_todos_similar`.
fn are_similar(a: &WorkItem, b: &WorkItem) -> bool {
    let shared_capabilities = a.required_capabilities.intersection(&b.required_capabilities).count();
    if shared_capabilities == 0 {
        return false;
    }
    let name_a = a.name.to_lowercase();
    let name_b = b.name.to_lowercase();
    let keyword_hits = COMMON_KEYWORDS
        .iter()
        .filter(|kw| name_a.contains(*kw) && name_b.contains(*kw))
        .count();
    keyword_hits >= SIMILARITY_KEYWORD_THRESHOLD
        || description_keyword_overlap(&a.description, &b.description) >= SIMILARITY_KEYWORD_THRESHOLD
}

fn description_keyword_overlap(a: &str, b: &str) -> usize {
    let words_a: HashSet<&str> = a.to_lowercase().split_whitespace().collect::<Vec<_>>().into_iter().collect();
    let words_b: HashSet<String> = b.to_lowercase().split_whitespace().map(|s| s.to_string()).collect();
    words_a.iter().filter(|w| words_b.contains(**w) && w.len() > 3).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Complexity, Priority};

    #[tokio::test]
    async fn insert_then_duplicate_rejected_while_pending() {
        let registry = WorkRegistry::new();
        let item = WorkItem::new_task("A", "shared description", 1.0);
        registry.insert(item.clone()).await.unwrap();

        let mut dup = WorkItem::new_task("A", "shared description", 1.0);
        dup.id = "task_other".to_string();
        let err = registry.insert(dup).await.unwrap_err();
        assert!(matches!(err, CoreError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn duplicate_allowed_after_completion() {
        let registry = WorkRegistry::new();
        let item = WorkItem::new_task("A", "shared description", 1.0);
        let id = registry.insert(item.clone()).await.unwrap();
        registry.update_status(&id, WorkStatus::Completed).await.unwrap();

        let mut dup = WorkItem::new_task("A", "shared description", 1.0);
        dup.id = "task_other".to_string();
        assert!(registry.insert(dup).await.is_ok());
    }

    #[tokio::test]
    async fn progress_consistency_matches_subtask_mean() {
        let registry = WorkRegistry::new();
        let item = WorkItem::new_todo("x", "y", Complexity::Medium, Priority::Medium, 1.0);
        let id = registry.insert(item).await.unwrap();
        let tasks = crate::breakdown::BreakdownEngine::compute(&registry.get(&id).await.unwrap());
        registry.set_subtasks(&id, tasks.clone(), "key".into()).await.unwrap();
        registry.update_subtask_progress(&id, &tasks[0].task_id, 1.0).await.unwrap();

        let fetched = registry.get(&id).await.unwrap();
        assert!((fetched.progress - fetched.mean_subtask_progress()).abs() < 1e-9);
    }

    #[tokio::test]
    async fn check_overlap_reports_dual_assignment() {
        let registry = WorkRegistry::new();
        let item = WorkItem::new_task("A", "desc", 1.0);
        let id = registry.insert(item).await.unwrap();
        registry.assign(&id, "agent_aaaa").await.unwrap();

        let outcome = registry.check_overlap(&id, "agent_bbbb").await.unwrap();
        assert_eq!(outcome, OverlapOutcome::DualAssignment { other_agent: "agent_aaaa".to_string() });
    }

    #[tokio::test]
    async fn resolve_overlap_keeps_earliest_assignment() {
        let registry = WorkRegistry::new();
        let item = WorkItem::new_task("A", "desc", 1.0);
        let id = registry.insert(item).await.unwrap();
        registry.assign(&id, "agent_aaaa").await.unwrap();

        let winner = registry.resolve_overlap(&id, "agent_bbbb").await.unwrap();
        assert_eq!(winner, "agent_aaaa");
        assert_eq!(registry.get(&id).await.unwrap().assigned_agent.as_deref(), Some("agent_aaaa"));
    }

    #[tokio::test]
    async fn unmet_dependencies_reported_until_completed() {
        let registry = WorkRegistry::new();
        let dep = WorkItem::new_task("dep", "dep desc", 1.0);
        let dep_id = registry.insert(dep).await.unwrap();
        let mut item = WorkItem::new_task("A", "desc", 1.0);
        item.dependencies.insert(dep_id.clone());
        let id = registry.insert(item).await.unwrap();
        for dep in registry.get(&id).await.unwrap().dependencies.clone() {
            registry.add_dependency(&id, &dep).await.unwrap();
        }

        assert_eq!(registry.unmet(&id).await.unwrap(), HashSet::from([dep_id.clone()]));
        registry.update_status(&dep_id, WorkStatus::Completed).await.unwrap();
        assert!(registry.unmet(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn restore_resets_in_progress_items_to_pending() {
        let registry = WorkRegistry::new();
        let item = WorkItem::new_task("A", "desc", 1.0);
        let id = registry.insert(item).await.unwrap();
        registry.assign(&id, "agent_aaaa").await.unwrap();
        registry.update_status(&id, WorkStatus::InProgress).await.unwrap();

        let dump = registry.export_full().await;
        let fresh = WorkRegistry::new();
        fresh.restore(dump).await;

        let restored = fresh.get(&id).await.unwrap();
        assert_eq!(restored.status, WorkStatus::Pending);
        assert!(restored.assigned_agent.is_none());
    }
}
