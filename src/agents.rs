//! Agent directory (§6.2): registration, heartbeats, and capability
//! lookup for the logical executors the Scheduler and Auto-Scaler act
//! on. Grounded on `agent_registry.rs`'s load/unload lifecycle and
//! `agent-registry/src/registry.rs`'s `DashMap`-indexed shape, scaled
//! down to the in-memory, no-sqlx footprint this daemon needs.

use std::collections::HashSet;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, instrument};

use crate::error::{CoreError, CoreResult};
use crate::priority::WorkerAvailability;
use crate::types::{Agent, AgentStatus};

/// Assumed per-worker capacity (§1): a worker below this many concurrent
/// MicroTasks and under the 80% load cutoff counts as "available".
const ASSUMED_WORKER_CAPACITY: usize = 3;
const LOAD_CUTOFF: f64 = 0.8;

pub struct AgentDirectory {
    agents: DashMap<String, Agent>,
}

impl Default for AgentDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentDirectory {
    pub fn new() -> Self {
        Self { agents: DashMap::new() }
    }

    #[instrument(skip(self, capabilities))]
    pub fn register(&self, name: impl Into<String>, capabilities: HashSet<String>) -> Agent {
        let agent = Agent::new(name, capabilities);
        self.agents.insert(agent.agent_id.clone(), agent.clone());
        debug!(agent_id = %agent.agent_id, "registered agent");
        agent
    }

    pub fn deregister(&self, agent_id: &str) -> CoreResult<Agent> {
        self.agents
            .remove(agent_id)
            .map(|(_, agent)| agent)
            .ok_or_else(|| CoreError::NotFound { kind: "Agent", id: agent_id.to_string() })
    }

    pub fn heartbeat(&self, agent_id: &str) -> CoreResult<()> {
        let mut entry = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| CoreError::NotFound { kind: "Agent", id: agent_id.to_string() })?;
        entry.last_heartbeat = Utc::now();
        if entry.status == AgentStatus::Dead {
            entry.status = AgentStatus::Available;
        }
        Ok(())
    }

    pub fn get(&self, agent_id: &str) -> CoreResult<Agent> {
        self.agents
            .get(agent_id)
            .map(|a| a.clone())
            .ok_or_else(|| CoreError::NotFound { kind: "Agent", id: agent_id.to_string() })
    }

    pub fn list(&self) -> Vec<Agent> {
        self.agents.iter().map(|e| e.value().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.agents.len()
    }

    pub fn idle_count(&self) -> usize {
        self.agents.iter().filter(|e| e.value().is_idle()).count()
    }

    /// Agents not marked `Dead`/`Draining` whose capability set is a
    /// superset of `required` — the Scheduler's candidate pool (§4.G).
    pub fn available_with_capabilities(&self, required: &HashSet<String>) -> Vec<Agent> {
        self.agents
            .iter()
            .filter(|e| {
                matches!(e.value().status, AgentStatus::Available)
                    && required.is_subset(&e.value().capabilities)
            })
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn assign_task(&self, agent_id: &str, task_id: &str) -> CoreResult<()> {
        let mut entry = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| CoreError::NotFound { kind: "Agent", id: agent_id.to_string() })?;
        entry.current_task_ids.insert(task_id.to_string());
        entry.status = AgentStatus::Busy;
        Ok(())
    }

    pub fn release_task(&self, agent_id: &str, task_id: &str) -> CoreResult<()> {
        let mut entry = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| CoreError::NotFound { kind: "Agent", id: agent_id.to_string() })?;
        entry.current_task_ids.remove(task_id);
        if entry.current_task_ids.is_empty() && entry.status == AgentStatus::Busy {
            entry.status = AgentStatus::Available;
        }
        Ok(())
    }

    pub fn drain(&self, agent_id: &str) -> CoreResult<()> {
        let mut entry = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| CoreError::NotFound { kind: "Agent", id: agent_id.to_string() })?;
        entry.status = AgentStatus::Draining;
        Ok(())
    }

    /// Agents whose last heartbeat is older than `stale_after_seconds`,
    /// marked `Dead` in place (§4.H feeds on this before scale-down picks
    /// victims).
    pub fn mark_stale(&self, stale_after_seconds: i64) -> Vec<String> {
        let mut marked = Vec::new();
        for mut entry in self.agents.iter_mut() {
            if (Utc::now() - entry.last_heartbeat).num_seconds() > stale_after_seconds {
                entry.status = AgentStatus::Dead;
                marked.push(entry.agent_id.clone());
            }
        }
        marked
    }
}

impl WorkerAvailability for AgentDirectory {
    /// Counts agents whose capabilities are a superset of `required` and
    /// whose load (`current_task_ids.len() / ASSUMED_WORKER_CAPACITY`) is
    /// below the 80% cutoff, mirroring `_count_available_workers` /
    /// `_get_worker_load` (SPEC_FULL.md §1).
    fn available_worker_count(&self, required_capabilities: &HashSet<String>) -> usize {
        self.agents
            .iter()
            .filter(|e| {
                let agent = e.value();
                !matches!(agent.status, AgentStatus::Dead | AgentStatus::Draining)
                    && required_capabilities.is_subset(&agent.capabilities)
                    && (agent.current_task_ids.len() as f64 / ASSUMED_WORKER_CAPACITY as f64) < LOAD_CUTOFF
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_lookup_round_trips() {
        let dir = AgentDirectory::new();
        let agent = dir.register("worker-1", HashSet::from(["general_purpose".to_string()]));
        let fetched = dir.get(&agent.agent_id).unwrap();
        assert_eq!(fetched.name, "worker-1");
    }

    #[test]
    fn assign_then_release_tracks_idle_state() {
        let dir = AgentDirectory::new();
        let agent = dir.register("worker-1", HashSet::new());
        dir.assign_task(&agent.agent_id, "task_a").unwrap();
        assert_eq!(dir.idle_count(), 0);
        dir.release_task(&agent.agent_id, "task_a").unwrap();
        assert_eq!(dir.idle_count(), 1);
    }

    #[test]
    fn available_with_capabilities_filters_by_subset() {
        let dir = AgentDirectory::new();
        dir.register("a", HashSet::from(["python".to_string()]));
        dir.register("b", HashSet::from(["python".to_string(), "rust".to_string()]));
        let required = HashSet::from(["rust".to_string()]);
        let matches = dir.available_with_capabilities(&required);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].name, "b");
    }

    #[test]
    fn heartbeat_revives_dead_agent() {
        let dir = AgentDirectory::new();
        let agent = dir.register("a", HashSet::new());
        {
            let mut entry = dir.agents.get_mut(&agent.agent_id).unwrap();
            entry.status = AgentStatus::Dead;
        }
        dir.heartbeat(&agent.agent_id).unwrap();
        assert_eq!(dir.get(&agent.agent_id).unwrap().status, AgentStatus::Available);
    }

    #[test]
    fn available_worker_count_excludes_overloaded_agents() {
        let dir = AgentDirectory::new();
        let agent = dir.register("a", HashSet::from(["python".to_string()]));
        for i in 0..3 {
            dir.assign_task(&agent.agent_id, &format!("t{i}")).unwrap();
        }
        let required = HashSet::from(["python".to_string()]);
        assert_eq!(dir.available_worker_count(&required), 0);
    }

    #[test]
    fn deregister_removes_agent() {
        let dir = AgentDirectory::new();
        let agent = dir.register("a", HashSet::new());
        dir.deregister(&agent.agent_id).unwrap();
        assert!(dir.get(&agent.agent_id).is_err());
    }
}
