//! Auto-Scaler (§4.H): decides SCALE_UP / SCALE_DOWN / HOLD from a
//! snapshot of pending work and agent occupancy. Decision function
//! verified line-for-line against `autoscaler.py`'s
//! `AutoScaler.make_scaling_decision`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use tracing::{info, instrument};

use crate::agents::AgentDirectory;
use crate::config::AutoScalerConfig;
use crate::types::Agent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    ScaleUp,
    ScaleDown,
    Hold,
}

/// Snapshot the decision function reads; mirrors
/// `mcp_server.get_system_status()`'s three fields in the original.
#[derive(Debug, Clone, Copy)]
pub struct SystemStatus {
    pub pending_tasks: usize,
    pub total_agents: usize,
    pub in_progress_tasks: usize,
}

pub struct AutoScaler {
    config: AutoScalerConfig,
    last_scaling_time: AtomicI64,
}

impl AutoScaler {
    pub fn new(config: AutoScalerConfig) -> Self {
        Self {
            config,
            last_scaling_time: AtomicI64::new(0),
        }
    }

    /// Pure decision function, no side effects on `self` beyond the
    /// cooldown timestamp it sets when it decides to scale.
    #[instrument(skip(self))]
    pub fn make_scaling_decision(&self, status: SystemStatus) -> ScalingDecision {
        let now = Utc::now().timestamp();
        let last = self.last_scaling_time.load(Ordering::Relaxed);
        if now - last < self.config.cooldown_seconds {
            return ScalingDecision::Hold;
        }

        if status.total_agents > 0
            && (status.pending_tasks as f64 / status.total_agents as f64) > self.config.tasks_per_agent_up
            && status.total_agents < self.config.max_agents
        {
            self.last_scaling_time.store(now, Ordering::Relaxed);
            info!(pending = status.pending_tasks, total = status.total_agents, "scaling up");
            return ScalingDecision::ScaleUp;
        }

        let busy_agents = status.in_progress_tasks;
        let idle_agents = status.total_agents.saturating_sub(busy_agents);
        let idle_fraction = if status.total_agents > 0 {
            idle_agents as f64 / status.total_agents as f64
        } else {
            0.0
        };

        if status.pending_tasks == 0
            && status.total_agents > 0
            && idle_fraction >= self.config.idle_frac_down
            && status.total_agents > self.config.min_agents
        {
            self.last_scaling_time.store(now, Ordering::Relaxed);
            info!(idle_fraction, total = status.total_agents, "scaling down");
            return ScalingDecision::ScaleDown;
        }

        ScalingDecision::Hold
    }

    /// Applies a decision against the live agent directory: spins up one
    /// general-purpose agent, or retires one idle agent. Returns the
    /// agent affected, if any (§4.H).
    pub fn apply(&self, decision: ScalingDecision, directory: &AgentDirectory) -> Option<Agent> {
        match decision {
            ScalingDecision::ScaleUp => {
                let agent = directory.register(
                    format!("autoscaled-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
                    HashSet::from(["general_purpose".to_string()]),
                );
                Some(agent)
            }
            ScalingDecision::ScaleDown => {
                let idle = directory.list().into_iter().find(|a| a.is_idle())?;
                directory.deregister(&idle.agent_id).ok()
            }
            ScalingDecision::Hold => None,
        }
    }
}
