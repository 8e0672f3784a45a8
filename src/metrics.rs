//! Metrics & health (§4.J): a Prometheus `Registry` plus a plain,
//! JSON-serializable snapshot for the `/health` endpoint. Grounded on
//! `agent-registry/src/metrics.rs`'s `register_*_with_registry!` idiom,
//! scaled down to the gauges/counters this daemon actually emits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use prometheus::{
    opts, register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry, Encoder, Histogram,
    IntCounter, IntGauge, IntGaugeVec, Registry, TextEncoder,
};
use serde::Serialize;
use tracing::warn;

use crate::autoscaler::ScalingDecision;
use crate::cache::CacheStats;
use crate::types::WorkStatus;

pub struct Metrics {
    registry: Registry,

    work_items_submitted_total: IntCounter,
    work_items_completed_total: IntCounter,
    work_items_failed_total: IntCounter,
    work_items_by_status: IntGaugeVec,

    agents_total: IntGauge,
    agents_idle: IntGauge,
    scale_up_total: IntCounter,
    scale_down_total: IntCounter,

    cache_hits_total: IntCounter,
    cache_misses_total: IntCounter,
    cache_clears_total: IntCounter,
    cache_size: IntGauge,

    worker_pool_queue_depth: IntGauge,
    scheduler_queue_depth: IntGauge,
    dispatcher_tick_seconds: Histogram,
    work_item_processing_seconds: Histogram,

    // last-seen absolute counter values, so cache deltas can be applied
    // against a stats snapshot rather than double-counted across ticks.
    last_cache_hits: AtomicU64,
    last_cache_misses: AtomicU64,
    last_cache_clears: AtomicU64,

    // last auto-scaler decision, for the §4.J `scaler_last_action` field.
    scaler_last_action: AtomicU8,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let work_items_submitted_total = register_int_counter_with_registry!(
            opts!("taskmaster_work_items_submitted_total", "Work items accepted by the registry"),
            registry
        )?;
        let work_items_completed_total = register_int_counter_with_registry!(
            opts!("taskmaster_work_items_completed_total", "Work items that reached Completed"),
            registry
        )?;
        let work_items_failed_total = register_int_counter_with_registry!(
            opts!("taskmaster_work_items_failed_total", "Work items that reached Failed"),
            registry
        )?;
        let work_items_by_status = register_int_gauge_vec_with_registry!(
            opts!("taskmaster_work_items_by_status", "Current work item count per status"),
            &["status"],
            registry
        )?;

        let agents_total =
            register_int_gauge_with_registry!(opts!("taskmaster_agents_total", "Registered agents"), registry)?;
        let agents_idle =
            register_int_gauge_with_registry!(opts!("taskmaster_agents_idle", "Idle agents"), registry)?;
        let scale_up_total = register_int_counter_with_registry!(
            opts!("taskmaster_scale_up_total", "Auto-scaler SCALE_UP decisions applied"),
            registry
        )?;
        let scale_down_total = register_int_counter_with_registry!(
            opts!("taskmaster_scale_down_total", "Auto-scaler SCALE_DOWN decisions applied"),
            registry
        )?;

        let cache_hits_total = register_int_counter_with_registry!(
            opts!("taskmaster_cache_hits_total", "Breakdown cache hits"),
            registry
        )?;
        let cache_misses_total = register_int_counter_with_registry!(
            opts!("taskmaster_cache_misses_total", "Breakdown cache misses"),
            registry
        )?;
        let cache_clears_total = register_int_counter_with_registry!(
            opts!("taskmaster_cache_clears_total", "Breakdown cache parent purges"),
            registry
        )?;
        let cache_size =
            register_int_gauge_with_registry!(opts!("taskmaster_cache_size", "Breakdown cache entry count"), registry)?;

        let worker_pool_queue_depth = register_int_gauge_with_registry!(
            opts!("taskmaster_worker_pool_queue_depth", "MicroTasks waiting for a worker slot"),
            registry
        )?;
        let scheduler_queue_depth = register_int_gauge_with_registry!(
            opts!("taskmaster_scheduler_queue_depth", "Jobs waiting in the scheduler queue"),
            registry
        )?;
        let dispatcher_tick_seconds = register_histogram_with_registry!(
            "taskmaster_dispatcher_tick_seconds",
            "Wall-clock duration of one dispatcher tick",
            registry
        )?;
        let work_item_processing_seconds = register_histogram_with_registry!(
            "taskmaster_work_item_processing_seconds",
            "Per-parent collaboration time from the Worker Pool's ParentResult",
            registry
        )?;

        Ok(Self {
            registry,
            work_items_submitted_total,
            work_items_completed_total,
            work_items_failed_total,
            work_items_by_status,
            agents_total,
            agents_idle,
            scale_up_total,
            scale_down_total,
            cache_hits_total,
            cache_misses_total,
            cache_clears_total,
            cache_size,
            worker_pool_queue_depth,
            scheduler_queue_depth,
            dispatcher_tick_seconds,
            work_item_processing_seconds,
            last_cache_hits: AtomicU64::new(0),
            last_cache_misses: AtomicU64::new(0),
            last_cache_clears: AtomicU64::new(0),
            scaler_last_action: AtomicU8::new(0),
        })
    }

    pub fn record_work_submitted(&self) {
        self.work_items_submitted_total.inc();
    }

    pub fn record_work_completed(&self) {
        self.work_items_completed_total.inc();
    }

    pub fn record_work_failed(&self) {
        self.work_items_failed_total.inc();
    }

    pub fn set_work_item_counts(&self, counts: &HashMap<WorkStatus, usize>) {
        for status in [
            WorkStatus::Pending,
            WorkStatus::InProgress,
            WorkStatus::Completed,
            WorkStatus::Failed,
            WorkStatus::Cancelled,
            WorkStatus::Blocked,
            WorkStatus::Retrying,
        ] {
            let label = format!("{status:?}").to_lowercase();
            let value = counts.get(&status).copied().unwrap_or(0) as i64;
            self.work_items_by_status.with_label_values(&[&label]).set(value);
        }
    }

    pub fn set_agent_counts(&self, total: usize, idle: usize) {
        self.agents_total.set(total as i64);
        self.agents_idle.set(idle as i64);
    }

    pub fn record_scale_up(&self) {
        self.scale_up_total.inc();
    }

    pub fn record_scale_down(&self) {
        self.scale_down_total.inc();
    }

    /// Applies the delta between this tick's absolute `CacheStats` and the
    /// last observed values, so repeated calls don't double-count.
    pub fn record_cache_stats(&self, stats: &CacheStats) {
        let prev_hits = self.last_cache_hits.swap(stats.hits, Ordering::Relaxed);
        let prev_misses = self.last_cache_misses.swap(stats.misses, Ordering::Relaxed);
        let prev_clears = self.last_cache_clears.swap(stats.clears, Ordering::Relaxed);
        self.cache_hits_total.inc_by(stats.hits.saturating_sub(prev_hits));
        self.cache_misses_total.inc_by(stats.misses.saturating_sub(prev_misses));
        self.cache_clears_total.inc_by(stats.clears.saturating_sub(prev_clears));
        self.cache_size.set(stats.size as i64);
    }

    pub fn set_queue_depths(&self, worker_pool: usize, scheduler: usize) {
        self.worker_pool_queue_depth.set(worker_pool as i64);
        self.scheduler_queue_depth.set(scheduler as i64);
    }

    pub fn observe_dispatcher_tick(&self, seconds: f64) {
        self.dispatcher_tick_seconds.observe(seconds);
    }

    /// Records one parent's `ParentResult.collaboration_time_seconds`,
    /// feeding §4.J's `avg_processing_time`.
    pub fn observe_work_item_processing(&self, seconds: f64) {
        self.work_item_processing_seconds.observe(seconds);
    }

    /// Records the Auto-Scaler's most recent decision (SCALE_UP/SCALE_DOWN/
    /// HOLD), including HOLD — §4.J's `scaler_last_action` reflects the
    /// last decision made, not just the last one applied.
    pub fn set_scaler_last_action(&self, decision: ScalingDecision) {
        let code = match decision {
            ScalingDecision::ScaleUp => 1,
            ScalingDecision::ScaleDown => 2,
            ScalingDecision::Hold => 3,
        };
        self.scaler_last_action.store(code, Ordering::Relaxed);
    }

    fn scaler_last_action_label(&self) -> String {
        match self.scaler_last_action.load(Ordering::Relaxed) {
            1 => "scale_up",
            2 => "scale_down",
            3 => "hold",
            _ => "none",
        }
        .to_string()
    }

    /// Renders the full registry in Prometheus text exposition format for
    /// the `/metrics` route.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Builds the exact snapshot shape spec.md §4.J names: `{pending,
    /// in_progress, completed, failed, total_agents, busy_agents,
    /// avg_processing_time, success_rate, cache_hit_rate, queue_depth,
    /// scaler_last_action}`, plus the cumulative submission counter the
    /// original metrics surface also carried.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let status_count = |label: &str| self.work_items_by_status.with_label_values(&[label]).get();
        let pending = status_count("pending");
        let in_progress = status_count("inprogress");
        let completed = status_count("completed");
        let failed = status_count("failed");

        let total_agents = self.agents_total.get();
        let busy_agents = (total_agents - self.agents_idle.get()).max(0);

        let processed_count = self.work_item_processing_seconds.get_sample_count();
        let avg_processing_time = if processed_count > 0 {
            self.work_item_processing_seconds.get_sample_sum() / processed_count as f64
        } else {
            0.0
        };

        let success_rate = {
            let denom = completed + failed;
            if denom > 0 {
                completed as f64 / denom as f64
            } else {
                0.0
            }
        };

        let cache_hits = self.last_cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.last_cache_misses.load(Ordering::Relaxed);
        let cache_hit_rate = {
            let denom = cache_hits + cache_misses;
            if denom > 0 {
                cache_hits as f64 / denom as f64
            } else {
                0.0
            }
        };

        MetricsSnapshot {
            pending,
            in_progress,
            completed,
            failed,
            total_agents,
            busy_agents,
            avg_processing_time,
            success_rate,
            cache_hit_rate,
            queue_depth: self.worker_pool_queue_depth.get() + self.scheduler_queue_depth.get(),
            scaler_last_action: self.scaler_last_action_label(),
            work_items_submitted: self.work_items_submitted_total.get(),
        }
    }
}

/// Small JSON-friendly view used by the `/health` route and external
/// collaborators (§4.J); the full Prometheus exposition lives behind
/// `/metrics` instead.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub total_agents: i64,
    pub busy_agents: i64,
    pub avg_processing_time: f64,
    pub success_rate: f64,
    pub cache_hit_rate: f64,
    pub queue_depth: i64,
    pub scaler_last_action: String,
    pub work_items_submitted: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_item_submission_increments_counter() {
        let metrics = Metrics::new().unwrap();
        metrics.record_work_submitted();
        metrics.record_work_submitted();
        assert_eq!(metrics.snapshot().work_items_submitted, 2);
    }

    #[test]
    fn cache_stats_delta_does_not_double_count() {
        let metrics = Metrics::new().unwrap();
        metrics.record_cache_stats(&CacheStats { hits: 3, misses: 1, clears: 0, size: 2 });
        metrics.record_cache_stats(&CacheStats { hits: 5, misses: 1, clears: 1, size: 1 });
        let rendered = metrics.export();
        assert!(rendered.contains("taskmaster_cache_hits_total 5"));
        assert!(rendered.contains("taskmaster_cache_misses_total 1"));
    }

    #[test]
    fn work_item_status_gauge_reflects_counts() {
        let metrics = Metrics::new().unwrap();
        let mut counts = HashMap::new();
        counts.insert(WorkStatus::Pending, 4);
        counts.insert(WorkStatus::Completed, 2);
        metrics.set_work_item_counts(&counts);
        let rendered = metrics.export();
        assert!(rendered.contains("status=\"pending\""));
    }

    #[test]
    fn export_is_valid_prometheus_text() {
        let metrics = Metrics::new().unwrap();
        metrics.set_agent_counts(3, 1);
        let rendered = metrics.export();
        assert!(rendered.contains("taskmaster_agents_total 3"));
    }

    #[test]
    fn snapshot_matches_spec_shape() {
        let metrics = Metrics::new().unwrap();
        let mut counts = HashMap::new();
        counts.insert(WorkStatus::Pending, 2);
        counts.insert(WorkStatus::InProgress, 1);
        counts.insert(WorkStatus::Completed, 5);
        counts.insert(WorkStatus::Failed, 1);
        metrics.set_work_item_counts(&counts);
        metrics.set_agent_counts(4, 1);
        metrics.record_cache_stats(&CacheStats { hits: 8, misses: 2, clears: 1, size: 3 });
        metrics.set_queue_depths(2, 1);
        metrics.observe_work_item_processing(4.0);
        metrics.observe_work_item_processing(6.0);
        metrics.set_scaler_last_action(ScalingDecision::ScaleUp);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pending, 2);
        assert_eq!(snapshot.in_progress, 1);
        assert_eq!(snapshot.completed, 5);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.total_agents, 4);
        assert_eq!(snapshot.busy_agents, 3);
        assert!((snapshot.avg_processing_time - 5.0).abs() < 1e-9);
        assert!((snapshot.success_rate - (5.0 / 6.0)).abs() < 1e-9);
        assert!((snapshot.cache_hit_rate - 0.8).abs() < 1e-9);
        assert_eq!(snapshot.queue_depth, 3);
        assert_eq!(snapshot.scaler_last_action, "scale_up");
    }
}
