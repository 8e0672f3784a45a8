//! Runtime configuration (§6.5). Loaded from environment variables with
//! defaults for every tunable, following the flat-struct-plus-validate
//! shape of `agent-registry/src/config.rs`.

use std::env;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub poll_interval_seconds: u64,
    pub batch_quota_task: usize,
    pub batch_quota_complex_todo: usize,
    pub batch_quota_todo: usize,
    pub parent_timeout_seconds: u64,
    pub tick_hard_cap_seconds: u64,
    pub enable_autogen_backfill: bool,
    pub refill_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    pub max_workers: usize,
    pub max_queue: usize,
    pub max_retries: u32,
    pub min_task_timeout_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoScalerConfig {
    pub min_agents: usize,
    pub max_agents: usize,
    pub tasks_per_agent_up: f64,
    pub idle_frac_down: f64,
    pub cooldown_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub cache_max: usize,
    pub cache_ttl_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub retry_backoff_base_seconds: f64,
    pub deadline_epsilon_seconds: i64,
    pub capability_overlap_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub environment: String,
    pub http_port: u16,
    pub drain_timeout_seconds: u64,

    pub dispatcher: DispatcherConfig,
    pub worker_pool: WorkerPoolConfig,
    pub autoscaler: AutoScalerConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            http_port: 8080,
            drain_timeout_seconds: 30,
            dispatcher: DispatcherConfig {
                poll_interval_seconds: 30,
                batch_quota_task: 1,
                batch_quota_complex_todo: 3,
                batch_quota_todo: 10,
                parent_timeout_seconds: 300,
                tick_hard_cap_seconds: 10,
                enable_autogen_backfill: false,
                refill_threshold: 2,
            },
            worker_pool: WorkerPoolConfig {
                max_workers: 8,
                max_queue: 256,
                max_retries: 3,
                min_task_timeout_seconds: 10.0,
            },
            autoscaler: AutoScalerConfig {
                min_agents: 2,
                max_agents: 10,
                tasks_per_agent_up: 10.0,
                idle_frac_down: 0.5,
                cooldown_seconds: 60,
            },
            cache: CacheConfig {
                cache_max: 1000,
                cache_ttl_seconds: 3600,
            },
            scheduler: SchedulerConfig {
                retry_backoff_base_seconds: 1.0,
                deadline_epsilon_seconds: 5,
                capability_overlap_threshold: 0.7,
            },
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// the defaults above for anything unset. `dotenvy` is consulted
    /// first so a `.env` file in the working directory is picked up,
    /// matching the teacher's `main.rs` startup sequence.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut cfg = Config::default();

        cfg.environment = env::var("ENVIRONMENT").unwrap_or(cfg.environment);
        cfg.http_port = env_parse("HTTP_PORT", cfg.http_port)?;
        cfg.drain_timeout_seconds = env_parse("DRAIN_TIMEOUT_SECONDS", cfg.drain_timeout_seconds)?;

        cfg.dispatcher.poll_interval_seconds =
            env_parse("POLL_INTERVAL_SECONDS", cfg.dispatcher.poll_interval_seconds)?;
        cfg.dispatcher.parent_timeout_seconds =
            env_parse("PARENT_TIMEOUT_SECONDS", cfg.dispatcher.parent_timeout_seconds)?;
        cfg.dispatcher.tick_hard_cap_seconds =
            env_parse("DISPATCHER_TICK_HARD_CAP_SECONDS", cfg.dispatcher.tick_hard_cap_seconds)?;
        cfg.dispatcher.enable_autogen_backfill =
            env_parse("ENABLE_AUTOGEN_BACKFILL", cfg.dispatcher.enable_autogen_backfill)?;

        cfg.worker_pool.max_workers = env_parse("MAX_WORKERS", cfg.worker_pool.max_workers)?;
        cfg.worker_pool.max_queue = env_parse("MAX_QUEUE", cfg.worker_pool.max_queue)?;
        cfg.worker_pool.max_retries = env_parse("MAX_RETRIES", cfg.worker_pool.max_retries)?;

        cfg.autoscaler.min_agents = env_parse("MIN_AGENTS", cfg.autoscaler.min_agents)?;
        cfg.autoscaler.max_agents = env_parse("MAX_AGENTS", cfg.autoscaler.max_agents)?;
        cfg.autoscaler.tasks_per_agent_up =
            env_parse("TASKS_PER_AGENT_UP", cfg.autoscaler.tasks_per_agent_up)?;
        cfg.autoscaler.idle_frac_down = env_parse("IDLE_FRAC_DOWN", cfg.autoscaler.idle_frac_down)?;
        cfg.autoscaler.cooldown_seconds = env_parse("COOLDOWN_SECONDS", cfg.autoscaler.cooldown_seconds)?;

        cfg.cache.cache_max = env_parse("CACHE_MAX", cfg.cache.cache_max)?;
        cfg.cache.cache_ttl_seconds = env_parse("CACHE_TTL_SECONDS", cfg.cache.cache_ttl_seconds)?;

        cfg.scheduler.retry_backoff_base_seconds =
            env_parse("RETRY_BACKOFF_BASE_SECONDS", cfg.scheduler.retry_backoff_base_seconds)?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.worker_pool.max_workers > 0, "MAX_WORKERS must be > 0");
        anyhow::ensure!(
            self.autoscaler.min_agents > 0 && self.autoscaler.min_agents <= self.autoscaler.max_agents,
            "MIN_AGENTS must be > 0 and <= MAX_AGENTS"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.autoscaler.idle_frac_down),
            "IDLE_FRAC_DOWN must be in [0,1]"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.scheduler.capability_overlap_threshold),
            "capability_overlap_threshold must be in [0,1]"
        );
        anyhow::ensure!(self.cache.cache_max > 0, "CACHE_MAX must be > 0");
        anyhow::ensure!(self.cache.cache_ttl_seconds > 0, "CACHE_TTL_SECONDS must be > 0");
        Ok(())
    }

    pub fn summary(&self) -> String {
        format!(
            "env={} workers={} agents=[{},{}] poll={}s cache_ttl={}s",
            self.environment,
            self.worker_pool.max_workers,
            self.autoscaler.min_agents,
            self.autoscaler.max_agents,
            self.dispatcher.poll_interval_seconds,
            self.cache.cache_ttl_seconds,
        )
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value for {key}: {raw}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_min_agents_above_max() {
        let mut cfg = Config::default();
        cfg.autoscaler.min_agents = 20;
        cfg.autoscaler.max_agents = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_idle_frac_out_of_range() {
        let mut cfg = Config::default();
        cfg.autoscaler.idle_frac_down = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn summary_mentions_worker_count() {
        let cfg = Config::default();
        assert!(cfg.summary().contains("workers=8"));
    }
}
