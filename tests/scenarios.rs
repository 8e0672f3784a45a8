//! End-to-end scenarios crossing module boundaries (spec.md §8). Unit
//! tests colocated with each module cover everything else; these exercise
//! `Core` the way an external collaborator would.

use std::time::Duration;

use taskmaster_core::autoscaler::{AutoScaler, ScalingDecision, SystemStatus};
use taskmaster_core::config::{AutoScalerConfig, Config};
use taskmaster_core::types::{Complexity, Priority, WorkItem, WorkStatus};
use taskmaster_core::{Core, WorkItemFilter};

fn scaler_config() -> AutoScalerConfig {
    AutoScalerConfig {
        min_agents: 2,
        max_agents: 5,
        tasks_per_agent_up: 3.0,
        idle_frac_down: 0.6,
        cooldown_seconds: 10,
    }
}

#[test]
fn scenario_1_scale_up_under_load_then_cooldown_holds() {
    let scaler = AutoScaler::new(scaler_config());
    let loaded = SystemStatus { pending_tasks: 15, total_agents: 3, in_progress_tasks: 3 };

    assert_eq!(scaler.make_scaling_decision(loaded), ScalingDecision::ScaleUp);
    // Immediately after, still within the cooldown window, every further
    // call holds regardless of load.
    assert_eq!(scaler.make_scaling_decision(loaded), ScalingDecision::Hold);
    assert_eq!(scaler.make_scaling_decision(loaded), ScalingDecision::Hold);
}

#[test]
fn scenario_2_scale_down_when_idle() {
    let scaler = AutoScaler::new(scaler_config());
    let idle = SystemStatus { pending_tasks: 0, total_agents: 5, in_progress_tasks: 1 };
    assert_eq!(scaler.make_scaling_decision(idle), ScalingDecision::ScaleDown);
}

#[test]
fn scenario_3_hold_at_max_agents() {
    let scaler = AutoScaler::new(scaler_config());
    let saturated = SystemStatus { pending_tasks: 20, total_agents: 5, in_progress_tasks: 5 };
    assert_eq!(scaler.make_scaling_decision(saturated), ScalingDecision::Hold);
}

#[tokio::test]
async fn scenario_4_breakdown_determinism_through_the_dispatcher() {
    let mut config = Config::default();
    config.dispatcher.poll_interval_seconds = 3600; // don't race the background loop
    let core = Core::new(config);

    let item = WorkItem::new_todo("chunked work", "two hours of medium work", Complexity::Medium, Priority::Medium, 2.0);
    let id = core.submit_work(item).await.unwrap();

    // Drive the same tick machinery the background loop would, via the
    // public facade's registry + breakdown engine directly.
    let fetched = core.registry.get(&id).await.unwrap();
    let first = core.dispatcher.tick().await;
    assert_eq!(first.loaded, 1);
    assert_eq!(first.completed, 1);
    let _ = fetched; // silence unused in case the tick races; status checked below

    let completed = core.query_status(&id).await.unwrap();
    assert_eq!(completed.status, WorkStatus::Completed);

    let stats = core.cache.stats();
    // Cache was purged on completion (§4.I), so by the time we check it may
    // read zero size, but the hit/miss counters from the breakdown call
    // made during dispatch are still visible.
    assert!(stats.misses >= 1);
}

#[tokio::test]
async fn scenario_5_duplicate_rejected_then_allowed_after_completion() {
    let core = Core::new(Config::default());

    let first = WorkItem::new_task("A", "shared description", 0.5);
    let id = core.submit_work(first).await.unwrap();

    let mut duplicate = WorkItem::new_task("A", "shared description", 0.5);
    duplicate.id = "task_dup".to_string();
    let err = core.submit_work(duplicate.clone()).await.unwrap_err();
    assert!(matches!(err, taskmaster_core::error::CoreError::Duplicate { .. }));

    core.registry.update_status(&id, WorkStatus::Completed).await.unwrap();
    assert!(core.submit_work(duplicate).await.is_ok());
}

#[tokio::test]
async fn scenario_6_overlap_resolution_keeps_the_earliest_claim() {
    let core = Core::new(Config::default());
    let item = WorkItem::new_task("Y", "contested work", 1.0);
    let id = core.submit_work(item).await.unwrap();

    core.registry.assign(&id, "dispatcher-1").await.unwrap();
    core.registry.update_status(&id, WorkStatus::InProgress).await.unwrap();

    // A second processor marks the same item before the first loads it.
    core.registry.assign(&id, "dispatcher-2").await.unwrap();

    let outcome = core.registry.check_overlap(&id, "dispatcher-2").await.unwrap();
    assert!(matches!(outcome, taskmaster_core::types::OverlapOutcome::DualAssignment { .. }));

    let winner = core.registry.resolve_overlap(&id, "dispatcher-2").await.unwrap();
    assert_eq!(winner, "dispatcher-1");

    let fetched = core.registry.get(&id).await.unwrap();
    assert_eq!(fetched.assigned_agent.as_deref(), Some("dispatcher-1"));
}

#[tokio::test]
async fn property_progress_consistency_holds_across_the_facade() {
    let core = Core::new(Config::default());
    let item = WorkItem::new_todo("x", "y", Complexity::Medium, Priority::Medium, 1.0);
    let id = core.submit_work(item).await.unwrap();

    let tasks = taskmaster_core::breakdown::BreakdownEngine::compute(&core.registry.get(&id).await.unwrap());
    core.registry.set_subtasks(&id, tasks.clone(), "k".to_string()).await.unwrap();
    core.registry.update_subtask_progress(&id, &tasks[0].task_id, 1.0).await.unwrap();

    let fetched = core.registry.get(&id).await.unwrap();
    assert!((fetched.progress - fetched.mean_subtask_progress()).abs() < 1e-9);
}

#[tokio::test]
async fn property_retry_count_is_non_decreasing() {
    let core = Core::new(Config::default());
    let item = WorkItem::new_task("flaky", "d", 0.1);
    let id = core.submit_work(item).await.unwrap();

    let first = core.registry.increment_retry(&id).await.unwrap();
    let second = core.registry.increment_retry(&id).await.unwrap();
    assert!(second >= first);
}

#[tokio::test]
async fn list_filter_matches_submitted_kind_and_status() {
    let core = Core::new(Config::default());
    core.submit_work(WorkItem::new_task("a", "d", 0.1)).await.unwrap();
    core.submit_work(WorkItem::new_todo("b", "d", Complexity::Medium, Priority::Medium, 1.0)).await.unwrap();

    let pending_tasks = core
        .list(WorkItemFilter {
            status: Some(WorkStatus::Pending),
            kind: Some(taskmaster_core::types::WorkKind::Task),
        })
        .await;
    assert_eq!(pending_tasks.len(), 1);
}

#[tokio::test]
async fn snapshot_and_restore_round_trip_through_core() {
    let core = Core::new(Config::default());
    let id = core.submit_work(WorkItem::new_task("persist me", "d", 0.5)).await.unwrap();
    core.registry.assign(&id, "agent_a").await.unwrap();
    core.registry.update_status(&id, WorkStatus::InProgress).await.unwrap();

    let path = std::env::temp_dir().join(format!("taskmaster-scenario-{id}.json"));
    core.snapshot_to_path(&path).await.unwrap();

    let restored_core = Core::new(Config::default());
    let restored_count = restored_core.restore_from_path(&path).await.unwrap();
    assert_eq!(restored_count, 1);

    let restored = restored_core.query_status(&id).await.unwrap();
    assert_eq!(restored.status, WorkStatus::Pending);

    tokio::time::sleep(Duration::from_millis(1)).await;
    let _ = tokio::fs::remove_file(&path).await;
}
