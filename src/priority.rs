//! Priority Scorer (§4.D): composite priority score over a WorkItem.
//! Formula and thresholds are taken verbatim from
//! `collective_worker_processor.py`'s `calculate_advanced_priority`.

use chrono::Utc;

use crate::types::{Complexity, Priority, PriorityBreakdown, WorkItem};

const DEPENDENCY_KEYWORDS: &[&str] = &["depends on", "requires", "after", "following", "prerequisite"];

const BUSINESS_KEYWORDS: &[&str] = &[
    "security",
    "authentication",
    "authorization",
    "payment",
    "billing",
    "user data",
    "customer",
    "revenue",
    "compliance",
    "legal",
    "production",
    "deployment",
    "monitoring",
    "backup",
    "recovery",
];

fn complexity_score(complexity: Complexity) -> f64 {
    match complexity {
        Complexity::Critical => 100.0,
        Complexity::High => 80.0,
        Complexity::Medium => 60.0,
        Complexity::Low => 40.0,
    }
}

fn priority_multiplier(priority: Priority) -> f64 {
    match priority {
        Priority::Critical => 3.0,
        Priority::High => 2.5,
        Priority::Medium => 2.0,
        Priority::Low => 1.5,
    }
}

fn priority_bonus(priority: Priority) -> f64 {
    match priority {
        Priority::Critical => 10.0,
        Priority::High => 7.0,
        Priority::Medium => 4.0,
        Priority::Low => 0.0,
    }
}

/// Computes the "available worker" count for a given capability set,
/// using the original's 80%-load cutoff (`_count_available_workers` /
/// `_get_worker_load`, assumed per-worker capacity of 3 concurrent
/// MicroTasks; see SPEC_FULL.md §1).
pub trait WorkerAvailability {
    fn available_worker_count(&self, required_capabilities: &std::collections::HashSet<String>) -> usize;
}

pub struct PriorityScorer;

impl PriorityScorer {
    /// Computes the full score and breakdown for `item`, given
    /// `available_workers` (the count of workers below 80% load that
    /// satisfy `item.required_capabilities`) and `blocks_others` (whether
    /// other known items declare a dependency on this one).
    pub fn score(item: &WorkItem, available_workers: usize, blocks_others: bool) -> PriorityBreakdown {
        let complexity = complexity_score(item.complexity);
        let multiplier = priority_multiplier(item.priority);

        let urgency_score = (item.age_hours() * 2.0).min(50.0);
        let resource_score = ((available_workers as f64) * 10.0).min(30.0);

        let description_lower = item.description.to_lowercase();
        let mut dependency_score = 0.0_f64;
        for kw in DEPENDENCY_KEYWORDS {
            if description_lower.contains(kw) {
                dependency_score += 5.0;
            }
        }
        dependency_score += ((item.dependencies.len() as f64) * 3.0).min(15.0);
        if blocks_others {
            dependency_score += 10.0;
        }
        dependency_score = dependency_score.min(20.0);

        let mut business_value_score = 0.0_f64;
        for kw in BUSINESS_KEYWORDS {
            if description_lower.contains(kw) {
                business_value_score += 3.0;
            }
        }
        business_value_score += priority_bonus(item.priority);
        if item.auto_generated {
            business_value_score -= 5.0;
        }
        business_value_score = business_value_score.max(0.0).min(25.0);

        let final_priority =
            (complexity * multiplier + urgency_score + resource_score + dependency_score + business_value_score).round();

        PriorityBreakdown {
            complexity_score: complexity,
            priority_multiplier: multiplier,
            urgency_score,
            resource_score,
            dependency_score,
            business_value_score,
            final_priority,
            calculated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkKind;
    use std::collections::HashSet;

    fn item_with(complexity: Complexity, priority: Priority, description: &str) -> WorkItem {
        let mut item = WorkItem::new_complex_todo("x", description, complexity, priority, 4.0);
        item.kind = WorkKind::ComplexTodo;
        item
    }

    #[test]
    fn baseline_critical_item_scores_high() {
        let item = item_with(Complexity::Critical, Priority::Critical, "ordinary work");
        let breakdown = PriorityScorer::score(&item, 0, false);
        // complexity(100) * multiplier(3.0) = 300, plus small urgency/business bonus
        assert!(breakdown.final_priority >= 300.0);
    }

    #[test]
    fn business_keywords_increase_score() {
        let plain = item_with(Complexity::Low, Priority::Low, "refactor some helper");
        let sensitive = item_with(Complexity::Low, Priority::Low, "fix security authentication bug for payment");
        let a = PriorityScorer::score(&plain, 0, false);
        let b = PriorityScorer::score(&sensitive, 0, false);
        assert!(b.business_value_score > a.business_value_score);
    }

    #[test]
    fn dependency_keywords_and_explicit_deps_are_capped() {
        let mut item = item_with(
            Complexity::Medium,
            Priority::Medium,
            "this task depends on requires after following prerequisite work",
        );
        item.dependencies = HashSet::from(["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string(), "e".to_string()]);
        let breakdown = PriorityScorer::score(&item, 0, true);
        assert!(breakdown.dependency_score <= 20.0);
    }

    #[test]
    fn auto_generated_items_are_penalized() {
        let mut item = item_with(Complexity::Medium, Priority::Medium, "plain work");
        item.auto_generated = true;
        let breakdown = PriorityScorer::score(&item, 0, false);
        assert!(breakdown.business_value_score >= 0.0);
    }

    #[test]
    fn resource_score_caps_at_thirty() {
        let item = item_with(Complexity::Low, Priority::Low, "plain");
        let breakdown = PriorityScorer::score(&item, 10, false);
        assert_eq!(breakdown.resource_score, 30.0);
    }
}
