//! Dynamic priority computation.
//!
//! Priorities live in `[1, 2000]` and are recomputed from a task's base
//! weight under aging, deadline pressure, dependency weight, and the
//! caller's multipliers. The algorithm is pluggable; results are cached per
//! `(task, structure version)` and every computation carries an audit trail.

use crate::task::{Task, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Lower bound of the dynamic priority range.
pub const MIN_PRIORITY: i64 = 1;
/// Upper bound of the dynamic priority range.
pub const MAX_PRIORITY: i64 = 2000;

/// Clamp a raw score into the dynamic priority range.
#[must_use]
pub fn clamp_priority(raw: f64) -> i64 {
    (raw.round() as i64).clamp(MIN_PRIORITY, MAX_PRIORITY)
}

/// Per-factor weights for [`WeightedFactors`]. A weight of `1.0` applies a
/// factor fully; `0.0` disables it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactorWeights {
    /// Aging factor weight.
    pub age: f64,
    /// Deadline pressure weight.
    pub deadline: f64,
    /// Dependency weight... weight.
    pub dependency: f64,
    /// Caller importance weight.
    pub user_importance: f64,
    /// System criticality weight.
    pub system_criticality: f64,
    /// Resource availability weight.
    pub resource_availability: f64,
    /// Execution history weight.
    pub execution_history: f64,
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            age: 1.0,
            deadline: 1.0,
            dependency: 1.0,
            user_importance: 1.0,
            system_criticality: 1.0,
            resource_availability: 1.0,
            execution_history: 1.0,
        }
    }
}

/// Ambient system state fed into priority computation and scheduling.
#[derive(Debug, Clone, Copy)]
pub struct AdjustmentContext {
    /// Evaluation time.
    pub now: DateTime<Utc>,
    /// Running workers over the concurrency bound, in `[0, 1]`.
    pub system_load: f64,
    /// Number of schedulable tasks.
    pub queue_depth: usize,
    /// Mean waiting time of schedulable tasks, milliseconds.
    pub avg_wait_ms: f64,
    /// Resource pool utilization, in `[0, 1]`.
    pub resource_utilization: f64,
    /// Fairness index over recent dispatches, in `[0, 1]`.
    pub fairness_index: f64,
}

impl AdjustmentContext {
    /// A neutral context at the given time.
    #[must_use]
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            system_load: 0.0,
            queue_depth: 0,
            avg_wait_ms: 0.0,
            resource_utilization: 0.0,
            fairness_index: 1.0,
        }
    }
}

/// One step of a priority computation, for auditing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorAdjustment {
    /// Factor name.
    pub factor: String,
    /// Score before the factor was applied.
    pub old: f64,
    /// Score after.
    pub new: f64,
    /// The multiplier (or additive delta for boosts) applied.
    pub influence: f64,
    /// Why.
    pub reason: String,
}

/// Result of a priority computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityDecision {
    /// The clamped priority.
    pub priority: i64,
    /// Audit trail, in application order.
    pub adjustments: Vec<FactorAdjustment>,
}

/// A pluggable priority algorithm.
pub trait PriorityAlgorithm: Send + Sync {
    /// Algorithm name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Compute a task's priority. `pending_dependents` is the number of
    /// not-yet-finished tasks that depend on it.
    fn compute(
        &self,
        task: &Task,
        pending_dependents: usize,
        ctx: &AdjustmentContext,
    ) -> PriorityDecision;
}

/// The default weighted-factors algorithm.
#[derive(Debug, Clone, Default)]
pub struct WeightedFactors {
    /// Per-factor weights.
    pub weights: FactorWeights,
}

impl WeightedFactors {
    /// Algorithm with explicit weights.
    #[must_use]
    pub fn new(weights: FactorWeights) -> Self {
        Self { weights }
    }
}

/// Weighted multiplier: lerp between neutral and the factor by `weight`.
fn weighted(factor: f64, weight: f64) -> f64 {
    1.0 + (factor - 1.0) * weight
}

impl PriorityAlgorithm for WeightedFactors {
    fn name(&self) -> &'static str {
        "weighted-factors"
    }

    fn compute(
        &self,
        task: &Task,
        pending_dependents: usize,
        ctx: &AdjustmentContext,
    ) -> PriorityDecision {
        let w = &self.weights;
        let mut score = task.base_priority.weight() as f64;
        let mut adjustments = Vec::new();

        let mut apply = |score: &mut f64, name: &str, multiplier: f64, reason: String| {
            let old = *score;
            *score *= multiplier;
            adjustments.push(FactorAdjustment {
                factor: name.to_string(),
                old,
                new: *score,
                influence: multiplier,
                reason,
            });
        };

        // Aging: up to 2x after 24 hours of waiting.
        let age_hours = (ctx.now - task.created_at).num_minutes() as f64 / 60.0;
        let age_factor = 1.0 + (age_hours / 24.0).clamp(0.0, 1.0);
        apply(
            &mut score,
            "age",
            weighted(age_factor, w.age),
            format!("waited {age_hours:.1}h"),
        );

        // Deadline pressure: ramps up inside a 7 day window, exponential
        // once overdue, multiplier capped at 2.5.
        if let Some(deadline) = task.deadline {
            let multiplier = if deadline <= ctx.now {
                let days_overdue = (ctx.now - deadline).num_minutes() as f64 / (60.0 * 24.0);
                let boost = 2.0 * 1.1f64.powf(days_overdue);
                weighted(boost, w.deadline).min(2.5)
            } else {
                let days_left = (deadline - ctx.now).num_minutes() as f64 / (60.0 * 24.0);
                let pressure = (1.0 - days_left / 7.0).max(0.5);
                weighted(pressure, w.deadline).clamp(0.1, 2.5)
            };
            apply(
                &mut score,
                "deadline",
                multiplier,
                format!("deadline {deadline}"),
            );
        }

        // Dependency weight: 10% per pending dependent.
        let dep_factor = 1.0 + 0.1 * pending_dependents as f64;
        apply(
            &mut score,
            "dependency_weight",
            weighted(dep_factor, w.dependency),
            format!("{pending_dependents} pending dependents"),
        );

        let factors = &task.priority_factors;
        for (name, value, weight) in [
            ("user_importance", factors.user_importance, w.user_importance),
            (
                "system_criticality",
                factors.system_criticality,
                w.system_criticality,
            ),
            (
                "resource_availability",
                factors.resource_availability,
                w.resource_availability,
            ),
            (
                "execution_history",
                factors.execution_history,
                w.execution_history,
            ),
        ] {
            if (value - 1.0).abs() > f64::EPSILON {
                apply(
                    &mut score,
                    name,
                    weighted(value, weight),
                    "caller factor".to_string(),
                );
            }
        }

        PriorityDecision {
            priority: clamp_priority(score),
            adjustments,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    version: u64,
    priority: i64,
}

/// Caches priority computations and applies the starvation boost.
pub struct PriorityComputer {
    algorithm: Box<dyn PriorityAlgorithm>,
    cache: HashMap<TaskId, CacheEntry>,
    decisions: HashMap<TaskId, PriorityDecision>,
    max_starvation: Duration,
    max_boost: i64,
}

impl PriorityComputer {
    /// Computer with the default weighted-factors algorithm.
    #[must_use]
    pub fn new(weights: FactorWeights, max_starvation: Duration, max_boost: i64) -> Self {
        Self {
            algorithm: Box::new(WeightedFactors::new(weights)),
            cache: HashMap::new(),
            decisions: HashMap::new(),
            max_starvation,
            max_boost,
        }
    }

    /// Swap the algorithm; invalidates the cache.
    pub fn set_algorithm(&mut self, algorithm: Box<dyn PriorityAlgorithm>) {
        self.algorithm = algorithm;
        self.invalidate();
    }

    /// Name of the active algorithm.
    #[must_use]
    pub fn algorithm_name(&self) -> &'static str {
        self.algorithm.name()
    }

    /// Drop every cached result; called after any structural change.
    pub fn invalidate(&mut self) {
        self.cache.clear();
    }

    /// Forget a single task.
    pub fn forget(&mut self, task_id: TaskId) {
        self.cache.remove(&task_id);
        self.decisions.remove(&task_id);
    }

    /// Audit trail of the last computation for a task.
    #[must_use]
    pub fn decision_for(&self, task_id: TaskId) -> Option<&PriorityDecision> {
        self.decisions.get(&task_id)
    }

    /// Compute (or fetch from cache) the task's dynamic priority.
    pub fn recompute(
        &mut self,
        task: &Task,
        pending_dependents: usize,
        ctx: &AdjustmentContext,
        structure_version: u64,
    ) -> i64 {
        if let Some(entry) = self.cache.get(&task.id)
            && entry.version == structure_version
        {
            return entry.priority;
        }

        let mut decision = self.algorithm.compute(task, pending_dependents, ctx);

        // Starvation boost: additive, bounded, ramping with overshoot.
        if task.is_waiting() {
            let waited = (ctx.now - task.created_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if waited > self.max_starvation && self.max_boost > 0 {
                let overshoot = waited.as_secs_f64() / self.max_starvation.as_secs_f64() - 1.0;
                let boost = ((self.max_boost as f64) * overshoot.min(1.0)).round() as i64;
                let boost = boost.clamp(1, self.max_boost);
                let old = decision.priority as f64;
                decision.priority = clamp_priority(old + boost as f64);
                decision.adjustments.push(FactorAdjustment {
                    factor: "starvation".to_string(),
                    old,
                    new: decision.priority as f64,
                    influence: boost as f64,
                    reason: format!("waiting for {}s", waited.as_secs()),
                });
            }
        }

        let priority = decision.priority;
        self.cache.insert(
            task.id,
            CacheEntry {
                version: structure_version,
                priority,
            },
        );
        self.decisions.insert(task.id, decision);
        priority
    }
}

impl std::fmt::Debug for PriorityComputer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityComputer")
            .field("algorithm", &self.algorithm.name())
            .field("cached", &self.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{BasePriority, TaskCategory, TaskSubmission};
    use uuid::Uuid;

    fn task_with(priority: BasePriority) -> Task {
        let submission = TaskSubmission {
            base_priority: priority,
            ..TaskSubmission::new("priority test", TaskCategory::Analysis)
        };
        Task::from_submission(&submission, Uuid::new_v4())
    }

    fn computer() -> PriorityComputer {
        PriorityComputer::new(FactorWeights::default(), Duration::from_secs(300), 200)
    }

    #[test]
    fn fresh_neutral_task_keeps_base_weight() {
        let task = task_with(BasePriority::Medium);
        let ctx = AdjustmentContext::at(task.created_at);
        let decision = WeightedFactors::default().compute(&task, 0, &ctx);
        assert_eq!(decision.priority, 500);
    }

    #[test]
    fn day_old_task_doubles() {
        let task = task_with(BasePriority::Medium);
        let ctx = AdjustmentContext::at(task.created_at + chrono::Duration::hours(24));
        let decision = WeightedFactors::default().compute(&task, 0, &ctx);
        assert_eq!(decision.priority, 1000);
    }

    #[test]
    fn overdue_deadline_boosts() {
        let mut task = task_with(BasePriority::Medium);
        let now = task.created_at;
        task.deadline = Some(now - chrono::Duration::days(1));
        let decision = WeightedFactors::default().compute(&task, 0, &AdjustmentContext::at(now));
        // Boost 2 * 1.1^1 = 2.2x over the base.
        assert!(decision.priority > 1000);
        assert!(decision.priority <= 2000);
    }

    #[test]
    fn far_deadline_depresses() {
        let mut task = task_with(BasePriority::Medium);
        let now = task.created_at;
        task.deadline = Some(now + chrono::Duration::days(30));
        let decision = WeightedFactors::default().compute(&task, 0, &AdjustmentContext::at(now));
        assert_eq!(decision.priority, 250);
    }

    #[test]
    fn pending_dependents_raise_priority() {
        let task = task_with(BasePriority::Medium);
        let ctx = AdjustmentContext::at(task.created_at);
        let algorithm = WeightedFactors::default();
        let without = algorithm.compute(&task, 0, &ctx).priority;
        let with = algorithm.compute(&task, 5, &ctx).priority;
        assert_eq!(without, 500);
        assert_eq!(with, 750);
    }

    #[test]
    fn priority_is_always_clamped() {
        let mut task = task_with(BasePriority::Critical);
        let now = task.created_at;
        task.deadline = Some(now - chrono::Duration::days(30));
        task.priority_factors.user_importance = 10.0;
        let decision = WeightedFactors::default().compute(&task, 50, &AdjustmentContext::at(now));
        assert_eq!(decision.priority, MAX_PRIORITY);

        let mut task = task_with(BasePriority::Background);
        task.priority_factors.user_importance = 0.0;
        task.priority_factors.system_criticality = 0.0;
        let decision =
            WeightedFactors::default().compute(&task, 0, &AdjustmentContext::at(task.created_at));
        assert!(decision.priority >= MIN_PRIORITY);
    }

    #[test]
    fn audit_trail_records_each_factor() {
        let mut task = task_with(BasePriority::High);
        let now = task.created_at;
        task.deadline = Some(now + chrono::Duration::days(1));
        let decision = WeightedFactors::default().compute(&task, 2, &AdjustmentContext::at(now));
        let factors: Vec<&str> = decision
            .adjustments
            .iter()
            .map(|a| a.factor.as_str())
            .collect();
        assert_eq!(factors, vec!["age", "deadline", "dependency_weight"]);
        for window in decision.adjustments.windows(2) {
            assert!((window[0].new - window[1].old).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn starved_task_gets_bounded_boost() {
        let mut computer = computer();
        let mut task = task_with(BasePriority::Low);
        task.status = crate::lifecycle::TaskState::Queued;
        // Fresh task, no boost.
        let ctx = AdjustmentContext::at(task.created_at);
        let fresh = computer.recompute(&task, 0, &ctx, 0);

        // Waiting far beyond the starvation bound.
        task.created_at = task.created_at - chrono::Duration::hours(2);
        computer.invalidate();
        let boosted = computer.recompute(&task, 0, &ctx, 0);
        assert!(boosted > fresh);

        let decision = computer.decision_for(task.id).unwrap();
        let starvation = decision
            .adjustments
            .iter()
            .find(|a| a.factor == "starvation")
            .unwrap();
        assert!(starvation.influence <= 200.0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// The computed priority stays in `[1, 2000]` across arbitrary
            /// factor values, ages, dependents, and deadlines.
            #[test]
            fn priority_is_always_in_range(
                importance in 0.0f64..10.0,
                criticality in 0.0f64..10.0,
                age_hours in 0i64..1_000,
                dependents in 0usize..200,
                deadline_offset_hours in -500i64..500,
            ) {
                let mut task = task_with(BasePriority::Medium);
                task.priority_factors.user_importance = importance;
                task.priority_factors.system_criticality = criticality;
                let now = task.created_at + chrono::Duration::hours(age_hours);
                task.deadline = Some(now + chrono::Duration::hours(deadline_offset_hours));

                let decision =
                    WeightedFactors::default().compute(&task, dependents, &AdjustmentContext::at(now));
                prop_assert!(decision.priority >= MIN_PRIORITY);
                prop_assert!(decision.priority <= MAX_PRIORITY);
            }
        }
    }

    #[test]
    fn cache_hits_by_structure_version() {
        struct Counting(std::sync::atomic::AtomicUsize);
        impl PriorityAlgorithm for Counting {
            fn name(&self) -> &'static str {
                "counting"
            }
            fn compute(&self, _: &Task, _: usize, _: &AdjustmentContext) -> PriorityDecision {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                PriorityDecision {
                    priority: 42,
                    adjustments: Vec::new(),
                }
            }
        }

        let mut computer = computer();
        let counting = Box::new(Counting(std::sync::atomic::AtomicUsize::new(0)));
        computer.set_algorithm(counting);

        let task = task_with(BasePriority::Medium);
        let ctx = AdjustmentContext::at(Utc::now());
        assert_eq!(computer.recompute(&task, 0, &ctx, 7), 42);
        // Same version: served from cache.
        assert_eq!(computer.recompute(&task, 0, &ctx, 7), 42);
        // New version: recomputed.
        assert_eq!(computer.recompute(&task, 0, &ctx, 8), 42);
    }
}
