//! Aggregate engine metrics, maintained incrementally on every transition.

use crate::lifecycle::TaskState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Counters and distributions exposed through `system_health` and written
/// into snapshots. Updated on the fly; no full scans.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineMetrics {
    /// Tasks ever admitted.
    pub submitted_total: u64,
    /// Tasks that reached `Completed`.
    pub completed_total: u64,
    /// Terminal failures (retries exhausted).
    pub failed_total: u64,
    /// Cancellations.
    pub cancelled_total: u64,
    /// Retries scheduled.
    pub retried_total: u64,
    /// Committed lifecycle transitions.
    pub transitions_total: u64,
    /// Current number of tasks per state.
    pub state_counts: BTreeMap<String, u64>,
    /// Committed transitions per `from->to` pair.
    pub transition_counts: BTreeMap<String, u64>,
    /// Sum of run durations, for mean-time computations.
    pub total_run_ms: u64,
    /// Number of runs contributing to `total_run_ms`.
    pub run_samples: u64,
}

impl EngineMetrics {
    /// Record an admission.
    pub fn record_submitted(&mut self) {
        self.submitted_total += 1;
        *self
            .state_counts
            .entry(TaskState::Created.as_str().to_string())
            .or_default() += 1;
    }

    /// Record a committed transition.
    pub fn record_transition(&mut self, from: TaskState, to: TaskState) {
        self.transitions_total += 1;
        let key = format!("{}->{}", from.as_str(), to.as_str());
        *self.transition_counts.entry(key).or_default() += 1;

        if let Some(count) = self.state_counts.get_mut(from.as_str()) {
            *count = count.saturating_sub(1);
        }
        *self
            .state_counts
            .entry(to.as_str().to_string())
            .or_default() += 1;

        match to {
            TaskState::Completed => self.completed_total += 1,
            TaskState::Cancelled => self.cancelled_total += 1,
            TaskState::Retrying => self.retried_total += 1,
            _ => {}
        }
    }

    /// Record a terminal failure (retries exhausted).
    pub fn record_terminal_failure(&mut self) {
        self.failed_total += 1;
    }

    /// Record a completed run's duration.
    pub fn record_run(&mut self, duration_ms: u64) {
        self.total_run_ms += duration_ms;
        self.run_samples += 1;
    }

    /// Mean run duration in milliseconds, `0.0` without samples.
    #[must_use]
    pub fn mean_run_ms(&self) -> f64 {
        if self.run_samples == 0 {
            0.0
        } else {
            self.total_run_ms as f64 / self.run_samples as f64
        }
    }

    /// Number of tasks currently in the given state.
    #[must_use]
    pub fn in_state(&self, state: TaskState) -> u64 {
        self.state_counts.get(state.as_str()).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_updates_distribution() {
        let mut metrics = EngineMetrics::default();
        metrics.record_submitted();
        metrics.record_transition(TaskState::Created, TaskState::Validated);
        metrics.record_transition(TaskState::Validated, TaskState::Queued);

        assert_eq!(metrics.submitted_total, 1);
        assert_eq!(metrics.transitions_total, 2);
        assert_eq!(metrics.in_state(TaskState::Created), 0);
        assert_eq!(metrics.in_state(TaskState::Queued), 1);
        assert_eq!(metrics.transition_counts["Validated->Queued"], 1);
    }

    #[test]
    fn terminal_counters() {
        let mut metrics = EngineMetrics::default();
        metrics.record_transition(TaskState::Completing, TaskState::Completed);
        metrics.record_transition(TaskState::Running, TaskState::Cancelled);
        metrics.record_transition(TaskState::Failed, TaskState::Retrying);
        metrics.record_terminal_failure();

        assert_eq!(metrics.completed_total, 1);
        assert_eq!(metrics.cancelled_total, 1);
        assert_eq!(metrics.retried_total, 1);
        assert_eq!(metrics.failed_total, 1);
    }

    #[test]
    fn mean_run_duration() {
        let mut metrics = EngineMetrics::default();
        assert_eq!(metrics.mean_run_ms(), 0.0);
        metrics.record_run(10);
        metrics.record_run(30);
        assert!((metrics.mean_run_ms() - 20.0).abs() < f64::EPSILON);
    }
}
