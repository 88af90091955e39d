//! Event type definitions for the taskforge engine.
//!
//! Events are categorized by domain (task, queue, resources, persistence,
//! system) and wrapped in an envelope carrying an id and timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// A structured engine event with envelope metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    /// Unique event identifier.
    pub id: Uuid,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// The event category and payload.
    pub category: EventCategory,
}

impl EngineEvent {
    /// Wrap a category into a fresh envelope.
    #[must_use]
    pub fn new(category: EventCategory) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            category,
        }
    }

    /// Dotted event name, e.g. `task.state_transition`.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.category.name()
    }

    /// The task this event concerns, if any.
    #[must_use]
    pub fn task_id(&self) -> Option<Uuid> {
        self.category.task_id()
    }
}

/// Event categories organized by domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventCategory {
    /// Task lifecycle events.
    Task(TaskEvent),
    /// Scheduling queue events.
    Queue(QueueEvent),
    /// Resource pool events.
    Resources(ResourceEvent),
    /// Snapshot persistence events.
    Persistence(PersistenceEvent),
    /// Engine-level events.
    System(SystemEvent),
}

impl EventCategory {
    /// Dotted event name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Task(e) => e.name(),
            Self::Queue(e) => e.name(),
            Self::Resources(e) => e.name(),
            Self::Persistence(e) => e.name(),
            Self::System(e) => e.name(),
        }
    }

    /// The task this event concerns, if any.
    #[must_use]
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            Self::Task(e) => Some(e.task_id()),
            Self::Resources(
                ResourceEvent::Allocated { task_id, .. } | ResourceEvent::Released { task_id, .. },
            ) => Some(*task_id),
            _ => None,
        }
    }
}

/// Task lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum TaskEvent {
    /// A task was admitted to the engine.
    Submitted {
        /// Task id.
        task_id: Uuid,
        /// Human-readable title.
        title: String,
        /// Task category name.
        category: String,
    },
    /// A committed lifecycle transition.
    StateTransition {
        /// Task id.
        task_id: Uuid,
        /// Previous state name.
        from: String,
        /// New state name.
        to: String,
        /// What triggered the transition.
        trigger: String,
    },
    /// A transition attempt was rejected; the state did not change.
    TransitionRejected {
        /// Task id.
        task_id: Uuid,
        /// State at the time of the attempt.
        from: String,
        /// Requested state.
        to: String,
        /// Why the transition was rejected.
        reason: String,
    },
    /// The executor reported progress.
    Progress {
        /// Task id.
        task_id: Uuid,
        /// Progress fraction in `[0, 100]`, monotone per task.
        progress: f64,
    },
    /// The task reached `Completed`.
    Completed {
        /// Task id.
        task_id: Uuid,
        /// Wall time spent running, in milliseconds.
        duration_ms: u64,
    },
    /// The task failed.
    Failed {
        /// Task id.
        task_id: Uuid,
        /// Failure reason.
        reason: String,
        /// Whether a retry was scheduled.
        retry_scheduled: bool,
    },
    /// The task was cancelled.
    Cancelled {
        /// Task id.
        task_id: Uuid,
        /// Cancellation reason.
        reason: String,
    },
}

impl TaskEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Submitted { .. } => "task.submitted",
            Self::StateTransition { .. } => "task.state_transition",
            Self::TransitionRejected { .. } => "task.transition_rejected",
            Self::Progress { .. } => "task.progress",
            Self::Completed { .. } => "task.completed",
            Self::Failed { .. } => "task.failed",
            Self::Cancelled { .. } => "task.cancelled",
        }
    }

    fn task_id(&self) -> Uuid {
        match self {
            Self::Submitted { task_id, .. }
            | Self::StateTransition { task_id, .. }
            | Self::TransitionRejected { task_id, .. }
            | Self::Progress { task_id, .. }
            | Self::Completed { task_id, .. }
            | Self::Failed { task_id, .. }
            | Self::Cancelled { task_id, .. } => *task_id,
        }
    }
}

/// Scheduling queue events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum QueueEvent {
    /// A scheduling pass produced a decision.
    Optimized {
        /// Policy that produced the decision.
        policy: String,
        /// Number of eligible candidates considered.
        considered: usize,
        /// Number of tasks dispatched.
        chosen: usize,
    },
    /// The ready queue crossed the backpressure threshold.
    Backpressure {
        /// Current queue depth.
        depth: usize,
    },
}

impl QueueEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Optimized { .. } => "queue.optimized",
            Self::Backpressure { .. } => "queue.backpressure",
        }
    }
}

/// Resource pool events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ResourceEvent {
    /// Resources were reserved for a task.
    Allocated {
        /// Task id.
        task_id: Uuid,
        /// Resource names reserved.
        resources: Vec<String>,
    },
    /// Resources held by a task were released.
    Released {
        /// Task id.
        task_id: Uuid,
        /// Resource names released.
        resources: Vec<String>,
    },
}

impl ResourceEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Allocated { .. } => "resources.allocated",
            Self::Released { .. } => "resources.released",
        }
    }
}

/// Snapshot persistence events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum PersistenceEvent {
    /// A snapshot was written to disk.
    SnapshotCreated {
        /// Snapshot id.
        snapshot_id: Uuid,
        /// Why the snapshot was taken.
        reason: String,
        /// Number of tasks captured.
        task_count: usize,
    },
    /// Engine state was restored from a snapshot.
    SnapshotRestored {
        /// Snapshot id.
        snapshot_id: Uuid,
        /// Number of tasks restored.
        task_count: usize,
    },
}

impl PersistenceEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::SnapshotCreated { .. } => "persistence.snapshot_created",
            Self::SnapshotRestored { .. } => "persistence.snapshot_restored",
        }
    }
}

/// Engine-level events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    /// Periodic health evaluation.
    HealthCheck {
        /// Overall status name (`healthy`, `warning`, `critical`).
        overall: String,
    },
    /// The engine is shutting down.
    Shutdown {
        /// Shutdown reason.
        reason: String,
    },
}

impl SystemEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::HealthCheck { .. } => "system.health_check",
            Self::Shutdown { .. } => "system.shutdown",
        }
    }
}

/// Subscription filter over the event stream.
///
/// An empty filter matches everything. When `task_id` is set only events for
/// that task match; when `names` is non-empty only the listed dotted names
/// match. Both conditions must hold when both are set.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Restrict to a single task.
    pub task_id: Option<Uuid>,
    /// Restrict to a set of dotted event names.
    pub names: BTreeSet<String>,
}

impl EventFilter {
    /// A filter that matches every event.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// A filter scoped to one task.
    #[must_use]
    pub fn for_task(task_id: Uuid) -> Self {
        Self {
            task_id: Some(task_id),
            names: BTreeSet::new(),
        }
    }

    /// Add a dotted event name to the filter.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.names.insert(name.into());
        self
    }

    /// Whether the event passes this filter.
    #[must_use]
    pub fn matches(&self, event: &EngineEvent) -> bool {
        if let Some(task_id) = self.task_id
            && event.task_id() != Some(task_id)
        {
            return false;
        }
        self.names.is_empty() || self.names.contains(event.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_are_dotted() {
        let event = EngineEvent::new(EventCategory::Task(TaskEvent::Progress {
            task_id: Uuid::new_v4(),
            progress: 50.0,
        }));
        assert_eq!(event.name(), "task.progress");

        let event = EngineEvent::new(EventCategory::System(SystemEvent::Shutdown {
            reason: "requested".into(),
        }));
        assert_eq!(event.name(), "system.shutdown");
    }

    #[test]
    fn filter_matches_by_task_and_name() {
        let task_id = Uuid::new_v4();
        let event = EngineEvent::new(EventCategory::Task(TaskEvent::Completed {
            task_id,
            duration_ms: 12,
        }));

        assert!(EventFilter::all().matches(&event));
        assert!(EventFilter::for_task(task_id).matches(&event));
        assert!(!EventFilter::for_task(Uuid::new_v4()).matches(&event));
        assert!(EventFilter::all().with_name("task.completed").matches(&event));
        assert!(!EventFilter::all().with_name("task.failed").matches(&event));
        assert!(
            !EventFilter::for_task(task_id)
                .with_name("task.failed")
                .matches(&event)
        );
    }

    #[test]
    fn events_round_trip_through_json() {
        let event = EngineEvent::new(EventCategory::Task(TaskEvent::StateTransition {
            task_id: Uuid::new_v4(),
            from: "Queued".into(),
            to: "Scheduled".into(),
            trigger: "dispatch".into(),
        }));
        let json = serde_json::to_string(&event).unwrap();
        let back: EngineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, event.id);
        assert_eq!(back.name(), "task.state_transition");
    }
}
