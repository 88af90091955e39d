//! Optional breakdown collaborator.
//!
//! When configured, the engine consults the collaborator for tasks whose
//! estimated duration exceeds `breakdown_threshold_ms` and installs the
//! returned subtasks and edges before scheduling proceeds. Purely advisory:
//! the engine behaves identically when no collaborator is present.

use crate::supervisor::TaskExecutor;
use crate::task::{Task, TaskId, TaskSubmission};
use std::sync::Arc;
use taskforge_graph::EdgeKind;

/// What a subtask may depend on.
#[derive(Debug, Clone)]
pub enum SubtaskDependency {
    /// The task being broken down.
    Parent,
    /// Another subtask of the same plan, by index.
    Sibling(usize),
    /// An already-submitted task.
    Existing(TaskId),
}

/// One subtask of a breakdown plan.
pub struct SubtaskSpec {
    /// The subtask to submit.
    pub submission: TaskSubmission,
    /// Its executor.
    pub executor: Arc<dyn TaskExecutor>,
    /// Edges to install for the subtask.
    pub depends_on: Vec<(SubtaskDependency, EdgeKind)>,
}

/// A full breakdown plan.
pub struct BreakdownPlan {
    /// Subtasks to install, in index order.
    pub subtasks: Vec<SubtaskSpec>,
    /// Subtask indices the parent should gate on with hard edges.
    pub parent_depends_on: Vec<usize>,
}

impl BreakdownPlan {
    /// A plan that changes nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            subtasks: Vec::new(),
            parent_depends_on: Vec::new(),
        }
    }
}

/// The breakdown collaborator interface.
pub trait Breakdown: Send + Sync {
    /// Propose subtasks for a complex task. The engine installs the plan
    /// through its public admission path; no other guarantees attach.
    fn breakdown(&self, task: &Task) -> BreakdownPlan;
}
