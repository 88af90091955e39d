//! Error types for dependency graph operations.

use std::fmt;
use uuid::Uuid;

/// Result type for dependency graph operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during dependency graph operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Committing the edge would close a hard dependency cycle, or an
    /// ordering query ran against a graph that already contains one.
    CycleDetected {
        /// The offending chain of task ids, first repeats implicitly.
        cycle: Vec<Uuid>,
    },

    /// An edge endpoint references a task that is not in the graph.
    UnknownTask {
        /// The missing task id.
        task: Uuid,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CycleDetected { cycle } => {
                if cycle.is_empty() {
                    write!(f, "dependency cycle detected")
                } else {
                    let chain = cycle
                        .iter()
                        .map(Uuid::to_string)
                        .collect::<Vec<_>>()
                        .join(" -> ");
                    write!(f, "dependency cycle detected: {chain}")
                }
            }
            Self::UnknownTask { task } => {
                write!(f, "edge references unknown task '{task}'")
            }
        }
    }
}

impl std::error::Error for Error {}
