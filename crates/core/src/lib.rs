//! Core scheduling and lifecycle engine for taskforge.
//!
//! A long-lived in-process service that accepts submitted work items,
//! orders them under priority and dependency constraints, executes them
//! concurrently under bounded resource pools, tracks each item through an
//! explicit lifecycle state machine, and survives restarts via compressed
//! snapshots on disk.
//!
//! The [`Engine`] handle is the public surface: submit tasks with executor
//! callbacks, cancel/pause/resume/retry them, query status, subscribe to
//! events, and snapshot/restore state. Everything else in this crate is the
//! machinery behind that handle.
//!
//! ```rust,ignore
//! use taskforge_core::{Engine, EngineConfig, TaskSubmission, TaskCategory};
//! use taskforge_core::supervisor::{executor_fn, ExecutionResult};
//!
//! let engine = Engine::start(EngineConfig::default()).await?;
//! let receipt = engine
//!     .submit(
//!         TaskSubmission::new("build", TaskCategory::Implementation),
//!         executor_fn(|_task, _ctx| async { ExecutionResult::ok(None) }),
//!     )
//!     .await?;
//! let status = engine.get_status(receipt.task_id).await?;
//! ```

pub mod breakdown;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod persistence;
pub mod priority;
pub mod resources;
pub mod scheduler;
pub mod supervisor;
pub mod task;

pub use config::{EngineConfig, PersistenceConfig};
pub use engine::{
    ComponentHealth, Engine, HealthStatus, SubmitReceipt, SystemHealth, TaskQuery,
    TaskQueryResponse, TaskStatus, TaskSummary,
};
pub use error::{Error, Result};
pub use lifecycle::TaskState;
pub use metrics::EngineMetrics;
pub use scheduler::SchedulingPolicy;
pub use task::{
    BasePriority, DeclaredDependency, PriorityFactors, Task, TaskCategory, TaskId, TaskMetadata,
    TaskSubmission,
};

pub use taskforge_events as events;
pub use taskforge_graph::{DependencyEdge, DependencyGraph, DependencyImpact, EdgeKind};
