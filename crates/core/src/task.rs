//! Task data model: categories, priorities, the task record, and
//! submissions.

use crate::lifecycle::TaskState;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use taskforge_graph::EdgeKind;
use uuid::Uuid;

/// Stable, opaque task identifier.
pub type TaskId = Uuid;

/// Work category of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    /// Feature or system implementation work.
    Implementation,
    /// Test authoring or execution.
    Testing,
    /// Verification of produced artifacts.
    Validation,
    /// Documentation work.
    Documentation,
    /// Investigation and analysis.
    Analysis,
    /// Rollout and deployment.
    Deployment,
    /// Security-related work.
    Security,
    /// Performance work.
    Performance,
    /// Restructuring without behavior change.
    Refactor,
    /// Defect fixing.
    BugFix,
    /// New feature work.
    Feature,
    /// Infrastructure and tooling.
    Infrastructure,
}

impl TaskCategory {
    /// Snake-case name, as used in events and queries.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Implementation => "implementation",
            Self::Testing => "testing",
            Self::Validation => "validation",
            Self::Documentation => "documentation",
            Self::Analysis => "analysis",
            Self::Deployment => "deployment",
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Refactor => "refactor",
            Self::BugFix => "bug_fix",
            Self::Feature => "feature",
            Self::Infrastructure => "infrastructure",
        }
    }
}

/// Caller-assigned base priority band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BasePriority {
    /// Must run as soon as possible.
    Critical,
    /// Important work.
    High,
    /// Default band.
    Medium,
    /// Deferred work.
    Low,
    /// Best-effort background work.
    Background,
}

impl BasePriority {
    /// Integer weight of the band; the initial dynamic priority.
    #[must_use]
    pub fn weight(self) -> i64 {
        match self {
            Self::Critical => 1000,
            Self::High => 750,
            Self::Medium => 500,
            Self::Low => 250,
            Self::Background => 50,
        }
    }
}

/// Unit-scaled multipliers a caller can attach to influence the dynamic
/// priority. All default to `1.0` (neutral).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityFactors {
    /// Aging multiplier (engine-maintained input).
    pub age: f64,
    /// Caller-declared importance.
    pub user_importance: f64,
    /// System criticality.
    pub system_criticality: f64,
    /// Dependency weight multiplier.
    pub dependency_weight: f64,
    /// Resource availability multiplier.
    pub resource_availability: f64,
    /// Execution-history multiplier.
    pub execution_history: f64,
}

impl Default for PriorityFactors {
    fn default() -> Self {
        Self {
            age: 1.0,
            user_importance: 1.0,
            system_criticality: 1.0,
            dependency_weight: 1.0,
            resource_availability: 1.0,
            execution_history: 1.0,
        }
    }
}

/// Free-form task annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskMetadata {
    /// Caller tags.
    pub tags: Vec<String>,
    /// Who created the task.
    pub created_by: Option<String>,
}

/// A unit of work tracked by the engine.
///
/// The executor callback is deliberately not part of this record: callbacks
/// are registered with the engine keyed by task id and re-bound after a
/// restore. Everything here serializes into snapshots. Dependency sets live
/// in the engine's graph (two id-keyed index structures), not on the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable identifier.
    pub id: TaskId,
    /// Human-readable title.
    pub title: String,
    /// Human-readable description.
    pub description: String,
    /// Work category.
    pub category: TaskCategory,
    /// Caller-assigned priority band.
    pub base_priority: BasePriority,
    /// Recomputed priority in `[1, 2000]`.
    pub dynamic_priority: i64,
    /// Caller multipliers feeding the priority computation.
    pub priority_factors: PriorityFactors,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// First time the task entered `Running`.
    pub started_at: Option<DateTime<Utc>>,
    /// Time the task completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Absolute deadline, if any.
    pub deadline: Option<DateTime<Utc>>,
    /// Estimated duration in milliseconds.
    pub estimated_duration_ms: u64,
    /// Execution bound in milliseconds; `0` times out before the executor
    /// is invoked.
    pub max_execution_time_ms: u64,
    /// Retry budget.
    pub max_retries: u32,
    /// Failures so far.
    pub retry_count: u32,
    /// Named resources consumed for the whole run, one unit each.
    pub required_resources: BTreeSet<String>,
    /// Predicate ids checked before `Starting`.
    pub pre_conditions: Vec<String>,
    /// Predicate ids checked before `Completing`.
    pub post_conditions: Vec<String>,
    /// Current lifecycle state.
    pub status: TaskState,
    /// Opaque caller parameters.
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Outputs the caller expects.
    pub expected_outputs: BTreeMap<String, serde_json::Value>,
    /// Outputs produced by the executor.
    pub outputs: BTreeMap<String, serde_json::Value>,
    /// Annotations.
    pub metadata: TaskMetadata,
    /// Last failure message, if any.
    pub last_error: Option<String>,
    /// Retry backoff gate; the task is not dispatched before this time.
    pub next_eligible_at: Option<DateTime<Utc>>,
    /// Monotone progress fraction in `[0, 100]`.
    pub progress: f64,
    /// Session that owns the task; used for orphan detection on restore.
    pub session_id: Uuid,
}

impl Task {
    /// Materialize a task from a validated submission.
    #[must_use]
    pub fn from_submission(submission: &TaskSubmission, session_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: submission.title.clone(),
            description: submission.description.clone(),
            category: submission.category,
            base_priority: submission.base_priority,
            dynamic_priority: submission.base_priority.weight(),
            priority_factors: submission.priority_factors,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            deadline: submission.deadline,
            estimated_duration_ms: submission.estimated_duration_ms,
            max_execution_time_ms: submission.max_execution_time_ms,
            max_retries: submission.max_retries,
            retry_count: 0,
            required_resources: submission.required_resources.clone(),
            pre_conditions: submission.pre_conditions.clone(),
            post_conditions: submission.post_conditions.clone(),
            status: TaskState::Created,
            parameters: submission.parameters.clone(),
            expected_outputs: submission.expected_outputs.clone(),
            outputs: BTreeMap::new(),
            metadata: submission.metadata.clone(),
            last_error: None,
            next_eligible_at: None,
            progress: 0.0,
            session_id,
        }
    }

    /// Whether the retry backoff gate has elapsed.
    #[must_use]
    pub fn backoff_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.next_eligible_at.is_none_or(|t| t <= now)
    }

    /// Whether the task has never run and is still waiting in line.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.started_at.is_none() && self.status.is_schedulable()
    }
}

/// A dependency declared at submission time, against an existing task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclaredDependency {
    /// The existing task this submission depends on.
    pub depends_on: TaskId,
    /// Edge kind.
    pub kind: EdgeKind,
}

/// Caller-facing submission payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSubmission {
    /// Human-readable title; must be non-empty.
    pub title: String,
    /// Human-readable description.
    pub description: String,
    /// Work category.
    pub category: TaskCategory,
    /// Priority band.
    pub base_priority: BasePriority,
    /// Caller priority multipliers.
    pub priority_factors: PriorityFactors,
    /// Absolute deadline.
    pub deadline: Option<DateTime<Utc>>,
    /// Estimated duration in milliseconds.
    pub estimated_duration_ms: u64,
    /// Execution bound in milliseconds.
    pub max_execution_time_ms: u64,
    /// Retry budget.
    pub max_retries: u32,
    /// Required resource names.
    pub required_resources: BTreeSet<String>,
    /// Dependencies on already-submitted tasks.
    pub dependencies: Vec<DeclaredDependency>,
    /// Predicate ids checked before `Starting`.
    pub pre_conditions: Vec<String>,
    /// Predicate ids checked before `Completing`.
    pub post_conditions: Vec<String>,
    /// Opaque parameters handed to the executor.
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Outputs the caller expects.
    pub expected_outputs: BTreeMap<String, serde_json::Value>,
    /// Annotations.
    pub metadata: TaskMetadata,
}

impl Default for TaskSubmission {
    fn default() -> Self {
        Self {
            title: String::new(),
            description: String::new(),
            category: TaskCategory::Implementation,
            base_priority: BasePriority::Medium,
            priority_factors: PriorityFactors::default(),
            deadline: None,
            estimated_duration_ms: 1_000,
            max_execution_time_ms: 300_000,
            max_retries: 3,
            required_resources: BTreeSet::new(),
            dependencies: Vec::new(),
            pre_conditions: Vec::new(),
            post_conditions: Vec::new(),
            parameters: BTreeMap::new(),
            expected_outputs: BTreeMap::new(),
            metadata: TaskMetadata::default(),
        }
    }
}

impl TaskSubmission {
    /// Start a submission with the mandatory fields.
    #[must_use]
    pub fn new(title: impl Into<String>, category: TaskCategory) -> Self {
        Self {
            title: title.into(),
            category,
            ..Self::default()
        }
    }

    /// Check the submission before admission.
    ///
    /// A `max_execution_time_ms` of zero is accepted here; such a task
    /// times out before its executor is invoked.
    ///
    /// # Errors
    ///
    /// `Validation` when the title is empty or a resource name is blank.
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::validation("task title must not be empty"));
        }
        if self.required_resources.iter().any(|r| r.trim().is_empty()) {
            return Err(Error::validation("resource names must not be blank"));
        }
        if self
            .pre_conditions
            .iter()
            .chain(self.post_conditions.iter())
            .any(|c| c.trim().is_empty())
        {
            return Err(Error::validation("condition ids must not be blank"));
        }
        Ok(())
    }
}
