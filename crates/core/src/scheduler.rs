//! Scheduling policies.
//!
//! The scheduler turns the current ready set into a [`SchedulingDecision`]:
//! which tasks to dispatch into the free execution slots, under one of
//! seven policies. It never mutates engine state; the engine applies the
//! decision.

use crate::lifecycle::TaskState;
use crate::resources::ResourcePool;
use crate::task::{BasePriority, Task, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use taskforge_graph::DependencyGraph;
use tracing::debug;

/// Dispatch ordering policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulingPolicy {
    /// Oldest submission first.
    Fifo,
    /// Highest dynamic priority first.
    Priority,
    /// Shortest priority-scaled duration first.
    ShortestJobFirst,
    /// Earliest deadline first; deadline-less tasks fall back to priority.
    DeadlineMonotonic,
    /// Topological order with greedy packing.
    DependencyAware,
    /// Greedy per-task resource efficiency.
    ResourceOptimal,
    /// Evaluate several policies, pick the best composite score.
    HybridAdaptive,
}

impl SchedulingPolicy {
    /// Kebab-case policy name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::Priority => "priority",
            Self::ShortestJobFirst => "shortest-job-first",
            Self::DeadlineMonotonic => "deadline-monotonic",
            Self::DependencyAware => "dependency-aware",
            Self::ResourceOptimal => "resource-optimal",
            Self::HybridAdaptive => "hybrid-adaptive",
        }
    }
}

/// Risk assessment of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Nothing unusual.
    Low,
    /// Retries or tight deadlines among the chosen tasks.
    Medium,
    /// Overdue deadlines or repeated failures among the chosen tasks.
    High,
}

impl RiskLevel {
    fn penalty(self) -> f64 {
        match self {
            Self::Low => 0.0,
            Self::Medium => 10.0,
            Self::High => 25.0,
        }
    }
}

/// What the scheduler expects from a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedOutcome {
    /// Expected wall time of the batch (tasks run in parallel).
    pub total_duration_ms: u64,
    /// Resource utilization after dispatch, in `[0, 1]`.
    pub resource_utilization: f64,
    /// Fraction of free slots filled, in `[0, 1]`.
    pub parallelism_factor: f64,
    /// Risk assessment.
    pub risk: RiskLevel,
}

/// A scheduling decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingDecision {
    /// Policy that produced the decision.
    pub policy: String,
    /// Chosen tasks, in dispatch order.
    pub tasks: Vec<TaskId>,
    /// Per-decision reasoning lines.
    pub reasoning: Vec<String>,
    /// Expected outcome.
    pub expected: ExpectedOutcome,
    /// Confidence in the decision, in `[0, 1]`.
    pub confidence: f64,
}

impl SchedulingDecision {
    fn empty(policy: SchedulingPolicy, reason: impl Into<String>) -> Self {
        Self {
            policy: policy.as_str().to_string(),
            tasks: Vec::new(),
            reasoning: vec![reason.into()],
            expected: ExpectedOutcome {
                total_duration_ms: 0,
                resource_utilization: 0.0,
                parallelism_factor: 0.0,
                risk: RiskLevel::Low,
            },
            confidence: 1.0,
        }
    }
}

/// Read-only view the scheduler works from.
pub struct SchedulerContext<'a> {
    /// Decision time.
    pub now: DateTime<Utc>,
    /// All tasks by id.
    pub tasks: &'a HashMap<TaskId, Task>,
    /// The dependency graph.
    pub graph: &'a DependencyGraph,
    /// Current resource pool.
    pub resources: &'a ResourcePool,
    /// Tasks with a bound executor; only these are dispatchable.
    pub bound_executors: &'a HashSet<TaskId>,
    /// Running workers over the concurrency bound, in `[0, 1]`.
    pub system_load: f64,
}

impl SchedulerContext<'_> {
    /// The eligibility predicate: schedulable state, hard dependencies
    /// completed, resources free, backoff elapsed, executor bound.
    #[must_use]
    pub fn eligible(&self) -> Vec<&Task> {
        let mut out: Vec<&Task> = self
            .tasks
            .values()
            .filter(|task| {
                task.status.is_schedulable()
                    && task.backoff_elapsed(self.now)
                    && self.bound_executors.contains(&task.id)
                    && self.resources.can_reserve(&task.required_resources)
                    && self.hard_deps_completed(task.id)
            })
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    fn hard_deps_completed(&self, id: TaskId) -> bool {
        self.graph.hard_dependencies_of(id).iter().all(|dep| {
            self.tasks
                .get(dep)
                .is_none_or(|t| t.status == TaskState::Completed)
        })
    }
}

/// Policy evaluator.
#[derive(Debug)]
pub struct Scheduler {
    policy: SchedulingPolicy,
}

impl Scheduler {
    /// Scheduler with the given policy.
    #[must_use]
    pub fn new(policy: SchedulingPolicy) -> Self {
        Self { policy }
    }

    /// Active policy.
    #[must_use]
    pub fn policy(&self) -> SchedulingPolicy {
        self.policy
    }

    /// Switch policy.
    pub fn set_policy(&mut self, policy: SchedulingPolicy) {
        self.policy = policy;
    }

    /// Pick the next batch of tasks for the free slots.
    #[must_use]
    pub fn pick_next(&self, slots: usize, ctx: &SchedulerContext<'_>) -> SchedulingDecision {
        if slots == 0 {
            return SchedulingDecision::empty(self.policy, "no free slots");
        }
        let eligible = ctx.eligible();
        if eligible.is_empty() {
            return SchedulingDecision::empty(self.policy, "no eligible tasks");
        }
        let decision = match self.policy {
            SchedulingPolicy::HybridAdaptive => Self::pick_hybrid(slots, ctx, &eligible),
            policy => Self::evaluate(policy, slots, ctx, &eligible),
        };
        debug!(
            policy = %decision.policy,
            chosen = decision.tasks.len(),
            considered = eligible.len(),
            "scheduling decision"
        );
        decision
    }

    /// Which concrete policy the adaptive heuristics recommend for the
    /// current context.
    #[must_use]
    pub fn adaptive_policy(ctx: &SchedulerContext<'_>, eligible: &[&Task]) -> SchedulingPolicy {
        let critical_deadlines = eligible
            .iter()
            .any(|t| t.base_priority == BasePriority::Critical && t.deadline.is_some());
        if critical_deadlines {
            return SchedulingPolicy::DeadlineMonotonic;
        }
        let with_deps = eligible
            .iter()
            .filter(|t| !ctx.graph.dependencies_of(t.id).is_empty())
            .count();
        if with_deps > 5 {
            return SchedulingPolicy::DependencyAware;
        }
        if ctx.system_load > 0.75 && ctx.resources.utilization() > 0.5 {
            return SchedulingPolicy::ResourceOptimal;
        }
        if eligible.len() > 20 {
            SchedulingPolicy::ShortestJobFirst
        } else {
            SchedulingPolicy::Priority
        }
    }

    fn pick_hybrid(
        slots: usize,
        ctx: &SchedulerContext<'_>,
        eligible: &[&Task],
    ) -> SchedulingDecision {
        const CANDIDATES: [SchedulingPolicy; 5] = [
            SchedulingPolicy::Priority,
            SchedulingPolicy::ShortestJobFirst,
            SchedulingPolicy::DeadlineMonotonic,
            SchedulingPolicy::DependencyAware,
            SchedulingPolicy::ResourceOptimal,
        ];
        let recommended = Self::adaptive_policy(ctx, eligible);

        let mut best: Option<(f64, SchedulingDecision)> = None;
        for policy in CANDIDATES {
            let mut decision = Self::evaluate(policy, slots, ctx, eligible);
            if policy == recommended {
                decision.confidence = (decision.confidence + 0.05).min(1.0);
                decision
                    .reasoning
                    .push("recommended by adaptive heuristics".to_string());
            }
            let score = composite_score(&decision);
            // Strictly-greater keeps declaration order on ties.
            if best.as_ref().is_none_or(|(s, _)| score > *s) {
                best = Some((score, decision));
            }
        }
        let (score, mut decision) = best.expect("at least one candidate evaluated");
        decision
            .reasoning
            .push(format!("hybrid composite score {score:.2}"));
        decision.policy = format!("hybrid-adaptive({})", decision.policy);
        decision
    }

    fn evaluate(
        policy: SchedulingPolicy,
        slots: usize,
        ctx: &SchedulerContext<'_>,
        eligible: &[&Task],
    ) -> SchedulingDecision {
        let mut reasoning = Vec::new();
        let (ordered, confidence) = match policy {
            SchedulingPolicy::Fifo => {
                let mut tasks = eligible.to_vec();
                tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                reasoning.push("ordered by submission time".to_string());
                (tasks, 0.8)
            }
            SchedulingPolicy::Priority => {
                let mut tasks = eligible.to_vec();
                tasks.sort_by(|a, b| {
                    b.dynamic_priority
                        .cmp(&a.dynamic_priority)
                        .then(a.created_at.cmp(&b.created_at))
                        .then(a.id.cmp(&b.id))
                });
                reasoning.push("ordered by dynamic priority".to_string());
                (tasks, 0.9)
            }
            SchedulingPolicy::ShortestJobFirst => {
                let mut tasks = eligible.to_vec();
                tasks.sort_by(|a, b| {
                    sjf_key(a)
                        .total_cmp(&sjf_key(b))
                        .then(a.id.cmp(&b.id))
                });
                reasoning.push("ordered by priority-scaled duration".to_string());
                (tasks, 0.85)
            }
            SchedulingPolicy::DeadlineMonotonic => {
                let mut tasks = eligible.to_vec();
                tasks.sort_by(|a, b| match (a.deadline, b.deadline) {
                    (Some(da), Some(db)) => da.cmp(&db).then(a.id.cmp(&b.id)),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => b
                        .dynamic_priority
                        .cmp(&a.dynamic_priority)
                        .then(a.id.cmp(&b.id)),
                });
                reasoning.push("ordered by deadline urgency".to_string());
                (tasks, 0.9)
            }
            SchedulingPolicy::DependencyAware => {
                match Self::topological_candidates(ctx, eligible) {
                    Some(tasks) => {
                        reasoning.push("topological order with greedy packing".to_string());
                        (tasks, 0.95)
                    }
                    None => {
                        // Soft cycle in the graph; fall back to priority.
                        reasoning.push(
                            "graph not orderable, falling back to priority".to_string(),
                        );
                        let mut tasks = eligible.to_vec();
                        tasks.sort_by(|a, b| b.dynamic_priority.cmp(&a.dynamic_priority));
                        (tasks, 0.5)
                    }
                }
            }
            SchedulingPolicy::ResourceOptimal => {
                let mut tasks = eligible.to_vec();
                tasks.sort_by(|a, b| {
                    efficiency(b)
                        .total_cmp(&efficiency(a))
                        .then(a.id.cmp(&b.id))
                });
                reasoning.push("ordered by resource efficiency".to_string());
                (tasks, 0.85)
            }
            SchedulingPolicy::HybridAdaptive => unreachable!("handled by pick_hybrid"),
        };

        // Resource conflicts block packing under dependency-aware ordering
        // and are skipped under the others.
        let stop_on_conflict = policy == SchedulingPolicy::DependencyAware;
        let chosen = pack(&ordered, slots, ctx.resources, stop_on_conflict);
        let expected = expect_outcome(&chosen, slots, ctx);
        reasoning.push(format!(
            "{} of {} eligible packed into {} slots",
            chosen.len(),
            eligible.len(),
            slots
        ));

        SchedulingDecision {
            policy: policy.as_str().to_string(),
            tasks: chosen.iter().map(|t| t.id).collect(),
            reasoning,
            expected,
            confidence,
        }
    }

    fn topological_candidates<'t>(
        ctx: &SchedulerContext<'_>,
        eligible: &[&'t Task],
    ) -> Option<Vec<&'t Task>> {
        let priorities: HashMap<TaskId, i64> = ctx
            .tasks
            .iter()
            .map(|(id, t)| (*id, t.dynamic_priority))
            .collect();
        let order = ctx
            .graph
            .topological_order(|id| priorities.get(&id).copied().unwrap_or(0))
            .ok()?;
        let by_id: HashMap<TaskId, &Task> = eligible.iter().map(|t| (t.id, *t)).collect();
        Some(order.iter().filter_map(|id| by_id.get(id).copied()).collect())
    }
}

/// Shortest-job-first sort key: estimated duration scaled down for
/// high-priority tasks.
fn sjf_key(task: &Task) -> f64 {
    task.estimated_duration_ms as f64 / (task.dynamic_priority as f64 / 500.0).max(1.0)
}

/// Resource efficiency: priority delivered per resource unit consumed.
fn efficiency(task: &Task) -> f64 {
    task.dynamic_priority as f64 / (1.0 + task.required_resources.len() as f64)
}

/// Greedily take tasks in order while slots and simulated resources allow.
fn pack<'t>(
    ordered: &[&'t Task],
    slots: usize,
    resources: &ResourcePool,
    stop_on_conflict: bool,
) -> Vec<&'t Task> {
    let mut free: BTreeMap<&str, u32> = resources
        .states()
        .iter()
        .map(|(name, state)| (name.as_str(), state.available()))
        .collect();
    let mut chosen = Vec::new();
    for task in ordered {
        if chosen.len() >= slots {
            break;
        }
        let fits = task
            .required_resources
            .iter()
            .all(|r| free.get(r.as_str()).copied().unwrap_or(0) >= 1);
        if fits {
            for r in &task.required_resources {
                if let Some(count) = free.get_mut(r.as_str()) {
                    *count -= 1;
                }
            }
            chosen.push(*task);
        } else if stop_on_conflict {
            break;
        }
    }
    chosen
}

fn expect_outcome(chosen: &[&Task], slots: usize, ctx: &SchedulerContext<'_>) -> ExpectedOutcome {
    let total_duration_ms = chosen
        .iter()
        .map(|t| t.estimated_duration_ms)
        .max()
        .unwrap_or(0);

    // Utilization after dispatch: current reservations plus one unit per
    // chosen requirement, over total capacity.
    let (mut reserved, mut capacity) = (0u64, 0u64);
    for state in ctx.resources.states().values() {
        reserved += u64::from(state.reserved);
        capacity += u64::from(state.capacity);
    }
    for task in chosen {
        reserved += task.required_resources.len() as u64;
    }
    let resource_utilization = if capacity == 0 {
        0.0
    } else {
        (reserved as f64 / capacity as f64).min(1.0)
    };

    ExpectedOutcome {
        total_duration_ms,
        resource_utilization,
        parallelism_factor: chosen.len() as f64 / slots.max(1) as f64,
        risk: assess_risk(chosen, ctx.now),
    }
}

fn assess_risk(chosen: &[&Task], now: DateTime<Utc>) -> RiskLevel {
    let mut level = RiskLevel::Low;
    for task in chosen {
        let overdue = task.deadline.is_some_and(|d| d <= now);
        if overdue || task.retry_count > 1 {
            return RiskLevel::High;
        }
        let tight = task.deadline.is_some_and(|d| {
            (d - now).num_milliseconds() < 2 * task.estimated_duration_ms as i64
        });
        if tight || task.retry_count == 1 {
            level = RiskLevel::Medium;
        }
    }
    level
}

/// Composite score used by the hybrid policy.
fn composite_score(decision: &SchedulingDecision) -> f64 {
    let e = &decision.expected;
    e.resource_utilization * 100.0 + e.parallelism_factor * 50.0
        - e.total_duration_ms as f64 * 0.0001
        - e.risk.penalty()
        + decision.confidence * 30.0
}
