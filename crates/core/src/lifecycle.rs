//! Per-task lifecycle state machine.
//!
//! One explicit state graph per task, with guarded transitions, prioritized
//! before/after hooks, and pre/post-condition validation. The manager owns
//! every task's [`LifecycleContext`] and is only ever driven from the
//! scheduler task, so transitions commit in a total order per task.

use crate::resources::ResourcePool;
use crate::task::{Task, TaskId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle states a task can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Created, not yet validated.
    Created,
    /// Submission validated.
    Validated,
    /// Waiting in the ready queue.
    Queued,
    /// Picked by a scheduling decision.
    Scheduled,
    /// Dispatch preparation started.
    Preparing,
    /// Resources reserved.
    ResourceAllocated,
    /// Preconditions passed, about to run.
    Starting,
    /// Executor running.
    Running,
    /// Cooperatively paused.
    Paused,
    /// Resuming from pause.
    Resuming,
    /// Postconditions passed, finalizing.
    Completing,
    /// Finished successfully. Terminal.
    Completed,
    /// Failed. Terminal unless retried or rolled back.
    Failed,
    /// Retry scheduled.
    Retrying,
    /// Rollback in progress.
    RollingBack,
    /// Cancelled. Terminal.
    Cancelled,
    /// Archived after a terminal state.
    Archived,
    /// Blocked mid-run on an external condition.
    Blocked,
    /// Execution window expired mid-run.
    Expired,
}

impl TaskState {
    /// Stable name used in events, metrics, and snapshots.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Validated => "Validated",
            Self::Queued => "Queued",
            Self::Scheduled => "Scheduled",
            Self::Preparing => "Preparing",
            Self::ResourceAllocated => "ResourceAllocated",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Resuming => "Resuming",
            Self::Completing => "Completing",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Retrying => "Retrying",
            Self::RollingBack => "RollingBack",
            Self::Cancelled => "Cancelled",
            Self::Archived => "Archived",
            Self::Blocked => "Blocked",
            Self::Expired => "Expired",
        }
    }

    /// Terminal states are excluded from scheduling and retained until
    /// cleanup. `Failed` may still be left through `Retrying` or
    /// `RollingBack`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Archived
        )
    }

    /// States the scheduler considers for dispatch.
    #[must_use]
    pub fn is_schedulable(self) -> bool {
        matches!(self, Self::Queued | Self::Scheduled)
    }

    /// States an external cancellation may act on.
    #[must_use]
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            Self::Queued
                | Self::Scheduled
                | Self::Preparing
                | Self::Running
                | Self::Paused
                | Self::Blocked
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `from -> to` is a legal edge of the state machine.
///
/// The dispatch chain runs Created through Running; the pause loop is
/// `Running <-> Paused` via `Resuming`; failures during dispatch
/// (`Preparing`/`ResourceAllocated`/`Starting`) and during the run land in
/// `Failed`, which either retries back into the queue or rolls back.
#[must_use]
pub fn is_legal_transition(from: TaskState, to: TaskState) -> bool {
    use TaskState::{
        Archived, Blocked, Cancelled, Completed, Completing, Created, Expired, Failed, Paused,
        Preparing, Queued, ResourceAllocated, Resuming, Retrying, RollingBack, Running, Scheduled,
        Starting, Validated,
    };
    matches!(
        (from, to),
        (Created, Validated)
            | (Validated, Queued)
            | (Queued, Scheduled)
            | (Scheduled, Preparing)
            | (Preparing, ResourceAllocated | Failed | Cancelled)
            | (ResourceAllocated, Starting | Failed)
            | (Starting, Running | Failed)
            | (Running, Paused | Completing | Failed | Cancelled | Blocked | Expired)
            | (Paused, Resuming | Cancelled)
            | (Resuming, Running)
            | (Completing, Completed)
            | (Failed, Retrying | RollingBack | Archived)
            | (Retrying, Queued)
            | (RollingBack, Failed)
            | (Queued | Scheduled, Cancelled)
            | (Completed | Cancelled, Archived)
            | (Blocked, Running | Cancelled)
            | (Expired, Failed | Cancelled)
    )
}

/// A committed lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// State before the transition.
    pub from: TaskState,
    /// State after the transition.
    pub to: TaskState,
    /// Commit time.
    pub at: DateTime<Utc>,
    /// What drove the transition.
    pub trigger: String,
    /// Free-form annotations.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Per-task lifecycle bookkeeping.
///
/// The bounded event ring is persisted separately from the context record,
/// so it is skipped during (de)serialization and reattached on restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleContext {
    /// The task this context belongs to.
    pub task_id: TaskId,
    /// Current state. Always equals the last committed event's `to`.
    pub state: TaskState,
    /// Stack of previously held states.
    pub previous_states: Vec<TaskState>,
    /// Number of execution attempts (entries into `Running` from
    /// `Starting`).
    pub attempts: u32,
    /// Last evaluation result per precondition id.
    pub pre_condition_status: BTreeMap<String, bool>,
    /// Last evaluation result per postcondition id.
    pub post_condition_status: BTreeMap<String, bool>,
    /// Resources currently allocated to the task.
    pub allocated_resources: Vec<String>,
    /// First time the task entered `Running`.
    pub execution_start: Option<DateTime<Utc>>,
    /// Wall time from `execution_start` to the last terminal entry.
    pub total_duration_ms: Option<u64>,
    /// Bounded transition log, newest last.
    #[serde(skip)]
    pub events: VecDeque<LifecycleEvent>,
}

impl LifecycleContext {
    fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            state: TaskState::Created,
            previous_states: Vec::new(),
            attempts: 0,
            pre_condition_status: BTreeMap::new(),
            post_condition_status: BTreeMap::new(),
            allocated_resources: Vec::new(),
            execution_start: None,
            total_duration_ms: None,
            events: VecDeque::new(),
        }
    }
}

/// Registry of named predicates referenced by task pre/post-conditions.
///
/// An id with no registered predicate evaluates to `false`; conditions are
/// opt-in guarantees, not best-effort hints.
#[derive(Default, Clone)]
pub struct ConditionRegistry {
    predicates: HashMap<String, Arc<dyn Fn(&Task) -> bool + Send + Sync>>,
}

impl ConditionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a predicate under an id, replacing any previous one.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        predicate: Arc<dyn Fn(&Task) -> bool + Send + Sync>,
    ) {
        self.predicates.insert(id.into(), predicate);
    }

    /// Evaluate a predicate id against a task.
    #[must_use]
    pub fn evaluate(&self, id: &str, task: &Task) -> bool {
        self.predicates.get(id).is_some_and(|p| p.as_ref()(task))
    }
}

impl std::fmt::Debug for ConditionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionRegistry")
            .field("predicates", &self.predicates.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// When a hook runs relative to the transition commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookTiming {
    /// Runs before the commit; a failure aborts the transition.
    Before,
    /// Runs after the commit; a failure is logged, the commit stands.
    After,
}

/// Mutable environment handed to hooks.
pub struct HookEnv<'a> {
    /// The resource pool, for allocation/release hooks.
    pub resources: &'a mut ResourcePool,
    /// Named condition predicates.
    pub conditions: &'a ConditionRegistry,
}

type HookAction =
    Arc<dyn for<'a> Fn(&mut Task, &mut LifecycleContext, &mut HookEnv<'a>) -> Result<()> + Send + Sync>;
type HookPredicate = Arc<dyn Fn(&Task, &LifecycleContext) -> bool + Send + Sync>;

/// A hook registered against entry into a state.
pub struct TransitionHook {
    /// Hook name, for diagnostics.
    pub name: String,
    /// State whose entry triggers the hook.
    pub state: TaskState,
    /// Before or after the commit.
    pub timing: HookTiming,
    /// Higher priority runs first.
    pub priority: i32,
    /// Optional gate; the hook is skipped when it returns `false`.
    pub predicate: Option<HookPredicate>,
    /// The hook body.
    pub action: HookAction,
}

impl std::fmt::Debug for TransitionHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionHook")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("timing", &self.timing)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Owns every task's lifecycle context and applies guarded transitions.
#[derive(Debug)]
pub struct LifecycleManager {
    contexts: HashMap<TaskId, LifecycleContext>,
    hooks: Vec<TransitionHook>,
    in_flight: HashSet<TaskId>,
    max_history: usize,
}

impl LifecycleManager {
    /// Manager with the default hooks installed.
    #[must_use]
    pub fn new(max_history: usize) -> Self {
        let mut manager = Self {
            contexts: HashMap::new(),
            hooks: Vec::new(),
            in_flight: HashSet::new(),
            max_history: max_history.max(1),
        };
        manager.install_default_hooks();
        manager
    }

    /// Register a fresh context for a task in `Created`.
    pub fn register(&mut self, task_id: TaskId) {
        self.contexts
            .entry(task_id)
            .or_insert_with(|| LifecycleContext::new(task_id));
    }

    /// Register a context already in a known state, for restores of tasks
    /// that arrived without one.
    pub fn register_at(&mut self, task_id: TaskId, state: TaskState) {
        let context = self
            .contexts
            .entry(task_id)
            .or_insert_with(|| LifecycleContext::new(task_id));
        context.state = state;
    }

    /// Drop a task's context.
    pub fn remove(&mut self, task_id: TaskId) {
        self.contexts.remove(&task_id);
        self.in_flight.remove(&task_id);
    }

    /// Context lookup.
    #[must_use]
    pub fn context(&self, task_id: TaskId) -> Option<&LifecycleContext> {
        self.contexts.get(&task_id)
    }

    /// Iterate over all contexts, for snapshotting.
    pub fn contexts(&self) -> impl Iterator<Item = &LifecycleContext> {
        self.contexts.values()
    }

    /// The bounded event tail for a task, oldest first.
    #[must_use]
    pub fn event_log(&self, task_id: TaskId) -> Vec<LifecycleEvent> {
        self.contexts
            .get(&task_id)
            .map(|ctx| ctx.events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Register an additional hook.
    pub fn add_hook(&mut self, hook: TransitionHook) {
        self.hooks.push(hook);
    }

    /// Reattach a restored context and its event tail.
    pub fn restore_context(&mut self, mut context: LifecycleContext, events: Vec<LifecycleEvent>) {
        context.events = events.into_iter().collect();
        while context.events.len() > self.max_history {
            context.events.pop_front();
        }
        self.contexts.insert(context.task_id, context);
    }

    /// Apply a transition, running hooks and recording the event.
    ///
    /// # Errors
    ///
    /// `TransitionBusy` when a transition for the task is already in
    /// flight; `Transition` when the edge is illegal or a before-hook
    /// rejects; `NotFound` when the task has no context. The state is
    /// unchanged in every error case.
    pub fn transition(
        &mut self,
        task: &mut Task,
        to: TaskState,
        trigger: &str,
        env: &mut HookEnv<'_>,
    ) -> Result<LifecycleEvent> {
        let task_id = task.id;
        let from = self
            .contexts
            .get(&task_id)
            .ok_or_else(|| Error::not_found(format!("no lifecycle context for task {task_id}")))?
            .state;

        if self.in_flight.contains(&task_id) {
            return Err(Error::TransitionBusy { task: task_id });
        }
        if !is_legal_transition(from, to) {
            return Err(Error::transition(task_id, from, to, "edge not in state machine"));
        }

        self.in_flight.insert(task_id);
        let result = self.run_transition(task, from, to, trigger, env);
        self.in_flight.remove(&task_id);
        result
    }

    fn run_transition(
        &mut self,
        task: &mut Task,
        from: TaskState,
        to: TaskState,
        trigger: &str,
        env: &mut HookEnv<'_>,
    ) -> Result<LifecycleEvent> {
        let task_id = task.id;

        if let Err(err) = self.run_hooks(task, to, HookTiming::Before, env) {
            return Err(Error::transition(task_id, from, to, err.to_string()));
        }

        let now = Utc::now();
        let context = self
            .contexts
            .get_mut(&task_id)
            .expect("context checked above");

        context.previous_states.push(from);
        context.state = to;
        task.status = to;
        task.updated_at = now;

        if to == TaskState::Running {
            if context.execution_start.is_none() {
                context.execution_start = Some(now);
                task.started_at = Some(now);
            }
            if from == TaskState::Starting {
                context.attempts += 1;
            }
        }
        if to.is_terminal() {
            if let Some(start) = context.execution_start {
                let elapsed = (now - start).num_milliseconds().max(0) as u64;
                context.total_duration_ms = Some(elapsed);
            }
            if to == TaskState::Completed {
                task.completed_at = Some(now);
            }
        }

        let event = LifecycleEvent {
            from,
            to,
            at: now,
            trigger: trigger.to_string(),
            metadata: BTreeMap::new(),
        };
        context.events.push_back(event.clone());
        while context.events.len() > self.max_history {
            context.events.pop_front();
        }

        debug!(task = %task_id, from = %from, to = %to, trigger, "transition committed");

        if let Err(err) = self.run_hooks(task, to, HookTiming::After, env) {
            // After-hook failures do not unwind the committed transition.
            warn!(task = %task_id, state = %to, error = %err, "after-hook failed");
        }

        Ok(event)
    }

    fn run_hooks(
        &mut self,
        task: &mut Task,
        state: TaskState,
        timing: HookTiming,
        env: &mut HookEnv<'_>,
    ) -> Result<()> {
        let mut selected: Vec<usize> = self
            .hooks
            .iter()
            .enumerate()
            .filter(|(_, h)| h.state == state && h.timing == timing)
            .map(|(i, _)| i)
            .collect();
        selected.sort_by_key(|&i| std::cmp::Reverse(self.hooks[i].priority));

        for index in selected {
            let hook = &self.hooks[index];
            let context = self
                .contexts
                .get_mut(&task.id)
                .expect("context exists during transition");
            if let Some(predicate) = &hook.predicate
                && !predicate.as_ref()(task, context)
            {
                continue;
            }
            let action = Arc::clone(&hook.action);
            let name = hook.name.clone();
            action.as_ref()(task, context, env).map_err(|err| {
                debug!(task = %task.id, hook = %name, error = %err, "hook rejected transition");
                err
            })?;
        }
        Ok(())
    }

    fn install_default_hooks(&mut self) {
        self.add_hook(TransitionHook {
            name: "allocate-resources".into(),
            state: TaskState::ResourceAllocated,
            timing: HookTiming::Before,
            priority: 100,
            predicate: None,
            action: Arc::new(|task, context, env| {
                env.resources
                    .reserve(task.id, &task.required_resources)
                    .map_err(|resource| Error::ResourceContention { resource })?;
                context.allocated_resources =
                    task.required_resources.iter().cloned().collect();
                Ok(())
            }),
        });

        for state in [TaskState::Completed, TaskState::Failed, TaskState::Cancelled] {
            self.add_hook(TransitionHook {
                name: "release-resources".into(),
                state,
                timing: HookTiming::After,
                priority: 100,
                predicate: None,
                action: Arc::new(|task, context, env| {
                    env.resources.release(task.id);
                    context.allocated_resources.clear();
                    Ok(())
                }),
            });
        }

        self.add_hook(TransitionHook {
            name: "validate-preconditions".into(),
            state: TaskState::Starting,
            timing: HookTiming::Before,
            priority: 90,
            predicate: Some(Arc::new(|task, _| !task.pre_conditions.is_empty())),
            action: Arc::new(|task, context, env| {
                let mut failed = Vec::new();
                for id in &task.pre_conditions {
                    let ok = env.conditions.evaluate(id, task);
                    context.pre_condition_status.insert(id.clone(), ok);
                    if !ok {
                        failed.push(id.clone());
                    }
                }
                if failed.is_empty() {
                    Ok(())
                } else {
                    Err(Error::validation(format!(
                        "preconditions failed: {}",
                        failed.join(", ")
                    )))
                }
            }),
        });

        self.add_hook(TransitionHook {
            name: "validate-postconditions".into(),
            state: TaskState::Completing,
            timing: HookTiming::Before,
            priority: 90,
            predicate: Some(Arc::new(|task, _| !task.post_conditions.is_empty())),
            action: Arc::new(|task, context, env| {
                let mut failed = Vec::new();
                for id in &task.post_conditions {
                    let ok = env.conditions.evaluate(id, task);
                    context.post_condition_status.insert(id.clone(), ok);
                    if !ok {
                        failed.push(id.clone());
                    }
                }
                if failed.is_empty() {
                    Ok(())
                } else {
                    Err(Error::validation(format!(
                        "postconditions failed: {}",
                        failed.join(", ")
                    )))
                }
            }),
        });
    }

    #[cfg(test)]
    pub(crate) fn lock_for_test(&mut self, task_id: TaskId) {
        self.in_flight.insert(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskCategory, TaskSubmission};
    use uuid::Uuid;

    fn task() -> Task {
        Task::from_submission(
            &TaskSubmission::new("lifecycle test", TaskCategory::Testing),
            Uuid::new_v4(),
        )
    }

    fn env<'a>(
        resources: &'a mut ResourcePool,
        conditions: &'a ConditionRegistry,
    ) -> HookEnv<'a> {
        HookEnv {
            resources,
            conditions,
        }
    }

    fn drive(
        manager: &mut LifecycleManager,
        task: &mut Task,
        states: &[TaskState],
        env: &mut HookEnv<'_>,
    ) {
        for &state in states {
            manager.transition(task, state, "test", env).unwrap();
        }
    }

    const DISPATCH_CHAIN: &[TaskState] = &[
        TaskState::Validated,
        TaskState::Queued,
        TaskState::Scheduled,
        TaskState::Preparing,
        TaskState::ResourceAllocated,
        TaskState::Starting,
        TaskState::Running,
    ];

    #[test]
    fn happy_path_reaches_completed() {
        let mut manager = LifecycleManager::new(100);
        let mut resources = ResourcePool::new();
        let conditions = ConditionRegistry::new();
        let mut task = task();
        manager.register(task.id);

        let mut env = env(&mut resources, &conditions);
        drive(&mut manager, &mut task, DISPATCH_CHAIN, &mut env);
        drive(
            &mut manager,
            &mut task,
            &[TaskState::Completing, TaskState::Completed],
            &mut env,
        );

        let ctx = manager.context(task.id).unwrap();
        assert_eq!(ctx.state, TaskState::Completed);
        assert_eq!(ctx.attempts, 1);
        assert!(ctx.execution_start.is_some());
        assert!(ctx.total_duration_ms.is_some());
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn state_always_matches_last_event() {
        let mut manager = LifecycleManager::new(100);
        let mut resources = ResourcePool::new();
        let conditions = ConditionRegistry::new();
        let mut task = task();
        manager.register(task.id);

        let mut env = env(&mut resources, &conditions);
        drive(&mut manager, &mut task, DISPATCH_CHAIN, &mut env);

        let ctx = manager.context(task.id).unwrap();
        assert_eq!(ctx.state, ctx.events.back().unwrap().to);
        assert_eq!(task.status, ctx.state);
    }

    #[test]
    fn illegal_transition_is_rejected_and_state_unchanged() {
        let mut manager = LifecycleManager::new(100);
        let mut resources = ResourcePool::new();
        let conditions = ConditionRegistry::new();
        let mut task = task();
        manager.register(task.id);

        let mut env = env(&mut resources, &conditions);
        let err = manager
            .transition(&mut task, TaskState::Running, "skip ahead", &mut env)
            .unwrap_err();
        assert!(matches!(err, Error::Transition { .. }));
        assert_eq!(manager.context(task.id).unwrap().state, TaskState::Created);
        assert_eq!(task.status, TaskState::Created);
    }

    #[test]
    fn terminal_states_only_leave_to_archived() {
        use TaskState::{Archived, Cancelled, Completed, Queued, Running};
        assert!(is_legal_transition(Completed, Archived));
        assert!(is_legal_transition(Cancelled, Archived));
        assert!(!is_legal_transition(Completed, Running));
        assert!(!is_legal_transition(Completed, Queued));
        assert!(!is_legal_transition(Cancelled, Queued));
        assert!(!is_legal_transition(Archived, Queued));
        // Failed is special: the retry/rollback edges exist.
        assert!(is_legal_transition(TaskState::Failed, TaskState::Retrying));
        assert!(is_legal_transition(TaskState::Failed, TaskState::RollingBack));
        assert!(is_legal_transition(TaskState::Failed, Archived));
        assert!(!is_legal_transition(TaskState::Failed, Running));
    }

    #[test]
    fn blocked_and_expired_are_non_terminal_detours() {
        let mut manager = LifecycleManager::new(100);
        let mut resources = ResourcePool::new();
        let conditions = ConditionRegistry::new();
        let mut task = task();
        manager.register(task.id);

        let mut env = env(&mut resources, &conditions);
        drive(&mut manager, &mut task, DISPATCH_CHAIN, &mut env);

        // A running task can block and come back.
        manager
            .transition(&mut task, TaskState::Blocked, "waiting on io", &mut env)
            .unwrap();
        assert!(!TaskState::Blocked.is_terminal());
        manager
            .transition(&mut task, TaskState::Running, "unblocked", &mut env)
            .unwrap();

        // An expired run falls through to Failed.
        manager
            .transition(&mut task, TaskState::Expired, "window elapsed", &mut env)
            .unwrap();
        assert!(!TaskState::Expired.is_terminal());
        manager
            .transition(&mut task, TaskState::Failed, "expired", &mut env)
            .unwrap();
        assert!(manager.context(task.id).unwrap().state.is_terminal());
    }

    #[test]
    fn busy_task_fails_fast() {
        let mut manager = LifecycleManager::new(100);
        let mut resources = ResourcePool::new();
        let conditions = ConditionRegistry::new();
        let mut task = task();
        manager.register(task.id);
        manager.lock_for_test(task.id);

        let mut env = env(&mut resources, &conditions);
        let err = manager
            .transition(&mut task, TaskState::Validated, "busy", &mut env)
            .unwrap_err();
        assert!(matches!(err, Error::TransitionBusy { .. }));
    }

    #[test]
    fn allocate_hook_reserves_and_release_hook_frees() {
        let mut manager = LifecycleManager::new(100);
        let mut resources = ResourcePool::new();
        resources.set_capacity("cpu", 1);
        let conditions = ConditionRegistry::new();

        let mut task = task();
        task.required_resources.insert("cpu".into());
        manager.register(task.id);

        let mut env = env(&mut resources, &conditions);
        drive(&mut manager, &mut task, DISPATCH_CHAIN, &mut env);
        assert_eq!(env.resources.available("cpu"), 0);
        assert_eq!(
            manager.context(task.id).unwrap().allocated_resources,
            vec!["cpu".to_string()]
        );

        drive(
            &mut manager,
            &mut task,
            &[TaskState::Completing, TaskState::Completed],
            &mut env,
        );
        assert_eq!(env.resources.available("cpu"), 1);
        assert!(manager.context(task.id).unwrap().allocated_resources.is_empty());
    }

    #[test]
    fn failing_precondition_blocks_starting() {
        let mut manager = LifecycleManager::new(100);
        let mut resources = ResourcePool::new();
        let mut conditions = ConditionRegistry::new();
        conditions.register("inputs-ready", Arc::new(|_| false));

        let mut task = task();
        task.pre_conditions.push("inputs-ready".into());
        manager.register(task.id);

        let mut env = HookEnv {
            resources: &mut resources,
            conditions: &conditions,
        };
        drive(
            &mut manager,
            &mut task,
            &[
                TaskState::Validated,
                TaskState::Queued,
                TaskState::Scheduled,
                TaskState::Preparing,
                TaskState::ResourceAllocated,
            ],
            &mut env,
        );
        let err = manager
            .transition(&mut task, TaskState::Starting, "start", &mut env)
            .unwrap_err();
        assert!(matches!(err, Error::Transition { .. }));
        assert_eq!(
            manager.context(task.id).unwrap().state,
            TaskState::ResourceAllocated
        );
        assert!(!manager.context(task.id).unwrap().pre_condition_status["inputs-ready"]);
    }

    #[test]
    fn unknown_condition_id_evaluates_false() {
        let mut manager = LifecycleManager::new(100);
        let mut resources = ResourcePool::new();
        let conditions = ConditionRegistry::new();

        let mut task = task();
        task.pre_conditions.push("never-registered".into());
        manager.register(task.id);

        let mut env = env(&mut resources, &conditions);
        drive(
            &mut manager,
            &mut task,
            &[
                TaskState::Validated,
                TaskState::Queued,
                TaskState::Scheduled,
                TaskState::Preparing,
                TaskState::ResourceAllocated,
            ],
            &mut env,
        );
        assert!(
            manager
                .transition(&mut task, TaskState::Starting, "start", &mut env)
                .is_err()
        );
    }

    #[test]
    fn event_log_is_bounded() {
        let mut manager = LifecycleManager::new(3);
        let mut resources = ResourcePool::new();
        let conditions = ConditionRegistry::new();
        let mut task = task();
        manager.register(task.id);

        let mut env = env(&mut resources, &conditions);
        drive(&mut manager, &mut task, DISPATCH_CHAIN, &mut env);

        let log = manager.event_log(task.id);
        assert_eq!(log.len(), 3);
        assert_eq!(log.last().unwrap().to, TaskState::Running);
    }

    #[test]
    fn replaying_a_transition_sequence_is_deterministic() {
        let run = || {
            let mut manager = LifecycleManager::new(100);
            let mut resources = ResourcePool::new();
            let conditions = ConditionRegistry::new();
            let mut task = task();
            task.id = Uuid::nil();
            manager.register(task.id);
            let mut env = HookEnv {
                resources: &mut resources,
                conditions: &conditions,
            };
            for &state in DISPATCH_CHAIN {
                manager.transition(&mut task, state, "replay", &mut env).unwrap();
            }
            let ctx = manager.context(task.id).unwrap();
            (
                ctx.state,
                ctx.attempts,
                ctx.previous_states.clone(),
                ctx.events.iter().map(|e| (e.from, e.to)).collect::<Vec<_>>(),
            )
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn hooks_run_in_priority_order() {
        use std::sync::Mutex;
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut manager = LifecycleManager::new(100);
        for (name, priority) in [("low", 1), ("high", 50)] {
            let order = Arc::clone(&order);
            manager.add_hook(TransitionHook {
                name: name.into(),
                state: TaskState::Validated,
                timing: HookTiming::Before,
                priority,
                predicate: None,
                action: Arc::new(move |_, _, _| {
                    order.lock().unwrap().push(name);
                    Ok(())
                }),
            });
        }

        let mut resources = ResourcePool::new();
        let conditions = ConditionRegistry::new();
        let mut task = task();
        manager.register(task.id);
        let mut env = env(&mut resources, &conditions);
        manager
            .transition(&mut task, TaskState::Validated, "hooks", &mut env)
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }

    #[test]
    fn restore_rebinds_event_tail() {
        let mut manager = LifecycleManager::new(100);
        let id = Uuid::new_v4();
        let mut context = LifecycleContext::new(id);
        context.state = TaskState::Completed;
        let events = vec![LifecycleEvent {
            from: TaskState::Completing,
            to: TaskState::Completed,
            at: Utc::now(),
            trigger: "restore".into(),
            metadata: BTreeMap::new(),
        }];
        manager.restore_context(context, events);

        let restored = manager.context(id).unwrap();
        assert_eq!(restored.state, TaskState::Completed);
        assert_eq!(restored.events.len(), 1);
    }
}
