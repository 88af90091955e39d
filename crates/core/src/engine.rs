//! The engine: public API handle plus the scheduler task.
//!
//! All mutable engine state (tasks, graph, priorities, resources, lifecycle
//! contexts) is owned by one tokio task. The [`Engine`] handle talks to it
//! over a command channel with oneshot replies; workers report back over a
//! second channel. The scheduler task suspends only at the tick, on worker
//! messages, and on API commands, so every mutation commits in one place.

use crate::breakdown::{Breakdown, SubtaskDependency};
use crate::config::EngineConfig;
use crate::lifecycle::{
    ConditionRegistry, HookEnv, LifecycleContext, LifecycleEvent, LifecycleManager, TaskState,
};
use crate::metrics::EngineMetrics;
use crate::persistence::{
    PersistenceEngine, RecoveryInfo, Snapshot, SnapshotInfo, TaskEventLog, SNAPSHOT_VERSION,
};
use crate::priority::{AdjustmentContext, PriorityComputer, PriorityDecision, PriorityAlgorithm};
use crate::resources::ResourcePool;
use crate::scheduler::{Scheduler, SchedulerContext, SchedulingPolicy};
use crate::supervisor::{
    retry_backoff_from, ExecutionSupervisor, TaskExecutor, WorkerMessage, WorkerOutcome,
};
use crate::task::{BasePriority, Task, TaskCategory, TaskId, TaskSubmission};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use taskforge_events::{
    EngineEvent, EventBus, EventCategory, EventFilter, EventSender, PersistenceEvent, QueueEvent,
    ResourceEvent, SystemEvent, TaskEvent,
};
use taskforge_graph::{DependencyEdge, DependencyGraph, DependencyImpact, EdgeKind};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// Public response types
// ============================================================================

/// What `submit` returns.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    /// The new task's id.
    pub task_id: TaskId,
    /// Heuristic start estimate.
    pub estimated_start: DateTime<Utc>,
    /// Heuristic completion estimate.
    pub estimated_completion: DateTime<Utc>,
    /// Number of higher-priority tasks currently ahead in the queue.
    pub queue_position: usize,
}

/// Full status of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    /// The task record.
    pub task: Task,
    /// Direct dependencies with edge kinds.
    pub dependencies: Vec<(TaskId, EdgeKind)>,
    /// Direct dependents with edge kinds.
    pub dependents: Vec<(TaskId, EdgeKind)>,
    /// Execution attempts so far.
    pub attempts: u32,
    /// Bounded lifecycle event tail, oldest first.
    pub recent_events: Vec<LifecycleEvent>,
    /// Audit trail of the last priority computation.
    pub priority_decision: Option<PriorityDecision>,
}

/// Compact task listing entry.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    /// Task id.
    pub id: TaskId,
    /// Title.
    pub title: String,
    /// Category.
    pub category: TaskCategory,
    /// Priority band.
    pub base_priority: BasePriority,
    /// Current dynamic priority.
    pub dynamic_priority: i64,
    /// Lifecycle state.
    pub status: TaskState,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Failures so far.
    pub retry_count: u32,
    /// Progress in `[0, 100]`.
    pub progress: f64,
    /// Last failure message.
    pub last_error: Option<String>,
}

/// Status query filter. Empty filters match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    /// Restrict to these states.
    pub states: Option<Vec<TaskState>>,
    /// Restrict to these categories.
    pub categories: Option<Vec<TaskCategory>>,
    /// Restrict to these priority bands.
    pub priorities: Option<Vec<BasePriority>>,
    /// Only tasks created at or after this time.
    pub created_after: Option<DateTime<Utc>>,
    /// Only tasks created before this time.
    pub created_before: Option<DateTime<Utc>>,
    /// Pagination offset.
    pub offset: usize,
    /// Pagination limit; `None` returns everything from `offset`.
    pub limit: Option<usize>,
}

/// Query result page.
#[derive(Debug, Clone, Serialize)]
pub struct TaskQueryResponse {
    /// Matching tasks before pagination.
    pub total: usize,
    /// The requested page, ordered by submission time.
    pub tasks: Vec<TaskSummary>,
}

/// Health grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// All components nominal.
    Healthy,
    /// Degraded but operating.
    Warning,
    /// A component needs attention.
    Critical,
}

impl HealthStatus {
    /// Lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// One component's health.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    /// Grade.
    pub status: HealthStatus,
    /// Optional detail.
    pub message: Option<String>,
}

/// Engine-wide health report.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    /// Worst component grade.
    pub overall: HealthStatus,
    /// Per-component grades.
    pub components: BTreeMap<String, ComponentHealth>,
    /// Aggregate metrics at report time.
    pub metrics: EngineMetrics,
}

// ============================================================================
// Commands
// ============================================================================

type ConditionPredicate = Arc<dyn Fn(&Task) -> bool + Send + Sync>;

enum Command {
    Submit {
        submission: Box<TaskSubmission>,
        executor: Option<Arc<dyn TaskExecutor>>,
        reply: oneshot::Sender<Result<SubmitReceipt>>,
    },
    BindExecutor {
        task_id: TaskId,
        executor: Arc<dyn TaskExecutor>,
        reply: oneshot::Sender<Result<bool>>,
    },
    AddDependency {
        edge: DependencyEdge,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveDependency {
        dependent: TaskId,
        depends_on: TaskId,
        reply: oneshot::Sender<Result<bool>>,
    },
    Cancel {
        task_id: TaskId,
        reason: Option<String>,
        reply: oneshot::Sender<Result<bool>>,
    },
    Pause {
        task_id: TaskId,
        reply: oneshot::Sender<Result<bool>>,
    },
    Resume {
        task_id: TaskId,
        reply: oneshot::Sender<Result<bool>>,
    },
    Retry {
        task_id: TaskId,
        reply: oneshot::Sender<Result<bool>>,
    },
    GetStatus {
        task_id: TaskId,
        reply: oneshot::Sender<Result<TaskStatus>>,
    },
    Query {
        query: Box<TaskQuery>,
        reply: oneshot::Sender<Result<TaskQueryResponse>>,
    },
    SystemHealth {
        reply: oneshot::Sender<Result<SystemHealth>>,
    },
    TakeSnapshot {
        description: Option<String>,
        reply: oneshot::Sender<Result<Uuid>>,
    },
    Restore {
        snapshot_id: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    ListSnapshots {
        reply: oneshot::Sender<Result<Vec<SnapshotInfo>>>,
    },
    RecoveryInfo {
        reply: oneshot::Sender<Result<RecoveryInfo>>,
    },
    SetPriorityAlgorithm {
        algorithm: Box<dyn PriorityAlgorithm>,
        reply: oneshot::Sender<Result<()>>,
    },
    SetSchedulingPolicy {
        policy: SchedulingPolicy,
        reply: oneshot::Sender<Result<()>>,
    },
    RegisterCondition {
        id: String,
        predicate: ConditionPredicate,
        reply: oneshot::Sender<Result<()>>,
    },
    SetBreakdown {
        collaborator: Arc<dyn Breakdown>,
        reply: oneshot::Sender<Result<()>>,
    },
    CriticalPath {
        reply: oneshot::Sender<Result<Vec<TaskId>>>,
    },
    ParallelGroups {
        reply: oneshot::Sender<Result<Vec<Vec<TaskId>>>>,
    },
    DependencyImpact {
        task_id: TaskId,
        reply: oneshot::Sender<Result<DependencyImpact>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// Engine handle
// ============================================================================

/// Clonable, transport-agnostic handle to a running engine.
#[derive(Clone)]
pub struct Engine {
    cmd_tx: mpsc::UnboundedSender<Command>,
    bus: Arc<EventBus>,
    subscriptions: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
    scheduler_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Engine {
    /// Start an engine. Must be called inside a tokio runtime.
    ///
    /// When `recover_on_start` is set and a valid snapshot exists under the
    /// persistence directory, state is restored from it and orphaned
    /// `Running` tasks are failed with reason "orphaned on restart".
    pub async fn start(config: EngineConfig) -> Result<Self> {
        let session_id = Uuid::new_v4();
        let bus = Arc::new(EventBus::new());
        let persistence = PersistenceEngine::new(config.persistence.clone(), session_id)?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();

        let mut state = EngineState::new(config, session_id, &bus, persistence, worker_tx);
        if state.config.recover_on_start {
            if let Some(snapshot) = state.persistence.load_latest_valid() {
                info!(snapshot = %snapshot.id, tasks = snapshot.tasks.len(), "recovering from snapshot");
                state.restore_snapshot(snapshot);
            }
        }

        let handle = tokio::spawn(scheduler_loop(state, cmd_rx, worker_rx));
        Ok(Self {
            cmd_tx,
            bus,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            scheduler_handle: Arc::new(Mutex::new(Some(handle))),
        })
    }

    async fn request<T>(&self, command: Command, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        self.cmd_tx.send(command).map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Submit a task together with its executor callback.
    pub async fn submit(
        &self,
        submission: TaskSubmission,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<SubmitReceipt> {
        let (tx, rx) = oneshot::channel();
        self.request(
            Command::Submit {
                submission: Box::new(submission),
                executor: Some(executor),
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Submit a task without an executor. It stays queued until
    /// [`Engine::bind_executor`] provides one.
    pub async fn submit_unbound(&self, submission: TaskSubmission) -> Result<SubmitReceipt> {
        let (tx, rx) = oneshot::channel();
        self.request(
            Command::Submit {
                submission: Box::new(submission),
                executor: None,
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Bind (or rebind, after a restore) an executor to a task.
    /// Returns `false` when the task is unknown.
    pub async fn bind_executor(
        &self,
        task_id: TaskId,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.request(
            Command::BindExecutor {
                task_id,
                executor,
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Install a dependency edge between two submitted tasks.
    pub async fn add_dependency(&self, edge: DependencyEdge) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::AddDependency { edge, reply: tx }, rx).await
    }

    /// Remove the edge between a pair. `false` when no edge existed.
    pub async fn remove_dependency(&self, dependent: TaskId, depends_on: TaskId) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.request(
            Command::RemoveDependency {
                dependent,
                depends_on,
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Cancel a task; hard dependents are cancelled with reason
    /// "dependency failure", soft dependents are left in place.
    pub async fn cancel(&self, task_id: TaskId, reason: Option<String>) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.request(
            Command::Cancel {
                task_id,
                reason,
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Cooperatively pause a running task.
    pub async fn pause(&self, task_id: TaskId) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Pause { task_id, reply: tx }, rx).await
    }

    /// Resume a paused task.
    pub async fn resume(&self, task_id: TaskId) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Resume { task_id, reply: tx }, rx).await
    }

    /// Re-queue a terminally failed task.
    pub async fn retry(&self, task_id: TaskId) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Retry { task_id, reply: tx }, rx).await
    }

    /// Full status of one task.
    pub async fn get_status(&self, task_id: TaskId) -> Result<TaskStatus> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::GetStatus { task_id, reply: tx }, rx).await
    }

    /// Filtered, paginated task listing.
    pub async fn query(&self, query: TaskQuery) -> Result<TaskQueryResponse> {
        let (tx, rx) = oneshot::channel();
        self.request(
            Command::Query {
                query: Box::new(query),
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Engine-wide health report.
    pub async fn system_health(&self) -> Result<SystemHealth> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::SystemHealth { reply: tx }, rx).await
    }

    /// Take a snapshot now. Returns its id.
    pub async fn snapshot(&self, description: Option<String>) -> Result<Uuid> {
        let (tx, rx) = oneshot::channel();
        self.request(
            Command::TakeSnapshot {
                description,
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Replace the live state with a snapshot from disk.
    pub async fn restore(&self, snapshot_id: Uuid) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(
            Command::Restore {
                snapshot_id,
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Every snapshot on disk, newest first.
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::ListSnapshots { reply: tx }, rx).await
    }

    /// What recovery has to work with.
    pub async fn recovery_info(&self) -> Result<RecoveryInfo> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::RecoveryInfo { reply: tx }, rx).await
    }

    /// Swap the priority algorithm.
    pub async fn set_priority_algorithm(
        &self,
        algorithm: Box<dyn PriorityAlgorithm>,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(
            Command::SetPriorityAlgorithm {
                algorithm,
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Switch the scheduling policy.
    pub async fn set_scheduling_policy(&self, policy: SchedulingPolicy) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::SetSchedulingPolicy { policy, reply: tx }, rx)
            .await
    }

    /// Register a named predicate referenced by task pre/post-conditions.
    pub async fn register_condition(
        &self,
        id: impl Into<String>,
        predicate: ConditionPredicate,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(
            Command::RegisterCondition {
                id: id.into(),
                predicate,
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Install the breakdown collaborator.
    pub async fn set_breakdown(&self, collaborator: Arc<dyn Breakdown>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::SetBreakdown { collaborator, reply: tx }, rx)
            .await
    }

    /// Longest estimated-duration chain through the graph.
    pub async fn critical_path(&self) -> Result<Vec<TaskId>> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::CriticalPath { reply: tx }, rx).await
    }

    /// Hard-dependency layering of the graph.
    pub async fn parallel_groups(&self) -> Result<Vec<Vec<TaskId>>> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::ParallelGroups { reply: tx }, rx).await
    }

    /// Dependency impact of one task.
    pub async fn dependency_impact(&self, task_id: TaskId) -> Result<DependencyImpact> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::DependencyImpact { task_id, reply: tx }, rx)
            .await
    }

    /// Subscribe to engine events through a filter. Returns the
    /// subscription id and the receiving end of the stream.
    pub fn subscribe(
        &self,
        filter: EventFilter,
    ) -> (Uuid, mpsc::UnboundedReceiver<EngineEvent>) {
        let mut bus_rx = self.bus.subscribe_filtered(filter);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            while let Some(event) = bus_rx.recv().await {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        let id = Uuid::new_v4();
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.insert(id, handle);
        }
        (id, rx)
    }

    /// Tear down a subscription. `false` when the id is unknown.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let Ok(mut subscriptions) = self.subscriptions.lock() else {
            return false;
        };
        match subscriptions.remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Stop the engine: abort workers, take a final snapshot, emit
    /// `system.shutdown`, and join the scheduler task.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown { reply: tx })
            .map_err(|_| Error::Shutdown)?;
        let _ = rx.await;

        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            for (_, handle) in subscriptions.drain() {
                handle.abort();
            }
        }
        let handle = self
            .scheduler_handle
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.bus.shutdown();
        Ok(())
    }
}

// ============================================================================
// Scheduler task
// ============================================================================

async fn scheduler_loop(
    mut state: EngineState,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut worker_rx: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    let mut tick = tokio::time::interval(state.config.tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut autosave = tokio::time::interval(state.config.persistence.autosave_interval);
    autosave.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Both intervals fire immediately; swallow the initial ticks.
    tick.tick().await;
    autosave.tick().await;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Shutdown { reply }) => {
                    state.shutdown();
                    let _ = reply.send(());
                    break;
                }
                Some(cmd) => {
                    state.handle_command(cmd);
                    state.dispatch();
                }
                None => {
                    state.shutdown();
                    break;
                }
            },
            msg = worker_rx.recv() => {
                if let Some(msg) = msg {
                    state.handle_worker_message(msg);
                    state.dispatch();
                }
            }
            _ = tick.tick() => {
                state.on_tick();
                state.dispatch();
            }
            _ = autosave.tick() => {
                if let Err(err) = state.take_snapshot("autosave") {
                    warn!(error = %err, "autosave failed");
                }
            }
        }
    }
    debug!("scheduler task exited");
}

// ============================================================================
// Engine state (owned by the scheduler task)
// ============================================================================

struct EngineState {
    config: EngineConfig,
    session_id: Uuid,
    tasks: HashMap<TaskId, Task>,
    executors: HashMap<TaskId, Arc<dyn TaskExecutor>>,
    graph: DependencyGraph,
    lifecycle: LifecycleManager,
    conditions: ConditionRegistry,
    resources: ResourcePool,
    priority: PriorityComputer,
    scheduler: Scheduler,
    supervisor: ExecutionSupervisor,
    persistence: PersistenceEngine,
    metrics: EngineMetrics,
    events: EventSender,
    breakdown: Option<Arc<dyn Breakdown>>,
    pending_cancel: HashMap<TaskId, String>,
    structure_version: u64,
    priorities_stale: bool,
    last_recompute: Instant,
}

impl EngineState {
    fn new(
        config: EngineConfig,
        session_id: Uuid,
        bus: &Arc<EventBus>,
        persistence: PersistenceEngine,
        worker_tx: mpsc::UnboundedSender<WorkerMessage>,
    ) -> Self {
        let resources = ResourcePool::with_capacities(&config.resources);
        let priority = PriorityComputer::new(
            config.priority_weights,
            config.max_starvation_time,
            config.max_priority_boost,
        );
        let supervisor = ExecutionSupervisor::new(
            config.max_concurrent_tasks,
            config.execution_grace,
            worker_tx,
        );
        let lifecycle = LifecycleManager::new(config.max_history_per_task);
        Self {
            lifecycle,
            conditions: ConditionRegistry::new(),
            resources,
            priority,
            scheduler: Scheduler::new(SchedulingPolicy::HybridAdaptive),
            supervisor,
            persistence,
            metrics: EngineMetrics::default(),
            events: bus.sender(),
            breakdown: None,
            pending_cancel: HashMap::new(),
            structure_version: 0,
            priorities_stale: false,
            last_recompute: Instant::now(),
            tasks: HashMap::new(),
            executors: HashMap::new(),
            graph: DependencyGraph::new(),
            session_id,
            config,
        }
    }

    fn emit(&self, category: EventCategory) {
        let _ = self.events.send(EngineEvent::new(category));
    }

    fn system_load(&self) -> f64 {
        self.supervisor.running() as f64 / self.config.max_concurrent_tasks.max(1) as f64
    }

    fn schedulable_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status.is_schedulable())
            .count()
    }

    fn avg_wait_ms(&self, now: DateTime<Utc>) -> f64 {
        let waits: Vec<i64> = self
            .tasks
            .values()
            .filter(|t| t.status.is_schedulable())
            .map(|t| (now - t.created_at).num_milliseconds().max(0))
            .collect();
        if waits.is_empty() {
            0.0
        } else {
            waits.iter().sum::<i64>() as f64 / waits.len() as f64
        }
    }

    fn bump_structure(&mut self) {
        self.structure_version += 1;
        self.priority.invalidate();
        self.priorities_stale = true;
    }

    // ------------------------------------------------------------------
    // Command handling
    // ------------------------------------------------------------------

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit {
                submission,
                executor,
                reply,
            } => {
                let _ = reply.send(self.submit_task(*submission, executor, true));
            }
            Command::BindExecutor {
                task_id,
                executor,
                reply,
            } => {
                let known = self.tasks.contains_key(&task_id);
                if known {
                    self.executors.insert(task_id, executor);
                }
                let _ = reply.send(Ok(known));
            }
            Command::AddDependency { edge, reply } => {
                let result = self
                    .graph
                    .add_dependency(edge)
                    .map_err(Error::from)
                    .map(|()| self.bump_structure());
                let _ = reply.send(result);
            }
            Command::RemoveDependency {
                dependent,
                depends_on,
                reply,
            } => {
                let removed = self.graph.remove_dependency(dependent, depends_on);
                if removed {
                    self.bump_structure();
                }
                let _ = reply.send(Ok(removed));
            }
            Command::Cancel {
                task_id,
                reason,
                reply,
            } => {
                let reason = reason.unwrap_or_else(|| "cancelled by caller".to_string());
                let _ = reply.send(Ok(self.cancel_task(task_id, &reason)));
            }
            Command::Pause { task_id, reply } => {
                let _ = reply.send(Ok(self.pause_task(task_id)));
            }
            Command::Resume { task_id, reply } => {
                let _ = reply.send(Ok(self.resume_task(task_id)));
            }
            Command::Retry { task_id, reply } => {
                let _ = reply.send(Ok(self.retry_task(task_id)));
            }
            Command::GetStatus { task_id, reply } => {
                let _ = reply.send(self.status_of(task_id));
            }
            Command::Query { query, reply } => {
                let _ = reply.send(Ok(self.query_tasks(&query)));
            }
            Command::SystemHealth { reply } => {
                let _ = reply.send(Ok(self.system_health()));
            }
            Command::TakeSnapshot { description, reply } => {
                let reason = description.unwrap_or_else(|| "requested".to_string());
                let _ = reply.send(self.take_snapshot(&reason));
            }
            Command::Restore { snapshot_id, reply } => {
                let result = self
                    .persistence
                    .load_by_id(snapshot_id)
                    .map(|snapshot| self.restore_snapshot(snapshot));
                let _ = reply.send(result);
            }
            Command::ListSnapshots { reply } => {
                let _ = reply.send(Ok(self.persistence.list_snapshots()));
            }
            Command::RecoveryInfo { reply } => {
                let _ = reply.send(Ok(self.persistence.recovery_info(Utc::now())));
            }
            Command::SetPriorityAlgorithm { algorithm, reply } => {
                self.priority.set_algorithm(algorithm);
                self.priorities_stale = true;
                let _ = reply.send(Ok(()));
            }
            Command::SetSchedulingPolicy { policy, reply } => {
                self.scheduler.set_policy(policy);
                let _ = reply.send(Ok(()));
            }
            Command::RegisterCondition { id, predicate, reply } => {
                self.conditions.register(id, predicate);
                let _ = reply.send(Ok(()));
            }
            Command::SetBreakdown { collaborator, reply } => {
                self.breakdown = Some(collaborator);
                let _ = reply.send(Ok(()));
            }
            Command::CriticalPath { reply } => {
                let path = self.graph.critical_path(|id| self.estimated_ms(id));
                let _ = reply.send(Ok(path));
            }
            Command::ParallelGroups { reply } => {
                let _ = reply.send(Ok(self.graph.parallel_groups()));
            }
            Command::DependencyImpact { task_id, reply } => {
                let result = self
                    .graph
                    .dependency_impact(task_id, |id| self.estimated_ms(id))
                    .map_err(Error::from);
                let _ = reply.send(result);
            }
            Command::Shutdown { .. } => unreachable!("handled by the scheduler loop"),
        }
    }

    fn estimated_ms(&self, id: TaskId) -> u64 {
        self.tasks
            .get(&id)
            .map_or(1, |t| t.estimated_duration_ms.max(1))
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    fn submit_task(
        &mut self,
        submission: TaskSubmission,
        executor: Option<Arc<dyn TaskExecutor>>,
        allow_breakdown: bool,
    ) -> Result<SubmitReceipt> {
        submission.validate()?;
        for declared in &submission.dependencies {
            if !self.tasks.contains_key(&declared.depends_on) {
                return Err(Error::Dependency(taskforge_graph::Error::UnknownTask {
                    task: declared.depends_on,
                }));
            }
        }

        let mut task = Task::from_submission(&submission, self.session_id);

        // Backpressure: admit anyway, at depressed priority.
        let depth = self.schedulable_count();
        if depth > self.config.queue_size_critical
            && self.system_load() > self.config.backpressure_load_threshold
        {
            task.dynamic_priority = (task.dynamic_priority / 2).max(crate::priority::MIN_PRIORITY);
            self.emit(EventCategory::Queue(QueueEvent::Backpressure { depth }));
        }

        let task_id = task.id;
        let title = task.title.clone();
        let category = task.category;
        self.graph.add_task(task_id);
        self.lifecycle.register(task_id);
        self.tasks.insert(task_id, task);
        if let Some(executor) = executor {
            self.executors.insert(task_id, executor);
        }

        for declared in &submission.dependencies {
            let edge = DependencyEdge::new(task_id, declared.depends_on, declared.kind);
            if let Err(err) = self.graph.add_dependency(edge) {
                // Roll the task back out; the edge was not installed.
                self.graph.remove_task(task_id);
                self.tasks.remove(&task_id);
                self.executors.remove(&task_id);
                self.lifecycle.remove(task_id);
                return Err(err.into());
            }
        }

        self.metrics.record_submitted();
        self.transition(task_id, TaskState::Validated, "submit")?;
        self.transition(task_id, TaskState::Queued, "admit")?;
        self.bump_structure();
        self.emit(EventCategory::Task(TaskEvent::Submitted {
            task_id,
            title,
            category: category.as_str().to_string(),
        }));

        if allow_breakdown
            && let (Some(collaborator), Some(threshold)) =
                (self.breakdown.clone(), self.config.breakdown_threshold_ms)
            && self
                .tasks
                .get(&task_id)
                .is_some_and(|t| t.estimated_duration_ms > threshold)
        {
            self.apply_breakdown(task_id, &collaborator);
        }

        Ok(self.receipt_for(task_id))
    }

    fn receipt_for(&self, task_id: TaskId) -> SubmitReceipt {
        let now = Utc::now();
        let Some(task) = self.tasks.get(&task_id) else {
            return SubmitReceipt {
                task_id,
                estimated_start: now,
                estimated_completion: now,
                queue_position: 0,
            };
        };
        let ahead = self
            .tasks
            .values()
            .filter(|t| {
                t.id != task_id
                    && t.status.is_schedulable()
                    && t.dynamic_priority > task.dynamic_priority
            })
            .count();
        let slots = self.config.max_concurrent_tasks.max(1);
        let mean_ms = {
            let estimates: Vec<u64> = self
                .tasks
                .values()
                .filter(|t| t.status.is_schedulable())
                .map(|t| t.estimated_duration_ms)
                .collect();
            if estimates.is_empty() {
                task.estimated_duration_ms
            } else {
                estimates.iter().sum::<u64>() / estimates.len() as u64
            }
        };
        let waves = (ahead / slots) as i64;
        let estimated_start = now + chrono::Duration::milliseconds(waves * mean_ms as i64);
        let estimated_completion =
            estimated_start + chrono::Duration::milliseconds(task.estimated_duration_ms as i64);
        SubmitReceipt {
            task_id,
            estimated_start,
            estimated_completion,
            queue_position: ahead,
        }
    }

    fn apply_breakdown(&mut self, parent_id: TaskId, collaborator: &Arc<dyn Breakdown>) {
        let plan = {
            let Some(parent) = self.tasks.get(&parent_id) else {
                return;
            };
            collaborator.breakdown(parent)
        };
        if plan.subtasks.is_empty() {
            return;
        }

        let mut dep_lists = Vec::with_capacity(plan.subtasks.len());
        let mut subtask_ids: Vec<Option<TaskId>> = Vec::with_capacity(plan.subtasks.len());
        for spec in plan.subtasks {
            dep_lists.push(spec.depends_on);
            let id = self
                .submit_task(spec.submission, Some(spec.executor), false)
                .map(|receipt| receipt.task_id);
            if let Err(err) = &id {
                warn!(parent = %parent_id, error = %err, "breakdown subtask rejected");
            }
            subtask_ids.push(id.ok());
        }

        for (index, deps) in dep_lists.iter().enumerate() {
            let Some(subtask_id) = subtask_ids[index] else {
                continue;
            };
            for (dependency, kind) in deps {
                let target = match dependency {
                    SubtaskDependency::Parent => Some(parent_id),
                    SubtaskDependency::Sibling(i) => subtask_ids.get(*i).copied().flatten(),
                    SubtaskDependency::Existing(id) => Some(*id),
                };
                if let Some(target) = target
                    && let Err(err) =
                        self.graph
                            .add_dependency(DependencyEdge::new(subtask_id, target, *kind))
                {
                    warn!(subtask = %subtask_id, error = %err, "breakdown edge rejected");
                }
            }
        }
        for index in plan.parent_depends_on {
            if let Some(Some(subtask_id)) = subtask_ids.get(index)
                && let Err(err) = self
                    .graph
                    .add_dependency(DependencyEdge::hard(parent_id, *subtask_id))
            {
                warn!(parent = %parent_id, error = %err, "breakdown parent edge rejected");
            }
        }
        self.bump_structure();
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    fn transition(
        &mut self,
        task_id: TaskId,
        to: TaskState,
        trigger: &str,
    ) -> Result<LifecycleEvent> {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return Err(Error::not_found(format!("task {task_id}")));
        };
        let mut env = HookEnv {
            resources: &mut self.resources,
            conditions: &self.conditions,
        };
        match self.lifecycle.transition(task, to, trigger, &mut env) {
            Ok(event) => {
                self.metrics.record_transition(event.from, event.to);
                self.emit(EventCategory::Task(TaskEvent::StateTransition {
                    task_id,
                    from: event.from.as_str().to_string(),
                    to: event.to.as_str().to_string(),
                    trigger: trigger.to_string(),
                }));
                Ok(event)
            }
            Err(err) => {
                if let Error::Transition {
                    from, to, reason, ..
                } = &err
                {
                    self.emit(EventCategory::Task(TaskEvent::TransitionRejected {
                        task_id,
                        from: from.as_str().to_string(),
                        to: to.as_str().to_string(),
                        reason: reason.clone(),
                    }));
                }
                Err(err)
            }
        }
    }

    fn transition_reason(err: &Error) -> String {
        match err {
            Error::Transition { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn dispatch(&mut self) {
        let slots = self.supervisor.available_slots();
        if slots == 0 {
            return;
        }
        let bound: HashSet<TaskId> = self.executors.keys().copied().collect();
        let decision = {
            let ctx = SchedulerContext {
                now: Utc::now(),
                tasks: &self.tasks,
                graph: &self.graph,
                resources: &self.resources,
                bound_executors: &bound,
                system_load: self.system_load(),
            };
            self.scheduler.pick_next(slots, &ctx)
        };
        if decision.tasks.is_empty() {
            return;
        }
        self.emit(EventCategory::Queue(QueueEvent::Optimized {
            policy: decision.policy.clone(),
            considered: self.schedulable_count(),
            chosen: decision.tasks.len(),
        }));
        for task_id in decision.tasks {
            self.dispatch_one(task_id);
        }
    }

    fn dispatch_one(&mut self, task_id: TaskId) {
        let Some(status) = self.tasks.get(&task_id).map(|t| t.status) else {
            return;
        };
        if status == TaskState::Queued
            && self
                .transition(task_id, TaskState::Scheduled, "dispatch")
                .is_err()
        {
            return;
        }
        if self
            .transition(task_id, TaskState::Preparing, "dispatch")
            .is_err()
        {
            return;
        }
        if let Err(err) = self.transition(task_id, TaskState::ResourceAllocated, "allocate") {
            // The scheduler pre-checked availability, so this is abnormal.
            self.fail_task(task_id, &Self::transition_reason(&err));
            return;
        }
        let held: Vec<String> = self
            .resources
            .held_by(task_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        if !held.is_empty() {
            self.emit(EventCategory::Resources(ResourceEvent::Allocated {
                task_id,
                resources: held,
            }));
        }
        if let Err(err) = self.transition(task_id, TaskState::Starting, "start") {
            self.fail_task(task_id, &Self::transition_reason(&err));
            return;
        }
        if self.transition(task_id, TaskState::Running, "run").is_err() {
            return;
        }

        let Some(executor) = self.executors.get(&task_id).cloned() else {
            self.fail_task(task_id, "no executor bound");
            return;
        };
        let Some(task) = self.tasks.get(&task_id).cloned() else {
            return;
        };
        let upstream = self.upstream_outputs(task_id);
        self.supervisor.spawn(&task, executor, upstream);
    }

    fn upstream_outputs(&self, task_id: TaskId) -> BTreeMap<TaskId, serde_json::Value> {
        self.graph
            .hard_dependencies_of(task_id)
            .into_iter()
            .filter_map(|dep| {
                self.tasks.get(&dep).map(|task| {
                    let map: serde_json::Map<String, serde_json::Value> =
                        task.outputs.clone().into_iter().collect();
                    (dep, serde_json::Value::Object(map))
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Worker results
    // ------------------------------------------------------------------

    fn handle_worker_message(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Progress { task_id, progress } => {
                let Some(task) = self.tasks.get_mut(&task_id) else {
                    return;
                };
                if progress > task.progress {
                    task.progress = progress;
                    task.updated_at = Utc::now();
                    self.emit(EventCategory::Task(TaskEvent::Progress { task_id, progress }));
                }
            }
            WorkerMessage::Finished { task_id, outcome } => {
                self.handle_finished(task_id, outcome);
            }
        }
    }

    fn handle_finished(&mut self, task_id: TaskId, outcome: WorkerOutcome) {
        let Some(status) = self.tasks.get(&task_id).map(|t| t.status) else {
            self.supervisor.finish(task_id);
            return;
        };
        let active = matches!(
            status,
            TaskState::Running | TaskState::Paused | TaskState::Resuming | TaskState::Blocked
        );
        if !active {
            // Stale duplicate (e.g. soft timeout plus hard-deadline sweep).
            self.supervisor.finish(task_id);
            return;
        }

        match outcome {
            WorkerOutcome::Cancelled => {
                self.supervisor.finish(task_id);
                let reason = self
                    .pending_cancel
                    .remove(&task_id)
                    .unwrap_or_else(|| "cancelled".to_string());
                self.finalize_cancel(task_id, &reason);
            }
            WorkerOutcome::Success { output } => {
                self.normalize_to_running(task_id, status);
                self.complete_task(task_id, output);
            }
            WorkerOutcome::Failed { error } => {
                self.normalize_to_running(task_id, status);
                self.supervisor.finish(task_id);
                self.fail_task(task_id, &error);
            }
            WorkerOutcome::TimedOut => {
                self.normalize_to_running(task_id, status);
                self.supervisor.finish(task_id);
                self.fail_task(task_id, "Timeout");
            }
        }
    }

    /// A paused or blocked task whose worker finished anyway is first
    /// brought back to `Running` so the terminal edges apply.
    fn normalize_to_running(&mut self, task_id: TaskId, status: TaskState) {
        match status {
            TaskState::Paused => {
                let _ = self.transition(task_id, TaskState::Resuming, "finish");
                let _ = self.transition(task_id, TaskState::Running, "finish");
            }
            TaskState::Blocked => {
                let _ = self.transition(task_id, TaskState::Running, "unblock");
            }
            _ => {}
        }
    }

    fn complete_task(&mut self, task_id: TaskId, output: Option<serde_json::Value>) {
        if let Some(task) = self.tasks.get_mut(&task_id) {
            match output {
                Some(serde_json::Value::Object(map)) => {
                    task.outputs.extend(map);
                }
                Some(value) => {
                    task.outputs.insert("result".to_string(), value);
                }
                None => {}
            }
            task.progress = 100.0;
        }

        if let Err(err) = self.transition(task_id, TaskState::Completing, "complete") {
            // Postconditions rejected the completion; treat as a failure.
            self.supervisor.finish(task_id);
            self.fail_task(task_id, &Self::transition_reason(&err));
            return;
        }
        let held: Vec<String> = self
            .resources
            .held_by(task_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        if self
            .transition(task_id, TaskState::Completed, "complete")
            .is_err()
        {
            return;
        }
        if !held.is_empty() {
            self.emit(EventCategory::Resources(ResourceEvent::Released {
                task_id,
                resources: held,
            }));
        }
        let duration_ms = self
            .lifecycle
            .context(task_id)
            .and_then(|c| c.total_duration_ms)
            .unwrap_or(0);
        self.metrics.record_run(duration_ms);
        self.emit(EventCategory::Task(TaskEvent::Completed {
            task_id,
            duration_ms,
        }));
        self.supervisor.finish(task_id);
        self.bump_structure();
        self.opportunistic_snapshot("task completed");
    }

    fn fail_task(&mut self, task_id: TaskId, reason: &str) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        task.last_error = Some(reason.to_string());
        task.retry_count += 1;
        let retry_count = task.retry_count;
        let max_retries = task.max_retries;

        let held: Vec<String> = self
            .resources
            .held_by(task_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        if self
            .transition(task_id, TaskState::Failed, &format!("failure: {reason}"))
            .is_err()
        {
            return;
        }
        if !held.is_empty() {
            self.emit(EventCategory::Resources(ResourceEvent::Released {
                task_id,
                resources: held,
            }));
        }
        self.supervisor.finish(task_id);
        self.bump_structure();

        let retry_scheduled = retry_count <= max_retries;
        if retry_scheduled {
            let _ = self.transition(task_id, TaskState::Retrying, "retry");
            let _ = self.transition(task_id, TaskState::Queued, "requeue");
            let backoff = retry_backoff_from(
                self.config.retry_backoff_base,
                self.config.retry_backoff_cap,
                retry_count,
            );
            let eligible_at = Utc::now()
                + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());
            if let Some(task) = self.tasks.get_mut(&task_id) {
                task.next_eligible_at = Some(eligible_at);
            }
            debug!(task = %task_id, retry = retry_count, backoff_ms = backoff.as_millis() as u64, "retry scheduled");
        } else {
            self.metrics.record_terminal_failure();
        }
        self.emit(EventCategory::Task(TaskEvent::Failed {
            task_id,
            reason: reason.to_string(),
            retry_scheduled,
        }));
        if !retry_scheduled {
            self.cascade_cancel(task_id, "dependency failure");
            self.opportunistic_snapshot("task failed");
        }
    }

    // ------------------------------------------------------------------
    // Cancellation, pause, resume, retry
    // ------------------------------------------------------------------

    fn cancel_task(&mut self, task_id: TaskId, reason: &str) -> bool {
        let Some(status) = self.tasks.get(&task_id).map(|t| t.status) else {
            return false;
        };
        if self.supervisor.is_running(task_id) {
            // The worker acknowledges through its terminal message.
            self.pending_cancel.insert(task_id, reason.to_string());
            self.supervisor.cancel(task_id);
            return true;
        }
        if !status.is_cancellable() {
            return false;
        }
        if self.transition(task_id, TaskState::Cancelled, reason).is_err() {
            return false;
        }
        self.finalize_cancel_committed(task_id, reason);
        true
    }

    /// Commit a cancel transition for a task whose worker already stopped.
    fn finalize_cancel(&mut self, task_id: TaskId, reason: &str) {
        let held: Vec<String> = self
            .resources
            .held_by(task_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        if self.transition(task_id, TaskState::Cancelled, reason).is_err() {
            return;
        }
        if !held.is_empty() {
            self.emit(EventCategory::Resources(ResourceEvent::Released {
                task_id,
                resources: held,
            }));
        }
        self.finalize_cancel_committed(task_id, reason);
    }

    fn finalize_cancel_committed(&mut self, task_id: TaskId, reason: &str) {
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.last_error = Some(reason.to_string());
        }
        self.emit(EventCategory::Task(TaskEvent::Cancelled {
            task_id,
            reason: reason.to_string(),
        }));
        self.bump_structure();
        self.cascade_cancel(task_id, "dependency failure");
        self.opportunistic_snapshot("task cancelled");
    }

    /// Cancel every transitive hard dependent; soft dependents are spared.
    fn cascade_cancel(&mut self, root: TaskId, reason: &str) {
        let mut stack = self.graph.hard_dependents_of(root);
        let mut visited: HashSet<TaskId> = HashSet::new();
        while let Some(task_id) = stack.pop() {
            if !visited.insert(task_id) {
                continue;
            }
            let Some(status) = self.tasks.get(&task_id).map(|t| t.status) else {
                continue;
            };
            if status.is_terminal() {
                continue;
            }
            stack.extend(self.graph.hard_dependents_of(task_id));

            if self.supervisor.is_running(task_id) {
                self.pending_cancel.insert(task_id, reason.to_string());
                self.supervisor.cancel(task_id);
            } else if status.is_cancellable()
                && self.transition(task_id, TaskState::Cancelled, reason).is_ok()
            {
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.last_error = Some(reason.to_string());
                }
                self.emit(EventCategory::Task(TaskEvent::Cancelled {
                    task_id,
                    reason: reason.to_string(),
                }));
            }
        }
    }

    fn pause_task(&mut self, task_id: TaskId) -> bool {
        let running = self
            .tasks
            .get(&task_id)
            .is_some_and(|t| t.status == TaskState::Running);
        if !running || !self.supervisor.is_running(task_id) {
            return false;
        }
        if self.transition(task_id, TaskState::Paused, "pause").is_err() {
            return false;
        }
        self.supervisor.pause(task_id);
        true
    }

    fn resume_task(&mut self, task_id: TaskId) -> bool {
        let paused = self
            .tasks
            .get(&task_id)
            .is_some_and(|t| t.status == TaskState::Paused);
        if !paused {
            return false;
        }
        if self
            .transition(task_id, TaskState::Resuming, "resume")
            .is_err()
        {
            return false;
        }
        // The handoff back to Running is immediate, well inside the
        // 100ms window.
        let _ = self.transition(task_id, TaskState::Running, "resume");
        self.supervisor.resume(task_id);
        true
    }

    fn retry_task(&mut self, task_id: TaskId) -> bool {
        let failed = self
            .tasks
            .get(&task_id)
            .is_some_and(|t| t.status == TaskState::Failed);
        if !failed {
            return false;
        }
        if self
            .transition(task_id, TaskState::Retrying, "manual retry")
            .is_err()
        {
            return false;
        }
        let _ = self.transition(task_id, TaskState::Queued, "requeue");
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.next_eligible_at = None;
        }
        self.bump_structure();
        true
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    fn status_of(&self, task_id: TaskId) -> Result<TaskStatus> {
        let task = self
            .tasks
            .get(&task_id)
            .ok_or_else(|| Error::not_found(format!("task {task_id}")))?
            .clone();
        let attempts = self.lifecycle.context(task_id).map_or(0, |c| c.attempts);
        Ok(TaskStatus {
            dependencies: self.graph.dependencies_of(task_id),
            dependents: self.graph.dependents_of(task_id),
            attempts,
            recent_events: self.lifecycle.event_log(task_id),
            priority_decision: self.priority.decision_for(task_id).cloned(),
            task,
        })
    }

    fn query_tasks(&self, query: &TaskQuery) -> TaskQueryResponse {
        let mut matching: Vec<&Task> = self
            .tasks
            .values()
            .filter(|task| {
                query
                    .states
                    .as_ref()
                    .is_none_or(|states| states.contains(&task.status))
                    && query
                        .categories
                        .as_ref()
                        .is_none_or(|cats| cats.contains(&task.category))
                    && query
                        .priorities
                        .as_ref()
                        .is_none_or(|bands| bands.contains(&task.base_priority))
                    && query.created_after.is_none_or(|t| task.created_at >= t)
                    && query.created_before.is_none_or(|t| task.created_at < t)
            })
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let total = matching.len();
        let limit = query.limit.unwrap_or(usize::MAX);
        let tasks = matching
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .map(|task| TaskSummary {
                id: task.id,
                title: task.title.clone(),
                category: task.category,
                base_priority: task.base_priority,
                dynamic_priority: task.dynamic_priority,
                status: task.status,
                created_at: task.created_at,
                retry_count: task.retry_count,
                progress: task.progress,
                last_error: task.last_error.clone(),
            })
            .collect();
        TaskQueryResponse { total, tasks }
    }

    fn system_health(&mut self) -> SystemHealth {
        let mut components = BTreeMap::new();
        components.insert(
            "scheduler".to_string(),
            ComponentHealth {
                status: HealthStatus::Healthy,
                message: None,
            },
        );
        components.insert(
            "persistence".to_string(),
            match self.persistence.last_error() {
                Some(message) => ComponentHealth {
                    status: HealthStatus::Warning,
                    message: Some(message.to_string()),
                },
                None => ComponentHealth {
                    status: HealthStatus::Healthy,
                    message: None,
                },
            },
        );
        let utilization = self.resources.utilization();
        components.insert(
            "resources".to_string(),
            if utilization > 0.95 {
                ComponentHealth {
                    status: HealthStatus::Warning,
                    message: Some("resource pools near capacity".to_string()),
                }
            } else {
                ComponentHealth {
                    status: HealthStatus::Healthy,
                    message: None,
                }
            },
        );
        let depth = self.schedulable_count();
        let critical = self.config.queue_size_critical;
        components.insert(
            "queue".to_string(),
            if depth > critical * 2 {
                ComponentHealth {
                    status: HealthStatus::Critical,
                    message: Some(format!("queue depth {depth}")),
                }
            } else if depth > critical {
                ComponentHealth {
                    status: HealthStatus::Warning,
                    message: Some(format!("queue depth {depth}")),
                }
            } else {
                ComponentHealth {
                    status: HealthStatus::Healthy,
                    message: None,
                }
            },
        );

        let overall = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        self.emit(EventCategory::System(SystemEvent::HealthCheck {
            overall: overall.as_str().to_string(),
        }));
        SystemHealth {
            overall,
            components,
            metrics: self.metrics.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Ticks, priorities
    // ------------------------------------------------------------------

    fn on_tick(&mut self) {
        self.supervisor.enforce_hard_deadlines();
        if self.priorities_stale
            || self.last_recompute.elapsed() >= self.config.priority_recompute_interval
        {
            self.recompute_priorities();
            self.priorities_stale = false;
            self.last_recompute = Instant::now();
        }
        if self.persistence.retry_pending() {
            if let Err(err) = self.take_snapshot("write retry") {
                warn!(error = %err, "snapshot retry failed");
            }
        }
    }

    fn recompute_priorities(&mut self) {
        let now = Utc::now();
        let ctx = AdjustmentContext {
            now,
            system_load: self.system_load(),
            queue_depth: self.schedulable_count(),
            avg_wait_ms: self.avg_wait_ms(now),
            resource_utilization: self.resources.utilization(),
            fairness_index: 1.0,
        };
        let ids: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id)
            .collect();
        for task_id in ids {
            let pending = self
                .graph
                .dependents_of(task_id)
                .iter()
                .filter(|(dependent, _)| {
                    self.tasks
                        .get(dependent)
                        .is_some_and(|t| !t.status.is_terminal())
                })
                .count();
            let priority = {
                let Some(task) = self.tasks.get(&task_id) else {
                    continue;
                };
                self.priority
                    .recompute(task, pending, &ctx, self.structure_version)
            };
            if let Some(task) = self.tasks.get_mut(&task_id) {
                task.dynamic_priority = priority;
            }
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn opportunistic_snapshot(&mut self, reason: &str) {
        if self.persistence.allow_opportunistic()
            && let Err(err) = self.take_snapshot(reason)
        {
            warn!(error = %err, reason, "opportunistic snapshot failed");
        }
    }

    fn take_snapshot(&mut self, reason: &str) -> Result<Uuid> {
        let snapshot = self.build_snapshot();
        let task_count = snapshot.tasks.len();
        let snapshot_id = self.persistence.save(snapshot, reason)?;
        self.emit(EventCategory::Persistence(PersistenceEvent::SnapshotCreated {
            snapshot_id,
            reason: reason.to_string(),
            task_count,
        }));
        Ok(snapshot_id)
    }

    fn build_snapshot(&self) -> Snapshot {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        let mut contexts: Vec<LifecycleContext> = self.lifecycle.contexts().cloned().collect();
        contexts.sort_by_key(|c| c.task_id);
        let lifecycle_events: Vec<TaskEventLog> = contexts
            .iter()
            .map(|c| TaskEventLog {
                task_id: c.task_id,
                events: self.lifecycle.event_log(c.task_id),
            })
            .filter(|log| !log.events.is_empty())
            .collect();
        Snapshot {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            version: SNAPSHOT_VERSION,
            session_id: self.session_id,
            tasks,
            dependencies: self.graph.edges(),
            lifecycle_contexts: contexts,
            lifecycle_events,
            metrics: self.metrics.clone(),
            checksum: String::new(),
        }
    }

    fn restore_snapshot(&mut self, snapshot: Snapshot) {
        let snapshot_id = snapshot.id;
        let task_count = snapshot.tasks.len();

        self.supervisor.abort_all();
        self.pending_cancel.clear();
        self.tasks.clear();
        self.graph = DependencyGraph::new();
        self.lifecycle = LifecycleManager::new(self.config.max_history_per_task);
        self.resources = ResourcePool::with_capacities(&self.config.resources);
        self.metrics = snapshot.metrics;

        for task in snapshot.tasks {
            self.graph.add_task(task.id);
            self.tasks.insert(task.id, task);
        }
        {
            let tasks = &self.tasks;
            self.executors.retain(|id, _| tasks.contains_key(id));
        }
        for edge in &snapshot.dependencies {
            if let Err(err) = self.graph.add_dependency(*edge) {
                warn!(error = %err, "restored edge rejected");
            }
        }

        let mut event_map: HashMap<TaskId, Vec<LifecycleEvent>> = snapshot
            .lifecycle_events
            .into_iter()
            .map(|log| (log.task_id, log.events))
            .collect();
        for context in snapshot.lifecycle_contexts {
            let events = event_map.remove(&context.task_id).unwrap_or_default();
            self.lifecycle.restore_context(context, events);
        }
        let ids: Vec<TaskId> = self.tasks.keys().copied().collect();
        for task_id in ids {
            if self.lifecycle.context(task_id).is_none() {
                let state = self.tasks[&task_id].status;
                self.lifecycle.register_at(task_id, state);
            }
        }

        // No worker survives a restore, so every Running task is an orphan.
        let orphans: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskState::Running)
            .map(|t| t.id)
            .collect();
        for task in self.tasks.values_mut() {
            task.session_id = self.session_id;
        }
        for task_id in orphans {
            info!(task = %task_id, "failing task orphaned by restart");
            self.fail_task(task_id, "orphaned on restart");
        }

        self.bump_structure();
        self.emit(EventCategory::Persistence(
            PersistenceEvent::SnapshotRestored {
                snapshot_id,
                task_count,
            },
        ));
    }

    fn shutdown(&mut self) {
        self.supervisor.abort_all();
        if let Err(err) = self.take_snapshot("shutdown") {
            warn!(error = %err, "shutdown snapshot failed");
        }
        self.emit(EventCategory::System(SystemEvent::Shutdown {
            reason: "requested".to_string(),
        }));
        info!("engine shut down");
    }
}
