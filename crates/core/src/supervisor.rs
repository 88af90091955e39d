//! Execution supervision.
//!
//! The supervisor runs executors in their own tokio tasks, bounded by the
//! configured concurrency. Workers never touch engine state: every result,
//! progress report, or timeout comes back as a [`WorkerMessage`] on the
//! channel the scheduler task drains. Timeouts drop the executor future;
//! a hard deadline (limit plus grace) additionally abandons workers whose
//! executors ignore cancellation.

use crate::task::{Task, TaskId};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outcome an executor reports.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Whether the work succeeded.
    pub success: bool,
    /// Output payload, merged into the task's outputs.
    pub output: Option<Value>,
    /// Failure message when `success` is false.
    pub error: Option<String>,
}

impl ExecutionResult {
    /// A successful result with an optional output payload.
    #[must_use]
    pub fn ok(output: Option<Value>) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    /// A failed result.
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// Context handed to an executor for one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// The task being executed.
    pub task_id: TaskId,
    /// Cooperative cancellation signal; also fired on timeout.
    pub cancellation: CancellationToken,
    /// Cooperative pause flag.
    pub pause: watch::Receiver<bool>,
    /// Outputs of hard dependencies, keyed by dependency task id.
    pub upstream: BTreeMap<TaskId, Value>,
    progress: mpsc::UnboundedSender<WorkerMessage>,
}

impl ExecutionContext {
    /// Report execution progress in `[0, 100]`. The engine records it
    /// monotonically; a lower report never lowers the stored value.
    pub fn report_progress(&self, progress: f64) {
        let _ = self.progress.send(WorkerMessage::Progress {
            task_id: self.task_id,
            progress: progress.clamp(0.0, 100.0),
        });
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Whether a pause was requested. Enforcement is cooperative.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }
}

/// The caller-supplied task body.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run one attempt. `task` is a read-only copy of the task record.
    async fn execute(&self, task: Task, ctx: ExecutionContext) -> ExecutionResult;
}

/// Adapter turning an async closure into a [`TaskExecutor`].
pub struct FnExecutor<F>(F);

#[async_trait]
impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(Task, ExecutionContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ExecutionResult> + Send,
{
    async fn execute(&self, task: Task, ctx: ExecutionContext) -> ExecutionResult {
        (self.0)(task, ctx).await
    }
}

/// Wrap an async closure as a shareable executor.
pub fn executor_fn<F, Fut>(f: F) -> Arc<dyn TaskExecutor>
where
    F: Fn(Task, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ExecutionResult> + Send + 'static,
{
    Arc::new(FnExecutor(f))
}

/// Terminal outcome of one worker.
#[derive(Debug, Clone)]
pub enum WorkerOutcome {
    /// Executor reported success.
    Success {
        /// Output payload.
        output: Option<Value>,
    },
    /// Executor reported failure or panicked.
    Failed {
        /// Failure message.
        error: String,
    },
    /// Execution exceeded `max_execution_time`.
    TimedOut,
    /// Cancellation was requested and took effect.
    Cancelled,
}

/// Message a worker posts back to the scheduler task.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    /// A progress report.
    Progress {
        /// Reporting task.
        task_id: TaskId,
        /// Progress in `[0, 100]`.
        progress: f64,
    },
    /// The worker finished.
    Finished {
        /// Finished task.
        task_id: TaskId,
        /// How it ended.
        outcome: WorkerOutcome,
    },
}

struct WorkerHandle {
    cancellation: CancellationToken,
    pause_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    hard_deadline: Option<Instant>,
}

/// Runs executors under the concurrency bound.
pub struct ExecutionSupervisor {
    max_concurrent: usize,
    grace: Duration,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    workers: HashMap<TaskId, WorkerHandle>,
}

impl ExecutionSupervisor {
    /// Supervisor posting worker messages to `tx`.
    #[must_use]
    pub fn new(
        max_concurrent: usize,
        grace: Duration,
        tx: mpsc::UnboundedSender<WorkerMessage>,
    ) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            grace,
            tx,
            workers: HashMap::new(),
        }
    }

    /// Free execution slots.
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.max_concurrent.saturating_sub(self.workers.len())
    }

    /// Number of running workers.
    #[must_use]
    pub fn running(&self) -> usize {
        self.workers.len()
    }

    /// Whether a worker exists for the task.
    #[must_use]
    pub fn is_running(&self, task_id: TaskId) -> bool {
        self.workers.contains_key(&task_id)
    }

    /// Ids of all running workers.
    #[must_use]
    pub fn running_ids(&self) -> Vec<TaskId> {
        self.workers.keys().copied().collect()
    }

    /// Spawn a worker for a dispatched task.
    ///
    /// A `max_execution_time` of zero times the task out before the
    /// executor is invoked. On soft timeout the executor future is dropped
    /// and the cancellation token fired for any cooperative cleanup the
    /// executor's spawned work may be watching.
    pub fn spawn(
        &mut self,
        task: &Task,
        executor: Arc<dyn TaskExecutor>,
        upstream: BTreeMap<TaskId, Value>,
    ) {
        let task_id = task.id;
        let cancellation = CancellationToken::new();
        let (pause_tx, pause_rx) = watch::channel(false);
        let limit_ms = task.max_execution_time_ms;

        let ctx = ExecutionContext {
            task_id,
            cancellation: cancellation.clone(),
            pause: pause_rx,
            upstream,
            progress: self.tx.clone(),
        };

        let tx = self.tx.clone();
        let token = cancellation.clone();
        let task_copy = task.clone();
        let join = tokio::spawn(async move {
            if limit_ms == 0 {
                let _ = tx.send(WorkerMessage::Finished {
                    task_id,
                    outcome: WorkerOutcome::TimedOut,
                });
                return;
            }
            let work = executor.execute(task_copy, ctx);
            tokio::select! {
                () = token.cancelled() => {
                    let _ = tx.send(WorkerMessage::Finished {
                        task_id,
                        outcome: WorkerOutcome::Cancelled,
                    });
                }
                result = tokio::time::timeout(Duration::from_millis(limit_ms), work) => {
                    let outcome = match result {
                        Ok(res) if res.success => WorkerOutcome::Success { output: res.output },
                        Ok(res) => WorkerOutcome::Failed {
                            error: res
                                .error
                                .unwrap_or_else(|| "executor reported failure".to_string()),
                        },
                        Err(_) => {
                            token.cancel();
                            WorkerOutcome::TimedOut
                        }
                    };
                    let _ = tx.send(WorkerMessage::Finished { task_id, outcome });
                }
            }
        });

        let hard_deadline =
            (limit_ms > 0).then(|| Instant::now() + Duration::from_millis(limit_ms) + self.grace);
        debug!(task = %task_id, limit_ms, "worker spawned");
        self.workers.insert(
            task_id,
            WorkerHandle {
                cancellation,
                pause_tx,
                join,
                hard_deadline,
            },
        );
    }

    /// Signal cancellation to a worker. The `Cancelled` outcome arrives
    /// through the message channel.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        match self.workers.get(&task_id) {
            Some(handle) => {
                handle.cancellation.cancel();
                true
            }
            None => false,
        }
    }

    /// Raise the cooperative pause flag for a worker.
    pub fn pause(&self, task_id: TaskId) -> bool {
        self.workers
            .get(&task_id)
            .is_some_and(|h| h.pause_tx.send(true).is_ok())
    }

    /// Clear the pause flag.
    pub fn resume(&self, task_id: TaskId) -> bool {
        self.workers
            .get(&task_id)
            .is_some_and(|h| h.pause_tx.send(false).is_ok())
    }

    /// Forget a finished worker. Called when its terminal message is
    /// processed.
    pub fn finish(&mut self, task_id: TaskId) {
        self.workers.remove(&task_id);
    }

    /// Abandon workers past their hard deadline (limit plus grace) and
    /// post a timeout outcome for each. Returns the abandoned ids.
    pub fn enforce_hard_deadlines(&mut self) -> Vec<TaskId> {
        let now = Instant::now();
        let expired: Vec<TaskId> = self
            .workers
            .iter()
            .filter(|(_, h)| h.hard_deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        for task_id in &expired {
            if let Some(handle) = self.workers.remove(task_id) {
                warn!(task = %task_id, "worker abandoned past hard deadline");
                handle.cancellation.cancel();
                handle.join.abort();
                let _ = self.tx.send(WorkerMessage::Finished {
                    task_id: *task_id,
                    outcome: WorkerOutcome::TimedOut,
                });
            }
        }
        expired
    }

    /// Abort every worker, for shutdown.
    pub fn abort_all(&mut self) {
        for (task_id, handle) in self.workers.drain() {
            debug!(task = %task_id, "worker aborted on shutdown");
            handle.cancellation.cancel();
            handle.join.abort();
        }
    }
}

impl std::fmt::Debug for ExecutionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionSupervisor")
            .field("max_concurrent", &self.max_concurrent)
            .field("running", &self.workers.len())
            .finish()
    }
}

/// Retry backoff with the default schedule: `min(5s * 3^(n-1), 60s)` for
/// the n-th failure.
#[must_use]
pub fn retry_backoff(retry_count: u32) -> Duration {
    retry_backoff_from(Duration::from_secs(5), Duration::from_secs(60), retry_count)
}

/// Retry backoff under a configured base and cap: `min(base * 3^(n-1), cap)`.
#[must_use]
pub fn retry_backoff_from(base: Duration, cap: Duration, retry_count: u32) -> Duration {
    let n = retry_count.max(1);
    let multiplier = 3u32.saturating_pow(n - 1);
    base.saturating_mul(multiplier).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskCategory, TaskSubmission};
    use std::sync::atomic::{AtomicBool, Ordering};
    use uuid::Uuid;

    fn task_with_limit(limit_ms: u64) -> Task {
        let submission = TaskSubmission {
            max_execution_time_ms: limit_ms,
            ..TaskSubmission::new("supervised", TaskCategory::Testing)
        };
        Task::from_submission(&submission, Uuid::new_v4())
    }

    async fn next_finished(rx: &mut mpsc::UnboundedReceiver<WorkerMessage>) -> (TaskId, WorkerOutcome) {
        loop {
            match rx.recv().await.expect("worker message") {
                WorkerMessage::Finished { task_id, outcome } => return (task_id, outcome),
                WorkerMessage::Progress { .. } => {}
            }
        }
    }

    #[test]
    fn backoff_schedule_matches_contract() {
        assert_eq!(retry_backoff(1), Duration::from_secs(5));
        assert_eq!(retry_backoff(2), Duration::from_secs(15));
        assert_eq!(retry_backoff(3), Duration::from_secs(45));
        assert_eq!(retry_backoff(4), Duration::from_secs(60));
        assert_eq!(retry_backoff(10), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn successful_worker_reports_output() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut supervisor = ExecutionSupervisor::new(2, Duration::from_secs(1), tx);
        let task = task_with_limit(5_000);
        let id = task.id;

        supervisor.spawn(
            &task,
            executor_fn(|_, _| async { ExecutionResult::ok(Some(serde_json::json!({"n": 1}))) }),
            BTreeMap::new(),
        );

        let (task_id, outcome) = next_finished(&mut rx).await;
        assert_eq!(task_id, id);
        assert!(matches!(outcome, WorkerOutcome::Success { output: Some(_) }));
    }

    #[tokio::test]
    async fn failing_worker_reports_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut supervisor = ExecutionSupervisor::new(2, Duration::from_secs(1), tx);
        let task = task_with_limit(5_000);

        supervisor.spawn(
            &task,
            executor_fn(|_, _| async { ExecutionResult::failure("boom") }),
            BTreeMap::new(),
        );

        let (_, outcome) = next_finished(&mut rx).await;
        match outcome {
            WorkerOutcome::Failed { error } => assert_eq!(error, "boom"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_worker_times_out() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut supervisor = ExecutionSupervisor::new(2, Duration::from_secs(1), tx);
        let task = task_with_limit(20);

        supervisor.spawn(
            &task,
            executor_fn(|_, _| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                ExecutionResult::ok(None)
            }),
            BTreeMap::new(),
        );

        let (_, outcome) = next_finished(&mut rx).await;
        assert!(matches!(outcome, WorkerOutcome::TimedOut));
    }

    #[tokio::test]
    async fn zero_limit_times_out_before_invoking_executor() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut supervisor = ExecutionSupervisor::new(2, Duration::from_secs(1), tx);
        let task = task_with_limit(0);

        let invoked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&invoked);
        supervisor.spawn(
            &task,
            executor_fn(move |_, _| {
                let flag = Arc::clone(&flag);
                async move {
                    flag.store(true, Ordering::SeqCst);
                    ExecutionResult::ok(None)
                }
            }),
            BTreeMap::new(),
        );

        let (_, outcome) = next_finished(&mut rx).await;
        assert!(matches!(outcome, WorkerOutcome::TimedOut));
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancellation_stops_the_worker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut supervisor = ExecutionSupervisor::new(2, Duration::from_secs(1), tx);
        let task = task_with_limit(60_000);
        let id = task.id;

        supervisor.spawn(
            &task,
            executor_fn(|_, _| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                ExecutionResult::ok(None)
            }),
            BTreeMap::new(),
        );

        assert!(supervisor.cancel(id));
        let (_, outcome) = next_finished(&mut rx).await;
        assert!(matches!(outcome, WorkerOutcome::Cancelled));
        assert!(!supervisor.cancel(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn progress_reports_flow_through() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut supervisor = ExecutionSupervisor::new(2, Duration::from_secs(1), tx);
        let task = task_with_limit(5_000);

        supervisor.spawn(
            &task,
            executor_fn(|_, ctx| async move {
                ctx.report_progress(150.0);
                ExecutionResult::ok(None)
            }),
            BTreeMap::new(),
        );

        let mut saw_progress = None;
        loop {
            match rx.recv().await.unwrap() {
                WorkerMessage::Progress { progress, .. } => saw_progress = Some(progress),
                WorkerMessage::Finished { .. } => break,
            }
        }
        // Clamped to the valid range.
        assert_eq!(saw_progress, Some(100.0));
    }

    #[tokio::test]
    async fn pause_flag_reaches_context() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut supervisor = ExecutionSupervisor::new(2, Duration::from_secs(1), tx);
        let task = task_with_limit(5_000);
        let id = task.id;

        supervisor.spawn(
            &task,
            executor_fn(|_, ctx| async move {
                // Wait until the pause flag flips.
                let mut pause = ctx.pause.clone();
                while !*pause.borrow() {
                    if pause.changed().await.is_err() {
                        return ExecutionResult::failure("pause channel closed");
                    }
                }
                ExecutionResult::ok(None)
            }),
            BTreeMap::new(),
        );

        assert!(supervisor.pause(id));
        let (_, outcome) = next_finished(&mut rx).await;
        assert!(matches!(outcome, WorkerOutcome::Success { .. }));
    }

    #[tokio::test]
    async fn slot_accounting() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut supervisor = ExecutionSupervisor::new(2, Duration::from_secs(1), tx);
        assert_eq!(supervisor.available_slots(), 2);

        for _ in 0..2 {
            let task = task_with_limit(60_000);
            supervisor.spawn(
                &task,
                executor_fn(|_, _| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    ExecutionResult::ok(None)
                }),
                BTreeMap::new(),
            );
        }
        assert_eq!(supervisor.available_slots(), 0);
        assert_eq!(supervisor.running(), 2);
        supervisor.abort_all();
        assert_eq!(supervisor.available_slots(), 2);
    }

    #[tokio::test]
    async fn hard_deadline_abandons_stuck_worker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut supervisor = ExecutionSupervisor::new(2, Duration::ZERO, tx);
        let task = task_with_limit(1);
        let id = task.id;

        supervisor.spawn(
            &task,
            executor_fn(|_, _| async {
                tokio::time::sleep(Duration::from_secs(600)).await;
                ExecutionResult::ok(None)
            }),
            BTreeMap::new(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        // The soft timeout may already have fired; either path must leave
        // the supervisor empty and produce a TimedOut outcome.
        supervisor.enforce_hard_deadlines();
        let (task_id, outcome) = next_finished(&mut rx).await;
        assert_eq!(task_id, id);
        assert!(matches!(outcome, WorkerOutcome::TimedOut));
        supervisor.finish(id);
        assert!(!supervisor.is_running(id));
    }
}
