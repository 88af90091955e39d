//! Engine configuration.

use crate::priority::FactorWeights;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the whole engine. `Default` carries the documented
/// defaults; callers override fields with struct-update syntax.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of executors running simultaneously.
    pub max_concurrent_tasks: usize,
    /// Scheduler tick; the ready set is re-evaluated at least this often.
    pub tick_interval: Duration,
    /// How often dynamic priorities are recomputed absent structural change.
    pub priority_recompute_interval: Duration,
    /// Waiting time after which a task receives a starvation boost.
    pub max_starvation_time: Duration,
    /// Upper bound for the additive starvation boost.
    pub max_priority_boost: i64,
    /// Extra time past `max_execution_time` before a worker is abandoned.
    pub execution_grace: Duration,
    /// First retry backoff; the n-th failure waits `base * 3^(n-1)`.
    pub retry_backoff_base: Duration,
    /// Upper bound on the retry backoff.
    pub retry_backoff_cap: Duration,
    /// Bound on the per-task lifecycle event log.
    pub max_history_per_task: usize,
    /// Ready-queue depth beyond which backpressure sets in.
    pub queue_size_critical: usize,
    /// System load (running / concurrency bound) above which backpressure
    /// depresses the initial priority of new submissions.
    pub backpressure_load_threshold: f64,
    /// Estimated duration above which the breakdown collaborator is
    /// consulted, when one is configured.
    pub breakdown_threshold_ms: Option<u64>,
    /// Initial resource pool capacities.
    pub resources: BTreeMap<String, u32>,
    /// Weights for the default priority algorithm.
    pub priority_weights: FactorWeights,
    /// Whether to restore from the newest valid snapshot at startup.
    pub recover_on_start: bool,
    /// Persistence tunables.
    pub persistence: PersistenceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            tick_interval: Duration::from_millis(100),
            priority_recompute_interval: Duration::from_secs(10),
            max_starvation_time: Duration::from_secs(300),
            max_priority_boost: 200,
            execution_grace: Duration::from_secs(1),
            retry_backoff_base: Duration::from_secs(5),
            retry_backoff_cap: Duration::from_secs(60),
            max_history_per_task: 100,
            queue_size_critical: 1000,
            backpressure_load_threshold: 0.8,
            breakdown_threshold_ms: None,
            resources: BTreeMap::new(),
            priority_weights: FactorWeights::default(),
            recover_on_start: true,
            persistence: PersistenceConfig::default(),
        }
    }
}

/// Snapshot persistence tunables.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Base directory; `snapshots/`, `backups/`, `incremental/` and `temp/`
    /// live underneath it.
    pub base_dir: PathBuf,
    /// Gzip snapshots (`.json.gz`) instead of plain `.json`.
    pub compress: bool,
    /// Fixed autosave interval.
    pub autosave_interval: Duration,
    /// Retention bound; cleanup trims to this many snapshots, oldest first.
    pub max_backup_snapshots: usize,
    /// Snapshots older than this are deleted by cleanup.
    pub max_recoverable_age: Duration,
    /// Minimum spacing between opportunistic (terminal-transition) saves.
    pub opportunistic_save_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(".taskforge"),
            compress: true,
            autosave_interval: Duration::from_secs(300),
            max_backup_snapshots: 10,
            max_recoverable_age: Duration::from_secs(7 * 24 * 3600),
            opportunistic_save_interval: Duration::from_secs(1),
        }
    }
}
