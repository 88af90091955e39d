//! Snapshot persistence.
//!
//! Engine state is captured into JSON snapshots (gzip by default) with a
//! SHA-256 checksum over the canonical serialization, written under
//! `<base>/snapshots/`. Writes stage through `<base>/temp/` and rename into
//! place. Startup recovery walks snapshots newest-first and takes the first
//! one that validates.

use crate::config::PersistenceConfig;
use crate::lifecycle::{LifecycleContext, LifecycleEvent, TaskState};
use crate::metrics::EngineMetrics;
use crate::task::{Task, TaskId};
use crate::{Error, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Age past which a foreign-session `Running` task counts as orphaned.
const ORPHAN_AGE_SECS: i64 = 60;

/// Per-task event tail as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEventLog {
    /// The task the events belong to.
    pub task_id: TaskId,
    /// Bounded tail, oldest first.
    pub events: Vec<LifecycleEvent>,
}

/// A serialized capture of engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot id; also the file stem.
    pub id: Uuid,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
    /// Format version.
    pub version: u32,
    /// Session that wrote the snapshot.
    pub session_id: Uuid,
    /// All tasks.
    pub tasks: Vec<Task>,
    /// All dependency edges.
    pub dependencies: Vec<taskforge_graph::DependencyEdge>,
    /// Lifecycle contexts (event tails stored separately).
    pub lifecycle_contexts: Vec<LifecycleContext>,
    /// Bounded per-task event tails.
    pub lifecycle_events: Vec<TaskEventLog>,
    /// Aggregate metrics at capture time.
    pub metrics: EngineMetrics,
    /// Base64 SHA-256 over the canonical JSON of all other fields.
    pub checksum: String,
}

impl Snapshot {
    /// Compute the checksum over the canonical (sorted-key) JSON of every
    /// field except `checksum` itself.
    pub fn compute_checksum(&self) -> Result<String> {
        let mut value =
            serde_json::to_value(self).map_err(|e| Error::serialization(e.to_string()))?;
        if let Some(object) = value.as_object_mut() {
            object.remove("checksum");
        }
        let canonical =
            serde_json::to_string(&value).map_err(|e| Error::serialization(e.to_string()))?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(BASE64.encode(digest))
    }

    /// Structural and integrity validation.
    ///
    /// # Errors
    ///
    /// `CorruptSnapshot` when the checksum mismatches, an edge references a
    /// task missing from the snapshot, or the version is unknown.
    pub fn validate(&self) -> Result<()> {
        if self.version > SNAPSHOT_VERSION {
            return Err(Error::CorruptSnapshot {
                id: self.id,
                reason: format!("unknown snapshot version {}", self.version),
            });
        }
        let task_ids: std::collections::HashSet<TaskId> =
            self.tasks.iter().map(|t| t.id).collect();
        for edge in &self.dependencies {
            if !task_ids.contains(&edge.dependent) || !task_ids.contains(&edge.depends_on) {
                return Err(Error::CorruptSnapshot {
                    id: self.id,
                    reason: format!(
                        "edge {} -> {} references a task missing from the snapshot",
                        edge.depends_on, edge.dependent
                    ),
                });
            }
        }
        for log in &self.lifecycle_events {
            if !task_ids.contains(&log.task_id) {
                return Err(Error::CorruptSnapshot {
                    id: self.id,
                    reason: format!("event log for unknown task {}", log.task_id),
                });
            }
        }
        let expected = self.compute_checksum()?;
        if expected != self.checksum {
            return Err(Error::CorruptSnapshot {
                id: self.id,
                reason: "checksum mismatch".to_string(),
            });
        }
        Ok(())
    }
}

/// Metadata of a snapshot file on disk.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    /// Snapshot id parsed from the file name.
    pub id: Uuid,
    /// File path.
    pub path: PathBuf,
    /// File modification time.
    pub modified: DateTime<Utc>,
    /// File size in bytes.
    pub size: u64,
    /// Whether the file is gzip-compressed.
    pub compressed: bool,
}

/// Validation status of a snapshot as seen by recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    /// Loads and validates.
    Valid,
    /// Exists but fails integrity or structural validation.
    Corrupted,
}

/// Summary of one recoverable snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSummary {
    /// Snapshot id.
    pub id: Uuid,
    /// Capture time, when readable.
    pub timestamp: Option<DateTime<Utc>>,
    /// Number of tasks captured, when readable.
    pub task_count: Option<usize>,
    /// Validation status.
    pub status: SnapshotStatus,
}

/// What recovery has to work with.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryInfo {
    /// Every snapshot on disk, newest first.
    pub available_snapshots: Vec<SnapshotSummary>,
    /// The largest valid snapshot by task count.
    pub recommended_snapshot_id: Option<Uuid>,
    /// Last successful save by this engine instance.
    pub last_successful_save: Option<DateTime<Utc>>,
    /// Whether unsaved state likely exceeds one autosave window.
    pub potential_data_loss: bool,
    /// Tasks seen `Running` under a foreign session older than a minute.
    pub orphaned_task_ids: Vec<TaskId>,
}

/// Writes, validates, restores, and prunes snapshots.
#[derive(Debug)]
pub struct PersistenceEngine {
    config: PersistenceConfig,
    session_id: Uuid,
    last_save: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_opportunistic: Option<Instant>,
    retry_pending: bool,
}

impl PersistenceEngine {
    /// Set up the directory layout and clear `temp/`.
    pub fn new(config: PersistenceConfig, session_id: Uuid) -> Result<Self> {
        for dir in ["snapshots", "backups", "incremental"] {
            let path = config.base_dir.join(dir);
            fs::create_dir_all(&path).map_err(|e| Error::io(e, &path, "create_dir_all"))?;
        }
        let temp = config.base_dir.join("temp");
        if temp.exists() {
            fs::remove_dir_all(&temp).map_err(|e| Error::io(e, &temp, "remove_dir_all"))?;
        }
        fs::create_dir_all(&temp).map_err(|e| Error::io(e, &temp, "create_dir_all"))?;

        Ok(Self {
            config,
            session_id,
            last_save: None,
            last_error: None,
            last_opportunistic: None,
            retry_pending: false,
        })
    }

    /// The session this engine instance writes snapshots under.
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Last write failure, if the most recent save did not succeed.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Last successful save time.
    #[must_use]
    pub fn last_save(&self) -> Option<DateTime<Utc>> {
        self.last_save
    }

    /// Whether a failed write is waiting to be retried at the next tick.
    #[must_use]
    pub fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    /// Rate limit for out-of-band saves on terminal transitions.
    pub fn allow_opportunistic(&mut self) -> bool {
        let allowed = self
            .last_opportunistic
            .is_none_or(|t| t.elapsed() >= self.config.opportunistic_save_interval);
        if allowed {
            self.last_opportunistic = Some(Instant::now());
        }
        allowed
    }

    /// Fill the checksum and write the snapshot to disk.
    ///
    /// Stages into `temp/` and renames into `snapshots/`. On failure the
    /// error is recorded and a retry is flagged for the next tick.
    pub fn save(&mut self, mut snapshot: Snapshot, reason: &str) -> Result<Uuid> {
        snapshot.checksum = snapshot.compute_checksum()?;
        let result = self.write_to_disk(&snapshot);
        match result {
            Ok(()) => {
                self.last_save = Some(Utc::now());
                self.last_error = None;
                self.retry_pending = false;
                debug!(snapshot = %snapshot.id, reason, tasks = snapshot.tasks.len(), "snapshot written");
                Ok(snapshot.id)
            }
            Err(err) => {
                warn!(snapshot = %snapshot.id, reason, error = %err, "snapshot write failed");
                self.last_error = Some(err.to_string());
                self.retry_pending = true;
                Err(err)
            }
        }
    }

    fn write_to_disk(&self, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| Error::serialization(e.to_string()))?;
        let (file_name, bytes) = if self.config.compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&json)
                .map_err(|e| Error::persistence(format!("gzip failed: {e}")))?;
            let bytes = encoder
                .finish()
                .map_err(|e| Error::persistence(format!("gzip failed: {e}")))?;
            (format!("{}.json.gz", snapshot.id), bytes)
        } else {
            (format!("{}.json", snapshot.id), json)
        };

        let staged = self.config.base_dir.join("temp").join(&file_name);
        fs::write(&staged, &bytes).map_err(|e| Error::io(e, &staged, "write"))?;
        let target = self.config.base_dir.join("snapshots").join(&file_name);
        fs::rename(&staged, &target).map_err(|e| Error::io(e, &target, "rename"))?;
        Ok(())
    }

    /// Newest snapshot (by modification time) that validates, or `None`.
    #[must_use]
    pub fn load_latest_valid(&self) -> Option<Snapshot> {
        let mut infos = self.list_snapshots();
        infos.sort_by_key(|i| std::cmp::Reverse(i.modified));
        for info in infos {
            match read_snapshot_file(&info.path) {
                Ok(snapshot) => return Some(snapshot),
                Err(err) => {
                    warn!(path = %info.path.display(), error = %err, "skipping unreadable snapshot");
                }
            }
        }
        None
    }

    /// Load one snapshot by id.
    ///
    /// # Errors
    ///
    /// `NotFound` when no file carries the id, `CorruptSnapshot` when the
    /// file exists but fails validation.
    pub fn load_by_id(&self, id: Uuid) -> Result<Snapshot> {
        let info = self
            .list_snapshots()
            .into_iter()
            .find(|i| i.id == id)
            .ok_or_else(|| Error::not_found(format!("snapshot {id}")))?;
        read_snapshot_file(&info.path)
    }

    /// Every snapshot file under `snapshots/`.
    #[must_use]
    pub fn list_snapshots(&self) -> Vec<SnapshotInfo> {
        let dir = self.config.base_dir.join("snapshots");
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut infos = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let (stem, compressed) = if let Some(stem) = name.strip_suffix(".json.gz") {
                (stem, true)
            } else if let Some(stem) = name.strip_suffix(".json") {
                (stem, false)
            } else {
                continue;
            };
            let Ok(id) = Uuid::parse_str(stem) else {
                continue;
            };
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            infos.push(SnapshotInfo {
                id,
                path,
                modified,
                size: metadata.len(),
                compressed,
            });
        }
        infos.sort_by_key(|i| std::cmp::Reverse(i.modified));
        infos
    }

    /// Delete snapshots past the age limit and trim the rest to the
    /// retention count, oldest first. Returns the number deleted.
    pub fn cleanup(&mut self) -> Result<usize> {
        let now = Utc::now();
        let max_age = chrono::Duration::from_std(self.config.max_recoverable_age)
            .unwrap_or_else(|_| chrono::Duration::days(7));

        let mut infos = self.list_snapshots();
        let mut deleted = 0;

        infos.retain(|info| {
            if now - info.modified > max_age {
                if fs::remove_file(&info.path).is_ok() {
                    deleted += 1;
                }
                false
            } else {
                true
            }
        });

        // Oldest last after the newest-first sort; trim from the back.
        while infos.len() > self.config.max_backup_snapshots {
            if let Some(info) = infos.pop() {
                if fs::remove_file(&info.path).is_ok() {
                    deleted += 1;
                }
            }
        }
        if deleted > 0 {
            debug!(deleted, "snapshot cleanup");
        }
        Ok(deleted)
    }

    /// Survey what is recoverable from disk.
    #[must_use]
    pub fn recovery_info(&self, now: DateTime<Utc>) -> RecoveryInfo {
        let mut summaries = Vec::new();
        let mut recommended: Option<(usize, Uuid)> = None;
        let mut orphaned = Vec::new();

        for info in self.list_snapshots() {
            match read_snapshot_file(&info.path) {
                Ok(snapshot) => {
                    let task_count = snapshot.tasks.len();
                    if recommended.is_none_or(|(best, _)| task_count > best) {
                        recommended = Some((task_count, snapshot.id));
                    }
                    let foreign = snapshot.session_id != self.session_id;
                    let stale =
                        (now - snapshot.timestamp).num_seconds() > ORPHAN_AGE_SECS;
                    if foreign && stale {
                        for task in &snapshot.tasks {
                            if task.status == TaskState::Running && !orphaned.contains(&task.id) {
                                orphaned.push(task.id);
                            }
                        }
                    }
                    summaries.push(SnapshotSummary {
                        id: snapshot.id,
                        timestamp: Some(snapshot.timestamp),
                        task_count: Some(task_count),
                        status: SnapshotStatus::Valid,
                    });
                }
                Err(_) => {
                    summaries.push(SnapshotSummary {
                        id: info.id,
                        timestamp: None,
                        task_count: None,
                        status: SnapshotStatus::Corrupted,
                    });
                }
            }
        }

        let potential_data_loss = self.last_save.is_some_and(|saved| {
            let window = chrono::Duration::from_std(self.config.autosave_interval * 2)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
            now - saved > window
        });

        RecoveryInfo {
            available_snapshots: summaries,
            recommended_snapshot_id: recommended.map(|(_, id)| id),
            last_successful_save: self.last_save,
            potential_data_loss,
            orphaned_task_ids: orphaned,
        }
    }
}

/// Read and validate a snapshot file, decompressing by extension.
fn read_snapshot_file(path: &Path) -> Result<Snapshot> {
    let bytes = fs::read(path).map_err(|e| Error::io(e, path, "read"))?;
    let json = if path.extension().is_some_and(|e| e == "gz") {
        let mut decoder = GzDecoder::new(bytes.as_slice());
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| Error::persistence(format!("gunzip failed: {e}")))?;
        out
    } else {
        bytes
    };
    let snapshot: Snapshot = serde_json::from_slice(&json).map_err(|e| {
        Error::persistence(format!("snapshot parse failed for {}: {e}", path.display()))
    })?;
    snapshot.validate()?;
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskCategory, TaskSubmission};
    use tempfile::TempDir;

    fn config(dir: &TempDir, compress: bool) -> PersistenceConfig {
        PersistenceConfig {
            base_dir: dir.path().to_path_buf(),
            compress,
            ..PersistenceConfig::default()
        }
    }

    fn snapshot_with_tasks(session_id: Uuid, count: usize) -> Snapshot {
        let tasks: Vec<Task> = (0..count)
            .map(|i| {
                Task::from_submission(
                    &TaskSubmission::new(format!("task {i}"), TaskCategory::Testing),
                    session_id,
                )
            })
            .collect();
        Snapshot {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            version: SNAPSHOT_VERSION,
            session_id,
            tasks,
            dependencies: Vec::new(),
            lifecycle_contexts: Vec::new(),
            lifecycle_events: Vec::new(),
            metrics: EngineMetrics::default(),
            checksum: String::new(),
        }
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let session = Uuid::new_v4();
        let mut engine = PersistenceEngine::new(config(&dir, true), session).unwrap();

        let snapshot = snapshot_with_tasks(session, 3);
        let id = engine.save(snapshot.clone(), "test").unwrap();

        let loaded = engine.load_latest_valid().unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.tasks.len(), 3);
        assert_eq!(loaded.session_id, session);
        assert_eq!(
            loaded.tasks.iter().map(|t| t.id).collect::<Vec<_>>(),
            snapshot.tasks.iter().map(|t| t.id).collect::<Vec<_>>()
        );
        assert!(engine.last_save().is_some());
    }

    #[test]
    fn uncompressed_snapshots_also_load() {
        let dir = TempDir::new().unwrap();
        let session = Uuid::new_v4();
        let mut engine = PersistenceEngine::new(config(&dir, false), session).unwrap();

        let id = engine.save(snapshot_with_tasks(session, 1), "test").unwrap();
        let infos = engine.list_snapshots();
        assert_eq!(infos.len(), 1);
        assert!(!infos[0].compressed);
        assert_eq!(engine.load_by_id(id).unwrap().id, id);
    }

    #[test]
    fn tampered_snapshot_is_corrupt_and_skipped() {
        let dir = TempDir::new().unwrap();
        let session = Uuid::new_v4();
        let mut engine = PersistenceEngine::new(config(&dir, false), session).unwrap();

        let old_id = engine.save(snapshot_with_tasks(session, 1), "first").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let new_id = engine.save(snapshot_with_tasks(session, 2), "second").unwrap();

        // Flip a byte in the newest snapshot.
        let info = engine
            .list_snapshots()
            .into_iter()
            .find(|i| i.id == new_id)
            .unwrap();
        let mut contents = fs::read_to_string(&info.path).unwrap();
        contents = contents.replacen("task 0", "task X", 1);
        fs::write(&info.path, contents).unwrap();

        let err = engine.load_by_id(new_id).unwrap_err();
        assert!(matches!(err, Error::CorruptSnapshot { .. }));

        // Recovery falls back to the older valid snapshot.
        let loaded = engine.load_latest_valid().unwrap();
        assert_eq!(loaded.id, old_id);
    }

    #[test]
    fn load_by_unknown_id_is_not_found() {
        let dir = TempDir::new().unwrap();
        let engine = PersistenceEngine::new(config(&dir, true), Uuid::new_v4()).unwrap();
        assert!(matches!(
            engine.load_by_id(Uuid::new_v4()).unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn validation_rejects_dangling_edges() {
        let session = Uuid::new_v4();
        let mut snapshot = snapshot_with_tasks(session, 1);
        snapshot.dependencies.push(taskforge_graph::DependencyEdge::hard(
            snapshot.tasks[0].id,
            Uuid::new_v4(),
        ));
        snapshot.checksum = snapshot.compute_checksum().unwrap();
        assert!(matches!(
            snapshot.validate().unwrap_err(),
            Error::CorruptSnapshot { .. }
        ));
    }

    #[test]
    fn cleanup_trims_to_retention_oldest_first() {
        let dir = TempDir::new().unwrap();
        let session = Uuid::new_v4();
        let mut cfg = config(&dir, false);
        cfg.max_backup_snapshots = 3;
        let mut engine = PersistenceEngine::new(cfg, session).unwrap();

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(engine.save(snapshot_with_tasks(session, 1), "n").unwrap());
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        let deleted = engine.cleanup().unwrap();
        assert_eq!(deleted, 2);
        let remaining: Vec<Uuid> = engine.list_snapshots().iter().map(|i| i.id).collect();
        assert_eq!(remaining.len(), 3);
        // The two oldest are gone.
        assert!(!remaining.contains(&ids[0]));
        assert!(!remaining.contains(&ids[1]));
        assert!(remaining.contains(&ids[4]));
    }

    #[test]
    fn recovery_info_reports_orphans_and_recommendation() {
        let dir = TempDir::new().unwrap();
        let old_session = Uuid::new_v4();
        let mut writer = PersistenceEngine::new(config(&dir, true), old_session).unwrap();

        let mut snapshot = snapshot_with_tasks(old_session, 2);
        snapshot.tasks[0].status = TaskState::Running;
        snapshot.timestamp = Utc::now() - chrono::Duration::seconds(120);
        let running_id = snapshot.tasks[0].id;
        writer.save(snapshot, "pre-crash").unwrap();

        // A new session inspects the same directory.
        let reader = PersistenceEngine::new(config(&dir, true), Uuid::new_v4()).unwrap();
        let info = reader.recovery_info(Utc::now());
        assert_eq!(info.available_snapshots.len(), 1);
        assert_eq!(info.available_snapshots[0].status, SnapshotStatus::Valid);
        assert!(info.recommended_snapshot_id.is_some());
        assert_eq!(info.orphaned_task_ids, vec![running_id]);
        assert!(!info.potential_data_loss);
    }

    #[test]
    fn temp_dir_is_emptied_on_startup() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("temp");
        fs::create_dir_all(&temp).unwrap();
        fs::write(temp.join("leftover.json"), b"junk").unwrap();

        let _engine = PersistenceEngine::new(config(&dir, true), Uuid::new_v4()).unwrap();
        assert!(fs::read_dir(&temp).unwrap().next().is_none());
    }

    #[test]
    fn opportunistic_saves_are_rate_limited() {
        let dir = TempDir::new().unwrap();
        let mut engine = PersistenceEngine::new(config(&dir, true), Uuid::new_v4()).unwrap();
        assert!(engine.allow_opportunistic());
        assert!(!engine.allow_opportunistic());
    }
}
