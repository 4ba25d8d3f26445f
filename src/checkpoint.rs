//! Durable record of which work items reached a terminal outcome.
//!
//! The in-memory record is mutated under one mutex on every outcome. Durable
//! writes go through a separate async lock so they are serialized with each
//! other but never hold up `mark_processed`. Files are written to a
//! temporary sibling, synced, then renamed over the target.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::{BatchforgeError, Result};

/// Running totals kept alongside the id sets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointStats {
    pub start_time: DateTime<Utc>,
    pub processed_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
}

impl Default for CheckpointStats {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            processed_count: 0,
            success_count: 0,
            failure_count: 0,
        }
    }
}

/// On-disk checkpoint format.
///
/// `processed_ids` and `failed_ids` are disjoint: `failed_ids` holds only ids
/// whose latest outcome was a terminal failure.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    pub processed_ids: BTreeSet<String>,
    pub failed_ids: BTreeSet<String>,
    pub stats: CheckpointStats,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct State {
    record: CheckpointRecord,
    since_flush: u64,
    seq: u64,
}

/// In-memory checkpoint with periodic durable snapshots
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    interval: u64,
    state: Mutex<State>,
    /// Sequence number of the last snapshot written to disk
    written: tokio::sync::Mutex<u64>,
}

impl CheckpointStore {
    /// Start from an empty record that will be written to `path`.
    pub fn new(path: impl Into<PathBuf>, interval: u64) -> Self {
        Self::with_record(path, interval, CheckpointRecord::default())
    }

    fn with_record(path: impl Into<PathBuf>, interval: u64, record: CheckpointRecord) -> Self {
        Self {
            path: path.into(),
            interval: interval.max(1),
            state: Mutex::new(State {
                record,
                since_flush: 0,
                seq: 0,
            }),
            written: tokio::sync::Mutex::new(0),
        }
    }

    /// Load the last durable snapshot at `path`, or start empty if there is none.
    pub fn load(path: impl Into<PathBuf>, interval: u64) -> Result<Self> {
        let path = path.into();
        match read_record(&path)? {
            Some(record) => {
                log::info!(
                    "Resuming from checkpoint {}: {} processed, {} failed",
                    path.display(),
                    record.processed_ids.len(),
                    record.failed_ids.len()
                );
                Ok(Self::with_record(path, interval, record))
            }
            None => {
                log::debug!("No checkpoint at {}, starting fresh", path.display());
                Ok(Self::new(path, interval))
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_processed(&self, id: &str) -> bool {
        self.lock().record.processed_ids.contains(id)
    }

    pub fn is_failed(&self, id: &str) -> bool {
        self.lock().record.failed_ids.contains(id)
    }

    /// Record a terminal outcome. Returns true when a durable flush is due.
    pub fn mark_processed(&self, id: &str, success: bool) -> bool {
        let mut state = self.lock();
        let record = &mut state.record;

        if success {
            record.failed_ids.remove(id);
            record.processed_ids.insert(id.to_string());
            record.stats.success_count += 1;
        } else {
            record.processed_ids.remove(id);
            record.failed_ids.insert(id.to_string());
            record.stats.failure_count += 1;
        }
        record.stats.processed_count += 1;

        state.since_flush += 1;
        if state.since_flush >= self.interval {
            state.since_flush = 0;
            true
        } else {
            false
        }
    }

    /// Demote a success whose result could not be persisted.
    ///
    /// Returns false if `id` was not recorded as processed.
    pub fn record_persist_failure(&self, id: &str) -> bool {
        let mut state = self.lock();
        let record = &mut state.record;
        if !record.processed_ids.remove(id) {
            return false;
        }
        record.failed_ids.insert(id.to_string());
        record.stats.success_count = record.stats.success_count.saturating_sub(1);
        record.stats.failure_count += 1;
        true
    }

    /// Copy of the current record, stamped with the current time.
    pub fn snapshot(&self) -> CheckpointRecord {
        self.numbered_snapshot().1
    }

    fn numbered_snapshot(&self) -> (u64, CheckpointRecord) {
        let mut state = self.lock();
        state.seq += 1;
        let mut record = state.record.clone();
        record.timestamp = Utc::now();
        (state.seq, record)
    }

    /// Replace the in-memory record.
    pub fn restore(&self, record: CheckpointRecord) {
        let mut state = self.lock();
        state.record = record;
        state.since_flush = 0;
    }

    pub fn processed_ids(&self) -> BTreeSet<String> {
        self.lock().record.processed_ids.clone()
    }

    pub fn failed_ids(&self) -> BTreeSet<String> {
        self.lock().record.failed_ids.clone()
    }

    /// Forget recorded failures. Returns how many were cleared.
    pub fn clear_failed(&self) -> usize {
        let mut state = self.lock();
        let cleared = state.record.failed_ids.len();
        state.record.failed_ids.clear();
        cleared
    }

    /// Write the current snapshot to disk atomically.
    pub async fn persist(&self) -> Result<()> {
        let (seq, record) = self.numbered_snapshot();
        self.write_snapshot(seq, record).await
    }

    /// Snapshot now and write it without waiting. A failure is logged and
    /// picked up again at the next interval.
    pub fn persist_in_background(self: &Arc<Self>) -> JoinHandle<()> {
        let (seq, record) = self.numbered_snapshot();
        let store = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = store.write_snapshot(seq, record).await {
                log::warn!("Checkpoint write failed, will retry at next interval: {}", e);
            }
        })
    }

    /// Writes are serialized; a snapshot older than the one on disk is dropped.
    async fn write_snapshot(&self, seq: u64, record: CheckpointRecord) -> Result<()> {
        let mut written = self.written.lock().await;
        if *written > seq {
            log::debug!("Skipping stale checkpoint snapshot {} (have {})", seq, *written);
            return Ok(());
        }

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_record(&path, &record))
            .await
            .map_err(|e| BatchforgeError::Checkpoint(format!("checkpoint writer task failed: {}", e)))??;
        *written = seq;
        Ok(())
    }

    /// Remove the checkpoint file at `path`, if present.
    pub fn delete(path: &Path) -> Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Read a checkpoint file without constructing a store.
pub fn read_record(path: &Path) -> Result<Option<CheckpointRecord>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| BatchforgeError::Checkpoint(format!("unreadable checkpoint {}: {}", path.display(), e)))
}

fn write_record(path: &Path, record: &CheckpointRecord) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_vec_pretty(record)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    log::debug!(
        "Checkpoint written to {} ({} processed, {} failed)",
        path.display(),
        record.processed_ids.len(),
        record.failed_ids.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir, interval: u64) -> CheckpointStore {
        CheckpointStore::new(dir.path().join("checkpoint.json"), interval)
    }

    #[test]
    fn test_mark_processed_success_and_failure() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 10);

        store.mark_processed("a", true);
        store.mark_processed("b", false);

        assert!(store.is_processed("a"));
        assert!(!store.is_processed("b"));
        assert!(store.is_failed("b"));

        let record = store.snapshot();
        assert_eq!(record.stats.processed_count, 2);
        assert_eq!(record.stats.success_count, 1);
        assert_eq!(record.stats.failure_count, 1);
    }

    #[test]
    fn test_success_after_failure_clears_failed() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 10);

        store.mark_processed("a", false);
        assert!(store.is_failed("a"));
        store.mark_processed("a", true);

        let record = store.snapshot();
        assert!(record.processed_ids.contains("a"));
        assert!(!record.failed_ids.contains("a"));
        assert!(record.processed_ids.is_disjoint(&record.failed_ids));
    }

    #[test]
    fn test_flush_due_every_interval() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 3);

        let due: Vec<bool> = (0..7).map(|i| store.mark_processed(&format!("id-{}", i), true)).collect();
        assert_eq!(due, vec![false, false, true, false, false, true, false]);
    }

    #[test]
    fn test_record_persist_failure_demotes() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 10);

        store.mark_processed("a", true);
        assert!(store.record_persist_failure("a"));
        assert!(!store.is_processed("a"));
        assert!(store.is_failed("a"));

        let stats = store.snapshot().stats;
        assert_eq!(stats.success_count, 0);
        assert_eq!(stats.failure_count, 1);

        assert!(!store.record_persist_failure("never-seen"));
    }

    #[tokio::test]
    async fn test_persist_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("checkpoint.json");
        let store = CheckpointStore::new(&path, 10);
        store.mark_processed("a", true);
        store.mark_processed("b", false);
        store.persist().await.unwrap();

        assert!(!path.with_extension("json.tmp").exists());

        let loaded = CheckpointStore::load(&path, 10).unwrap();
        assert!(loaded.is_processed("a"));
        assert!(loaded.is_failed("b"));
        assert_eq!(loaded.snapshot().stats.processed_count, 2);
    }

    #[test]
    fn test_file_uses_camel_case_fields() {
        let mut record = CheckpointRecord::default();
        record.processed_ids.insert("a".to_string());
        let json = serde_json::to_value(&record).unwrap();

        assert!(json.get("processedIds").is_some());
        assert!(json.get("failedIds").is_some());
        assert!(json["stats"].get("startTime").is_some());
        assert!(json["stats"].get("successCount").is_some());
        assert!(json.get("timestamp").is_some());
    }

    #[tokio::test]
    async fn test_stale_background_snapshot_is_not_written_over_newer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        let store = Arc::new(CheckpointStore::new(&path, 10));

        store.mark_processed("a", true);
        let (old_seq, old_record) = store.numbered_snapshot();
        store.mark_processed("b", true);
        store.persist().await.unwrap();
        store.write_snapshot(old_seq, old_record).await.unwrap();

        let on_disk = read_record(&path).unwrap().unwrap();
        assert!(on_disk.processed_ids.contains("b"));
    }

    #[tokio::test]
    async fn test_persist_in_background_writes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        let store = Arc::new(CheckpointStore::new(&path, 10));
        store.mark_processed("a", true);

        store.persist_in_background().await.unwrap();
        assert!(read_record(&path).unwrap().unwrap().processed_ids.contains("a"));
    }

    #[test]
    fn test_load_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::load(dir.path().join("absent.json"), 5).unwrap();
        assert!(store.processed_ids().is_empty());
    }

    #[test]
    fn test_load_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        fs::write(&path, "{ not json").unwrap();

        let result = CheckpointStore::load(&path, 5);
        assert!(matches!(result, Err(BatchforgeError::Checkpoint(_))));
    }

    #[test]
    fn test_restore_replaces_state() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 10);
        store.mark_processed("old", true);

        let mut record = CheckpointRecord::default();
        record.processed_ids.insert("new".to_string());
        store.restore(record);

        assert!(store.is_processed("new"));
        assert!(!store.is_processed("old"));
    }

    #[test]
    fn test_clear_failed_and_delete() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        let store = CheckpointStore::new(&path, 10);
        store.mark_processed("a", false);
        store.mark_processed("b", false);
        assert_eq!(store.clear_failed(), 2);
        assert!(store.failed_ids().is_empty());

        assert!(!CheckpointStore::delete(&path).unwrap());
        fs::write(&path, "{}").unwrap();
        assert!(CheckpointStore::delete(&path).unwrap());
    }

    #[tokio::test]
    async fn test_persist_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        // A directory where the file should be makes the rename fail
        let path = dir.path().join("checkpoint.json");
        fs::create_dir_all(path.join("occupied")).unwrap();

        let store = CheckpointStore::new(&path, 10);
        store.mark_processed("a", true);
        assert!(store.persist().await.is_err());
    }
}
