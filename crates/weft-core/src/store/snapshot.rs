//! JSON snapshots of the in-memory backend.
//!
//! Lets a short-lived process (the CLI) keep its queue between runs. Writes
//! go to a sibling temp file first and are renamed into place.
//!
//! A snapshot is only safe to rewrite by the process that loaded it. Every
//! process goes through [`StateFile`], which holds an exclusive lock on a
//! sibling `.lock` file from load until save, so a second process fails
//! fast instead of overwriting tasks it never saw.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fd_lock::{RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

use super::memory::{InMemoryTaskStore, StoreState};
use crate::domain::{DeadLetterEntry, TaskId, TaskRecord, WorkerInfo};
use crate::error::StoreError;
use crate::ports::{Clock, UlidGenerator};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    /// Pending and processing tasks.
    pub active: Vec<TaskRecord>,
    pub completed: Vec<TaskRecord>,
    pub dead_letters: Vec<DeadLetterEntry>,
    pub idempotency_keys: BTreeMap<String, TaskId>,
    pub workers: Vec<WorkerInfo>,
}

impl InMemoryTaskStore {
    pub async fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.lock().await;
        let mut active: Vec<TaskRecord> = state.active.values().cloned().collect();
        active.sort_by_key(|r| r.id);
        let mut completed: Vec<TaskRecord> = state.completed.values().cloned().collect();
        completed.sort_by_key(|r| r.id);
        let mut dead_letters: Vec<DeadLetterEntry> = state.dead_letters.values().cloned().collect();
        dead_letters.sort_by_key(|e| e.id);
        let mut workers: Vec<WorkerInfo> = state.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

        StoreSnapshot {
            version: SNAPSHOT_VERSION,
            active,
            completed,
            dead_letters,
            idempotency_keys: state
                .idempotency
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            workers,
        }
    }

    /// Rebuild a store, including its pending index, from a snapshot.
    pub fn from_snapshot(
        snapshot: StoreSnapshot,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::Snapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let mut state = StoreState::default();
        for record in snapshot.active {
            if record.status.is_terminal() {
                return Err(StoreError::Snapshot(format!(
                    "task {} is {:?} but listed as active",
                    record.id, record.status
                )));
            }
            state.insert_active(record);
        }
        for record in snapshot.completed {
            state.completed.insert(record.id, record);
        }
        for entry in snapshot.dead_letters {
            state.dead_letter_by_task.insert(entry.task_id, entry.id);
            state.dead_letters.insert(entry.id, entry);
        }
        state.idempotency = snapshot.idempotency_keys.into_iter().collect();
        state.workers = snapshot
            .workers
            .into_iter()
            .map(|w| (w.worker_id.clone(), w))
            .collect();

        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Ok(Self::from_state(state, clock, ids))
    }

    pub async fn save_to(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        let snapshot = self.snapshot().await;
        let json = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| StoreError::Snapshot(format!("encode: {e}")))?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StoreError::Snapshot(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| StoreError::Snapshot(format!("rename to {}: {e}", path.display())))
    }

    /// Load a snapshot file. A missing file gives an empty store.
    pub async fn load_from(
        path: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::with_clock(clock));
            }
            Err(e) => {
                return Err(StoreError::Snapshot(format!(
                    "read {}: {e}",
                    path.display()
                )));
            }
        };
        let snapshot: StoreSnapshot = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Snapshot(format!("decode {}: {e}", path.display())))?;
        Self::from_snapshot(snapshot, clock)
    }
}

/// A snapshot path plus the lock file guarding it.
pub struct StateFile {
    path: PathBuf,
    lock: RwLock<File>,
}

impl StateFile {
    /// Open (creating if needed) the lock file next to `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| StoreError::Snapshot(format!("open {}: {e}", lock_path.display())))?;
        Ok(Self {
            path,
            lock: RwLock::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the exclusive lock without waiting.
    pub fn try_lock(&mut self) -> Result<StateLock<'_>, StoreError> {
        let StateFile { path, lock } = self;
        match lock.try_write() {
            Ok(guard) => Ok(StateLock {
                path,
                _guard: guard,
            }),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                Err(StoreError::StateLocked(path.display().to_string()))
            }
            Err(e) => Err(StoreError::Snapshot(format!("lock {}: {e}", path.display()))),
        }
    }
}

/// Held for as long as the snapshot may be loaded and rewritten.
pub struct StateLock<'a> {
    path: &'a Path,
    _guard: RwLockWriteGuard<'a, File>,
}

impl StateLock<'_> {
    pub async fn load(&self, clock: Arc<dyn Clock>) -> Result<InMemoryTaskStore, StoreError> {
        InMemoryTaskStore::load_from(self.path, clock).await
    }

    pub async fn save(&self, store: &InMemoryTaskStore) -> Result<(), StoreError> {
        store.save_to(self.path).await
    }
}
