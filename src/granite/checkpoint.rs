//! Checkpoint coordinator
//!
//! A checkpoint records which transactions were ACTIVE at a cut point of the
//! log and where recovery may start scanning. Taking one:
//!
//! 1. Under the registry lock (so no transaction can begin, log or commit in
//!    between): ask the storage engine to persist, snapshot the active set,
//!    append the CHECKPOINT record.
//! 2. Flush the log so the record is durable.
//! 3. Replace the `wal.checkpoint` marker file, which lets recovery seek
//!    straight to the record instead of scanning for it.
//!
//! The marker is only a hint. Recovery verifies it against the log and falls
//! back to a full scan when it is missing, stale or unreadable.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::log::{CheckpointRecord, LogOperation};
use super::types::{Lsn, TxnId, TxnRegistry};
use super::wal::WalWriter;
use crate::error::{GraniteError, Result};
use crate::storage::StorageApply;

/// File name of the checkpoint marker inside the log directory
pub const CHECKPOINT_FILE: &str = "wal.checkpoint";

/// Contents of the `wal.checkpoint` marker file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMarker {
    pub checkpoint_lsn: Lsn,
    /// Byte offset of the CHECKPOINT record's frame
    pub checkpoint_offset: u64,
    pub redo_lsn: Lsn,
    /// Byte offset of the frame carrying `redo_lsn`
    pub redo_offset: u64,
    pub active_txns: Vec<TxnId>,
    pub next_txn_id: TxnId,
    pub timestamp: u64,
}

impl CheckpointMarker {
    /// Read the marker, or `None` if it is missing or unreadable
    pub fn load(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(s) => match serde_json::from_str::<CheckpointMarker>(&s) {
                Ok(marker) => Some(marker),
                Err(e) => {
                    log::warn!("Failed to parse checkpoint file: {}", e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read checkpoint file '{}': {}", path.display(), e);
                None
            }
        }
    }

    /// Replace the marker atomically: write a temp file in the same
    /// directory, fsync it, rename it over the old one
    pub fn store(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| GraniteError::Io(e.error))?;
        Ok(())
    }
}

/// Takes checkpoints and tracks log growth between them
pub struct CheckpointCoordinator {
    marker_path: PathBuf,
    /// Serializes whole checkpoints so markers are replaced in LSN order
    in_progress: Mutex<()>,
    last_checkpoint_lsn: AtomicU64,
    bytes_since_checkpoint: AtomicU64,
    threshold_bytes: u64,
}

impl CheckpointCoordinator {
    pub fn new(log_dir: &Path, threshold_bytes: u64) -> Self {
        Self {
            marker_path: log_dir.join(CHECKPOINT_FILE),
            in_progress: Mutex::new(()),
            last_checkpoint_lsn: AtomicU64::new(0),
            bytes_since_checkpoint: AtomicU64::new(0),
            threshold_bytes,
        }
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }

    /// LSN of the last checkpoint taken by this instance (0 if none)
    pub fn last_checkpoint_lsn(&self) -> Lsn {
        self.last_checkpoint_lsn.load(Ordering::Acquire)
    }

    /// Account for bytes appended to the log
    pub fn note_appended(&self, bytes: u64) {
        self.bytes_since_checkpoint.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Whether enough log has accumulated for an automatic checkpoint
    pub fn should_checkpoint(&self) -> bool {
        self.threshold_bytes > 0
            && self.bytes_since_checkpoint.load(Ordering::Relaxed) >= self.threshold_bytes
    }

    /// Take a checkpoint and return the LSN of its CHECKPOINT record
    pub(crate) fn checkpoint(
        &self,
        wal: &WalWriter,
        registry: &Mutex<TxnRegistry>,
        storage: &dyn StorageApply,
    ) -> Result<Lsn> {
        let _serial = self
            .in_progress
            .lock()
            .map_err(|_| GraniteError::io_other("checkpoint lock poisoned"))?;

        let marker = {
            let mut registry = registry
                .lock()
                .map_err(|_| GraniteError::io_other("transaction registry lock poisoned"))?;
            registry.go_online()?;

            // Work older than the redo point is never replayed again
            storage.persist()?;

            let mut active_txns: Vec<TxnId> = registry.active().map(|t| t.id).collect();
            active_txns.sort_unstable();
            let earliest = registry
                .active()
                .min_by_key(|t| t.begin_lsn)
                .map(|t| (t.begin_lsn, t.begin_offset));

            let cut_lsn = wal.last_lsn()?;
            let (redo_lsn, redo_offset) = match earliest {
                Some(begin) => begin,
                None => (cut_lsn + 1, wal.end_offset()?),
            };

            let record = CheckpointRecord {
                cut_lsn,
                active_txns: active_txns.clone(),
                redo_lsn,
                next_txn_id: registry.next_txn_id,
            };
            let position = wal.append(0, LogOperation::Checkpoint(record))?;
            self.note_appended(position.len);

            CheckpointMarker {
                checkpoint_lsn: position.lsn,
                checkpoint_offset: position.offset,
                redo_lsn,
                redo_offset,
                active_txns,
                next_txn_id: registry.next_txn_id,
                timestamp: timestamp(),
            }
        };

        let durable = wal.flush()?;
        if durable < marker.checkpoint_lsn {
            return Err(GraniteError::io_other(format!(
                "checkpoint LSN {} not durable after flush (durable LSN {})",
                marker.checkpoint_lsn, durable
            )));
        }

        marker.store(&self.marker_path)?;
        self.last_checkpoint_lsn
            .fetch_max(marker.checkpoint_lsn, Ordering::AcqRel);
        self.bytes_since_checkpoint.store(0, Ordering::Relaxed);

        log::info!(
            "Checkpoint at LSN {} ({} active transactions, redo from LSN {})",
            marker.checkpoint_lsn,
            marker.active_txns.len(),
            marker.redo_lsn
        );
        Ok(marker.checkpoint_lsn)
    }
}

fn timestamp() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_millis() as u64,
        Err(_) => 0,
    }
}
