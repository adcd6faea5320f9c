//! Crash recovery: redo committed work from the WAL
//!
//! Recovery finds the most recent checkpoint, scans the log forward from that
//! checkpoint's redo point and replays the OPERATION records of every
//! transaction that has a COMMIT record, in LSN order. Transactions without
//! a COMMIT are left out; nothing is undone.
//!
//! Recovery never appends to the log, so running it twice over the same
//! file yields the same result.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::checkpoint::CheckpointMarker;
use super::log::{LogOperation, Mutation};
use super::reader::WalReader;
use super::types::{Lsn, TxnId, TxnState};
use crate::error::Result;
use crate::storage::StorageApply;

/// Summary of one recovery run
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecoveryInfo {
    pub successful: bool,
    /// Records read from the redo point onward
    pub total_records_processed: u64,
    /// Transactions in the scan that have a COMMIT record
    pub committed_transaction_count: u64,
    /// OPERATION records replayed into storage
    pub operations_redone: u64,
    /// Why recovery failed, when it did
    pub error: Option<String>,
}

impl RecoveryInfo {
    /// Result for a log with nothing to replay
    pub fn empty() -> Self {
        Self {
            successful: true,
            ..Default::default()
        }
    }
}

/// What the writer and transaction manager need to continue after recovery
#[derive(Debug)]
pub(crate) struct RecoveryOutcome {
    pub info: RecoveryInfo,
    pub next_lsn: Lsn,
    pub next_txn_id: TxnId,
    /// Length of the intact prefix of the log
    pub valid_len: u64,
}

/// Where the redo scan starts
struct ScanStart {
    offset: u64,
    redo_lsn: Lsn,
    next_txn_id: TxnId,
}

impl ScanStart {
    fn beginning() -> Self {
        Self {
            offset: 0,
            redo_lsn: 0,
            next_txn_id: 1,
        }
    }
}

/// Progress of the redo scan, kept so a failure can report partial counts
#[derive(Default)]
struct ScanProgress {
    records: u64,
    committed: u64,
    redone: u64,
}

pub struct RecoveryManager {
    wal_path: PathBuf,
    marker_path: PathBuf,
}

impl RecoveryManager {
    pub fn new(wal_path: PathBuf, marker_path: PathBuf) -> Self {
        Self {
            wal_path,
            marker_path,
        }
    }

    pub fn wal_path(&self) -> &Path {
        &self.wal_path
    }

    /// Replay the log into `storage`. Failures are reported in the returned
    /// [`RecoveryInfo`], never as an `Err`.
    pub(crate) fn recover(&self, storage: &dyn StorageApply) -> RecoveryOutcome {
        if !self.wal_path.exists() {
            log::info!("No WAL at {}, nothing to recover", self.wal_path.display());
            return RecoveryOutcome {
                info: RecoveryInfo::empty(),
                next_lsn: 1,
                next_txn_id: 1,
                valid_len: 0,
            };
        }

        log::info!("Starting recovery from WAL...");
        let mut progress = ScanProgress::default();
        match self.replay(storage, &mut progress) {
            Ok(outcome) => {
                log::info!(
                    "Recovery complete: {} records, {} committed transactions, {} operations redone. Next LSN: {}, Next TxnId: {}",
                    outcome.info.total_records_processed,
                    outcome.info.committed_transaction_count,
                    outcome.info.operations_redone,
                    outcome.next_lsn,
                    outcome.next_txn_id
                );
                outcome
            }
            Err(e) => {
                log::error!("Recovery failed: {}", e);
                RecoveryOutcome {
                    info: RecoveryInfo {
                        successful: false,
                        total_records_processed: progress.records,
                        committed_transaction_count: progress.committed,
                        operations_redone: progress.redone,
                        error: Some(e.to_string()),
                    },
                    next_lsn: 1,
                    next_txn_id: 1,
                    valid_len: 0,
                }
            }
        }
    }

    fn replay(&self, storage: &dyn StorageApply, progress: &mut ScanProgress) -> Result<RecoveryOutcome> {
        let mut reader = WalReader::open(&self.wal_path)?;
        let start = self.locate_start(&mut reader)?;
        if start.redo_lsn > 0 {
            log::info!(
                "Redo starts at LSN {} (byte {})",
                start.redo_lsn,
                start.offset
            );
        }

        reader.seek(start.offset)?;

        let mut max_lsn: Lsn = start.redo_lsn.saturating_sub(1);
        let mut max_txn_id: TxnId = 0;
        let mut next_txn_floor = start.next_txn_id;
        let mut outcomes: HashMap<TxnId, TxnState> = HashMap::new();
        let mut operations: Vec<(TxnId, Mutation)> = Vec::new();

        while let Some((_, record)) = reader.next_record()? {
            max_lsn = max_lsn.max(record.lsn);
            if record.lsn < start.redo_lsn {
                continue;
            }
            progress.records += 1;
            max_txn_id = max_txn_id.max(record.txn_id);

            match record.op {
                LogOperation::Begin => {}
                LogOperation::Operation(mutation) => operations.push((record.txn_id, mutation)),
                LogOperation::Commit => {
                    outcomes.entry(record.txn_id).or_insert(TxnState::Committed);
                }
                LogOperation::Abort => {
                    outcomes.entry(record.txn_id).or_insert(TxnState::Aborted);
                }
                LogOperation::Checkpoint(cp) => {
                    next_txn_floor = next_txn_floor.max(cp.next_txn_id);
                }
            }
        }
        let valid_len = reader.valid_len();
        if reader.torn_tail() {
            log::warn!("WAL ends in an incomplete frame; intact prefix is {} bytes", valid_len);
        }

        let is_committed =
            |txn_id: &TxnId| matches!(outcomes.get(txn_id), Some(TxnState::Committed));
        progress.committed = outcomes.keys().filter(|id| is_committed(id)).count() as u64;

        for (txn_id, mutation) in &operations {
            if is_committed(txn_id) {
                storage.apply_operation(mutation)?;
                progress.redone += 1;
            }
        }

        let uncommitted = operations
            .iter()
            .filter(|(txn_id, _)| !is_committed(txn_id))
            .count();
        if uncommitted > 0 {
            log::info!("Skipped {} operations of uncommitted transactions", uncommitted);
        }

        Ok(RecoveryOutcome {
            info: RecoveryInfo {
                successful: true,
                total_records_processed: progress.records,
                committed_transaction_count: progress.committed,
                operations_redone: progress.redone,
                error: None,
            },
            next_lsn: max_lsn + 1,
            next_txn_id: (max_txn_id + 1).max(next_txn_floor).max(1),
            valid_len,
        })
    }

    /// Find the most recent checkpoint and the redo point it names
    fn locate_start(&self, reader: &mut WalReader) -> Result<ScanStart> {
        if let Some(start) = self.start_from_marker(reader) {
            return Ok(start);
        }

        // No usable marker: scan the whole log for the last checkpoint
        reader.seek(0)?;
        let mut start = ScanStart::beginning();
        while let Some((_, record)) = reader.next_record()? {
            if let LogOperation::Checkpoint(cp) = record.op {
                start.redo_lsn = cp.redo_lsn;
                start.next_txn_id = cp.next_txn_id;
            }
        }
        if start.redo_lsn > 0 {
            log::info!("Found checkpoint in WAL, redo point LSN {}", start.redo_lsn);
        }
        Ok(start)
    }

    /// Trust the marker file only if the log agrees with it
    fn start_from_marker(&self, reader: &mut WalReader) -> Option<ScanStart> {
        let marker = CheckpointMarker::load(&self.marker_path)?;

        let checkpoint = match reader.read_at(marker.checkpoint_offset) {
            Ok(Some(record)) if record.lsn == marker.checkpoint_lsn => match record.op {
                LogOperation::Checkpoint(cp) => cp,
                _ => return self.reject_marker(&marker, "record is not a checkpoint"),
            },
            Ok(_) => return self.reject_marker(&marker, "checkpoint record not found"),
            Err(e) => return self.reject_marker(&marker, &e.to_string()),
        };

        match reader.read_at(marker.redo_offset) {
            Ok(Some(record)) if record.lsn == checkpoint.redo_lsn => {}
            Ok(_) => return self.reject_marker(&marker, "redo point not found"),
            Err(e) => return self.reject_marker(&marker, &e.to_string()),
        }

        log::info!(
            "Found checkpoint at LSN {} - skipping WAL records before LSN {}",
            marker.checkpoint_lsn,
            checkpoint.redo_lsn
        );
        Some(ScanStart {
            offset: marker.redo_offset,
            redo_lsn: checkpoint.redo_lsn,
            next_txn_id: checkpoint.next_txn_id,
        })
    }

    fn reject_marker(&self, marker: &CheckpointMarker, reason: &str) -> Option<ScanStart> {
        log::warn!(
            "Ignoring checkpoint file (LSN {} at byte {}): {}",
            marker.checkpoint_lsn,
            marker.checkpoint_offset,
            reason
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::granite::checkpoint::CHECKPOINT_FILE;
    use crate::granite::codec::encode_frame;
    use crate::granite::log::{CheckpointRecord, LogRecord};
    use crate::storage::MemoryStorage;
    use crate::types::{ColumnDef, DataType, TableSchema, Value};
    use std::fs::File;
    use std::io::Write;

    struct LogBuilder {
        records: Vec<LogRecord>,
    }

    impl LogBuilder {
        fn new() -> Self {
            Self { records: Vec::new() }
        }

        fn push(&mut self, txn_id: TxnId, op: LogOperation) -> &mut Self {
            let lsn = self.records.len() as Lsn + 1;
            self.records.push(LogRecord {
                lsn,
                txn_id,
                op,
                timestamp: 0,
            });
            self
        }

        /// Write the log; returns each record's byte offset
        fn write(&self, path: &Path) -> Vec<u64> {
            let mut file = File::create(path).unwrap();
            let mut offsets = Vec::new();
            let mut offset = 0;
            for record in &self.records {
                let frame = encode_frame(record).unwrap();
                offsets.push(offset);
                offset += frame.len() as u64;
                file.write_all(&frame).unwrap();
            }
            offsets
        }
    }

    fn create_items() -> LogOperation {
        LogOperation::Operation(Mutation::CreateTable {
            schema: TableSchema::new("items", vec![ColumnDef::new("id", DataType::Integer)]),
        })
    }

    fn insert(row_id: u64) -> LogOperation {
        LogOperation::Operation(Mutation::Insert {
            table: "items".to_string(),
            row_id,
            values: vec![Value::Integer(row_id as i64)],
        })
    }

    fn manager(dir: &Path) -> RecoveryManager {
        RecoveryManager::new(dir.join("wal.log"), dir.join(CHECKPOINT_FILE))
    }

    #[test]
    fn test_missing_log_is_empty_success() {
        let temp_dir = tempfile::tempdir().unwrap();
        let outcome = manager(temp_dir.path()).recover(&MemoryStorage::new());
        assert_eq!(outcome.info, RecoveryInfo::empty());
        assert_eq!(outcome.next_lsn, 1);
        assert_eq!(outcome.next_txn_id, 1);
    }

    #[test]
    fn test_redo_only_committed_transactions() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut log = LogBuilder::new();
        log.push(1, LogOperation::Begin)
            .push(1, create_items())
            .push(1, insert(1))
            .push(1, LogOperation::Commit)
            .push(2, LogOperation::Begin)
            .push(2, insert(2))
            .push(2, LogOperation::Abort)
            .push(3, LogOperation::Begin)
            .push(3, insert(3));
        log.write(&temp_dir.path().join("wal.log"));

        let storage = MemoryStorage::new();
        let outcome = manager(temp_dir.path()).recover(&storage);

        assert!(outcome.info.successful);
        assert_eq!(outcome.info.total_records_processed, 9);
        assert_eq!(outcome.info.committed_transaction_count, 1);
        assert_eq!(outcome.info.operations_redone, 2);
        assert_eq!(outcome.next_lsn, 10);
        assert_eq!(outcome.next_txn_id, 4);

        let rows = storage.scan_table("items").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 1);
    }

    #[test]
    fn test_first_terminal_record_decides() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut log = LogBuilder::new();
        log.push(1, LogOperation::Begin)
            .push(1, create_items())
            .push(1, LogOperation::Abort)
            .push(1, LogOperation::Commit);
        log.write(&temp_dir.path().join("wal.log"));

        let storage = MemoryStorage::new();
        let outcome = manager(temp_dir.path()).recover(&storage);
        assert!(outcome.info.successful);
        assert_eq!(outcome.info.committed_transaction_count, 0);
        assert!(!storage.table_exists("items"));
    }

    #[test]
    fn test_marker_lets_scan_start_at_redo_point() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut log = LogBuilder::new();
        log.push(1, LogOperation::Begin)
            .push(1, create_items())
            .push(1, LogOperation::Commit)
            .push(
                0,
                LogOperation::Checkpoint(CheckpointRecord {
                    cut_lsn: 3,
                    active_txns: vec![],
                    redo_lsn: 4,
                    next_txn_id: 2,
                }),
            )
            .push(2, LogOperation::Begin)
            .push(2, insert(7))
            .push(2, LogOperation::Commit);
        let offsets = log.write(&temp_dir.path().join("wal.log"));

        CheckpointMarker {
            checkpoint_lsn: 4,
            checkpoint_offset: offsets[3],
            redo_lsn: 4,
            redo_offset: offsets[3],
            active_txns: vec![],
            next_txn_id: 2,
            timestamp: 0,
        }
        .store(&temp_dir.path().join(CHECKPOINT_FILE))
        .unwrap();

        // Storage already holds everything before the checkpoint
        let storage = MemoryStorage::new();
        storage
            .create_table(TableSchema::new("items", vec![ColumnDef::new("id", DataType::Integer)]))
            .unwrap();

        let outcome = manager(temp_dir.path()).recover(&storage);
        assert!(outcome.info.successful);
        assert_eq!(outcome.info.total_records_processed, 4);
        assert_eq!(outcome.info.committed_transaction_count, 1);
        assert_eq!(outcome.info.operations_redone, 1);
        assert_eq!(outcome.next_lsn, 8);
        assert_eq!(outcome.next_txn_id, 3);
        assert!(storage.get_row("items", 7).unwrap().is_some());
    }

    #[test]
    fn test_stale_marker_falls_back_to_scan() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut log = LogBuilder::new();
        log.push(1, LogOperation::Begin)
            .push(1, create_items())
            .push(1, LogOperation::Commit);
        log.write(&temp_dir.path().join("wal.log"));

        CheckpointMarker {
            checkpoint_lsn: 40,
            checkpoint_offset: 9_999,
            redo_lsn: 40,
            redo_offset: 9_999,
            active_txns: vec![],
            next_txn_id: 1,
            timestamp: 0,
        }
        .store(&temp_dir.path().join(CHECKPOINT_FILE))
        .unwrap();

        let storage = MemoryStorage::new();
        let outcome = manager(temp_dir.path()).recover(&storage);
        assert!(outcome.info.successful);
        assert_eq!(outcome.info.total_records_processed, 3);
        assert!(storage.table_exists("items"));
    }

    #[test]
    fn test_checkpoint_found_by_scan_keeps_active_transactions() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut log = LogBuilder::new();
        log.push(1, LogOperation::Begin)
            .push(1, create_items())
            .push(1, LogOperation::Commit)
            .push(2, LogOperation::Begin)
            .push(2, insert(1))
            .push(
                0,
                LogOperation::Checkpoint(CheckpointRecord {
                    cut_lsn: 5,
                    active_txns: vec![2],
                    redo_lsn: 4,
                    next_txn_id: 3,
                }),
            )
            .push(2, LogOperation::Commit);
        log.write(&temp_dir.path().join("wal.log"));

        let storage = MemoryStorage::new();
        storage
            .create_table(TableSchema::new("items", vec![ColumnDef::new("id", DataType::Integer)]))
            .unwrap();

        let outcome = manager(temp_dir.path()).recover(&storage);
        assert!(outcome.info.successful);
        // LSNs 4..=7 are at or after the redo point
        assert_eq!(outcome.info.total_records_processed, 4);
        assert_eq!(outcome.info.operations_redone, 1);
        assert_eq!(outcome.next_lsn, 8);
        assert!(storage.get_row("items", 1).unwrap().is_some());
    }

    #[test]
    fn test_corruption_fails_recovery_without_redo() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("wal.log");
        let mut log = LogBuilder::new();
        log.push(1, LogOperation::Begin)
            .push(1, create_items())
            .push(1, LogOperation::Commit)
            .push(2, LogOperation::Begin);
        let offsets = log.write(&path);

        // Flip a byte inside the third record's body
        let mut bytes = std::fs::read(&path).unwrap();
        let target = offsets[2] as usize + 10;
        bytes[target] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let storage = MemoryStorage::new();
        let outcome = manager(temp_dir.path()).recover(&storage);
        assert!(!outcome.info.successful);
        assert!(outcome.info.error.as_deref().unwrap().contains("corrupted"));
        assert_eq!(outcome.info.operations_redone, 0);
        assert!(!storage.table_exists("items"));
    }

    struct RejectingStorage;

    impl StorageApply for RejectingStorage {
        fn apply_operation(&self, _mutation: &Mutation) -> std::result::Result<(), StorageError> {
            Err(StorageError::new("disk is read-only"))
        }
    }

    #[test]
    fn test_storage_failure_fails_recovery() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut log = LogBuilder::new();
        log.push(1, LogOperation::Begin)
            .push(1, create_items())
            .push(1, LogOperation::Commit);
        log.write(&temp_dir.path().join("wal.log"));

        let outcome = manager(temp_dir.path()).recover(&RejectingStorage);
        assert!(!outcome.info.successful);
        assert_eq!(outcome.info.total_records_processed, 3);
        assert!(outcome.info.error.unwrap().contains("read-only"));
    }

    #[test]
    fn test_torn_tail_reports_valid_length() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("wal.log");
        let mut log = LogBuilder::new();
        log.push(1, LogOperation::Begin).push(1, LogOperation::Commit);
        log.write(&path);
        let intact = std::fs::metadata(&path).unwrap().len();

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x30, 0x00]).unwrap();

        let outcome = manager(temp_dir.path()).recover(&MemoryStorage::new());
        assert!(outcome.info.successful);
        assert_eq!(outcome.valid_len, intact);
        assert_eq!(outcome.next_lsn, 3);
    }
}
