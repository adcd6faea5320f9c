//! Transaction Manager for GraniteDB
//!
//! Tracks every transaction the engine issues and writes its BEGIN,
//! OPERATION, COMMIT and ABORT records to the Granite WAL.
//!
//! ### Lifecycle
//! 1. Construct with a [`DurabilityConfig`] and the storage engine's apply interface
//! 2. [`TransactionManager::perform_recovery`] replays committed work from the log
//! 3. Normal operation: begin, log, commit or roll back, checkpoint
//!
//! With a log directory configured, transactional calls before a successful
//! recovery are refused, and recovery is refused once the first transaction
//! has begun. Without a log directory the manager runs in degraded mode:
//! transactions are tracked but nothing is written and nothing survives a
//! restart.
//!
//! ### Commit path
//! - BEGIN and OPERATION records are written but not fsynced
//! - COMMIT is appended under the registry lock, then the committer waits on
//!   its commit latch outside the lock, so concurrent commits share an fsync
//! - A write or fsync failure leaves the transaction ACTIVE and poisoned;
//!   only rollback is accepted afterwards
//!
//! ### Rollback
//! Rollback writes an ABORT record. Mutations already applied to storage are
//! not undone. A transaction whose COMMIT record is queued on a healthy
//! writer cannot be rolled back.
//!
//! Lock order: registry, then the WAL append lock.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

pub use super::log::{LogOperation, Mutation};
pub use super::types::{Lsn, Transaction, TxnId, TxnState};
use super::checkpoint::{CheckpointCoordinator, CHECKPOINT_FILE};
use super::recovery::{RecoveryInfo, RecoveryManager};
use super::types::{Phase, TxnRegistry};
use super::wal::{GraniteConfig, WalWriter};

use crate::error::{GraniteError, Result};
use crate::session::Session;
use crate::storage::StorageApply;
use crate::types::{TableSchema, Value};

/// File name of the log inside the log directory
pub const WAL_FILE: &str = "wal.log";

/// Where (and whether) the engine keeps its log
#[derive(Debug, Clone)]
pub struct DurabilityConfig {
    /// Directory holding `wal.log` and `wal.checkpoint`. `None` disables logging.
    pub log_dir: Option<PathBuf>,
    pub granite: GraniteConfig,
}

impl DurabilityConfig {
    /// Log to `log_dir` with the default Granite settings
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: Some(log_dir.into()),
            granite: GraniteConfig::default(),
        }
    }

    /// Degraded mode: no log, no recovery
    pub fn disabled() -> Self {
        Self {
            log_dir: None,
            granite: GraniteConfig::default(),
        }
    }

    pub fn with_granite(mut self, granite: GraniteConfig) -> Self {
        self.granite = granite;
        self
    }
}

/// Log-side components, present only when a log directory is configured
struct WalComponents {
    writer: WalWriter,
    checkpoints: CheckpointCoordinator,
    recovery: RecoveryManager,
}

/// The Transaction Manager
///
/// Shared across execution contexts behind an `Arc`; each context keeps its
/// own [`Session`].
pub struct TransactionManager {
    config: DurabilityConfig,
    storage: Arc<dyn StorageApply>,
    wal: Option<WalComponents>,
    registry: Mutex<TxnRegistry>,
}

impl TransactionManager {
    /// Create a manager. With a log directory this opens (or creates) the
    /// log and starts the WAL worker; recovery still has to run before
    /// transactions are accepted.
    pub fn new(config: DurabilityConfig, storage: Arc<dyn StorageApply>) -> Result<Self> {
        let wal = match &config.log_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                let writer = WalWriter::open(dir.join(WAL_FILE), config.granite.clone())?;
                log::info!("Granite WAL enabled at {}", writer.path().display());
                Some(WalComponents {
                    writer,
                    checkpoints: CheckpointCoordinator::new(
                        dir,
                        config.granite.checkpoint_threshold_bytes,
                    ),
                    recovery: RecoveryManager::new(dir.join(WAL_FILE), dir.join(CHECKPOINT_FILE)),
                })
            }
            None => {
                log::warn!("No log directory configured; running without write-ahead logging");
                None
            }
        };

        Ok(Self {
            registry: Mutex::new(TxnRegistry::new(wal.is_some())),
            config,
            storage,
            wal,
        })
    }

    /// Create a manager and run recovery, refusing to come up if it fails
    pub fn open(config: DurabilityConfig, storage: Arc<dyn StorageApply>) -> Result<(Self, RecoveryInfo)> {
        let manager = Self::new(config, storage)?;
        let info = manager.perform_recovery()?;
        if !info.successful {
            return Err(GraniteError::RecoveryFailed(
                info.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        Ok((manager, info))
    }

    fn registry(&self) -> Result<MutexGuard<'_, TxnRegistry>> {
        self.registry
            .lock()
            .map_err(|_| GraniteError::io_other("transaction registry lock poisoned"))
    }

    pub fn config(&self) -> &DurabilityConfig {
        &self.config
    }

    pub fn is_wal_enabled(&self) -> bool {
        self.wal.is_some()
    }

    /// Path of the log file, if logging is enabled
    pub fn wal_path(&self) -> Option<&Path> {
        self.wal.as_ref().map(|w| w.writer.path())
    }

    /// Replay committed work from the log into storage.
    ///
    /// Corruption and storage failures are reported through
    /// [`RecoveryInfo::successful`]; the engine then refuses transactional
    /// work. Running recovery again before the first transaction is allowed
    /// and reports the same counts.
    pub fn perform_recovery(&self) -> Result<RecoveryInfo> {
        let mut registry = self.registry()?;
        if registry.phase == Phase::Online {
            return Err(GraniteError::RecoveryAfterStartup);
        }

        let Some(wal) = &self.wal else {
            log::info!("Write-ahead logging disabled, skipping recovery");
            registry.phase = Phase::Recovered;
            return Ok(RecoveryInfo::empty());
        };

        let outcome = wal.recovery.recover(self.storage.as_ref());
        if !outcome.info.successful {
            let reason = outcome
                .info
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());
            registry.phase = Phase::Failed(reason);
            return Ok(outcome.info);
        }

        if let Err(e) = wal.writer.resume(outcome.next_lsn, outcome.valid_len) {
            registry.phase = Phase::Failed(e.to_string());
            return Err(e);
        }
        registry.next_txn_id = registry.next_txn_id.max(outcome.next_txn_id);
        registry.phase = Phase::Recovered;
        Ok(outcome.info)
    }

    /// Begin a new transaction
    pub fn begin_transaction(&self) -> Result<TxnId> {
        let mut registry = self.registry()?;
        registry.go_online()?;

        let txn_id = registry.next_txn_id;
        let (begin_lsn, begin_offset) = match &self.wal {
            Some(wal) => {
                // BEGIN need not be durable: without a COMMIT the transaction is never redone
                let pos = wal.writer.append(txn_id, LogOperation::Begin)?;
                wal.checkpoints.note_appended(pos.len);
                (pos.lsn, pos.offset)
            }
            None => (0, 0),
        };

        registry.next_txn_id += 1;
        registry
            .txns
            .insert(txn_id, Transaction::new(txn_id, begin_lsn, begin_offset));
        log::debug!("Began transaction {} at LSN {}", txn_id, begin_lsn);
        Ok(txn_id)
    }

    /// Associate (or with `None`, dissociate) the session's current transaction
    pub fn set_current_transaction(&self, session: &mut Session, txn_id: Option<TxnId>) -> Result<()> {
        if let Some(id) = txn_id {
            let registry = self.registry()?;
            let txn = registry.get(id)?;
            if !txn.is_active() {
                return Err(GraniteError::InvalidTransactionState {
                    txn_id: id,
                    state: txn.state,
                    reason: "cannot make a finished transaction current",
                });
            }
        }
        session.current_txn = txn_id;
        Ok(())
    }

    /// Log a mutation for the session's current transaction.
    /// Returns the record's LSN (0 when logging is disabled).
    pub fn log_operation(&self, session: &Session, mutation: Mutation) -> Result<Lsn> {
        let txn_id = session.current_txn.ok_or(GraniteError::NoCurrentTransaction)?;
        self.log_mutation(txn_id, mutation)
    }

    fn log_mutation(&self, txn_id: TxnId, mutation: Mutation) -> Result<Lsn> {
        let mut registry = self.registry()?;
        let txn = registry.get_mut(txn_id)?;
        txn.check_accepts_work()?;

        let lsn = match &self.wal {
            Some(wal) => match wal.writer.append(txn_id, LogOperation::Operation(mutation)) {
                Ok(pos) => {
                    wal.checkpoints.note_appended(pos.len);
                    pos.lsn
                }
                Err(e) => {
                    log::error!("Failed to log operation for transaction {}: {}", txn_id, e);
                    txn.poisoned = true;
                    return Err(e);
                }
            },
            None => 0,
        };

        txn.operations += 1;
        Ok(lsn)
    }

    /// Log an insert operation (non-durable write - durability comes at commit time)
    pub fn log_insert(&self, session: &Session, table: &str, row_id: u64, values: &[Value]) -> Result<Lsn> {
        self.log_operation(
            session,
            Mutation::Insert {
                table: table.to_string(),
                row_id,
                values: values.to_vec(),
            },
        )
    }

    /// Log an update operation (non-durable write)
    pub fn log_update(
        &self,
        session: &Session,
        table: &str,
        row_id: u64,
        old_values: &[Value],
        new_values: &[Value],
    ) -> Result<Lsn> {
        self.log_operation(
            session,
            Mutation::Update {
                table: table.to_string(),
                row_id,
                old_values: old_values.to_vec(),
                new_values: new_values.to_vec(),
            },
        )
    }

    /// Log a delete operation (non-durable write)
    pub fn log_delete(&self, session: &Session, table: &str, row_id: u64, old_values: &[Value]) -> Result<Lsn> {
        self.log_operation(
            session,
            Mutation::Delete {
                table: table.to_string(),
                row_id,
                old_values: old_values.to_vec(),
            },
        )
    }

    pub fn log_create_table(&self, session: &Session, schema: &TableSchema) -> Result<Lsn> {
        self.log_operation(
            session,
            Mutation::CreateTable {
                schema: schema.clone(),
            },
        )
    }

    pub fn log_drop_table(&self, session: &Session, table: &str) -> Result<Lsn> {
        self.log_operation(
            session,
            Mutation::DropTable {
                table: table.to_string(),
            },
        )
    }

    pub fn log_truncate_table(&self, session: &Session, table: &str) -> Result<Lsn> {
        self.log_operation(
            session,
            Mutation::TruncateTable {
                table: table.to_string(),
            },
        )
    }

    /// Commit a transaction. Returns once its COMMIT record is durable.
    pub fn commit_transaction(&self, txn_id: TxnId) -> Result<()> {
        let Some(wal) = &self.wal else {
            let mut registry = self.registry()?;
            let txn = registry.get_mut(txn_id)?;
            txn.check_accepts_work()?;
            txn.state = TxnState::Committed;
            return Ok(());
        };

        let commit_lsn = {
            let mut registry = self.registry()?;
            let txn = registry.get_mut(txn_id)?;
            txn.check_accepts_work()?;
            match wal.writer.append(txn_id, LogOperation::Commit) {
                Ok(pos) => {
                    wal.checkpoints.note_appended(pos.len);
                    txn.commit_lsn = Some(pos.lsn);
                    pos.lsn
                }
                Err(e) => {
                    log::error!("Failed to log commit for transaction {}: {}", txn_id, e);
                    txn.poisoned = true;
                    return Err(e);
                }
            }
        };

        // Wait on the commit latch without holding the registry
        let durable = wal.writer.wait_for_durable(commit_lsn);

        {
            let mut registry = self.registry()?;
            let txn = registry.get_mut(txn_id)?;
            if let Err(e) = durable {
                log::error!(
                    "Commit of transaction {} (LSN {}) not durable: {}",
                    txn_id,
                    commit_lsn,
                    e
                );
                txn.poisoned = true;
                return Err(e);
            }
            txn.state = TxnState::Committed;
        }
        log::debug!("Committed transaction {} at LSN {}", txn_id, commit_lsn);

        self.maybe_checkpoint();
        Ok(())
    }

    /// Roll back a transaction by logging an ABORT record.
    ///
    /// Applied mutations are not undone. A poisoned transaction can be rolled
    /// back unless its COMMIT record is already queued on a healthy writer:
    /// that record will reach disk, so the rollback is refused while the
    /// outcome is unknown, and once the COMMIT is durable the transaction is
    /// recorded as committed. If the ABORT record cannot be written the
    /// transaction is still marked aborted and the write error is returned.
    pub fn rollback_transaction(&self, txn_id: TxnId) -> Result<()> {
        let mut registry = self.registry()?;
        let txn = registry.get_mut(txn_id)?;
        if !txn.is_active() {
            return Err(GraniteError::InvalidTransactionState {
                txn_id,
                state: txn.state,
                reason: "transaction is no longer active",
            });
        }
        if let Some(commit_lsn) = txn.commit_lsn {
            if !txn.poisoned {
                return Err(GraniteError::InvalidTransactionState {
                    txn_id,
                    state: txn.state,
                    reason: "commit already in progress",
                });
            }
            if let Some(wal) = self.wal.as_ref().filter(|w| w.writer.failure().is_none()) {
                if wal.writer.durable_lsn() >= commit_lsn {
                    log::warn!(
                        "Rollback of transaction {} refused: COMMIT at LSN {} is durable",
                        txn_id,
                        commit_lsn
                    );
                    txn.state = TxnState::Committed;
                    return Err(GraniteError::InvalidTransactionState {
                        txn_id,
                        state: txn.state,
                        reason: "commit record became durable",
                    });
                }
                return Err(GraniteError::InvalidTransactionState {
                    txn_id,
                    state: txn.state,
                    reason: "commit outcome unknown",
                });
            }
        }

        let logged = match &self.wal {
            Some(wal) => match wal.writer.append(txn_id, LogOperation::Abort) {
                Ok(pos) => {
                    wal.checkpoints.note_appended(pos.len);
                    Ok(())
                }
                Err(e) => {
                    log::error!("ABORT record for transaction {} not logged: {}", txn_id, e);
                    Err(e)
                }
            },
            None => Ok(()),
        };

        txn.state = TxnState::Aborted;
        log::debug!("Rolled back transaction {}", txn_id);
        logged
    }

    /// Take a checkpoint. Returns the LSN of the CHECKPOINT record.
    pub fn checkpoint(&self) -> Result<Lsn> {
        let wal = self.wal.as_ref().ok_or(GraniteError::WalDisabled)?;
        wal.checkpoints
            .checkpoint(&wal.writer, &self.registry, self.storage.as_ref())
    }

    fn maybe_checkpoint(&self) {
        let Some(wal) = &self.wal else {
            return;
        };
        if wal.checkpoints.should_checkpoint() {
            log::info!("Granite checkpoint threshold reached, triggering automatic checkpoint");
            if let Err(e) = self.checkpoint() {
                log::warn!("Automatic checkpoint failed: {}", e);
            }
        }
    }

    /// LSN of the most recent checkpoint taken since startup (0 if none)
    pub fn last_checkpoint_lsn(&self) -> Lsn {
        self.wal
            .as_ref()
            .map(|w| w.checkpoints.last_checkpoint_lsn())
            .unwrap_or(0)
    }

    /// Force an immediate fsync and return the durable LSN.
    pub fn force_sync(&self) -> Result<Lsn> {
        let wal = self.wal.as_ref().ok_or(GraniteError::WalDisabled)?;
        wal.writer.flush()
    }

    /// Get the current durable LSN (highest LSN that has been fsynced).
    pub fn durable_lsn(&self) -> Lsn {
        self.wal.as_ref().map(|w| w.writer.durable_lsn()).unwrap_or(0)
    }

    pub fn transaction_state(&self, txn_id: TxnId) -> Result<TxnState> {
        Ok(self.registry()?.get(txn_id)?.state)
    }

    /// Snapshot of a transaction's registry entry
    pub fn transaction(&self, txn_id: TxnId) -> Result<Transaction> {
        Ok(self.registry()?.get(txn_id)?.clone())
    }

    /// Check if a transaction is active
    pub fn is_active(&self, txn_id: TxnId) -> bool {
        self.registry()
            .map(|r| r.get(txn_id).map(|t| t.is_active()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Ids of all ACTIVE transactions, ascending
    pub fn active_transactions(&self) -> Result<Vec<TxnId>> {
        let mut ids: Vec<TxnId> = self.registry()?.active().map(|t| t.id).collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

// Note: TransactionManager is not Clone due to the channel-based WAL worker.
// The Arc<TransactionManager> pattern should be used for sharing across threads.
