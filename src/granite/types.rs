//! Core transaction types and state management

use std::collections::HashMap;

use crate::error::{GraniteError, Result};

/// Log Sequence Number - unique identifier for each WAL record
pub type Lsn = u64;

/// Transaction ID
pub type TxnId = u64;

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

impl TxnState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxnState::Active)
    }
}

/// Registry entry for one transaction
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Transaction ID
    pub id: TxnId,
    /// Current state
    pub state: TxnState,
    /// LSN of the BEGIN record
    pub begin_lsn: Lsn,
    /// Byte offset of the BEGIN record in the log file
    pub begin_offset: u64,
    /// Number of OPERATION records logged so far
    pub operations: u64,
    /// Set when a durability failure hit this transaction. It stays
    /// ACTIVE, but only rollback is accepted from then on.
    pub poisoned: bool,
    /// LSN of the COMMIT record once it has been appended
    pub commit_lsn: Option<Lsn>,
}

impl Transaction {
    pub fn new(id: TxnId, begin_lsn: Lsn, begin_offset: u64) -> Self {
        Self {
            id,
            state: TxnState::Active,
            begin_lsn,
            begin_offset,
            operations: 0,
            poisoned: false,
            commit_lsn: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    /// Whether new OPERATION records or a COMMIT may be logged
    pub fn accepts_work(&self) -> bool {
        self.is_active() && !self.poisoned && self.commit_lsn.is_none()
    }

    fn refuse(&self, reason: &'static str) -> GraniteError {
        GraniteError::InvalidTransactionState {
            txn_id: self.id,
            state: self.state,
            reason,
        }
    }

    /// Error describing why this transaction cannot take more work
    pub fn check_accepts_work(&self) -> Result<()> {
        if !self.is_active() {
            Err(self.refuse("transaction is no longer active"))
        } else if self.poisoned {
            Err(self.refuse("a durability failure hit this transaction; only rollback is allowed"))
        } else if self.commit_lsn.is_some() {
            Err(self.refuse("commit already in progress"))
        } else {
            Ok(())
        }
    }
}

/// Lifecycle of the engine with respect to recovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Constructed; recovery has not run yet
    AwaitingRecovery,
    /// Recovery succeeded; no transaction has started
    Recovered,
    /// Normal operation has begun
    Online,
    /// Recovery failed with the given message
    Failed(String),
}

/// Every transaction this engine instance issued, plus the id counter and
/// lifecycle phase. Lives behind one mutex in the manager; appends to the
/// log happen while it is held.
#[derive(Debug)]
pub(crate) struct TxnRegistry {
    pub txns: HashMap<TxnId, Transaction>,
    pub next_txn_id: TxnId,
    pub phase: Phase,
    wal_enabled: bool,
}

impl TxnRegistry {
    pub fn new(wal_enabled: bool) -> Self {
        Self {
            txns: HashMap::new(),
            next_txn_id: 1,
            phase: Phase::AwaitingRecovery,
            wal_enabled,
        }
    }

    /// Move to normal operation, refusing if recovery has not succeeded
    pub fn go_online(&mut self) -> Result<()> {
        match &self.phase {
            Phase::AwaitingRecovery if self.wal_enabled => Err(GraniteError::RecoveryPending),
            Phase::Failed(msg) => Err(GraniteError::RecoveryFailed(msg.clone())),
            _ => {
                self.phase = Phase::Online;
                Ok(())
            }
        }
    }

    pub fn get(&self, txn_id: TxnId) -> Result<&Transaction> {
        self.txns
            .get(&txn_id)
            .ok_or(GraniteError::UnknownTransaction(txn_id))
    }

    pub fn get_mut(&mut self, txn_id: TxnId) -> Result<&mut Transaction> {
        self.txns
            .get_mut(&txn_id)
            .ok_or(GraniteError::UnknownTransaction(txn_id))
    }

    /// Transactions in the ACTIVE state, poisoned ones included
    pub fn active(&self) -> impl Iterator<Item = &Transaction> {
        self.txns.values().filter(|t| t.is_active())
    }
}
