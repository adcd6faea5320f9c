//! Error types for GraniteDB
//!
//! A single error enum covers every failure of the durability core. Callers
//! that need to react differently to usage mistakes, I/O failures and log
//! corruption can classify an error with [`GraniteError::class`].

use std::fmt;
use std::io;

use crate::granite::types::{Lsn, TxnId, TxnState};

/// Broad category of a [`GraniteError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Wrong transaction state, unknown id, wrong lifecycle phase.
    /// Reported synchronously, nothing is written to the log.
    Usage,
    /// Append or fsync failed. Fatal to the in-flight transaction.
    DurabilityIo,
    /// The log cannot be interpreted. Fatal to startup.
    Corruption,
    /// The storage engine rejected a replayed operation.
    Storage,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Usage => write!(f, "usage error"),
            ErrorClass::DurabilityIo => write!(f, "durability I/O error"),
            ErrorClass::Corruption => write!(f, "corruption error"),
            ErrorClass::Storage => write!(f, "storage error"),
        }
    }
}

/// Error returned by the storage engine's apply interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageError {
    message: String,
}

impl StorageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StorageError {}

/// Unified error type for durability operations
#[derive(Debug)]
pub enum GraniteError {
    /// I/O error while appending to or syncing the log
    Io(io::Error),
    /// Transaction id was never issued by this manager
    UnknownTransaction(TxnId),
    /// Transaction exists but is not in a state that allows the operation
    InvalidTransactionState {
        txn_id: TxnId,
        state: TxnState,
        reason: &'static str,
    },
    /// `log_operation` was called on a session with no current transaction
    NoCurrentTransaction,
    /// Transactional work was attempted before recovery ran
    RecoveryPending,
    /// Recovery already failed; the engine refuses to accept work
    RecoveryFailed(String),
    /// Recovery was requested after normal operation began
    RecoveryAfterStartup,
    /// The engine was constructed without a log directory
    WalDisabled,
    /// A log frame could not be interpreted
    Corruption { offset: u64, message: String },
    /// LSN sequence in the log is not strictly increasing
    LsnOutOfOrder { offset: u64, previous: Lsn, found: Lsn },
    /// Record encoding failed
    Codec(String),
    /// Checkpoint marker file could not be written or parsed
    Json(String),
    /// Storage engine rejected a replayed operation
    Storage(StorageError),
}

impl GraniteError {
    /// Build a corruption error for the frame starting at `offset`
    pub fn corruption(offset: u64, message: impl Into<String>) -> Self {
        GraniteError::Corruption {
            offset,
            message: message.into(),
        }
    }

    /// Wrap an arbitrary message as a durability I/O error
    pub fn io_other(message: impl Into<String>) -> Self {
        GraniteError::Io(io::Error::new(io::ErrorKind::Other, message.into()))
    }

    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            GraniteError::Io(_) | GraniteError::Codec(_) | GraniteError::Json(_) => {
                ErrorClass::DurabilityIo
            }
            GraniteError::UnknownTransaction(_)
            | GraniteError::InvalidTransactionState { .. }
            | GraniteError::NoCurrentTransaction
            | GraniteError::RecoveryPending
            | GraniteError::RecoveryFailed(_)
            | GraniteError::RecoveryAfterStartup
            | GraniteError::WalDisabled => ErrorClass::Usage,
            GraniteError::Corruption { .. } | GraniteError::LsnOutOfOrder { .. } => {
                ErrorClass::Corruption
            }
            GraniteError::Storage(_) => ErrorClass::Storage,
        }
    }

    pub fn is_usage_error(&self) -> bool {
        self.class() == ErrorClass::Usage
    }
}

impl fmt::Display for GraniteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraniteError::Io(e) => write!(f, "WAL I/O error: {}", e),
            GraniteError::UnknownTransaction(id) => write!(f, "Transaction {} not found", id),
            GraniteError::InvalidTransactionState {
                txn_id,
                state,
                reason,
            } => write!(f, "Transaction {} is {:?}: {}", txn_id, state, reason),
            GraniteError::NoCurrentTransaction => write!(f, "No transaction in progress"),
            GraniteError::RecoveryPending => {
                write!(f, "Recovery must complete before transactions can start")
            }
            GraniteError::RecoveryFailed(msg) => {
                write!(f, "Engine is offline after failed recovery: {}", msg)
            }
            GraniteError::RecoveryAfterStartup => {
                write!(f, "Recovery cannot run after normal operation has begun")
            }
            GraniteError::WalDisabled => write!(f, "Write-ahead logging is disabled"),
            GraniteError::Corruption { offset, message } => {
                write!(f, "WAL corrupted at byte {}: {}", offset, message)
            }
            GraniteError::LsnOutOfOrder {
                offset,
                previous,
                found,
            } => write!(
                f,
                "WAL corrupted at byte {}: LSN {} follows LSN {}",
                offset, found, previous
            ),
            GraniteError::Codec(msg) => write!(f, "WAL encoding error: {}", msg),
            GraniteError::Json(msg) => write!(f, "Checkpoint marker error: {}", msg),
            GraniteError::Storage(e) => write!(f, "Storage error: {}", e),
        }
    }
}

impl std::error::Error for GraniteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GraniteError::Io(e) => Some(e),
            GraniteError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for GraniteError {
    fn from(e: io::Error) -> Self {
        GraniteError::Io(e)
    }
}

impl From<serde_json::Error> for GraniteError {
    fn from(e: serde_json::Error) -> Self {
        GraniteError::Json(e.to_string())
    }
}

impl From<bincode::Error> for GraniteError {
    fn from(e: bincode::Error) -> Self {
        GraniteError::Codec(e.to_string())
    }
}

impl From<StorageError> for GraniteError {
    fn from(e: StorageError) -> Self {
        GraniteError::Storage(e)
    }
}

/// Result type alias for GraniteDB operations
pub type Result<T> = std::result::Result<T, GraniteError>;
