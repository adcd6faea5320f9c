//! Granite - write-ahead logging, transactions, checkpoints and crash recovery
//!
//! Named as a play on "WAL" (wall → stone wall → granite)

pub mod checkpoint;
pub mod codec;
pub mod log;
pub mod manager;
pub mod reader;
pub mod recovery;
pub mod types;
pub mod wal;

// Public API
pub use checkpoint::{CheckpointCoordinator, CheckpointMarker};
pub use log::{CheckpointRecord, LogOperation, LogRecord, Mutation, MutationKind, RecordKind};
pub use manager::{DurabilityConfig, TransactionManager};
pub use reader::{WalReader, WalScan};
pub use recovery::{RecoveryInfo, RecoveryManager};
pub use types::{Lsn, Transaction, TxnId, TxnState};
pub use wal::{GraniteConfig, WalPosition, WalWriter};
