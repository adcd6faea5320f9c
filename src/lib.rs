//! GraniteDB - the durability core of an embedded SQL engine
//!
//! Write-ahead logging, transaction tracking, checkpoints and crash
//! recovery. SQL execution and table storage live outside this crate; the
//! storage engine plugs in through [`StorageApply`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use granitedb::{DurabilityConfig, MemoryStorage, Session, TransactionManager, Value};
//!
//! # fn main() -> granitedb::Result<()> {
//! let storage = Arc::new(MemoryStorage::new());
//! let (manager, info) = TransactionManager::open(DurabilityConfig::new("./data"), storage)?;
//! assert!(info.successful);
//!
//! let mut session = Session::new();
//! let txn = manager.begin_transaction()?;
//! manager.set_current_transaction(&mut session, Some(txn))?;
//! manager.log_insert(&session, "users", 1, &[Value::Integer(1)])?;
//! manager.commit_transaction(txn)?;
//! manager.set_current_transaction(&mut session, None)?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod granite;
pub mod session;
pub mod storage;
pub mod types;

pub use error::{ErrorClass, GraniteError, Result, StorageError};
pub use granite::{
    DurabilityConfig, GraniteConfig, LogOperation, LogRecord, Lsn, Mutation, RecoveryInfo,
    TransactionManager, TxnId, TxnState,
};
pub use session::Session;
pub use storage::{MemoryStorage, StorageApply};
pub use types::{ColumnDef, DataType, Row, TableSchema, Value};
