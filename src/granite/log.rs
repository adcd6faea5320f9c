//! WAL log record structures

use serde::{Deserialize, Serialize};

use super::types::{Lsn, TxnId};
use crate::types::{TableSchema, Value};

/// A WAL log record. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Log sequence number
    pub lsn: Lsn,
    /// Transaction ID (0 for checkpoint records)
    pub txn_id: TxnId,
    /// The operation
    pub op: LogOperation,
    /// Timestamp (Unix epoch millis)
    pub timestamp: u64,
}

impl LogRecord {
    pub fn kind(&self) -> RecordKind {
        self.op.kind()
    }
}

/// Kind of a log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Begin,
    Operation,
    Commit,
    Abort,
    Checkpoint,
}

/// What a record says happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogOperation {
    /// Transaction started
    Begin,
    /// A logical mutation performed by the transaction
    Operation(Mutation),
    /// Transaction committed
    Commit,
    /// Transaction rolled back
    Abort,
    /// Checkpoint marker
    Checkpoint(CheckpointRecord),
}

impl LogOperation {
    pub fn kind(&self) -> RecordKind {
        match self {
            LogOperation::Begin => RecordKind::Begin,
            LogOperation::Operation(_) => RecordKind::Operation,
            LogOperation::Commit => RecordKind::Commit,
            LogOperation::Abort => RecordKind::Abort,
            LogOperation::Checkpoint(_) => RecordKind::Checkpoint,
        }
    }
}

/// Category of a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
    Ddl,
}

/// Logical description of a mutation, with everything needed to redo it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Insert a row
    Insert {
        table: String,
        row_id: u64,
        values: Vec<Value>,
    },
    /// Update a row
    Update {
        table: String,
        row_id: u64,
        old_values: Vec<Value>,
        new_values: Vec<Value>,
    },
    /// Delete a row
    Delete {
        table: String,
        row_id: u64,
        old_values: Vec<Value>,
    },
    /// Create table
    CreateTable { schema: TableSchema },
    /// Drop table
    DropTable { table: String },
    /// Truncate table
    TruncateTable { table: String },
}

impl Mutation {
    pub fn kind(&self) -> MutationKind {
        match self {
            Mutation::Insert { .. } => MutationKind::Insert,
            Mutation::Update { .. } => MutationKind::Update,
            Mutation::Delete { .. } => MutationKind::Delete,
            Mutation::CreateTable { .. }
            | Mutation::DropTable { .. }
            | Mutation::TruncateTable { .. } => MutationKind::Ddl,
        }
    }

    /// Name of the table this mutation targets
    pub fn table(&self) -> &str {
        match self {
            Mutation::Insert { table, .. }
            | Mutation::Update { table, .. }
            | Mutation::Delete { table, .. }
            | Mutation::DropTable { table }
            | Mutation::TruncateTable { table } => table,
            Mutation::CreateTable { schema } => &schema.name,
        }
    }
}

/// Payload of a CHECKPOINT record: a consistent cut of the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Highest LSN assigned before the checkpoint record itself
    pub cut_lsn: Lsn,
    /// Transactions ACTIVE at the cut
    pub active_txns: Vec<TxnId>,
    /// Where redo must start: the earliest BEGIN among `active_txns`,
    /// or the checkpoint record's own LSN when nothing was active
    pub redo_lsn: Lsn,
    /// Transaction id counter at the cut
    pub next_txn_id: TxnId,
}
