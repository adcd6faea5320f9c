//! Storage engine apply interface
//!
//! Recovery replays committed mutations through [`StorageApply`]; the
//! durability core never touches table data any other way. [`MemoryStorage`]
//! is an in-memory implementation used by embedders that keep their tables
//! in memory, and by the test suite.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::error::StorageError;
use crate::granite::log::Mutation;
use crate::types::{Row, TableSchema, Value};

/// Interface the storage engine exposes to the durability core
pub trait StorageApply: Send + Sync {
    /// Replay one logged mutation against live tables.
    /// Recovery calls this at most once per record per run.
    fn apply_operation(&self, mutation: &Mutation) -> Result<(), StorageError>;

    /// Make all applied state durable. Called before a checkpoint is cut,
    /// because recovery does not redo work older than the checkpoint.
    fn persist(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

struct TableData {
    schema: TableSchema,
    rows: BTreeMap<u64, Vec<Value>>,
}

/// In-memory tables keyed by row id
pub struct MemoryStorage {
    tables: RwLock<HashMap<String, TableData>>,
    /// Number of mutations applied through `apply_operation`
    applied: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            applied: AtomicU64::new(0),
        }
    }

    fn table_not_found(table: &str) -> StorageError {
        StorageError::new(format!("Table '{}' doesn't exist", table))
    }

    fn read_tables(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, TableData>>, StorageError> {
        self.tables
            .read()
            .map_err(|_| StorageError::new("tables lock poisoned"))
    }

    fn write_tables(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, TableData>>, StorageError> {
        self.tables
            .write()
            .map_err(|_| StorageError::new("tables lock poisoned"))
    }

    /// Create a table; a no-op if it already exists
    pub fn create_table(&self, schema: TableSchema) -> Result<(), StorageError> {
        let mut tables = self.write_tables()?;
        tables.entry(schema.name.clone()).or_insert_with(|| TableData {
            schema,
            rows: BTreeMap::new(),
        });
        Ok(())
    }

    pub fn drop_table(&self, table: &str) -> Result<bool, StorageError> {
        Ok(self.write_tables()?.remove(table).is_some())
    }

    pub fn truncate_table(&self, table: &str) -> Result<(), StorageError> {
        let mut tables = self.write_tables()?;
        let data = tables.get_mut(table).ok_or_else(|| Self::table_not_found(table))?;
        data.rows.clear();
        Ok(())
    }

    /// Insert or overwrite a row
    pub fn put_row(&self, table: &str, row_id: u64, values: Vec<Value>) -> Result<(), StorageError> {
        let mut tables = self.write_tables()?;
        let data = tables.get_mut(table).ok_or_else(|| Self::table_not_found(table))?;
        data.rows.insert(row_id, values);
        Ok(())
    }

    pub fn delete_row(&self, table: &str, row_id: u64) -> Result<bool, StorageError> {
        let mut tables = self.write_tables()?;
        let data = tables.get_mut(table).ok_or_else(|| Self::table_not_found(table))?;
        Ok(data.rows.remove(&row_id).is_some())
    }

    pub fn get_row(&self, table: &str, row_id: u64) -> Result<Option<Row>, StorageError> {
        let tables = self.read_tables()?;
        let data = tables.get(table).ok_or_else(|| Self::table_not_found(table))?;
        Ok(data.rows.get(&row_id).map(|values| Row::new(row_id, values.clone())))
    }

    /// All rows of a table in row id order
    pub fn scan_table(&self, table: &str) -> Result<Vec<Row>, StorageError> {
        let tables = self.read_tables()?;
        let data = tables.get(table).ok_or_else(|| Self::table_not_found(table))?;
        Ok(data
            .rows
            .iter()
            .map(|(id, values)| Row::new(*id, values.clone()))
            .collect())
    }

    pub fn get_schema(&self, table: &str) -> Result<TableSchema, StorageError> {
        let tables = self.read_tables()?;
        tables
            .get(table)
            .map(|data| data.schema.clone())
            .ok_or_else(|| Self::table_not_found(table))
    }

    pub fn table_exists(&self, table: &str) -> bool {
        self.read_tables().map(|t| t.contains_key(table)).unwrap_or(false)
    }

    /// Number of mutations applied through [`StorageApply::apply_operation`]
    pub fn applied_operations(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageApply for MemoryStorage {
    fn apply_operation(&self, mutation: &Mutation) -> Result<(), StorageError> {
        match mutation {
            Mutation::Insert {
                table,
                row_id,
                values,
            } => self.put_row(table, *row_id, values.clone())?,
            Mutation::Update {
                table,
                row_id,
                new_values,
                ..
            } => self.put_row(table, *row_id, new_values.clone())?,
            Mutation::Delete { table, row_id, .. } => {
                self.delete_row(table, *row_id)?;
            }
            Mutation::CreateTable { schema } => self.create_table(schema.clone())?,
            Mutation::DropTable { table } => {
                self.drop_table(table)?;
            }
            Mutation::TruncateTable { table } => self.truncate_table(table)?,
        }
        self.applied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
