//! Row values and table schemas carried inside logged mutations
//!
//! The durability core does not interpret these beyond storing and replaying
//! them; SQL semantics live in the execution layer.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// SQL data types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    /// 64-bit signed integer
    Integer,
    /// 64-bit floating point
    Float,
    /// Variable-length string with optional max length
    Varchar(Option<u32>),
    /// Text (unlimited length string)
    Text,
    /// Boolean
    Boolean,
    /// JSON document
    Json,
}

/// A SQL value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,
    /// Integer value
    Integer(i64),
    /// Float value
    Float(f64),
    /// String value
    String(String),
    /// Boolean value
    Boolean(bool),
    /// JSON value, stored as its text form so non-self-describing
    /// encoders (bincode) can round-trip it
    Json(#[serde(with = "json_text")] JsonValue),
}

mod json_text {
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value as JsonValue;

    pub fn serialize<S: Serializer>(value: &JsonValue, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<JsonValue, D::Error> {
        let text = String::deserialize(deserializer)?;
        serde_json::from_str(&text).map_err(serde::de::Error::custom)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            // Cross-type numeric comparison
            (Value::Integer(a), Value::Float(b)) => (*a as f64) == *b,
            (Value::Float(a), Value::Integer(b)) => *a == (*b as f64),
            _ => false,
        }
    }
}

/// A column definition in a table schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name
    pub name: String,
    /// Column data type
    pub data_type: DataType,
    /// Whether the column allows NULL values
    pub nullable: bool,
    /// Default value (if any)
    pub default: Option<Value>,
    /// Whether this column is a primary key
    pub primary_key: bool,
    /// Whether this column auto-increments (only valid for INTEGER PRIMARY KEY)
    #[serde(default)]
    pub auto_increment: bool,
}

impl ColumnDef {
    /// A nullable, non-key column
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            default: None,
            primary_key: false,
            auto_increment: false,
        }
    }
}

/// Table schema definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name
    pub name: String,
    /// Column definitions
    pub columns: Vec<ColumnDef>,
    /// Current auto-increment value (next value to use)
    #[serde(default = "default_auto_increment")]
    pub auto_increment_counter: u64,
}

fn default_auto_increment() -> u64 {
    1
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
            auto_increment_counter: default_auto_increment(),
        }
    }
}

/// A row of data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Internal row ID (for updates/deletes)
    pub id: u64,
    /// Column values in order matching table schema
    pub values: Vec<Value>,
}

impl Row {
    /// Create a new row with the given ID and values
    pub fn new(id: u64, values: Vec<Value>) -> Self {
        Self { id, values }
    }
}
