//! Generic persistence unit for the columnar store

use alloy::primitives::U256;
use chrono::{DateTime, Utc};

/// Column types the pipeline tables use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    String,
    UInt8,
    UInt32,
    UInt64,
    Float64,
    UInt256,
    DateTime,
}

impl ColumnType {
    /// ClickHouse type name
    pub fn sql_name(self) -> &'static str {
        match self {
            ColumnType::String => "String",
            ColumnType::UInt8 => "UInt8",
            ColumnType::UInt32 => "UInt32",
            ColumnType::UInt64 => "UInt64",
            ColumnType::Float64 => "Float64",
            ColumnType::UInt256 => "UInt256",
            ColumnType::DateTime => "DateTime('UTC')",
        }
    }
}

/// Typed column value
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    String(String),
    UInt8(u8),
    UInt32(u32),
    UInt64(u64),
    Float64(f64),
    UInt256(U256),
    DateTime(DateTime<Utc>),
}

impl ColumnValue {
    pub fn column_type(&self) -> ColumnType {
        match self {
            ColumnValue::String(_) => ColumnType::String,
            ColumnValue::UInt8(_) => ColumnType::UInt8,
            ColumnValue::UInt32(_) => ColumnType::UInt32,
            ColumnValue::UInt64(_) => ColumnType::UInt64,
            ColumnValue::Float64(_) => ColumnType::Float64,
            ColumnValue::UInt256(_) => ColumnType::UInt256,
            ColumnValue::DateTime(_) => ColumnType::DateTime,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ColumnValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            ColumnValue::UInt8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            ColumnValue::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ColumnValue::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ColumnValue::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u256(&self) -> Option<U256> {
        match self {
            ColumnValue::UInt256(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            ColumnValue::DateTime(ts) => Some(*ts),
            _ => None,
        }
    }
}

/// One row bound for a table, keyed for idempotent delivery
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRecord {
    table: String,
    dedupe_key: String,
    columns: Vec<(String, ColumnValue)>,
}

impl BatchRecord {
    pub fn new(table: impl Into<String>, dedupe_key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            dedupe_key: dedupe_key.into(),
            columns: Vec::new(),
        }
    }

    /// Append a column; insertion order is the column order
    pub fn with_column(mut self, name: impl Into<String>, value: ColumnValue) -> Self {
        self.columns.push((name.into(), value));
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn dedupe_key(&self) -> &str {
        &self.dedupe_key
    }

    pub fn columns(&self) -> &[(String, ColumnValue)] {
        &self.columns
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&ColumnValue> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }
}
