//! Declared schemas of the pipeline-owned tables
//!
//! Both tables are ordered by `dedupe_key`. Upserting stores create them as
//! `ReplacingMergeTree`, append-only stores as plain `MergeTree`.

use crate::error::WriteError;
use crate::models::batch_record::{BatchRecord, ColumnType};

/// Name of the dedupe column every pipeline table carries first
pub const DEDUPE_COLUMN: &str = "dedupe_key";

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub column_type: ColumnType,
}

const fn col(name: &'static str, column_type: ColumnType) -> ColumnSpec {
    ColumnSpec { name, column_type }
}

/// Which pipeline table a schema describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Snapshots,
    Yields,
}

/// Ordered column list for one destination table
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    name: String,
    kind: TableKind,
    columns: Vec<ColumnSpec>,
    /// Column used as the version for ReplacingMergeTree
    version_column: &'static str,
}

impl TableSchema {
    /// Raw vault observations, one row per vault per block
    pub fn vault_snapshots(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TableKind::Snapshots,
            columns: vec![
                col("vault_id", ColumnType::String),
                col("height", ColumnType::UInt64),
                col("sequence_index", ColumnType::UInt32),
                col("label", ColumnType::String),
                col("price_per_share", ColumnType::UInt256),
                col("total_assets", ColumnType::UInt256),
                col("total_supply", ColumnType::UInt256),
                col("decimals", ColumnType::UInt8),
                col("observed_at", ColumnType::DateTime),
            ],
            version_column: "observed_at",
        }
    }

    /// Derived yields, one row per vault per block window
    pub fn vault_yields(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TableKind::Yields,
            columns: vec![
                col("vault_id", ColumnType::String),
                col("start_height", ColumnType::UInt64),
                col("end_height", ColumnType::UInt64),
                col("start_label", ColumnType::String),
                col("end_label", ColumnType::String),
                col("elapsed_units", ColumnType::UInt64),
                col("period_return", ColumnType::Float64),
                col("annualized_percent", ColumnType::Float64),
                col("computed_at", ColumnType::DateTime),
            ],
            version_column: "computed_at",
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Check a record matches this table column for column
    pub fn validate(&self, record: &BatchRecord) -> Result<(), WriteError> {
        if record.table() != self.name {
            return Err(WriteError::Schema(format!(
                "record {} targets table {}, expected {}",
                record.dedupe_key(),
                record.table(),
                self.name
            )));
        }

        if record.dedupe_key().is_empty() {
            return Err(WriteError::Schema(format!(
                "record for {} has an empty dedupe key",
                self.name
            )));
        }

        if record.columns().len() != self.columns.len() {
            return Err(WriteError::Schema(format!(
                "record {} has {} columns, table {} declares {}",
                record.dedupe_key(),
                record.columns().len(),
                self.name,
                self.columns.len()
            )));
        }

        for ((name, value), spec) in record.columns().iter().zip(&self.columns) {
            if name != spec.name {
                return Err(WriteError::Schema(format!(
                    "record {} has column {} where {} declares {}",
                    record.dedupe_key(),
                    name,
                    self.name,
                    spec.name
                )));
            }
            if value.column_type() != spec.column_type {
                return Err(WriteError::Schema(format!(
                    "column {}.{} expects {}, got {}",
                    self.name,
                    spec.name,
                    spec.column_type.sql_name(),
                    value.column_type().sql_name()
                )));
            }
        }

        Ok(())
    }

    /// DDL for this table. Upserting tables keep the newest row per key.
    pub fn create_table_sql(&self, database: &str, upsert: bool) -> String {
        let mut columns = vec![format!("    {} String", DEDUPE_COLUMN)];
        columns.extend(
            self.columns
                .iter()
                .map(|c| format!("    {} {}", c.name, c.column_type.sql_name())),
        );

        let engine = if upsert {
            format!("ReplacingMergeTree({})", self.version_column)
        } else {
            "MergeTree".to_string()
        };

        format!(
            "CREATE TABLE IF NOT EXISTS {}.{} (\n{}\n) ENGINE = {}\nORDER BY {}",
            database,
            self.name,
            columns.join(",\n"),
            engine,
            DEDUPE_COLUMN
        )
    }
}
