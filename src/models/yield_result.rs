//! Derived yield over one checkpoint window

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ModelError;
use crate::models::batch_record::{BatchRecord, ColumnValue};
use crate::models::snapshot::Checkpoint;

/// Period and annualized return between two chronologically ordered checkpoints
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YieldResult {
    vault_id: String,
    start_checkpoint: Checkpoint,
    end_checkpoint: Checkpoint,
    elapsed_units: u64,
    period_return: f64,
    annualized_percent: f64,
    computed_at: DateTime<Utc>,
}

impl YieldResult {
    pub fn new(
        vault_id: impl Into<String>,
        start_checkpoint: Checkpoint,
        end_checkpoint: Checkpoint,
        elapsed_units: u64,
        period_return: f64,
        annualized_percent: f64,
        computed_at: DateTime<Utc>,
    ) -> Result<Self, ModelError> {
        if elapsed_units == 0 {
            return Err(ModelError::ZeroElapsedUnits);
        }
        if start_checkpoint.height >= end_checkpoint.height {
            return Err(ModelError::NonChronologicalWindow {
                start: start_checkpoint.height,
                end: end_checkpoint.height,
            });
        }

        Ok(Self {
            vault_id: vault_id.into(),
            start_checkpoint,
            end_checkpoint,
            elapsed_units,
            period_return,
            annualized_percent,
            computed_at,
        })
    }

    pub fn vault_id(&self) -> &str {
        &self.vault_id
    }

    pub fn start_checkpoint(&self) -> &Checkpoint {
        &self.start_checkpoint
    }

    pub fn end_checkpoint(&self) -> &Checkpoint {
        &self.end_checkpoint
    }

    pub fn elapsed_units(&self) -> u64 {
        self.elapsed_units
    }

    pub fn period_return(&self) -> f64 {
        self.period_return
    }

    pub fn annualized_percent(&self) -> f64 {
        self.annualized_percent
    }

    pub fn computed_at(&self) -> DateTime<Utc> {
        self.computed_at
    }

    /// One row per vault per block window
    pub fn dedupe_key(&self) -> String {
        format!(
            "{}:{}-{}",
            self.vault_id, self.start_checkpoint.height, self.end_checkpoint.height
        )
    }

    pub fn to_batch_record(&self, table: &str) -> BatchRecord {
        BatchRecord::new(table, self.dedupe_key())
            .with_column("vault_id", ColumnValue::String(self.vault_id.clone()))
            .with_column("start_height", ColumnValue::UInt64(self.start_checkpoint.height))
            .with_column("end_height", ColumnValue::UInt64(self.end_checkpoint.height))
            .with_column(
                "start_label",
                ColumnValue::String(self.start_checkpoint.label.clone()),
            )
            .with_column(
                "end_label",
                ColumnValue::String(self.end_checkpoint.label.clone()),
            )
            .with_column("elapsed_units", ColumnValue::UInt64(self.elapsed_units))
            .with_column("period_return", ColumnValue::Float64(self.period_return))
            .with_column(
                "annualized_percent",
                ColumnValue::Float64(self.annualized_percent),
            )
            .with_column("computed_at", ColumnValue::DateTime(self.computed_at))
    }
}
