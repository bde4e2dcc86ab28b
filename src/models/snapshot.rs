//! Vault snapshot models
//!
//! A [`MetricsSnapshot`] is the vault state observed at one [`Checkpoint`]
//! (a historical block height). Both are immutable once constructed.

use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::ModelError;
use crate::models::batch_record::{BatchRecord, ColumnValue};

/// Largest supported share decimals (10^77 still fits in 256 bits)
pub const MAX_DECIMALS: u8 = 77;

/// A block height selected for sampling
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Checkpoint {
    /// Position in the schedule (0 = most recent)
    pub sequence_index: u32,
    /// Block height the vault is read at
    pub height: u64,
    /// Human readable label, e.g. "day 1"
    pub label: String,
}

impl Checkpoint {
    pub fn new(sequence_index: u32, height: u64, label: impl Into<String>) -> Self {
        Self {
            sequence_index,
            height,
            label: label.into(),
        }
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (block {})", self.label, self.height)
    }
}

/// Vault metrics read at a single checkpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    vault_id: String,
    checkpoint: Checkpoint,
    #[serde(serialize_with = "serialize_u256")]
    price_per_share: U256,
    #[serde(serialize_with = "serialize_u256")]
    total_assets: U256,
    #[serde(serialize_with = "serialize_u256")]
    total_supply: U256,
    decimals: u8,
    observed_at: DateTime<Utc>,
}

impl MetricsSnapshot {
    /// Build a snapshot, rejecting decimals that cannot be scaled in 256 bits
    pub fn new(
        vault_id: impl Into<String>,
        checkpoint: Checkpoint,
        price_per_share: U256,
        total_assets: U256,
        total_supply: U256,
        decimals: u8,
        observed_at: DateTime<Utc>,
    ) -> Result<Self, ModelError> {
        if decimals > MAX_DECIMALS {
            return Err(ModelError::DecimalsOutOfRange(decimals));
        }

        Ok(Self {
            vault_id: vault_id.into(),
            checkpoint,
            price_per_share,
            total_assets,
            total_supply,
            decimals,
            observed_at,
        })
    }

    pub fn vault_id(&self) -> &str {
        &self.vault_id
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn height(&self) -> u64 {
        self.checkpoint.height
    }

    pub fn price_per_share(&self) -> U256 {
        self.price_per_share
    }

    pub fn total_assets(&self) -> U256 {
        self.total_assets
    }

    pub fn total_supply(&self) -> U256 {
        self.total_supply
    }

    pub fn decimals(&self) -> u8 {
        self.decimals
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    /// Price per share scaled down by `decimals`, for display.
    ///
    /// Returns `None` when the raw value does not fit a `Decimal` mantissa
    /// (96 bits) or the scale exceeds 28.
    pub fn normalized_price(&self) -> Option<Decimal> {
        let raw: u128 = self.price_per_share.try_into().ok()?;
        let raw = i128::try_from(raw).ok()?;
        Decimal::try_from_i128_with_scale(raw, u32::from(self.decimals)).ok()
    }

    /// Deterministic key for upserts: one row per vault per block
    pub fn dedupe_key(&self) -> String {
        format!("{}:{}", self.vault_id, self.checkpoint.height)
    }

    /// Convert to a row of the snapshot table
    pub fn to_batch_record(&self, table: &str) -> BatchRecord {
        BatchRecord::new(table, self.dedupe_key())
            .with_column("vault_id", ColumnValue::String(self.vault_id.clone()))
            .with_column("height", ColumnValue::UInt64(self.checkpoint.height))
            .with_column(
                "sequence_index",
                ColumnValue::UInt32(self.checkpoint.sequence_index),
            )
            .with_column("label", ColumnValue::String(self.checkpoint.label.clone()))
            .with_column("price_per_share", ColumnValue::UInt256(self.price_per_share))
            .with_column("total_assets", ColumnValue::UInt256(self.total_assets))
            .with_column("total_supply", ColumnValue::UInt256(self.total_supply))
            .with_column("decimals", ColumnValue::UInt8(self.decimals))
            .with_column("observed_at", ColumnValue::DateTime(self.observed_at))
    }
}

fn serialize_u256<S>(value: &U256, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&value.to_string())
}
