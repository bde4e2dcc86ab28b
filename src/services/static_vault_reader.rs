//! In-memory vault reader
//!
//! Serves scripted snapshots keyed by block height, with optional injected
//! failures and per-height attempt counters. Used by tests and by dry runs
//! that should not touch a node.

use alloy::primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use crate::error::ReadError;
use crate::models::snapshot::{Checkpoint, MetricsSnapshot};
use crate::services::onchain_reader::{HeadSource, OnChainReader};

/// Seconds per block used to synthesize block timestamps
const SECONDS_PER_BLOCK: i64 = 12;

#[derive(Debug, Clone, Copy)]
struct VaultState {
    price_per_share: U256,
    total_assets: U256,
    total_supply: U256,
    decimals: u8,
}

#[derive(Default)]
struct Script {
    states: HashMap<u64, VaultState>,
    /// Remaining transient failures per height
    transient: HashMap<u64, u32>,
    permanent: HashSet<u64>,
    always_transient: bool,
    attempts: HashMap<u64, u32>,
}

pub struct StaticVaultReader {
    vault_id: String,
    decimals: u8,
    head: u64,
    script: Mutex<Script>,
}

impl StaticVaultReader {
    /// Reader for `vault_id` whose chain head is `head`. Heights without a
    /// scripted price report `10^decimals` (a share price of 1.0).
    pub fn new(vault_id: impl Into<String>, decimals: u8, head: u64) -> Self {
        Self {
            vault_id: vault_id.into(),
            decimals,
            head,
            script: Mutex::new(Script::default()),
        }
    }

    pub fn set_price(&self, height: u64, price_per_share: U256) {
        let decimals = self.decimals;
        let mut script = self.script.lock();
        let state = script.states.entry(height).or_insert(VaultState {
            price_per_share,
            total_assets: U256::ZERO,
            total_supply: U256::ZERO,
            decimals,
        });
        state.price_per_share = price_per_share;
    }

    pub fn set_state(
        &self,
        height: u64,
        price_per_share: U256,
        total_assets: U256,
        total_supply: U256,
        decimals: u8,
    ) {
        self.script.lock().states.insert(
            height,
            VaultState {
                price_per_share,
                total_assets,
                total_supply,
                decimals,
            },
        );
    }

    /// Next `times` reads at `height` fail transiently
    pub fn fail_transiently_at(&self, height: u64, times: u32) {
        self.script.lock().transient.insert(height, times);
    }

    pub fn fail_permanently_at(&self, height: u64) {
        self.script.lock().permanent.insert(height);
    }

    /// Every read fails as if the node were unreachable
    pub fn fail_always_transient(&self) {
        self.script.lock().always_transient = true;
    }

    pub fn attempts_at(&self, height: u64) -> u32 {
        self.script
            .lock()
            .attempts
            .get(&height)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_attempts(&self) -> u32 {
        self.script.lock().attempts.values().sum()
    }

    fn block_time(&self, height: u64) -> DateTime<Utc> {
        let secs = 1_700_000_000i64 + (height as i64).saturating_mul(SECONDS_PER_BLOCK);
        Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
    }
}

#[async_trait]
impl OnChainReader for StaticVaultReader {
    async fn read_snapshot(
        &self,
        vault_id: &str,
        checkpoint: &Checkpoint,
    ) -> Result<MetricsSnapshot, ReadError> {
        let state = {
            let mut script = self.script.lock();
            *script.attempts.entry(checkpoint.height).or_insert(0) += 1;

            if script.always_transient {
                return Err(ReadError::Transient("connection refused".to_string()));
            }
            if let Some(remaining) = script.transient.get_mut(&checkpoint.height) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ReadError::Transient(format!(
                        "timeout reading block {}",
                        checkpoint.height
                    )));
                }
            }
            if script.permanent.contains(&checkpoint.height) {
                return Err(ReadError::Permanent(format!(
                    "execution reverted at block {}",
                    checkpoint.height
                )));
            }
            if vault_id != self.vault_id {
                return Err(ReadError::Permanent(format!("unknown vault {}", vault_id)));
            }
            if checkpoint.height > self.head {
                return Err(ReadError::Permanent(format!(
                    "block {} is beyond head {}",
                    checkpoint.height, self.head
                )));
            }

            script
                .states
                .get(&checkpoint.height)
                .copied()
                .unwrap_or(VaultState {
                    price_per_share: U256::from(10u64).pow(U256::from(self.decimals)),
                    total_assets: U256::ZERO,
                    total_supply: U256::ZERO,
                    decimals: self.decimals,
                })
        };

        let snapshot = MetricsSnapshot::new(
            vault_id,
            checkpoint.clone(),
            state.price_per_share,
            state.total_assets,
            state.total_supply,
            state.decimals,
            self.block_time(checkpoint.height),
        )?;

        Ok(snapshot)
    }
}

#[async_trait]
impl HeadSource for StaticVaultReader {
    async fn latest_height(&self) -> Result<u64, ReadError> {
        if self.script.lock().always_transient {
            return Err(ReadError::Transient("connection refused".to_string()));
        }
        Ok(self.head)
    }
}
