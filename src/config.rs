//! Pipeline configuration
//!
//! Settings are carried in an explicit [`PipelineConfig`] passed to
//! constructors. [`PipelineConfig::from_env`] is the only place that reads
//! process environment.

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::services::backoff::BackoffPolicy;

/// Default vault (ERC4626 form) tracked by the APY flow
pub const DEFAULT_VAULT_ID: &str = "0x473b1CE36Dec21Fc1275c4032731C8469BFf371a";

/// Default public Ethereum RPC
pub const DEFAULT_RPC_URL: &str = "https://eth.llamarpc.com";

/// Default ABI location for the vault form contract
pub const DEFAULT_ABI_PATH: &str = "abi/erc4626_form.json";

/// Approximate Ethereum blocks per day (12s slots)
pub const DEFAULT_BLOCKS_PER_UNIT: u64 = 7200;

/// Days per year when the unit is a day
pub const DEFAULT_UNITS_PER_YEAR: u64 = 365;

/// Store block-insert sweet spot
pub const DEFAULT_CHUNK_SIZE: u32 = 10_000;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 4;

/// Default interval between scheduled runs (1 day)
pub const DEFAULT_RUN_INTERVAL_SECS: u64 = 86_400;

const ENV_VAULT_ID: &str = "VAULT_ID";
const ENV_RPC_URL: &str = "VAULT_RPC_URL";
const ENV_ABI_PATH: &str = "VAULT_ABI_PATH";
const ENV_LOOKBACK_UNITS: &str = "VAULT_LOOKBACK_UNITS";
const ENV_SAMPLING_INTERVAL_UNITS: &str = "VAULT_SAMPLING_INTERVAL_UNITS";
const ENV_BLOCKS_PER_UNIT: &str = "VAULT_BLOCKS_PER_UNIT";
const ENV_UNITS_PER_YEAR: &str = "VAULT_UNITS_PER_YEAR";
const ENV_UNIT_LABEL: &str = "VAULT_UNIT_LABEL";
const ENV_CHUNK_SIZE: &str = "VAULT_CHUNK_SIZE";
const ENV_MAX_RETRIES: &str = "VAULT_MAX_RETRIES";
const ENV_BACKOFF_BASE_MS: &str = "VAULT_BACKOFF_BASE_MS";
const ENV_BACKOFF_MAX_MS: &str = "VAULT_BACKOFF_MAX_MS";
const ENV_CONCURRENCY_LIMIT: &str = "VAULT_CONCURRENCY_LIMIT";
const ENV_RUN_DEADLINE_SECS: &str = "VAULT_RUN_DEADLINE_SECS";
const ENV_RUN_INTERVAL_SECS: &str = "VAULT_RUN_INTERVAL_SECS";
const ENV_DRY_RUN: &str = "VAULT_DRY_RUN";
const ENV_CLICKHOUSE_URL: &str = "CLICKHOUSE_URL";
const ENV_CLICKHOUSE_DATABASE: &str = "CLICKHOUSE_DATABASE";
const ENV_CLICKHOUSE_USER: &str = "CLICKHOUSE_USER";
const ENV_CLICKHOUSE_PASSWORD: &str = "CLICKHOUSE_PASSWORD";
const ENV_SNAPSHOT_TABLE: &str = "CLICKHOUSE_SNAPSHOT_TABLE";
const ENV_YIELD_TABLE: &str = "CLICKHOUSE_YIELD_TABLE";
const ENV_CLICKHOUSE_UPSERT: &str = "CLICKHOUSE_UPSERT";

/// ClickHouse connection settings
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub snapshot_table: String,
    pub yield_table: String,
    /// Create `ReplacingMergeTree` tables. When false tables are plain
    /// `MergeTree` and the writer skips keys that are already stored.
    pub upsert: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8123".to_string(),
            database: "default".to_string(),
            user: "default".to_string(),
            password: None,
            snapshot_table: "vault_snapshots".to_string(),
            yield_table: "vault_yields".to_string(),
            upsert: true,
        }
    }
}

/// Everything one pipeline run needs
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub vault_id: String,
    pub rpc_url: String,
    pub abi_path: String,
    pub lookback_units: u32,
    pub sampling_interval_units: u32,
    pub blocks_per_unit: u64,
    pub units_per_year: u64,
    /// Label prefix for checkpoints, e.g. "day"
    pub unit_label: String,
    pub chunk_size: u32,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub concurrency_limit: usize,
    pub run_deadline_secs: Option<u64>,
    pub run_interval_secs: u64,
    /// Write to an in-memory store instead of ClickHouse
    pub dry_run: bool,
    pub store: StoreConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            vault_id: DEFAULT_VAULT_ID.to_string(),
            rpc_url: DEFAULT_RPC_URL.to_string(),
            abi_path: DEFAULT_ABI_PATH.to_string(),
            lookback_units: 2,
            sampling_interval_units: 1,
            blocks_per_unit: DEFAULT_BLOCKS_PER_UNIT,
            units_per_year: DEFAULT_UNITS_PER_YEAR,
            unit_label: "day".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            run_deadline_secs: None,
            run_interval_secs: DEFAULT_RUN_INTERVAL_SECS,
            dry_run: false,
            store: StoreConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from `.env` and the process environment, falling back to defaults
    ///
    /// # Environment Variables
    ///
    /// * `VAULT_ID` - Vault contract address
    /// * `VAULT_RPC_URL` - Ledger JSON-RPC endpoint
    /// * `VAULT_ABI_PATH` - Path to the vault ABI JSON
    /// * `VAULT_LOOKBACK_UNITS`, `VAULT_SAMPLING_INTERVAL_UNITS` - Trailing window and step
    /// * `VAULT_BLOCKS_PER_UNIT`, `VAULT_UNITS_PER_YEAR` - Production rate and annualization base
    /// * `VAULT_CHUNK_SIZE`, `VAULT_MAX_RETRIES`, `VAULT_BACKOFF_BASE_MS`, `VAULT_BACKOFF_MAX_MS`
    /// * `VAULT_CONCURRENCY_LIMIT` - Parallel checkpoint reads
    /// * `VAULT_RUN_DEADLINE_SECS` - Optional run deadline
    /// * `VAULT_DRY_RUN` - Set to "true" to skip ClickHouse
    /// * `CLICKHOUSE_URL`, `CLICKHOUSE_DATABASE`, `CLICKHOUSE_USER`, `CLICKHOUSE_PASSWORD`
    /// * `CLICKHOUSE_SNAPSHOT_TABLE`, `CLICKHOUSE_YIELD_TABLE`
    /// * `CLICKHOUSE_UPSERT` - Set to "false" for append-only `MergeTree` tables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let store_defaults = StoreConfig::default();

        let config = Self {
            vault_id: env_string(ENV_VAULT_ID, defaults.vault_id),
            rpc_url: env_string(ENV_RPC_URL, defaults.rpc_url),
            abi_path: env_string(ENV_ABI_PATH, defaults.abi_path),
            lookback_units: env_parse(ENV_LOOKBACK_UNITS, defaults.lookback_units)?,
            sampling_interval_units: env_parse(
                ENV_SAMPLING_INTERVAL_UNITS,
                defaults.sampling_interval_units,
            )?,
            blocks_per_unit: env_parse(ENV_BLOCKS_PER_UNIT, defaults.blocks_per_unit)?,
            units_per_year: env_parse(ENV_UNITS_PER_YEAR, defaults.units_per_year)?,
            unit_label: env_string(ENV_UNIT_LABEL, defaults.unit_label),
            chunk_size: env_parse(ENV_CHUNK_SIZE, defaults.chunk_size)?,
            max_retries: env_parse(ENV_MAX_RETRIES, defaults.max_retries)?,
            backoff_base_ms: env_parse(ENV_BACKOFF_BASE_MS, defaults.backoff_base_ms)?,
            backoff_max_ms: env_parse(ENV_BACKOFF_MAX_MS, defaults.backoff_max_ms)?,
            concurrency_limit: env_parse(ENV_CONCURRENCY_LIMIT, defaults.concurrency_limit)?,
            run_deadline_secs: match env::var(ENV_RUN_DEADLINE_SECS) {
                Ok(raw) => Some(parse_value(ENV_RUN_DEADLINE_SECS, &raw)?),
                Err(_) => None,
            },
            run_interval_secs: env_parse(ENV_RUN_INTERVAL_SECS, defaults.run_interval_secs)?,
            dry_run: env_flag(ENV_DRY_RUN, false),
            store: StoreConfig {
                url: env_string(ENV_CLICKHOUSE_URL, store_defaults.url),
                database: env_string(ENV_CLICKHOUSE_DATABASE, store_defaults.database),
                user: env_string(ENV_CLICKHOUSE_USER, store_defaults.user),
                password: env::var(ENV_CLICKHOUSE_PASSWORD).ok(),
                snapshot_table: env_string(ENV_SNAPSHOT_TABLE, store_defaults.snapshot_table),
                yield_table: env_string(ENV_YIELD_TABLE, store_defaults.yield_table),
                upsert: env_flag(ENV_CLICKHOUSE_UPSERT, store_defaults.upsert),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings no run could succeed with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vault_id.trim().is_empty() {
            return Err(ConfigError::Missing(ENV_VAULT_ID));
        }
        if self.sampling_interval_units == 0 {
            return Err(invalid(ENV_SAMPLING_INTERVAL_UNITS, "must be greater than zero"));
        }
        if self.blocks_per_unit == 0 {
            return Err(invalid(ENV_BLOCKS_PER_UNIT, "must be greater than zero"));
        }
        if self.units_per_year == 0 {
            return Err(invalid(ENV_UNITS_PER_YEAR, "must be greater than zero"));
        }
        if self.chunk_size == 0 {
            return Err(invalid(ENV_CHUNK_SIZE, "must be greater than zero"));
        }
        if self.concurrency_limit == 0 {
            return Err(invalid(ENV_CONCURRENCY_LIMIT, "must be greater than zero"));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(invalid(
                ENV_BACKOFF_BASE_MS,
                "must not exceed VAULT_BACKOFF_MAX_MS",
            ));
        }
        Ok(())
    }

    /// Retry policy shared by the reader and the writer
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.max_retries,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_secs.map(Duration::from_secs)
    }
}

fn invalid(name: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.to_string(),
    }
}

fn env_string(name: &str, default: String) -> String {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(default)
}

/// "1"/"true" and "0"/"false", case-insensitive; anything else keeps the default
fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name).map(|v| v.trim().to_lowercase()) {
        Ok(v) if v == "1" || v == "true" => true,
        Ok(v) if v == "0" || v == "false" => false,
        _ => default,
    }
}

fn env_parse<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => parse_value(name, &raw),
        _ => Ok(default),
    }
}

fn parse_value<T: FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        reason: format!("{:?}: {}", raw, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_size, 10_000);
        assert_eq!(config.blocks_per_unit, 7200);
        assert_eq!(config.units_per_year, 365);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = PipelineConfig {
            sampling_interval_units: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { name: "VAULT_SAMPLING_INTERVAL_UNITS", .. })
        ));
    }

    #[test]
    fn test_backoff_bounds_checked() {
        let config = PipelineConfig {
            backoff_base_ms: 5_000,
            backoff_max_ms: 1_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"vault_id": "0xabc", "chunk_size": 500, "store": {"database": "analytics"}}"#,
        )
        .unwrap();
        assert_eq!(config.vault_id, "0xabc");
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.store.database, "analytics");
        assert_eq!(config.store.snapshot_table, "vault_snapshots");
        assert!(config.store.upsert);
        assert_eq!(config.lookback_units, 2);
    }

    #[test]
    fn test_append_only_store_from_json() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"store": {"upsert": false}}"#).unwrap();
        assert!(!config.store.upsert);
        assert_eq!(config.store.yield_table, "vault_yields");
    }

    #[test]
    fn test_parse_value_reports_name() {
        let err = parse_value::<u32>(ENV_CHUNK_SIZE, "lots").unwrap_err();
        assert!(err.to_string().contains("VAULT_CHUNK_SIZE"));
    }

    #[test]
    fn test_backoff_policy_from_config() {
        let policy = PipelineConfig::default().backoff_policy();
        assert_eq!(
            policy,
            BackoffPolicy::new(3, Duration::from_millis(500), Duration::from_secs(30))
        );
        assert_eq!(policy.max_attempts(), 4);
    }
}
