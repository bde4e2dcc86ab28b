use alloy::primitives::U256;
use std::sync::Arc;

use vault_yield_pipeline::config::PipelineConfig;
use vault_yield_pipeline::services::memory_store::MemoryStore;
use vault_yield_pipeline::services::pipeline::PipelineOrchestrator;
use vault_yield_pipeline::services::static_vault_reader::StaticVaultReader;

pub const VAULT: &str = "0x473b1CE36Dec21Fc1275c4032731C8469BFf371a";
pub const HEAD: u64 = 100;

/// 1e18 scaled by `hundredths / 100`
pub fn pps(hundredths: u64) -> U256 {
    U256::from(hundredths) * U256::from(10u64).pow(U256::from(16u64))
}

/// Checkpoints at heights [100, 50, 0], one block per unit, no backoff sleeps
pub fn scenario_config() -> PipelineConfig {
    PipelineConfig {
        vault_id: VAULT.to_string(),
        lookback_units: 100,
        sampling_interval_units: 50,
        blocks_per_unit: 1,
        units_per_year: 36_500,
        unit_label: "block".to_string(),
        max_retries: 2,
        backoff_base_ms: 0,
        backoff_max_ms: 0,
        concurrency_limit: 2,
        ..Default::default()
    }
}

/// Vault whose price rose 1.00 -> 1.05 -> 1.10 over the window
pub fn scenario_reader() -> Arc<StaticVaultReader> {
    let reader = Arc::new(StaticVaultReader::new(VAULT, 18, HEAD));
    reader.set_price(0, pps(100));
    reader.set_price(50, pps(105));
    reader.set_price(100, pps(110));
    reader
}

pub fn orchestrator(
    config: PipelineConfig,
    reader: Arc<StaticVaultReader>,
    store: Arc<MemoryStore>,
) -> PipelineOrchestrator {
    PipelineOrchestrator::new(config, reader.clone(), reader, store)
}

/// Relative comparison for values spanning many orders of magnitude
#[allow(dead_code)]
pub fn assert_close(actual: f64, expected: f64) {
    let tolerance = expected.abs().max(1.0) * 1e-9;
    assert!(
        (actual - expected).abs() <= tolerance,
        "expected {expected}, got {actual}"
    );
}
