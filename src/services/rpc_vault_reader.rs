//! JSON-RPC vault reader
//!
//! Reads ERC4626 form metrics at a historical block through an alloy HTTP
//! provider. The contract interface is loaded from an ABI JSON file at
//! runtime rather than compiled in.

use alloy::{
    contract::{ContractInstance, Interface},
    dyn_abi::DynSolValue,
    eips::BlockId,
    json_abi::JsonAbi,
    network::Ethereum,
    primitives::{Address, U256},
    providers::{Provider, ProviderBuilder, RootProvider},
    transports::{
        http::{Client, Http},
        RpcError, TransportError,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{ConfigError, ReadError};
use crate::models::snapshot::{Checkpoint, MetricsSnapshot};
use crate::services::onchain_reader::{HeadSource, OnChainReader};

/// Form methods consumed by the pipeline
pub const FN_PRICE_PER_SHARE: &str = "getPricePerVaultShare";
pub const FN_TOTAL_ASSETS: &str = "getTotalAssets";
pub const FN_TOTAL_SUPPLY: &str = "getTotalSupply";
pub const FN_DECIMALS: &str = "getVaultDecimals";

const REQUIRED_FUNCTIONS: [&str; 4] = [
    FN_PRICE_PER_SHARE,
    FN_TOTAL_ASSETS,
    FN_TOTAL_SUPPLY,
    FN_DECIMALS,
];

/// JSON-RPC error codes worth retrying (rate limit, limit exceeded, internal)
const TRANSIENT_RPC_CODES: [i64; 3] = [429, -32005, -32603];

type VaultContract<'a> = ContractInstance<Http<Client>, &'a RootProvider<Http<Client>>, Ethereum>;

/// Load and check a vault ABI file
pub fn load_abi(path: impl AsRef<Path>) -> Result<JsonAbi, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Invalid {
        name: "VAULT_ABI_PATH",
        reason: format!("cannot read {}: {}", path.display(), e),
    })?;
    parse_abi(&raw)
}

/// Parse an ABI document and make sure every consumed method is declared
pub fn parse_abi(raw: &str) -> Result<JsonAbi, ConfigError> {
    let abi: JsonAbi = serde_json::from_str(raw).map_err(|e| ConfigError::Invalid {
        name: "VAULT_ABI_PATH",
        reason: format!("invalid ABI JSON: {}", e),
    })?;

    for name in REQUIRED_FUNCTIONS {
        if abi.function(name).is_none() {
            return Err(ConfigError::Invalid {
                name: "VAULT_ABI_PATH",
                reason: format!("ABI does not declare {}", name),
            });
        }
    }

    Ok(abi)
}

pub struct RpcVaultReader {
    provider: RootProvider<Http<Client>>,
    interface: Interface,
}

impl RpcVaultReader {
    /// Create a reader; no network traffic happens until the first call
    ///
    /// # Arguments
    ///
    /// * `rpc_url` - Ledger JSON-RPC endpoint
    /// * `abi` - Vault form ABI (see [`load_abi`])
    pub fn new(rpc_url: &str, abi: JsonAbi) -> Result<Self, ConfigError> {
        let provider = ProviderBuilder::new().on_http(rpc_url.parse().map_err(|e| {
            ConfigError::Invalid {
                name: "VAULT_RPC_URL",
                reason: format!("Invalid RPC URL: {}", e),
            }
        })?);

        Ok(Self {
            provider,
            interface: Interface::new(abi),
        })
    }

    /// Check the node answers and log which chain it serves
    pub async fn verify_connection(&self) -> Result<u64, ReadError> {
        let chain_id = self
            .provider
            .get_chain_id()
            .await
            .map_err(|e| classify_transport_error("eth_chainId", e))?;
        info!(chain_id = chain_id, "Connected to ledger RPC");
        Ok(chain_id)
    }

    fn contract(&self, vault_id: &str) -> Result<VaultContract<'_>, ReadError> {
        let address = Address::from_str(vault_id)
            .map_err(|e| ReadError::Permanent(format!("Invalid vault address {}: {}", vault_id, e)))?;
        Ok(ContractInstance::new(
            address,
            &self.provider,
            self.interface.clone(),
        ))
    }

    async fn call_uint(
        &self,
        contract: &VaultContract<'_>,
        method: &str,
        height: u64,
    ) -> Result<U256, ReadError> {
        let call = contract
            .function(method, &[])
            .map_err(|e| ReadError::Permanent(format!("{} not callable: {}", method, e)))?;

        let values = call
            .block(BlockId::number(height))
            .call()
            .await
            .map_err(|e| classify_contract_error(method, e))?;

        values
            .first()
            .and_then(DynSolValue::as_uint)
            .map(|(value, _)| value)
            .ok_or_else(|| ReadError::Permanent(format!("{} returned no unsigned integer", method)))
    }

    /// Block timestamp via raw `eth_getBlockByNumber`
    async fn block_timestamp(&self, height: u64) -> Result<DateTime<Utc>, ReadError> {
        let params = serde_json::json!([format!("0x{:x}", height), false]);
        let response: serde_json::Value = self
            .provider
            .client()
            .request("eth_getBlockByNumber", params)
            .await
            .map_err(|e| classify_transport_error("eth_getBlockByNumber", e))?;

        if response.is_null() {
            return Err(ReadError::Permanent(format!("block {} not found", height)));
        }

        let secs = response["timestamp"]
            .as_str()
            .and_then(|s| i64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
            .ok_or_else(|| {
                ReadError::Permanent(format!("block {} has no readable timestamp", height))
            })?;

        Utc.timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| ReadError::DataConsistency(format!("block {} timestamp {} out of range", height, secs)))
    }
}

#[async_trait]
impl OnChainReader for RpcVaultReader {
    async fn read_snapshot(
        &self,
        vault_id: &str,
        checkpoint: &Checkpoint,
    ) -> Result<MetricsSnapshot, ReadError> {
        let contract = self.contract(vault_id)?;
        let height = checkpoint.height;

        let (price_per_share, total_assets, total_supply, decimals, observed_at) = tokio::try_join!(
            self.call_uint(&contract, FN_PRICE_PER_SHARE, height),
            self.call_uint(&contract, FN_TOTAL_ASSETS, height),
            self.call_uint(&contract, FN_TOTAL_SUPPLY, height),
            self.call_uint(&contract, FN_DECIMALS, height),
            self.block_timestamp(height),
        )?;

        let decimals = u8::try_from(decimals).map_err(|_| {
            ReadError::DataConsistency(format!("{} returned {} at block {}", FN_DECIMALS, decimals, height))
        })?;

        let snapshot = MetricsSnapshot::new(
            vault_id,
            checkpoint.clone(),
            price_per_share,
            total_assets,
            total_supply,
            decimals,
            observed_at,
        )?;

        debug!(
            vault = %vault_id,
            height = height,
            price_per_share = %price_per_share,
            normalized = ?snapshot.normalized_price(),
            "Fetched vault snapshot"
        );

        Ok(snapshot)
    }
}

#[async_trait]
impl HeadSource for RpcVaultReader {
    async fn latest_height(&self) -> Result<u64, ReadError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| classify_transport_error("eth_blockNumber", e))
    }
}

fn classify_contract_error(method: &str, err: alloy::contract::Error) -> ReadError {
    match err {
        alloy::contract::Error::TransportError(e) => classify_transport_error(method, e),
        other => ReadError::Permanent(format!("{} failed: {}", method, other)),
    }
}

/// Unreachable node, timeouts and rate limits are transient; error responses
/// such as `execution reverted` are deterministic.
fn classify_transport_error(method: &str, err: TransportError) -> ReadError {
    match &err {
        RpcError::Transport(_) | RpcError::NullResp => {
            ReadError::Transient(format!("{} failed: {}", method, err))
        }
        RpcError::ErrorResp(payload) if TRANSIENT_RPC_CODES.contains(&payload.code) => {
            ReadError::Transient(format!("{} failed: {}", method, err))
        }
        _ => ReadError::Permanent(format!("{} failed: {}", method, err)),
    }
}
