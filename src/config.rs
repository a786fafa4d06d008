//! Configuration management for the bridge validator
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::types::Side;

use anyhow::{Context, Result};
use ethers::types::{Address, H256};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub validator: ValidatorConfig,
    pub store: StoreConfig,
    pub metrics: MetricsConfig,
    pub chains: BridgeChains,
    pub wallet: WalletConfig,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorConfig {
    pub instance_id: String,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    pub cycle_timeout_secs: u64,
    pub backoff_ms: u64,
    pub wait_blocks: u64,
    #[serde(default)]
    pub commit_interval_blocks: u64,
    #[serde(default)]
    pub builder: BuilderKind,
    pub appid: Option<H256>,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub health_check_interval_secs: u64,
}

fn default_tick_interval_ms() -> u64 {
    5_000
}

impl ValidatorConfig {
    pub fn commit(&self) -> CommitConfig {
        CommitConfig {
            cycle_timeout: Duration::from_secs(self.cycle_timeout_secs),
            backoff: Duration::from_millis(self.backoff_ms),
            wait_blocks: self.wait_blocks,
            commit_interval_blocks: self.commit_interval_blocks,
        }
    }
}

/// Timing knobs of one commit cycle
#[derive(Debug, Clone)]
pub struct CommitConfig {
    pub cycle_timeout: Duration,
    pub backoff: Duration,
    pub wait_blocks: u64,
    pub commit_interval_blocks: u64,
}

/// Which commitment the snapshot engine folds into the Merkle tree
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BuilderKind {
    #[default]
    Ledger,
    Event,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeChains {
    pub primary: ChainConfig,
    pub secondary: ChainConfig,
}

impl BridgeChains {
    pub fn get(&self, side: Side) -> &ChainConfig {
        match side {
            Side::Primary => &self.primary,
            Side::Secondary => &self.secondary,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub bridge_address: Address,
    pub validator_address: Address,
    pub confirmation_blocks: u64,
    pub gas_price_strategy: GasPriceStrategy,
    pub max_gas_price_gwei: u64,
    pub start_block: u64,
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
}

fn default_max_block_range() -> u64 {
    1_000
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
    Arbitrum,
    Optimism,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub private_key_env: String,
}

/// One bridged token pair
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub symbol: String,
    pub primary: Address,
    pub secondary: Address,
}

impl Settings {
    /// Load settings from the configured file
    pub fn load() -> Result<Self> {
        let config_path = env::var("BRIDGE_VALIDATOR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse and validate a TOML document
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        let (primary, secondary) = (&self.chains.primary, &self.chains.secondary);
        if primary.chain_id == secondary.chain_id {
            anyhow::bail!(
                "Primary and secondary chains share chain id {}",
                primary.chain_id
            );
        }

        for chain in [primary, secondary] {
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", chain.name);
            }
            if chain.confirmation_blocks == 0 {
                anyhow::bail!("Chain {} needs at least one confirmation block", chain.name);
            }
            if chain.max_block_range == 0 {
                anyhow::bail!("Chain {} has a zero max_block_range", chain.name);
            }
        }

        if self.validator.wait_blocks == 0 {
            anyhow::bail!("validator.wait_blocks must be positive");
        }

        if self.validator.builder == BuilderKind::Event && self.validator.appid.is_none() {
            anyhow::bail!("The event snapshot builder requires validator.appid");
        }

        let mut seen_primary = HashSet::new();
        let mut seen_secondary = HashSet::new();
        for token in &self.tokens {
            if !seen_primary.insert(token.primary) || !seen_secondary.insert(token.secondary) {
                anyhow::bail!("Token {} is registered twice", token.symbol);
            }
        }
        if self.tokens.is_empty() {
            tracing::warn!("No bridge tokens configured - every swap will be rejected");
        }

        if self.store.backend == StoreBackend::Postgres && self.store.url.is_empty() {
            anyhow::bail!("store.url is required for the postgres backend");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
