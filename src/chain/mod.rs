//! Chain module - the adapter boundary to both bridged chains
//!
//! This module provides:
//! - The `ChainAdapter` capability consumed by the proxies and the coordinator
//! - Multi-RPC provider management with automatic failover
//! - Confirmation-depth policy for submitted transactions
//! - Health monitoring of both chains

pub mod adapter;
pub mod finality;
pub mod provider;

pub use adapter::EvmChainAdapter;
pub use finality::{recommended_confirmations, ConfirmationPolicy, ReceiptView};
pub use provider::{ChainProvider, GasPrice};

use crate::config::Settings;
use crate::error::{BridgeError, BridgeResult};
use crate::tx::TransactionSender;
use crate::types::{Side, TxStatus};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::signers::LocalWallet;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{BlockId, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Header fields the validator needs from a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
    pub timestamp: u64,
}

/// Access to one chain: heads, blocks, submission and confirmation state
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain_id(&self) -> u64;

    fn chain_name(&self) -> String;

    /// Current head block number
    async fn head_number(&self) -> BridgeResult<u64>;

    /// Block header by number or hash
    async fn get_block(&self, id: BlockId) -> BridgeResult<Option<BlockInfo>>;

    /// Estimate, sign with the validator wallet and broadcast a call
    async fn send_transaction(&self, tx: TypedTransaction) -> BridgeResult<H256>;

    /// Gas limit the validator wallet would send `tx` with
    async fn estimate_gas(&self, tx: TypedTransaction) -> BridgeResult<U256>;

    /// Confirmation state of `txid`, submitted at or after `submitted_block`
    async fn transaction_status(&self, txid: H256, submitted_block: u64) -> BridgeResult<TxStatus>;
}

/// Owns the adapters of both bridged chains
pub struct ChainManager {
    /// Adapters indexed by chain ID
    adapters: DashMap<u64, Arc<EvmChainAdapter>>,
    /// Chain IDs in `Side` order
    sides: [u64; 2],
}

impl ChainManager {
    /// Create adapters for the primary and secondary chains
    pub fn new(settings: &Settings, wallet: &LocalWallet) -> BridgeResult<Self> {
        let adapters = DashMap::new();
        let retry_delay = Duration::from_millis(settings.validator.retry_delay_ms);

        for side in Side::BOTH {
            let chain_config = settings.chains.get(side);
            info!(
                "Initializing chain {} (ID: {}) as side {}",
                chain_config.name, chain_config.chain_id, side
            );

            let recommended = recommended_confirmations(chain_config.chain_id);
            if chain_config.confirmation_blocks < recommended {
                warn!(
                    "Chain {} uses {} confirmation blocks, {} recommended",
                    chain_config.name, chain_config.confirmation_blocks, recommended
                );
            }

            let provider = Arc::new(ChainProvider::new(chain_config.clone())?);
            let sender = TransactionSender::new(
                chain_config.chain_id,
                wallet.clone(),
                settings.validator.max_retries,
                retry_delay,
            );
            adapters.insert(
                chain_config.chain_id,
                Arc::new(EvmChainAdapter::new(provider, sender)),
            );
        }

        Ok(Self {
            adapters,
            sides: [
                settings.chains.primary.chain_id,
                settings.chains.secondary.chain_id,
            ],
        })
    }

    /// Get adapter for a specific chain
    pub fn get_adapter(&self, chain_id: u64) -> BridgeResult<Arc<EvmChainAdapter>> {
        self.adapters
            .get(&chain_id)
            .map(|a| a.clone())
            .ok_or_else(|| BridgeError::Config(format!("Chain {} not configured", chain_id)))
    }

    /// Get adapter for one side of the bridge
    pub fn adapter(&self, side: Side) -> BridgeResult<Arc<EvmChainAdapter>> {
        self.get_adapter(self.sides[side.index()])
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let adapters: Vec<_> = self.adapters.iter().map(|e| e.value().clone()).collect();
        let mut results = Vec::new();

        for adapter in adapters {
            let chain_id = adapter.chain_id();
            let healthy = adapter.provider().health_check().await;
            results.push((chain_id, healthy));

            crate::metrics::record_chain_health(chain_id, healthy);
        }

        results
    }
}
