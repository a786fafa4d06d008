//! Chain provider with multi-RPC support and automatic failover

use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{BridgeError, BridgeResult};

use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: ChainConfig) -> BridgeResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(BridgeError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Shared handle to the active provider, for contract bindings
    pub fn client(&self) -> Arc<Provider<Http>> {
        Arc::new(self.http().clone())
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    fn connection_error(&self, e: impl ToString) -> BridgeError {
        BridgeError::ChainConnection {
            chain_id: self.config.chain_id,
            message: e.to_string(),
        }
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> BridgeResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => {
                    let block_num = block.as_u64();
                    crate::metrics::record_chain_head(self.config.chain_id, block_num);
                    return Ok(block_num);
                }
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed"))
    }

    /// Get block header by number or hash
    pub async fn get_block(&self, id: BlockId) -> BridgeResult<Option<Block<H256>>> {
        self.http()
            .get_block(id)
            .await
            .map_err(|e| self.connection_error(e))
    }

    /// Get transaction receipt
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> BridgeResult<Option<TransactionReceipt>> {
        self.http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.connection_error(e))
    }

    /// Whether the node still knows the transaction (mined or in mempool)
    pub async fn transaction_known(&self, tx_hash: H256) -> BridgeResult<bool> {
        self.http()
            .get_transaction(tx_hash)
            .await
            .map(|tx| tx.is_some())
            .map_err(|e| self.connection_error(e))
    }

    /// Pending nonce of an account
    pub async fn get_transaction_count(&self, address: Address) -> BridgeResult<u64> {
        self.http()
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map(|n| n.as_u64())
            .map_err(|e| BridgeError::Nonce {
                chain_id: self.config.chain_id,
                message: e.to_string(),
            })
    }

    /// Broadcast a signed transaction
    pub async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, ProviderError> {
        let pending = self.http().send_raw_transaction(raw).await?;
        Ok(pending.tx_hash())
    }

    /// Estimate gas for a transaction
    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> BridgeResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| BridgeError::GasEstimation(e.to_string()))
    }

    /// Get current gas price based on chain strategy
    pub async fn get_gas_price(&self) -> BridgeResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy | GasPriceStrategy::Arbitrum => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| BridgeError::GasEstimation(e.to_string()))?;
                Ok(GasPrice::Legacy(price))
            }
            GasPriceStrategy::Eip1559 | GasPriceStrategy::Optimism => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> BridgeResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| BridgeError::GasEstimation(e.to_string()))?
            .ok_or_else(|| BridgeError::GasEstimation("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| BridgeError::GasEstimation("No base fee in block".to_string()))?;

        // 2 gwei tip
        let priority_fee = U256::from(2_000_000_000u64);

        // Max fee = 2 * base_fee + priority_fee
        let max_fee = base_fee * 2 + priority_fee;

        let max_gwei = U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64);
        let max_fee = std::cmp::min(max_fee, max_gwei);

        Ok((max_fee, std::cmp::min(priority_fee, max_fee)))
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!(
                    "Health check failed for chain {}: {}",
                    self.config.chain_id, e
                );
                false
            }
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }
}

/// Gas price types
#[derive(Debug, Clone, PartialEq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}
