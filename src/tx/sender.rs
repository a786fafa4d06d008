//! Transaction sender with retry logic and fee bumping

use super::gas::{build_tx, GasEstimator, TxParams};
use super::nonce::NonceManager;
use crate::chain::ChainProvider;
use crate::error::{BridgeError, BridgeResult};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{H256, U256};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Signs and broadcasts transactions for the validator wallet on one chain
pub struct TransactionSender {
    chain_id: u64,
    wallet: LocalWallet,
    nonce_manager: NonceManager,
    gas_estimator: GasEstimator,
    max_retries: u32,
    retry_delay: Duration,
}

impl TransactionSender {
    pub fn new(chain_id: u64, wallet: LocalWallet, max_retries: u32, retry_delay: Duration) -> Self {
        let wallet = wallet.with_chain_id(chain_id);
        Self {
            chain_id,
            nonce_manager: NonceManager::new(chain_id, wallet.address()),
            wallet,
            gas_estimator: GasEstimator::new(),
            max_retries: max_retries.max(1),
            retry_delay,
        }
    }

    /// Buffered gas limit of `call` sent from the validator wallet
    pub async fn estimate_gas_limit(
        &self,
        provider: &ChainProvider,
        call: &TypedTransaction,
    ) -> BridgeResult<U256> {
        let mut call = call.clone();
        call.set_from(self.wallet.address());
        self.gas_estimator.estimate_gas_limit(provider, &call).await
    }

    /// Sign and broadcast a contract call under `gas_limit`
    pub async fn send(
        &self,
        provider: &ChainProvider,
        call: TypedTransaction,
        gas_limit: U256,
    ) -> BridgeResult<H256> {
        let mut call = call;
        call.set_from(self.wallet.address());

        let mut gas_price = self.gas_estimator.get_gas_price(provider).await?;
        let mut nonce = self.nonce_manager.next(provider).await?;

        let mut attempts = 0;
        let mut last_error = None;

        while attempts < self.max_retries {
            attempts += 1;

            let tx = build_tx(
                &call,
                &TxParams {
                    from: self.wallet.address(),
                    nonce,
                    gas_limit,
                    gas_price: gas_price.clone(),
                    chain_id: self.chain_id,
                },
            );

            let signed_tx = match self.wallet.sign_transaction(&tx).await {
                Ok(sig) => tx.rlp_signed(&sig),
                Err(e) => {
                    error!("Failed to sign transaction: {}", e);
                    self.nonce_manager.release(nonce).await;
                    return Err(BridgeError::Wallet(e.to_string()));
                }
            };

            let result = timeout(
                Duration::from_secs(30),
                provider.send_raw_transaction(signed_tx),
            )
            .await;

            match result {
                Ok(Ok(tx_hash)) => {
                    info!(
                        "Transaction sent on chain {}: {:?} (attempt {}/{})",
                        self.chain_id, tx_hash, attempts, self.max_retries
                    );
                    self.nonce_manager.mark_pending(nonce, tx_hash).await;
                    return Ok(tx_hash);
                }
                Ok(Err(e)) => {
                    let error_msg = e.to_string();

                    if error_msg.contains("nonce too low") {
                        warn!("Nonce too low on chain {}, syncing", self.chain_id);
                        self.nonce_manager.sync(provider).await?;
                        nonce = self.nonce_manager.next(provider).await?;
                    } else if error_msg.contains("replacement transaction underpriced") {
                        warn!("Transaction underpriced on chain {}, bumping fees", self.chain_id);
                        gas_price = self.gas_estimator.speed_up_gas_price(&gas_price, 125);
                    } else if error_msg.contains("insufficient funds") {
                        self.nonce_manager.release(nonce).await;
                        return Err(BridgeError::Transaction(format!(
                            "Insufficient funds for {:?} on chain {}",
                            self.wallet.address(),
                            self.chain_id
                        )));
                    }

                    last_error = Some(BridgeError::Transaction(error_msg));
                }
                Err(_) => {
                    warn!("Transaction send timeout (attempt {})", attempts);
                    last_error = Some(BridgeError::Timeout {
                        operation: "send transaction".to_string(),
                    });
                }
            }

            if attempts < self.max_retries {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        self.nonce_manager.release(nonce).await;

        Err(last_error.unwrap_or_else(|| BridgeError::Transaction("Unknown error".to_string())))
    }
}
