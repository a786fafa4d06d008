//! EVM implementation of the chain adapter

use super::finality::{ConfirmationPolicy, ReceiptView};
use super::provider::ChainProvider;
use super::{BlockInfo, ChainAdapter};
use crate::error::BridgeResult;
use crate::tx::TransactionSender;
use crate::types::TxStatus;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{BlockId, H256, U256};
use std::sync::Arc;
use tracing::debug;

/// Chain adapter over a failover JSON-RPC provider and the validator wallet
pub struct EvmChainAdapter {
    provider: Arc<ChainProvider>,
    sender: TransactionSender,
    policy: ConfirmationPolicy,
}

impl EvmChainAdapter {
    pub fn new(provider: Arc<ChainProvider>, sender: TransactionSender) -> Self {
        let policy = ConfirmationPolicy::new(
            provider.chain_id(),
            provider.config().confirmation_blocks,
        );
        Self {
            provider,
            sender,
            policy,
        }
    }

    pub fn provider(&self) -> &Arc<ChainProvider> {
        &self.provider
    }
}

#[async_trait]
impl ChainAdapter for EvmChainAdapter {
    fn chain_id(&self) -> u64 {
        self.provider.chain_id()
    }

    fn chain_name(&self) -> String {
        self.provider.config().name.clone()
    }

    async fn head_number(&self) -> BridgeResult<u64> {
        self.provider.get_block_number().await
    }

    async fn get_block(&self, id: BlockId) -> BridgeResult<Option<BlockInfo>> {
        let block = self.provider.get_block(id).await?;
        Ok(block.and_then(|b| {
            Some(BlockInfo {
                number: b.number?.as_u64(),
                hash: b.hash?,
                parent_hash: b.parent_hash,
                timestamp: b.timestamp.as_u64(),
            })
        }))
    }

    async fn send_transaction(&self, tx: TypedTransaction) -> BridgeResult<H256> {
        let gas_limit = self.estimate_gas(tx.clone()).await?;
        self.sender.send(&self.provider, tx, gas_limit).await
    }

    async fn estimate_gas(&self, tx: TypedTransaction) -> BridgeResult<U256> {
        self.sender.estimate_gas_limit(&self.provider, &tx).await
    }

    async fn transaction_status(&self, txid: H256, submitted_block: u64) -> BridgeResult<TxStatus> {
        let head = self.provider.get_block_number().await?;
        let receipt = self.provider.get_transaction_receipt(txid).await?;

        let receipt = receipt.and_then(|r| {
            Some(ReceiptView {
                block_number: r.block_number?.as_u64(),
                block_hash: r.block_hash?,
                success: r.status.map(|s| s.as_u64() == 1).unwrap_or(false),
            })
        });

        let (known, canonical_hash) = match receipt {
            Some(view) => {
                let canonical = self
                    .provider
                    .get_block(BlockId::from(view.block_number))
                    .await?
                    .and_then(|b| b.hash);
                (true, canonical)
            }
            None => (self.provider.transaction_known(txid).await?, None),
        };

        let status = self
            .policy
            .evaluate(head, submitted_block, receipt, known, canonical_hash);
        debug!(
            "Transaction {:?} on chain {} is {:?} at head {}",
            txid,
            self.chain_id(),
            status,
            head
        );
        Ok(status)
    }
}
