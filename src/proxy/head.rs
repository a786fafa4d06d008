//! Bridge head proxy backed by the on-chain contract

use super::contracts::BridgeHeadContract;
use super::events::{self, LogPosition};
use super::BridgeHeadProxy;
use crate::chain::ChainProvider;
use crate::error::{BridgeError, BridgeResult};
use crate::types::{BridgeTx, HashEvent, OnchainSnapshot, TxRef};

use async_trait::async_trait;
use ethers::prelude::*;
use std::sync::Arc;
use tracing::debug;

/// Reads lock state, roots and bridge activity from one chain
pub struct EvmBridgeHead {
    provider: Arc<ChainProvider>,
    address: Address,
    max_block_range: u64,
}

impl EvmBridgeHead {
    pub fn new(provider: Arc<ChainProvider>) -> Self {
        let address = provider.config().bridge_address;
        let max_block_range = provider.config().max_block_range;
        Self {
            provider,
            address,
            max_block_range,
        }
    }

    fn contract(&self) -> BridgeHeadContract<Provider<Http>> {
        BridgeHeadContract::new(self.address, self.provider.client())
    }

    fn chain_id(&self) -> u64 {
        self.provider.chain_id()
    }

    fn chain_name(&self) -> &str {
        &self.provider.config().name
    }

    fn contract_error(&self, e: impl ToString) -> BridgeError {
        BridgeError::Contract {
            chain_id: self.chain_id(),
            message: e.to_string(),
        }
    }

    /// Root update recorded at `block`, optionally the one producing `root`
    async fn root_update_at(
        &self,
        block: u64,
        root: Option<H256>,
    ) -> BridgeResult<Option<OnchainSnapshot>> {
        let updates = self
            .contract()
            .merkle_root_updated_filter()
            .from_block(block)
            .to_block(block)
            .query_with_meta()
            .await
            .map_err(|e| self.contract_error(e))?;

        Ok(updates
            .into_iter()
            .filter(|(ev, _)| root.map_or(true, |r| H256::from(ev.root) == r))
            .last()
            .map(|(ev, meta)| OnchainSnapshot {
                parent_root: H256::from(ev.parent_root),
                merkle_root: H256::from(ev.root),
                tx: TxRef {
                    txid: meta.transaction_hash,
                    block_num: meta.block_number.as_u64(),
                },
            }))
    }
}

/// Split `[from, to]` into inclusive chunks of at most `max` blocks
pub fn block_chunks(from: u64, to: u64, max: u64) -> Vec<(u64, u64)> {
    let mut chunks = Vec::new();
    let max = max.max(1);
    let mut start = from;
    while start <= to {
        let end = std::cmp::min(to, start.saturating_add(max - 1));
        chunks.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    chunks
}

#[async_trait]
impl BridgeHeadProxy for EvmBridgeHead {
    async fn get_merkle_root(&self) -> BridgeResult<H256> {
        self.contract()
            .merkle_root()
            .call()
            .await
            .map(H256::from)
            .map_err(|e| self.contract_error(e))
    }

    async fn get_locked_status(&self) -> BridgeResult<bool> {
        self.contract()
            .locked()
            .call()
            .await
            .map_err(|e| self.contract_error(e))
    }

    async fn get_last_locked(&self) -> BridgeResult<Option<TxRef>> {
        let block = self
            .contract()
            .last_locked_block()
            .call()
            .await
            .map_err(|e| self.contract_error(e))?
            .as_u64();
        if block == 0 {
            return Ok(None);
        }

        let locks = self
            .contract()
            .bridge_locked_filter()
            .from_block(block)
            .to_block(block)
            .query_with_meta()
            .await
            .map_err(|e| self.contract_error(e))?;

        let (_, meta) = locks.into_iter().last().ok_or_else(|| {
            self.contract_error(format!("no BridgeLocked log in block {}", block))
        })?;

        Ok(Some(TxRef {
            txid: meta.transaction_hash,
            block_num: block,
        }))
    }

    async fn get_last_snapshot(&self) -> BridgeResult<Option<OnchainSnapshot>> {
        let block = self
            .contract()
            .last_snapshot_block()
            .call()
            .await
            .map_err(|e| self.contract_error(e))?
            .as_u64();
        if block == 0 {
            return Ok(None);
        }
        self.root_update_at(block, None).await
    }

    async fn get_snapshot(&self, root: H256) -> BridgeResult<Option<OnchainSnapshot>> {
        let (_, block) = self
            .contract()
            .snapshots(root.0)
            .call()
            .await
            .map_err(|e| self.contract_error(e))?;
        if block.is_zero() {
            return Ok(None);
        }
        self.root_update_at(block.as_u64(), Some(root)).await
    }

    async fn scan_txs(&self, from_block: u64, to_block: u64) -> BridgeResult<Vec<BridgeTx>> {
        let contract = self.contract();
        let mut records: Vec<(LogPosition, BridgeTx)> = Vec::new();

        for (from, to) in block_chunks(from_block, to_block, self.max_block_range) {
            debug!(
                "Chain {}: scanning bridge txs in blocks {} to {}",
                self.chain_id(),
                from,
                to
            );

            let swaps = contract
                .swap_filter()
                .from_block(from)
                .to_block(to)
                .query_with_meta()
                .await
                .map_err(|e| self.contract_error(e))?;
            for (ev, meta) in &swaps {
                records.push((
                    events::position(meta),
                    events::swap_tx(self.chain_name(), self.chain_id(), ev, meta),
                ));
            }

            let claims = contract
                .claim_filter()
                .from_block(from)
                .to_block(to)
                .query_with_meta()
                .await
                .map_err(|e| self.contract_error(e))?;
            for (ev, meta) in &claims {
                records.push((
                    events::position(meta),
                    events::claim_tx(self.chain_name(), self.chain_id(), ev, meta),
                ));
            }
        }

        Ok(events::in_chain_order(records))
    }

    async fn scan_hash_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> BridgeResult<Vec<HashEvent>> {
        let contract = self.contract();
        let mut records = Vec::new();

        for (from, to) in block_chunks(from_block, to_block, self.max_block_range) {
            let logs = contract
                .hash_committed_filter()
                .from_block(from)
                .to_block(to)
                .query_with_meta()
                .await
                .map_err(|e| self.contract_error(e))?;
            for (ev, meta) in &logs {
                records.push((
                    events::position(meta),
                    events::hash_event(self.chain_name(), self.chain_id(), ev, meta),
                ));
            }
        }

        Ok(events::in_chain_order(records))
    }
}
