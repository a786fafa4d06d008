//! Decoding of bridge head logs into bridge records
//!
//! Swap and claim logs become `BridgeTx` rows with content-derived ids;
//! `HashCommitted` logs become `HashEvent`s. Records are ordered by their
//! position in the chain (block, then log index).

use super::contracts::{ClaimFilter, HashCommittedFilter, SwapFilter};
use crate::types::{BridgeTx, BridgeTxType, HashEvent};

use ethers::contract::LogMeta;
use ethers::types::{H256, U256};

/// Position of a log in its chain
pub type LogPosition = (u64, U256);

pub fn position(meta: &LogMeta) -> LogPosition {
    (meta.block_number.as_u64(), meta.log_index)
}

pub fn swap_tx(chain_name: &str, chain_id: u64, ev: &SwapFilter, meta: &LogMeta) -> BridgeTx {
    let swap_tx_hash = BridgeTx::swap_hash(
        chain_id,
        ev.sender,
        ev.recipient,
        ev.token,
        ev.amount,
        ev.reward,
        ev.swap_count,
    );
    let mut tx = BridgeTx {
        bridge_tx_id: H256::zero(),
        chain_name: chain_name.to_string(),
        chain_id,
        block_number: meta.block_number.as_u64(),
        block_id: meta.block_hash,
        txid: meta.transaction_hash,
        token: ev.token,
        amount: ev.amount,
        recipient: ev.recipient,
        sender: ev.sender,
        reward: ev.reward,
        amount_out: ev.amount_out,
        swap_count: ev.swap_count,
        tx_type: BridgeTxType::Swap,
        swap_tx_hash,
    };
    tx.bridge_tx_id = tx.compute_id();
    tx
}

pub fn claim_tx(chain_name: &str, chain_id: u64, ev: &ClaimFilter, meta: &LogMeta) -> BridgeTx {
    let mut tx = BridgeTx {
        bridge_tx_id: H256::zero(),
        chain_name: chain_name.to_string(),
        chain_id,
        block_number: meta.block_number.as_u64(),
        block_id: meta.block_hash,
        txid: meta.transaction_hash,
        token: ev.token,
        amount: ev.amount,
        recipient: ev.recipient,
        sender: ev.recipient,
        reward: U256::zero(),
        amount_out: ev.amount,
        swap_count: U256::zero(),
        tx_type: BridgeTxType::Claim,
        swap_tx_hash: H256::from(ev.swap_tx_hash),
    };
    tx.bridge_tx_id = tx.compute_id();
    tx
}

pub fn hash_event(
    chain_name: &str,
    chain_id: u64,
    ev: &HashCommittedFilter,
    meta: &LogMeta,
) -> HashEvent {
    HashEvent {
        appid: H256::from(ev.appid),
        hash: H256::from(ev.hash),
        chain_name: chain_name.to_string(),
        chain_id,
        block_number: meta.block_number.as_u64(),
    }
}

/// Sort positioned records into chain order and drop the positions
pub fn in_chain_order<T>(mut items: Vec<(LogPosition, T)>) -> Vec<T> {
    items.sort_by(|a, b| a.0.cmp(&b.0));
    items.into_iter().map(|(_, item)| item).collect()
}
