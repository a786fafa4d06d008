//! Thin proxies over the on-chain bridge contracts
//!
//! Each chain carries two contracts:
//! - the bridge head, holding the lock flag, the committed Merkle root and
//!   the swap/claim activity
//! - the validator contract, holding the validator set and the
//!   multi-signature proposals for lock and update-root actions

pub mod contracts;
pub mod events;
pub mod head;
pub mod validator;

pub use head::EvmBridgeHead;
pub use validator::EvmValidatorProxy;

use crate::error::BridgeResult;
use crate::types::{keccak, BridgeTx, HashEvent, OnchainSnapshot, Proposal, TxRef, Validator};

use async_trait::async_trait;
use ethers::types::{Signature, H256};

/// Digest validators sign to authorize locking the bridge at `root`
pub fn lock_bridge_digest(root: H256) -> H256 {
    keccak(&[b"lockBridge", root.as_bytes()])
}

/// Digest validators sign to authorize publishing `new_root`
pub fn update_root_digest(new_root: H256) -> H256 {
    keccak(&[b"updateBridgeMerkleRoot", new_root.as_bytes()])
}

/// Read access to a chain's bridge head contract
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BridgeHeadProxy: Send + Sync {
    /// Currently committed root
    async fn get_merkle_root(&self) -> BridgeResult<H256>;

    async fn get_locked_status(&self) -> BridgeResult<bool>;

    /// Transaction that last locked the bridge, if it was ever locked
    async fn get_last_locked(&self) -> BridgeResult<Option<TxRef>>;

    /// Last root update, if any
    async fn get_last_snapshot(&self) -> BridgeResult<Option<OnchainSnapshot>>;

    /// Historical root update that produced `root`
    async fn get_snapshot(&self, root: H256) -> BridgeResult<Option<OnchainSnapshot>>;

    /// Swap and claim records in `[from_block, to_block]`, in chain order
    async fn scan_txs(&self, from_block: u64, to_block: u64) -> BridgeResult<Vec<BridgeTx>>;

    /// Hash events in `[from_block, to_block]`, in chain order
    async fn scan_hash_events(&self, from_block: u64, to_block: u64)
        -> BridgeResult<Vec<HashEvent>>;
}

/// Access to a chain's validator contract
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ValidatorProxy: Send + Sync {
    async fn get_validators(&self) -> BridgeResult<Vec<Validator>>;

    async fn get_lock_bridge_proposal(&self, root: H256) -> BridgeResult<Option<Proposal>>;

    /// Co-sign (or execute) locking at `root`, returns the transaction hash
    async fn lock_bridge(&self, root: H256, signatures: Vec<Signature>) -> BridgeResult<H256>;

    async fn get_merkle_root_proposal(&self, root: H256) -> BridgeResult<Option<Proposal>>;

    /// Co-sign (or execute) replacing `parent_root` with `new_root`
    async fn update_bridge_merkle_root(
        &self,
        parent_root: H256,
        new_root: H256,
        signatures: Vec<Signature>,
    ) -> BridgeResult<H256>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ZERO_ROOT;

    #[test]
    fn test_digests_are_action_specific() {
        let root = H256::repeat_byte(9);
        assert_ne!(lock_bridge_digest(root), update_root_digest(root));
        assert_ne!(lock_bridge_digest(root), lock_bridge_digest(ZERO_ROOT));

        let mut message = b"lockBridge".to_vec();
        message.extend_from_slice(&[0u8; 32]);
        assert_eq!(lock_bridge_digest(ZERO_ROOT), keccak(&[&message]));
    }
}
