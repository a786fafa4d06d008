//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking to avoid conflicts between back-to-back submissions
//! - Nonce gap detection and recovery
//! - Release of nonces whose transaction never made it to the node

use crate::chain::ChainProvider;
use crate::error::BridgeResult;

use ethers::types::{Address, H256};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Local nonce state for one chain
#[derive(Debug, Default)]
struct NonceState {
    /// Next nonce to hand out
    current: u64,
    /// Submitted transactions: nonce -> tx_hash
    pending: BTreeMap<u64, H256>,
}

/// Manages the validator wallet's nonce on one chain
pub struct NonceManager {
    chain_id: u64,
    wallet_address: Address,
    state: Mutex<Option<NonceState>>,
}

impl NonceManager {
    pub fn new(chain_id: u64, wallet_address: Address) -> Self {
        Self {
            chain_id,
            wallet_address,
            state: Mutex::new(None),
        }
    }

    /// Allocate the next nonce, loading it from chain on first use
    pub async fn next(&self, provider: &ChainProvider) -> BridgeResult<u64> {
        let mut guard = self.state.lock().await;
        if guard.is_none() {
            let on_chain = provider.get_transaction_count(self.wallet_address).await?;
            debug!("Initialized nonce for chain {}: {}", self.chain_id, on_chain);
            *guard = Some(NonceState {
                current: on_chain,
                pending: BTreeMap::new(),
            });
        }
        Ok(Self::allocate(guard.get_or_insert_with(NonceState::default)))
    }

    fn allocate(state: &mut NonceState) -> u64 {
        let nonce = state.current;
        state.current += 1;
        nonce
    }

    /// Record the transaction that used `nonce`
    pub async fn mark_pending(&self, nonce: u64, tx_hash: H256) {
        if let Some(state) = self.state.lock().await.as_mut() {
            state.pending.insert(nonce, tx_hash);
        }
    }

    /// Release a nonce (transaction never accepted, can be reused)
    pub async fn release(&self, nonce: u64) {
        if let Some(state) = self.state.lock().await.as_mut() {
            Self::release_in(state, nonce);
        }
    }

    fn release_in(state: &mut NonceState, nonce: u64) {
        state.pending.remove(&nonce);
        if nonce + 1 == state.current {
            state.current = nonce;
        }
    }

    /// Sync nonces with on-chain state
    pub async fn sync(&self, provider: &ChainProvider) -> BridgeResult<()> {
        let on_chain = provider.get_transaction_count(self.wallet_address).await?;
        let mut guard = self.state.lock().await;
        let state = guard.get_or_insert_with(NonceState::default);
        Self::sync_in(self.chain_id, state, on_chain);
        Ok(())
    }

    fn sync_in(chain_id: u64, state: &mut NonceState, on_chain: u64) {
        if on_chain > state.current {
            warn!(
                "Nonce gap detected on chain {}: local {}, chain {}",
                chain_id, state.current, on_chain
            );
        }

        state.pending.retain(|nonce, _| *nonce >= on_chain);
        if state.current < on_chain {
            state.current = on_chain;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_release() {
        let mut state = NonceState {
            current: 5,
            pending: BTreeMap::new(),
        };
        assert_eq!(NonceManager::allocate(&mut state), 5);
        assert_eq!(NonceManager::allocate(&mut state), 6);

        // Only the most recent nonce can be handed out again
        NonceManager::release_in(&mut state, 5);
        assert_eq!(state.current, 7);
        NonceManager::release_in(&mut state, 6);
        assert_eq!(state.current, 6);
    }

    #[test]
    fn test_sync_drops_mined_nonces() {
        let mut state = NonceState {
            current: 3,
            pending: BTreeMap::new(),
        };
        state.pending.insert(1, H256::repeat_byte(1));
        state.pending.insert(2, H256::repeat_byte(2));

        NonceManager::sync_in(1, &mut state, 2);
        assert_eq!(state.pending.len(), 1);
        assert_eq!(state.current, 3);

        NonceManager::sync_in(1, &mut state, 10);
        assert!(state.pending.is_empty());
        assert_eq!(state.current, 10);
    }
}
