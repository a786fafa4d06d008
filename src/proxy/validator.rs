//! Validator contract proxy: validator set and multi-signature proposals

use super::contracts::ValidatorContract;
use super::{lock_bridge_digest, update_root_digest, ValidatorProxy};
use crate::chain::{ChainAdapter, ChainProvider};
use crate::error::{BridgeError, BridgeResult};
use crate::types::{Proposal, Validator, ValidatorStatus};

use async_trait::async_trait;
use ethers::prelude::*;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct EvmValidatorProxy {
    provider: Arc<ChainProvider>,
    adapter: Arc<dyn ChainAdapter>,
    address: Address,
}

impl EvmValidatorProxy {
    pub fn new(provider: Arc<ChainProvider>, adapter: Arc<dyn ChainAdapter>) -> Self {
        let address = provider.config().validator_address;
        Self {
            provider,
            adapter,
            address,
        }
    }

    fn contract(&self) -> ValidatorContract<Provider<Http>> {
        ValidatorContract::new(self.address, self.provider.client())
    }

    fn contract_error(&self, e: impl ToString) -> BridgeError {
        BridgeError::Contract {
            chain_id: self.provider.chain_id(),
            message: e.to_string(),
        }
    }
}

/// Build a proposal from the raw contract reply. A proposal nobody signed
/// and nobody executed does not exist yet.
pub fn decode_proposal(hash: H256, executed: bool, raw: Vec<Bytes>) -> Option<Proposal> {
    if !executed && raw.is_empty() {
        return None;
    }

    let signatures = raw
        .iter()
        .filter_map(|bytes| match Signature::try_from(bytes.as_ref()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!("Skipping malformed proposal signature: {}", e);
                None
            }
        })
        .collect();

    Some(Proposal {
        hash,
        executed,
        signatures,
    })
}

fn encode_signatures(signatures: &[Signature]) -> Vec<Bytes> {
    signatures
        .iter()
        .map(|sig| Bytes::from(sig.to_vec()))
        .collect()
}

#[async_trait]
impl ValidatorProxy for EvmValidatorProxy {
    async fn get_validators(&self) -> BridgeResult<Vec<Validator>> {
        let (accounts, statuses, update_blocks) = self
            .contract()
            .get_validators()
            .call()
            .await
            .map_err(|e| self.contract_error(e))?;

        if accounts.len() != statuses.len() || accounts.len() != update_blocks.len() {
            return Err(self.contract_error("validator set arrays differ in length"));
        }

        Ok(accounts
            .into_iter()
            .zip(statuses)
            .zip(update_blocks)
            .map(|((address, status), update_block)| Validator {
                address,
                status: ValidatorStatus::from(status),
                update_block: update_block.as_u64(),
            })
            .collect())
    }

    async fn get_lock_bridge_proposal(&self, root: H256) -> BridgeResult<Option<Proposal>> {
        let (executed, signatures) = self
            .contract()
            .get_lock_bridge_proposal(root.0)
            .call()
            .await
            .map_err(|e| self.contract_error(e))?;
        Ok(decode_proposal(lock_bridge_digest(root), executed, signatures))
    }

    async fn lock_bridge(&self, root: H256, signatures: Vec<Signature>) -> BridgeResult<H256> {
        debug!(
            "Submitting lockBridge({:?}) on chain {} with {} signatures",
            root,
            self.provider.chain_id(),
            signatures.len()
        );
        let call = self
            .contract()
            .lock_bridge(root.0, encode_signatures(&signatures));
        self.adapter.send_transaction(call.tx).await
    }

    async fn get_merkle_root_proposal(&self, root: H256) -> BridgeResult<Option<Proposal>> {
        let (executed, signatures) = self
            .contract()
            .get_merkle_root_proposal(root.0)
            .call()
            .await
            .map_err(|e| self.contract_error(e))?;
        Ok(decode_proposal(update_root_digest(root), executed, signatures))
    }

    async fn update_bridge_merkle_root(
        &self,
        parent_root: H256,
        new_root: H256,
        signatures: Vec<Signature>,
    ) -> BridgeResult<H256> {
        debug!(
            "Submitting updateBridgeMerkleRoot({:?} -> {:?}) on chain {} with {} signatures",
            parent_root,
            new_root,
            self.provider.chain_id(),
            signatures.len()
        );
        let call = self.contract().update_bridge_merkle_root(
            parent_root.0,
            new_root.0,
            encode_signatures(&signatures),
        );
        self.adapter.send_transaction(call.tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::signers::{LocalWallet, Signer};

    #[test]
    fn test_decode_proposal() {
        let wallet: LocalWallet =
            "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
                .parse()
                .unwrap();
        let digest = lock_bridge_digest(H256::repeat_byte(3));
        let sig = wallet.sign_hash(digest).unwrap();

        assert!(decode_proposal(digest, false, vec![]).is_none());

        let executed = decode_proposal(digest, true, vec![]).unwrap();
        assert!(executed.executed);

        let raw = vec![Bytes::from(sig.to_vec()), Bytes::from(vec![1, 2, 3])];
        let proposal = decode_proposal(digest, false, raw).unwrap();
        assert_eq!(proposal.signatures, vec![sig]);
        assert!(proposal.signed_by(wallet.address()));
    }
}
