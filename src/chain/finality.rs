//! Confirmation-depth policy for submitted transactions
//!
//! Different chains have different finality models:
//! - Ethereum: Probabilistic (32 blocks for practical finality, ~6 min)
//! - Polygon: Probabilistic (128 blocks)
//! - BSC: Fast finality with 15 blocks recommended
//! - Avalanche: Instant finality (1 block)

use crate::types::TxStatus;

use ethers::types::H256;
use tracing::debug;

/// What the node reports about a transaction's receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptView {
    pub block_number: u64,
    pub block_hash: H256,
    pub success: bool,
}

/// Classifies transactions as pending, confirmed or reverted
#[derive(Debug, Clone, Copy)]
pub struct ConfirmationPolicy {
    chain_id: u64,
    confirmation_blocks: u64,
}

impl ConfirmationPolicy {
    pub fn new(chain_id: u64, confirmation_blocks: u64) -> Self {
        Self {
            chain_id,
            confirmation_blocks,
        }
    }

    pub fn confirmation_blocks(&self) -> u64 {
        self.confirmation_blocks
    }

    /// Decide the status of a transaction.
    ///
    /// `canonical_hash` is the hash of the block currently at the receipt's
    /// height; a mismatch means the receipt block was reorged out. A
    /// transaction without a receipt that the node no longer knows is treated
    /// as reverted once its submission block is buried deep enough.
    pub fn evaluate(
        &self,
        head: u64,
        submitted_block: u64,
        receipt: Option<ReceiptView>,
        known: bool,
        canonical_hash: Option<H256>,
    ) -> TxStatus {
        let Some(receipt) = receipt else {
            if !known && head >= submitted_block.saturating_add(self.confirmation_blocks) {
                debug!(
                    "Transaction dropped on chain {} (submitted at {})",
                    self.chain_id, submitted_block
                );
                return TxStatus::Reverted;
            }
            return TxStatus::Pending;
        };

        if canonical_hash != Some(receipt.block_hash) {
            debug!(
                "Receipt block {} on chain {} is no longer canonical",
                receipt.block_number, self.chain_id
            );
            return TxStatus::Pending;
        }

        if !receipt.success {
            return TxStatus::Reverted;
        }

        let confirmations = head.saturating_sub(receipt.block_number);
        if confirmations >= self.confirmation_blocks {
            TxStatus::Confirmed
        } else {
            debug!(
                "Transaction has {} / {} confirmations on chain {}",
                confirmations, self.confirmation_blocks, self.chain_id
            );
            TxStatus::Pending
        }
    }
}

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 32,
        // Ethereum testnets
        11155111 | 5 => 12,
        // BSC
        56 | 97 => 15,
        // Polygon mainnet
        137 => 128,
        // Polygon testnets
        80001 | 80002 => 32,
        // Arbitrum
        42161 | 421614 => 64,
        // Optimism
        10 | 11155420 => 64,
        // Base
        8453 | 84532 => 64,
        // Avalanche (instant finality)
        43114 | 43113 => 1,
        // Default conservative
        _ => 64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt(block_number: u64, success: bool) -> ReceiptView {
        ReceiptView {
            block_number,
            block_hash: H256::repeat_byte(block_number as u8),
            success,
        }
    }

    #[test]
    fn test_confirmed_after_depth() {
        let policy = ConfirmationPolicy::new(1, 12);
        let r = receipt(100, true);
        assert_eq!(
            policy.evaluate(111, 99, Some(r), true, Some(r.block_hash)),
            TxStatus::Pending
        );
        assert_eq!(
            policy.evaluate(112, 99, Some(r), true, Some(r.block_hash)),
            TxStatus::Confirmed
        );
    }

    #[test]
    fn test_reverted_receipt() {
        let policy = ConfirmationPolicy::new(1, 12);
        let r = receipt(100, false);
        assert_eq!(
            policy.evaluate(200, 99, Some(r), true, Some(r.block_hash)),
            TxStatus::Reverted
        );
    }

    #[test]
    fn test_reorged_receipt_is_pending() {
        let policy = ConfirmationPolicy::new(1, 12);
        let r = receipt(100, true);
        assert_eq!(
            policy.evaluate(200, 99, Some(r), true, Some(H256::repeat_byte(0xee))),
            TxStatus::Pending
        );
    }

    #[test]
    fn test_dropped_transaction() {
        let policy = ConfirmationPolicy::new(1, 12);
        assert_eq!(policy.evaluate(105, 100, None, false, None), TxStatus::Pending);
        assert_eq!(policy.evaluate(112, 100, None, false, None), TxStatus::Reverted);
        assert_eq!(policy.evaluate(500, 100, None, true, None), TxStatus::Pending);
    }

    #[test]
    fn test_recommended_confirmations() {
        assert_eq!(recommended_confirmations(1), 32);
        assert_eq!(recommended_confirmations(56), 15);
        assert_eq!(recommended_confirmations(999_999), 64);
    }
}
