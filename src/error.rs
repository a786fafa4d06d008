//! Error types for the bridge validator

use ethers::types::{Address, H256};
use thiserror::Error;

/// Main error type for the validator
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Contract call failed on chain {chain_id}: {message}")]
    Contract { chain_id: u64, message: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Nonce error for chain {chain_id}: {message}")]
    Nonce { chain_id: u64, message: String },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Transaction {tx_hash:?} reverted on chain {chain_id}")]
    TransactionReverted { chain_id: u64, tx_hash: H256 },

    #[error("Token {token:?} on chain {chain_id} is not registered")]
    UnknownToken { chain_id: u64, token: Address },

    #[error("Invalid bridge transaction {tx_id:?}: {reason}")]
    InvalidBridgeTx { tx_id: H256, reason: String },

    #[error("Claim {tx_id:?} overdraws {account:?}: balance {balance}, claimed {claimed}")]
    LedgerOverdraw {
        tx_id: H256,
        account: Address,
        balance: String,
        claimed: String,
    },

    #[error("Swap {swap_tx_hash:?} claimed twice")]
    DuplicateClaim { swap_tx_hash: H256 },

    #[error("Merkle root mismatch: expected {expected:?}, rebuilt {actual:?}")]
    RootMismatch { expected: H256, actual: H256 },

    #[error("No snapshot stored for root {root:?}")]
    MissingSnapshot { root: H256 },

    #[error("No ledger stored for root {root:?}")]
    MissingLedger { root: H256 },

    #[error("Snapshot {root:?} is already persisted with different contents")]
    SnapshotConflict { root: H256 },

    #[error("Counter chain {chain_id} has no snapshot matching root {root:?}")]
    CounterChainMismatch { chain_id: u64, root: H256 },

    #[error("Unmanageable bridge state: {0}")]
    Unmanageable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How the coordinator reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// RPC or storage hiccup, retry the same state after backoff
    Transient,
    /// Transaction reverted, re-enter the matching `Need*` state
    Reverted,
    /// Data does not add up, abort the cycle without submitting
    Integrity,
    /// On-chain facts contradict each other, wait for the operator
    Unmanageable,
}

impl BridgeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BridgeError::TransactionReverted { .. } => ErrorClass::Reverted,
            BridgeError::UnknownToken { .. }
            | BridgeError::InvalidBridgeTx { .. }
            | BridgeError::LedgerOverdraw { .. }
            | BridgeError::DuplicateClaim { .. }
            | BridgeError::RootMismatch { .. }
            | BridgeError::MissingSnapshot { .. }
            | BridgeError::MissingLedger { .. }
            | BridgeError::SnapshotConflict { .. }
            | BridgeError::CounterChainMismatch { .. }
            | BridgeError::Config(_)
            | BridgeError::Wallet(_) => ErrorClass::Integrity,
            BridgeError::Unmanageable(_) => ErrorClass::Unmanageable,
            _ => ErrorClass::Transient,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::Reverted)
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Integrity | ErrorClass::Unmanageable
        )
    }
}

/// Result type for validator operations
pub type BridgeResult<T> = Result<T, BridgeError>;
