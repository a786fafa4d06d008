//! Bridge data model shared by the ledger engine, the stores and the coordinator

use ethers::types::{Address, RecoveryMessage, Signature, H256, U256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;

/// Root of a snapshot that has not been computed yet, and of the empty bridge
pub const ZERO_ROOT: H256 = H256([0u8; 32]);

/// Keccak-256 over the concatenation of `parts`
pub fn keccak(parts: &[&[u8]]) -> H256 {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    H256::from_slice(&hasher.finalize())
}

/// 32-byte big-endian word, the ABI encoding of a uint256
pub fn word(value: U256) -> [u8; 32] {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    buf
}

/// The two chains a validator bridges. `Primary` is locked and updated first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Primary,
    Secondary,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Primary, Side::Secondary];

    pub fn index(self) -> usize {
        match self {
            Side::Primary => 0,
            Side::Secondary => 1,
        }
    }

    pub fn other(self) -> Side {
        match self {
            Side::Primary => Side::Secondary,
            Side::Secondary => Side::Primary,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Primary => write!(f, "A"),
            Side::Secondary => write!(f, "B"),
        }
    }
}

/// Inclusive block interval of one chain folded into a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRange {
    pub chain_name: String,
    pub chain_id: u64,
    pub begin_block_num: u64,
    pub locked_block_num: u64,
    pub end_block_num: u64,
}

impl ChainRange {
    /// Range of the synthetic genesis snapshot
    pub fn genesis(chain_name: &str, chain_id: u64, start_block: u64) -> Self {
        Self {
            chain_name: chain_name.to_string(),
            chain_id,
            begin_block_num: start_block,
            locked_block_num: start_block,
            end_block_num: start_block,
        }
    }

    /// Range following `self`, locked at `locked_block_num`. The end is
    /// filled in once the update transaction on this chain is confirmed.
    pub fn next(&self, locked_block_num: u64) -> Self {
        Self {
            chain_name: self.chain_name.clone(),
            chain_id: self.chain_id,
            begin_block_num: self.end_block_num + 1,
            locked_block_num,
            end_block_num: locked_block_num,
        }
    }

    pub fn covers(&self, block_number: u64) -> bool {
        self.begin_block_num <= block_number && block_number <= self.end_block_num
    }
}

/// Checkpoint node in the hash-linked chain of snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeSnapshot {
    pub parent_merkle_root: H256,
    pub merkle_root: H256,
    pub chains: [ChainRange; 2],
}

impl BridgeSnapshot {
    pub fn genesis(primary: ChainRange, secondary: ChainRange) -> Self {
        Self {
            parent_merkle_root: ZERO_ROOT,
            merkle_root: ZERO_ROOT,
            chains: [primary, secondary],
        }
    }

    pub fn chain(&self, side: Side) -> &ChainRange {
        &self.chains[side.index()]
    }

    pub fn chain_mut(&mut self, side: Side) -> &mut ChainRange {
        &mut self.chains[side.index()]
    }

    pub fn is_computed(&self) -> bool {
        self.merkle_root != ZERO_ROOT
    }
}

/// Running claimable balance of one (account, token) pair on one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Assigned by the snapshot store on save
    pub snapshot_id: Option<u64>,
    /// Assigned by the ledger store on save
    pub ledger_id: Option<u64>,
    pub merkle_root: H256,
    pub chain_name: String,
    pub chain_id: u64,
    pub account: Address,
    pub token: Address,
    pub balance: U256,
    pub valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeTxType {
    Swap,
    Claim,
}

impl BridgeTxType {
    fn tag(self) -> u8 {
        match self {
            BridgeTxType::Swap => 0,
            BridgeTxType::Claim => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BridgeTxType::Swap => "swap",
            BridgeTxType::Claim => "claim",
        }
    }
}

/// A scanned swap (lock-and-request) or claim (redeem) record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeTx {
    pub bridge_tx_id: H256,
    pub chain_name: String,
    pub chain_id: u64,
    pub block_number: u64,
    pub block_id: H256,
    pub txid: H256,
    pub token: Address,
    pub amount: U256,
    pub recipient: Address,
    pub sender: Address,
    pub reward: U256,
    pub amount_out: U256,
    pub swap_count: U256,
    pub tx_type: BridgeTxType,
    pub swap_tx_hash: H256,
}

impl BridgeTx {
    /// Content hash identifying a swap across both chains
    #[allow(clippy::too_many_arguments)]
    pub fn swap_hash(
        chain_id: u64,
        sender: Address,
        recipient: Address,
        token: Address,
        amount: U256,
        reward: U256,
        swap_count: U256,
    ) -> H256 {
        keccak(&[
            &word(U256::from(chain_id)),
            sender.as_bytes(),
            recipient.as_bytes(),
            token.as_bytes(),
            &word(amount),
            &word(reward),
            &word(swap_count),
        ])
    }

    /// Content hash of this record, used for dedup
    pub fn compute_id(&self) -> H256 {
        keccak(&[
            &word(U256::from(self.chain_id)),
            self.block_id.as_bytes(),
            self.txid.as_bytes(),
            &[self.tx_type.tag()],
            self.swap_tx_hash.as_bytes(),
        ])
    }
}

/// Generic commitment emitted by an on-chain application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashEvent {
    pub appid: H256,
    pub hash: H256,
    pub chain_name: String,
    pub chain_id: u64,
    pub block_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidatorStatus {
    Inactive,
    Active,
}

impl From<u8> for ValidatorStatus {
    fn from(value: u8) -> Self {
        if value == 1 {
            ValidatorStatus::Active
        } else {
            ValidatorStatus::Inactive
        }
    }
}

/// Mirror of on-chain validator-set membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    pub status: ValidatorStatus,
    pub update_block: u64,
}

/// On-chain multi-signature state of one pending lock or update-root action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// Authorization digest the signatures are over
    pub hash: H256,
    pub executed: bool,
    pub signatures: Vec<Signature>,
}

impl Proposal {
    /// Whether one of the collected signatures recovers to `address`
    pub fn signed_by(&self, address: Address) -> bool {
        self.signatures.iter().any(|sig| {
            sig.recover(RecoveryMessage::Hash(self.hash))
                .map(|signer| signer == address)
                .unwrap_or(false)
        })
    }
}

/// Reference to a transaction observed on chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRef {
    pub txid: H256,
    pub block_num: u64,
}

/// Last root update recorded by a bridge head contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnchainSnapshot {
    pub parent_root: H256,
    pub merkle_root: H256,
    pub tx: TxRef,
}

/// Confirmation state of a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Reverted,
}

/// Lock flag and committed root of one bridge head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStatus {
    pub locked: bool,
    pub root: H256,
}
