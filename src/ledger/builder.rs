//! Snapshot builders: turn a parent snapshot and a window into a candidate

use super::balances::{Ledger, LedgerDelta};
use super::merkle::{build_event_tree, build_ledger_tree, LeafKey, MerkleTree};
use super::token::TokenRegistry;
use crate::config::BuilderKind;
use crate::error::{BridgeError, BridgeResult};
use crate::types::{BridgeSnapshot, BridgeTx, BridgeTxType, HashEvent, LedgerEntry, Side};

use ethers::types::H256;
use std::sync::Arc;
use tracing::info;

/// Everything a builder folds into the next snapshot
#[derive(Debug, Clone)]
pub struct SnapshotInput {
    pub parent: BridgeSnapshot,
    /// Valid ledger rows of the parent snapshot
    pub parent_entries: Vec<LedgerEntry>,
    /// Block of the lock transaction, per side
    pub locked: [u64; 2],
    /// Window records, primary chain first, each chain in chain order
    pub txs: Vec<BridgeTx>,
    pub events: Vec<HashEvent>,
    /// Swaps whose claim was recorded in an earlier window
    pub settled: Vec<H256>,
}

impl SnapshotInput {
    /// Uncomputed child of `parent` covering up to the lock blocks
    pub fn next_snapshot(&self) -> BridgeSnapshot {
        BridgeSnapshot {
            parent_merkle_root: self.parent.merkle_root,
            merkle_root: H256::zero(),
            chains: [
                self.parent.chain(Side::Primary).next(self.locked[0]),
                self.parent.chain(Side::Secondary).next(self.locked[1]),
            ],
        }
    }
}

/// Next snapshot built once per cycle and reused until it is persisted
#[derive(Debug, Clone)]
pub struct Candidate {
    pub snapshot: BridgeSnapshot,
    pub entries: Vec<LedgerEntry>,
    pub tree: MerkleTree,
    pub delta: LedgerDelta,
}

impl Candidate {
    pub fn root(&self) -> H256 {
        self.snapshot.merkle_root
    }

    pub fn proof(&self, key: &LeafKey) -> Option<Vec<H256>> {
        self.tree.proof(key)
    }

    /// Fail unless this candidate commits to `expected`
    pub fn check_root(&self, expected: H256) -> BridgeResult<()> {
        if self.root() != expected {
            return Err(BridgeError::RootMismatch {
                expected,
                actual: self.root(),
            });
        }
        Ok(())
    }
}

/// Commitment strategy of the snapshot engine
pub trait SnapshotBuilder: Send + Sync {
    fn kind(&self) -> BuilderKind;

    fn build(&self, input: SnapshotInput) -> BridgeResult<Candidate>;

    /// Tree of an already built snapshot from its stored rows or its
    /// rescanned events
    fn rebuild(
        &self,
        snapshot: &BridgeSnapshot,
        entries: &[LedgerEntry],
        events: &[HashEvent],
    ) -> MerkleTree;
}

/// Commits to claimable balances
pub struct LedgerBuilder {
    registry: Arc<TokenRegistry>,
}

impl LedgerBuilder {
    pub fn new(registry: Arc<TokenRegistry>) -> Self {
        Self { registry }
    }

    /// Leaf holding the balance a swap credits, the one its claim proof is for
    pub fn credit_leaf(&self, tx: &BridgeTx) -> BridgeResult<LeafKey> {
        if tx.tx_type != BridgeTxType::Swap {
            return Err(BridgeError::InvalidBridgeTx {
                tx_id: tx.bridge_tx_id,
                reason: "only swaps credit a balance".to_string(),
            });
        }
        let (chain_id, token) = self.registry.counterpart(tx.chain_id, tx.token)?;
        Ok(LeafKey::Balance {
            chain_id,
            account: tx.recipient,
            token,
        })
    }
}

impl SnapshotBuilder for LedgerBuilder {
    fn kind(&self) -> BuilderKind {
        BuilderKind::Ledger
    }

    fn build(&self, input: SnapshotInput) -> BridgeResult<Candidate> {
        let mut snapshot = input.next_snapshot();

        let mut ledger = Ledger::from_entries(&input.parent_entries);
        ledger.mark_settled(input.settled.iter().copied());
        let delta = ledger.update_ledgers(&self.registry, &input.txs)?;

        // Rows are re-scoped to the new root once it is known
        let mut entries = ledger.into_entries(&self.registry, H256::zero());
        let tree = self.rebuild(&snapshot, &entries, &[]);
        snapshot.merkle_root = tree.root();
        for entry in &mut entries {
            entry.merkle_root = snapshot.merkle_root;
        }

        info!(
            parent = ?snapshot.parent_merkle_root,
            root = ?snapshot.merkle_root,
            "Built ledger snapshot: {} rows, {} swaps, {} claims",
            entries.len(),
            delta.swaps,
            delta.claims
        );

        Ok(Candidate {
            snapshot,
            entries,
            tree,
            delta,
        })
    }

    fn rebuild(
        &self,
        snapshot: &BridgeSnapshot,
        entries: &[LedgerEntry],
        _events: &[HashEvent],
    ) -> MerkleTree {
        build_ledger_tree(snapshot.parent_merkle_root, &snapshot.chains, entries)
    }
}

/// Commits to application hash events of one appid; keeps no ledger
pub struct EventBuilder {
    appid: H256,
}

impl EventBuilder {
    pub fn new(appid: H256) -> Self {
        Self { appid }
    }
}

impl SnapshotBuilder for EventBuilder {
    fn kind(&self) -> BuilderKind {
        BuilderKind::Event
    }

    fn build(&self, input: SnapshotInput) -> BridgeResult<Candidate> {
        let mut snapshot = input.next_snapshot();
        let tree = self.rebuild(&snapshot, &[], &input.events);
        snapshot.merkle_root = tree.root();

        info!(
            parent = ?snapshot.parent_merkle_root,
            root = ?snapshot.merkle_root,
            "Built event snapshot over {} leaves",
            tree.len()
        );

        Ok(Candidate {
            snapshot,
            entries: Vec::new(),
            tree,
            delta: LedgerDelta::default(),
        })
    }

    fn rebuild(
        &self,
        snapshot: &BridgeSnapshot,
        _entries: &[LedgerEntry],
        events: &[HashEvent],
    ) -> MerkleTree {
        build_event_tree(
            snapshot.parent_merkle_root,
            &snapshot.chains,
            self.appid,
            events,
        )
    }
}
