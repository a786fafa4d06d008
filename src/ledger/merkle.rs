//! Merkle commitment over chain ranges, balances and hash events
//!
//! Leaves are domain-tagged Keccak-256 hashes ordered by [`LeafKey`], so any
//! two validators folding the same window produce the same tree. Internal
//! nodes hash the sorted pair of their children; an odd node is carried up
//! unchanged. Proofs are plain sibling lists.

use crate::types::{keccak, word, ChainRange, HashEvent, LedgerEntry, ZERO_ROOT};

use ethers::types::{Address, H256, U256};
use std::collections::BTreeMap;

const PARENT_TAG: u8 = 0x00;
const RANGE_TAG: u8 = 0x01;
const BALANCE_TAG: u8 = 0x02;

/// Identity of a leaf; the derived order is the leaf order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LeafKey {
    Parent,
    Range {
        chain_id: u64,
    },
    Balance {
        chain_id: u64,
        account: Address,
        token: Address,
    },
    Event {
        appid: H256,
        hash: H256,
    },
}

pub fn parent_leaf(parent_root: H256) -> H256 {
    keccak(&[&[PARENT_TAG], parent_root.as_bytes()])
}

/// The end block is not part of the leaf: it is only known once the new
/// root has been published.
pub fn range_leaf(range: &ChainRange) -> H256 {
    keccak(&[
        &[RANGE_TAG],
        &word(U256::from(range.chain_id)),
        &word(U256::from(range.begin_block_num)),
        &word(U256::from(range.locked_block_num)),
    ])
}

pub fn balance_leaf(chain_id: u64, account: Address, token: Address, balance: U256) -> H256 {
    keccak(&[
        &[BALANCE_TAG],
        &word(U256::from(chain_id)),
        account.as_bytes(),
        token.as_bytes(),
        &word(balance),
    ])
}

pub fn event_leaf(appid: H256, hash: H256) -> H256 {
    keccak(&[appid.as_bytes(), hash.as_bytes()])
}

/// Hash of two sibling nodes, independent of their order
pub fn hash_pair(a: H256, b: H256) -> H256 {
    if a <= b {
        keccak(&[a.as_bytes(), b.as_bytes()])
    } else {
        keccak(&[b.as_bytes(), a.as_bytes()])
    }
}

/// Fold `proof` from `leaf` upward and compare with `root`
pub fn verify_proof(root: H256, leaf: H256, proof: &[H256]) -> bool {
    proof.iter().fold(leaf, |node, sibling| hash_pair(node, *sibling)) == root
}

#[derive(Debug, Clone)]
pub struct MerkleTree {
    keys: Vec<LeafKey>,
    /// `levels[0]` are the leaves, the last level holds the root
    levels: Vec<Vec<H256>>,
}

impl MerkleTree {
    pub fn new(leaves: BTreeMap<LeafKey, H256>) -> Self {
        let (keys, hashes): (Vec<_>, Vec<_>) = leaves.into_iter().unzip();

        let mut levels = vec![hashes];
        loop {
            let next: Vec<H256> = match levels.last() {
                Some(level) if level.len() > 1 => level
                    .chunks(2)
                    .map(|pair| pair.iter().copied().reduce(hash_pair).unwrap_or_default())
                    .collect(),
                _ => break,
            };
            levels.push(next);
        }

        Self { keys, levels }
    }

    pub fn root(&self) -> H256 {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or(ZERO_ROOT)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn position(&self, key: &LeafKey) -> Option<usize> {
        self.keys.binary_search(key).ok()
    }

    pub fn leaf(&self, key: &LeafKey) -> Option<H256> {
        self.position(key).map(|i| self.levels[0][i])
    }

    /// Sibling path from the leaf at `key` to the root
    pub fn proof(&self, key: &LeafKey) -> Option<Vec<H256>> {
        let mut index = self.position(key)?;
        let mut proof = Vec::new();

        for level in &self.levels[..self.levels.len() - 1] {
            if let Some(sibling) = level.get(index ^ 1) {
                proof.push(*sibling);
            }
            index /= 2;
        }
        Some(proof)
    }
}

fn base_leaves(parent_root: H256, chains: &[ChainRange; 2]) -> BTreeMap<LeafKey, H256> {
    let mut leaves = BTreeMap::new();
    leaves.insert(LeafKey::Parent, parent_leaf(parent_root));
    for range in chains {
        leaves.insert(
            LeafKey::Range {
                chain_id: range.chain_id,
            },
            range_leaf(range),
        );
    }
    leaves
}

/// Tree over the chain ranges and every valid balance row
pub fn build_ledger_tree(
    parent_root: H256,
    chains: &[ChainRange; 2],
    entries: &[LedgerEntry],
) -> MerkleTree {
    let mut leaves = base_leaves(parent_root, chains);
    for entry in entries.iter().filter(|e| e.valid) {
        leaves.insert(
            LeafKey::Balance {
                chain_id: entry.chain_id,
                account: entry.account,
                token: entry.token,
            },
            balance_leaf(entry.chain_id, entry.account, entry.token, entry.balance),
        );
    }
    MerkleTree::new(leaves)
}

/// Tree over the chain ranges and the hash events emitted for `appid`
pub fn build_event_tree(
    parent_root: H256,
    chains: &[ChainRange; 2],
    appid: H256,
    events: &[HashEvent],
) -> MerkleTree {
    let mut leaves = base_leaves(parent_root, chains);
    for event in events.iter().filter(|e| e.appid == appid) {
        leaves.insert(
            LeafKey::Event {
                appid,
                hash: event.hash,
            },
            event_leaf(appid, event.hash),
        );
    }
    MerkleTree::new(leaves)
}
