//! In-memory store

use super::{BridgeTxStore, CommitStore, LedgerStore, SnapshotStore};
use crate::error::{BridgeError, BridgeResult};
use crate::types::{BridgeSnapshot, BridgeTx, BridgeTxType, LedgerEntry, ZERO_ROOT};

use async_trait::async_trait;
use ethers::types::H256;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct MemoryState {
    /// Snapshot id `i + 1` lives at index `i`
    snapshots: Vec<BridgeSnapshot>,
    by_root: HashMap<H256, usize>,
    ledgers: HashMap<H256, Vec<LedgerEntry>>,
    next_ledger_id: u64,
    txs: BTreeMap<u64, Vec<BridgeTx>>,
    tx_ids: HashSet<H256>,
}

impl MemoryState {
    fn insert_snapshot(&mut self, snapshot: &BridgeSnapshot) -> BridgeResult<u64> {
        if !snapshot.is_computed() {
            return Err(BridgeError::Internal(
                "refusing to persist a snapshot without root".to_string(),
            ));
        }

        if let Some(&index) = self.by_root.get(&snapshot.merkle_root) {
            if self.snapshots[index] != *snapshot {
                return Err(BridgeError::SnapshotConflict {
                    root: snapshot.merkle_root,
                });
            }
            return Ok(index as u64 + 1);
        }
        if snapshot.parent_merkle_root != ZERO_ROOT
            && !self.by_root.contains_key(&snapshot.parent_merkle_root)
        {
            return Err(BridgeError::MissingSnapshot {
                root: snapshot.parent_merkle_root,
            });
        }

        self.snapshots.push(snapshot.clone());
        let index = self.snapshots.len() - 1;
        self.by_root.insert(snapshot.merkle_root, index);
        debug!("Stored snapshot {} with root {:?}", index + 1, snapshot.merkle_root);
        Ok(index as u64 + 1)
    }

    fn insert_ledger(&mut self, root: H256, entries: &[LedgerEntry]) -> BridgeResult<usize> {
        let snapshot_id = self
            .by_root
            .get(&root)
            .map(|&index| index as u64 + 1)
            .ok_or(BridgeError::MissingSnapshot { root })?;

        if self.ledgers.contains_key(&root) {
            return Ok(0);
        }

        let mut rows = Vec::with_capacity(entries.len());
        for entry in entries {
            self.next_ledger_id += 1;
            rows.push(LedgerEntry {
                snapshot_id: Some(snapshot_id),
                ledger_id: Some(self.next_ledger_id),
                merkle_root: root,
                ..entry.clone()
            });
        }
        let count = rows.len();
        self.ledgers.insert(root, rows);
        Ok(count)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn save(&self, snapshot: &BridgeSnapshot) -> BridgeResult<u64> {
        self.state.write().await.insert_snapshot(snapshot)
    }

    async fn get_by_root(&self, root: H256) -> BridgeResult<Option<BridgeSnapshot>> {
        let state = self.state.read().await;
        Ok(state
            .by_root
            .get(&root)
            .map(|&index| state.snapshots[index].clone()))
    }

    async fn get_last(&self) -> BridgeResult<Option<BridgeSnapshot>> {
        Ok(self.state.read().await.snapshots.last().cloned())
    }

    async fn get_by_block(&self, chain_id: u64, block: u64) -> BridgeResult<Option<BridgeSnapshot>> {
        let state = self.state.read().await;
        Ok(state
            .snapshots
            .iter()
            .find(|sn| {
                sn.chains
                    .iter()
                    .any(|range| range.chain_id == chain_id && range.covers(block))
            })
            .cloned())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn save(&self, root: H256, entries: &[LedgerEntry]) -> BridgeResult<usize> {
        self.state.write().await.insert_ledger(root, entries)
    }

    async fn load(&self, root: H256) -> BridgeResult<Option<Vec<LedgerEntry>>> {
        let state = self.state.read().await;
        Ok(state
            .ledgers
            .get(&root)
            .map(|rows| rows.iter().filter(|e| e.valid).cloned().collect()))
    }

    async fn invalidate(&self, root: H256) -> BridgeResult<usize> {
        let mut state = self.state.write().await;
        let mut touched = 0;
        if let Some(rows) = state.ledgers.get_mut(&root) {
            for row in rows.iter_mut().filter(|r| r.valid) {
                row.valid = false;
                touched += 1;
            }
        }
        Ok(touched)
    }
}

#[async_trait]
impl BridgeTxStore for MemoryStore {
    async fn save(&self, txs: &[BridgeTx]) -> BridgeResult<usize> {
        let mut state = self.state.write().await;
        let mut inserted = 0;
        for tx in txs {
            if state.tx_ids.insert(tx.bridge_tx_id) {
                state.txs.entry(tx.chain_id).or_default().push(tx.clone());
                inserted += 1;
            }
        }
        for records in state.txs.values_mut() {
            // Stable, keeps log order within a block
            records.sort_by_key(|tx| tx.block_number);
        }
        Ok(inserted)
    }

    async fn get_range(
        &self,
        chain_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> BridgeResult<Vec<BridgeTx>> {
        let state = self.state.read().await;
        Ok(state
            .txs
            .get(&chain_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|tx| from_block <= tx.block_number && tx.block_number <= to_block)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn remove_from(&self, chain_id: u64, block: u64) -> BridgeResult<usize> {
        let mut state = self.state.write().await;
        let removed: Vec<H256> = match state.txs.get_mut(&chain_id) {
            Some(records) => {
                let (gone, kept): (Vec<_>, Vec<_>) = records
                    .drain(..)
                    .partition(|tx| tx.block_number >= block);
                *records = kept;
                gone.into_iter().map(|tx| tx.bridge_tx_id).collect()
            }
            None => Vec::new(),
        };
        for id in &removed {
            state.tx_ids.remove(id);
        }
        Ok(removed.len())
    }

    async fn get_claims(&self, swap_tx_hash: H256) -> BridgeResult<Vec<BridgeTx>> {
        let state = self.state.read().await;
        Ok(state
            .txs
            .values()
            .flatten()
            .filter(|tx| tx.tx_type == BridgeTxType::Claim && tx.swap_tx_hash == swap_tx_hash)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CommitStore for MemoryStore {
    async fn save_commit(
        &self,
        snapshot: &BridgeSnapshot,
        entries: &[LedgerEntry],
    ) -> BridgeResult<(u64, usize)> {
        let mut state = self.state.write().await;
        let id = state.insert_snapshot(snapshot)?;
        let rows = state.insert_ledger(snapshot.merkle_root, entries)?;
        Ok((id, rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChainRange;
    use ethers::types::{Address, U256};

    fn snapshot(parent: H256, root: H256, a: (u64, u64), b: (u64, u64)) -> BridgeSnapshot {
        BridgeSnapshot {
            parent_merkle_root: parent,
            merkle_root: root,
            chains: [
                ChainRange {
                    chain_name: "ethereum".into(),
                    chain_id: 1,
                    begin_block_num: a.0,
                    locked_block_num: a.1,
                    end_block_num: a.1 + 1,
                },
                ChainRange {
                    chain_name: "bsc".into(),
                    chain_id: 56,
                    begin_block_num: b.0,
                    locked_block_num: b.1,
                    end_block_num: b.1 + 1,
                },
            ],
        }
    }

    fn entry(balance: u64) -> LedgerEntry {
        LedgerEntry {
            snapshot_id: None,
            ledger_id: None,
            merkle_root: H256::zero(),
            chain_name: "bsc".into(),
            chain_id: 56,
            account: Address::repeat_byte(2),
            token: Address::repeat_byte(3),
            balance: U256::from(balance),
            valid: true,
        }
    }

    fn tx(chain_id: u64, block: u64, n: u8) -> BridgeTx {
        BridgeTx {
            bridge_tx_id: H256::repeat_byte(n),
            chain_name: "ethereum".into(),
            chain_id,
            block_number: block,
            block_id: H256::from_low_u64_be(block),
            txid: H256::repeat_byte(n),
            token: Address::repeat_byte(3),
            amount: U256::from(10),
            recipient: Address::repeat_byte(2),
            sender: Address::repeat_byte(1),
            reward: U256::zero(),
            amount_out: U256::from(10),
            swap_count: U256::from(n),
            tx_type: BridgeTxType::Swap,
            swap_tx_hash: H256::repeat_byte(n),
        }
    }

    #[tokio::test]
    async fn test_snapshot_chain() {
        let store = MemoryStore::new();
        let r1 = H256::repeat_byte(1);
        let r2 = H256::repeat_byte(2);
        let first = snapshot(ZERO_ROOT, r1, (101, 150), (201, 260));
        let second = snapshot(r1, r2, (152, 190), (262, 300));

        // Parent must be stored first
        let err = SnapshotStore::save(&store, &second).await.unwrap_err();
        assert!(matches!(err, BridgeError::MissingSnapshot { .. }));

        assert_eq!(SnapshotStore::save(&store, &first).await.unwrap(), 1);
        assert_eq!(SnapshotStore::save(&store, &second).await.unwrap(), 2);
        assert_eq!(SnapshotStore::save(&store, &second).await.unwrap(), 2);

        let mut altered = second.clone();
        altered.chains[0].end_block_num += 5;
        let err = SnapshotStore::save(&store, &altered).await.unwrap_err();
        assert!(matches!(err, BridgeError::SnapshotConflict { .. }));

        assert_eq!(store.get_last().await.unwrap(), Some(second.clone()));
        assert_eq!(store.get_by_root(r1).await.unwrap(), Some(first.clone()));
        assert_eq!(store.get_by_block(56, 270).await.unwrap(), Some(second));
        assert_eq!(store.get_by_block(1, 151).await.unwrap(), Some(first));
        assert!(store.get_by_block(1, 500).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ledger_rows() {
        let store = MemoryStore::new();
        let root = H256::repeat_byte(1);
        assert!(LedgerStore::save(&store, root, &[entry(1)]).await.is_err());

        SnapshotStore::save(&store, &snapshot(ZERO_ROOT, root, (1, 2), (1, 2)))
            .await
            .unwrap();
        assert!(store.load(root).await.unwrap().is_none());

        assert_eq!(
            LedgerStore::save(&store, root, &[entry(1), entry(2)]).await.unwrap(),
            2
        );
        let rows = store.load(root).await.unwrap().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].snapshot_id, Some(1));
        assert_eq!(rows[1].ledger_id, Some(2));
        assert_eq!(rows[0].merkle_root, root);

        assert_eq!(store.invalidate(root).await.unwrap(), 2);
        assert_eq!(store.load(root).await.unwrap(), Some(vec![]));
    }

    #[tokio::test]
    async fn test_bridge_txs() {
        let store = MemoryStore::new();
        let batch = vec![tx(1, 12, 2), tx(1, 10, 1), tx(56, 11, 3)];
        assert_eq!(BridgeTxStore::save(&store, &batch).await.unwrap(), 3);
        assert_eq!(BridgeTxStore::save(&store, &batch).await.unwrap(), 0);

        let range = store.get_range(1, 10, 12).await.unwrap();
        assert_eq!(range.iter().map(|t| t.block_number).collect::<Vec<_>>(), vec![10, 12]);

        assert_eq!(store.remove_from(1, 11).await.unwrap(), 1);
        assert_eq!(store.get_range(1, 0, 100).await.unwrap().len(), 1);
        // Removed records can be scanned again after a fork
        assert_eq!(BridgeTxStore::save(&store, &[tx(1, 12, 2)]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_claims_by_swap_hash() {
        let store = MemoryStore::new();
        let swap = tx(1, 10, 1);
        let mut claim = tx(56, 20, 4);
        claim.tx_type = BridgeTxType::Claim;
        claim.swap_tx_hash = swap.swap_tx_hash;
        BridgeTxStore::save(&store, &[swap.clone(), claim.clone(), tx(56, 21, 5)])
            .await
            .unwrap();

        assert_eq!(store.get_claims(swap.swap_tx_hash).await.unwrap(), vec![claim]);
        assert!(store.get_claims(H256::repeat_byte(5)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_writes_snapshot_and_ledger() {
        let store = MemoryStore::new();
        let root = H256::repeat_byte(1);
        let first = snapshot(ZERO_ROOT, root, (101, 150), (201, 260));

        // A snapshot stored without its ledger gets it on commit
        SnapshotStore::save(&store, &first).await.unwrap();
        assert!(store.load(root).await.unwrap().is_none());
        assert_eq!(store.save_commit(&first, &[entry(5)]).await.unwrap(), (1, 1));
        assert_eq!(store.load(root).await.unwrap().unwrap().len(), 1);
        assert_eq!(store.save_commit(&first, &[entry(5)]).await.unwrap(), (1, 0));

        // Rejected snapshot, no ledger either
        let orphan_root = H256::repeat_byte(2);
        let orphan = snapshot(H256::repeat_byte(9), orphan_root, (151, 160), (261, 270));
        let err = store.save_commit(&orphan, &[entry(1)]).await.unwrap_err();
        assert!(matches!(err, BridgeError::MissingSnapshot { .. }));
        assert!(store.get_by_root(orphan_root).await.unwrap().is_none());
        assert!(store.load(orphan_root).await.unwrap().is_none());
    }
}
