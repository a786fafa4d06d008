//! Persistence of snapshots, ledgers and scanned bridge records
//!
//! Two backends implement all three stores:
//! - `MemoryStore` for tests and single-run deployments
//! - `PgStore` backed by PostgreSQL

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::BridgeResult;
use crate::types::{BridgeSnapshot, BridgeTx, LedgerEntry};

use async_trait::async_trait;
use ethers::types::H256;
use std::sync::Arc;
use tracing::info;

/// Hash-linked chain of computed snapshots
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist a computed snapshot and return its id.
    ///
    /// Saving an identical snapshot again returns the existing id. The parent
    /// must already be stored unless it is the zero root.
    async fn save(&self, snapshot: &BridgeSnapshot) -> BridgeResult<u64>;

    async fn get_by_root(&self, root: H256) -> BridgeResult<Option<BridgeSnapshot>>;

    /// Most recently saved snapshot
    async fn get_last(&self) -> BridgeResult<Option<BridgeSnapshot>>;

    /// Snapshot whose range on `chain_id` covers `block`
    async fn get_by_block(&self, chain_id: u64, block: u64) -> BridgeResult<Option<BridgeSnapshot>>;
}

/// Ledger rows scoped by snapshot root
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Store the rows committed under `root`, assigning snapshot and ledger ids
    async fn save(&self, root: H256, entries: &[LedgerEntry]) -> BridgeResult<usize>;

    /// Valid rows of `root`, `None` when no ledger was ever saved for it
    async fn load(&self, root: H256) -> BridgeResult<Option<Vec<LedgerEntry>>>;

    /// Mark every row of `root` superseded, returns the number of rows touched
    async fn invalidate(&self, root: H256) -> BridgeResult<usize>;
}

/// Scanned swap and claim records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BridgeTxStore: Send + Sync {
    /// Insert records not stored yet, returns how many were new
    async fn save(&self, txs: &[BridgeTx]) -> BridgeResult<usize>;

    /// Records of `chain_id` in `[from_block, to_block]`, in chain order
    async fn get_range(&self, chain_id: u64, from_block: u64, to_block: u64)
        -> BridgeResult<Vec<BridgeTx>>;

    /// Drop every record of `chain_id` at or above `block` (fork recovery)
    async fn remove_from(&self, chain_id: u64, block: u64) -> BridgeResult<usize>;

    /// Claim records redeeming `swap_tx_hash`, in chain order
    async fn get_claims(&self, swap_tx_hash: H256) -> BridgeResult<Vec<BridgeTx>>;
}

/// Finished cycles, written as one unit
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommitStore: Send + Sync {
    /// Persist a snapshot together with the ledger rows committed under its
    /// root. Either both are stored or neither is.
    ///
    /// Returns the snapshot id and the number of new ledger rows. A snapshot
    /// stored earlier without its ledger gets the ledger now.
    async fn save_commit(
        &self,
        snapshot: &BridgeSnapshot,
        entries: &[LedgerEntry],
    ) -> BridgeResult<(u64, usize)>;
}

/// All stores behind one backend
#[derive(Clone)]
pub struct Stores {
    pub snapshots: Arc<dyn SnapshotStore>,
    pub ledgers: Arc<dyn LedgerStore>,
    pub txs: Arc<dyn BridgeTxStore>,
    pub commits: Arc<dyn CommitStore>,
    pg: Option<Arc<PgStore>>,
}

impl Stores {
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            snapshots: store.clone(),
            ledgers: store.clone(),
            txs: store.clone(),
            commits: store,
            pg: None,
        }
    }

    /// Open the configured backend
    pub async fn open(config: &StoreConfig) -> BridgeResult<Self> {
        match config.backend {
            StoreBackend::Memory => {
                info!("Using in-memory store");
                Ok(Self::memory())
            }
            StoreBackend::Postgres => {
                let store = Arc::new(PgStore::new(config).await?);
                store.run_migrations().await?;
                Ok(Self {
                    snapshots: store.clone(),
                    ledgers: store.clone(),
                    txs: store.clone(),
                    commits: store.clone(),
                    pg: Some(store),
                })
            }
        }
    }

    /// Database round trip, always healthy in memory
    pub async fn health_check(&self) -> BridgeResult<()> {
        match &self.pg {
            Some(pg) => pg.health_check().await,
            None => Ok(()),
        }
    }
}
