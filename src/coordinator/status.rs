//! Per-coordinator caches of transaction and bridge status

use crate::chain::ChainAdapter;
use crate::error::BridgeResult;
use crate::proxy::BridgeHeadProxy;
use crate::types::{BridgeStatus, Side, TxRef, TxStatus};

use ethers::types::H256;
use std::collections::HashSet;
use tracing::trace;

/// Confirmation results. Only `Confirmed` is final, everything else is
/// asked again.
#[derive(Debug, Default)]
pub struct TxStatusCache {
    confirmed: HashSet<H256>,
}

impl TxStatusCache {
    pub async fn status(&mut self, adapter: &dyn ChainAdapter, tx: TxRef) -> BridgeResult<TxStatus> {
        if self.confirmed.contains(&tx.txid) {
            trace!("Transaction {:?} confirmed (cached)", tx.txid);
            return Ok(TxStatus::Confirmed);
        }

        let status = adapter.transaction_status(tx.txid, tx.block_num).await?;
        if status == TxStatus::Confirmed {
            self.confirmed.insert(tx.txid);
        }
        Ok(status)
    }

    pub fn len(&self) -> usize {
        self.confirmed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty()
    }
}

/// Read both the lock flag and the committed root of one bridge head
pub async fn fetch_bridge_status(head: &dyn BridgeHeadProxy) -> BridgeResult<BridgeStatus> {
    let (locked, root) = futures::try_join!(head.get_locked_status(), head.get_merkle_root())?;
    Ok(BridgeStatus { locked, root })
}

/// Bridge status per side, `None` until loaded. Invalidated whenever the
/// coordinator may have changed it.
#[derive(Debug, Default)]
pub struct BridgeStatusCache {
    status: [Option<BridgeStatus>; 2],
}

impl BridgeStatusCache {
    pub fn set(&mut self, side: Side, status: BridgeStatus) {
        self.status[side.index()] = Some(status);
    }

    pub fn get(&self, side: Side) -> Option<BridgeStatus> {
        self.status[side.index()]
    }

    pub async fn load_or_fetch(
        &mut self,
        side: Side,
        head: &dyn BridgeHeadProxy,
    ) -> BridgeResult<BridgeStatus> {
        if let Some(status) = self.get(side) {
            return Ok(status);
        }
        let status = fetch_bridge_status(head).await?;
        self.set(side, status);
        Ok(status)
    }

    pub fn invalidate(&mut self) {
        self.status = [None, None];
    }
}
