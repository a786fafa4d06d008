//! Claimable balance ledger and window replay

use super::token::TokenRegistry;
use crate::error::{BridgeError, BridgeResult};
use crate::types::{BridgeTx, BridgeTxType, LedgerEntry};

use ethers::types::{Address, H256, U256};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, trace};

/// `(chain_id, account, token)`
pub type BalanceKey = (u64, Address, Address);

/// Per-symbol totals of one `update_ledgers` pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerDelta {
    /// Net amounts made claimable on the destination chains
    pub credited: BTreeMap<String, U256>,
    pub claimed: BTreeMap<String, U256>,
    /// Gross amounts locked on the home chains
    pub escrowed: BTreeMap<String, U256>,
    pub rewards: BTreeMap<String, U256>,
    pub swaps: usize,
    pub claims: usize,
    pub skipped: usize,
}

fn add(map: &mut BTreeMap<String, U256>, symbol: &str, amount: U256) {
    let slot = map.entry(symbol.to_string()).or_default();
    *slot = slot.saturating_add(amount);
}

/// Working copy of the claimable balances of one snapshot.
///
/// Built from the parent snapshot's rows, mutated by replaying a window and
/// turned back into fresh rows for the child snapshot. Parent rows are never
/// touched.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    balances: BTreeMap<BalanceKey, U256>,
    escrow: BTreeMap<(u64, Address), U256>,
    settled: HashSet<H256>,
    applied: HashSet<H256>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[LedgerEntry]) -> Self {
        let mut ledger = Self::new();
        for entry in entries.iter().filter(|e| e.valid) {
            ledger
                .balances
                .insert((entry.chain_id, entry.account, entry.token), entry.balance);
        }
        ledger
    }

    pub fn balance(&self, chain_id: u64, account: Address, token: Address) -> U256 {
        self.balances
            .get(&(chain_id, account, token))
            .copied()
            .unwrap_or_default()
    }

    /// Amount locked on `chain_id` for `token` during this window
    pub fn escrow(&self, chain_id: u64, token: Address) -> U256 {
        self.escrow
            .get(&(chain_id, token))
            .copied()
            .unwrap_or_default()
    }

    pub fn is_settled(&self, swap_tx_hash: H256) -> bool {
        self.settled.contains(&swap_tx_hash)
    }

    /// Swaps claimed before this window; claiming them again is rejected
    pub fn mark_settled(&mut self, swap_tx_hashes: impl IntoIterator<Item = H256>) {
        self.settled.extend(swap_tx_hashes);
    }

    pub fn balances(&self) -> impl Iterator<Item = (&BalanceKey, &U256)> {
        self.balances.iter()
    }

    /// Replay `txs` in the given order.
    ///
    /// Swaps credit `amount - reward` to the recipient on the opposite chain,
    /// under the counterpart token. Claims debit the recipient's balance on
    /// the chain they are made on. Records already applied are skipped.
    pub fn update_ledgers(
        &mut self,
        registry: &TokenRegistry,
        txs: &[BridgeTx],
    ) -> BridgeResult<LedgerDelta> {
        let mut delta = LedgerDelta::default();

        for tx in txs {
            if !self.applied.insert(tx.bridge_tx_id) {
                trace!("Skipping already applied bridge tx {:?}", tx.bridge_tx_id);
                delta.skipped += 1;
                continue;
            }
            match tx.tx_type {
                BridgeTxType::Swap => self.apply_swap(registry, tx, &mut delta)?,
                BridgeTxType::Claim => self.apply_claim(registry, tx, &mut delta)?,
            }
        }

        debug!(
            "Replayed {} swaps and {} claims ({} skipped)",
            delta.swaps, delta.claims, delta.skipped
        );
        Ok(delta)
    }

    fn apply_swap(
        &mut self,
        registry: &TokenRegistry,
        tx: &BridgeTx,
        delta: &mut LedgerDelta,
    ) -> BridgeResult<()> {
        let symbol = registry.symbol(tx.chain_id, tx.token)?.to_string();
        let (dest_chain, dest_token) = registry.counterpart(tx.chain_id, tx.token)?;

        let net = tx
            .amount
            .checked_sub(tx.reward)
            .ok_or_else(|| BridgeError::InvalidBridgeTx {
                tx_id: tx.bridge_tx_id,
                reason: format!("reward {} exceeds amount {}", tx.reward, tx.amount),
            })?;
        if !tx.amount_out.is_zero() && tx.amount_out != net {
            return Err(BridgeError::InvalidBridgeTx {
                tx_id: tx.bridge_tx_id,
                reason: format!("amountOut {} differs from amount - reward {}", tx.amount_out, net),
            });
        }

        let locked = self.escrow.entry((tx.chain_id, tx.token)).or_default();
        *locked = locked.saturating_add(tx.amount);

        let balance = self
            .balances
            .entry((dest_chain, tx.recipient, dest_token))
            .or_default();
        *balance = balance.checked_add(net).ok_or_else(|| BridgeError::InvalidBridgeTx {
            tx_id: tx.bridge_tx_id,
            reason: "balance overflow".to_string(),
        })?;

        add(&mut delta.credited, &symbol, net);
        add(&mut delta.escrowed, &symbol, tx.amount);
        add(&mut delta.rewards, &symbol, tx.reward);
        delta.swaps += 1;
        Ok(())
    }

    fn apply_claim(
        &mut self,
        registry: &TokenRegistry,
        tx: &BridgeTx,
        delta: &mut LedgerDelta,
    ) -> BridgeResult<()> {
        let symbol = registry.symbol(tx.chain_id, tx.token)?.to_string();

        if self.settled.contains(&tx.swap_tx_hash) {
            return Err(BridgeError::DuplicateClaim {
                swap_tx_hash: tx.swap_tx_hash,
            });
        }

        let key = (tx.chain_id, tx.recipient, tx.token);
        let balance = self.balances.get(&key).copied().unwrap_or_default();
        let remaining = balance
            .checked_sub(tx.amount)
            .ok_or_else(|| BridgeError::LedgerOverdraw {
                tx_id: tx.bridge_tx_id,
                account: tx.recipient,
                balance: balance.to_string(),
                claimed: tx.amount.to_string(),
            })?;

        self.balances.insert(key, remaining);
        self.settled.insert(tx.swap_tx_hash);

        add(&mut delta.claimed, &symbol, tx.amount);
        delta.claims += 1;
        Ok(())
    }

    /// Rows of the child snapshot committed under `merkle_root`
    pub fn into_entries(self, registry: &TokenRegistry, merkle_root: H256) -> Vec<LedgerEntry> {
        self.balances
            .into_iter()
            .map(|((chain_id, account, token), balance)| LedgerEntry {
                snapshot_id: None,
                ledger_id: None,
                merkle_root,
                chain_name: registry.chain_name(chain_id).unwrap_or_default().to_string(),
                chain_id,
                account,
                token,
                balance,
                valid: true,
            })
            .collect()
    }
}

/// Sum of balances per token symbol, unregistered tokens ignored
pub fn totals_by_symbol<'a>(
    registry: &TokenRegistry,
    balances: impl IntoIterator<Item = (&'a BalanceKey, &'a U256)>,
) -> BTreeMap<String, U256> {
    let mut totals = BTreeMap::new();
    for ((chain_id, _, token), balance) in balances {
        if let Ok(symbol) = registry.symbol(*chain_id, *token) {
            add(&mut totals, symbol, *balance);
        }
    }
    totals
}
