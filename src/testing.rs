//! In-process two-chain bridge for coordinator tests
//!
//! Each `FakeChain` plays the chain adapter, the bridge head and the
//! validator contract at once. Every submitted transaction mines one block
//! and is confirmed unless a status override says otherwise.

use crate::chain::{BlockInfo, ChainAdapter};
use crate::config::CommitConfig;
use crate::coordinator::{BridgeSide, Coordinator};
use crate::error::{BridgeError, BridgeResult};
use crate::ledger::LedgerBuilder;
use crate::proxy::{lock_bridge_digest, update_root_digest, BridgeHeadProxy, ValidatorProxy};
use crate::store::Stores;
use crate::types::{
    keccak, BridgeSnapshot, BridgeTx, BridgeTxType, ChainRange, HashEvent, OnchainSnapshot,
    Proposal, Side, TxRef, TxStatus, Validator, ValidatorStatus, ZERO_ROOT,
};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockId, RecoveryMessage, Signature, H256, U256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) use crate::ledger::token::tests::registry;

/// Deterministic validator key number `index`
pub(crate) fn wallet(index: u8) -> LocalWallet {
    format!("0x{:064x}", u64::from(index) + 1)
        .parse()
        .unwrap()
}

/// Genesis matching `registry()`: ethereum from block 100, bsc from 200
pub(crate) fn genesis() -> BridgeSnapshot {
    BridgeSnapshot::genesis(
        ChainRange::genesis("ethereum", 1, 100),
        ChainRange::genesis("bsc", 56, 200),
    )
}

#[derive(Default)]
struct ChainState {
    head: u64,
    locked: bool,
    root: H256,
    last_locked: Option<TxRef>,
    updates: Vec<OnchainSnapshot>,
    lock_proposals: HashMap<H256, Proposal>,
    root_proposals: HashMap<H256, Proposal>,
    txs: Vec<BridgeTx>,
    statuses: HashMap<H256, TxStatus>,
    update_submissions: usize,
    sent: u64,
    /// Added to every root read
    read_delay: Duration,
}

pub(crate) struct FakeChain {
    chain_id: u64,
    name: String,
    validators: Vec<Address>,
    quorum: usize,
    state: Mutex<ChainState>,
}

impl FakeChain {
    fn new(chain_id: u64, name: &str, head: u64, validators: Vec<Address>, quorum: usize) -> Self {
        Self {
            chain_id,
            name: name.to_string(),
            validators,
            quorum,
            state: Mutex::new(ChainState {
                head,
                root: ZERO_ROOT,
                ..Default::default()
            }),
        }
    }

    fn mine(state: &mut ChainState, chain_id: u64) -> TxRef {
        state.head += 1;
        state.sent += 1;
        TxRef {
            txid: keccak(&[
                &chain_id.to_be_bytes(),
                &state.sent.to_be_bytes(),
            ]),
            block_num: state.head,
        }
    }

    /// Add signatures from known validators, once per signer. Returns
    /// whether the proposal reached quorum with this call.
    fn collect(&self, proposal: &mut Proposal, signatures: Vec<Signature>) -> bool {
        for sig in signatures {
            let signer = match sig.recover(RecoveryMessage::Hash(proposal.hash)) {
                Ok(signer) => signer,
                Err(_) => continue,
            };
            if self.validators.contains(&signer) && !proposal.signed_by(signer) {
                proposal.signatures.push(sig);
            }
        }
        if !proposal.executed && proposal.signatures.len() >= self.quorum {
            proposal.executed = true;
            return true;
        }
        false
    }

    fn reverted(&self, tx: H256) -> BridgeError {
        BridgeError::TransactionReverted {
            chain_id: self.chain_id,
            tx_hash: tx,
        }
    }
}

#[async_trait]
impl ChainAdapter for FakeChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn chain_name(&self) -> String {
        self.name.clone()
    }

    async fn head_number(&self) -> BridgeResult<u64> {
        Ok(self.state.lock().unwrap().head)
    }

    async fn get_block(&self, _id: BlockId) -> BridgeResult<Option<BlockInfo>> {
        Ok(None)
    }

    async fn send_transaction(&self, _tx: TypedTransaction) -> BridgeResult<H256> {
        Err(BridgeError::Transaction("raw transactions unsupported".into()))
    }

    async fn estimate_gas(&self, _tx: TypedTransaction) -> BridgeResult<U256> {
        Ok(U256::from(100_000))
    }

    async fn transaction_status(&self, txid: H256, _submitted_block: u64) -> BridgeResult<TxStatus> {
        let state = self.state.lock().unwrap();
        Ok(state
            .statuses
            .get(&txid)
            .copied()
            .unwrap_or(TxStatus::Confirmed))
    }
}

#[async_trait]
impl BridgeHeadProxy for FakeChain {
    async fn get_merkle_root(&self) -> BridgeResult<H256> {
        let delay = self.state.lock().unwrap().read_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.state.lock().unwrap().root)
    }

    async fn get_locked_status(&self) -> BridgeResult<bool> {
        Ok(self.state.lock().unwrap().locked)
    }

    async fn get_last_locked(&self) -> BridgeResult<Option<TxRef>> {
        Ok(self.state.lock().unwrap().last_locked)
    }

    async fn get_last_snapshot(&self) -> BridgeResult<Option<OnchainSnapshot>> {
        Ok(self.state.lock().unwrap().updates.last().copied())
    }

    async fn get_snapshot(&self, root: H256) -> BridgeResult<Option<OnchainSnapshot>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .updates
            .iter()
            .rev()
            .find(|u| u.merkle_root == root)
            .copied())
    }

    async fn scan_txs(&self, from_block: u64, to_block: u64) -> BridgeResult<Vec<BridgeTx>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .txs
            .iter()
            .filter(|tx| from_block <= tx.block_number && tx.block_number <= to_block)
            .cloned()
            .collect())
    }

    async fn scan_hash_events(
        &self,
        _from_block: u64,
        _to_block: u64,
    ) -> BridgeResult<Vec<HashEvent>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl ValidatorProxy for FakeChain {
    async fn get_validators(&self) -> BridgeResult<Vec<Validator>> {
        Ok(self
            .validators
            .iter()
            .map(|address| Validator {
                address: *address,
                status: ValidatorStatus::Active,
                update_block: 0,
            })
            .collect())
    }

    async fn get_lock_bridge_proposal(&self, root: H256) -> BridgeResult<Option<Proposal>> {
        Ok(self.state.lock().unwrap().lock_proposals.get(&root).cloned())
    }

    async fn lock_bridge(&self, root: H256, signatures: Vec<Signature>) -> BridgeResult<H256> {
        let mut state = self.state.lock().unwrap();
        let tx = Self::mine(&mut state, self.chain_id);
        if state.locked || state.root != root {
            return Err(self.reverted(tx.txid));
        }

        let mut proposal = state.lock_proposals.remove(&root).unwrap_or(Proposal {
            hash: lock_bridge_digest(root),
            executed: false,
            signatures: Vec::new(),
        });
        if self.collect(&mut proposal, signatures) {
            state.locked = true;
            state.last_locked = Some(tx);
        }
        state.lock_proposals.insert(root, proposal);
        Ok(tx.txid)
    }

    async fn get_merkle_root_proposal(&self, root: H256) -> BridgeResult<Option<Proposal>> {
        Ok(self.state.lock().unwrap().root_proposals.get(&root).cloned())
    }

    async fn update_bridge_merkle_root(
        &self,
        parent_root: H256,
        new_root: H256,
        signatures: Vec<Signature>,
    ) -> BridgeResult<H256> {
        let mut state = self.state.lock().unwrap();
        let tx = Self::mine(&mut state, self.chain_id);
        if !state.locked || state.root != parent_root {
            return Err(self.reverted(tx.txid));
        }
        state.update_submissions += 1;

        let mut proposal = state.root_proposals.remove(&new_root).unwrap_or(Proposal {
            hash: update_root_digest(new_root),
            executed: false,
            signatures: Vec::new(),
        });
        if self.collect(&mut proposal, signatures) {
            state.locked = false;
            state.root = new_root;
            state.updates.push(OnchainSnapshot {
                parent_root,
                merkle_root: new_root,
                tx,
            });
        }
        state.root_proposals.insert(new_root, proposal);
        Ok(tx.txid)
    }
}

/// Two fake chains sharing one validator set
pub(crate) struct FakeBridge {
    chains: [Arc<FakeChain>; 2],
}

impl FakeBridge {
    /// `quorum` signatures out of `quorum` validators
    pub(crate) fn new(quorum: usize) -> Self {
        let validators: Vec<Address> = (0..quorum as u8).map(|i| wallet(i).address()).collect();
        Self {
            chains: [
                Arc::new(FakeChain::new(1, "ethereum", 100, validators.clone(), quorum)),
                Arc::new(FakeChain::new(56, "bsc", 200, validators, quorum)),
            ],
        }
    }

    fn chain(&self, side: Side) -> &Arc<FakeChain> {
        &self.chains[side.index()]
    }

    fn with_state<T>(&self, side: Side, f: impl FnOnce(&mut ChainState) -> T) -> T {
        let mut state = self.chain(side).state.lock().unwrap();
        f(&mut state)
    }

    pub(crate) fn coordinator(&self, index: u8, config: CommitConfig) -> Coordinator {
        self.coordinator_with(index, config, Stores::memory())
    }

    pub(crate) fn coordinator_with(
        &self,
        index: u8,
        config: CommitConfig,
        stores: Stores,
    ) -> Coordinator {
        let sides = Side::BOTH.map(|side| {
            let chain = self.chain(side).clone();
            BridgeSide {
                adapter: chain.clone(),
                head: chain.clone(),
                validator: chain,
            }
        });
        Coordinator::new(
            sides,
            stores,
            Arc::new(LedgerBuilder::new(Arc::new(registry()))),
            wallet(index),
            config,
            genesis(),
        )
    }

    pub(crate) fn set_head(&self, side: Side, head: u64) {
        self.with_state(side, |s| s.head = head);
    }

    pub(crate) fn mine(&self, side: Side, blocks: u64) {
        self.with_state(side, |s| s.head += blocks);
    }

    /// Lock the bridge as if validators had done it at `block`
    pub(crate) fn lock(&self, side: Side, block: u64) {
        self.with_state(side, |s| {
            s.head = s.head.max(block);
            s.locked = true;
            s.last_locked = Some(TxRef {
                txid: H256::from_low_u64_be(block),
                block_num: block,
            });
        });
    }

    /// Root published by someone outside this validator set
    pub(crate) fn force_root(&self, side: Side, root: H256) {
        self.with_state(side, |s| s.root = root);
    }

    /// Record a swap on `side` at `block`, paid out on the other side
    pub(crate) fn swap(&self, side: Side, block: u64, amount: u64, reward: u64) -> BridgeTx {
        let registry = registry();
        let chain = self.chain(side);
        let token = registry.pairs()[0].tokens[side.index()];
        let sender = Address::repeat_byte(0x0a);
        let recipient = Address::repeat_byte(0x0b);

        let mut tx = BridgeTx {
            bridge_tx_id: H256::zero(),
            chain_name: chain.name.clone(),
            chain_id: chain.chain_id,
            block_number: block,
            block_id: H256::from_low_u64_be(block),
            txid: keccak(&[b"swap", &block.to_be_bytes()]),
            token,
            amount: U256::from(amount),
            recipient,
            sender,
            reward: U256::from(reward),
            amount_out: U256::from(amount - reward),
            swap_count: U256::one(),
            tx_type: BridgeTxType::Swap,
            swap_tx_hash: BridgeTx::swap_hash(
                chain.chain_id,
                sender,
                recipient,
                token,
                U256::from(amount),
                U256::from(reward),
                U256::one(),
            ),
        };
        tx.bridge_tx_id = tx.compute_id();
        self.with_state(side, |s| s.txs.push(tx.clone()));
        tx
    }

    /// Record the claim of `swap` on `side` at `block`, for its net amount
    pub(crate) fn claim(&self, side: Side, block: u64, swap: &BridgeTx) -> BridgeTx {
        let registry = registry();
        let chain = self.chain(side);
        let net = swap.amount - swap.reward;

        let mut tx = BridgeTx {
            bridge_tx_id: H256::zero(),
            chain_name: chain.name.clone(),
            chain_id: chain.chain_id,
            block_number: block,
            block_id: H256::from_low_u64_be(block),
            txid: keccak(&[b"claim", &block.to_be_bytes()]),
            token: registry.pairs()[0].tokens[side.index()],
            amount: net,
            recipient: swap.recipient,
            sender: swap.recipient,
            reward: U256::zero(),
            amount_out: net,
            swap_count: U256::zero(),
            tx_type: BridgeTxType::Claim,
            swap_tx_hash: swap.swap_tx_hash,
        };
        tx.bridge_tx_id = tx.compute_id();
        self.with_state(side, |s| s.txs.push(tx.clone()));
        tx
    }

    /// Delay every root read on `side`
    pub(crate) fn set_read_delay(&self, side: Side, delay: Duration) {
        self.with_state(side, |s| s.read_delay = delay);
    }

    pub(crate) fn root(&self, side: Side) -> H256 {
        self.with_state(side, |s| s.root)
    }

    pub(crate) fn locked(&self, side: Side) -> bool {
        self.with_state(side, |s| s.locked)
    }

    pub(crate) fn update_submissions(&self, side: Side) -> usize {
        self.with_state(side, |s| s.update_submissions)
    }

    /// Report `txid` with `status` instead of confirmed
    pub(crate) fn set_status(&self, side: Side, txid: H256, status: TxStatus) {
        self.with_state(side, |s| {
            s.statuses.insert(txid, status);
        });
    }

    pub(crate) fn last_locked(&self, side: Side) -> Option<TxRef> {
        self.with_state(side, |s| s.last_locked)
    }
}
