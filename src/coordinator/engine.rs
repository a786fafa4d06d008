//! Commit coordinator
//!
//! One `tick` walks the state machine from `Entry` until it submits a
//! transaction, finishes the cycle, has to wait on other validators or hits
//! an error it cannot retry. Nothing but the remembered parent root, the
//! cached candidate and the status caches survives between ticks.

use super::leader::LeaderSchedule;
use super::state::{classify, CommitState};
use super::status::{fetch_bridge_status, BridgeStatusCache, TxStatusCache};
use crate::chain::ChainAdapter;
use crate::config::{BuilderKind, CommitConfig, Settings};
use crate::error::{BridgeError, BridgeResult, ErrorClass};
use crate::ledger::{Candidate, LeafKey, SnapshotBuilder, SnapshotInput};
use crate::metrics;
use crate::proxy::{lock_bridge_digest, update_root_digest, BridgeHeadProxy, ValidatorProxy};
use crate::store::Stores;
use crate::types::{
    BridgeSnapshot, BridgeStatus, BridgeTx, BridgeTxType, ChainRange, Side, TxStatus, ZERO_ROOT,
};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Signature, H256};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Collaborators of one bridged chain
#[derive(Clone)]
pub struct BridgeSide {
    pub adapter: Arc<dyn ChainAdapter>,
    pub head: Arc<dyn BridgeHeadProxy>,
    pub validator: Arc<dyn ValidatorProxy>,
}

/// How a tick ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The previous tick is still running
    Busy,
    /// Not enough primary blocks since the last commit
    Idle,
    /// A transaction was submitted
    Submitted,
    /// Quorum, leader or root update not visible yet
    Waiting,
    Finished,
    Unmanageable,
    /// Data-integrity failure, nothing submitted
    Aborted,
    TimedOut,
}

impl TickOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TickOutcome::Busy => "busy",
            TickOutcome::Idle => "idle",
            TickOutcome::Submitted => "submitted",
            TickOutcome::Waiting => "waiting",
            TickOutcome::Finished => "finished",
            TickOutcome::Unmanageable => "unmanageable",
            TickOutcome::Aborted => "aborted",
            TickOutcome::TimedOut => "timed_out",
        }
    }
}

enum Flow {
    Continue,
    Yield(TickOutcome),
}

struct Session {
    state: CommitState,
    /// Last root known to be committed, loaded from the store on first use
    parent_root: Option<H256>,
    candidate: Option<Candidate>,
    tx_status: TxStatusCache,
    bridge: BridgeStatusCache,
}

impl Session {
    fn new() -> Self {
        Self {
            state: CommitState::Entry,
            parent_root: None,
            candidate: None,
            tx_status: TxStatusCache::default(),
            bridge: BridgeStatusCache::default(),
        }
    }

    fn candidate_root(&self) -> Option<H256> {
        self.candidate.as_ref().map(Candidate::root)
    }
}

fn integrity_kind(e: &BridgeError) -> &'static str {
    match e {
        BridgeError::RootMismatch { .. } => "root_mismatch",
        BridgeError::UnknownToken { .. } => "unknown_token",
        BridgeError::InvalidBridgeTx { .. } => "invalid_bridge_tx",
        BridgeError::LedgerOverdraw { .. } => "ledger_overdraw",
        BridgeError::DuplicateClaim { .. } => "duplicate_claim",
        BridgeError::MissingSnapshot { .. } => "missing_snapshot",
        BridgeError::MissingLedger { .. } => "missing_ledger",
        BridgeError::SnapshotConflict { .. } => "snapshot_conflict",
        BridgeError::CounterChainMismatch { .. } => "counter_chain_mismatch",
        _ => "other",
    }
}

/// Drives lock and update-root cycles across both chains
pub struct Coordinator {
    sides: [BridgeSide; 2],
    stores: Stores,
    builder: Arc<dyn SnapshotBuilder>,
    signer: LocalWallet,
    config: CommitConfig,
    genesis: BridgeSnapshot,
    session: Mutex<Session>,
}

impl Coordinator {
    pub fn new(
        sides: [BridgeSide; 2],
        stores: Stores,
        builder: Arc<dyn SnapshotBuilder>,
        signer: LocalWallet,
        config: CommitConfig,
        genesis: BridgeSnapshot,
    ) -> Self {
        Self {
            sides,
            stores,
            builder,
            signer,
            config,
            genesis,
            session: Mutex::new(Session::new()),
        }
    }

    /// Synthetic parent of the first snapshot
    pub fn genesis(settings: &Settings) -> BridgeSnapshot {
        let range = |side: Side| {
            let chain = settings.chains.get(side);
            ChainRange::genesis(&chain.name, chain.chain_id, chain.start_block)
        };
        BridgeSnapshot::genesis(range(Side::Primary), range(Side::Secondary))
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    fn side(&self, side: Side) -> &BridgeSide {
        &self.sides[side.index()]
    }

    /// Current state, `None` while a tick is running
    pub fn state(&self) -> Option<CommitState> {
        self.session.try_lock().ok().map(|session| session.state)
    }

    /// Run one cycle step sequence under the wall-clock budget
    pub async fn tick(&self) -> TickOutcome {
        let mut session = match self.session.try_lock() {
            Ok(session) => session,
            Err(_) => {
                debug!("Previous tick still running");
                metrics::record_tick(TickOutcome::Busy.as_str(), 0.0);
                return TickOutcome::Busy;
            }
        };

        let span = info_span!("commit_tick", tick = %Uuid::new_v4());
        let started = Instant::now();
        let result = tokio::time::timeout(self.config.cycle_timeout, self.run(&mut session))
            .instrument(span)
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    state = %session.state,
                    "Commit cycle exceeded {:?}, resuming next tick",
                    self.config.cycle_timeout
                );
                TickOutcome::TimedOut
            }
        };
        metrics::record_tick(outcome.as_str(), started.elapsed().as_secs_f64());
        outcome
    }

    async fn run(&self, session: &mut Session) -> TickOutcome {
        session.state = CommitState::Entry;
        session.bridge.invalidate();

        loop {
            let before = session.state;
            let flow = match self.step(session).await {
                Ok(flow) => flow,
                Err(e) => self.on_error(session, e).await,
            };
            if session.state != before {
                debug!(from = %before, to = %session.state, "State transition");
                metrics::record_state(&before.to_string(), &session.state.to_string());
            }
            if let Flow::Yield(outcome) = flow {
                debug!(state = %session.state, outcome = outcome.as_str(), "Tick done");
                return outcome;
            }
        }
    }

    async fn on_error(&self, session: &mut Session, e: BridgeError) -> Flow {
        match e.class() {
            ErrorClass::Transient => {
                warn!(state = %session.state, "Retrying after error: {}", e);
                session.bridge.invalidate();
                self.backoff().await;
                Flow::Continue
            }
            ErrorClass::Reverted => {
                warn!(state = %session.state, "{}", e);
                session.bridge.invalidate();
                session.state = CommitState::Entry;
                Flow::Continue
            }
            ErrorClass::Integrity => {
                error!(state = %session.state, "Aborting commit cycle: {}", e);
                metrics::record_integrity_failure(integrity_kind(&e));
                session.candidate = None;
                Flow::Yield(TickOutcome::Aborted)
            }
            ErrorClass::Unmanageable => {
                error!(state = %session.state, "{}", e);
                session.state = CommitState::Unmanageable;
                Flow::Yield(TickOutcome::Unmanageable)
            }
        }
    }

    async fn step(&self, session: &mut Session) -> BridgeResult<Flow> {
        match session.state {
            CommitState::Entry => self.on_entry(session).await,
            CommitState::NeedLock(side) => self.on_need_lock(session, side).await,
            CommitState::LockSent(side) => self.on_lock_sent(session, side).await,
            CommitState::LockUnconfirmed(side) => self.on_lock_unconfirmed(session, side).await,
            CommitState::LockConfirmed(_) | CommitState::UpdateConfirmed(Side::Primary) => {
                session.state = CommitState::Entry;
                Ok(Flow::Continue)
            }
            CommitState::NeedUpdate(Side::Primary) => self.on_need_primary_update(session).await,
            CommitState::NeedUpdate(Side::Secondary) => {
                self.on_need_secondary_update(session).await
            }
            CommitState::UpdateSent(side) => self.on_update_sent(session, side).await,
            CommitState::UpdateUnconfirmed(side) => {
                self.on_update_unconfirmed(session, side).await
            }
            CommitState::UpdateConfirmed(Side::Secondary) => self.on_finish_cycle(session).await,
            CommitState::Finished => Ok(self.on_finished(session)),
            CommitState::Unmanageable => Ok(Flow::Yield(TickOutcome::Unmanageable)),
        }
    }

    async fn on_entry(&self, session: &mut Session) -> BridgeResult<Flow> {
        let (primary, secondary) = self.fetch_both(session).await?;
        let parent = self.remembered_parent(session).await?;
        let persisted = primary.root == ZERO_ROOT || self.committed(primary.root).await?;

        let next = classify(primary, secondary, parent, persisted);
        debug!(
            a_locked = primary.locked,
            a_root = ?primary.root,
            b_locked = secondary.locked,
            b_root = ?secondary.root,
            parent = ?parent,
            next = %next,
            "Derived commit state"
        );

        match next {
            CommitState::NeedLock(Side::Primary) => {
                if !self.commit_due(parent).await? {
                    return Ok(Flow::Yield(TickOutcome::Idle));
                }
            }
            CommitState::UpdateUnconfirmed(Side::Secondary) => {
                info!(root = ?primary.root, "Both chains carry an unpersisted root, resuming");
                let update = self
                    .side(Side::Primary)
                    .head
                    .get_snapshot(primary.root)
                    .await?
                    .ok_or(BridgeError::CounterChainMismatch {
                        chain_id: self.side(Side::Primary).adapter.chain_id(),
                        root: primary.root,
                    })?;
                self.ensure_candidate(session, update.parent_root, Some(primary.root))
                    .await?;
            }
            CommitState::Unmanageable => {
                error!(
                    a_locked = primary.locked,
                    a_root = ?primary.root,
                    b_locked = secondary.locked,
                    b_root = ?secondary.root,
                    parent = ?parent,
                    "Bridge state is unmanageable, operator action required"
                );
            }
            _ => {}
        }

        session.state = next;
        Ok(Flow::Continue)
    }

    async fn on_need_lock(&self, session: &mut Session, side: Side) -> BridgeResult<Flow> {
        let s = self.side(side);
        let root = session.bridge.load_or_fetch(side, s.head.as_ref()).await?.root;

        if let Some(proposal) = s.validator.get_lock_bridge_proposal(root).await? {
            if proposal.executed {
                session.state = CommitState::LockUnconfirmed(side);
                return Ok(Flow::Continue);
            }
            if proposal.signed_by(self.address()) {
                debug!(side = %side, root = ?root, "Lock already co-signed");
                session.state = CommitState::LockSent(side);
                return Ok(Flow::Continue);
            }
        }

        let signature = self.sign(lock_bridge_digest(root))?;
        let txid = s.validator.lock_bridge(root, vec![signature]).await?;
        info!(side = %side, root = ?root, tx = ?txid, "Submitted lockBridge");
        metrics::record_submission(s.adapter.chain_id(), "lock");

        session.bridge.invalidate();
        session.state = CommitState::LockSent(side);
        Ok(Flow::Yield(TickOutcome::Submitted))
    }

    async fn on_lock_sent(&self, session: &mut Session, side: Side) -> BridgeResult<Flow> {
        let status = fetch_bridge_status(self.side(side).head.as_ref()).await?;
        session.bridge.set(side, status);

        if status.locked {
            session.state = CommitState::LockUnconfirmed(side);
            return Ok(Flow::Continue);
        }

        debug!(side = %side, "Lock not visible yet");
        self.backoff().await;
        session.bridge.invalidate();
        session.state = CommitState::NeedLock(side);
        Ok(Flow::Yield(TickOutcome::Waiting))
    }

    async fn on_lock_unconfirmed(&self, session: &mut Session, side: Side) -> BridgeResult<Flow> {
        let s = self.side(side);
        let lock = match s.head.get_last_locked().await? {
            Some(lock) => lock,
            None => {
                warn!(side = %side, "Bridge reports no lock transaction");
                session.state = CommitState::NeedLock(side);
                return Ok(Flow::Continue);
            }
        };

        match session.tx_status.status(s.adapter.as_ref(), lock).await? {
            TxStatus::Pending => {
                debug!(side = %side, tx = ?lock.txid, "Lock transaction pending");
                self.backoff().await;
            }
            TxStatus::Reverted => {
                warn!(side = %side, tx = ?lock.txid, "Lock transaction reverted");
                session.bridge.invalidate();
                session.state = CommitState::NeedLock(side);
            }
            TxStatus::Confirmed => {
                info!(side = %side, tx = ?lock.txid, block = lock.block_num, "Lock confirmed");
                session.state = CommitState::LockConfirmed(side);
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_need_primary_update(&self, session: &mut Session) -> BridgeResult<Flow> {
        let s = self.side(Side::Primary);
        let parent = session
            .bridge
            .load_or_fetch(Side::Primary, s.head.as_ref())
            .await?
            .root;
        let new_root = self.ensure_candidate(session, parent, None).await?;

        if let Some(proposal) = s.validator.get_merkle_root_proposal(new_root).await? {
            if proposal.executed {
                session.state = CommitState::UpdateUnconfirmed(Side::Primary);
                return Ok(Flow::Continue);
            }
            if proposal.signed_by(self.address()) {
                debug!(root = ?new_root, "Root update already co-signed");
                session.state = CommitState::UpdateSent(Side::Primary);
                return Ok(Flow::Continue);
            }
        }

        let signature = self.sign(update_root_digest(new_root))?;
        let txid = s
            .validator
            .update_bridge_merkle_root(parent, new_root, vec![signature])
            .await?;
        info!(parent = ?parent, root = ?new_root, tx = ?txid, "Submitted updateBridgeMerkleRoot on A");
        metrics::record_submission(s.adapter.chain_id(), "update_root");

        session.bridge.invalidate();
        session.state = CommitState::UpdateSent(Side::Primary);
        Ok(Flow::Yield(TickOutcome::Submitted))
    }

    async fn on_need_secondary_update(&self, session: &mut Session) -> BridgeResult<Flow> {
        let primary = self.side(Side::Primary);
        let s = self.side(Side::Secondary);
        let new_root = session
            .bridge
            .load_or_fetch(Side::Primary, primary.head.as_ref())
            .await?
            .root;
        let parent = session
            .bridge
            .load_or_fetch(Side::Secondary, s.head.as_ref())
            .await?
            .root;
        self.ensure_candidate(session, parent, Some(new_root)).await?;

        if let Some(proposal) = s.validator.get_merkle_root_proposal(new_root).await? {
            if proposal.executed {
                session.state = CommitState::UpdateUnconfirmed(Side::Secondary);
                return Ok(Flow::Continue);
            }
            if !proposal.signatures.is_empty() {
                debug!(root = ?new_root, "Root update already relayed to B");
                session.state = CommitState::UpdateSent(Side::Secondary);
                return Ok(Flow::Continue);
            }
        }

        let begin = session
            .candidate
            .as_ref()
            .map(|c| c.snapshot.chain(Side::Secondary).locked_block_num)
            .unwrap_or_default();
        let validators = s.validator.get_validators().await?;
        let schedule = LeaderSchedule::new(new_root, &validators, begin, self.config.wait_blocks);
        let height = s.adapter.head_number().await?;

        if !schedule.is_leader(self.address(), height) {
            debug!(
                height,
                leader = ?schedule.leader_at(height),
                window = ?schedule.window_of(self.address()),
                "Not the submission leader on B"
            );
            session.state = CommitState::UpdateSent(Side::Secondary);
            return Ok(Flow::Continue);
        }

        let signatures = self.primary_signatures(new_root).await?;
        let txid = s
            .validator
            .update_bridge_merkle_root(parent, new_root, signatures)
            .await?;
        info!(parent = ?parent, root = ?new_root, tx = ?txid, height, "Submitted updateBridgeMerkleRoot on B as leader");
        metrics::record_submission(s.adapter.chain_id(), "update_root");

        session.bridge.invalidate();
        session.state = CommitState::UpdateSent(Side::Secondary);
        Ok(Flow::Yield(TickOutcome::Submitted))
    }

    async fn on_update_sent(&self, session: &mut Session, side: Side) -> BridgeResult<Flow> {
        let new_root = match session.candidate_root() {
            Some(root) => root,
            None => {
                session.state = CommitState::Entry;
                return Ok(Flow::Continue);
            }
        };

        let status = fetch_bridge_status(self.side(side).head.as_ref()).await?;
        session.bridge.set(side, status);
        if status.root == new_root {
            session.state = CommitState::UpdateUnconfirmed(side);
            return Ok(Flow::Continue);
        }

        debug!(side = %side, root = ?new_root, "Root update not visible yet");
        self.backoff().await;
        session.bridge.invalidate();
        session.state = CommitState::NeedUpdate(side);
        Ok(Flow::Yield(TickOutcome::Waiting))
    }

    async fn on_update_unconfirmed(&self, session: &mut Session, side: Side) -> BridgeResult<Flow> {
        let new_root = match session.candidate_root() {
            Some(root) => root,
            None => {
                session.state = CommitState::Entry;
                return Ok(Flow::Continue);
            }
        };

        let s = self.side(side);
        let update = match s.head.get_last_snapshot().await? {
            Some(update) if update.merkle_root == new_root => update,
            other => {
                warn!(
                    side = %side,
                    root = ?new_root,
                    last = ?other.map(|u| u.merkle_root),
                    "Last root update does not carry the candidate root"
                );
                session.state = CommitState::NeedUpdate(side);
                return Ok(Flow::Continue);
            }
        };

        match session.tx_status.status(s.adapter.as_ref(), update.tx).await? {
            TxStatus::Pending => {
                debug!(side = %side, tx = ?update.tx.txid, "Root update pending");
                self.backoff().await;
            }
            TxStatus::Reverted => {
                warn!(side = %side, tx = ?update.tx.txid, "Root update reverted");
                session.bridge.invalidate();
                session.state = CommitState::NeedUpdate(side);
            }
            TxStatus::Confirmed => {
                info!(side = %side, tx = ?update.tx.txid, block = update.tx.block_num, "Root update confirmed");
                if let Some(candidate) = session.candidate.as_mut() {
                    candidate.snapshot.chain_mut(side).end_block_num = update.tx.block_num;
                }
                session.state = CommitState::UpdateConfirmed(side);
            }
        }
        Ok(Flow::Continue)
    }

    /// Both chains carry the new root: persist the snapshot and its ledger
    async fn on_finish_cycle(&self, session: &mut Session) -> BridgeResult<Flow> {
        let (primary, secondary) = self.fetch_both(session).await?;
        let candidate = match session.candidate.as_ref() {
            Some(candidate) => candidate,
            None => {
                session.state = CommitState::Entry;
                return Ok(Flow::Continue);
            }
        };

        candidate.check_root(primary.root)?;
        candidate.check_root(secondary.root)?;

        let (snapshot_id, rows) = self
            .stores
            .commits
            .save_commit(&candidate.snapshot, &candidate.entries)
            .await?;
        info!(
            root = ?candidate.root(),
            parent = ?candidate.snapshot.parent_merkle_root,
            snapshot_id,
            rows,
            "Persisted snapshot"
        );
        metrics::record_snapshot_persisted();

        session.state = CommitState::Finished;
        Ok(Flow::Continue)
    }

    fn on_finished(&self, session: &mut Session) -> Flow {
        let root = session
            .candidate
            .take()
            .map(|c| c.root())
            .or_else(|| session.bridge.get(Side::Primary).map(|s| s.root));
        if let Some(root) = root {
            info!(root = ?root, "Commit cycle finished");
            session.parent_root = Some(root);
        }
        Flow::Yield(TickOutcome::Finished)
    }

    async fn fetch_both(&self, session: &mut Session) -> BridgeResult<(BridgeStatus, BridgeStatus)> {
        let (primary, secondary) = futures::try_join!(
            fetch_bridge_status(self.side(Side::Primary).head.as_ref()),
            fetch_bridge_status(self.side(Side::Secondary).head.as_ref()),
        )?;
        session.bridge.set(Side::Primary, primary);
        session.bridge.set(Side::Secondary, secondary);
        Ok((primary, secondary))
    }

    async fn remembered_parent(&self, session: &mut Session) -> BridgeResult<H256> {
        if let Some(root) = session.parent_root {
            return Ok(root);
        }
        let root = match self.stores.snapshots.get_last().await? {
            Some(last) if self.committed(last.merkle_root).await? => last.merkle_root,
            Some(last) => {
                // Its cycle is finished again from the chains
                warn!(root = ?last.merkle_root, "Last snapshot was stored without its ledger");
                last.parent_merkle_root
            }
            None => ZERO_ROOT,
        };
        session.parent_root = Some(root);
        Ok(root)
    }

    /// Whether `root` is stored with everything the builder needs to extend it
    async fn committed(&self, root: H256) -> BridgeResult<bool> {
        if self.stores.snapshots.get_by_root(root).await?.is_none() {
            return Ok(false);
        }
        if self.builder.kind() != BuilderKind::Ledger {
            return Ok(true);
        }
        Ok(self.stores.ledgers.load(root).await?.is_some())
    }

    async fn parent_snapshot(&self, root: H256) -> BridgeResult<BridgeSnapshot> {
        if root == ZERO_ROOT {
            return Ok(self.genesis.clone());
        }
        self.stores
            .snapshots
            .get_by_root(root)
            .await?
            .ok_or(BridgeError::MissingSnapshot { root })
    }

    /// Whether enough primary blocks passed since the parent snapshot
    async fn commit_due(&self, parent: H256) -> BridgeResult<bool> {
        let parent = self.parent_snapshot(parent).await?;
        let due_at =
            parent.chain(Side::Primary).end_block_num + self.config.commit_interval_blocks;
        let head = self.side(Side::Primary).adapter.head_number().await?;
        if head < due_at {
            debug!(head, due_at, "Next commit not due yet");
            return Ok(false);
        }
        Ok(true)
    }

    /// Make sure the cached candidate extends `parent_root` and, once the
    /// primary chain published it, commits to `expected`. Returns its root.
    async fn ensure_candidate(
        &self,
        session: &mut Session,
        parent_root: H256,
        expected: Option<H256>,
    ) -> BridgeResult<H256> {
        let reusable = session.candidate.as_ref().map_or(false, |c| {
            c.snapshot.parent_merkle_root == parent_root
                && expected.map_or(true, |root| c.root() == root)
        });

        if !reusable {
            if let Some(stale) = session.candidate.take() {
                warn!(root = ?stale.root(), "Discarding cached candidate");
            }
            let candidate = self.build_candidate(parent_root).await?;
            if let Some(expected) = expected {
                candidate.check_root(expected)?;
            }
            session.candidate = Some(candidate);
        }

        if let Some(expected) = expected {
            self.fill_primary_end(session, expected).await?;
        }
        session
            .candidate_root()
            .ok_or_else(|| BridgeError::Internal("candidate vanished".to_string()))
    }

    /// After a restart the end of the primary range is only on chain
    async fn fill_primary_end(&self, session: &mut Session, root: H256) -> BridgeResult<()> {
        let candidate = match session.candidate.as_mut() {
            Some(candidate) => candidate,
            None => return Ok(()),
        };
        let range = candidate.snapshot.chain(Side::Primary);
        if range.end_block_num > range.locked_block_num {
            return Ok(());
        }

        let primary = self.side(Side::Primary);
        let update = primary
            .head
            .get_snapshot(root)
            .await?
            .ok_or(BridgeError::CounterChainMismatch {
                chain_id: primary.adapter.chain_id(),
                root,
            })?;
        candidate.snapshot.chain_mut(Side::Primary).end_block_num = update.tx.block_num;
        Ok(())
    }

    async fn build_candidate(&self, parent_root: H256) -> BridgeResult<Candidate> {
        let parent = self.parent_snapshot(parent_root).await?;
        let parent_entries = if parent_root == ZERO_ROOT || self.builder.kind() != BuilderKind::Ledger
        {
            Vec::new()
        } else {
            self.stores
                .ledgers
                .load(parent_root)
                .await?
                .ok_or(BridgeError::MissingLedger { root: parent_root })?
        };

        let (lock_a, lock_b) = futures::try_join!(
            self.side(Side::Primary).head.get_last_locked(),
            self.side(Side::Secondary).head.get_last_locked(),
        )?;
        let locked = match (lock_a, lock_b) {
            (Some(a), Some(b)) => [a.block_num, b.block_num],
            _ => {
                return Err(BridgeError::Unmanageable(
                    "bridge locked without a lock transaction".to_string(),
                ))
            }
        };

        let mut txs = Vec::new();
        let mut events = Vec::new();
        let mut settled = Vec::new();
        for side in Side::BOTH {
            let range = parent.chain(side);
            let from = range.end_block_num + 1;
            let to = locked[side.index()];
            if to < from {
                return Err(BridgeError::Unmanageable(format!(
                    "chain {} locked at block {} before its window starts at {}",
                    side, to, from
                )));
            }

            let head = &self.side(side).head;
            let window = head.scan_txs(from, to).await?;
            self.stores.txs.remove_from(range.chain_id, from).await?;
            self.stores.txs.save(&window).await?;
            debug!(side = %side, from, to, records = window.len(), "Scanned bridge window");

            if self.builder.kind() == BuilderKind::Ledger {
                settled.extend(self.claimed_before(&window, range.chain_id, from).await?);
            }
            txs.extend(window);

            if self.builder.kind() == BuilderKind::Event {
                events.extend(head.scan_hash_events(from, to).await?);
            }
        }

        self.builder.build(SnapshotInput {
            parent,
            parent_entries,
            locked,
            txs,
            events,
            settled,
        })
    }

    /// Swaps claimed in `window` that already had a claim on `chain_id`
    /// below `from`
    async fn claimed_before(
        &self,
        window: &[BridgeTx],
        chain_id: u64,
        from: u64,
    ) -> BridgeResult<Vec<H256>> {
        let mut settled = Vec::new();
        for claim in window.iter().filter(|tx| tx.tx_type == BridgeTxType::Claim) {
            let earlier = self.stores.txs.get_claims(claim.swap_tx_hash).await?;
            if let Some(first) = earlier
                .iter()
                .find(|tx| tx.chain_id == chain_id && tx.block_number < from)
            {
                warn!(
                    swap = ?claim.swap_tx_hash,
                    first_claim = ?first.txid,
                    block = first.block_number,
                    "Swap was claimed in an earlier window"
                );
                settled.push(claim.swap_tx_hash);
            }
        }
        Ok(settled)
    }

    /// Signatures collected on A for `new_root`, relayed to B
    async fn primary_signatures(&self, new_root: H256) -> BridgeResult<Vec<Signature>> {
        let primary = self.side(Side::Primary);
        match primary.validator.get_merkle_root_proposal(new_root).await? {
            Some(proposal) if !proposal.signatures.is_empty() => Ok(proposal.signatures),
            _ => Err(BridgeError::CounterChainMismatch {
                chain_id: primary.adapter.chain_id(),
                root: new_root,
            }),
        }
    }

    /// Inclusion proof of `key` in the persisted snapshot `root`
    pub async fn merkle_proof(&self, root: H256, key: &LeafKey) -> BridgeResult<Option<Vec<H256>>> {
        let snapshot = self
            .stores
            .snapshots
            .get_by_root(root)
            .await?
            .ok_or(BridgeError::MissingSnapshot { root })?;

        let tree = match self.builder.kind() {
            BuilderKind::Ledger => {
                let entries = self
                    .stores
                    .ledgers
                    .load(root)
                    .await?
                    .ok_or(BridgeError::MissingLedger { root })?;
                self.builder.rebuild(&snapshot, &entries, &[])
            }
            BuilderKind::Event => {
                let mut events = Vec::new();
                for side in Side::BOTH {
                    let range = snapshot.chain(side);
                    events.extend(
                        self.side(side)
                            .head
                            .scan_hash_events(range.begin_block_num, range.locked_block_num)
                            .await?,
                    );
                }
                self.builder.rebuild(&snapshot, &[], &events)
            }
        };

        if tree.root() != root {
            return Err(BridgeError::RootMismatch {
                expected: root,
                actual: tree.root(),
            });
        }
        Ok(tree.proof(key))
    }

    fn sign(&self, digest: H256) -> BridgeResult<Signature> {
        self.signer
            .sign_hash(digest)
            .map_err(|e| BridgeError::Wallet(e.to_string()))
    }

    async fn backoff(&self) {
        tokio::time::sleep(self.config.backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainAdapter;
    use crate::ledger::merkle::{balance_leaf, verify_proof};
    use crate::ledger::LedgerBuilder;
    use crate::proxy::{MockBridgeHeadProxy, MockValidatorProxy};
    use crate::testing::{self, FakeBridge};
    use crate::types::{Proposal, TxRef};
    use std::time::Duration;

    fn config() -> CommitConfig {
        CommitConfig {
            cycle_timeout: Duration::from_secs(5),
            backoff: Duration::from_millis(1),
            wait_blocks: 10,
            commit_interval_blocks: 100,
        }
    }

    fn mock_side(
        adapter: MockChainAdapter,
        head: MockBridgeHeadProxy,
        validator: MockValidatorProxy,
    ) -> BridgeSide {
        BridgeSide {
            adapter: Arc::new(adapter),
            head: Arc::new(head),
            validator: Arc::new(validator),
        }
    }

    fn idle_side() -> BridgeSide {
        mock_side(
            MockChainAdapter::new(),
            MockBridgeHeadProxy::new(),
            MockValidatorProxy::new(),
        )
    }

    fn coordinator(primary: BridgeSide, secondary: BridgeSide) -> Coordinator {
        let registry = Arc::new(testing::registry());
        Coordinator::new(
            [primary, secondary],
            Stores::memory(),
            Arc::new(LedgerBuilder::new(registry)),
            testing::wallet(0),
            config(),
            testing::genesis(),
        )
    }

    #[tokio::test]
    async fn test_own_signature_is_not_resubmitted() {
        let wallet = testing::wallet(0);
        let root = H256::repeat_byte(0x11);
        let digest = lock_bridge_digest(root);
        let signature = wallet.sign_hash(digest).unwrap();

        let mut validator = MockValidatorProxy::new();
        validator
            .expect_get_lock_bridge_proposal()
            .returning(move |_| {
                Ok(Some(Proposal {
                    hash: digest,
                    executed: false,
                    signatures: vec![signature],
                }))
            });
        validator.expect_lock_bridge().times(0);

        let primary = mock_side(MockChainAdapter::new(), MockBridgeHeadProxy::new(), validator);
        let coordinator = coordinator(primary, idle_side());

        let mut session = Session::new();
        session.bridge.set(
            Side::Primary,
            BridgeStatus {
                locked: false,
                root,
            },
        );
        session.state = CommitState::NeedLock(Side::Primary);

        let flow = coordinator.step(&mut session).await.unwrap();
        assert!(matches!(flow, Flow::Continue));
        assert_eq!(session.state, CommitState::LockSent(Side::Primary));
    }

    #[tokio::test]
    async fn test_missing_signature_is_submitted() {
        let root = ZERO_ROOT;
        let mut validator = MockValidatorProxy::new();
        validator
            .expect_get_lock_bridge_proposal()
            .returning(|_| Ok(None));
        validator
            .expect_lock_bridge()
            .times(1)
            .returning(|_, sigs| {
                assert_eq!(sigs.len(), 1);
                Ok(H256::repeat_byte(0xee))
            });
        let mut adapter = MockChainAdapter::new();
        adapter.expect_chain_id().return_const(1u64);

        let primary = mock_side(adapter, MockBridgeHeadProxy::new(), validator);
        let coordinator = coordinator(primary, idle_side());

        let mut session = Session::new();
        session.bridge.set(Side::Primary, BridgeStatus { locked: false, root });
        session.state = CommitState::NeedLock(Side::Primary);

        let flow = coordinator.step(&mut session).await.unwrap();
        assert!(matches!(flow, Flow::Yield(TickOutcome::Submitted)));
        assert_eq!(session.state, CommitState::LockSent(Side::Primary));
    }

    #[tokio::test]
    async fn test_reverted_lock_returns_to_need_lock() {
        let lock = TxRef {
            txid: H256::repeat_byte(0xab),
            block_num: 120,
        };
        let mut head = MockBridgeHeadProxy::new();
        head.expect_get_last_locked()
            .returning(move || Ok(Some(lock)));
        let mut adapter = MockChainAdapter::new();
        adapter
            .expect_transaction_status()
            .returning(|_, _| Ok(TxStatus::Reverted));

        let coordinator = coordinator(
            mock_side(adapter, head, MockValidatorProxy::new()),
            idle_side(),
        );
        let mut session = Session::new();
        session.state = CommitState::LockUnconfirmed(Side::Primary);

        coordinator.step(&mut session).await.unwrap();
        assert_eq!(session.state, CommitState::NeedLock(Side::Primary));
        assert!(session.tx_status.is_empty());
    }

    #[tokio::test]
    async fn test_pending_lock_is_polled_until_confirmed() {
        let bridge = FakeBridge::new(1);
        bridge.set_head(Side::Primary, 300);
        let coordinator = bridge.coordinator(0, config());
        assert_eq!(coordinator.tick().await, TickOutcome::Submitted);

        let lock = bridge.last_locked(Side::Primary).unwrap();
        bridge.set_status(Side::Primary, lock.txid, TxStatus::Pending);

        let mut session = Session::new();
        session.state = CommitState::LockUnconfirmed(Side::Primary);
        coordinator.step(&mut session).await.unwrap();
        assert_eq!(session.state, CommitState::LockUnconfirmed(Side::Primary));
        assert!(session.tx_status.is_empty());

        bridge.set_status(Side::Primary, lock.txid, TxStatus::Confirmed);
        coordinator.step(&mut session).await.unwrap();
        assert_eq!(session.state, CommitState::LockConfirmed(Side::Primary));
        assert_eq!(session.tx_status.len(), 1);
    }

    #[tokio::test]
    async fn test_entry_is_idempotent() {
        let bridge = FakeBridge::new(1);
        bridge.lock(Side::Primary, 150);
        let coordinator = bridge.coordinator(0, config());

        let mut first = Session::new();
        coordinator.on_entry(&mut first).await.unwrap();
        let mut second = Session::new();
        coordinator.on_entry(&mut second).await.unwrap();
        coordinator.on_entry(&mut second).await.unwrap();

        assert_eq!(first.state, CommitState::NeedLock(Side::Secondary));
        assert_eq!(first.state, second.state);
    }

    #[tokio::test]
    async fn test_commit_interval_gates_new_cycle() {
        let bridge = FakeBridge::new(1);
        bridge.set_head(Side::Primary, 150);
        let coordinator = bridge.coordinator(0, config());

        assert_eq!(coordinator.tick().await, TickOutcome::Idle);
        assert_eq!(coordinator.state(), Some(CommitState::Entry));
    }

    #[tokio::test]
    async fn test_busy_tick_is_rejected() {
        let coordinator = coordinator(idle_side(), idle_side());
        let _guard = coordinator.session.lock().await;
        assert_eq!(coordinator.tick().await, TickOutcome::Busy);
        assert!(coordinator.state().is_none());
    }

    #[tokio::test]
    async fn test_full_cycle_single_validator() {
        let bridge = FakeBridge::new(1);
        bridge.set_head(Side::Primary, 300);
        bridge.set_head(Side::Secondary, 400);
        let swap = bridge.swap(Side::Primary, 250, 100, 2);
        let coordinator = bridge.coordinator(0, config());

        let mut outcomes = Vec::new();
        for _ in 0..10 {
            let outcome = coordinator.tick().await;
            outcomes.push(outcome);
            if outcome == TickOutcome::Finished {
                break;
            }
        }
        assert_eq!(outcomes.last(), Some(&TickOutcome::Finished), "{:?}", outcomes);

        let root = bridge.root(Side::Primary);
        assert_ne!(root, ZERO_ROOT);
        assert_eq!(root, bridge.root(Side::Secondary));
        assert!(!bridge.locked(Side::Primary) && !bridge.locked(Side::Secondary));

        let stored = coordinator
            .stores
            .snapshots
            .get_by_root(root)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.parent_merkle_root, ZERO_ROOT);
        assert_eq!(stored.chains[0].begin_block_num, 101);
        assert!(stored.chains[0].end_block_num > stored.chains[0].locked_block_num);
        assert!(stored.chains[1].end_block_num > stored.chains[1].locked_block_num);

        let rows = coordinator.stores.ledgers.load(root).await.unwrap().unwrap();
        let credited = rows
            .iter()
            .find(|e| e.account == swap.recipient)
            .unwrap();
        assert_eq!(credited.chain_id, 56);
        assert_eq!(credited.balance, ethers::types::U256::from(98));

        let key = LedgerBuilder::new(Arc::new(testing::registry()))
            .credit_leaf(&swap)
            .unwrap();
        let proof = coordinator.merkle_proof(root, &key).await.unwrap().unwrap();
        let leaf = balance_leaf(
            credited.chain_id,
            credited.account,
            credited.token,
            credited.balance,
        );
        assert!(verify_proof(root, leaf, &proof));
        let inflated = balance_leaf(
            credited.chain_id,
            credited.account,
            credited.token,
            credited.balance + ethers::types::U256::one(),
        );
        assert!(!verify_proof(root, inflated, &proof));

        // The next cycle waits for the commit interval
        assert_eq!(coordinator.tick().await, TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_quorum_of_two_needs_both_validators() {
        let bridge = FakeBridge::new(2);
        bridge.set_head(Side::Primary, 300);
        bridge.set_head(Side::Secondary, 400);
        bridge.swap(Side::Secondary, 350, 40, 0);
        let first = bridge.coordinator(0, config());
        let second = bridge.coordinator(1, config());

        let mut finished = [false, false];
        for _ in 0..20 {
            if first.tick().await == TickOutcome::Finished {
                finished[0] = true;
            }
            if second.tick().await == TickOutcome::Finished {
                finished[1] = true;
            }
            // Let leader windows on B roll over
            bridge.mine(Side::Secondary, 5);
            if finished == [true, true] {
                break;
            }
        }
        assert_eq!(finished, [true, true]);
        assert_eq!(bridge.root(Side::Primary), bridge.root(Side::Secondary));
        // One relay of the quorum signatures on B, never a duplicate
        assert_eq!(bridge.update_submissions(Side::Secondary), 1);
    }

    #[tokio::test]
    async fn test_restart_rebuilds_candidate() {
        let bridge = FakeBridge::new(1);
        bridge.set_head(Side::Primary, 300);
        bridge.set_head(Side::Secondary, 400);
        bridge.swap(Side::Primary, 250, 100, 1);

        // Drive until the root is published on A only
        let before_crash = bridge.coordinator(0, config());
        for _ in 0..3 {
            before_crash.tick().await;
        }
        assert_ne!(bridge.root(Side::Primary), ZERO_ROOT);
        assert_eq!(bridge.root(Side::Secondary), ZERO_ROOT);
        let stores = before_crash.stores.clone();
        drop(before_crash);

        let restarted = bridge.coordinator_with(0, config(), stores);
        let mut outcome = TickOutcome::Idle;
        for _ in 0..5 {
            outcome = restarted.tick().await;
            if outcome == TickOutcome::Finished {
                break;
            }
        }
        assert_eq!(outcome, TickOutcome::Finished);
        assert_eq!(bridge.root(Side::Primary), bridge.root(Side::Secondary));
    }

    #[tokio::test]
    async fn test_snapshot_without_ledger_is_finished_again() {
        let bridge = FakeBridge::new(1);
        bridge.set_head(Side::Primary, 300);
        bridge.set_head(Side::Secondary, 400);
        bridge.swap(Side::Primary, 250, 100, 2);

        let first = bridge.coordinator(0, config());
        let mut outcome = TickOutcome::Idle;
        for _ in 0..10 {
            outcome = first.tick().await;
            if outcome == TickOutcome::Finished {
                break;
            }
        }
        assert_eq!(outcome, TickOutcome::Finished);
        let root = bridge.root(Side::Primary);

        // Crash after the snapshot write, before the ledger write
        let stores = Stores::memory();
        let snapshot = first
            .stores
            .snapshots
            .get_by_root(root)
            .await
            .unwrap()
            .unwrap();
        stores.snapshots.save(&snapshot).await.unwrap();
        drop(first);

        let restarted = bridge.coordinator_with(0, config(), stores.clone());
        assert_eq!(restarted.tick().await, TickOutcome::Finished);
        assert!(stores.ledgers.load(root).await.unwrap().is_some());

        bridge.mine(Side::Primary, 300);
        let mut outcomes = Vec::new();
        for _ in 0..10 {
            let outcome = restarted.tick().await;
            outcomes.push(outcome);
            if outcome == TickOutcome::Finished {
                break;
            }
        }
        assert_eq!(outcomes.last(), Some(&TickOutcome::Finished), "{:?}", outcomes);
        assert!(!outcomes.contains(&TickOutcome::Aborted));

        let next = bridge.root(Side::Primary);
        assert_ne!(next, root);
        let stored = stores.snapshots.get_by_root(next).await.unwrap().unwrap();
        assert_eq!(stored.parent_merkle_root, root);
        assert!(stores.ledgers.load(next).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_slow_chain_times_out_and_resumes_from_entry() {
        let bridge = FakeBridge::new(1);
        bridge.set_head(Side::Primary, 300);
        bridge.set_read_delay(Side::Primary, Duration::from_millis(200));
        let coordinator = bridge.coordinator(
            0,
            CommitConfig {
                cycle_timeout: Duration::from_millis(50),
                ..config()
            },
        );

        assert_eq!(coordinator.tick().await, TickOutcome::TimedOut);
        assert_eq!(coordinator.state(), Some(CommitState::Entry));
        assert!(bridge.last_locked(Side::Primary).is_none());
        assert!(!bridge.locked(Side::Primary));

        bridge.set_read_delay(Side::Primary, Duration::ZERO);
        assert_eq!(coordinator.tick().await, TickOutcome::Submitted);
        assert_eq!(
            coordinator.state(),
            Some(CommitState::LockSent(Side::Primary))
        );
        assert!(bridge.locked(Side::Primary));
    }

    #[tokio::test]
    async fn test_claim_settled_in_earlier_window_aborts() {
        let bridge = FakeBridge::new(1);
        bridge.set_head(Side::Primary, 300);
        bridge.set_head(Side::Secondary, 400);
        let swap = bridge.swap(Side::Primary, 250, 100, 2);
        let claim = bridge.claim(Side::Secondary, 350, &swap);

        // The same swap was already claimed below this window
        let mut earlier = claim.clone();
        earlier.block_number = 150;
        earlier.block_id = H256::from_low_u64_be(150);
        earlier.txid = H256::repeat_byte(0x15);
        earlier.bridge_tx_id = earlier.compute_id();
        let stores = Stores::memory();
        stores.txs.save(&[earlier]).await.unwrap();

        let coordinator = bridge.coordinator_with(0, config(), stores);
        let mut outcomes = Vec::new();
        for _ in 0..5 {
            let outcome = coordinator.tick().await;
            outcomes.push(outcome);
            if outcome == TickOutcome::Aborted {
                break;
            }
        }
        assert_eq!(outcomes.last(), Some(&TickOutcome::Aborted), "{:?}", outcomes);
        assert_eq!(bridge.update_submissions(Side::Primary), 0);
        assert_eq!(bridge.root(Side::Primary), ZERO_ROOT);
    }

    #[tokio::test]
    async fn test_root_mismatch_aborts_without_submitting() {
        let bridge = FakeBridge::new(1);
        bridge.set_head(Side::Primary, 300);
        bridge.set_head(Side::Secondary, 400);

        let coordinator = bridge.coordinator(0, config());
        for _ in 0..3 {
            coordinator.tick().await;
        }
        // Someone else published a different root on A
        bridge.force_root(Side::Primary, H256::repeat_byte(0x66));

        let restarted = bridge.coordinator(0, config());
        assert_eq!(restarted.tick().await, TickOutcome::Aborted);
        assert_eq!(bridge.update_submissions(Side::Secondary), 0);
    }
}
