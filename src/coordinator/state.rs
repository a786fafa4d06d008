//! Commit states and the on-chain transition rule

use crate::types::{BridgeStatus, Side, ZERO_ROOT};

use ethers::types::H256;
use std::fmt;

/// Position of the commit cycle.
///
/// `Entry` re-derives the position from on-chain facts; every other state is
/// a step of locking or updating one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitState {
    Entry,
    NeedLock(Side),
    LockSent(Side),
    LockUnconfirmed(Side),
    LockConfirmed(Side),
    NeedUpdate(Side),
    UpdateSent(Side),
    UpdateUnconfirmed(Side),
    UpdateConfirmed(Side),
    Finished,
    Unmanageable,
}

impl CommitState {
    pub fn side(self) -> Option<Side> {
        match self {
            CommitState::NeedLock(side)
            | CommitState::LockSent(side)
            | CommitState::LockUnconfirmed(side)
            | CommitState::LockConfirmed(side)
            | CommitState::NeedUpdate(side)
            | CommitState::UpdateSent(side)
            | CommitState::UpdateUnconfirmed(side)
            | CommitState::UpdateConfirmed(side) => Some(side),
            CommitState::Entry | CommitState::Finished | CommitState::Unmanageable => None,
        }
    }
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            CommitState::Entry => return write!(f, "Entry"),
            CommitState::Finished => return write!(f, "Finished"),
            CommitState::Unmanageable => return write!(f, "Unmanageable"),
            CommitState::NeedLock(_) => "NeedLock",
            CommitState::LockSent(_) => "LockSent",
            CommitState::LockUnconfirmed(_) => "LockUnconfirmed",
            CommitState::LockConfirmed(_) => "LockConfirmed",
            CommitState::NeedUpdate(_) => "NeedUpdate",
            CommitState::UpdateSent(_) => "UpdateSent",
            CommitState::UpdateUnconfirmed(_) => "UpdateUnconfirmed",
            CommitState::UpdateConfirmed(_) => "UpdateConfirmed",
        };
        match self.side() {
            Some(side) => write!(f, "{}-{}", side, step),
            None => write!(f, "{}", step),
        }
    }
}

/// Next state implied by both chains' lock flags and roots.
///
/// `parent` is the last root this validator knows to be committed and
/// `root_persisted` tells whether the roots currently on chain are already
/// in the snapshot store.
pub fn classify(
    primary: BridgeStatus,
    secondary: BridgeStatus,
    parent: H256,
    root_persisted: bool,
) -> CommitState {
    let roots_equal = primary.root == secondary.root;

    match (primary.locked, secondary.locked) {
        (false, false) if roots_equal && primary.root == parent => {
            CommitState::NeedLock(Side::Primary)
        }
        (false, false) if roots_equal && primary.root != ZERO_ROOT => {
            if root_persisted {
                CommitState::Finished
            } else {
                // Both chains updated but the snapshot was never stored
                CommitState::UpdateUnconfirmed(Side::Secondary)
            }
        }
        (true, false) if roots_equal => CommitState::NeedLock(Side::Secondary),
        (true, true) if roots_equal => CommitState::NeedUpdate(Side::Primary),
        (false, true) if !roots_equal && secondary.root == parent => {
            CommitState::NeedUpdate(Side::Secondary)
        }
        _ => CommitState::Unmanageable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(locked: bool, root: u8) -> BridgeStatus {
        BridgeStatus {
            locked,
            root: if root == 0 {
                ZERO_ROOT
            } else {
                H256::repeat_byte(root)
            },
        }
    }

    #[test]
    fn test_transition_table() {
        let parent = H256::repeat_byte(1);
        assert_eq!(
            classify(status(false, 1), status(false, 1), parent, true),
            CommitState::NeedLock(Side::Primary)
        );
        assert_eq!(
            classify(status(true, 1), status(false, 1), parent, true),
            CommitState::NeedLock(Side::Secondary)
        );
        assert_eq!(
            classify(status(true, 1), status(true, 1), parent, true),
            CommitState::NeedUpdate(Side::Primary)
        );
        assert_eq!(
            classify(status(false, 2), status(true, 1), parent, false),
            CommitState::NeedUpdate(Side::Secondary)
        );
        assert_eq!(
            classify(status(false, 2), status(false, 2), parent, true),
            CommitState::Finished
        );
        assert_eq!(
            classify(status(false, 2), status(false, 2), parent, false),
            CommitState::UpdateUnconfirmed(Side::Secondary)
        );
    }

    #[test]
    fn test_inconsistent_facts_are_unmanageable() {
        let parent = H256::repeat_byte(1);
        // B locked on a root that is not the parent
        assert_eq!(
            classify(status(false, 2), status(true, 3), parent, true),
            CommitState::Unmanageable
        );
        // Unlocked chains disagree
        assert_eq!(
            classify(status(false, 1), status(false, 2), parent, true),
            CommitState::Unmanageable
        );
        // Chains reset below what is stored
        assert_eq!(
            classify(status(false, 0), status(false, 0), parent, true),
            CommitState::Unmanageable
        );
        // B locked while A is still locked on another root
        assert_eq!(
            classify(status(true, 2), status(true, 1), parent, true),
            CommitState::Unmanageable
        );
    }

    #[test]
    fn test_classification_is_stable() {
        let a = status(true, 1);
        let b = status(false, 1);
        let first = classify(a, b, H256::repeat_byte(1), true);
        for _ in 0..3 {
            assert_eq!(classify(a, b, H256::repeat_byte(1), true), first);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(CommitState::NeedLock(Side::Primary).to_string(), "A-NeedLock");
        assert_eq!(
            CommitState::UpdateUnconfirmed(Side::Secondary).to_string(),
            "B-UpdateUnconfirmed"
        );
        assert_eq!(CommitState::Finished.to_string(), "Finished");
    }
}
