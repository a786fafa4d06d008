//! Round-robin submission windows on the secondary chain
//!
//! Active validators are ordered by `keccak256(root ‖ address)` read as a
//! big-endian integer. The validator at position `i` owns the heights
//! `[begin + i·W, begin + (i+1)·W)`, and the schedule wraps around once
//! every validator had its turn.

use crate::types::{keccak, Validator, ValidatorStatus};

use ethers::types::{Address, H256, U256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderSchedule {
    order: Vec<Address>,
    begin: u64,
    wait_blocks: u64,
}

impl LeaderSchedule {
    pub fn new(root: H256, validators: &[Validator], begin: u64, wait_blocks: u64) -> Self {
        let mut ranked: Vec<(U256, Address)> = validators
            .iter()
            .filter(|v| v.status == ValidatorStatus::Active)
            .map(|v| {
                let rank = keccak(&[root.as_bytes(), v.address.as_bytes()]);
                (U256::from_big_endian(rank.as_bytes()), v.address)
            })
            .collect();
        ranked.sort();
        ranked.dedup_by_key(|(_, address)| *address);

        Self {
            order: ranked.into_iter().map(|(_, address)| address).collect(),
            begin,
            wait_blocks: wait_blocks.max(1),
        }
    }

    pub fn order(&self) -> &[Address] {
        &self.order
    }

    /// Validator allowed to submit at `height`. Heights before `begin`
    /// belong to the first window.
    pub fn leader_at(&self, height: u64) -> Option<Address> {
        if self.order.is_empty() {
            return None;
        }
        let slot = height.saturating_sub(self.begin) / self.wait_blocks;
        let index = (slot % self.order.len() as u64) as usize;
        Some(self.order[index])
    }

    /// First window owned by `address`, half-open
    pub fn window_of(&self, address: Address) -> Option<(u64, u64)> {
        let position = self.order.iter().position(|a| *a == address)? as u64;
        let start = self.begin + position * self.wait_blocks;
        Some((start, start + self.wait_blocks))
    }

    pub fn is_leader(&self, address: Address, height: u64) -> bool {
        self.leader_at(height) == Some(address)
    }
}
