//! Cross-chain bridge validator
//!
//! Folds swap and claim activity of two EVM chains into hash-linked ledger
//! snapshots, commits their Merkle roots to both chains and coordinates the
//! lock / update-root cycle with the other validators.

pub mod chain;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod proxy;
pub mod store;
pub mod tx;
pub mod types;

#[cfg(test)]
mod testing;

pub use error::{BridgeError, BridgeResult};
