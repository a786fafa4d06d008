//! Commit coordinator
//!
//! Drives the bridge through lock and update-root cycles:
//! - `state`: commit states and the on-chain transition rule
//! - `leader`: submission windows on the secondary chain
//! - `status`: per-tick caches of bridge and transaction status
//! - `engine`: the tick-driven state machine

pub mod engine;
pub mod leader;
pub mod state;
pub mod status;

pub use engine::{BridgeSide, Coordinator, TickOutcome};
pub use leader::LeaderSchedule;
pub use state::{classify, CommitState};
pub use status::{fetch_bridge_status, BridgeStatusCache, TxStatusCache};
