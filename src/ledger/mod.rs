//! Ledger and Merkle snapshot engine
//!
//! Turns a parent snapshot, the token registry and a window of bridge
//! records into the rows and the Merkle commitment of the next snapshot.

pub mod balances;
pub mod builder;
pub mod merkle;
pub mod token;

pub use balances::{Ledger, LedgerDelta};
pub use builder::{Candidate, EventBuilder, LedgerBuilder, SnapshotBuilder, SnapshotInput};
pub use merkle::{verify_proof, LeafKey, MerkleTree};
pub use token::{TokenPair, TokenRegistry};

use crate::config::{BuilderKind, ValidatorConfig};
use crate::error::{BridgeError, BridgeResult};

use std::sync::Arc;

/// Snapshot builder selected by `validator.builder`
pub fn builder_for(
    config: &ValidatorConfig,
    registry: Arc<TokenRegistry>,
) -> BridgeResult<Arc<dyn SnapshotBuilder>> {
    match config.builder {
        BuilderKind::Ledger => Ok(Arc::new(LedgerBuilder::new(registry))),
        BuilderKind::Event => {
            let appid = config.appid.ok_or_else(|| {
                BridgeError::Config("event builder requires validator.appid".to_string())
            })?;
            Ok(Arc::new(EventBuilder::new(appid)))
        }
    }
}
