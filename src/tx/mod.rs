//! Transaction submission module with nonce management and gas optimization

mod gas;
mod nonce;
mod sender;

pub use gas::{build_tx, GasEstimator, TxParams};
pub use nonce::NonceManager;
pub use sender::TransactionSender;
