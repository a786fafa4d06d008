//! Gas estimation and fee selection for different chain types

use crate::chain::{ChainProvider, GasPrice};
use crate::error::BridgeResult;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, NameOrAddress, TransactionRequest, U256};
use tracing::debug;

/// Gas estimator for transactions
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    pub fn new() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }

    /// Estimated gas limit for `tx`, with buffer
    pub async fn estimate_gas_limit(
        &self,
        provider: &ChainProvider,
        tx: &TypedTransaction,
    ) -> BridgeResult<U256> {
        let estimate = provider.estimate_gas(tx).await?;
        Ok(self.with_limit_buffer(estimate))
    }

    fn with_limit_buffer(&self, estimate: U256) -> U256 {
        estimate + estimate * self.gas_limit_buffer_percent / 100
    }

    /// Get buffered gas price for a chain
    pub async fn get_gas_price(&self, provider: &ChainProvider) -> BridgeResult<GasPrice> {
        let gas_price = provider.get_gas_price().await?;
        let buffered = self.speed_up_gas_price(&gas_price, 100 + self.gas_price_buffer_percent);

        debug!("Gas price for chain {}: {:?}", provider.chain_id(), buffered);
        Ok(buffered)
    }

    /// Scale a gas price by `factor` percent
    pub fn speed_up_gas_price(&self, current: &GasPrice, factor: u64) -> GasPrice {
        match current {
            GasPrice::Legacy(price) => GasPrice::Legacy(*price * factor / 100),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => GasPrice::Eip1559 {
                max_fee_per_gas: *max_fee_per_gas * factor / 100,
                max_priority_fee_per_gas: *max_priority_fee_per_gas * factor / 100,
            },
        }
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Fully specified transaction ready for signing
pub struct TxParams {
    pub from: Address,
    pub nonce: u64,
    pub gas_limit: U256,
    pub gas_price: GasPrice,
    pub chain_id: u64,
}

/// Rebuild a contract call with sender, nonce, gas and fee fields
pub fn build_tx(call: &TypedTransaction, params: &TxParams) -> TypedTransaction {
    let to = call.to().cloned();
    let data: Option<Bytes> = call.data().cloned();

    match params.gas_price {
        GasPrice::Legacy(price) => {
            let mut tx = TransactionRequest::new()
                .from(params.from)
                .nonce(params.nonce)
                .gas(params.gas_limit)
                .gas_price(price)
                .chain_id(params.chain_id);
            if let Some(NameOrAddress::Address(addr)) = to {
                tx = tx.to(addr);
            }
            if let Some(data) = data {
                tx = tx.data(data);
            }
            TypedTransaction::Legacy(tx)
        }
        GasPrice::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => {
            let mut tx = Eip1559TransactionRequest::new()
                .from(params.from)
                .nonce(params.nonce)
                .gas(params.gas_limit)
                .max_fee_per_gas(max_fee_per_gas)
                .max_priority_fee_per_gas(max_priority_fee_per_gas)
                .chain_id(params.chain_id);
            if let Some(NameOrAddress::Address(addr)) = to {
                tx = tx.to(addr);
            }
            if let Some(data) = data {
                tx = tx.data(data);
            }
            TypedTransaction::Eip1559(tx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_up_scales_both_fees() {
        let estimator = GasEstimator::new();
        let bumped = estimator.speed_up_gas_price(
            &GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(100),
                max_priority_fee_per_gas: U256::from(10),
            },
            125,
        );
        assert_eq!(
            bumped,
            GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(125),
                max_priority_fee_per_gas: U256::from(12),
            }
        );
        assert_eq!(estimator.with_limit_buffer(U256::from(100_000)), U256::from(120_000));
    }

    #[test]
    fn test_build_tx_keeps_call_target_and_data() {
        let target = Address::repeat_byte(7);
        let call: TypedTransaction = TransactionRequest::new()
            .to(target)
            .data(Bytes::from(vec![1, 2, 3]))
            .into();

        let tx = build_tx(
            &call,
            &TxParams {
                from: Address::repeat_byte(1),
                nonce: 9,
                gas_limit: U256::from(50_000),
                gas_price: GasPrice::Eip1559 {
                    max_fee_per_gas: U256::from(30),
                    max_priority_fee_per_gas: U256::from(2),
                },
                chain_id: 56,
            },
        );

        assert!(matches!(tx, TypedTransaction::Eip1559(_)));
        assert_eq!(tx.to(), Some(&NameOrAddress::Address(target)));
        assert_eq!(tx.data(), Some(&Bytes::from(vec![1, 2, 3])));
        assert_eq!(tx.nonce(), Some(&U256::from(9)));
        assert_eq!(tx.gas(), Some(&U256::from(50_000)));
    }
}
