//! Registry of bridged token pairs

use crate::config::{Settings, TokenConfig};
use crate::error::{BridgeError, BridgeResult};
use crate::types::Side;

use ethers::types::Address;
use std::collections::HashMap;

/// One token bridged between the two chains
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub symbol: String,
    /// Token contract per side
    pub tokens: [Address; 2],
}

/// Where a token lives: the pair it belongs to and its side
#[derive(Debug, Clone, Copy)]
struct TokenSlot {
    pair: usize,
    side: Side,
}

/// Active token registry, resolving a token on one chain to its counterpart
#[derive(Debug, Clone)]
pub struct TokenRegistry {
    chains: [(String, u64); 2],
    pairs: Vec<TokenPair>,
    index: HashMap<(u64, Address), TokenSlot>,
}

impl TokenRegistry {
    pub fn new(chains: [(String, u64); 2], tokens: &[TokenConfig]) -> Self {
        let mut pairs = Vec::with_capacity(tokens.len());
        let mut index = HashMap::new();

        for (i, token) in tokens.iter().enumerate() {
            let pair = TokenPair {
                symbol: token.symbol.clone(),
                tokens: [token.primary, token.secondary],
            };
            for side in Side::BOTH {
                index.insert(
                    (chains[side.index()].1, pair.tokens[side.index()]),
                    TokenSlot { pair: i, side },
                );
            }
            pairs.push(pair);
        }

        Self {
            chains,
            pairs,
            index,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let primary = &settings.chains.primary;
        let secondary = &settings.chains.secondary;
        Self::new(
            [
                (primary.name.clone(), primary.chain_id),
                (secondary.name.clone(), secondary.chain_id),
            ],
            &settings.tokens,
        )
    }

    pub fn side_of(&self, chain_id: u64) -> Option<Side> {
        Side::BOTH
            .into_iter()
            .find(|side| self.chains[side.index()].1 == chain_id)
    }

    pub fn chain_id(&self, side: Side) -> u64 {
        self.chains[side.index()].1
    }

    pub fn chain_name(&self, chain_id: u64) -> Option<&str> {
        self.side_of(chain_id)
            .map(|side| self.chains[side.index()].0.as_str())
    }

    fn slot(&self, chain_id: u64, token: Address) -> BridgeResult<TokenSlot> {
        self.index
            .get(&(chain_id, token))
            .copied()
            .ok_or(BridgeError::UnknownToken { chain_id, token })
    }

    /// Symbol of a registered token
    pub fn symbol(&self, chain_id: u64, token: Address) -> BridgeResult<&str> {
        let slot = self.slot(chain_id, token)?;
        Ok(&self.pairs[slot.pair].symbol)
    }

    /// Destination chain and token a swap of `token` on `chain_id` pays out in
    pub fn counterpart(&self, chain_id: u64, token: Address) -> BridgeResult<(u64, Address)> {
        let slot = self.slot(chain_id, token)?;
        let other = slot.side.other();
        Ok((
            self.chain_id(other),
            self.pairs[slot.pair].tokens[other.index()],
        ))
    }

    pub fn pairs(&self) -> &[TokenPair] {
        &self.pairs
    }
}
