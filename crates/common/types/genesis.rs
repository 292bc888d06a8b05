use super::{
    block::{Block, BlockBody, BlockHeader},
    hardfork::Hardfork,
};
use crate::constants::{EMPTY_OMMERS_HASH, EMPTY_TRIE_ROOT, INITIAL_BASE_FEE};
use bytes::Bytes;
use ethereum_types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenesisError {
    #[error("Failed to decode genesis file: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Genesis header values. The state itself lives behind the external state
/// interface; only its root is stamped into the header here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Genesis {
    pub coinbase: Address,
    pub difficulty: U256,
    pub extra_data: Bytes,
    pub gas_limit: u64,
    pub nonce: u64,
    pub mix_hash: H256,
    pub timestamp: u64,
    pub base_fee_per_gas: Option<u64>,
    pub excess_blob_gas: Option<u64>,
    pub requests_hash: Option<H256>,
}

impl Default for Genesis {
    fn default() -> Self {
        Self {
            coinbase: Address::zero(),
            difficulty: U256::one(),
            extra_data: Bytes::new(),
            gas_limit: 30_000_000,
            nonce: 0,
            mix_hash: H256::zero(),
            timestamp: 0,
            base_fee_per_gas: None,
            excess_blob_gas: None,
            requests_hash: None,
        }
    }
}

impl Genesis {
    pub fn from_json(raw: &str) -> Result<Self, GenesisError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Builds the genesis block for the given state root, including the
    /// optional header tail fields the fork calls for.
    pub fn get_block(&self, fork: Hardfork, state_root: H256) -> Block {
        let base_fee_per_gas = (fork >= Hardfork::London)
            .then(|| self.base_fee_per_gas.unwrap_or(INITIAL_BASE_FEE));
        let withdrawals_root = (fork >= Hardfork::Shanghai).then_some(EMPTY_TRIE_ROOT);
        let blob_gas_used = (fork >= Hardfork::Cancun).then_some(0);
        let excess_blob_gas =
            (fork >= Hardfork::Cancun).then(|| self.excess_blob_gas.unwrap_or(0));
        let parent_beacon_block_root = (fork >= Hardfork::Cancun).then_some(H256::zero());

        let header = BlockHeader {
            parent_hash: H256::zero(),
            ommers_hash: EMPTY_OMMERS_HASH,
            coinbase: self.coinbase,
            state_root,
            transactions_root: EMPTY_TRIE_ROOT,
            receipts_root: EMPTY_TRIE_ROOT,
            difficulty: self.difficulty,
            number: 0,
            gas_limit: self.gas_limit,
            gas_used: 0,
            timestamp: self.timestamp,
            extra_data: self.extra_data.clone(),
            mix_hash: self.mix_hash,
            nonce: self.nonce,
            base_fee_per_gas,
            withdrawals_root,
            blob_gas_used,
            excess_blob_gas,
            parent_beacon_block_root,
            requests_hash: self.requests_hash,
            ..Default::default()
        };
        let withdrawals = (fork >= Hardfork::Shanghai).then_some(vec![]);
        Block::new(
            header,
            BlockBody {
                withdrawals,
                ..Default::default()
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_block_is_number_zero_with_no_parent() {
        let block = Genesis::default().get_block(Hardfork::Chainstart, EMPTY_TRIE_ROOT);
        assert_eq!(block.header.number, 0);
        assert_eq!(block.header.parent_hash, H256::zero());
        assert!(block.header.base_fee_per_gas.is_none());
    }

    #[test]
    fn post_london_genesis_carries_base_fee() {
        let block = Genesis::default().get_block(Hardfork::London, EMPTY_TRIE_ROOT);
        assert_eq!(block.header.base_fee_per_gas, Some(INITIAL_BASE_FEE));
        assert!(block.header.withdrawals_root.is_none());
    }

    #[test]
    fn post_shanghai_genesis_carries_withdrawals() {
        let block = Genesis::default().get_block(Hardfork::Shanghai, EMPTY_TRIE_ROOT);
        assert_eq!(block.header.withdrawals_root, Some(EMPTY_TRIE_ROOT));
        assert_eq!(block.body.withdrawals, Some(vec![]));
    }
}
