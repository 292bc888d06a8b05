use crate::{
    engine::{EngineType, InMemoryEngine, KvOp, StoreEngine},
    error::StoreError,
    keys,
};
use ethereum_types::{H256, U256};
use ethrune_common::types::{Block, BlockBody, BlockHeader, BlockNumber};
use ethrune_rlp::{decode::RLPDecode, encode::RLPEncode};
use std::{collections::HashMap, sync::Arc};

/// Record family a [`DbOp`] touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbTarget {
    Header,
    Body,
    HashToNumber,
    NumberToHash,
    TotalDifficulty,
    Heads,
    HeadHeader,
    HeadBlock,
}

/// One chain-data write. Batches of these are applied atomically by the
/// engine, keys derived from the block hash/number the op names.
#[derive(Debug, Clone)]
pub enum DbOp {
    SetHeader {
        number: BlockNumber,
        hash: H256,
        header: BlockHeader,
    },
    SetBody {
        number: BlockNumber,
        hash: H256,
        body: BlockBody,
    },
    SetTotalDifficulty {
        number: BlockNumber,
        hash: H256,
        td: U256,
    },
    SetHashToNumber {
        hash: H256,
        number: BlockNumber,
    },
    SetNumberToHash {
        number: BlockNumber,
        hash: H256,
    },
    DelNumberToHash {
        number: BlockNumber,
    },
    SetHeads {
        heads: HashMap<String, H256>,
    },
    SetHeadHeader {
        hash: H256,
    },
    SetHeadBlock {
        hash: H256,
    },
}

impl DbOp {
    pub fn target(&self) -> DbTarget {
        match self {
            DbOp::SetHeader { .. } => DbTarget::Header,
            DbOp::SetBody { .. } => DbTarget::Body,
            DbOp::SetTotalDifficulty { .. } => DbTarget::TotalDifficulty,
            DbOp::SetHashToNumber { .. } => DbTarget::HashToNumber,
            DbOp::SetNumberToHash { .. } | DbOp::DelNumberToHash { .. } => DbTarget::NumberToHash,
            DbOp::SetHeads { .. } => DbTarget::Heads,
            DbOp::SetHeadHeader { .. } => DbTarget::HeadHeader,
            DbOp::SetHeadBlock { .. } => DbTarget::HeadBlock,
        }
    }

    fn into_kv(self) -> Result<KvOp, StoreError> {
        let op = match self {
            DbOp::SetHeader {
                number,
                hash,
                header,
            } => KvOp::Put {
                key: keys::header_key(number, hash),
                value: header.encode_to_vec(),
            },
            DbOp::SetBody { number, hash, body } => KvOp::Put {
                key: keys::body_key(number, hash),
                value: body.encode_to_vec(),
            },
            DbOp::SetTotalDifficulty { number, hash, td } => KvOp::Put {
                key: keys::td_key(number, hash),
                value: td.encode_to_vec(),
            },
            DbOp::SetHashToNumber { hash, number } => KvOp::Put {
                key: keys::hash_to_number_key(hash),
                value: number.to_be_bytes().to_vec(),
            },
            DbOp::SetNumberToHash { number, hash } => KvOp::Put {
                key: keys::number_to_hash_key(number),
                value: hash.as_bytes().to_vec(),
            },
            DbOp::DelNumberToHash { number } => KvOp::Delete {
                key: keys::number_to_hash_key(number),
            },
            DbOp::SetHeads { heads } => KvOp::Put {
                key: keys::HEADS_KEY.to_vec(),
                value: serde_json::to_vec(&heads)
                    .map_err(|err| StoreError::MalformedRecord(err.to_string()))?,
            },
            DbOp::SetHeadHeader { hash } => KvOp::Put {
                key: keys::HEAD_HEADER_KEY.to_vec(),
                value: hash.as_bytes().to_vec(),
            },
            DbOp::SetHeadBlock { hash } => KvOp::Put {
                key: keys::HEAD_BLOCK_KEY.to_vec(),
                value: hash.as_bytes().to_vec(),
            },
        };
        Ok(op)
    }
}

/// Typed view over the chain-data engine.
#[derive(Debug, Clone)]
pub struct Store {
    engine: Arc<dyn StoreEngine>,
}

impl Store {
    pub fn new(engine_type: EngineType) -> Self {
        match engine_type {
            EngineType::InMemory => Self {
                engine: Arc::new(InMemoryEngine::new()),
            },
        }
    }

    pub fn from_engine(engine: Arc<dyn StoreEngine>) -> Self {
        Self { engine }
    }

    pub fn apply_batch(&self, ops: Vec<DbOp>) -> Result<(), StoreError> {
        let kv_ops = ops
            .into_iter()
            .map(DbOp::into_kv)
            .collect::<Result<Vec<_>, _>>()?;
        self.engine.apply_batch(kv_ops)
    }

    pub fn get_block_number(&self, hash: H256) -> Result<Option<BlockNumber>, StoreError> {
        match self.engine.get(&keys::hash_to_number_key(hash))? {
            Some(value) => {
                let bytes: [u8; 8] = value.as_slice().try_into().map_err(|_| {
                    StoreError::MalformedRecord("hash-to-number value is not 8 bytes".to_string())
                })?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    pub fn has_block(&self, hash: H256) -> Result<bool, StoreError> {
        Ok(self.get_block_number(hash)?.is_some())
    }

    pub fn get_canonical_hash(&self, number: BlockNumber) -> Result<Option<H256>, StoreError> {
        match self.engine.get(&keys::number_to_hash_key(number))? {
            Some(value) if value.len() == 32 => Ok(Some(H256::from_slice(&value))),
            Some(_) => Err(StoreError::MalformedRecord(
                "canonical hash value is not 32 bytes".to_string(),
            )),
            None => Ok(None),
        }
    }

    pub fn get_header(&self, hash: H256) -> Result<Option<BlockHeader>, StoreError> {
        let Some(number) = self.get_block_number(hash)? else {
            return Ok(None);
        };
        match self.engine.get(&keys::header_key(number, hash))? {
            Some(value) => Ok(Some(BlockHeader::decode(&value)?)),
            None => Ok(None),
        }
    }

    pub fn get_header_by_number(
        &self,
        number: BlockNumber,
    ) -> Result<Option<BlockHeader>, StoreError> {
        let Some(hash) = self.get_canonical_hash(number)? else {
            return Ok(None);
        };
        match self.engine.get(&keys::header_key(number, hash))? {
            Some(value) => Ok(Some(BlockHeader::decode(&value)?)),
            None => Ok(None),
        }
    }

    pub fn get_body(&self, hash: H256) -> Result<Option<BlockBody>, StoreError> {
        let Some(number) = self.get_block_number(hash)? else {
            return Ok(None);
        };
        match self.engine.get(&keys::body_key(number, hash))? {
            Some(value) => Ok(Some(BlockBody::decode(&value)?)),
            None => Ok(None),
        }
    }

    pub fn get_block(&self, hash: H256) -> Result<Option<Block>, StoreError> {
        let Some(header) = self.get_header(hash)? else {
            return Ok(None);
        };
        let Some(body) = self.get_body(hash)? else {
            return Ok(None);
        };
        Ok(Some(Block::new(header, body)))
    }

    pub fn get_block_by_number(&self, number: BlockNumber) -> Result<Option<Block>, StoreError> {
        let Some(hash) = self.get_canonical_hash(number)? else {
            return Ok(None);
        };
        self.get_block(hash)
    }

    pub fn get_total_difficulty(&self, hash: H256) -> Result<Option<U256>, StoreError> {
        let Some(number) = self.get_block_number(hash)? else {
            return Ok(None);
        };
        match self.engine.get(&keys::td_key(number, hash))? {
            Some(value) => Ok(Some(U256::decode(&value)?)),
            None => Ok(None),
        }
    }

    pub fn get_heads(&self) -> Result<HashMap<String, H256>, StoreError> {
        match self.engine.get(keys::HEADS_KEY)? {
            Some(value) => serde_json::from_slice(&value)
                .map_err(|err| StoreError::MalformedRecord(err.to_string())),
            None => Ok(HashMap::new()),
        }
    }

    pub fn get_head_header_hash(&self) -> Result<Option<H256>, StoreError> {
        self.get_hash_record(keys::HEAD_HEADER_KEY)
    }

    pub fn get_head_block_hash(&self) -> Result<Option<H256>, StoreError> {
        self.get_hash_record(keys::HEAD_BLOCK_KEY)
    }

    fn get_hash_record(&self, key: &[u8]) -> Result<Option<H256>, StoreError> {
        match self.engine.get(key)? {
            Some(value) if value.len() == 32 => Ok(Some(H256::from_slice(&value))),
            Some(_) => Err(StoreError::MalformedRecord(
                "head record is not 32 bytes".to_string(),
            )),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_at(number: BlockNumber) -> BlockHeader {
        BlockHeader {
            number,
            gas_limit: 30_000_000,
            timestamp: number,
            ..Default::default()
        }
    }

    fn store_block(store: &Store, header: BlockHeader, td: U256) -> H256 {
        let hash = header.hash();
        let number = header.number;
        store
            .apply_batch(vec![
                DbOp::SetHeader {
                    number,
                    hash,
                    header,
                },
                DbOp::SetBody {
                    number,
                    hash,
                    body: BlockBody::default(),
                },
                DbOp::SetTotalDifficulty { number, hash, td },
                DbOp::SetHashToNumber { hash, number },
                DbOp::SetNumberToHash { number, hash },
            ])
            .unwrap();
        hash
    }

    #[test]
    fn round_trips_header_body_and_lookups() {
        let store = Store::new(EngineType::InMemory);
        let header = header_at(1);
        let hash = store_block(&store, header.clone(), U256::from(3));

        assert_eq!(store.get_block_number(hash).unwrap(), Some(1));
        assert_eq!(store.get_canonical_hash(1).unwrap(), Some(hash));
        assert_eq!(store.get_header(hash).unwrap(), Some(header));
        assert_eq!(
            store.get_total_difficulty(hash).unwrap(),
            Some(U256::from(3))
        );
        assert!(store.get_block(hash).unwrap().is_some());
    }

    #[test]
    fn missing_lookups_return_none() {
        let store = Store::new(EngineType::InMemory);
        let absent = H256([9; 32]);
        assert_eq!(store.get_block_number(absent).unwrap(), None);
        assert_eq!(store.get_header(absent).unwrap(), None);
        assert_eq!(store.get_canonical_hash(7).unwrap(), None);
    }

    #[test]
    fn heads_record_round_trips_as_json() {
        let store = Store::new(EngineType::InMemory);
        let mut heads = HashMap::new();
        heads.insert("vm".to_string(), H256([1; 32]));
        heads.insert("receipts".to_string(), H256([2; 32]));
        store
            .apply_batch(vec![DbOp::SetHeads {
                heads: heads.clone(),
            }])
            .unwrap();
        assert_eq!(store.get_heads().unwrap(), heads);
    }

    #[test]
    fn del_number_to_hash_clears_canonical_entry() {
        let store = Store::new(EngineType::InMemory);
        let hash = store_block(&store, header_at(5), U256::one());
        assert_eq!(store.get_canonical_hash(5).unwrap(), Some(hash));
        store
            .apply_batch(vec![DbOp::DelNumberToHash { number: 5 }])
            .unwrap();
        assert_eq!(store.get_canonical_hash(5).unwrap(), None);
    }
}
