use bytes::Bytes;
use ethereum_types::{H256, U256};
use ethrune_common::types::{Block, BlockBody, BlockHeader, Transaction};
use ethrune_rlp::{
    decode::{RLPDecode, get_item_with_prefix},
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use ethrune_storage::Store;
use tracing::error;

/// Served headers per request.
pub const BLOCK_HEADER_LIMIT: u64 = 1024;
/// Served bodies per request.
pub const BLOCK_BODY_LIMIT: usize = 1024;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum HashOrNumber {
    Hash(H256),
    Number(u64),
}

impl RLPEncode for HashOrNumber {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        match self {
            HashOrNumber::Hash(hash) => hash.encode(buf),
            HashOrNumber::Number(number) => number.encode(buf),
        }
    }
}

impl RLPDecode for HashOrNumber {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let first_byte = buf.first().ok_or(RLPDecodeError::InvalidLength)?;
        // A 32-byte string starts with 0x80 + 32; shorter strings are block
        // numbers.
        if *first_byte == 0xa0 {
            let (hash, rest) = H256::decode_unfinished(buf)?;
            return Ok((Self::Hash(hash), rest));
        }
        let (number, rest) = u64::decode_unfinished(buf)?;
        Ok((Self::Number(number), rest))
    }
}

/// An already-encoded RLP item carried through opaquely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueItem(pub Bytes);

impl RLPEncode for OpaqueItem {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        buf.put_slice(&self.0);
    }
}

impl RLPDecode for OpaqueItem {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (item, rest) = get_item_with_prefix(rlp)?;
        Ok((OpaqueItem(Bytes::copy_from_slice(item)), rest))
    }
}

/// First message on a fresh stream, both directions:
/// `[version, chainId, totalDifficulty, bestHash, genesisHash]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub version: u32,
    pub chain_id: u64,
    pub total_difficulty: U256,
    pub best_hash: H256,
    pub genesis_hash: H256,
}

impl RLPEncode for StatusMessage {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.version)
            .encode_field(&self.chain_id)
            .encode_field(&self.total_difficulty)
            .encode_field(&self.best_hash)
            .encode_field(&self.genesis_hash)
            .finish();
    }
}

impl RLPDecode for StatusMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (version, decoder) = decoder.decode_field("protocolVersion")?;
        let (chain_id, decoder) = decoder.decode_field("networkId")?;
        let (total_difficulty, decoder) = decoder.decode_field("totalDifficulty")?;
        let (best_hash, decoder) = decoder.decode_field("blockHash")?;
        let (genesis_hash, decoder) = decoder.decode_field("genesis")?;
        // Implementations must ignore any additional list elements.
        let remaining = decoder.finish_unchecked();
        let status = StatusMessage {
            version,
            chain_id,
            total_difficulty,
            best_hash,
            genesis_hash,
        };
        Ok((status, remaining))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewBlockHashes {
    /// `(hash, number)` per announced block.
    pub block_hashes: Vec<(H256, u64)>,
}

impl RLPEncode for NewBlockHashes {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        self.block_hashes.encode(buf);
    }
}

impl RLPDecode for NewBlockHashes {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (block_hashes, rest) = Vec::decode_unfinished(rlp)?;
        Ok((NewBlockHashes { block_hashes }, rest))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transactions {
    pub transactions: Vec<Transaction>,
}

impl RLPEncode for Transactions {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        self.transactions.encode(buf);
    }
}

impl RLPDecode for Transactions {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (transactions, rest) = Vec::decode_unfinished(rlp)?;
        Ok((Transactions { transactions }, rest))
    }
}

/// `[reqId, [startBlock, limit, skip, reverse]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlockHeaders {
    pub id: u64,
    pub start_block: HashOrNumber,
    pub limit: u64,
    pub skip: u64,
    pub reverse: bool,
}

impl GetBlockHeaders {
    /// Serves up to `limit` canonical headers stepping by `skip + 1`,
    /// stopping at the first miss. A start hash that resolves to nothing
    /// yields an empty answer.
    pub fn fetch_headers(&self, store: &Store) -> Vec<BlockHeader> {
        let start = match self.start_block {
            HashOrNumber::Hash(hash) => match store.get_block_number(hash) {
                Ok(Some(number)) => number,
                Ok(None) => return vec![],
                Err(err) => {
                    error!("DB error while resolving header request start: {err}");
                    return vec![];
                }
            },
            HashOrNumber::Number(number) => number,
        };

        let limit = self.limit.min(BLOCK_HEADER_LIMIT);
        let step = self.skip as i128 + 1;
        let mut current = start as i128;
        let mut headers = vec![];
        for _ in 0..limit {
            if current < 0 {
                break;
            }
            match store.get_header_by_number(current as u64) {
                Ok(Some(header)) => {
                    headers.push(header);
                    current += if self.reverse { -step } else { step };
                }
                Ok(None) => break,
                Err(err) => {
                    error!("DB error while serving headers: {err}");
                    return vec![];
                }
            }
        }
        headers
    }
}

impl RLPEncode for GetBlockHeaders {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&(
                self.start_block.clone(),
                self.limit,
                self.skip,
                self.reverse as u8,
            ))
            .finish();
    }
}

impl RLPDecode for GetBlockHeaders {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (id, decoder) = decoder.decode_field("request-id")?;
        let ((start_block, limit, skip, reverse), decoder): ((HashOrNumber, u64, u64, u8), _) =
            decoder.decode_field("get headers request params")?;
        let remaining = decoder.finish()?;
        let request = GetBlockHeaders {
            id,
            start_block,
            limit,
            skip,
            reverse: reverse != 0,
        };
        Ok((request, remaining))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockHeaders {
    pub id: u64,
    pub block_headers: Vec<BlockHeader>,
}

impl RLPEncode for BlockHeaders {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.block_headers)
            .finish();
    }
}

impl RLPDecode for BlockHeaders {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (id, decoder) = decoder.decode_field("request-id")?;
        let (block_headers, decoder) = decoder.decode_field("headers")?;
        let remaining = decoder.finish()?;
        Ok((BlockHeaders { id, block_headers }, remaining))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetBlockBodies {
    pub id: u64,
    pub block_hashes: Vec<H256>,
}

impl GetBlockBodies {
    pub fn fetch_bodies(&self, store: &Store) -> Vec<BlockBody> {
        let mut bodies = vec![];
        for hash in self.block_hashes.iter().take(BLOCK_BODY_LIMIT) {
            match store.get_body(*hash) {
                Ok(Some(body)) => bodies.push(body),
                // Misses produce a shorter answer, not an error.
                Ok(None) => continue,
                Err(err) => {
                    error!("DB error while serving bodies: {err}");
                    return vec![];
                }
            }
        }
        bodies
    }
}

impl RLPEncode for GetBlockBodies {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.block_hashes)
            .finish();
    }
}

impl RLPDecode for GetBlockBodies {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (id, decoder) = decoder.decode_field("request-id")?;
        let (block_hashes, decoder) = decoder.decode_field("blockHashes")?;
        let remaining = decoder.finish()?;
        Ok((GetBlockBodies { id, block_hashes }, remaining))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockBodies {
    pub id: u64,
    pub block_bodies: Vec<BlockBody>,
}

impl RLPEncode for BlockBodies {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.block_bodies)
            .finish();
    }
}

impl RLPDecode for BlockBodies {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (id, decoder) = decoder.decode_field("request-id")?;
        let (block_bodies, decoder) = decoder.decode_field("blockBodies")?;
        let remaining = decoder.finish()?;
        Ok((BlockBodies { id, block_bodies }, remaining))
    }
}

/// `[block, totalDifficulty]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBlockMessage {
    pub block: Block,
    pub total_difficulty: U256,
}

impl RLPEncode for NewBlockMessage {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.block)
            .encode_field(&self.total_difficulty)
            .finish();
    }
}

impl RLPDecode for NewBlockMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (block, decoder) = decoder.decode_field("block")?;
        let (total_difficulty, decoder) = decoder.decode_field("td")?;
        let remaining = decoder.finish()?;
        let message = NewBlockMessage {
            block,
            total_difficulty,
        };
        Ok((message, remaining))
    }
}

/// Hash announcements. From eth/68 the types and sizes ride along
/// (`[types, sizes, hashes]`); earlier versions send a bare hash list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewPooledTransactionHashes {
    pub tx_types: Vec<u8>,
    pub tx_sizes: Vec<u32>,
    pub hashes: Vec<H256>,
}

impl NewPooledTransactionHashes {
    pub fn encode_for_version(&self, version: u32, buf: &mut dyn bytes::BufMut) {
        if version >= 68 {
            Encoder::new(buf)
                .encode_bytes(&self.tx_types)
                .encode_field(&self.tx_sizes)
                .encode_field(&self.hashes)
                .finish();
        } else {
            self.hashes.encode(buf);
        }
    }

    pub fn decode_for_version(version: u32, rlp: &[u8]) -> Result<Self, RLPDecodeError> {
        if version >= 68 {
            let decoder = Decoder::new(rlp)?;
            let (tx_types, decoder): (Bytes, _) = decoder.decode_field("types")?;
            let (tx_sizes, decoder) = decoder.decode_field("sizes")?;
            let (hashes, decoder) = decoder.decode_field("hashes")?;
            decoder.finish()?;
            Ok(NewPooledTransactionHashes {
                tx_types: tx_types.to_vec(),
                tx_sizes,
                hashes,
            })
        } else {
            let hashes = Vec::decode(rlp)?;
            Ok(NewPooledTransactionHashes {
                tx_types: vec![],
                tx_sizes: vec![],
                hashes,
            })
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetPooledTransactions {
    pub id: u64,
    pub hashes: Vec<H256>,
}

impl RLPEncode for GetPooledTransactions {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.hashes)
            .finish();
    }
}

impl RLPDecode for GetPooledTransactions {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (id, decoder) = decoder.decode_field("request-id")?;
        let (hashes, decoder) = decoder.decode_field("transactionHashes")?;
        let remaining = decoder.finish()?;
        Ok((GetPooledTransactions { id, hashes }, remaining))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PooledTransactions {
    pub id: u64,
    pub transactions: Vec<Transaction>,
}

impl RLPEncode for PooledTransactions {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.transactions)
            .finish();
    }
}

impl RLPDecode for PooledTransactions {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (id, decoder) = decoder.decode_field("request-id")?;
        let (transactions, decoder) = decoder.decode_field("pooledTransactions")?;
        let remaining = decoder.finish()?;
        Ok((PooledTransactions { id, transactions }, remaining))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetReceipts {
    pub id: u64,
    pub block_hashes: Vec<H256>,
}

impl RLPEncode for GetReceipts {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.block_hashes)
            .finish();
    }
}

impl RLPDecode for GetReceipts {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (id, decoder) = decoder.decode_field("request-id")?;
        let (block_hashes, decoder) = decoder.decode_field("blockHashes")?;
        let remaining = decoder.finish()?;
        Ok((GetReceipts { id, block_hashes }, remaining))
    }
}

/// Receipts are opaque to the chain core; one encoded list per requested
/// block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Receipts {
    pub id: u64,
    pub receipts: Vec<Vec<OpaqueItem>>,
}

impl RLPEncode for Receipts {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.receipts)
            .finish();
    }
}

impl RLPDecode for Receipts {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (id, decoder) = decoder.decode_field("request-id")?;
        let (receipts, decoder) = decoder.decode_field("receipts")?;
        let remaining = decoder.finish()?;
        Ok((Receipts { id, receipts }, remaining))
    }
}

/// One protocol message: `code(1) || rlp(payload)` inside a single mux
/// message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Status(StatusMessage),
    NewBlockHashes(NewBlockHashes),
    Transactions(Transactions),
    GetBlockHeaders(GetBlockHeaders),
    BlockHeaders(BlockHeaders),
    GetBlockBodies(GetBlockBodies),
    BlockBodies(BlockBodies),
    NewBlock(Box<NewBlockMessage>),
    NewPooledTransactionHashes(NewPooledTransactionHashes),
    GetPooledTransactions(GetPooledTransactions),
    PooledTransactions(PooledTransactions),
    GetReceipts(GetReceipts),
    Receipts(Receipts),
}

impl Message {
    pub fn known_code(code: u8) -> bool {
        matches!(code, 0x00..=0x0a | 0x0f | 0x10)
    }

    pub fn code(&self) -> u8 {
        match self {
            Message::Status(_) => 0x00,
            Message::NewBlockHashes(_) => 0x01,
            Message::Transactions(_) => 0x02,
            Message::GetBlockHeaders(_) => 0x03,
            Message::BlockHeaders(_) => 0x04,
            Message::GetBlockBodies(_) => 0x05,
            Message::BlockBodies(_) => 0x06,
            Message::NewBlock(_) => 0x07,
            Message::NewPooledTransactionHashes(_) => 0x08,
            Message::GetPooledTransactions(_) => 0x09,
            Message::PooledTransactions(_) => 0x0a,
            Message::GetReceipts(_) => 0x0f,
            Message::Receipts(_) => 0x10,
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>, version: u32) {
        buf.push(self.code());
        match self {
            Message::Status(msg) => msg.encode(buf),
            Message::NewBlockHashes(msg) => msg.encode(buf),
            Message::Transactions(msg) => msg.encode(buf),
            Message::GetBlockHeaders(msg) => msg.encode(buf),
            Message::BlockHeaders(msg) => msg.encode(buf),
            Message::GetBlockBodies(msg) => msg.encode(buf),
            Message::BlockBodies(msg) => msg.encode(buf),
            Message::NewBlock(msg) => msg.encode(buf),
            Message::NewPooledTransactionHashes(msg) => msg.encode_for_version(version, buf),
            Message::GetPooledTransactions(msg) => msg.encode(buf),
            Message::PooledTransactions(msg) => msg.encode(buf),
            Message::GetReceipts(msg) => msg.encode(buf),
            Message::Receipts(msg) => msg.encode(buf),
        }
    }

    pub fn decode(data: &[u8], version: u32) -> Result<Self, RLPDecodeError> {
        let (code, payload) = data.split_first().ok_or(RLPDecodeError::InvalidLength)?;
        match code {
            0x00 => Ok(Message::Status(StatusMessage::decode(payload)?)),
            0x01 => Ok(Message::NewBlockHashes(NewBlockHashes::decode(payload)?)),
            0x02 => Ok(Message::Transactions(Transactions::decode(payload)?)),
            0x03 => Ok(Message::GetBlockHeaders(GetBlockHeaders::decode(payload)?)),
            0x04 => Ok(Message::BlockHeaders(BlockHeaders::decode(payload)?)),
            0x05 => Ok(Message::GetBlockBodies(GetBlockBodies::decode(payload)?)),
            0x06 => Ok(Message::BlockBodies(BlockBodies::decode(payload)?)),
            0x07 => Ok(Message::NewBlock(Box::new(NewBlockMessage::decode(
                payload,
            )?))),
            0x08 => Ok(Message::NewPooledTransactionHashes(
                NewPooledTransactionHashes::decode_for_version(version, payload)?,
            )),
            0x09 => Ok(Message::GetPooledTransactions(GetPooledTransactions::decode(payload)?)),
            0x0a => Ok(Message::PooledTransactions(PooledTransactions::decode(payload)?)),
            0x0f => Ok(Message::GetReceipts(GetReceipts::decode(payload)?)),
            0x10 => Ok(Message::Receipts(Receipts::decode(payload)?)),
            other => Err(RLPDecodeError::Custom(format!(
                "unknown message code {other:#x}"
            ))),
        }
    }

    /// Request id of a response message, for pending-request correlation.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Message::BlockHeaders(msg) => Some(msg.id),
            Message::BlockBodies(msg) => Some(msg.id),
            Message::PooledTransactions(msg) => Some(msg.id),
            Message::Receipts(msg) => Some(msg.id),
            _ => None,
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Message::Status(_) => "Status",
            Message::NewBlockHashes(_) => "NewBlockHashes",
            Message::Transactions(_) => "Transactions",
            Message::GetBlockHeaders(_) => "GetBlockHeaders",
            Message::BlockHeaders(_) => "BlockHeaders",
            Message::GetBlockBodies(_) => "GetBlockBodies",
            Message::BlockBodies(_) => "BlockBodies",
            Message::NewBlock(_) => "NewBlock",
            Message::NewPooledTransactionHashes(_) => "NewPooledTransactionHashes",
            Message::GetPooledTransactions(_) => "GetPooledTransactions",
            Message::PooledTransactions(_) => "PooledTransactions",
            Message::GetReceipts(_) => "GetReceipts",
            Message::Receipts(_) => "Receipts",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethrune_storage::{DbOp, EngineType};

    fn canonical_chain(store: &Store, length: u64) -> Vec<BlockHeader> {
        let mut headers = vec![];
        let mut parent_hash = H256::zero();
        for number in 0..length {
            let header = BlockHeader {
                number,
                parent_hash,
                timestamp: number,
                gas_limit: 30_000_000,
                ..Default::default()
            };
            let hash = header.hash();
            parent_hash = hash;
            store
                .apply_batch(vec![
                    DbOp::SetHeader {
                        number,
                        hash,
                        header: header.clone(),
                    },
                    DbOp::SetHashToNumber { hash, number },
                    DbOp::SetNumberToHash { number, hash },
                ])
                .unwrap();
            headers.push(header);
        }
        headers
    }

    #[test]
    fn get_block_headers_round_trip() {
        let request = GetBlockHeaders {
            id: 7,
            start_block: HashOrNumber::Hash(H256([1; 32])),
            limit: 10,
            skip: 2,
            reverse: true,
        };
        let encoded = request.encode_to_vec();
        assert_eq!(GetBlockHeaders::decode(&encoded).unwrap(), request);

        let request = GetBlockHeaders {
            id: 8,
            start_block: HashOrNumber::Number(42),
            limit: 1,
            skip: 0,
            reverse: false,
        };
        let encoded = request.encode_to_vec();
        assert_eq!(GetBlockHeaders::decode(&encoded).unwrap(), request);
    }

    #[test]
    fn fetch_headers_steps_and_stops_at_missing() {
        let store = Store::new(EngineType::InMemory);
        let headers = canonical_chain(&store, 10);

        // Forward with a skip: 0, 3, 6, 9.
        let request = GetBlockHeaders {
            id: 1,
            start_block: HashOrNumber::Number(0),
            limit: 10,
            skip: 2,
            reverse: false,
        };
        let served = request.fetch_headers(&store);
        let numbers: Vec<u64> = served.iter().map(|header| header.number).collect();
        assert_eq!(numbers, vec![0, 3, 6, 9]);

        // Reverse from the middle.
        let request = GetBlockHeaders {
            id: 2,
            start_block: HashOrNumber::Number(4),
            limit: 3,
            skip: 0,
            reverse: true,
        };
        let numbers: Vec<u64> = request
            .fetch_headers(&store)
            .iter()
            .map(|header| header.number)
            .collect();
        assert_eq!(numbers, vec![4, 3, 2]);

        // Start hash resolves through the lookup table.
        let request = GetBlockHeaders {
            id: 3,
            start_block: HashOrNumber::Hash(headers[5].hash()),
            limit: 2,
            skip: 0,
            reverse: false,
        };
        let numbers: Vec<u64> = request
            .fetch_headers(&store)
            .iter()
            .map(|header| header.number)
            .collect();
        assert_eq!(numbers, vec![5, 6]);

        // Unknown start hash: empty answer, not an error.
        let request = GetBlockHeaders {
            id: 4,
            start_block: HashOrNumber::Hash(H256([0xfe; 32])),
            limit: 2,
            skip: 0,
            reverse: false,
        };
        assert!(request.fetch_headers(&store).is_empty());
    }

    #[test]
    fn message_envelope_round_trips() {
        let status = Message::Status(StatusMessage {
            version: 68,
            chain_id: 1,
            total_difficulty: U256::from(17),
            best_hash: H256([1; 32]),
            genesis_hash: H256([2; 32]),
        });
        let mut buf = Vec::new();
        status.encode(&mut buf, 68);
        assert_eq!(buf[0], 0x00);
        assert_eq!(Message::decode(&buf, 68).unwrap(), status);

        let bodies = Message::GetBlockBodies(GetBlockBodies {
            id: 99,
            block_hashes: vec![H256([3; 32])],
        });
        let mut buf = Vec::new();
        bodies.encode(&mut buf, 68);
        let decoded = Message::decode(&buf, 68).unwrap();
        assert_eq!(decoded.request_id(), None);
        assert_eq!(decoded, bodies);
    }

    #[test]
    fn pooled_hash_announcements_differ_by_version() {
        let announcement = NewPooledTransactionHashes {
            tx_types: vec![0x02, 0x00],
            tx_sizes: vec![120, 250],
            hashes: vec![H256([1; 32]), H256([2; 32])],
        };

        let mut eth68 = Vec::new();
        announcement.encode_for_version(68, &mut eth68);
        let decoded = NewPooledTransactionHashes::decode_for_version(68, &eth68).unwrap();
        assert_eq!(decoded, announcement);

        let mut eth66 = Vec::new();
        announcement.encode_for_version(66, &mut eth66);
        let decoded = NewPooledTransactionHashes::decode_for_version(66, &eth66).unwrap();
        assert_eq!(decoded.hashes, announcement.hashes);
        assert!(decoded.tx_types.is_empty());
    }

    #[test]
    fn unknown_code_is_an_error() {
        assert!(Message::decode(&[0x0b, 0xc0], 68).is_err());
        assert!(Message::decode(&[], 68).is_err());
    }

    #[test]
    fn receipts_carry_opaque_payloads() {
        let receipts = Message::Receipts(Receipts {
            id: 5,
            receipts: vec![vec![], vec![OpaqueItem(Bytes::from_static(&[0xc2, 0x01, 0x02]))]],
        });
        let mut buf = Vec::new();
        receipts.encode(&mut buf, 68);
        assert_eq!(Message::decode(&buf, 68).unwrap(), receipts);
    }
}
