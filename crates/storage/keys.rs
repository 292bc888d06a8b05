use ethereum_types::H256;
use ethrune_common::types::BlockNumber;

// Chain-data key layout:
//   'h' || number(8 BE) || hash   → RLP header
//   'b' || number(8 BE) || hash   → RLP body
//   'H' || hash                  → number as 8 BE bytes
//   'n' || number(8 BE)          → canonical hash
//   't' || number(8 BE) || hash   → RLP total difficulty
//   'LastHeader'                → head header hash
//   'LastBlock'                 → head block hash
//   'heads'                     → JSON { name: hex(hash) }

pub const HEAD_HEADER_KEY: &[u8] = b"LastHeader";
pub const HEAD_BLOCK_KEY: &[u8] = b"LastBlock";
pub const HEADS_KEY: &[u8] = b"heads";

fn number_and_hash(prefix: u8, number: BlockNumber, hash: H256) -> Vec<u8> {
    let mut key = Vec::with_capacity(41);
    key.push(prefix);
    key.extend_from_slice(&number.to_be_bytes());
    key.extend_from_slice(hash.as_bytes());
    key
}

pub fn header_key(number: BlockNumber, hash: H256) -> Vec<u8> {
    number_and_hash(b'h', number, hash)
}

pub fn body_key(number: BlockNumber, hash: H256) -> Vec<u8> {
    number_and_hash(b'b', number, hash)
}

pub fn td_key(number: BlockNumber, hash: H256) -> Vec<u8> {
    number_and_hash(b't', number, hash)
}

pub fn hash_to_number_key(hash: H256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(b'H');
    key.extend_from_slice(hash.as_bytes());
    key
}

pub fn number_to_hash_key(number: BlockNumber) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(b'n');
    key.extend_from_slice(&number.to_be_bytes());
    key
}
