use ethereum_types::H256;
use hex_literal::hex;

/// Keccak-256 of the RLP encoding of an empty list, the ommers hash of a
/// block with no uncles.
pub const EMPTY_OMMERS_HASH: H256 = H256(hex!(
    "1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347"
));

/// Root of an empty merkle-patricia trie.
pub const EMPTY_TRIE_ROOT: H256 = H256(hex!(
    "56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421"
));

/// Keccak-256 of empty input.
pub const EMPTY_KECCAK_HASH: H256 = H256(hex!(
    "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
));

pub const INITIAL_BASE_FEE: u64 = 1_000_000_000;

pub const MIN_GAS_LIMIT: u64 = 5000;
pub const GAS_LIMIT_BOUND_DIVISOR: u64 = 1024;

pub const MINIMUM_DIFFICULTY: u64 = 131_072;
