use ethereum_types::H256;
use sha3::{Digest, Keccak256};

/// Computes the Keccak-256 hash of the given data.
pub fn keccak_hash(data: impl AsRef<[u8]>) -> H256 {
    H256(Keccak256::digest(data.as_ref()).into())
}

/// Computes the Keccak-256 hash of the concatenation of the given slices.
pub fn keccak_concat(parts: &[&[u8]]) -> H256 {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    H256(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn keccak_of_empty_input() {
        assert_eq!(
            keccak_hash([]),
            H256(hex!(
                "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
            ))
        );
    }

    #[test]
    fn keccak_concat_matches_single_buffer() {
        let joined = keccak_hash(b"hello world".as_slice());
        let parts = keccak_concat(&[b"hello ", b"world"]);
        assert_eq!(joined, parts);
    }
}
