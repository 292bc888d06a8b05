use ethrune_rlp::error::{RLPDecodeError, RLPEncodeError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RLPxError {
    #[error("Handshake error: {0}")]
    HandshakeError(String),
    #[error("Cryptography error: {0}")]
    CryptographyError(String),
    #[error("MAC mismatch")]
    InvalidMac,
    #[error("Invalid message length")]
    InvalidMessageLength,
    #[error("RLP decode error: {0}")]
    RLPDecodeError(#[from] RLPDecodeError),
    #[error("RLP encode error: {0}")]
    RLPEncodeError(#[from] RLPEncodeError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Connection closed by peer")]
    Disconnected,
}

impl From<ethrune_crypto::CryptoError> for RLPxError {
    fn from(err: ethrune_crypto::CryptoError) -> Self {
        RLPxError::CryptographyError(err.to_string())
    }
}
