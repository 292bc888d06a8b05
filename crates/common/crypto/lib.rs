pub mod keccak;
pub mod secp;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid recovery id")]
    InvalidRecoveryId,
    #[error("Key derivation failed")]
    KdfError,
    #[error("Invalid key length")]
    InvalidKeyLength,
}
