use ethrune_rlp::error::RLPDecodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Decode error: {0}")]
    DecodeError(#[from] RLPDecodeError),
    #[error("Malformed record: {0}")]
    MalformedRecord(String),
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
    #[error("{0}")]
    Custom(String),
}
