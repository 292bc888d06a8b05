use ethereum_types::H256;
use ethrune_crypto::CryptoError;
use ethrune_rlp::error::RLPDecodeError;
use ethrune_storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum InvalidBlockError {
    #[error("Block number is not parent number + 1")]
    NonSequentialNumber,
    #[error("Timestamp is not greater than parent timestamp")]
    TimestampNotIncreasing,
    #[error("Gas limit out of bounds relative to parent")]
    GasLimitOutOfBounds,
    #[error("Gas used exceeds gas limit")]
    GasUsedAboveLimit,
    #[error("Extra data exceeds 32 bytes")]
    ExtraDataTooLong,
    #[error("Ommers hash does not match the uncle headers")]
    OmmersHashMismatch,
    #[error("Invalid difficulty: {0}")]
    InvalidDifficulty(String),
    #[error("Blob gas fields inconsistent with the active fork")]
    InvalidBlobGasFields,
    #[error("Transaction carries wrong chain id")]
    TransactionChainIdMismatch,
    #[error("Consensus validation failed: {0}")]
    ConsensusError(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("Invalid Block: {0}")]
    InvalidBlock(#[from] InvalidBlockError),
    #[error("Invalid genesis block")]
    InvalidGenesis,
    #[error("Chain id mismatch")]
    ChainIdMismatch,
    #[error("Parent block not found")]
    ParentNotFound,
    #[error("Failed to find ancient header")]
    AncientHeaderNotFound,
    #[error("Block not found in DB: {0:#x}")]
    NotFoundInDb(H256),
    #[error("DB error: {0}")]
    StoreError(#[from] StoreError),
    #[error("RLP decode error: {0}")]
    RLPDecodeError(#[from] RLPDecodeError),
    #[error("{0}")]
    Custom(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MempoolError {
    #[error("Transaction is not signed")]
    NotSigned,
    #[error("Invalid transaction signature: {0}")]
    InvalidSignature(#[from] CryptoError),
    #[error("Transaction data exceeds the maximum size")]
    DataTooLarge,
    #[error("Sender reached the per-account transaction limit")]
    AccountLimit,
    #[error("Transaction underpriced for a pool under pressure")]
    Underpriced,
    #[error("Transaction gas limit exceeds the block gas limit")]
    GasLimitExceeded,
    #[error("Transaction nonce is lower than the account nonce")]
    NonceTooLow,
    #[error("Sender balance does not cover value plus max fees")]
    InsufficientFunds,
    #[error("Replacement transaction does not bump fees enough")]
    ReplacementUnderpriced,
    #[error("Transaction was already rejected: {0}")]
    AlreadyRejected(String),
    #[error("No head block available for validation")]
    NoHeadBlock,
    #[error("DB error: {0}")]
    StoreError(#[from] StoreError),
}
