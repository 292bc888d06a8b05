use crate::error::{ChainError, InvalidBlockError};
use ethrune_common::{
    constants::MINIMUM_DIFFICULTY,
    types::{Block, BlockHeader, ConsensusAlgorithm, HardforkManager},
};
use tracing::debug;

/// The consensus collaborators, one per algorithm name. Exactly one is active
/// per chain, selected at construction from the algorithm the hardfork
/// manager names. All hooks must be idempotent: `setup`/`genesis_init` are
/// re-invoked on every canonical head move when hardfork rewiring is on.
#[derive(Debug, Clone, Default)]
pub enum Consensus {
    #[default]
    PoW,
    PoA {
        /// Clique epoch length in blocks.
        epoch: u64,
    },
    PoS,
}

impl Consensus {
    pub fn from_algorithm(algorithm: ConsensusAlgorithm) -> Self {
        match algorithm {
            ConsensusAlgorithm::Ethash => Self::PoW,
            ConsensusAlgorithm::Clique => Self::PoA { epoch: 30_000 },
            ConsensusAlgorithm::Casper => Self::PoS,
        }
    }

    pub fn algorithm(&self) -> ConsensusAlgorithm {
        match self {
            Self::PoW => ConsensusAlgorithm::Ethash,
            Self::PoA { .. } => ConsensusAlgorithm::Clique,
            Self::PoS => ConsensusAlgorithm::Casper,
        }
    }

    /// Fiat ordering: an incoming proof-of-stake block always overrides the
    /// current head.
    pub fn is_pos(&self) -> bool {
        matches!(self, Self::PoS)
    }

    pub fn setup(&self, manager: &HardforkManager) -> Result<(), ChainError> {
        debug!(
            algorithm = self.algorithm().name(),
            hardfork = ?manager.current_hardfork(),
            "Consensus setup"
        );
        Ok(())
    }

    pub fn genesis_init(&self, genesis: &Block) -> Result<(), ChainError> {
        debug!(hash = %genesis.hash(), "Consensus genesis init");
        Ok(())
    }

    /// Per-block consensus validation, invoked when `validate_consensus` is
    /// enabled.
    pub fn validate_consensus(&self, header: &BlockHeader) -> Result<(), ChainError> {
        match self {
            Self::PoW => {
                if header.difficulty.is_zero() {
                    return Err(InvalidBlockError::ConsensusError(
                        "proof-of-work block has zero difficulty".to_string(),
                    )
                    .into());
                }
                Ok(())
            }
            Self::PoA { .. } => {
                // The clique seal is a 65-byte signature in extra data.
                if header.extra_data.len() < 65 {
                    return Err(InvalidBlockError::ConsensusError(
                        "clique block is missing its seal".to_string(),
                    )
                    .into());
                }
                Ok(())
            }
            Self::PoS => {
                if !header.difficulty.is_zero() || header.nonce != 0 {
                    return Err(InvalidBlockError::ConsensusError(
                        "post-merge block carries proof-of-work fields".to_string(),
                    )
                    .into());
                }
                Ok(())
            }
        }
    }

    /// Difficulty consistency check against the parent.
    pub fn validate_difficulty(
        &self,
        header: &BlockHeader,
        parent: &BlockHeader,
    ) -> Result<(), ChainError> {
        match self {
            Self::PoW => {
                if header.difficulty < MINIMUM_DIFFICULTY.into()
                    && !parent.difficulty.is_zero()
                    && header.difficulty < parent.difficulty / 2
                {
                    return Err(InvalidBlockError::InvalidDifficulty(format!(
                        "difficulty {} diverges too far from parent {}",
                        header.difficulty, parent.difficulty
                    ))
                    .into());
                }
                Ok(())
            }
            Self::PoA { .. } => Ok(()),
            Self::PoS => {
                if !header.difficulty.is_zero() {
                    return Err(InvalidBlockError::InvalidDifficulty(
                        "post-merge difficulty must be zero".to_string(),
                    )
                    .into());
                }
                Ok(())
            }
        }
    }

    /// Canonical head moved: the new header plus the headers traversed while
    /// searching for the common ancestor.
    pub fn new_block(
        &self,
        header: &BlockHeader,
        ancestor_headers: &[BlockHeader],
    ) -> Result<(), ChainError> {
        debug!(
            number = header.number,
            traversed = ancestor_headers.len(),
            "Consensus notified of new block"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::U256;

    #[test]
    fn pos_rejects_nonzero_difficulty() {
        let consensus = Consensus::PoS;
        let header = BlockHeader {
            difficulty: U256::one(),
            ..Default::default()
        };
        assert!(consensus.validate_consensus(&header).is_err());
        assert!(
            consensus
                .validate_consensus(&BlockHeader::default())
                .is_ok()
        );
    }

    #[test]
    fn pow_rejects_zero_difficulty() {
        let consensus = Consensus::PoW;
        assert!(
            consensus
                .validate_consensus(&BlockHeader::default())
                .is_err()
        );
        let header = BlockHeader {
            difficulty: U256::from(2),
            ..Default::default()
        };
        assert!(consensus.validate_consensus(&header).is_ok());
    }

    #[test]
    fn only_pos_overrides_head_ordering() {
        assert!(Consensus::PoS.is_pos());
        assert!(!Consensus::PoW.is_pos());
        assert!(!Consensus::from_algorithm(ConsensusAlgorithm::Clique).is_pos());
    }
}
