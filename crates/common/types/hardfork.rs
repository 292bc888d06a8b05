use super::block::BlockNumber;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// Hardforks in activation order.
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Hardfork {
    #[default]
    Chainstart = 0,
    Homestead,
    TangerineWhistle,
    SpuriousDragon,
    Byzantium,
    Constantinople,
    Petersburg,
    Istanbul,
    MuirGlacier,
    Berlin,
    London,
    ArrowGlacier,
    GrayGlacier,
    Paris,
    Shanghai,
    Cancun,
    Prague,
}

/// `(hardfork, activation block)` pairs, ascending. `None` means the fork is
/// not scheduled on this chain.
pub type HardforkSchedule = Vec<(Hardfork, Option<BlockNumber>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusAlgorithm {
    Ethash,
    Clique,
    Casper,
}

impl ConsensusAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ethash => "ethash",
            Self::Clique => "clique",
            Self::Casper => "casper",
        }
    }
}

/// Hardfork schedule and chain parameters, frozen at construction except for
/// the current hardfork pointer, which moves with the canonical head when
/// `hardfork_by_head_block_number` is enabled.
#[derive(Debug)]
pub struct HardforkManager {
    chain_id: u64,
    schedule: HardforkSchedule,
    consensus: ConsensusAlgorithm,
    current: RwLock<Hardfork>,
}

impl HardforkManager {
    pub fn new(chain_id: u64, schedule: HardforkSchedule, consensus: ConsensusAlgorithm) -> Self {
        let genesis_fork = Self::fork_for_number(&schedule, 0);
        Self {
            chain_id,
            schedule,
            consensus,
            current: RwLock::new(genesis_fork),
        }
    }

    /// A single-fork development chain: everything up to `fork` active from
    /// genesis, proof-of-work consensus.
    pub fn dev(chain_id: u64, fork: Hardfork) -> Self {
        let schedule = ALL_HARDFORKS
            .iter()
            .map(|candidate| {
                let block = if *candidate <= fork { Some(0) } else { None };
                (*candidate, block)
            })
            .collect();
        Self::new(chain_id, schedule, ConsensusAlgorithm::Ethash)
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn consensus_algorithm(&self) -> ConsensusAlgorithm {
        self.consensus
    }

    pub fn current_hardfork(&self) -> Hardfork {
        *self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The latest scheduled hardfork whose activation block is at or below
    /// the given number.
    pub fn hardfork_by_block_number(&self, number: BlockNumber) -> Hardfork {
        Self::fork_for_number(&self.schedule, number)
    }

    /// Moves the current hardfork pointer to match the given head number and
    /// returns it.
    pub fn set_hardfork_by_block_number(&self, number: BlockNumber) -> Hardfork {
        let fork = self.hardfork_by_block_number(number);
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = fork;
        fork
    }

    pub fn is_activated(&self, fork: Hardfork, number: BlockNumber) -> bool {
        self.activation_block(fork)
            .is_some_and(|activation| activation <= number)
    }

    pub fn activation_block(&self, fork: Hardfork) -> Option<BlockNumber> {
        self.schedule
            .iter()
            .find(|(candidate, _)| *candidate == fork)
            .and_then(|(_, block)| *block)
    }

    /// True when the current hardfork is at or past the given one.
    pub fn gte(&self, fork: Hardfork) -> bool {
        self.current_hardfork() >= fork
    }

    fn fork_for_number(schedule: &HardforkSchedule, number: BlockNumber) -> Hardfork {
        schedule
            .iter()
            .filter(|(_, block)| block.is_some_and(|activation| activation <= number))
            .map(|(fork, _)| *fork)
            .next_back()
            .unwrap_or(Hardfork::Chainstart)
    }
}

pub const ALL_HARDFORKS: [Hardfork; 17] = [
    Hardfork::Chainstart,
    Hardfork::Homestead,
    Hardfork::TangerineWhistle,
    Hardfork::SpuriousDragon,
    Hardfork::Byzantium,
    Hardfork::Constantinople,
    Hardfork::Petersburg,
    Hardfork::Istanbul,
    Hardfork::MuirGlacier,
    Hardfork::Berlin,
    Hardfork::London,
    Hardfork::ArrowGlacier,
    Hardfork::GrayGlacier,
    Hardfork::Paris,
    Hardfork::Shanghai,
    Hardfork::Cancun,
    Hardfork::Prague,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_lookup_picks_latest_activated() {
        let manager = HardforkManager::new(
            1,
            vec![
                (Hardfork::Chainstart, Some(0)),
                (Hardfork::Berlin, Some(10)),
                (Hardfork::London, Some(20)),
                (Hardfork::Paris, None),
            ],
            ConsensusAlgorithm::Ethash,
        );
        assert_eq!(manager.hardfork_by_block_number(0), Hardfork::Chainstart);
        assert_eq!(manager.hardfork_by_block_number(10), Hardfork::Berlin);
        assert_eq!(manager.hardfork_by_block_number(19), Hardfork::Berlin);
        assert_eq!(manager.hardfork_by_block_number(500), Hardfork::London);
    }

    #[test]
    fn set_hardfork_moves_the_pointer() {
        let manager = HardforkManager::new(
            1,
            vec![(Hardfork::Chainstart, Some(0)), (Hardfork::London, Some(5))],
            ConsensusAlgorithm::Ethash,
        );
        assert_eq!(manager.current_hardfork(), Hardfork::Chainstart);
        assert!(!manager.gte(Hardfork::London));
        manager.set_hardfork_by_block_number(7);
        assert_eq!(manager.current_hardfork(), Hardfork::London);
        assert!(manager.gte(Hardfork::Berlin));
    }

    #[test]
    fn dev_schedule_activates_everything_up_to_fork() {
        let manager = HardforkManager::dev(1337, Hardfork::London);
        assert!(manager.is_activated(Hardfork::London, 0));
        assert!(!manager.is_activated(Hardfork::Shanghai, 0));
    }
}
