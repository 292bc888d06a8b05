mod account;
mod block;
mod genesis;
mod hardfork;
mod transaction;

pub use account::Account;
pub use block::{Block, BlockBody, BlockHash, BlockHeader, BlockNumber, Withdrawal};
pub use genesis::{Genesis, GenesisError};
pub use hardfork::{ConsensusAlgorithm, Hardfork, HardforkManager, HardforkSchedule};
pub use transaction::{
    AccessList, Eip1559Transaction, Eip2930Transaction, Eip4844Transaction, LegacyTransaction,
    Transaction, TxKind, TxType,
};
