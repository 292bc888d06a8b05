// Keep H256, H160, H512, Address, U256 and friends from ethereum_types
pub use bytes::Bytes;
pub use ethereum_types::{Address, H128, H256, H512, U256, U512};

pub mod constants;
pub mod types;
