pub mod discv4;
pub mod eth;
pub mod kademlia;
pub mod mux;
pub mod network;
pub mod rlpx;
pub mod types;
pub(crate) mod utils;

pub use kademlia::KademliaTable;
pub use network::{Network, NetworkConfig};

/// Maximum size of a discovery datagram.
pub const MAX_DISC_PACKET_SIZE: usize = 1280;
