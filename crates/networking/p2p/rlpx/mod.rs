pub mod ecies;
pub mod error;
pub mod frame;
pub mod handshake;
