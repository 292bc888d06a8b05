mod engine;
pub mod error;
mod keys;
mod store;

pub use engine::{EngineType, InMemoryEngine, KvOp, StoreEngine};
pub use error::StoreError;
pub use store::{DbOp, DbTarget, Store};
