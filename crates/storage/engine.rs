use crate::error::StoreError;
use std::{
    collections::BTreeMap,
    fmt::Debug,
    sync::{Arc, Mutex},
};

/// A single engine-level operation. Batches of these apply atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An ordered byte-KV with atomic batches. Chain data sits behind this
/// trait so alternative engines can be injected.
pub trait StoreEngine: Debug + Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError>;

    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    /// Applies all operations in order; the whole batch is visible at once.
    fn apply_batch(&self, ops: Vec<KvOp>) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineType {
    InMemory,
}

/// The default engine: a map under a mutex. Batch atomicity falls out of
/// holding the lock for the whole batch.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEngine {
    inner: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>, StoreError> {
        self.inner
            .lock()
            .map_err(|err| StoreError::LockPoisoned(err.to_string()))
    }
}

impl StoreEngine for InMemoryEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError> {
        self.lock()?.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn apply_batch(&self, ops: Vec<KvOp>) -> Result<(), StoreError> {
        let mut map = self.lock()?;
        for op in ops {
            match op {
                KvOp::Put { key, value } => {
                    map.insert(key, value);
                }
                KvOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let engine = InMemoryEngine::new();
        engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
        engine.delete(b"a").unwrap();
        assert_eq!(engine.get(b"a").unwrap(), None);
    }

    #[test]
    fn batch_applies_in_order() {
        let engine = InMemoryEngine::new();
        engine
            .apply_batch(vec![
                KvOp::Put {
                    key: b"k".to_vec(),
                    value: b"1".to_vec(),
                },
                KvOp::Delete { key: b"k".to_vec() },
                KvOp::Put {
                    key: b"k".to_vec(),
                    value: b"2".to_vec(),
                },
            ])
            .unwrap();
        assert_eq!(engine.get(b"k").unwrap(), Some(b"2".to_vec()));
    }
}
