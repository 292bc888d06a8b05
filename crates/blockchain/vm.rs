use ethereum_types::{Address, H256};
use ethrune_common::types::Account;
use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Arc, RwLock},
};

/// The external state collaborator (EVM/trie side). The chain core only
/// reads accounts and repositions the backend on a state root.
pub trait StateBackend: Debug + Send + Sync {
    fn get_account(&self, address: Address) -> Option<Account>;

    /// Repositions reads on the given root. Fails when the root is unknown.
    fn set_state_root(&self, root: H256) -> bool;

    fn get_state_root(&self) -> H256;

    fn has_state_root(&self, root: H256) -> bool;
}

/// State backend over plain maps, one account set per known root.
#[derive(Debug, Default)]
pub struct InMemoryState {
    inner: RwLock<InMemoryStateInner>,
}

#[derive(Debug, Default)]
struct InMemoryStateInner {
    roots: HashMap<H256, HashMap<Address, Account>>,
    current: H256,
}

impl InMemoryState {
    pub fn new() -> Arc<Self> {
        let state = Self::default();
        state
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .roots
            .insert(H256::zero(), HashMap::new());
        Arc::new(state)
    }

    /// Writes an account under the current root.
    pub fn set_account(&self, address: Address, account: Account) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = inner.current;
        inner.roots.entry(current).or_default().insert(address, account);
    }

    /// Snapshots the current accounts under a new root.
    pub fn commit_root(&self, root: H256) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let accounts = inner.roots.get(&inner.current).cloned().unwrap_or_default();
        inner.roots.insert(root, accounts);
        inner.current = root;
    }
}

impl StateBackend for InMemoryState {
    fn get_account(&self, address: Address) -> Option<Account> {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.roots.get(&inner.current)?.get(&address).copied()
    }

    fn set_state_root(&self, root: H256) -> bool {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if inner.roots.contains_key(&root) {
            inner.current = root;
            true
        } else {
            false
        }
    }

    fn get_state_root(&self) -> H256 {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .current
    }

    fn has_state_root(&self, root: H256) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .roots
            .contains_key(&root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::U256;

    #[test]
    fn accounts_follow_the_selected_root() {
        let state = InMemoryState::new();
        let address = Address::from_low_u64_be(1);
        state.set_account(address, Account::new(1, U256::from(100)));
        let first_root = H256([1; 32]);
        state.commit_root(first_root);

        state.set_account(address, Account::new(2, U256::from(50)));
        let second_root = H256([2; 32]);
        state.commit_root(second_root);

        assert_eq!(state.get_account(address).unwrap().nonce, 2);
        assert!(state.set_state_root(first_root));
        assert_eq!(state.get_account(address).unwrap().nonce, 1);
        assert!(!state.set_state_root(H256([9; 32])));
        assert!(state.has_state_root(second_root));
    }
}
