use crate::{error::MempoolError, vm::StateBackend};
use ethereum_types::{Address, H256};
use ethrune_common::types::{Block, Transaction};
use ethrune_storage::Store;
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, HashSet},
    sync::{Arc, RwLock, RwLockWriteGuard},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct MempoolConfig {
    /// Maximum executable (pending) slots across all accounts.
    pub global_slots: usize,
    /// Maximum future (queued) slots across all accounts.
    pub global_queue: usize,
    pub account_slots: usize,
    /// Future transactions allowed per account.
    pub account_queue: usize,
    /// Hard per-account cap across both pools for remote senders.
    pub max_txs_per_account: usize,
    pub min_gas_price_bump_percent: u64,
    /// Tip floor applied once the pool passes 90% occupancy.
    pub min_gas_price: u64,
    pub tx_max_data_size: usize,
    pub pooled_storage_time_limit: Duration,
    pub handled_cleanup_time_limit: Duration,
    pub rebroadcast_interval: Duration,
    pub min_broadcast_peers: usize,
    pub tx_retrieval_limit: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            global_slots: 4096,
            global_queue: 1024,
            account_slots: 16,
            account_queue: 64,
            max_txs_per_account: 100,
            min_gas_price_bump_percent: 10,
            min_gas_price: 100_000_000,
            tx_max_data_size: 128 * 1024,
            pooled_storage_time_limit: Duration::from_secs(20 * 60),
            handled_cleanup_time_limit: Duration::from_secs(60 * 60),
            rebroadcast_interval: Duration::from_secs(60),
            min_broadcast_peers: 2,
            tx_retrieval_limit: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Pending,
    Queued,
}

#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub hash: H256,
    pub sender: Address,
    pub added_at: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
struct HandledEntry {
    at: u64,
    error: Option<String>,
}

#[derive(Debug, Default)]
struct MempoolInner {
    /// Executable transactions per sender, sorted by nonce.
    pending: HashMap<Address, Vec<MempoolEntry>>,
    /// Future transactions per sender, sorted by nonce.
    queued: HashMap<Address, Vec<MempoolEntry>>,
    hash_index: HashMap<H256, (Address, PoolKind)>,
    account_nonces: HashMap<Address, u64>,
    locals: HashSet<H256>,
    /// Min-heap over (tip, hash); rebuilt after arbitrary removals.
    priced: BinaryHeap<Reverse<(u64, H256)>>,
    pending_count: usize,
    queued_count: usize,
    handled: HashMap<H256, HandledEntry>,
}

/// Dual-pool transaction mempool. Executable transactions (contiguous nonce
/// runs from the account nonce) sit in pending, future ones in queued.
#[derive(Debug)]
pub struct Mempool {
    config: MempoolConfig,
    store: Store,
    state: Arc<dyn StateBackend>,
    inner: RwLock<MempoolInner>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

impl Mempool {
    pub fn new(config: MempoolConfig, store: Store, state: Arc<dyn StateBackend>) -> Self {
        Self {
            config,
            store,
            state,
            inner: RwLock::new(MempoolInner::default()),
        }
    }

    pub fn config(&self) -> &MempoolConfig {
        &self.config
    }

    fn write(&self) -> RwLockWriteGuard<'_, MempoolInner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validates and pools a transaction. Rejections are remembered so the
    /// same hash is not re-processed.
    pub fn add_transaction(
        &self,
        tx: Transaction,
        is_local: bool,
    ) -> Result<H256, MempoolError> {
        let hash = tx.hash();
        let mut inner = self.write();
        if let Some(handled) = inner.handled.get(&hash) {
            if let Some(error) = &handled.error {
                return Err(MempoolError::AlreadyRejected(error.clone()));
            }
        }
        if inner.hash_index.contains_key(&hash) {
            return Ok(hash);
        }

        match self.add_locked(&mut inner, tx, is_local) {
            Ok(hash) => {
                inner.handled.insert(
                    hash,
                    HandledEntry {
                        at: unix_now(),
                        error: None,
                    },
                );
                Ok(hash)
            }
            Err(err) => {
                inner.handled.insert(
                    hash,
                    HandledEntry {
                        at: unix_now(),
                        error: Some(err.to_string()),
                    },
                );
                Err(err)
            }
        }
    }

    fn add_locked(
        &self,
        inner: &mut MempoolInner,
        tx: Transaction,
        is_local: bool,
    ) -> Result<H256, MempoolError> {
        let hash = tx.hash();
        let sender = self.validate(inner, &tx, is_local)?;
        let account_nonce = self.account_nonce(inner, sender);

        // Same sender+nonce only enters via the replacement rule.
        if let Some((kind, position)) = find_by_nonce(inner, sender, tx.nonce()) {
            return self.replace(inner, kind, position, tx, hash, sender, is_local);
        }

        let entry = MempoolEntry {
            hash,
            sender,
            added_at: unix_now(),
            last_error: None,
            tx,
        };

        let next_pending_nonce = inner
            .pending
            .get(&sender)
            .and_then(|list| list.last())
            .map(|last| last.tx.nonce() + 1);
        let executable = entry.tx.nonce() == account_nonce
            || Some(entry.tx.nonce()) == next_pending_nonce;

        if !executable
            && !is_local
            && inner
                .queued
                .get(&sender)
                .is_some_and(|queue| queue.len() >= self.config.account_queue)
        {
            return Err(MempoolError::AccountLimit);
        }

        let tip = entry.tx.tip();
        if executable {
            insert_sorted(inner.pending.entry(sender).or_default(), entry);
            inner.pending_count += 1;
            inner.hash_index.insert(hash, (sender, PoolKind::Pending));
            self.promote_executables(inner, sender);
        } else {
            insert_sorted(inner.queued.entry(sender).or_default(), entry);
            inner.queued_count += 1;
            inner.hash_index.insert(hash, (sender, PoolKind::Queued));
        }
        if is_local {
            inner.locals.insert(hash);
        }
        inner.priced.push(Reverse((tip, hash)));

        self.evict_overflow(inner);
        Ok(hash)
    }

    /// Stateless and stateful admission checks. Returns the recovered sender.
    fn validate(
        &self,
        inner: &mut MempoolInner,
        tx: &Transaction,
        is_local: bool,
    ) -> Result<Address, MempoolError> {
        if !tx.is_signed() {
            return Err(MempoolError::NotSigned);
        }
        if tx.data().len() > self.config.tx_max_data_size {
            return Err(MempoolError::DataTooLarge);
        }
        let sender = tx.sender()?;

        if !is_local {
            let in_pools = inner.pending.get(&sender).map_or(0, Vec::len)
                + inner.queued.get(&sender).map_or(0, Vec::len);
            if in_pools >= self.config.max_txs_per_account {
                return Err(MempoolError::AccountLimit);
            }

            let occupancy = inner.pending_count + inner.queued_count;
            let capacity = self.config.global_slots + self.config.global_queue;
            if occupancy * 10 >= capacity * 9 && tx.tip() <= self.config.min_gas_price {
                return Err(MempoolError::Underpriced);
            }
        }

        let head_hash = self
            .store
            .get_head_block_hash()
            .map_err(MempoolError::StoreError)?
            .ok_or(MempoolError::NoHeadBlock)?;
        let head = self
            .store
            .get_header(head_hash)
            .map_err(MempoolError::StoreError)?
            .ok_or(MempoolError::NoHeadBlock)?;
        if tx.gas_limit() > head.gas_limit {
            return Err(MempoolError::GasLimitExceeded);
        }

        let account_nonce = self.account_nonce(inner, sender);
        if tx.nonce() < account_nonce {
            return Err(MempoolError::NonceTooLow);
        }

        let balance = self
            .state
            .get_account(sender)
            .map(|account| account.balance)
            .unwrap_or_default();
        if balance < tx.max_cost() {
            return Err(MempoolError::InsufficientFunds);
        }

        Ok(sender)
    }

    fn replace(
        &self,
        inner: &mut MempoolInner,
        kind: PoolKind,
        position: usize,
        tx: Transaction,
        hash: H256,
        sender: Address,
        is_local: bool,
    ) -> Result<H256, MempoolError> {
        let bump = self.config.min_gas_price_bump_percent as u128;
        let (old_hash, old_tip, old_max_fee, added_at) = {
            let list = match kind {
                PoolKind::Pending => inner.pending.get(&sender),
                PoolKind::Queued => inner.queued.get(&sender),
            };
            let old = list
                .and_then(|entries| entries.get(position))
                .ok_or(MempoolError::ReplacementUnderpriced)?;
            (old.hash, old.tx.tip(), old.tx.max_fee(), old.added_at)
        };

        let min_tip = old_tip as u128 * (100 + bump) / 100;
        let min_fee = old_max_fee as u128 * (100 + bump) / 100;
        if tx.tip() as u128 <= min_tip || (tx.max_fee() as u128) < min_fee {
            return Err(MempoolError::ReplacementUnderpriced);
        }

        let list = match kind {
            PoolKind::Pending => inner.pending.get_mut(&sender),
            PoolKind::Queued => inner.queued.get_mut(&sender),
        };
        if let Some(entries) = list {
            entries[position] = MempoolEntry {
                hash,
                sender,
                added_at,
                last_error: None,
                tx,
            };
        }
        inner.hash_index.remove(&old_hash);
        inner.locals.remove(&old_hash);
        inner.hash_index.insert(hash, (sender, kind));
        if is_local {
            inner.locals.insert(hash);
        }
        rebuild_priced(inner);
        Ok(hash)
    }

    fn account_nonce(&self, inner: &mut MempoolInner, sender: Address) -> u64 {
        if let Some(nonce) = inner.account_nonces.get(&sender) {
            return *nonce;
        }
        let nonce = self
            .state
            .get_account(sender)
            .map(|account| account.nonce)
            .unwrap_or_default();
        inner.account_nonces.insert(sender, nonce);
        nonce
    }

    /// Moves the contiguous executable prefix of a sender's queue into
    /// pending, dropping stale entries below the account nonce.
    fn promote_executables(&self, inner: &mut MempoolInner, sender: Address) {
        let account_nonce = self.account_nonce(inner, sender);

        let stale: Vec<H256> = inner
            .queued
            .get(&sender)
            .map(|queue| {
                queue
                    .iter()
                    .filter(|entry| entry.tx.nonce() < account_nonce)
                    .map(|entry| entry.hash)
                    .collect()
            })
            .unwrap_or_default();
        for hash in stale {
            self.remove_locked(inner, hash);
        }

        let mut next_nonce = inner
            .pending
            .get(&sender)
            .and_then(|list| list.last())
            .map(|last| last.tx.nonce() + 1)
            .unwrap_or(account_nonce);

        // Only funded entries promote; the rest wait out the gap in queued.
        let balance = self
            .state
            .get_account(sender)
            .map(|account| account.balance)
            .unwrap_or_default();
        let committed = inner
            .pending
            .get(&sender)
            .map(|list| {
                list.iter()
                    .fold(ethereum_types::U256::zero(), |total, entry| {
                        total.saturating_add(entry.tx.max_cost())
                    })
            })
            .unwrap_or_default();
        let mut available = balance.saturating_sub(committed);

        loop {
            let promotable = inner
                .queued
                .get(&sender)
                .and_then(|queue| queue.first())
                .is_some_and(|first| {
                    first.tx.nonce() == next_nonce && first.tx.max_cost() <= available
                });
            if !promotable {
                break;
            }
            let entry = inner
                .queued
                .get_mut(&sender)
                .map(|queue| queue.remove(0));
            let Some(entry) = entry else { break };
            inner.queued_count -= 1;
            available = available.saturating_sub(entry.tx.max_cost());
            inner
                .hash_index
                .insert(entry.hash, (sender, PoolKind::Pending));
            insert_sorted(inner.pending.entry(sender).or_default(), entry);
            inner.pending_count += 1;
            next_nonce += 1;
        }
        if inner
            .queued
            .get(&sender)
            .is_some_and(|queue| queue.is_empty())
        {
            inner.queued.remove(&sender);
        }
    }

    /// Re-checks every pending sender against fresh account state: mined
    /// entries drop, underfunded or gapped ones demote back to queued.
    fn demote_unexecutables(&self, inner: &mut MempoolInner) {
        let senders: Vec<Address> = inner.pending.keys().copied().collect();
        for sender in senders {
            let account = self.state.get_account(sender).unwrap_or_default();
            inner.account_nonces.insert(sender, account.nonce);

            let entries: Vec<MempoolEntry> = inner
                .pending
                .get(&sender)
                .cloned()
                .unwrap_or_default();
            let mut expected = account.nonce;
            let mut balance = account.balance;
            for entry in entries {
                if entry.tx.nonce() < account.nonce {
                    // Mined or stale.
                    self.remove_locked(inner, entry.hash);
                } else if entry.tx.nonce() != expected || balance < entry.tx.max_cost() {
                    self.demote(inner, sender, entry.hash);
                } else {
                    balance -= entry.tx.max_cost();
                    expected = entry.tx.nonce() + 1;
                }
            }
        }
        rebuild_priced(inner);
    }

    fn demote(&self, inner: &mut MempoolInner, sender: Address, hash: H256) {
        let Some(position) = inner
            .pending
            .get(&sender)
            .and_then(|list| list.iter().position(|entry| entry.hash == hash))
        else {
            return;
        };
        let entry = inner
            .pending
            .get_mut(&sender)
            .map(|list| list.remove(position));
        let Some(entry) = entry else { return };
        if inner.pending.get(&sender).is_some_and(Vec::is_empty) {
            inner.pending.remove(&sender);
        }
        inner.pending_count -= 1;
        inner.hash_index.insert(hash, (sender, PoolKind::Queued));
        insert_sorted(inner.queued.entry(sender).or_default(), entry);
        inner.queued_count += 1;
    }

    /// Evicts lowest-tip remote entries while either pool is over capacity.
    fn evict_overflow(&self, inner: &mut MempoolInner) {
        while inner.pending_count > self.config.global_slots {
            if !self.evict_lowest(inner, PoolKind::Pending) {
                break;
            }
        }
        while inner.queued_count > self.config.global_queue {
            if !self.evict_lowest(inner, PoolKind::Queued) {
                break;
            }
        }
    }

    fn evict_lowest(&self, inner: &mut MempoolInner, kind: PoolKind) -> bool {
        let mut skipped = Vec::new();
        let mut victim = None;
        while let Some(Reverse((tip, hash))) = inner.priced.pop() {
            let matches = inner
                .hash_index
                .get(&hash)
                .is_some_and(|(_, entry_kind)| *entry_kind == kind)
                && !inner.locals.contains(&hash);
            if matches {
                victim = Some(hash);
                break;
            }
            skipped.push(Reverse((tip, hash)));
        }
        for entry in skipped {
            inner.priced.push(entry);
        }
        match victim {
            Some(hash) => {
                debug!(hash = %hash, ?kind, "Evicting underpriced transaction");
                self.remove_locked(inner, hash);
                true
            }
            None => false,
        }
    }

    fn remove_locked(&self, inner: &mut MempoolInner, hash: H256) -> Option<MempoolEntry> {
        let (sender, kind) = inner.hash_index.remove(&hash)?;
        inner.locals.remove(&hash);
        let pool = match kind {
            PoolKind::Pending => &mut inner.pending,
            PoolKind::Queued => &mut inner.queued,
        };
        let list = pool.get_mut(&sender)?;
        let position = list.iter().position(|entry| entry.hash == hash)?;
        let entry = list.remove(position);
        if list.is_empty() {
            pool.remove(&sender);
        }
        match kind {
            PoolKind::Pending => inner.pending_count -= 1,
            PoolKind::Queued => inner.queued_count -= 1,
        }
        Some(entry)
    }

    /// Removes a pooled transaction; absent hashes are a no-op.
    pub fn remove_by_hash(&self, hash: H256) {
        let mut inner = self.write();
        if self.remove_locked(&mut inner, hash).is_some() {
            rebuild_priced(&mut inner);
        }
    }

    pub fn contains(&self, hash: H256) -> bool {
        self.read(|inner| inner.hash_index.contains_key(&hash))
    }

    pub fn get_by_hash(&self, hash: H256) -> Option<Transaction> {
        self.read(|inner| {
            let (sender, kind) = inner.hash_index.get(&hash)?;
            let pool = match kind {
                PoolKind::Pending => &inner.pending,
                PoolKind::Queued => &inner.queued,
            };
            pool.get(sender)?
                .iter()
                .find(|entry| entry.hash == hash)
                .map(|entry| entry.tx.clone())
        })
    }

    /// Looks up pooled transactions for a hash list, capped at the
    /// retrieval limit.
    pub fn pooled(&self, hashes: &[H256]) -> Vec<Transaction> {
        hashes
            .iter()
            .take(self.config.tx_retrieval_limit)
            .filter_map(|hash| self.get_by_hash(*hash))
            .collect()
    }

    /// Hashes from the input that are not pooled yet.
    pub fn filter_unknown(&self, hashes: &[H256]) -> Vec<H256> {
        self.read(|inner| {
            hashes
                .iter()
                .filter(|hash| !inner.hash_index.contains_key(hash))
                .copied()
                .collect()
        })
    }

    pub fn pending_hashes(&self) -> Vec<H256> {
        self.read(|inner| {
            inner
                .pending
                .values()
                .flat_map(|list| list.iter().map(|entry| entry.hash))
                .collect()
        })
    }

    pub fn pending_count(&self) -> usize {
        self.read(|inner| inner.pending_count)
    }

    pub fn queued_count(&self) -> usize {
        self.read(|inner| inner.queued_count)
    }

    fn read<T>(&self, reader: impl FnOnce(&MempoolInner) -> T) -> T {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        reader(&inner)
    }

    /// A new canonical block landed: drop its transactions, refresh nonces,
    /// re-partition the pools.
    pub fn on_new_block(&self, block: &Block) {
        let mut inner = self.write();
        for tx in &block.body.transactions {
            self.remove_locked(&mut inner, tx.hash());
        }
        inner.account_nonces.clear();
        self.demote_unexecutables(&mut inner);
        let senders: Vec<Address> = inner.queued.keys().copied().collect();
        for sender in senders {
            self.promote_executables(&mut inner, sender);
        }
        rebuild_priced(&mut inner);
    }

    /// Reorg: transactions mined only on the outgoing chain go back into the
    /// pool as locals, transactions mined on the incoming chain leave it.
    pub fn handle_reorg(&self, old_blocks: &[Block], new_blocks: &[Block], head_root: H256) {
        let mined: HashSet<H256> = new_blocks
            .iter()
            .flat_map(|block| block.body.transactions.iter().map(Transaction::hash))
            .collect();

        if self.state.has_state_root(head_root) {
            self.state.set_state_root(head_root);
        }

        let mut inner = self.write();
        for block in old_blocks {
            for tx in &block.body.transactions {
                let hash = tx.hash();
                if mined.contains(&hash) || inner.hash_index.contains_key(&hash) {
                    continue;
                }
                // Readmitted transactions count as local so they survive
                // eviction until re-mined.
                inner.handled.remove(&hash);
                if let Err(err) = self.add_locked(&mut inner, tx.clone(), true) {
                    debug!(hash = %hash, %err, "Dropping reorged transaction");
                }
            }
        }

        inner.account_nonces.clear();
        for hash in &mined {
            self.remove_locked(&mut inner, *hash);
        }
        self.demote_unexecutables(&mut inner);
        let senders: Vec<Address> = inner.queued.keys().copied().collect();
        for sender in senders {
            self.promote_executables(&mut inner, sender);
        }
        rebuild_priced(&mut inner);
    }

    /// Periodic expiry of pooled entries and handled records.
    pub fn cleanup(&self) {
        let now = unix_now();
        let pooled_deadline = now.saturating_sub(self.config.pooled_storage_time_limit.as_secs());
        let handled_deadline =
            now.saturating_sub(self.config.handled_cleanup_time_limit.as_secs());

        let mut inner = self.write();
        let expired: Vec<H256> = inner
            .pending
            .values()
            .chain(inner.queued.values())
            .flatten()
            .filter(|entry| entry.added_at < pooled_deadline)
            .map(|entry| entry.hash)
            .collect();
        for hash in &expired {
            self.remove_locked(&mut inner, *hash);
        }
        if !expired.is_empty() {
            rebuild_priced(&mut inner);
            debug!(count = expired.len(), "Expired pooled transactions");
        }
        inner
            .handled
            .retain(|_, handled| handled.at >= handled_deadline);
    }

    pub fn log_stats(&self) {
        self.read(|inner| {
            debug!(
                pending = inner.pending_count,
                queued = inner.queued_count,
                handled = inner.handled.len(),
                "Mempool stats"
            );
        });
    }
}

fn insert_sorted(list: &mut Vec<MempoolEntry>, entry: MempoolEntry) {
    let position = list
        .iter()
        .position(|existing| existing.tx.nonce() > entry.tx.nonce())
        .unwrap_or(list.len());
    list.insert(position, entry);
}

fn find_by_nonce(
    inner: &MempoolInner,
    sender: Address,
    nonce: u64,
) -> Option<(PoolKind, usize)> {
    if let Some(position) = inner
        .pending
        .get(&sender)
        .and_then(|list| list.iter().position(|entry| entry.tx.nonce() == nonce))
    {
        return Some((PoolKind::Pending, position));
    }
    inner
        .queued
        .get(&sender)
        .and_then(|list| list.iter().position(|entry| entry.tx.nonce() == nonce))
        .map(|position| (PoolKind::Queued, position))
}

fn rebuild_priced(inner: &mut MempoolInner) {
    inner.priced = inner
        .pending
        .values()
        .chain(inner.queued.values())
        .flatten()
        .map(|entry| Reverse((entry.tx.tip(), entry.hash)))
        .collect();
}
