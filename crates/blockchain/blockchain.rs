pub mod consensus;
pub mod error;
pub mod mempool;
pub mod vm;

use consensus::Consensus;
use error::{ChainError, InvalidBlockError};
use ethereum_types::{H256, U256};
use ethrune_common::{
    constants::{EMPTY_TRIE_ROOT, GAS_LIMIT_BOUND_DIVISOR, MIN_GAS_LIMIT},
    types::{Block, BlockBody, BlockHeader, BlockNumber, Genesis, HardforkManager},
};
use ethrune_crypto::keccak::keccak_hash;
use ethrune_rlp::encode::RLPEncode;
use ethrune_storage::{DbOp, EngineType, Store};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::broadcast;
use tracing::{debug, info};

const CHAIN_EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// Blocks that dropped off the canonical chain during a reorg, in
    /// ascending block-number order.
    DeletedCanonicalBlocks(Vec<Block>),
    NewCanonicalHead { hash: H256, number: BlockNumber },
}

#[derive(Debug, Clone)]
pub struct BlockchainOptions {
    /// Run header/uncle/data checks on put.
    pub validate_blocks: bool,
    /// Invoke the consensus implementation per block.
    pub validate_consensus: bool,
    /// Rewire the hardfork after each canonical head move.
    pub hardfork_by_head_block_number: bool,
}

impl Default for BlockchainOptions {
    fn default() -> Self {
        Self {
            validate_blocks: true,
            validate_consensus: false,
            hardfork_by_head_block_number: false,
        }
    }
}

pub struct BlockchainConfig {
    pub hardfork_manager: Arc<HardforkManager>,
    /// Chain-data store; an in-memory one is used when absent.
    pub store: Option<Store>,
    /// Genesis, one-of: a full block, genesis header values, or just a state
    /// root over the defaults. All absent → defaults.
    pub genesis_block: Option<Block>,
    pub genesis: Option<Genesis>,
    pub genesis_state_root: Option<H256>,
    /// Algorithm name → consensus implementation overrides.
    pub consensus_dict: HashMap<String, Consensus>,
    pub options: BlockchainOptions,
}

impl BlockchainConfig {
    pub fn new(hardfork_manager: Arc<HardforkManager>) -> Self {
        Self {
            hardfork_manager,
            store: None,
            genesis_block: None,
            genesis: None,
            genesis_state_root: None,
            consensus_dict: HashMap::new(),
            options: BlockchainOptions::default(),
        }
    }
}

/// Mutable chain pointers, guarded by the chain lock and snapshotted for
/// rollback around every put.
#[derive(Debug, Clone)]
struct ChainState {
    heads: HashMap<String, H256>,
    head_header_hash: H256,
    head_block_hash: H256,
}

/// Canonical-chain manager: total-difficulty head tracking, reorgs through
/// the common ancestor, and resumable block iterators.
pub struct Blockchain {
    store: Store,
    hardfork_manager: Arc<HardforkManager>,
    consensus: Consensus,
    options: BlockchainOptions,
    genesis_block: Block,
    state: Mutex<ChainState>,
    events: broadcast::Sender<ChainEvent>,
}

impl Blockchain {
    pub fn new(mut config: BlockchainConfig) -> Result<Self, ChainError> {
        let store = config
            .store
            .take()
            .unwrap_or_else(|| Store::new(EngineType::InMemory));
        let algorithm = config.hardfork_manager.consensus_algorithm();
        let consensus = config
            .consensus_dict
            .remove(algorithm.name())
            .unwrap_or_else(|| Consensus::from_algorithm(algorithm));

        let genesis_block = match config.genesis_block {
            Some(block) => block,
            None => {
                let fork = config.hardfork_manager.hardfork_by_block_number(0);
                let state_root = config.genesis_state_root.unwrap_or(EMPTY_TRIE_ROOT);
                let genesis = config.genesis.unwrap_or_default();
                genesis.get_block(fork, state_root)
            }
        };

        consensus.setup(&config.hardfork_manager)?;
        consensus.genesis_init(&genesis_block)?;

        let (events, _) = broadcast::channel(CHAIN_EVENT_CHANNEL_CAPACITY);
        let blockchain = Self {
            store,
            hardfork_manager: config.hardfork_manager,
            consensus,
            options: config.options,
            genesis_block,
            state: Mutex::new(ChainState {
                heads: HashMap::new(),
                head_header_hash: H256::zero(),
                head_block_hash: H256::zero(),
            }),
            events,
        };
        blockchain.init_genesis()?;
        Ok(blockchain)
    }

    fn init_genesis(&self) -> Result<(), ChainError> {
        let mut state = self.lock_state();
        if let Some(stored) = self.store.get_head_header_hash()? {
            state.heads = self.store.get_heads()?;
            state.head_header_hash = stored;
            state.head_block_hash = self.store.get_head_block_hash()?.unwrap_or(stored);
            return Ok(());
        }

        let genesis = &self.genesis_block;
        let hash = genesis.hash();
        info!(hash = %hash, "Initializing chain from genesis");
        self.store.apply_batch(vec![
            DbOp::SetTotalDifficulty {
                number: 0,
                hash,
                td: genesis.header.difficulty,
            },
            DbOp::SetHeader {
                number: 0,
                hash,
                header: genesis.header.clone(),
            },
            DbOp::SetBody {
                number: 0,
                hash,
                body: genesis.body.clone(),
            },
            DbOp::SetHashToNumber { hash, number: 0 },
            DbOp::SetNumberToHash { number: 0, hash },
            DbOp::SetHeads {
                heads: HashMap::new(),
            },
            DbOp::SetHeadHeader { hash },
            DbOp::SetHeadBlock { hash },
        ])?;
        state.head_header_hash = hash;
        state.head_block_hash = hash;
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, ChainState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    pub fn genesis_block(&self) -> &Block {
        &self.genesis_block
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn hardfork_manager(&self) -> &Arc<HardforkManager> {
        &self.hardfork_manager
    }

    pub fn head_header_hash(&self) -> H256 {
        self.lock_state().head_header_hash
    }

    pub fn head_block_hash(&self) -> H256 {
        self.lock_state().head_block_hash
    }

    pub fn get_canonical_head_header(&self) -> Result<BlockHeader, ChainError> {
        let hash = self.head_header_hash();
        self.store
            .get_header(hash)?
            .ok_or(ChainError::NotFoundInDb(hash))
    }

    pub fn get_canonical_head_block(&self) -> Result<Block, ChainError> {
        let hash = self.head_block_hash();
        self.store
            .get_block(hash)?
            .ok_or(ChainError::NotFoundInDb(hash))
    }

    pub fn get_total_difficulty(&self, hash: H256) -> Result<Option<U256>, ChainError> {
        Ok(self.store.get_total_difficulty(hash)?)
    }

    pub fn get_iterator_head(&self, name: &str) -> H256 {
        self.lock_state()
            .heads
            .get(name)
            .copied()
            .unwrap_or_else(|| self.genesis_block.hash())
    }

    pub fn set_iterator_head(&self, name: &str, hash: H256) -> Result<(), ChainError> {
        let mut state = self.lock_state();
        state.heads.insert(name.to_string(), hash);
        self.save_heads(&state)
    }

    pub fn put_block(&self, block: &Block) -> Result<(), ChainError> {
        self.put_block_or_header(&block.header, Some(&block.body))
    }

    pub fn put_header(&self, header: &BlockHeader) -> Result<(), ChainError> {
        self.put_block_or_header(header, None)
    }

    fn put_block_or_header(
        &self,
        header: &BlockHeader,
        body: Option<&BlockBody>,
    ) -> Result<(), ChainError> {
        let mut state = self.lock_state();
        let snapshot = state.clone();

        let result = self.apply_put(&mut state, header, body);
        match result {
            Ok(deleted) => {
                drop(state);
                if !deleted.is_empty() {
                    let _ = self.events.send(ChainEvent::DeletedCanonicalBlocks(deleted));
                }
                Ok(())
            }
            Err(err) => {
                *state = snapshot;
                Err(err)
            }
        }
    }

    /// The put sequence proper. Returns the blocks deleted from the
    /// canonical chain, ascending.
    fn apply_put(
        &self,
        state: &mut ChainState,
        header: &BlockHeader,
        body: Option<&BlockBody>,
    ) -> Result<Vec<Block>, ChainError> {
        let hash = header.hash();
        let number = header.number;
        let is_genesis = number == 0;

        if is_genesis {
            // Re-putting the configured genesis is a no-op, any other
            // purported genesis is refused.
            if hash == self.genesis_block.hash() {
                return Ok(vec![]);
            }
            return Err(ChainError::InvalidGenesis);
        }

        self.verify_chain_id(body)?;

        let parent = self
            .store
            .get_header(header.parent_hash)?
            .ok_or(ChainError::ParentNotFound)?;

        if self.options.validate_blocks {
            self.validate_header(header, &parent)?;
            if let Some(body) = body {
                self.validate_body(header, body)?;
            }
        }
        if self.options.validate_consensus {
            self.consensus.validate_consensus(header)?;
        }

        let parent_td = self
            .store
            .get_total_difficulty(header.parent_hash)?
            .ok_or(ChainError::ParentNotFound)?;
        let td = parent_td + header.difficulty;

        let mut batch = vec![
            DbOp::SetTotalDifficulty { number, hash, td },
            DbOp::SetHeader {
                number,
                hash,
                header: header.clone(),
            },
            DbOp::SetHashToNumber { hash, number },
        ];
        if let Some(body) = body {
            batch.push(DbOp::SetBody {
                number,
                hash,
                body: body.clone(),
            });
        }

        let current_head_td = self
            .store
            .get_total_difficulty(state.head_header_hash)?
            .unwrap_or_default();

        // Canonical iff the TD strictly beats the head, or the chain runs
        // proof-of-stake fiat ordering.
        let canonical = td > current_head_td || self.consensus.is_pos();

        let mut deleted = Vec::new();
        let mut ancestor_headers = Vec::new();
        if canonical {
            let (ancestor, traversed) =
                self.find_common_ancestor(header, state.head_header_hash)?;
            ancestor_headers = traversed;

            state.head_header_hash = hash;
            if body.is_some() {
                state.head_block_hash = hash;
            }

            let stale = self.delete_stale_canonical(&ancestor, &mut batch, &mut deleted)?;
            // Iterator heads stranded on the outgoing chain resume from the
            // common ancestor.
            for head in state.heads.values_mut() {
                if stale.contains(head) {
                    *head = ancestor.hash();
                }
            }
            self.rebuild_canonical(header, &ancestor, &mut batch)?;
        } else {
            let current_block_td = self
                .store
                .get_total_difficulty(state.head_block_hash)?
                .unwrap_or_default();
            if td > current_block_td && body.is_some() {
                state.head_block_hash = hash;
            }
        }

        batch.push(DbOp::SetHeads {
            heads: state.heads.clone(),
        });
        batch.push(DbOp::SetHeadHeader {
            hash: state.head_header_hash,
        });
        batch.push(DbOp::SetHeadBlock {
            hash: state.head_block_hash,
        });

        self.store.apply_batch(batch)?;
        self.consensus.new_block(header, &ancestor_headers)?;

        if canonical {
            debug!(number, hash = %hash, td = %td, "New canonical head");
            let _ = self.events.send(ChainEvent::NewCanonicalHead { hash, number });
            if self.options.hardfork_by_head_block_number {
                self.check_and_transition_hardfork(number)?;
            }
        }

        Ok(deleted)
    }

    fn verify_chain_id(&self, body: Option<&BlockBody>) -> Result<(), ChainError> {
        let Some(body) = body else { return Ok(()) };
        let chain_id = self.hardfork_manager.chain_id();
        for tx in &body.transactions {
            if tx.chain_id().is_some_and(|tx_chain_id| tx_chain_id != chain_id) {
                return Err(ChainError::ChainIdMismatch);
            }
        }
        Ok(())
    }

    fn validate_header(
        &self,
        header: &BlockHeader,
        parent: &BlockHeader,
    ) -> Result<(), ChainError> {
        if header.number != parent.number + 1 {
            return Err(InvalidBlockError::NonSequentialNumber.into());
        }
        if header.timestamp <= parent.timestamp {
            return Err(InvalidBlockError::TimestampNotIncreasing.into());
        }
        if header.gas_used > header.gas_limit {
            return Err(InvalidBlockError::GasUsedAboveLimit.into());
        }
        let bound = parent.gas_limit / GAS_LIMIT_BOUND_DIVISOR;
        if header.gas_limit < MIN_GAS_LIMIT
            || header.gas_limit >= parent.gas_limit + bound
            || header.gas_limit + bound <= parent.gas_limit
        {
            return Err(InvalidBlockError::GasLimitOutOfBounds.into());
        }
        if !matches!(self.consensus, Consensus::PoA { .. }) && header.extra_data.len() > 32 {
            return Err(InvalidBlockError::ExtraDataTooLong.into());
        }
        if header.blob_gas_used.is_some() != header.excess_blob_gas.is_some() {
            return Err(InvalidBlockError::InvalidBlobGasFields.into());
        }
        self.consensus.validate_difficulty(header, parent)?;
        Ok(())
    }

    fn validate_body(&self, header: &BlockHeader, body: &BlockBody) -> Result<(), ChainError> {
        let ommers_hash = keccak_hash(body.ommers.encode_to_vec());
        if ommers_hash != header.ommers_hash {
            return Err(InvalidBlockError::OmmersHashMismatch.into());
        }
        if header.withdrawals_root.is_some() != body.withdrawals.is_some() {
            return Err(InvalidBlockError::InvalidBlobGasFields.into());
        }
        Ok(())
    }

    /// Walks the taller chain down to the shorter's height, then both chains
    /// in lockstep until their hashes meet. Returns the ancestor plus the
    /// deduplicated headers traversed on either side.
    fn find_common_ancestor(
        &self,
        new_header: &BlockHeader,
        head_hash: H256,
    ) -> Result<(BlockHeader, Vec<BlockHeader>), ChainError> {
        let mut traversed = Vec::new();
        let mut new_side = new_header.clone();
        let mut old_side = self
            .store
            .get_header(head_hash)?
            .ok_or(ChainError::AncientHeaderNotFound)?;

        while new_side.number > old_side.number {
            traversed.push(new_side.clone());
            new_side = self.get_parent(&new_side)?;
        }
        while old_side.number > new_side.number {
            traversed.push(old_side.clone());
            old_side = self.get_parent(&old_side)?;
        }
        while new_side.hash() != old_side.hash() {
            traversed.push(new_side.clone());
            traversed.push(old_side.clone());
            new_side = self.get_parent(&new_side)?;
            old_side = self.get_parent(&old_side)?;
        }

        let mut seen = std::collections::HashSet::new();
        traversed.retain(|header| seen.insert(header.hash()));
        Ok((new_side, traversed))
    }

    fn get_parent(&self, header: &BlockHeader) -> Result<BlockHeader, ChainError> {
        self.store
            .get_header(header.parent_hash)?
            .ok_or(ChainError::AncientHeaderNotFound)
    }

    /// Deletes number→hash entries of the outgoing chain above the common
    /// ancestor, collecting the dropped blocks when anyone listens. Returns
    /// the stale hashes.
    fn delete_stale_canonical(
        &self,
        ancestor: &BlockHeader,
        batch: &mut Vec<DbOp>,
        deleted: &mut Vec<Block>,
    ) -> Result<std::collections::HashSet<H256>, ChainError> {
        let collect = self.events.receiver_count() > 0;
        let mut stale = std::collections::HashSet::new();
        let mut number = ancestor.number + 1;
        while let Some(old_hash) = self.store.get_canonical_hash(number)? {
            batch.push(DbOp::DelNumberToHash { number });
            stale.insert(old_hash);
            if collect {
                if let Some(block) = self.store.get_block(old_hash)? {
                    deleted.push(block);
                }
            }
            number += 1;
        }
        Ok(stale)
    }

    /// Rewrites number→hash forward links by walking parent pointers from
    /// the new tip until meeting an entry that is already canonical.
    fn rebuild_canonical(
        &self,
        tip: &BlockHeader,
        ancestor: &BlockHeader,
        batch: &mut Vec<DbOp>,
    ) -> Result<(), ChainError> {
        let mut cursor = tip.clone();
        while cursor.number > ancestor.number {
            if self.store.get_canonical_hash(cursor.number)? == Some(cursor.hash()) {
                break;
            }
            batch.push(DbOp::SetNumberToHash {
                number: cursor.number,
                hash: cursor.hash(),
            });
            cursor = self.get_parent(&cursor)?;
        }
        Ok(())
    }

    fn check_and_transition_hardfork(&self, head_number: BlockNumber) -> Result<(), ChainError> {
        let fork = self.hardfork_manager.set_hardfork_by_block_number(head_number);
        debug!(?fork, head_number, "Hardfork rewired for new head");
        // Consensus implementations must tolerate repeated setup across head
        // moves.
        self.consensus.setup(&self.hardfork_manager)?;
        self.consensus.genesis_init(&self.genesis_block)?;
        Ok(())
    }

    fn save_heads(&self, state: &ChainState) -> Result<(), ChainError> {
        self.store.apply_batch(vec![
            DbOp::SetHeads {
                heads: state.heads.clone(),
            },
            DbOp::SetHeadHeader {
                hash: state.head_header_hash,
            },
            DbOp::SetHeadBlock {
                hash: state.head_block_hash,
            },
        ])?;
        Ok(())
    }

    /// Iterates canonical blocks starting after `heads[name]` (genesis when
    /// unset), calling `on_block(block, reorg_detected)` for each. Detects
    /// reorgs between iterations and restarts from the re-resolved head.
    /// When `release_lock_on_callback` is set the chain lock is dropped
    /// around the callback and the next block's identity re-verified after
    /// re-acquiring; the iterator head is only advanced when it still
    /// matches. The iterator head is persisted on every exit path. Returns
    /// the number of blocks run.
    pub fn iterator<F>(
        &self,
        name: &str,
        mut on_block: F,
        max_blocks: Option<u64>,
        release_lock_on_callback: bool,
    ) -> Result<u64, ChainError>
    where
        F: FnMut(&Block, bool) -> Result<(), ChainError>,
    {
        let mut guard = Some(self.lock_state());
        let result = self.iterate(
            name,
            &mut on_block,
            max_blocks,
            release_lock_on_callback,
            &mut guard,
        );
        let state = guard.take().unwrap_or_else(|| self.lock_state());
        self.save_heads(&state)?;
        result
    }

    fn iterate<'a, F>(
        &'a self,
        name: &str,
        on_block: &mut F,
        max_blocks: Option<u64>,
        release_lock_on_callback: bool,
        guard: &mut Option<MutexGuard<'a, ChainState>>,
    ) -> Result<u64, ChainError>
    where
        F: FnMut(&Block, bool) -> Result<(), ChainError>,
    {
        let genesis_hash = self.genesis_block.hash();
        let head_hash = {
            let state = guard.as_ref().ok_or_else(|| {
                ChainError::Custom("chain lock not held by iterator".to_string())
            })?;
            state.heads.get(name).copied().unwrap_or(genesis_hash)
        };
        let head_number = self
            .store
            .get_block_number(head_hash)?
            .ok_or(ChainError::NotFoundInDb(head_hash))?;

        let mut block_number = head_number + 1;
        let mut last_block: Option<Block> = None;
        let mut blocks_ran = 0u64;

        while max_blocks != Some(blocks_ran) {
            let Some(mut block) = self.store.get_block_by_number(block_number)? else {
                break;
            };

            let mut reorg = false;
            if let Some(last) = &last_block {
                if last.hash() != block.header.parent_hash {
                    // The canonical chain moved under us. The iterator head
                    // was re-pointed by the reorg handler, reload it.
                    reorg = true;
                    let head_hash = guard
                        .as_ref()
                        .and_then(|state| state.heads.get(name).copied())
                        .unwrap_or(genesis_hash);
                    let head_number = self
                        .store
                        .get_block_number(head_hash)?
                        .ok_or(ChainError::NotFoundInDb(head_hash))?;
                    block_number = head_number + 1;
                    match self.store.get_block_by_number(block_number)? {
                        Some(reorged) => block = reorged,
                        None => break,
                    }
                }
            }

            last_block = Some(block.clone());

            if release_lock_on_callback {
                *guard = None;
            }
            let callback_result = on_block(&block, reorg);
            if release_lock_on_callback {
                *guard = Some(self.lock_state());
            }
            callback_result?;

            // A mutation during the unlocked window may have replaced the
            // block we just ran; do not advance the head past a block that
            // is no longer canonical.
            let advance = if release_lock_on_callback {
                self.store.get_canonical_hash(block_number)? == Some(block.hash())
            } else {
                true
            };
            if advance {
                if let Some(state) = guard.as_mut() {
                    state.heads.insert(name.to_string(), block.hash());
                }
                block_number += 1;
            }
            blocks_ran += 1;
        }

        Ok(blocks_ran)
    }

    /// Given hashes ordered oldest→newest, returns the tail not yet in the
    /// DB, found by binary search over hash→number lookups.
    pub fn select_needed_hashes(&self, hashes: &[H256]) -> Result<Vec<H256>, ChainError> {
        let mut lo = 0usize;
        let mut hi = hashes.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.store.has_block(hashes[mid])? {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(hashes[lo..].to_vec())
    }
}

impl std::fmt::Debug for Blockchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blockchain")
            .field("genesis", &self.genesis_block.hash())
            .field("head_header_hash", &self.lock_state().head_header_hash)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethrune_common::types::{ConsensusAlgorithm, Hardfork};

    fn test_manager() -> Arc<HardforkManager> {
        Arc::new(HardforkManager::dev(1, Hardfork::Chainstart))
    }

    fn test_chain() -> Blockchain {
        let mut config = BlockchainConfig::new(test_manager());
        // Keep putting simple: these tests drive TD bookkeeping, not header
        // validation.
        config.options.validate_blocks = false;
        Blockchain::new(config).unwrap()
    }

    fn child(parent: &Block, difficulty: u64, salt: u64) -> Block {
        let header = BlockHeader {
            parent_hash: parent.hash(),
            number: parent.header.number + 1,
            difficulty: U256::from(difficulty),
            timestamp: parent.header.timestamp + 10 + salt,
            gas_limit: parent.header.gas_limit,
            ..Default::default()
        };
        Block::new(header, BlockBody::default())
    }

    #[test]
    fn canonical_extension_updates_head_and_lookups() {
        let chain = test_chain();
        let genesis = chain.genesis_block().clone();
        assert_eq!(genesis.header.difficulty, U256::one());

        let block_1 = child(&genesis, 2, 0);
        chain.put_block(&block_1).unwrap();

        assert_eq!(chain.head_header_hash(), block_1.hash());
        assert_eq!(
            chain.get_total_difficulty(block_1.hash()).unwrap(),
            Some(U256::from(3))
        );
        assert_eq!(
            chain.store().get_canonical_hash(1).unwrap(),
            Some(block_1.hash())
        );
        assert_eq!(
            chain.store().get_block_number(block_1.hash()).unwrap(),
            Some(1)
        );
    }

    #[test]
    fn reorg_moves_to_heavier_chain_and_reports_deletions() {
        let chain = test_chain();
        let mut events = chain.subscribe();
        let genesis = chain.genesis_block().clone();

        let a1 = child(&genesis, 2, 0);
        let a2 = child(&a1, 3, 0);
        chain.put_block(&a1).unwrap();
        chain.put_block(&a2).unwrap();
        assert_eq!(chain.head_header_hash(), a2.hash());

        // Equal TD does not displace the head.
        let b1 = child(&genesis, 5, 1);
        chain.put_block(&b1).unwrap();
        assert_eq!(chain.head_header_hash(), a2.hash());
        assert_eq!(
            chain.get_total_difficulty(b1.hash()).unwrap(),
            Some(U256::from(6))
        );

        // A heavier tip reorgs through the common ancestor (genesis).
        let b2 = child(&b1, 10, 1);
        chain.put_block(&b2).unwrap();
        assert_eq!(chain.head_header_hash(), b2.hash());
        assert_eq!(
            chain.get_total_difficulty(b2.hash()).unwrap(),
            Some(U256::from(16))
        );
        assert_eq!(
            chain.store().get_canonical_hash(1).unwrap(),
            Some(b1.hash())
        );
        assert_eq!(
            chain.store().get_canonical_hash(2).unwrap(),
            Some(b2.hash())
        );

        // Deleted blocks arrive ascending: [a1, a2].
        loop {
            match events.try_recv().unwrap() {
                ChainEvent::DeletedCanonicalBlocks(deleted) => {
                    let hashes: Vec<_> = deleted.iter().map(Block::hash).collect();
                    assert_eq!(hashes, vec![a1.hash(), a2.hash()]);
                    break;
                }
                ChainEvent::NewCanonicalHead { .. } => continue,
            }
        }
    }

    #[test]
    fn canonical_chain_matches_parent_walk_after_reorg() {
        let chain = test_chain();
        let genesis = chain.genesis_block().clone();
        let a1 = child(&genesis, 2, 0);
        let a2 = child(&a1, 2, 0);
        let b1 = child(&genesis, 3, 1);
        let b2 = child(&b1, 3, 1);
        let b3 = child(&b2, 3, 1);
        for block in [&a1, &a2, &b1, &b2, &b3] {
            chain.put_block(block).unwrap();
        }

        // Walk parent pointers from the head down to genesis.
        let mut expected = vec![];
        let mut cursor = chain.get_canonical_head_header().unwrap();
        while cursor.number > 0 {
            expected.push((cursor.number, cursor.hash()));
            cursor = chain.store().get_header(cursor.parent_hash).unwrap().unwrap();
        }
        for (number, hash) in expected {
            assert_eq!(chain.store().get_canonical_hash(number).unwrap(), Some(hash));
        }
    }

    #[test]
    fn putting_existing_genesis_is_a_noop_and_foreign_genesis_errors() {
        let chain = test_chain();
        let genesis = chain.genesis_block().clone();
        chain.put_block(&genesis).unwrap();
        assert_eq!(chain.head_header_hash(), genesis.hash());

        let foreign = Block::new(
            BlockHeader {
                number: 0,
                difficulty: U256::from(9),
                ..Default::default()
            },
            BlockBody::default(),
        );
        assert!(matches!(
            chain.put_block(&foreign),
            Err(ChainError::InvalidGenesis)
        ));
    }

    #[test]
    fn put_with_unknown_parent_fails_and_rolls_back() {
        let chain = test_chain();
        let head_before = chain.head_header_hash();
        let orphan = Block::new(
            BlockHeader {
                parent_hash: H256([7; 32]),
                number: 1,
                difficulty: U256::from(100),
                ..Default::default()
            },
            BlockBody::default(),
        );
        assert!(matches!(
            chain.put_block(&orphan),
            Err(ChainError::ParentNotFound)
        ));
        assert_eq!(chain.head_header_hash(), head_before);
    }

    #[test]
    fn header_only_put_does_not_move_head_block() {
        let chain = test_chain();
        let genesis = chain.genesis_block().clone();
        let block_1 = child(&genesis, 2, 0);
        chain.put_header(&block_1.header).unwrap();
        assert_eq!(chain.head_header_hash(), block_1.hash());
        assert_eq!(chain.head_block_hash(), genesis.hash());
    }

    #[test]
    fn td_of_head_dominates_all_stored_blocks() {
        let chain = test_chain();
        let genesis = chain.genesis_block().clone();
        let mut blocks = vec![genesis.clone()];
        for salt in 0..3u64 {
            let mut parent = genesis.clone();
            for _ in 0..3 {
                let block = child(&parent, 1 + salt, salt);
                chain.put_block(&block).unwrap();
                blocks.push(block.clone());
                parent = block;
            }
        }
        let head_td = chain
            .get_total_difficulty(chain.head_header_hash())
            .unwrap()
            .unwrap();
        for block in blocks {
            let td = chain.get_total_difficulty(block.hash()).unwrap().unwrap();
            assert!(head_td >= td);
        }
    }

    #[test]
    fn iterator_runs_from_genesis_and_resumes() {
        let chain = test_chain();
        let genesis = chain.genesis_block().clone();
        let b1 = child(&genesis, 2, 0);
        let b2 = child(&b1, 2, 0);
        let b3 = child(&b2, 2, 0);
        for block in [&b1, &b2, &b3] {
            chain.put_block(block).unwrap();
        }

        let mut seen = vec![];
        let ran = chain
            .iterator(
                "test",
                |block, _| {
                    seen.push(block.header.number);
                    Ok(())
                },
                Some(2),
                false,
            )
            .unwrap();
        assert_eq!(ran, 2);
        assert_eq!(seen, vec![1, 2]);

        // Resumes where it left off, head persisted across instances.
        let mut seen = vec![];
        let ran = chain
            .iterator(
                "test",
                |block, _| {
                    seen.push(block.header.number);
                    Ok(())
                },
                None,
                false,
            )
            .unwrap();
        assert_eq!(ran, 1);
        assert_eq!(seen, vec![3]);
    }

    #[test]
    fn iterator_detects_reorg_and_restarts_from_moved_head() {
        let chain = test_chain();
        let genesis = chain.genesis_block().clone();
        let a1 = child(&genesis, 2, 0);
        let a2 = child(&a1, 2, 0);
        chain.put_block(&a1).unwrap();
        chain.put_block(&a2).unwrap();

        // Run one block, leaving the iterator head at a1.
        chain
            .iterator("exec", |_, _| Ok(()), Some(1), false)
            .unwrap();

        // Reorg away from the A chain; the stranded iterator head gets
        // re-pointed to the common ancestor by the put.
        let b1 = child(&genesis, 10, 1);
        let b2 = child(&b1, 10, 1);
        chain.put_block(&b1).unwrap();
        chain.put_block(&b2).unwrap();
        assert_eq!(chain.get_iterator_head("exec"), genesis.hash());

        let mut seen = vec![];
        chain
            .iterator(
                "exec",
                |block, _| {
                    seen.push(block.hash());
                    Ok(())
                },
                None,
                false,
            )
            .unwrap();
        assert_eq!(seen, vec![b1.hash(), b2.hash()]);
    }

    #[test]
    fn select_needed_hashes_returns_missing_tail() {
        let chain = test_chain();
        let genesis = chain.genesis_block().clone();
        let b1 = child(&genesis, 2, 0);
        let b2 = child(&b1, 2, 0);
        chain.put_block(&b1).unwrap();

        let unknown_1 = b2.hash();
        let unknown_2 = H256([0xee; 32]);
        let hashes = vec![genesis.hash(), b1.hash(), unknown_1, unknown_2];
        assert_eq!(
            chain.select_needed_hashes(&hashes).unwrap(),
            vec![unknown_1, unknown_2]
        );

        assert!(
            chain
                .select_needed_hashes(&[genesis.hash(), b1.hash()])
                .unwrap()
                .is_empty()
        );
    }
}
