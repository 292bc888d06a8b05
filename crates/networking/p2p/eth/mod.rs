pub mod messages;

use crate::mux::{MuxError, MuxStream, MuxStreamWriter};
use bytes::Bytes;
use ethereum_types::{H256, H512, U256};
use ethrune_blockchain::{Blockchain, error::ChainError, mempool::Mempool};
use ethrune_common::types::{Block, BlockHeader, Transaction};
use ethrune_rlp::error::RLPDecodeError;
use messages::{
    GetBlockBodies, GetBlockHeaders, GetPooledTransactions, HashOrNumber, Message,
    NewBlockMessage, NewPooledTransactionHashes, PooledTransactions, Receipts, StatusMessage,
    Transactions,
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::{mpsc, oneshot}, time::timeout};
use tracing::debug;

/// Supported protocol versions, best first.
pub const SUPPORTED_VERSIONS: [u32; 3] = [68, 67, 66];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Hashes per announcement message.
pub const MAX_HASHES_PER_ANNOUNCEMENT: usize = 4096;
/// Remembered per-peer tx/block hashes.
const KNOWN_CACHE_CAPACITY: usize = 32 * 1024;

pub fn protocol_token(version: u32) -> String {
    format!("/eth/{version}/1.0.0")
}

pub fn version_from_token(token: &str) -> Option<u32> {
    let rest = token.strip_prefix("/eth/")?;
    let (version, tail) = rest.split_once('/')?;
    if tail != "1.0.0" {
        return None;
    }
    version.parse().ok()
}

pub fn supported_tokens() -> Vec<String> {
    SUPPORTED_VERSIONS.iter().copied().map(protocol_token).collect()
}

#[derive(Debug, thiserror::Error)]
pub enum EthProtocolError {
    #[error("Stream error: {0}")]
    Mux(#[from] MuxError),
    #[error("Decoding failed: {0}")]
    Decode(#[from] RLPDecodeError),
    #[error("Genesis hash mismatch")]
    GenesisMismatch,
    #[error("Chain id mismatch")]
    ChainIdMismatch,
    #[error("Peer closed the stream")]
    Disconnected,
    #[error("Request timed out")]
    RequestTimeout,
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
}

/// Signals the engine raises for the node layer.
#[derive(Debug)]
pub enum EthEvent {
    /// Valid transactions accepted from the peer, for gossip fan-out.
    TransactionsReceived {
        peer_id: H512,
        transactions: Vec<Transaction>,
    },
    /// A block the peer pushed went in; re-propagate.
    NewBlock { peer_id: H512, block: Box<Block> },
    /// Announced hashes we do not have yet, oldest first.
    BlockHashesNeeded { peer_id: H512, hashes: Vec<H256> },
}

#[derive(Debug, Default)]
struct KnownCache {
    set: HashSet<H256>,
    order: VecDeque<H256>,
}

impl KnownCache {
    /// Remembers a hash; repeat inserts are no-ops. Oldest entries fall out
    /// at capacity.
    fn insert(&mut self, hash: H256) -> bool {
        if !self.set.insert(hash) {
            return false;
        }
        self.order.push_back(hash);
        while self.order.len() > KNOWN_CACHE_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }

    fn contains(&self, hash: &H256) -> bool {
        self.set.contains(hash)
    }
}

/// Per-peer protocol engine: the status handshake, request/response
/// correlation, serving chain data, and pushing gossip.
pub struct EthProtocol {
    peer_id: H512,
    version: u32,
    blockchain: Arc<Blockchain>,
    mempool: Arc<Mempool>,
    writer: MuxStreamWriter,
    pending_requests: Mutex<HashMap<u64, oneshot::Sender<Message>>>,
    known_txs: Mutex<KnownCache>,
    known_blocks: Mutex<KnownCache>,
    events: mpsc::Sender<EthEvent>,
}

impl EthProtocol {
    /// Exchanges STATUS over a freshly negotiated stream and returns the
    /// engine plus the stream to drive [`run`](Self::run) with.
    pub async fn connect(
        mut stream: MuxStream,
        version: u32,
        peer_id: H512,
        blockchain: Arc<Blockchain>,
        mempool: Arc<Mempool>,
        events: mpsc::Sender<EthEvent>,
    ) -> Result<(Arc<Self>, MuxStream), EthProtocolError> {
        let engine = Arc::new(Self {
            peer_id,
            version,
            blockchain,
            mempool,
            writer: stream.writer(),
            pending_requests: Mutex::new(HashMap::new()),
            known_txs: Mutex::new(KnownCache::default()),
            known_blocks: Mutex::new(KnownCache::default()),
            events,
        });

        engine.send(Message::Status(engine.local_status()?)).await?;
        let first = timeout(REQUEST_TIMEOUT, stream.read())
            .await
            .map_err(|_| EthProtocolError::RequestTimeout)?
            .ok_or(EthProtocolError::Disconnected)?;
        match Message::decode(&first, version)? {
            Message::Status(status) => engine.validate_status(&status)?,
            other => {
                return Err(EthProtocolError::UnexpectedMessage(format!(
                    "expected Status, got {other}"
                )));
            }
        }
        Ok((engine, stream))
    }

    fn local_status(&self) -> Result<StatusMessage, EthProtocolError> {
        let best_hash = self.blockchain.head_header_hash();
        let total_difficulty = self
            .blockchain
            .get_total_difficulty(best_hash)?
            .unwrap_or_default();
        Ok(StatusMessage {
            version: self.version,
            chain_id: self.blockchain.hardfork_manager().chain_id(),
            total_difficulty,
            best_hash,
            genesis_hash: self.blockchain.genesis_block().hash(),
        })
    }

    fn validate_status(&self, status: &StatusMessage) -> Result<(), EthProtocolError> {
        if status.genesis_hash != self.blockchain.genesis_block().hash() {
            return Err(EthProtocolError::GenesisMismatch);
        }
        if status.chain_id != self.blockchain.hardfork_manager().chain_id() {
            return Err(EthProtocolError::ChainIdMismatch);
        }
        // The version field is informational; negotiation already fixed it.
        Ok(())
    }

    pub fn peer_id(&self) -> H512 {
        self.peer_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Dispatch loop. Returns when the peer closes. Unknown message codes
    /// are logged and skipped; malformed payloads reset the stream and
    /// surface as errors.
    pub async fn run(self: Arc<Self>, mut stream: MuxStream) -> Result<(), EthProtocolError> {
        loop {
            let Some(data) = stream.read().await else {
                return Ok(());
            };
            if data.first().is_some_and(|code| !Message::known_code(*code)) {
                debug!(peer = %self.peer_id, code = data[0], "Unknown message code, ignoring");
                continue;
            }
            let message = match Message::decode(&data, self.version) {
                Ok(message) => message,
                Err(err) => {
                    stream.reset().await;
                    return Err(err.into());
                }
            };
            debug!(peer = %self.peer_id, %message, "Received protocol message");

            if let Some(id) = message.request_id() {
                let waiter = self.lock_pending().remove(&id);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(message);
                    continue;
                }
            }
            self.handle_message(message).await?;
        }
    }

    async fn handle_message(&self, message: Message) -> Result<(), EthProtocolError> {
        match message {
            Message::Status(_) => {
                debug!(peer = %self.peer_id, "Repeated status, ignoring");
            }
            Message::GetBlockHeaders(request) => {
                let block_headers = request.fetch_headers(self.blockchain.store());
                self.send(Message::BlockHeaders(messages::BlockHeaders {
                    id: request.id,
                    block_headers,
                }))
                .await?;
            }
            Message::GetBlockBodies(request) => {
                let block_bodies = request.fetch_bodies(self.blockchain.store());
                self.send(Message::BlockBodies(messages::BlockBodies {
                    id: request.id,
                    block_bodies,
                }))
                .await?;
            }
            Message::GetReceipts(request) => {
                // Receipts live with the execution layer; answer with empty
                // lists per requested block.
                let receipts = vec![vec![]; request.block_hashes.len()];
                self.send(Message::Receipts(Receipts {
                    id: request.id,
                    receipts,
                }))
                .await?;
            }
            Message::GetPooledTransactions(request) => {
                let transactions = self.mempool.pooled(&request.hashes);
                self.send(Message::PooledTransactions(PooledTransactions {
                    id: request.id,
                    transactions,
                }))
                .await?;
            }
            Message::Transactions(Transactions { transactions }) => {
                self.accept_transactions(transactions).await;
            }
            Message::PooledTransactions(response) => {
                self.accept_transactions(response.transactions).await;
            }
            Message::NewPooledTransactionHashes(announcement) => {
                self.handle_tx_announcement(announcement).await?;
            }
            Message::NewBlockHashes(announcement) => {
                let mut announced = announcement.block_hashes;
                announced.sort_by_key(|(_, number)| *number);
                let hashes: Vec<H256> = announced.into_iter().map(|(hash, _)| hash).collect();
                let needed = self.blockchain.select_needed_hashes(&hashes)?;
                if !needed.is_empty() {
                    let _ = self
                        .events
                        .send(EthEvent::BlockHashesNeeded {
                            peer_id: self.peer_id,
                            hashes: needed,
                        })
                        .await;
                }
            }
            Message::NewBlock(announcement) => {
                self.handle_new_block(*announcement).await?;
            }
            other @ (Message::BlockHeaders(_) | Message::BlockBodies(_) | Message::Receipts(_)) => {
                debug!(peer = %self.peer_id, %other, "Response with no pending request");
            }
        }
        Ok(())
    }

    async fn accept_transactions(&self, transactions: Vec<Transaction>) {
        let mut accepted = Vec::new();
        for tx in transactions {
            let hash = tx.hash();
            self.lock_known_txs().insert(hash);
            match self.mempool.add_transaction(tx.clone(), false) {
                Ok(_) => accepted.push(tx),
                Err(err) => debug!(peer = %self.peer_id, %hash, %err, "Rejected transaction"),
            }
        }
        if !accepted.is_empty() {
            let _ = self
                .events
                .send(EthEvent::TransactionsReceived {
                    peer_id: self.peer_id,
                    transactions: accepted,
                })
                .await;
        }
    }

    async fn handle_tx_announcement(
        &self,
        announcement: NewPooledTransactionHashes,
    ) -> Result<(), EthProtocolError> {
        let unknown = self.mempool.filter_unknown(&announcement.hashes);
        let limit = self.mempool.config().tx_retrieval_limit;
        let hashes: Vec<H256> = unknown.into_iter().take(limit).collect();
        if hashes.is_empty() {
            return Ok(());
        }
        // The answer correlates by id and lands in the pool on arrival.
        self.send(Message::GetPooledTransactions(GetPooledTransactions {
            id: rand::random(),
            hashes,
        }))
        .await
    }

    async fn handle_new_block(&self, announcement: NewBlockMessage) -> Result<(), EthProtocolError> {
        let block = announcement.block;
        let hash = block.hash();
        self.lock_known_blocks().insert(hash);

        // The announced TD must be consistent with what we know of the
        // parent.
        if let Some(parent_td) = self.blockchain.get_total_difficulty(block.header.parent_hash)? {
            let expected = parent_td + block.header.difficulty;
            if announcement.total_difficulty != expected {
                debug!(peer = %self.peer_id, %hash, "Announced TD mismatch, dropping block");
                return Ok(());
            }
        }

        match self.blockchain.put_block(&block) {
            Ok(()) => {
                self.mempool.on_new_block(&block);
                let _ = self
                    .events
                    .send(EthEvent::NewBlock {
                        peer_id: self.peer_id,
                        block: Box::new(block),
                    })
                    .await;
            }
            // A bad single block is recoverable; the peer stays.
            Err(err) => debug!(peer = %self.peer_id, %hash, %err, "Rejected pushed block"),
        }
        Ok(())
    }

    // -- outbound requests --------------------------------------------------

    async fn request(&self, message: Message, id: u64) -> Result<Message, EthProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id, tx);
        self.send(message).await?;
        match timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            _ => {
                self.lock_pending().remove(&id);
                Err(EthProtocolError::RequestTimeout)
            }
        }
    }

    pub async fn get_block_headers(
        &self,
        start_block: HashOrNumber,
        limit: u64,
        skip: u64,
        reverse: bool,
    ) -> Result<Vec<BlockHeader>, EthProtocolError> {
        let id = rand::random();
        let request = Message::GetBlockHeaders(GetBlockHeaders {
            id,
            start_block,
            limit,
            skip,
            reverse,
        });
        match self.request(request, id).await? {
            Message::BlockHeaders(response) => Ok(response.block_headers),
            other => Err(EthProtocolError::UnexpectedMessage(other.to_string())),
        }
    }

    pub async fn get_block_bodies(
        &self,
        block_hashes: Vec<H256>,
    ) -> Result<Vec<ethrune_common::types::BlockBody>, EthProtocolError> {
        let id = rand::random();
        let request = Message::GetBlockBodies(GetBlockBodies { id, block_hashes });
        match self.request(request, id).await? {
            Message::BlockBodies(response) => Ok(response.block_bodies),
            other => Err(EthProtocolError::UnexpectedMessage(other.to_string())),
        }
    }

    // -- gossip -------------------------------------------------------------

    /// Sends full transactions the peer has not seen yet.
    pub async fn send_transactions(&self, transactions: &[Transaction]) -> Result<(), EthProtocolError> {
        let fresh: Vec<Transaction> = transactions
            .iter()
            .filter(|tx| self.lock_known_txs().insert(tx.hash()))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }
        self.send(Message::Transactions(Transactions {
            transactions: fresh,
        }))
        .await
    }

    /// Announces transaction hashes, batched.
    pub async fn announce_transactions(
        &self,
        entries: &[(H256, u8, u32)],
    ) -> Result<(), EthProtocolError> {
        let fresh: Vec<&(H256, u8, u32)> = entries
            .iter()
            .filter(|(hash, _, _)| self.lock_known_txs().insert(*hash))
            .collect();
        for batch in fresh.chunks(MAX_HASHES_PER_ANNOUNCEMENT) {
            let announcement = NewPooledTransactionHashes {
                tx_types: batch.iter().map(|(_, tx_type, _)| *tx_type).collect(),
                tx_sizes: batch.iter().map(|(_, _, size)| *size).collect(),
                hashes: batch.iter().map(|(hash, _, _)| *hash).collect(),
            };
            self.send(Message::NewPooledTransactionHashes(announcement))
                .await?;
        }
        Ok(())
    }

    pub async fn send_new_block(&self, block: &Block, total_difficulty: U256) -> Result<(), EthProtocolError> {
        if !self.lock_known_blocks().insert(block.hash()) {
            return Ok(());
        }
        self.send(Message::NewBlock(Box::new(NewBlockMessage {
            block: block.clone(),
            total_difficulty,
        })))
        .await
    }

    pub fn knows_block(&self, hash: &H256) -> bool {
        self.lock_known_blocks().contains(hash)
    }

    pub fn knows_tx(&self, hash: &H256) -> bool {
        self.lock_known_txs().contains(hash)
    }

    async fn send(&self, message: Message) -> Result<(), EthProtocolError> {
        let mut buf = Vec::new();
        message.encode(&mut buf, self.version);
        self.writer.write(Bytes::from(buf)).await?;
        Ok(())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Message>>> {
        self.pending_requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_known_txs(&self) -> std::sync::MutexGuard<'_, KnownCache> {
        self.known_txs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_known_blocks(&self) -> std::sync::MutexGuard<'_, KnownCache> {
        self.known_blocks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
