use crate::{
    discv4::{Discovery, DiscoveryConfig, DiscoveryError, DiscoveryEvent},
    eth::{EthEvent, EthProtocol, EthProtocolError, supported_tokens, version_from_token},
    kademlia::KademliaTable,
    mux::{MuxError, Multiplexer, select},
    rlpx::{
        error::RLPxError,
        frame::FrameCodec,
        handshake::{Handshake, LEGACY_ACK_SIZE, LEGACY_AUTH_SIZE, read_handshake_message},
    },
    types::Node,
    utils::{log_peer_debug, log_peer_warn},
};
use ethereum_types::{H256, H512};
use ethrune_blockchain::{Blockchain, ChainEvent, error::MempoolError, mempool::Mempool};
use ethrune_common::types::{Block, Transaction};
use ethrune_crypto::secp::{pk2id, public_key};
use secp256k1::SecretKey;
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Mutex, mpsc},
    time::timeout,
};
use tokio_util::{codec::Framed, sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

const STATS_INTERVAL: Duration = Duration::from_secs(20);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(20 * 60);

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("Transport error: {0}")]
    Rlpx(#[from] RLPxError),
    #[error("Stream error: {0}")]
    Mux(#[from] MuxError),
    #[error("Protocol error: {0}")]
    Eth(#[from] EthProtocolError),
    #[error("Mempool error: {0}")]
    Mempool(#[from] MempoolError),
    #[error("Handshake timed out")]
    HandshakeTimeout,
    #[error("Dial timed out")]
    DialTimeout,
    #[error("No inbound protocol stream")]
    NoProtocolStream,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub bootnodes: Vec<Node>,
    pub discovery: DiscoveryConfig,
    pub require_eip8: bool,
    pub handshake_timeout: Duration,
    pub dial_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            tcp_port: 0,
            udp_port: 0,
            bootnodes: vec![],
            discovery: DiscoveryConfig::default(),
            require_eip8: true,
            handshake_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(30),
        }
    }
}

/// The node: discovery feeding the peer table, the authenticated transport,
/// per-peer protocol engines, and the gossip loops between mempool, chain
/// and peers.
pub struct Network {
    secret_key: SecretKey,
    config: NetworkConfig,
    blockchain: Arc<Blockchain>,
    mempool: Arc<Mempool>,
    table: Arc<Mutex<KademliaTable>>,
    peers: Arc<Mutex<HashMap<H512, Arc<EthProtocol>>>>,
    eth_events_tx: mpsc::Sender<EthEvent>,
    eth_events_rx: Mutex<Option<mpsc::Receiver<EthEvent>>>,
    local_node: Mutex<Node>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Network {
    pub fn new(
        secret_key: SecretKey,
        config: NetworkConfig,
        blockchain: Arc<Blockchain>,
        mempool: Arc<Mempool>,
    ) -> Arc<Self> {
        let node_id = pk2id(&public_key(&secret_key));
        let local_node = Node::new(config.ip, config.udp_port, config.tcp_port, node_id);
        let (eth_events_tx, eth_events_rx) = mpsc::channel(1024);
        Arc::new(Self {
            secret_key,
            config,
            blockchain,
            mempool,
            table: Arc::new(Mutex::new(KademliaTable::new(node_id))),
            peers: Arc::new(Mutex::new(HashMap::new())),
            eth_events_tx,
            eth_events_rx: Mutex::new(Some(eth_events_rx)),
            local_node: Mutex::new(local_node),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub async fn local_node(&self) -> Node {
        *self.local_node.lock().await
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Binds the listeners and spawns every service loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), NetworkError> {
        let listener = TcpListener::bind(SocketAddr::new(self.config.ip, self.config.tcp_port))
            .await?;
        let tcp_addr = listener.local_addr()?;
        {
            let mut local = self.local_node.lock().await;
            local.tcp_port = tcp_addr.port();
        }

        let discovery = {
            let local = self.local_node.lock().await;
            Discovery::try_new(
                *local,
                self.secret_key,
                self.table.clone(),
                self.config.discovery.clone(),
                self.cancel.child_token(),
            )
            .await?
        };
        {
            let udp_addr = discovery.local_addr()?;
            let mut local = self.local_node.lock().await;
            local.udp_port = udp_addr.port();
        }
        info!(node = %self.local_node.lock().await.enode_url(), "Node listening");

        let mut discovery_events = discovery.subscribe();
        discovery.start(self.config.bootnodes.clone());

        // Dial peers the discovery table confirms.
        self.tracker.spawn({
            let this = self.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = this.cancel.cancelled() => return,
                        event = discovery_events.recv() => match event {
                            Ok(DiscoveryEvent::PeerAdded(node)) => {
                                let this = this.clone();
                                tokio::spawn(async move {
                                    if let Err(err) = this.connect_to_peer(node).await {
                                        log_peer_debug(&node, &format!("Dial failed: {err}"));
                                    }
                                });
                            }
                            Ok(DiscoveryEvent::PeerNew(_)) => {}
                            Err(_) => return,
                        },
                    }
                }
            }
        });

        // Accept inbound transport connections.
        self.tracker.spawn({
            let this = self.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = this.cancel.cancelled() => return,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, remote)) => {
                                let this = this.clone();
                                tokio::spawn(async move {
                                    if let Err(err) = this.handle_inbound(stream).await {
                                        debug!("Inbound connection from {remote} failed: {err}");
                                    }
                                });
                            }
                            Err(err) => {
                                warn!("Accept failed: {err}");
                            }
                        },
                    }
                }
            }
        });

        // Protocol events drive gossip.
        if let Some(mut events) = self.eth_events_rx.lock().await.take() {
            self.tracker.spawn({
                let this = self.clone();
                async move {
                    loop {
                        tokio::select! {
                            _ = this.cancel.cancelled() => return,
                            event = events.recv() => match event {
                                Some(event) => this.handle_eth_event(event).await,
                                None => return,
                            },
                        }
                    }
                }
            });
        }

        // Chain events drive mempool reorg handling.
        self.tracker.spawn({
            let this = self.clone();
            let mut chain_events = self.blockchain.subscribe();
            async move {
                loop {
                    tokio::select! {
                        _ = this.cancel.cancelled() => return,
                        event = chain_events.recv() => match event {
                            Ok(ChainEvent::DeletedCanonicalBlocks(old_blocks)) => {
                                this.handle_reorg(old_blocks).await;
                            }
                            Ok(ChainEvent::NewCanonicalHead { .. }) => {}
                            Err(_) => return,
                        },
                    }
                }
            }
        });

        // Periodic mempool housekeeping and re-broadcast.
        self.tracker.spawn({
            let this = self.clone();
            async move {
                let rebroadcast = this.mempool.config().rebroadcast_interval;
                let mut rebroadcast_tick = tokio::time::interval(rebroadcast);
                let mut cleanup_tick = tokio::time::interval(CLEANUP_INTERVAL);
                let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
                loop {
                    tokio::select! {
                        _ = this.cancel.cancelled() => return,
                        _ = rebroadcast_tick.tick() => this.rebroadcast_pending().await,
                        _ = cleanup_tick.tick() => this.mempool.cleanup(),
                        _ = stats_tick.tick() => this.mempool.log_stats(),
                    }
                }
            }
        });

        Ok(())
    }

    /// Dials a peer and runs the full stack over the connection: transport
    /// handshake, stream negotiation, protocol handshake.
    pub async fn connect_to_peer(self: &Arc<Self>, node: Node) -> Result<(), NetworkError> {
        if self.peers.lock().await.contains_key(&node.node_id) {
            return Ok(());
        }
        let mut stream = timeout(self.config.dial_timeout, TcpStream::connect(node.tcp_addr()))
            .await
            .map_err(|_| NetworkError::DialTimeout)??;

        let mut handshake = Handshake::new(self.secret_key, self.config.require_eip8);
        let secrets = timeout(self.config.handshake_timeout, async {
            let auth = handshake.encode_auth(node.node_id)?;
            use tokio::io::AsyncWriteExt;
            stream.write_all(&auth).await.map_err(RLPxError::from)?;
            let ack = read_handshake_message(&mut stream, LEGACY_ACK_SIZE).await?;
            handshake.decode_ack(&ack)?;
            handshake.derive_secrets(true)
        })
        .await
        .map_err(|_| NetworkError::HandshakeTimeout)?;

        let secrets = match secrets {
            Ok(secrets) => secrets,
            Err(err) => {
                // A refused handshake reads as hostile; ban for a while.
                self.table.lock().await.ban(node.ban_key());
                return Err(err.into());
            }
        };
        self.setup_peer(stream, secrets, true).await
    }

    async fn handle_inbound(self: &Arc<Self>, mut stream: TcpStream) -> Result<(), NetworkError> {
        let mut handshake = Handshake::new(self.secret_key, self.config.require_eip8);
        let secrets = timeout(self.config.handshake_timeout, async {
            let auth = read_handshake_message(&mut stream, LEGACY_AUTH_SIZE).await?;
            handshake.decode_auth(&auth)?;
            let ack = handshake.encode_ack()?;
            use tokio::io::AsyncWriteExt;
            stream.write_all(&ack).await.map_err(RLPxError::from)?;
            handshake.derive_secrets(false)
        })
        .await
        .map_err(|_| NetworkError::HandshakeTimeout)??;

        self.setup_peer(stream, secrets, false).await
    }

    async fn setup_peer(
        self: &Arc<Self>,
        stream: TcpStream,
        secrets: crate::rlpx::handshake::Secrets,
        initiator: bool,
    ) -> Result<(), NetworkError> {
        let remote_id = secrets.remote_node_id;
        let codec = FrameCodec::new(secrets)?;
        let (mux, handle, mut inbound) = Multiplexer::new(Framed::new(stream, codec));
        self.tracker.spawn(async move {
            if let Err(err) = mux.run().await {
                debug!("Multiplexer terminated: {err}");
            }
        });

        // Negotiate the protocol over a fresh stream: dialers offer their
        // best version, listeners pick from everything they support.
        let (stream, version) = if initiator {
            let mut stream = handle.open_stream(None).await?;
            let tokens = supported_tokens();
            let token_refs: Vec<&str> = tokens.iter().map(String::as_str).collect();
            let chosen = select::select(&mut stream, &token_refs).await?;
            let version = version_from_token(&chosen).ok_or(NetworkError::NoProtocolStream)?;
            (stream, version)
        } else {
            let mut stream = timeout(self.config.handshake_timeout, inbound.recv())
                .await
                .map_err(|_| NetworkError::HandshakeTimeout)?
                .ok_or(NetworkError::NoProtocolStream)?;
            let tokens = supported_tokens();
            let token_refs: Vec<&str> = tokens.iter().map(String::as_str).collect();
            let chosen = select::handle(&mut stream, &token_refs).await?;
            let version = version_from_token(&chosen).ok_or(NetworkError::NoProtocolStream)?;
            (stream, version)
        };

        let (engine, stream) = EthProtocol::connect(
            stream,
            version,
            remote_id,
            self.blockchain.clone(),
            self.mempool.clone(),
            self.eth_events_tx.clone(),
        )
        .await?;

        self.peers.lock().await.insert(remote_id, engine.clone());
        let node = Node::new(self.config.ip, 0, 0, remote_id);
        log_peer_debug(&node, &format!("Peer connected with eth/{version}"));

        let this = self.clone();
        self.tracker.spawn(async move {
            if let Err(err) = engine.run(stream).await {
                log_peer_warn(&node, &format!("Connection dropped: {err}"));
            }
            this.peers.lock().await.remove(&remote_id);
        });
        Ok(())
    }

    /// Pools a transaction of our own and pushes it to peers.
    pub async fn add_local_transaction(&self, tx: Transaction) -> Result<H256, NetworkError> {
        let hash = self.mempool.add_transaction(tx.clone(), true)?;
        self.gossip_transactions(None, &[tx]).await;
        Ok(hash)
    }

    async fn handle_eth_event(self: &Arc<Self>, event: EthEvent) {
        match event {
            EthEvent::TransactionsReceived {
                peer_id,
                transactions,
            } => {
                self.gossip_transactions(Some(peer_id), &transactions).await;
            }
            EthEvent::NewBlock { peer_id, block } => {
                self.propagate_block(Some(peer_id), &block).await;
            }
            EthEvent::BlockHashesNeeded { peer_id, hashes } => {
                let this = self.clone();
                tokio::spawn(async move {
                    this.fetch_announced_blocks(peer_id, hashes).await;
                });
            }
        }
    }

    /// Full transactions go to `max(2, floor(sqrt(peers)))` peers, hash
    /// announcements to the remainder.
    async fn gossip_transactions(&self, origin: Option<H512>, transactions: &[Transaction]) {
        if transactions.is_empty() {
            return;
        }
        let peers: Vec<(H512, Arc<EthProtocol>)> = {
            let peers = self.peers.lock().await;
            peers
                .iter()
                .filter(|(id, _)| Some(**id) != origin)
                .map(|(id, engine)| (*id, engine.clone()))
                .collect()
        };
        if peers.is_empty() {
            return;
        }
        let full_count = sqrt_fanout(peers.len(), self.mempool.config().min_broadcast_peers);

        let announcements: Vec<(H256, u8, u32)> = transactions
            .iter()
            .map(|tx| {
                (
                    tx.hash(),
                    tx.tx_type() as u8,
                    tx.encode_canonical().len() as u32,
                )
            })
            .collect();

        for (index, (id, engine)) in peers.into_iter().enumerate() {
            let result = if index < full_count {
                engine.send_transactions(transactions).await
            } else {
                engine.announce_transactions(&announcements).await
            };
            if let Err(err) = result {
                debug!("Gossip to {id:#} failed: {err}");
            }
        }
    }

    async fn propagate_block(&self, origin: Option<H512>, block: &Block) {
        let Ok(Some(td)) = self.blockchain.get_total_difficulty(block.hash()) else {
            return;
        };
        let peers: Vec<Arc<EthProtocol>> = {
            let peers = self.peers.lock().await;
            peers
                .iter()
                .filter(|(id, _)| Some(**id) != origin)
                .map(|(_, engine)| engine.clone())
                .collect()
        };
        if peers.is_empty() {
            return;
        }
        let fanout = sqrt_fanout(peers.len(), 1);
        for engine in peers.into_iter().take(fanout) {
            if let Err(err) = engine.send_new_block(block, td).await {
                debug!("Block propagation failed: {err}");
            }
        }
    }

    /// Pulls blocks a peer announced by hash and feeds them to the chain.
    async fn fetch_announced_blocks(&self, peer_id: H512, hashes: Vec<H256>) {
        let engine = { self.peers.lock().await.get(&peer_id).cloned() };
        let Some(engine) = engine else { return };
        for hash in hashes {
            let headers = match engine
                .get_block_headers(crate::eth::messages::HashOrNumber::Hash(hash), 1, 0, false)
                .await
            {
                Ok(headers) => headers,
                Err(err) => {
                    debug!("Header fetch for announced block failed: {err}");
                    return;
                }
            };
            let Some(header) = headers.into_iter().next() else {
                continue;
            };
            let bodies = match engine.get_block_bodies(vec![hash]).await {
                Ok(bodies) => bodies,
                Err(err) => {
                    debug!("Body fetch for announced block failed: {err}");
                    return;
                }
            };
            let Some(body) = bodies.into_iter().next() else {
                continue;
            };
            let block = Block::new(header, body);
            match self.blockchain.put_block(&block) {
                Ok(()) => {
                    self.mempool.on_new_block(&block);
                    self.propagate_block(Some(peer_id), &block).await;
                }
                Err(err) => debug!("Announced block rejected: {err}"),
            }
        }
    }

    /// A reorg dropped canonical blocks: pair them with their replacements
    /// and let the mempool re-inject what fell out.
    async fn handle_reorg(&self, old_blocks: Vec<Block>) {
        let mut new_blocks = Vec::new();
        for old in &old_blocks {
            match self.blockchain.store().get_block_by_number(old.header.number) {
                Ok(Some(block)) => new_blocks.push(block),
                Ok(None) => {}
                Err(err) => {
                    warn!("Could not load replacement block: {err}");
                    return;
                }
            }
        }
        let head_root = self
            .blockchain
            .get_canonical_head_header()
            .map(|header| header.state_root)
            .unwrap_or_default();
        self.mempool.handle_reorg(&old_blocks, &new_blocks, head_root);
    }

    async fn rebroadcast_pending(&self) {
        let hashes = self.mempool.pending_hashes();
        if hashes.is_empty() {
            return;
        }
        let announcements: Vec<(H256, u8, u32)> = hashes
            .iter()
            .filter_map(|hash| {
                self.mempool.get_by_hash(*hash).map(|tx| {
                    (
                        *hash,
                        tx.tx_type() as u8,
                        tx.encode_canonical().len() as u32,
                    )
                })
            })
            .collect();

        let peers: Vec<Arc<EthProtocol>> = {
            let peers = self.peers.lock().await;
            peers.values().cloned().collect()
        };
        if peers.is_empty() {
            return;
        }
        let fanout = sqrt_fanout(peers.len(), 1);
        for engine in peers.into_iter().take(fanout) {
            if let Err(err) = engine.announce_transactions(&announcements).await {
                debug!("Rebroadcast failed: {err}");
            }
        }
    }
}

fn sqrt_fanout(peer_count: usize, floor: usize) -> usize {
    let sqrt = (peer_count as f64).sqrt().floor() as usize;
    sqrt.max(floor).min(peer_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethrune_blockchain::{
        BlockchainConfig,
        vm::{InMemoryState, StateBackend},
    };
    use ethrune_common::types::{
        Account, Eip1559Transaction, Hardfork, HardforkManager, TxKind,
    };
    use ethereum_types::U256;
    use rand::rngs::OsRng;

    fn node_fixture() -> (Arc<Network>, Arc<Mempool>, Arc<InMemoryState>) {
        let manager = Arc::new(HardforkManager::dev(1, Hardfork::Chainstart));
        let mut chain_config = BlockchainConfig::new(manager);
        chain_config.options.validate_blocks = false;
        let blockchain = Arc::new(Blockchain::new(chain_config).unwrap());
        let state = InMemoryState::new();
        let mempool = Arc::new(Mempool::new(
            Default::default(),
            blockchain.store().clone(),
            state.clone() as Arc<dyn StateBackend>,
        ));
        let network = Network::new(
            SecretKey::new(&mut OsRng),
            NetworkConfig::default(),
            blockchain,
            mempool.clone(),
        );
        (network, mempool, state)
    }

    #[test]
    fn fanout_follows_square_root_with_a_floor() {
        assert_eq!(sqrt_fanout(1, 2), 1);
        assert_eq!(sqrt_fanout(4, 2), 2);
        assert_eq!(sqrt_fanout(9, 2), 3);
        assert_eq!(sqrt_fanout(100, 2), 10);
        assert_eq!(sqrt_fanout(2, 2), 2);
    }

    #[tokio::test]
    async fn nodes_connect_over_the_full_stack() {
        let (node_a, _, _) = node_fixture();
        let (node_b, _, _) = node_fixture();
        node_a.start().await.unwrap();
        node_b.start().await.unwrap();

        let remote = node_b.local_node().await;
        node_a.connect_to_peer(remote).await.unwrap();

        assert_eq!(node_a.peer_count().await, 1);
        // The listener registers the peer too once the handshake completes.
        timeout(Duration::from_secs(5), async {
            while node_b.peer_count().await == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("inbound peer should register");
    }

    #[tokio::test]
    async fn local_transactions_gossip_to_connected_peers() {
        let (node_a, _mempool_a, state_a) = node_fixture();
        let (node_b, mempool_b, state_b) = node_fixture();
        node_a.start().await.unwrap();
        node_b.start().await.unwrap();
        node_a
            .connect_to_peer(node_b.local_node().await)
            .await
            .unwrap();

        let key = SecretKey::new(&mut OsRng);
        let mut tx = Transaction::Eip1559(Eip1559Transaction {
            chain_id: 1,
            nonce: 0,
            max_priority_fee_per_gas: 2,
            max_fee_per_gas: 20,
            gas_limit: 21_000,
            to: TxKind::Call(ethereum_types::Address::from_low_u64_be(9)),
            value: U256::from(1),
            ..Default::default()
        });
        tx.sign(&key).unwrap();
        let sender = tx.sender().unwrap();
        for state in [&state_a, &state_b] {
            state.set_account(sender, Account::new(0, U256::exp10(18)));
        }

        let hash = node_a.add_local_transaction(tx).await.unwrap();

        timeout(Duration::from_secs(5), async {
            while !mempool_b.contains(hash) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("transaction should reach the peer's pool");
    }
}
