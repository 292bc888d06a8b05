pub mod messages;

use crate::{
    MAX_DISC_PACKET_SIZE,
    kademlia::{KademliaTable, MAX_NODES_PER_BUCKET},
    types::Node,
    utils::{get_expiration, is_expired, time_now_unix},
};
use ethereum_types::{H256, H512};
use messages::{FindNodeMessage, Message, NeighborsMessage, Packet, PingMessage, PongMessage};
use secp256k1::SecretKey;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::UdpSocket,
    sync::{Mutex, broadcast, oneshot},
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::debug;

/// Messages sent to this endpoint expire after this many seconds.
const EXPIRATION_SECONDS: u64 = 20;
/// Pause between inserts when draining a neighbours response.
const NEIGHBOURS_INSERT_SPACING: Duration = Duration::from_millis(200);
/// Number of refresh-loop selector slots.
const REFRESH_SELECTOR_SLOTS: u8 = 10;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Failed to bind discovery socket: {0}")]
    BindSocket(std::io::Error),
    #[error("Failed to send discovery message: {0}")]
    MessageSendFailure(std::io::Error),
    #[error("Peer is banned")]
    Banned,
    #[error("Ping timed out")]
    PingTimeout,
    #[error("Bucket is full and the oldest peer is alive")]
    BucketFull,
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Message expired")]
    MessageExpired,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Peers per bucket and per neighbours answer (k).
    pub k: usize,
    /// Parallel find-node queries per refresh tick.
    pub concurrency: usize,
    /// Ping round-trip budget.
    pub timeout: Duration,
    pub refresh_interval: Duration,
    /// Serve find-node queries only to peers with a completed endpoint proof.
    pub only_confirmed: bool,
    pub should_find_neighbours: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            k: MAX_NODES_PER_BUCKET,
            concurrency: 3,
            timeout: Duration::from_millis(4000),
            refresh_interval: Duration::from_millis(60_000),
            only_confirmed: false,
            should_find_neighbours: true,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A peer answered its bonding ping.
    PeerNew(Node),
    /// A peer landed in the routing table.
    PeerAdded(Node),
}

#[derive(Debug, Default)]
struct PendingPings {
    by_hash: HashMap<H256, PendingPing>,
    /// In-flight cache: coalesces concurrent pings to one endpoint.
    by_endpoint: HashMap<String, H256>,
}

#[derive(Debug)]
struct PendingPing {
    endpoint_key: String,
    waiters: Vec<oneshot::Sender<H512>>,
}

/// Kademlia node discovery over a single UDP socket.
#[derive(Debug, Clone)]
pub struct Discovery {
    local_node: Node,
    signer: SecretKey,
    udp_socket: Arc<UdpSocket>,
    table: Arc<Mutex<KademliaTable>>,
    pending_pings: Arc<Mutex<PendingPings>>,
    config: DiscoveryConfig,
    events: broadcast::Sender<DiscoveryEvent>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Discovery {
    pub async fn try_new(
        local_node: Node,
        signer: SecretKey,
        table: Arc<Mutex<KademliaTable>>,
        config: DiscoveryConfig,
        cancel: CancellationToken,
    ) -> Result<Self, DiscoveryError> {
        let udp_socket = UdpSocket::bind(local_node.udp_addr())
            .await
            .map_err(DiscoveryError::BindSocket)?;
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            local_node,
            signer,
            udp_socket: Arc::new(udp_socket),
            table,
            pending_pings: Arc::new(Mutex::new(PendingPings::default())),
            config,
            events,
            tracker: TaskTracker::new(),
            cancel,
        })
    }

    /// The address the socket actually bound, relevant with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, DiscoveryError> {
        self.udp_socket
            .local_addr()
            .map_err(DiscoveryError::BindSocket)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    pub fn start(&self, bootnodes: Vec<Node>) {
        self.tracker.spawn({
            let this = self.clone();
            async move { this.receive_loop().await }
        });
        self.tracker.spawn({
            let this = self.clone();
            async move { this.refresh_loop().await }
        });
        self.tracker.spawn({
            let this = self.clone();
            async move {
                for bootnode in bootnodes {
                    if let Err(err) = this.try_add_peer(bootnode).await {
                        debug!("Could not add bootnode to table: {err}");
                    }
                }
            }
        });
    }

    async fn receive_loop(&self) {
        let mut buf = vec![0; MAX_DISC_PACKET_SIZE];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                received = self.udp_socket.recv_from(&mut buf) => {
                    let (read, from) = match received {
                        Ok(result) => result,
                        Err(err) => {
                            debug!("Error receiving discovery datagram: {err}");
                            continue;
                        }
                    };
                    // Malformed or badly signed datagrams are dropped, never
                    // surfaced.
                    match Packet::decode(&buf[..read]) {
                        Ok(packet) => {
                            if let Err(err) = self.handle_message(packet, from).await {
                                debug!("Error handling discovery message: {err}");
                            }
                        }
                        Err(err) => debug!("Could not decode packet from {from}: {err}"),
                    }
                }
            }
        }
    }

    async fn handle_message(&self, packet: Packet, from: SocketAddr) -> Result<(), DiscoveryError> {
        debug!("Discovery message {} from {}", packet.get_message(), from);
        match packet.get_message() {
            Message::Ping(ping) => {
                if is_expired(ping.expiration) {
                    return Err(DiscoveryError::MessageExpired);
                }
                self.pong(packet.get_hash(), from).await?;

                let node = Node::new(
                    from.ip(),
                    from.port(),
                    ping.from.tcp_port,
                    packet.get_node_id(),
                );
                let known = { self.table.lock().await.contains(node.node_id) };
                if !known {
                    // Bond with the new sender in the background.
                    let this = self.clone();
                    self.tracker.spawn(async move {
                        if let Err(err) = this.try_add_peer(node).await {
                            debug!("Could not add pinging peer: {err}");
                        }
                    });
                }
                Ok(())
            }
            Message::Pong(pong) => {
                if is_expired(pong.expiration) {
                    return Err(DiscoveryError::MessageExpired);
                }
                let resolved = {
                    let mut pending = self.pending_pings.lock().await;
                    pending.by_hash.remove(&pong.ping_hash).map(|entry| {
                        pending.by_endpoint.remove(&entry.endpoint_key);
                        entry
                    })
                };
                match resolved {
                    Some(entry) => {
                        let node_id = packet.get_node_id();
                        let mut table = self.table.lock().await;
                        table.record_pong(node_id, time_now_unix());
                        table.mark_confirmed(node_id);
                        drop(table);
                        for waiter in entry.waiters {
                            let _ = waiter.send(node_id);
                        }
                        Ok(())
                    }
                    None => Err(DiscoveryError::InvalidMessage(
                        "pong does not match any pending ping".into(),
                    )),
                }
            }
            Message::FindNode(find_node) => {
                if is_expired(find_node.expiration) {
                    return Err(DiscoveryError::MessageExpired);
                }
                let closest = {
                    let table = self.table.lock().await;
                    if self.config.only_confirmed && !table.is_confirmed(packet.get_node_id()) {
                        return Err(DiscoveryError::InvalidMessage(
                            "find-node from unconfirmed peer".into(),
                        ));
                    }
                    table.get_closest_nodes(
                        find_node.target,
                        self.config.k,
                        self.config.only_confirmed,
                    )
                };
                // Split across datagrams so each stays under the size cap.
                for chunk in closest.chunks(4) {
                    let neighbours = Message::Neighbors(NeighborsMessage::new(
                        chunk.to_vec(),
                        get_expiration(EXPIRATION_SECONDS),
                    ));
                    let mut buf = Vec::new();
                    neighbours.encode_with_header(&mut buf, &self.signer);
                    self.udp_socket
                        .send_to(&buf, from)
                        .await
                        .map_err(DiscoveryError::MessageSendFailure)?;
                }
                Ok(())
            }
            Message::Neighbors(neighbours) => {
                if is_expired(neighbours.expiration) {
                    return Err(DiscoveryError::MessageExpired);
                }
                if !self.config.should_find_neighbours {
                    return Ok(());
                }
                // Stagger the inserts so one answer cannot flood the table.
                let nodes = neighbours.nodes.clone();
                let this = self.clone();
                self.tracker.spawn(async move {
                    for node in nodes {
                        if let Err(err) = this.try_add_peer(node).await {
                            debug!("Skipping neighbour: {err}");
                        }
                        tokio::time::sleep(NEIGHBOURS_INSERT_SPACING).await;
                    }
                });
                Ok(())
            }
        }
    }

    /// Bonds with a peer and inserts it into its bucket. A full bucket keeps
    /// the newcomer out unless its oldest member fails a ping.
    pub async fn try_add_peer(&self, node: Node) -> Result<Node, DiscoveryError> {
        {
            let mut table = self.table.lock().await;
            let endpoint_key = endpoint_key(node.udp_addr());
            if table.is_banned(&node.ban_key()) || table.is_banned(&endpoint_key) {
                return Err(DiscoveryError::Banned);
            }
            if let Some(existing) = table.get_by_node_id(node.node_id) {
                return Ok(existing.node);
            }
        }

        let node_id = self.ping(node.udp_addr()).await?;
        let node = Node { node_id, ..node };
        let _ = self.events.send(DiscoveryEvent::PeerNew(node));

        let full = {
            let mut table = self.table.lock().await;
            if table.contains(node.node_id) {
                return Ok(node);
            }
            if !table.bucket_is_full(node.node_id) {
                table.insert_node(node);
                let _ = self.events.send(DiscoveryEvent::PeerAdded(node));
                return Ok(node);
            }
            table.oldest_in_bucket(node.node_id).map(|peer| peer.node)
        };

        // Bucket overflow: the newcomer only gets in if the oldest member
        // fails its liveness ping.
        if let Some(oldest) = full {
            match self.ping(oldest.udp_addr()).await {
                Ok(_) => return Err(DiscoveryError::BucketFull),
                Err(_) => {
                    let mut table = self.table.lock().await;
                    table.remove(oldest.node_id);
                    table.insert_node(node);
                    let _ = self.events.send(DiscoveryEvent::PeerAdded(node));
                }
            }
        }
        Ok(node)
    }

    /// Sends a ping and waits for the matching pong, resolving to the
    /// recovered node id. Timeouts ban the endpoint.
    pub async fn ping(&self, to: SocketAddr) -> Result<H512, DiscoveryError> {
        let key = endpoint_key(to);
        let (tx, rx) = oneshot::channel();

        let needs_send = {
            let mut pending = self.pending_pings.lock().await;
            match pending.by_endpoint.get(&key).copied() {
                Some(hash) => {
                    // Coalesce onto the in-flight ping.
                    if let Some(entry) = pending.by_hash.get_mut(&hash) {
                        entry.waiters.push(tx);
                        None
                    } else {
                        pending.by_endpoint.remove(&key);
                        Some(tx)
                    }
                }
                None => Some(tx),
            }
        };

        if let Some(tx) = needs_send {
            let to_endpoint = crate::types::Endpoint {
                ip: to.ip(),
                udp_port: to.port(),
                tcp_port: 0,
            };
            let message = Message::Ping(PingMessage::new(
                self.local_node.endpoint(),
                to_endpoint,
                get_expiration(EXPIRATION_SECONDS),
            ));
            let mut buf = Vec::new();
            let hash = message.encode_with_header(&mut buf, &self.signer);
            {
                let mut pending = self.pending_pings.lock().await;
                pending.by_endpoint.insert(key.clone(), hash);
                pending.by_hash.insert(
                    hash,
                    PendingPing {
                        endpoint_key: key.clone(),
                        waiters: vec![tx],
                    },
                );
            }
            self.udp_socket
                .send_to(&buf, to)
                .await
                .map_err(DiscoveryError::MessageSendFailure)?;
        }

        match timeout(self.config.timeout, rx).await {
            Ok(Ok(node_id)) => Ok(node_id),
            _ => {
                {
                    let mut pending = self.pending_pings.lock().await;
                    if let Some(hash) = pending.by_endpoint.remove(&key) {
                        pending.by_hash.remove(&hash);
                    }
                }
                self.table.lock().await.ban(key);
                Err(DiscoveryError::PingTimeout)
            }
        }
    }

    async fn pong(&self, ping_hash: H256, to: SocketAddr) -> Result<(), DiscoveryError> {
        let to_endpoint = crate::types::Endpoint {
            ip: to.ip(),
            udp_port: to.port(),
            tcp_port: 0,
        };
        let message = Message::Pong(PongMessage::new(
            to_endpoint,
            ping_hash,
            get_expiration(EXPIRATION_SECONDS),
        ));
        let mut buf = Vec::new();
        message.encode_with_header(&mut buf, &self.signer);
        self.udp_socket
            .send_to(&buf, to)
            .await
            .map_err(DiscoveryError::MessageSendFailure)?;
        Ok(())
    }

    /// Every tenth of the refresh interval, a rotating selector picks ~1/10
    /// of the table and queries each peer for neighbours of a random target
    /// (or our own id, even odds).
    async fn refresh_loop(&self) {
        let tick = self.config.refresh_interval / u32::from(REFRESH_SELECTOR_SLOTS);
        let mut interval = tokio::time::interval(tick.max(Duration::from_millis(100)));
        let mut selector: u8 = 0;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = interval.tick() => {}
            }

            let chosen: Vec<Node> = {
                let table = self.table.lock().await;
                table
                    .iter_peers()
                    .filter(|peer| peer.node.node_id[0] % REFRESH_SELECTOR_SLOTS == selector)
                    .map(|peer| peer.node)
                    .collect()
            };
            selector = (selector + 1) % REFRESH_SELECTOR_SLOTS;

            use futures::StreamExt;
            futures::stream::iter(chosen)
                .for_each_concurrent(self.config.concurrency, |peer| async move {
                    let target = if rand::random::<bool>() {
                        H512::random()
                    } else {
                        self.local_node.node_id
                    };
                    if let Err(err) = self.send_find_node(&peer, target).await {
                        debug!("Find-node to {peer} failed: {err}");
                    }
                })
                .await;
        }
    }

    async fn send_find_node(&self, peer: &Node, target: H512) -> Result<(), DiscoveryError> {
        let message = Message::FindNode(FindNodeMessage::new(
            target,
            get_expiration(EXPIRATION_SECONDS),
        ));
        let mut buf = Vec::new();
        message.encode_with_header(&mut buf, &self.signer);
        self.udp_socket
            .send_to(&buf, peer.udp_addr())
            .await
            .map_err(DiscoveryError::MessageSendFailure)?;
        Ok(())
    }
}

fn endpoint_key(addr: SocketAddr) -> String {
    format!("{}:{}", addr.ip(), addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kademlia::bucket_number;
    use ethrune_crypto::secp::{pk2id, public_key};
    use rand::rngs::OsRng;
    use std::net::{IpAddr, Ipv4Addr};

    async fn start_server(config: DiscoveryConfig) -> (Discovery, Node) {
        let signer = SecretKey::new(&mut OsRng);
        let node_id = pk2id(&public_key(&signer));
        let local = Node::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 0, node_id);
        let table = Arc::new(Mutex::new(KademliaTable::new(node_id)));
        let discovery = Discovery::try_new(
            local,
            signer,
            table,
            config,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let addr = discovery.local_addr().unwrap();
        let local = Node::new(addr.ip(), addr.port(), addr.port(), node_id);
        discovery.start(vec![]);
        (discovery, local)
    }

    #[tokio::test]
    async fn ping_pong_resolves_recovered_id_and_inserts_peer() {
        let (server_a, node_a) = start_server(DiscoveryConfig::default()).await;
        let (_server_b, node_b) = start_server(DiscoveryConfig::default()).await;

        let unresolved = Node::new(node_b.ip, node_b.udp_port, node_b.tcp_port, H512::zero());
        let added = server_a.try_add_peer(unresolved).await.unwrap();
        assert_eq!(added.node_id, node_b.node_id);

        let table = server_a.table.lock().await;
        let peer = table.get_by_node_id(node_b.node_id).expect("peer in table");
        assert_eq!(peer.node.udp_addr(), node_b.udp_addr());
        let expected_bucket = bucket_number(node_a.node_id, node_b.node_id);
        assert!(
            table.buckets()[expected_bucket]
                .peers
                .iter()
                .any(|peer| peer.node.node_id == node_b.node_id)
        );
    }

    #[tokio::test]
    async fn unanswered_ping_bans_the_endpoint() {
        let mut config = DiscoveryConfig::default();
        config.timeout = Duration::from_millis(100);
        let (server, _) = start_server(config).await;

        // Nothing listens on this port.
        let dead = Node::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1, 1, H512::zero());
        let result = server.try_add_peer(dead).await;
        assert!(matches!(result, Err(DiscoveryError::PingTimeout)));

        // The ban now short-circuits the add.
        let result = server.try_add_peer(dead).await;
        assert!(matches!(result, Err(DiscoveryError::Banned)));
    }

    #[tokio::test]
    async fn concurrent_pings_to_one_endpoint_coalesce() {
        let (server_a, _) = start_server(DiscoveryConfig::default()).await;
        let (_server_b, node_b) = start_server(DiscoveryConfig::default()).await;

        let first = server_a.ping(node_b.udp_addr());
        let second = server_a.ping(node_b.udp_addr());
        let (first, second) = tokio::join!(first, second);
        assert_eq!(first.unwrap(), node_b.node_id);
        assert_eq!(second.unwrap(), node_b.node_id);
    }

    #[tokio::test]
    async fn find_node_returns_closest_peers() {
        let (server_a, _node_a) = start_server(DiscoveryConfig::default()).await;
        let (server_b, node_b) = start_server(DiscoveryConfig::default()).await;

        // Teach B about some nodes directly.
        {
            let mut table = server_b.table.lock().await;
            for index in 1..=8u8 {
                let node = Node::new(
                    IpAddr::V4(Ipv4Addr::LOCALHOST),
                    40_000 + u16::from(index),
                    0,
                    H512([index; 64]),
                );
                table.insert_node(node);
            }
        }

        // Bond A into B's view, then ask B for neighbours of a target.
        let unresolved = Node::new(node_b.ip, node_b.udp_port, node_b.tcp_port, H512::zero());
        server_a.try_add_peer(unresolved).await.unwrap();

        server_a
            .send_find_node(&node_b, H512([1; 64]))
            .await
            .unwrap();

        // The staggered neighbour inserts ping unreachable fake nodes, so we
        // only check that B answered by watching A's pending pings fill up.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                tokio::time::sleep(Duration::from_millis(50)).await;
                if !server_a.pending_pings.lock().await.by_hash.is_empty() {
                    break;
                }
            }
        })
        .await
        .expect("neighbours answer should trigger bonding pings");
    }
}
