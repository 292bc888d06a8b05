use crate::types::Node;
use ethereum_types::{H512, U512};
use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

/// Peers per bucket (k).
pub const MAX_NODES_PER_BUCKET: usize = 16;
/// One bucket per possible bit-length of the XOR distance between 64-byte ids.
const NUMBER_OF_BUCKETS: usize = 512;

pub const DEFAULT_BAN_DURATION: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct PeerData {
    pub node: Node,
    /// Unix timestamp of the last pong, zero before the endpoint proof.
    pub last_pong: u64,
}

impl PeerData {
    fn new(node: Node) -> Self {
        Self { node, last_pong: 0 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Bucket {
    /// Insertion order; the front is the oldest member.
    pub peers: Vec<PeerData>,
}

/// Computes the distance between two node ids and returns the corresponding
/// bucket number (the bit-length of the XOR, minus one).
pub fn bucket_number(node_id_1: H512, node_id_2: H512) -> usize {
    let xor = node_id_1 ^ node_id_2;
    let distance = U512::from_big_endian(xor.as_bytes());
    distance.bits().saturating_sub(1)
}

/// The discovery routing table: k-buckets indexed by XOR distance from the
/// local id, plus the ban list and confirmed-peer set.
#[derive(Debug)]
pub struct KademliaTable {
    local_node_id: H512,
    buckets: Vec<Bucket>,
    banned: HashMap<String, Instant>,
    confirmed: HashSet<H512>,
}

impl KademliaTable {
    pub fn new(local_node_id: H512) -> Self {
        Self {
            local_node_id,
            buckets: vec![Bucket::default(); NUMBER_OF_BUCKETS],
            banned: HashMap::new(),
            confirmed: HashSet::new(),
        }
    }

    pub fn local_node_id(&self) -> H512 {
        self.local_node_id
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn get_by_node_id(&self, node_id: H512) -> Option<&PeerData> {
        let bucket = self.buckets.get(bucket_number(node_id, self.local_node_id))?;
        bucket
            .peers
            .iter()
            .find(|peer| peer.node.node_id == node_id)
    }

    pub fn get_by_node_id_mut(&mut self, node_id: H512) -> Option<&mut PeerData> {
        let bucket = self
            .buckets
            .get_mut(bucket_number(node_id, self.local_node_id))?;
        bucket
            .peers
            .iter_mut()
            .find(|peer| peer.node.node_id == node_id)
    }

    pub fn contains(&self, node_id: H512) -> bool {
        self.get_by_node_id(node_id).is_some()
    }

    /// Inserts a node at the back of its bucket. Fails when the bucket is
    /// full; eviction of the oldest member is the caller's call, made after
    /// pinging it. The local id is never stored.
    pub fn insert_node(&mut self, node: Node) -> bool {
        if node.node_id == self.local_node_id {
            return false;
        }
        let bucket_idx = bucket_number(node.node_id, self.local_node_id);
        let bucket = &mut self.buckets[bucket_idx];
        if bucket
            .peers
            .iter()
            .any(|peer| peer.node.node_id == node.node_id)
        {
            return false;
        }
        if bucket.peers.len() >= MAX_NODES_PER_BUCKET {
            return false;
        }
        bucket.peers.push(PeerData::new(node));
        true
    }

    /// The oldest member of the bucket the given id maps to.
    pub fn oldest_in_bucket(&self, node_id: H512) -> Option<&PeerData> {
        self.buckets
            .get(bucket_number(node_id, self.local_node_id))?
            .peers
            .first()
    }

    pub fn bucket_is_full(&self, node_id: H512) -> bool {
        self.buckets[bucket_number(node_id, self.local_node_id)]
            .peers
            .len()
            >= MAX_NODES_PER_BUCKET
    }

    pub fn remove(&mut self, node_id: H512) -> Option<PeerData> {
        let bucket = &mut self.buckets[bucket_number(node_id, self.local_node_id)];
        let position = bucket
            .peers
            .iter()
            .position(|peer| peer.node.node_id == node_id)?;
        self.confirmed.remove(&node_id);
        Some(bucket.peers.remove(position))
    }

    pub fn mark_confirmed(&mut self, node_id: H512) {
        if self.contains(node_id) {
            self.confirmed.insert(node_id);
        }
    }

    pub fn is_confirmed(&self, node_id: H512) -> bool {
        self.confirmed.contains(&node_id)
    }

    pub fn record_pong(&mut self, node_id: H512, at: u64) {
        if let Some(peer) = self.get_by_node_id_mut(node_id) {
            peer.last_pong = at;
        }
    }

    /// Up to `limit` peers closest to the target by XOR distance, optionally
    /// restricted to confirmed peers.
    pub fn get_closest_nodes(&self, target: H512, limit: usize, only_confirmed: bool) -> Vec<Node> {
        let mut nodes: Vec<(Node, U512)> = self
            .iter_peers()
            .filter(|peer| !only_confirmed || self.confirmed.contains(&peer.node.node_id))
            .map(|peer| {
                let xor = peer.node.node_id ^ target;
                (peer.node, U512::from_big_endian(xor.as_bytes()))
            })
            .collect();
        nodes.sort_by(|(_, a), (_, b)| a.cmp(b));
        nodes.into_iter().take(limit).map(|(node, _)| node).collect()
    }

    pub fn iter_peers(&self) -> impl Iterator<Item = &PeerData> {
        self.buckets.iter().flat_map(|bucket| bucket.peers.iter())
    }

    pub fn peer_count(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.peers.len()).sum()
    }

    // -- ban list -----------------------------------------------------------

    pub fn ban(&mut self, key: String) {
        self.ban_for(key, DEFAULT_BAN_DURATION);
    }

    pub fn ban_for(&mut self, key: String, duration: Duration) {
        self.banned.insert(key, Instant::now() + duration);
    }

    pub fn is_banned(&mut self, key: &str) -> bool {
        match self.banned.get(key) {
            Some(expiry) if Instant::now() < *expiry => true,
            Some(_) => {
                self.banned.remove(key);
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethrune_crypto::secp::{pk2id, public_key};
    use hex_literal::hex;
    use rand::rngs::OsRng;
    use secp256k1::SecretKey;
    use std::net::{IpAddr, Ipv4Addr};

    fn random_node() -> Node {
        let id = pk2id(&public_key(&SecretKey::new(&mut OsRng)));
        Node::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 0, id)
    }

    fn table() -> KademliaTable {
        KademliaTable::new(pk2id(&public_key(&SecretKey::new(&mut OsRng))))
    }

    #[test]
    fn bucket_number_works_as_expected() {
        let node_id_1 = H512(hex!(
            "4dc429669029ceb17d6438a35c80c29e09ca2c25cc810d690f5ee690aa322274043a504b8d42740079c4f4cef50777c991010208b333b80bee7b9ae8e5f6b6f0"
        ));
        let node_id_2 = H512(hex!(
            "034ee575a025a661e19f8cda2b6fd8b2fd4fe062f6f2f75f0ec3447e23c1bb59beb1e91b2337b264c7386150b24b621b8224180c9e4aaf3e00584402dc4a8386"
        ));
        // Top bits differ, so the distance has full bit-length.
        assert_eq!(bucket_number(node_id_1, node_id_2), 511);
        assert_eq!(bucket_number(node_id_1, node_id_1), 0);
    }

    #[test]
    fn local_id_is_never_stored() {
        let mut table = table();
        let local = Node::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 0, table.local_node_id());
        assert!(!table.insert_node(local));
        assert_eq!(table.peer_count(), 0);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut table = table();
        let node = random_node();
        assert!(table.insert_node(node));
        assert!(!table.insert_node(node));
        assert_eq!(table.peer_count(), 1);
    }

    #[test]
    fn full_bucket_rejects_until_oldest_removed() {
        let mut table = table();
        // Drive nodes into the same bucket by flipping low bits of an id far
        // from the local one.
        let base = table.local_node_id() ^ H512([0x80; 64]);
        let bucket_idx = bucket_number(table.local_node_id(), base);
        let mut inserted = Vec::new();
        let mut byte = 0u8;
        while inserted.len() < MAX_NODES_PER_BUCKET {
            byte = byte.wrapping_add(1);
            let mut id = base;
            id.0[63] = byte;
            if bucket_number(table.local_node_id(), id) != bucket_idx {
                continue;
            }
            let node = Node::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 0, id);
            assert!(table.insert_node(node));
            inserted.push(node);
        }

        let mut extra_id = base;
        extra_id.0[62] ^= 0x01;
        assert_eq!(bucket_number(table.local_node_id(), extra_id), bucket_idx);
        let extra = Node::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 0, extra_id);
        assert!(!table.insert_node(extra));

        // The oldest is the first inserted; evicting it makes room.
        let oldest = table.oldest_in_bucket(extra_id).unwrap().node;
        assert_eq!(oldest.node_id, inserted[0].node_id);
        table.remove(oldest.node_id);
        assert!(table.insert_node(extra));
    }

    #[test]
    fn closest_nodes_are_sorted_by_distance() {
        let mut table = table();
        for _ in 0..32 {
            table.insert_node(random_node());
        }
        let target = random_node().node_id;
        let closest = table.get_closest_nodes(target, MAX_NODES_PER_BUCKET, false);
        assert!(closest.len() <= MAX_NODES_PER_BUCKET);
        let distances: Vec<U512> = closest
            .iter()
            .map(|node| U512::from_big_endian((node.node_id ^ target).as_bytes()))
            .collect();
        for pair in distances.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn only_confirmed_filter_applies() {
        let mut table = table();
        let confirmed = random_node();
        let unconfirmed = random_node();
        table.insert_node(confirmed);
        table.insert_node(unconfirmed);
        table.mark_confirmed(confirmed.node_id);

        let nodes = table.get_closest_nodes(random_node().node_id, 16, true);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node_id, confirmed.node_id);
    }

    #[test]
    fn bans_expire() {
        let mut table = table();
        table.ban_for("peer".to_string(), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!table.is_banned("peer"));

        table.ban("peer".to_string());
        assert!(table.is_banned("peer"));
    }
}
