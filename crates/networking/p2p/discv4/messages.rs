use crate::types::{Endpoint, Node};
use ethereum_types::{H256, H512};
use ethrune_crypto::{
    keccak::{keccak_concat, keccak_hash},
    secp::{pk2id, recover_public_key, sign_digest},
};
use ethrune_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use secp256k1::SecretKey;

use super::DiscoveryError;

const HASH_SIZE: usize = 32;
const SIGNATURE_SIZE: usize = 65;
const HEADER_SIZE: usize = HASH_SIZE + SIGNATURE_SIZE;

/// A verified discovery datagram:
/// `hash(32) || signature(65) || type(1) || rlp(payload)`.
/// The hash covers everything after it, the signature covers
/// `keccak(type || rlp(payload))`, and the sender id is recovered from it.
#[derive(Debug)]
pub struct Packet {
    hash: H256,
    node_id: H512,
    message: Message,
}

impl Packet {
    pub fn decode(encoded: &[u8]) -> Result<Packet, DiscoveryError> {
        if encoded.len() <= HEADER_SIZE {
            return Err(DiscoveryError::InvalidMessage("packet too short".into()));
        }

        let hash = H256::from_slice(&encoded[..HASH_SIZE]);
        let signature = &encoded[HASH_SIZE..HEADER_SIZE];
        let signed_payload = &encoded[HEADER_SIZE..];

        let computed_hash = keccak_hash(&encoded[HASH_SIZE..]);
        if computed_hash != hash {
            return Err(DiscoveryError::InvalidMessage("hash mismatch".into()));
        }

        let digest = keccak_hash(signed_payload);
        let public_key = recover_public_key(digest, signature)
            .map_err(|err| DiscoveryError::InvalidMessage(err.to_string()))?;
        let node_id = pk2id(&public_key);

        let message = Message::decode_with_type(signed_payload[0], &signed_payload[1..])?;
        Ok(Packet {
            hash,
            node_id,
            message,
        })
    }

    pub fn get_hash(&self) -> H256 {
        self.hash
    }

    pub fn get_node_id(&self) -> H512 {
        self.node_id
    }

    pub fn get_message(&self) -> &Message {
        &self.message
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Message {
    Ping(PingMessage),
    Pong(PongMessage),
    FindNode(FindNodeMessage),
    Neighbors(NeighborsMessage),
}

impl Message {
    /// Encodes the full datagram and returns its wire hash, used to
    /// correlate the answering pong.
    pub fn encode_with_header(&self, buf: &mut Vec<u8>, signer: &SecretKey) -> H256 {
        let typ = self.packet_type();
        let mut data = Vec::new();
        match self {
            Message::Ping(msg) => msg.encode(&mut data),
            Message::Pong(msg) => msg.encode(&mut data),
            Message::FindNode(msg) => msg.encode(&mut data),
            Message::Neighbors(msg) => msg.encode(&mut data),
        }

        let digest = keccak_concat(&[&[typ], &data]);
        // The signing key is ours, so this cannot fail for a valid digest.
        let signature = sign_digest(digest, signer).unwrap_or([0; SIGNATURE_SIZE]);

        let hash = keccak_concat(&[&signature, &[typ], &data]);
        buf.extend_from_slice(hash.as_bytes());
        buf.extend_from_slice(&signature);
        buf.push(typ);
        buf.extend_from_slice(&data);
        hash
    }

    fn packet_type(&self) -> u8 {
        match self {
            Message::Ping(_) => 0x01,
            Message::Pong(_) => 0x02,
            Message::FindNode(_) => 0x03,
            Message::Neighbors(_) => 0x04,
        }
    }

    fn decode_with_type(packet_type: u8, payload: &[u8]) -> Result<Message, DiscoveryError> {
        let map_rlp = |err: RLPDecodeError| DiscoveryError::InvalidMessage(err.to_string());
        match packet_type {
            0x01 => Ok(Message::Ping(
                PingMessage::decode_unfinished(payload).map_err(map_rlp)?.0,
            )),
            0x02 => Ok(Message::Pong(
                PongMessage::decode_unfinished(payload).map_err(map_rlp)?.0,
            )),
            0x03 => Ok(Message::FindNode(
                FindNodeMessage::decode_unfinished(payload).map_err(map_rlp)?.0,
            )),
            0x04 => Ok(Message::Neighbors(
                NeighborsMessage::decode_unfinished(payload).map_err(map_rlp)?.0,
            )),
            other => Err(DiscoveryError::InvalidMessage(format!(
                "unknown packet type {other:#x}"
            ))),
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Ping(_) => write!(f, "Ping"),
            Message::Pong(_) => write!(f, "Pong"),
            Message::FindNode(_) => write!(f, "FindNode"),
            Message::Neighbors(_) => write!(f, "Neighbors"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct PingMessage {
    pub version: u8,
    pub from: Endpoint,
    pub to: Endpoint,
    pub expiration: u64,
}

impl PingMessage {
    pub fn new(from: Endpoint, to: Endpoint, expiration: u64) -> Self {
        Self {
            version: 4,
            from,
            to,
            expiration,
        }
    }
}

impl RLPEncode for PingMessage {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.version)
            .encode_field(&self.from)
            .encode_field(&self.to)
            .encode_field(&self.expiration)
            .finish();
    }
}

impl RLPDecode for PingMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (version, decoder) = decoder.decode_field("version")?;
        let (from, decoder) = decoder.decode_field("from")?;
        let (to, decoder) = decoder.decode_field("to")?;
        let (expiration, decoder) = decoder.decode_field("expiration")?;
        // Newer senders append extra fields; ignore them.
        let remaining = decoder.finish_unchecked();
        let ping = PingMessage {
            version,
            from,
            to,
            expiration,
        };
        Ok((ping, remaining))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct PongMessage {
    pub to: Endpoint,
    pub ping_hash: H256,
    pub expiration: u64,
}

impl PongMessage {
    pub fn new(to: Endpoint, ping_hash: H256, expiration: u64) -> Self {
        Self {
            to,
            ping_hash,
            expiration,
        }
    }
}

impl RLPEncode for PongMessage {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.to)
            .encode_field(&self.ping_hash)
            .encode_field(&self.expiration)
            .finish();
    }
}

impl RLPDecode for PongMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (to, decoder) = decoder.decode_field("to")?;
        let (ping_hash, decoder) = decoder.decode_field("ping_hash")?;
        let (expiration, decoder) = decoder.decode_field("expiration")?;
        let remaining = decoder.finish_unchecked();
        let pong = PongMessage {
            to,
            ping_hash,
            expiration,
        };
        Ok((pong, remaining))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct FindNodeMessage {
    pub target: H512,
    pub expiration: u64,
}

impl FindNodeMessage {
    pub fn new(target: H512, expiration: u64) -> Self {
        Self { target, expiration }
    }
}

impl RLPEncode for FindNodeMessage {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.target)
            .encode_field(&self.expiration)
            .finish();
    }
}

impl RLPDecode for FindNodeMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (target, decoder) = decoder.decode_field("target")?;
        let (expiration, decoder) = decoder.decode_field("expiration")?;
        let remaining = decoder.finish_unchecked();
        Ok((FindNodeMessage { target, expiration }, remaining))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct NeighborsMessage {
    pub nodes: Vec<Node>,
    pub expiration: u64,
}

impl NeighborsMessage {
    pub fn new(nodes: Vec<Node>, expiration: u64) -> Self {
        Self { nodes, expiration }
    }
}

impl RLPEncode for NeighborsMessage {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.nodes)
            .encode_field(&self.expiration)
            .finish();
    }
}

impl RLPDecode for NeighborsMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (nodes, decoder) = decoder.decode_field("nodes")?;
        let (expiration, decoder) = decoder.decode_field("expiration")?;
        let remaining = decoder.finish_unchecked();
        Ok((NeighborsMessage { nodes, expiration }, remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::get_expiration;
    use ethrune_crypto::secp::public_key;
    use rand::rngs::OsRng;
    use std::net::{IpAddr, Ipv4Addr};

    fn endpoint(port: u16) -> Endpoint {
        Endpoint {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            udp_port: port,
            tcp_port: port,
        }
    }

    #[test]
    fn ping_round_trips_and_recovers_sender_id() {
        let signer = SecretKey::new(&mut OsRng);
        let message = Message::Ping(PingMessage::new(
            endpoint(30303),
            endpoint(30304),
            get_expiration(60),
        ));

        let mut buf = Vec::new();
        let hash = message.encode_with_header(&mut buf, &signer);

        let packet = Packet::decode(&buf).unwrap();
        assert_eq!(packet.get_hash(), hash);
        assert_eq!(packet.get_node_id(), pk2id(&public_key(&signer)));
        assert_eq!(packet.get_message(), &message);
    }

    #[test]
    fn same_payload_different_keys_recover_different_ids() {
        let message = |exp| Message::FindNode(FindNodeMessage::new(H512([9; 64]), exp));
        let exp = get_expiration(60);

        let key_a = SecretKey::new(&mut OsRng);
        let key_b = SecretKey::new(&mut OsRng);
        let mut buf_a = Vec::new();
        let mut buf_b = Vec::new();
        message(exp).encode_with_header(&mut buf_a, &key_a);
        message(exp).encode_with_header(&mut buf_b, &key_b);

        let id_a = Packet::decode(&buf_a).unwrap().get_node_id();
        let id_b = Packet::decode(&buf_b).unwrap().get_node_id();
        assert_ne!(id_a, id_b);
        assert_eq!(id_a, pk2id(&public_key(&key_a)));
    }

    #[test]
    fn corrupted_packets_are_rejected() {
        let signer = SecretKey::new(&mut OsRng);
        let message = Message::Pong(PongMessage::new(
            endpoint(30303),
            H256([1; 32]),
            get_expiration(60),
        ));
        let mut buf = Vec::new();
        message.encode_with_header(&mut buf, &signer);

        // Flip a payload byte: the wire hash no longer matches.
        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        assert!(Packet::decode(&buf).is_err());
        assert!(Packet::decode(&buf[..10]).is_err());
    }

    #[test]
    fn neighbours_round_trip_with_node_list() {
        let signer = SecretKey::new(&mut OsRng);
        let nodes = vec![
            Node::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 30303, 30303, H512([1; 64])),
            Node::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 0, 30305, H512([2; 64])),
        ];
        let message = Message::Neighbors(NeighborsMessage::new(nodes.clone(), get_expiration(60)));
        let mut buf = Vec::new();
        message.encode_with_header(&mut buf, &signer);

        let packet = Packet::decode(&buf).unwrap();
        match packet.get_message() {
            Message::Neighbors(neighbors) => assert_eq!(neighbors.nodes, nodes),
            other => panic!("unexpected message {other}"),
        }
    }
}
