use ethereum_types::H512;
use ethrune_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use std::{
    fmt::Display,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    #[error("Parse error: {0}")]
    ParseError(String),
}

/// A wire endpoint. Absent ports encode as empty byte strings, which is the
/// RLP encoding of zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl RLPEncode for Endpoint {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.ip)
            .encode_field(&self.udp_port)
            .encode_field(&self.tcp_port)
            .finish();
    }
}

impl RLPDecode for Endpoint {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (ip, decoder) = decoder.decode_field("ip")?;
        let (udp_port, decoder) = decoder.decode_field("udp_port")?;
        let (tcp_port, decoder) = decoder.decode_field("tcp_port")?;
        let remaining = decoder.finish()?;
        let endpoint = Endpoint {
            ip,
            udp_port,
            tcp_port,
        };
        Ok((endpoint, remaining))
    }
}

/// A remote node: its address and 64-byte id. A node held in the routing
/// table always has a resolved id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub node_id: H512,
}

impl Node {
    pub fn new(ip: IpAddr, udp_port: u16, tcp_port: u16, node_id: H512) -> Self {
        Self {
            ip,
            udp_port,
            tcp_port,
            node_id,
        }
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            ip: self.ip,
            udp_port: self.udp_port,
            tcp_port: self.tcp_port,
        }
    }

    /// Stable ban-list key: the id in hex.
    pub fn ban_key(&self) -> String {
        hex::encode(self.node_id)
    }

    pub fn enode_url(&self) -> String {
        format!(
            "enode://{}@{}:{}",
            hex::encode(self.node_id),
            self.ip,
            self.tcp_port
        )
    }

    pub fn from_enode_url(enode: &str) -> Result<Self, NodeError> {
        let rest = enode
            .strip_prefix("enode://")
            .ok_or_else(|| NodeError::InvalidFormat("missing enode:// prefix".into()))?;
        let (id_part, addr_part) = rest
            .split_once('@')
            .ok_or_else(|| NodeError::InvalidFormat("missing @ separator".into()))?;
        let node_id = H512::from_str(id_part)
            .map_err(|_| NodeError::ParseError("could not parse node id".into()))?;
        let socket_address: SocketAddr = addr_part
            .parse()
            .map_err(|_| NodeError::ParseError("could not parse socket address".into()))?;
        Ok(Self::new(
            socket_address.ip(),
            socket_address.port(),
            socket_address.port(),
            node_id,
        ))
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{:#}", self.ip, self.tcp_port, self.node_id)
    }
}

// Wire form inside neighbours packets: [ip, udp_port, tcp_port, id].
impl RLPEncode for Node {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.ip)
            .encode_field(&self.udp_port)
            .encode_field(&self.tcp_port)
            .encode_field(&self.node_id)
            .finish();
    }
}

impl RLPDecode for Node {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (ip, decoder) = decoder.decode_field("ip")?;
        let (udp_port, decoder) = decoder.decode_field("udp_port")?;
        let (tcp_port, decoder) = decoder.decode_field("tcp_port")?;
        let (node_id, decoder) = decoder.decode_field("node_id")?;
        let remaining = decoder.finish_unchecked();
        Ok((Node::new(ip, udp_port, tcp_port, node_id), remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_rlp_round_trip() {
        let node = Node::new("10.0.0.7".parse().unwrap(), 30303, 30304, H512([7; 64]));
        let encoded = node.encode_to_vec();
        assert_eq!(Node::decode(&encoded).unwrap(), node);
    }

    #[test]
    fn enode_url_round_trip() {
        let node = Node::new("127.0.0.1".parse().unwrap(), 30303, 30303, H512([1; 64]));
        let parsed = Node::from_enode_url(&node.enode_url()).unwrap();
        assert_eq!(parsed.node_id, node.node_id);
        assert_eq!(parsed.tcp_addr(), node.tcp_addr());
    }

    #[test]
    fn absent_ports_encode_as_empty_bytes() {
        let endpoint = Endpoint {
            ip: "127.0.0.1".parse().unwrap(),
            udp_port: 0,
            tcp_port: 0,
        };
        let encoded = endpoint.encode_to_vec();
        // [4-byte ip, empty, empty]
        assert_eq!(encoded, vec![0xc7, 0x84, 127, 0, 0, 1, 0x80, 0x80]);
        assert_eq!(Endpoint::decode(&encoded).unwrap(), endpoint);
    }
}
