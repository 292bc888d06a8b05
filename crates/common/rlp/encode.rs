use bytes::BufMut;
use bytes::Bytes;
use ethereum_types::{Address, Bloom, H128, H256, H512, U256, U512};
use std::net::IpAddr;

pub trait RLPEncode {
    fn encode(&self, buf: &mut dyn BufMut);

    fn length(&self) -> usize {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf.len()
    }

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

/// Writes the prefix of an RLP list with the given payload length.
pub fn encode_length(payload_len: usize, buf: &mut dyn BufMut) {
    if payload_len < 56 {
        buf.put_u8(0xc0 + payload_len as u8);
    } else {
        let be = payload_len.to_be_bytes();
        let first = be.iter().position(|b| *b != 0).unwrap_or(be.len() - 1);
        buf.put_u8(0xf7 + (be.len() - first) as u8);
        buf.put_slice(&be[first..]);
    }
}

/// Encodes an arbitrary byte slice as an RLP string.
pub fn encode_bytes(data: &[u8], buf: &mut dyn BufMut) {
    if data.len() == 1 && data[0] < 0x80 {
        buf.put_u8(data[0]);
    } else if data.len() < 56 {
        buf.put_u8(0x80 + data.len() as u8);
        buf.put_slice(data);
    } else {
        let be = data.len().to_be_bytes();
        let first = be.iter().position(|b| *b != 0).unwrap_or(be.len() - 1);
        buf.put_u8(0xb7 + (be.len() - first) as u8);
        buf.put_slice(&be[first..]);
        buf.put_slice(data);
    }
}

impl RLPEncode for bool {
    fn encode(&self, buf: &mut dyn BufMut) {
        if *self {
            buf.put_u8(0x01);
        } else {
            buf.put_u8(0x80);
        }
    }

    fn length(&self) -> usize {
        1
    }
}

macro_rules! impl_encode_for_uint {
    ($t:ty) => {
        impl RLPEncode for $t {
            fn encode(&self, buf: &mut dyn BufMut) {
                let be = self.to_be_bytes();
                let first = be.iter().position(|b| *b != 0).unwrap_or(be.len());
                encode_bytes(&be[first..], buf);
            }
        }
    };
}

impl_encode_for_uint!(u8);
impl_encode_for_uint!(u16);
impl_encode_for_uint!(u32);
impl_encode_for_uint!(u64);
impl_encode_for_uint!(usize);

macro_rules! impl_encode_for_biguint {
    ($t:ty) => {
        impl RLPEncode for $t {
            fn encode(&self, buf: &mut dyn BufMut) {
                let be = self.to_big_endian();
                let first = be.iter().position(|b| *b != 0).unwrap_or(be.len());
                encode_bytes(&be[first..], buf);
            }
        }
    };
}

impl_encode_for_biguint!(U256);
impl_encode_for_biguint!(U512);

macro_rules! impl_encode_for_hash {
    ($t:ty) => {
        impl RLPEncode for $t {
            fn encode(&self, buf: &mut dyn BufMut) {
                encode_bytes(self.as_bytes(), buf);
            }
        }
    };
}

impl_encode_for_hash!(H128);
impl_encode_for_hash!(H256);
impl_encode_for_hash!(H512);
impl_encode_for_hash!(Address);
impl_encode_for_hash!(Bloom);

impl RLPEncode for [u8] {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self, buf);
    }
}

impl<const N: usize> RLPEncode for [u8; N] {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self, buf);
    }
}

impl RLPEncode for Bytes {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self, buf);
    }
}

impl RLPEncode for str {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self.as_bytes(), buf);
    }
}

impl RLPEncode for String {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self.as_bytes(), buf);
    }
}

impl RLPEncode for IpAddr {
    fn encode(&self, buf: &mut dyn BufMut) {
        match self {
            IpAddr::V4(ip) => encode_bytes(&ip.octets(), buf),
            IpAddr::V6(ip) => encode_bytes(&ip.octets(), buf),
        }
    }
}

impl<T: RLPEncode> RLPEncode for Vec<T> {
    fn encode(&self, buf: &mut dyn BufMut) {
        let mut payload = Vec::new();
        for item in self {
            item.encode(&mut payload);
        }
        encode_length(payload.len(), buf);
        buf.put_slice(&payload);
    }
}

impl<T: RLPEncode> RLPEncode for &T {
    fn encode(&self, buf: &mut dyn BufMut) {
        (*self).encode(buf);
    }
}

macro_rules! impl_encode_for_tuple {
    ($($name:ident)+) => {
        #[allow(non_snake_case)]
        impl<$($name: RLPEncode),+> RLPEncode for ($($name,)+) {
            fn encode(&self, buf: &mut dyn BufMut) {
                let ($($name,)+) = self;
                let mut payload = Vec::new();
                $($name.encode(&mut payload);)+
                encode_length(payload.len(), buf);
                buf.put_slice(&payload);
            }
        }
    };
}

impl_encode_for_tuple!(A);
impl_encode_for_tuple!(A B);
impl_encode_for_tuple!(A B C);
impl_encode_for_tuple!(A B C D);
