use crate::error::RLPDecodeError;
use bytes::Bytes;
use ethereum_types::{Address, Bloom, H128, H256, H512, U256, U512};
use std::net::IpAddr;

pub trait RLPDecode: Sized {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError>;

    fn decode(rlp: &[u8]) -> Result<Self, RLPDecodeError> {
        let (decoded, remaining) = Self::decode_unfinished(rlp)?;
        if !remaining.is_empty() {
            return Err(RLPDecodeError::MalformedData);
        }
        Ok(decoded)
    }
}

/// Splits an RLP item into `(is_list, payload, remaining)`.
pub fn decode_rlp_item(data: &[u8]) -> Result<(bool, &[u8], &[u8]), RLPDecodeError> {
    let first = *data.first().ok_or(RLPDecodeError::InvalidLength)?;
    match first {
        0x00..=0x7f => Ok((false, &data[..1], &data[1..])),
        0x80..=0xb7 => {
            let len = (first - 0x80) as usize;
            if data.len() < len + 1 {
                return Err(RLPDecodeError::InvalidLength);
            }
            Ok((false, &data[1..len + 1], &data[len + 1..]))
        }
        0xb8..=0xbf => {
            let (len, rest) = decode_long_length(first - 0xb7, &data[1..])?;
            Ok((false, &rest[..len], &rest[len..]))
        }
        0xc0..=0xf7 => {
            let len = (first - 0xc0) as usize;
            if data.len() < len + 1 {
                return Err(RLPDecodeError::InvalidLength);
            }
            Ok((true, &data[1..len + 1], &data[len + 1..]))
        }
        0xf8..=0xff => {
            let (len, rest) = decode_long_length(first - 0xf7, &data[1..])?;
            Ok((true, &rest[..len], &rest[len..]))
        }
    }
}

fn decode_long_length(len_of_len: u8, data: &[u8]) -> Result<(usize, &[u8]), RLPDecodeError> {
    let len_of_len = len_of_len as usize;
    if data.len() < len_of_len || len_of_len > size_of::<usize>() {
        return Err(RLPDecodeError::InvalidLength);
    }
    let mut len: usize = 0;
    for byte in &data[..len_of_len] {
        len = len << 8 | *byte as usize;
    }
    if len < 56 || data.len() < len_of_len + len {
        return Err(RLPDecodeError::InvalidLength);
    }
    Ok((len, &data[len_of_len..]))
}

/// Returns the next item including its prefix, plus the remaining bytes.
pub fn get_item_with_prefix(data: &[u8]) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    let (_, _, rest) = decode_rlp_item(data)?;
    let item_len = data.len() - rest.len();
    Ok((&data[..item_len], rest))
}

/// Decodes the payload of an RLP string, rejecting lists.
pub fn decode_bytes(data: &[u8]) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    let (is_list, payload, rest) = decode_rlp_item(data)?;
    if is_list {
        return Err(RLPDecodeError::UnexpectedList);
    }
    Ok((payload, rest))
}

impl RLPDecode for bool {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_bytes(rlp)?;
        match payload {
            [] => Ok((false, rest)),
            [0x01] => Ok((true, rest)),
            _ => Err(RLPDecodeError::MalformedBool),
        }
    }
}

macro_rules! impl_decode_for_uint {
    ($t:ty) => {
        impl RLPDecode for $t {
            fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
                let (payload, rest) = decode_bytes(rlp)?;
                if payload.len() > size_of::<$t>() {
                    return Err(RLPDecodeError::InvalidLength);
                }
                if payload.first().is_some_and(|byte| *byte == 0) {
                    return Err(RLPDecodeError::InvalidInteger);
                }
                let mut value: $t = 0;
                for byte in payload {
                    value = value.wrapping_shl(8) | *byte as $t;
                }
                Ok((value, rest))
            }
        }
    };
}

impl_decode_for_uint!(u8);
impl_decode_for_uint!(u16);
impl_decode_for_uint!(u32);
impl_decode_for_uint!(u64);
impl_decode_for_uint!(usize);

macro_rules! impl_decode_for_biguint {
    ($t:ty, $size:expr) => {
        impl RLPDecode for $t {
            fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
                let (payload, rest) = decode_bytes(rlp)?;
                if payload.len() > $size {
                    return Err(RLPDecodeError::InvalidLength);
                }
                if payload.first().is_some_and(|byte| *byte == 0) {
                    return Err(RLPDecodeError::InvalidInteger);
                }
                Ok((<$t>::from_big_endian(payload), rest))
            }
        }
    };
}

impl_decode_for_biguint!(U256, 32);
impl_decode_for_biguint!(U512, 64);

macro_rules! impl_decode_for_hash {
    ($t:ty) => {
        impl RLPDecode for $t {
            fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
                let (payload, rest) = decode_bytes(rlp)?;
                if payload.len() != <$t>::len_bytes() {
                    return Err(RLPDecodeError::InvalidLength);
                }
                Ok((<$t>::from_slice(payload), rest))
            }
        }
    };
}

impl_decode_for_hash!(H128);
impl_decode_for_hash!(H256);
impl_decode_for_hash!(H512);
impl_decode_for_hash!(Address);
impl_decode_for_hash!(Bloom);

impl<const N: usize> RLPDecode for [u8; N] {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_bytes(rlp)?;
        let bytes = payload
            .try_into()
            .map_err(|_| RLPDecodeError::InvalidLength)?;
        Ok((bytes, rest))
    }
}

impl RLPDecode for Bytes {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_bytes(rlp)?;
        Ok((Bytes::copy_from_slice(payload), rest))
    }
}

impl RLPDecode for String {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_bytes(rlp)?;
        let value = String::from_utf8(payload.to_vec())
            .map_err(|_| RLPDecodeError::Custom("Invalid UTF-8 string".to_string()))?;
        Ok((value, rest))
    }
}

impl RLPDecode for IpAddr {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_bytes(rlp)?;
        let ip = match payload.len() {
            4 => {
                let octets: [u8; 4] = payload
                    .try_into()
                    .map_err(|_| RLPDecodeError::InvalidLength)?;
                IpAddr::from(octets)
            }
            16 => {
                let octets: [u8; 16] = payload
                    .try_into()
                    .map_err(|_| RLPDecodeError::InvalidLength)?;
                IpAddr::from(octets)
            }
            _ => return Err(RLPDecodeError::InvalidLength),
        };
        Ok((ip, rest))
    }
}

impl<T: RLPDecode> RLPDecode for Vec<T> {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (is_list, mut payload, rest) = decode_rlp_item(rlp)?;
        if !is_list {
            return Err(RLPDecodeError::UnexpectedString);
        }
        let mut items = Vec::new();
        while !payload.is_empty() {
            let (item, remaining) = T::decode_unfinished(payload)?;
            items.push(item);
            payload = remaining;
        }
        Ok((items, rest))
    }
}

macro_rules! impl_decode_for_tuple {
    ($($name:ident)+) => {
        #[allow(non_snake_case)]
        impl<$($name: RLPDecode),+> RLPDecode for ($($name,)+) {
            fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
                let (is_list, payload, rest) = decode_rlp_item(rlp)?;
                if !is_list {
                    return Err(RLPDecodeError::UnexpectedString);
                }
                $(let ($name, payload) = $name::decode_unfinished(payload)?;)+
                if !payload.is_empty() {
                    return Err(RLPDecodeError::MalformedData);
                }
                Ok((($($name,)+), rest))
            }
        }
    };
}

impl_decode_for_tuple!(A);
impl_decode_for_tuple!(A B);
impl_decode_for_tuple!(A B C);
impl_decode_for_tuple!(A B C D);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::RLPEncode;

    #[test]
    fn decode_integers() {
        assert_eq!(u64::decode(&[0x80]).unwrap(), 0);
        assert_eq!(u64::decode(&[0x07]).unwrap(), 7);
        assert_eq!(u64::decode(&[0x82, 0x04, 0x00]).unwrap(), 1024);
        // Leading zeros are not canonical
        assert!(u64::decode(&[0x82, 0x00, 0x01]).is_err());
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        assert!(u64::decode(&[0x01, 0x02]).is_err());
        let (value, rest) = u64::decode_unfinished(&[0x01, 0x02]).unwrap();
        assert_eq!(value, 1);
        assert_eq!(rest, &[0x02]);
    }

    #[test]
    fn decode_vec_round_trip() {
        let values: Vec<u64> = vec![0, 1, 0xffff, 1 << 40];
        let encoded = values.encode_to_vec();
        assert_eq!(Vec::<u64>::decode(&encoded).unwrap(), values);
    }

    #[test]
    fn decode_string_round_trip() {
        let encoded = "hello world".encode_to_vec();
        assert_eq!(String::decode(&encoded).unwrap(), "hello world");
    }

    #[test]
    fn decode_ip_round_trip() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(IpAddr::decode(&ip.encode_to_vec()).unwrap(), ip);
        let ip6: IpAddr = "::1".parse().unwrap();
        assert_eq!(IpAddr::decode(&ip6.encode_to_vec()).unwrap(), ip6);
    }

    #[test]
    fn decode_tuple_round_trip() {
        let value = (7u8, 1024u64, true);
        let encoded = value.encode_to_vec();
        assert_eq!(<(u8, u64, bool)>::decode(&encoded).unwrap(), value);
    }
}
