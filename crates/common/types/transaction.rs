use bytes::Bytes;
use ethereum_types::{Address, H256, U256};
use ethrune_crypto::{
    CryptoError,
    keccak::keccak_hash,
    secp::{pk2id, recover_public_key, sign_digest},
};
use ethrune_rlp::{
    decode::{RLPDecode, decode_rlp_item},
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use secp256k1::SecretKey;

pub type AccessList = Vec<(Address, Vec<H256>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxType {
    Legacy = 0x00,
    Eip2930 = 0x01,
    Eip1559 = 0x02,
    Eip4844 = 0x03,
}

impl TxType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Legacy),
            0x01 => Some(Self::Eip2930),
            0x02 => Some(Self::Eip1559),
            0x03 => Some(Self::Eip4844),
            _ => None,
        }
    }
}

/// Call target of a transaction: an address, or contract creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TxKind {
    Call(Address),
    #[default]
    Create,
}

impl RLPEncode for TxKind {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        match self {
            Self::Call(address) => address.encode(buf),
            Self::Create => buf.put_u8(0x80),
        }
    }
}

impl RLPDecode for TxKind {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (is_list, payload, rest) = decode_rlp_item(rlp)?;
        if is_list {
            return Err(RLPDecodeError::UnexpectedList);
        }
        match payload.len() {
            0 => Ok((Self::Create, rest)),
            20 => Ok((Self::Call(Address::from_slice(payload)), rest)),
            _ => Err(RLPDecodeError::InvalidLength),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    pub to: TxKind,
    pub value: U256,
    pub data: Bytes,
    pub v: u64,
    pub r: U256,
    pub s: U256,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Eip2930Transaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    pub to: TxKind,
    pub value: U256,
    pub data: Bytes,
    pub access_list: AccessList,
    pub signature_y_parity: bool,
    pub signature_r: U256,
    pub signature_s: U256,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Eip1559Transaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub max_priority_fee_per_gas: u64,
    pub max_fee_per_gas: u64,
    pub gas_limit: u64,
    pub to: TxKind,
    pub value: U256,
    pub data: Bytes,
    pub access_list: AccessList,
    pub signature_y_parity: bool,
    pub signature_r: U256,
    pub signature_s: U256,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Eip4844Transaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub max_priority_fee_per_gas: u64,
    pub max_fee_per_gas: u64,
    pub gas_limit: u64,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub access_list: AccessList,
    pub max_fee_per_blob_gas: U256,
    pub blob_versioned_hashes: Vec<H256>,
    pub signature_y_parity: bool,
    pub signature_r: U256,
    pub signature_s: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    Legacy(LegacyTransaction),
    Eip2930(Eip2930Transaction),
    Eip1559(Eip1559Transaction),
    Eip4844(Eip4844Transaction),
}

impl Transaction {
    pub fn tx_type(&self) -> TxType {
        match self {
            Self::Legacy(_) => TxType::Legacy,
            Self::Eip2930(_) => TxType::Eip2930,
            Self::Eip1559(_) => TxType::Eip1559,
            Self::Eip4844(_) => TxType::Eip4844,
        }
    }

    pub fn nonce(&self) -> u64 {
        match self {
            Self::Legacy(tx) => tx.nonce,
            Self::Eip2930(tx) => tx.nonce,
            Self::Eip1559(tx) => tx.nonce,
            Self::Eip4844(tx) => tx.nonce,
        }
    }

    pub fn gas_limit(&self) -> u64 {
        match self {
            Self::Legacy(tx) => tx.gas_limit,
            Self::Eip2930(tx) => tx.gas_limit,
            Self::Eip1559(tx) => tx.gas_limit,
            Self::Eip4844(tx) => tx.gas_limit,
        }
    }

    pub fn value(&self) -> U256 {
        match self {
            Self::Legacy(tx) => tx.value,
            Self::Eip2930(tx) => tx.value,
            Self::Eip1559(tx) => tx.value,
            Self::Eip4844(tx) => tx.value,
        }
    }

    pub fn data(&self) -> &Bytes {
        match self {
            Self::Legacy(tx) => &tx.data,
            Self::Eip2930(tx) => &tx.data,
            Self::Eip1559(tx) => &tx.data,
            Self::Eip4844(tx) => &tx.data,
        }
    }

    /// Priority fee received by the miner. Equals the gas price for
    /// legacy/2930 transactions.
    pub fn tip(&self) -> u64 {
        match self {
            Self::Legacy(tx) => tx.gas_price,
            Self::Eip2930(tx) => tx.gas_price,
            Self::Eip1559(tx) => tx.max_priority_fee_per_gas,
            Self::Eip4844(tx) => tx.max_priority_fee_per_gas,
        }
    }

    /// Maximum total fee per gas the sender committed to.
    pub fn max_fee(&self) -> u64 {
        match self {
            Self::Legacy(tx) => tx.gas_price,
            Self::Eip2930(tx) => tx.gas_price,
            Self::Eip1559(tx) => tx.max_fee_per_gas,
            Self::Eip4844(tx) => tx.max_fee_per_gas,
        }
    }

    pub fn chain_id(&self) -> Option<u64> {
        match self {
            Self::Legacy(tx) => tx.derived_chain_id(),
            Self::Eip2930(tx) => Some(tx.chain_id),
            Self::Eip1559(tx) => Some(tx.chain_id),
            Self::Eip4844(tx) => Some(tx.chain_id),
        }
    }

    /// Upper bound of wei the sender may spend: `value + max_fee * gas_limit`.
    pub fn max_cost(&self) -> U256 {
        self.value() + U256::from(self.max_fee()) * U256::from(self.gas_limit())
    }

    pub fn is_signed(&self) -> bool {
        let (r, s) = match self {
            Self::Legacy(tx) => (tx.r, tx.s),
            Self::Eip2930(tx) => (tx.signature_r, tx.signature_s),
            Self::Eip1559(tx) => (tx.signature_r, tx.signature_s),
            Self::Eip4844(tx) => (tx.signature_r, tx.signature_s),
        };
        !r.is_zero() && !s.is_zero()
    }

    /// Transaction hash: keccak-256 of the canonical encoding.
    pub fn hash(&self) -> H256 {
        keccak_hash(self.encode_canonical())
    }

    /// Canonical encoding: plain RLP for legacy transactions, type byte
    /// followed by the RLP payload for typed ones.
    pub fn encode_canonical(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Legacy(tx) => tx.encode(&mut buf),
            Self::Eip2930(tx) => {
                buf.push(TxType::Eip2930 as u8);
                tx.encode(&mut buf);
            }
            Self::Eip1559(tx) => {
                buf.push(TxType::Eip1559 as u8);
                tx.encode(&mut buf);
            }
            Self::Eip4844(tx) => {
                buf.push(TxType::Eip4844 as u8);
                tx.encode(&mut buf);
            }
        }
        buf
    }

    pub fn decode_canonical(bytes: &[u8]) -> Result<Self, RLPDecodeError> {
        let first = *bytes.first().ok_or(RLPDecodeError::InvalidLength)?;
        if first >= 0xc0 {
            return Ok(Self::Legacy(LegacyTransaction::decode(bytes)?));
        }
        let tx_type = TxType::from_byte(first).ok_or(RLPDecodeError::Custom(format!(
            "Unknown transaction type: {first:#x}"
        )))?;
        match tx_type {
            TxType::Legacy => Err(RLPDecodeError::MalformedData),
            TxType::Eip2930 => Ok(Self::Eip2930(Eip2930Transaction::decode(&bytes[1..])?)),
            TxType::Eip1559 => Ok(Self::Eip1559(Eip1559Transaction::decode(&bytes[1..])?)),
            TxType::Eip4844 => Ok(Self::Eip4844(Eip4844Transaction::decode(&bytes[1..])?)),
        }
    }

    /// Recovers the sender address from the signature.
    pub fn sender(&self) -> Result<Address, CryptoError> {
        let (digest, recovery_id, r, s) = match self {
            Self::Legacy(tx) => {
                let (recovery_id, digest) = tx.recovery_data()?;
                (digest, recovery_id, tx.r, tx.s)
            }
            Self::Eip2930(tx) => (
                tx.signing_hash(),
                tx.signature_y_parity as u8,
                tx.signature_r,
                tx.signature_s,
            ),
            Self::Eip1559(tx) => (
                tx.signing_hash(),
                tx.signature_y_parity as u8,
                tx.signature_r,
                tx.signature_s,
            ),
            Self::Eip4844(tx) => (
                tx.signing_hash(),
                tx.signature_y_parity as u8,
                tx.signature_r,
                tx.signature_s,
            ),
        };
        let mut signature = [0u8; 65];
        signature[..32].copy_from_slice(&r.to_big_endian());
        signature[32..64].copy_from_slice(&s.to_big_endian());
        signature[64] = recovery_id;
        let public_key = recover_public_key(digest, &signature)?;
        let id = pk2id(&public_key);
        Ok(Address::from_slice(&keccak_hash(id.as_bytes())[12..]))
    }

    /// Signs the transaction in place with the given key.
    pub fn sign(&mut self, secret_key: &SecretKey) -> Result<(), CryptoError> {
        match self {
            Self::Legacy(tx) => {
                let chain_id = tx.derived_chain_id();
                let signature = sign_digest(tx.signing_hash(chain_id), secret_key)?;
                tx.r = U256::from_big_endian(&signature[..32]);
                tx.s = U256::from_big_endian(&signature[32..64]);
                tx.v = match chain_id {
                    Some(chain_id) => chain_id * 2 + 35 + signature[64] as u64,
                    None => 27 + signature[64] as u64,
                };
            }
            Self::Eip2930(tx) => {
                let signature = sign_digest(tx.signing_hash(), secret_key)?;
                tx.signature_r = U256::from_big_endian(&signature[..32]);
                tx.signature_s = U256::from_big_endian(&signature[32..64]);
                tx.signature_y_parity = signature[64] == 1;
            }
            Self::Eip1559(tx) => {
                let signature = sign_digest(tx.signing_hash(), secret_key)?;
                tx.signature_r = U256::from_big_endian(&signature[..32]);
                tx.signature_s = U256::from_big_endian(&signature[32..64]);
                tx.signature_y_parity = signature[64] == 1;
            }
            Self::Eip4844(tx) => {
                let signature = sign_digest(tx.signing_hash(), secret_key)?;
                tx.signature_r = U256::from_big_endian(&signature[..32]);
                tx.signature_s = U256::from_big_endian(&signature[32..64]);
                tx.signature_y_parity = signature[64] == 1;
            }
        }
        Ok(())
    }
}

impl LegacyTransaction {
    /// Chain id derived from `v` for EIP-155 signatures, `None` for
    /// pre-155 ones.
    pub fn derived_chain_id(&self) -> Option<u64> {
        if self.v >= 35 {
            Some((self.v - 35) / 2)
        } else {
            None
        }
    }

    fn recovery_data(&self) -> Result<(u8, H256), CryptoError> {
        match self.v {
            27 | 28 => Ok(((self.v - 27) as u8, self.signing_hash(None))),
            v if v >= 35 => {
                let chain_id = (v - 35) / 2;
                Ok((((v - 35) % 2) as u8, self.signing_hash(Some(chain_id))))
            }
            _ => Err(CryptoError::InvalidRecoveryId),
        }
    }

    fn signing_hash(&self, chain_id: Option<u64>) -> H256 {
        let mut buf = Vec::new();
        let encoder = Encoder::new(&mut buf)
            .encode_field(&self.nonce)
            .encode_field(&self.gas_price)
            .encode_field(&self.gas_limit)
            .encode_field(&self.to)
            .encode_field(&self.value)
            .encode_field(&self.data);
        match chain_id {
            Some(chain_id) => encoder
                .encode_field(&chain_id)
                .encode_field(&0u8)
                .encode_field(&0u8)
                .finish(),
            None => encoder.finish(),
        }
        keccak_hash(&buf)
    }
}

impl Eip2930Transaction {
    fn signing_hash(&self) -> H256 {
        let mut buf = vec![TxType::Eip2930 as u8];
        Encoder::new(&mut buf)
            .encode_field(&self.chain_id)
            .encode_field(&self.nonce)
            .encode_field(&self.gas_price)
            .encode_field(&self.gas_limit)
            .encode_field(&self.to)
            .encode_field(&self.value)
            .encode_field(&self.data)
            .encode_field(&self.access_list)
            .finish();
        keccak_hash(&buf)
    }
}

impl Eip1559Transaction {
    fn signing_hash(&self) -> H256 {
        let mut buf = vec![TxType::Eip1559 as u8];
        Encoder::new(&mut buf)
            .encode_field(&self.chain_id)
            .encode_field(&self.nonce)
            .encode_field(&self.max_priority_fee_per_gas)
            .encode_field(&self.max_fee_per_gas)
            .encode_field(&self.gas_limit)
            .encode_field(&self.to)
            .encode_field(&self.value)
            .encode_field(&self.data)
            .encode_field(&self.access_list)
            .finish();
        keccak_hash(&buf)
    }
}

impl Eip4844Transaction {
    fn signing_hash(&self) -> H256 {
        let mut buf = vec![TxType::Eip4844 as u8];
        Encoder::new(&mut buf)
            .encode_field(&self.chain_id)
            .encode_field(&self.nonce)
            .encode_field(&self.max_priority_fee_per_gas)
            .encode_field(&self.max_fee_per_gas)
            .encode_field(&self.gas_limit)
            .encode_field(&self.to)
            .encode_field(&self.value)
            .encode_field(&self.data)
            .encode_field(&self.access_list)
            .encode_field(&self.max_fee_per_blob_gas)
            .encode_field(&self.blob_versioned_hashes)
            .finish();
        keccak_hash(&buf)
    }
}

impl RLPEncode for LegacyTransaction {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.nonce)
            .encode_field(&self.gas_price)
            .encode_field(&self.gas_limit)
            .encode_field(&self.to)
            .encode_field(&self.value)
            .encode_field(&self.data)
            .encode_field(&self.v)
            .encode_field(&self.r)
            .encode_field(&self.s)
            .finish();
    }
}

impl RLPDecode for LegacyTransaction {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (nonce, decoder) = decoder.decode_field("nonce")?;
        let (gas_price, decoder) = decoder.decode_field("gas_price")?;
        let (gas_limit, decoder) = decoder.decode_field("gas_limit")?;
        let (to, decoder) = decoder.decode_field("to")?;
        let (value, decoder) = decoder.decode_field("value")?;
        let (data, decoder) = decoder.decode_field("data")?;
        let (v, decoder) = decoder.decode_field("v")?;
        let (r, decoder) = decoder.decode_field("r")?;
        let (s, decoder) = decoder.decode_field("s")?;
        let remaining = decoder.finish()?;
        let tx = LegacyTransaction {
            nonce,
            gas_price,
            gas_limit,
            to,
            value,
            data,
            v,
            r,
            s,
        };
        Ok((tx, remaining))
    }
}

impl RLPEncode for Eip2930Transaction {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.chain_id)
            .encode_field(&self.nonce)
            .encode_field(&self.gas_price)
            .encode_field(&self.gas_limit)
            .encode_field(&self.to)
            .encode_field(&self.value)
            .encode_field(&self.data)
            .encode_field(&self.access_list)
            .encode_field(&self.signature_y_parity)
            .encode_field(&self.signature_r)
            .encode_field(&self.signature_s)
            .finish();
    }
}

impl RLPDecode for Eip2930Transaction {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (chain_id, decoder) = decoder.decode_field("chain_id")?;
        let (nonce, decoder) = decoder.decode_field("nonce")?;
        let (gas_price, decoder) = decoder.decode_field("gas_price")?;
        let (gas_limit, decoder) = decoder.decode_field("gas_limit")?;
        let (to, decoder) = decoder.decode_field("to")?;
        let (value, decoder) = decoder.decode_field("value")?;
        let (data, decoder) = decoder.decode_field("data")?;
        let (access_list, decoder) = decoder.decode_field("access_list")?;
        let (signature_y_parity, decoder) = decoder.decode_field("signature_y_parity")?;
        let (signature_r, decoder) = decoder.decode_field("signature_r")?;
        let (signature_s, decoder) = decoder.decode_field("signature_s")?;
        let remaining = decoder.finish()?;
        let tx = Eip2930Transaction {
            chain_id,
            nonce,
            gas_price,
            gas_limit,
            to,
            value,
            data,
            access_list,
            signature_y_parity,
            signature_r,
            signature_s,
        };
        Ok((tx, remaining))
    }
}

impl RLPEncode for Eip1559Transaction {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.chain_id)
            .encode_field(&self.nonce)
            .encode_field(&self.max_priority_fee_per_gas)
            .encode_field(&self.max_fee_per_gas)
            .encode_field(&self.gas_limit)
            .encode_field(&self.to)
            .encode_field(&self.value)
            .encode_field(&self.data)
            .encode_field(&self.access_list)
            .encode_field(&self.signature_y_parity)
            .encode_field(&self.signature_r)
            .encode_field(&self.signature_s)
            .finish();
    }
}

impl RLPDecode for Eip1559Transaction {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (chain_id, decoder) = decoder.decode_field("chain_id")?;
        let (nonce, decoder) = decoder.decode_field("nonce")?;
        let (max_priority_fee_per_gas, decoder) =
            decoder.decode_field("max_priority_fee_per_gas")?;
        let (max_fee_per_gas, decoder) = decoder.decode_field("max_fee_per_gas")?;
        let (gas_limit, decoder) = decoder.decode_field("gas_limit")?;
        let (to, decoder) = decoder.decode_field("to")?;
        let (value, decoder) = decoder.decode_field("value")?;
        let (data, decoder) = decoder.decode_field("data")?;
        let (access_list, decoder) = decoder.decode_field("access_list")?;
        let (signature_y_parity, decoder) = decoder.decode_field("signature_y_parity")?;
        let (signature_r, decoder) = decoder.decode_field("signature_r")?;
        let (signature_s, decoder) = decoder.decode_field("signature_s")?;
        let remaining = decoder.finish()?;
        let tx = Eip1559Transaction {
            chain_id,
            nonce,
            max_priority_fee_per_gas,
            max_fee_per_gas,
            gas_limit,
            to,
            value,
            data,
            access_list,
            signature_y_parity,
            signature_r,
            signature_s,
        };
        Ok((tx, remaining))
    }
}

impl RLPEncode for Eip4844Transaction {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.chain_id)
            .encode_field(&self.nonce)
            .encode_field(&self.max_priority_fee_per_gas)
            .encode_field(&self.max_fee_per_gas)
            .encode_field(&self.gas_limit)
            .encode_field(&self.to)
            .encode_field(&self.value)
            .encode_field(&self.data)
            .encode_field(&self.access_list)
            .encode_field(&self.max_fee_per_blob_gas)
            .encode_field(&self.blob_versioned_hashes)
            .encode_field(&self.signature_y_parity)
            .encode_field(&self.signature_r)
            .encode_field(&self.signature_s)
            .finish();
    }
}

impl RLPDecode for Eip4844Transaction {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (chain_id, decoder) = decoder.decode_field("chain_id")?;
        let (nonce, decoder) = decoder.decode_field("nonce")?;
        let (max_priority_fee_per_gas, decoder) =
            decoder.decode_field("max_priority_fee_per_gas")?;
        let (max_fee_per_gas, decoder) = decoder.decode_field("max_fee_per_gas")?;
        let (gas_limit, decoder) = decoder.decode_field("gas_limit")?;
        let (to, decoder) = decoder.decode_field("to")?;
        let (value, decoder) = decoder.decode_field("value")?;
        let (data, decoder) = decoder.decode_field("data")?;
        let (access_list, decoder) = decoder.decode_field("access_list")?;
        let (max_fee_per_blob_gas, decoder) = decoder.decode_field("max_fee_per_blob_gas")?;
        let (blob_versioned_hashes, decoder) = decoder.decode_field("blob_versioned_hashes")?;
        let (signature_y_parity, decoder) = decoder.decode_field("signature_y_parity")?;
        let (signature_r, decoder) = decoder.decode_field("signature_r")?;
        let (signature_s, decoder) = decoder.decode_field("signature_s")?;
        let remaining = decoder.finish()?;
        let tx = Eip4844Transaction {
            chain_id,
            nonce,
            max_priority_fee_per_gas,
            max_fee_per_gas,
            gas_limit,
            to,
            value,
            data,
            access_list,
            max_fee_per_blob_gas,
            blob_versioned_hashes,
            signature_y_parity,
            signature_r,
            signature_s,
        };
        Ok((tx, remaining))
    }
}

// Inside lists (block bodies, Transactions messages) a legacy transaction is
// a plain RLP list while a typed one is the canonical encoding wrapped in an
// RLP string.
impl RLPEncode for Transaction {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        match self {
            Self::Legacy(tx) => tx.encode(buf),
            _ => ethrune_rlp::encode::encode_bytes(&self.encode_canonical(), buf),
        }
    }
}

impl RLPDecode for Transaction {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (is_list, payload, rest) = decode_rlp_item(rlp)?;
        if is_list {
            let consumed = rlp.len() - rest.len();
            let tx = LegacyTransaction::decode(&rlp[..consumed])?;
            Ok((Self::Legacy(tx), rest))
        } else {
            Ok((Self::decode_canonical(payload)?, rest))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethrune_crypto::secp::public_key;
    use rand::rngs::OsRng;

    fn signed_eip1559(nonce: u64, tip: u64, max_fee: u64, key: &SecretKey) -> Transaction {
        let mut tx = Transaction::Eip1559(Eip1559Transaction {
            chain_id: 1,
            nonce,
            max_priority_fee_per_gas: tip,
            max_fee_per_gas: max_fee,
            gas_limit: 21_000,
            to: TxKind::Call(Address::from_low_u64_be(0xcafe)),
            value: U256::from(1000),
            ..Default::default()
        });
        tx.sign(key).unwrap();
        tx
    }

    #[test]
    fn eip1559_round_trips_to_same_hash() {
        let key = SecretKey::new(&mut OsRng);
        let tx = signed_eip1559(0, 1, 10, &key);
        let encoded = tx.encode_canonical();
        let decoded = Transaction::decode_canonical(&encoded).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.hash(), tx.hash());
    }

    #[test]
    fn sender_recovery_matches_signer() {
        let key = SecretKey::new(&mut OsRng);
        let tx = signed_eip1559(3, 2, 20, &key);
        let id = pk2id(&public_key(&key));
        let expected = Address::from_slice(&keccak_hash(id.as_bytes())[12..]);
        assert_eq!(tx.sender().unwrap(), expected);
    }

    #[test]
    fn legacy_eip155_signing_round_trip() {
        let key = SecretKey::new(&mut OsRng);
        let mut tx = Transaction::Legacy(LegacyTransaction {
            nonce: 1,
            gas_price: 5,
            gas_limit: 21_000,
            to: TxKind::Call(Address::from_low_u64_be(1)),
            value: U256::from(7),
            v: 37, // marks the tx as EIP-155 over chain id 1 before signing
            ..Default::default()
        });
        tx.sign(&key).unwrap();
        assert!(tx.is_signed());
        assert_eq!(tx.chain_id(), Some(1));

        let id = pk2id(&public_key(&key));
        let expected = Address::from_slice(&keccak_hash(id.as_bytes())[12..]);
        assert_eq!(tx.sender().unwrap(), expected);
    }

    #[test]
    fn pricing_follows_transaction_type() {
        let legacy = Transaction::Legacy(LegacyTransaction {
            gas_price: 42,
            ..Default::default()
        });
        assert_eq!(legacy.tip(), 42);
        assert_eq!(legacy.max_fee(), 42);

        let dynamic = Transaction::Eip1559(Eip1559Transaction {
            max_priority_fee_per_gas: 2,
            max_fee_per_gas: 100,
            ..Default::default()
        });
        assert_eq!(dynamic.tip(), 2);
        assert_eq!(dynamic.max_fee(), 100);
    }

    #[test]
    fn typed_transaction_in_list_encodes_as_string() {
        let key = SecretKey::new(&mut OsRng);
        let txs = vec![signed_eip1559(0, 1, 10, &key)];
        let encoded = txs.encode_to_vec();
        let decoded = Vec::<Transaction>::decode(&encoded).unwrap();
        assert_eq!(decoded, txs);
    }
}
