use super::{
    ecies::{ECIES_OVERHEAD, decrypt_message, encrypt_message},
    error::RLPxError,
};
use ethereum_types::{H256, H512};
use ethrune_crypto::{
    keccak::{keccak_concat, keccak_hash},
    secp::{ecdh_xchng, id2pk, pk2id, public_key, recover_public_key, sign_digest},
};
use ethrune_rlp::structs::Decoder;
use rand::{Rng, rngs::OsRng};
use secp256k1::{PublicKey, SecretKey};
use sha3::{Digest, Keccak256};
use tokio::io::{AsyncRead, AsyncReadExt};

pub(crate) type Aes256Ctr64BE = ctr::Ctr64BE<aes::Aes256>;

/// Plain AUTH body: `sig(65) || keccak(ephem-id)(32) || static-id(64) ||
/// nonce(32) || 0x00`, plus the envelope.
pub const LEGACY_AUTH_SIZE: usize = 194 + ECIES_OVERHEAD;
/// Plain ACK body: `ephem-id(64) || nonce(32) || 0x00`, plus the envelope.
pub const LEGACY_ACK_SIZE: usize = 97 + ECIES_OVERHEAD;

const HANDSHAKE_VERSION: u8 = 4;

/// Ciphers and MAC states derived from a completed handshake. Egress and
/// ingress AES streams run AES-256-CTR with a zero IV.
pub struct Secrets {
    pub remote_node_id: H512,
    pub mac_key: H256,
    pub ingress_mac: Keccak256,
    pub egress_mac: Keccak256,
    pub ingress_aes: Aes256Ctr64BE,
    pub egress_aes: Aes256Ctr64BE,
}

/// One side of the AUTH/ACK exchange. Both the length-prefixed RLP form and
/// the fixed-size legacy one are produced and accepted.
pub struct Handshake {
    secret_key: SecretKey,
    nonce: H256,
    ephemeral_key: SecretKey,
    require_eip8: bool,
    remote_static_pubkey: Option<PublicKey>,
    remote_nonce: Option<H256>,
    remote_ephemeral_pubkey: Option<PublicKey>,
    /// Wire bytes of the message we sent (prefix included), MAC seed input.
    init_message: Vec<u8>,
    /// Wire bytes of the message the peer sent.
    remote_init_message: Vec<u8>,
    /// The peer opened with the length-prefixed format; answer in kind.
    received_eip8: bool,
}

impl Handshake {
    pub fn new(secret_key: SecretKey, require_eip8: bool) -> Self {
        Self {
            secret_key,
            nonce: H256::random(),
            ephemeral_key: SecretKey::new(&mut OsRng),
            require_eip8,
            remote_static_pubkey: None,
            remote_nonce: None,
            remote_ephemeral_pubkey: None,
            init_message: Vec::new(),
            remote_init_message: Vec::new(),
            received_eip8: false,
        }
    }

    /// Initiator side: builds the AUTH message for the given remote id.
    pub fn encode_auth(&mut self, remote_id: H512) -> Result<Vec<u8>, RLPxError> {
        let remote_pubkey = id2pk(remote_id)?;
        self.remote_static_pubkey = Some(remote_pubkey);

        let static_shared = ecdh_xchng(&remote_pubkey, &self.secret_key);
        let digest = H256(static_shared) ^ self.nonce;
        let signature = sign_digest(digest, &self.ephemeral_key)?;
        let static_id = pk2id(&public_key(&self.secret_key));

        let message = if self.require_eip8 {
            let mut body = Vec::new();
            ethrune_rlp::structs::Encoder::new(&mut body)
                .encode_field(&signature)
                .encode_field(&static_id)
                .encode_field(&self.nonce)
                .encode_field(&HANDSHAKE_VERSION)
                .finish();
            // At least 100 bytes of random padding distinguish the format
            // from the fixed-size one.
            let padding_len = OsRng.gen_range(100..=250);
            body.extend((0..padding_len).map(|_| OsRng.r#gen::<u8>()));

            let size = (body.len() + ECIES_OVERHEAD) as u16;
            let prefix = size.to_be_bytes();
            let sealed = encrypt_message(&remote_pubkey, body, &prefix)?;
            [prefix.as_slice(), &sealed].concat()
        } else {
            let ephemeral_id = pk2id(&public_key(&self.ephemeral_key));
            let body = [
                signature.as_slice(),
                keccak_hash(ephemeral_id.as_bytes()).as_bytes(),
                static_id.as_bytes(),
                self.nonce.as_bytes(),
                &[0x00],
            ]
            .concat();
            encrypt_message(&remote_pubkey, body, &[])?
        };
        self.init_message = message.clone();
        Ok(message)
    }

    /// Responder side: opens an AUTH message (either format, full wire
    /// bytes) and returns the initiator's id.
    pub fn decode_auth(&mut self, message: &[u8]) -> Result<H512, RLPxError> {
        self.remote_init_message = message.to_vec();
        let (signature, static_id, remote_nonce) = if message.first() == Some(&0x04) {
            if message.len() != LEGACY_AUTH_SIZE {
                return Err(RLPxError::InvalidMessageLength);
            }
            let body = decrypt_message(&self.secret_key, message, &[])?;
            if body.len() != 194 {
                return Err(RLPxError::InvalidMessageLength);
            }
            let signature: [u8; 65] = body[..65]
                .try_into()
                .map_err(|_| RLPxError::InvalidMessageLength)?;
            let static_id = H512::from_slice(&body[97..161]);
            let nonce = H256::from_slice(&body[161..193]);
            (signature, static_id, nonce)
        } else {
            self.received_eip8 = true;
            let (prefix, sealed) = split_prefixed(message)?;
            let body = decrypt_message(&self.secret_key, sealed, prefix)?;
            let decoder = Decoder::new(&body)?;
            let (signature, decoder): ([u8; 65], _) = decoder.decode_field("signature")?;
            let (static_id, decoder) = decoder.decode_field("static_id")?;
            let (nonce, decoder) = decoder.decode_field("nonce")?;
            let (_version, decoder): (u8, _) = decoder.decode_field("version")?;
            // Trailing list fields and padding are future-proofing; skip.
            decoder.finish_unchecked();
            (signature, static_id, nonce)
        };

        let remote_pubkey = id2pk(static_id)?;
        self.remote_static_pubkey = Some(remote_pubkey);
        self.remote_nonce = Some(remote_nonce);

        // The signature covers the static shared secret xored with the
        // nonce, under the initiator's ephemeral key.
        let static_shared = ecdh_xchng(&remote_pubkey, &self.secret_key);
        let digest = H256(static_shared) ^ remote_nonce;
        self.remote_ephemeral_pubkey = Some(recover_public_key(digest, &signature)?);
        Ok(static_id)
    }

    /// Responder side: builds the ACK, mirroring the format the AUTH used.
    pub fn encode_ack(&mut self) -> Result<Vec<u8>, RLPxError> {
        let remote_pubkey = self
            .remote_static_pubkey
            .ok_or_else(|| RLPxError::HandshakeError("ack before auth".to_string()))?;
        let ephemeral_id = pk2id(&public_key(&self.ephemeral_key));

        let message = if self.received_eip8 {
            let mut body = Vec::new();
            ethrune_rlp::structs::Encoder::new(&mut body)
                .encode_field(&ephemeral_id)
                .encode_field(&self.nonce)
                .encode_field(&HANDSHAKE_VERSION)
                .finish();
            let padding_len = OsRng.gen_range(100..=250);
            body.extend((0..padding_len).map(|_| OsRng.r#gen::<u8>()));

            let size = (body.len() + ECIES_OVERHEAD) as u16;
            let prefix = size.to_be_bytes();
            let sealed = encrypt_message(&remote_pubkey, body, &prefix)?;
            [prefix.as_slice(), &sealed].concat()
        } else {
            let body = [
                ephemeral_id.as_bytes(),
                self.nonce.as_bytes(),
                &[0x00],
            ]
            .concat();
            encrypt_message(&remote_pubkey, body, &[])?
        };
        self.init_message = message.clone();
        Ok(message)
    }

    /// Initiator side: opens the ACK (either format, full wire bytes).
    pub fn decode_ack(&mut self, message: &[u8]) -> Result<(), RLPxError> {
        self.remote_init_message = message.to_vec();
        let (ephemeral_id, remote_nonce) = if message.first() == Some(&0x04) {
            if message.len() != LEGACY_ACK_SIZE {
                return Err(RLPxError::InvalidMessageLength);
            }
            let body = decrypt_message(&self.secret_key, message, &[])?;
            if body.len() != 97 {
                return Err(RLPxError::InvalidMessageLength);
            }
            let ephemeral_id = H512::from_slice(&body[..64]);
            let nonce = H256::from_slice(&body[64..96]);
            (ephemeral_id, nonce)
        } else {
            let (prefix, sealed) = split_prefixed(message)?;
            let body = decrypt_message(&self.secret_key, sealed, prefix)?;
            let decoder = Decoder::new(&body)?;
            let (ephemeral_id, decoder) = decoder.decode_field("ephemeral_id")?;
            let (nonce, decoder) = decoder.decode_field("nonce")?;
            let (_version, decoder): (u8, _) = decoder.decode_field("version")?;
            decoder.finish_unchecked();
            (ephemeral_id, nonce)
        };
        self.remote_ephemeral_pubkey = Some(id2pk(ephemeral_id)?);
        self.remote_nonce = Some(remote_nonce);
        Ok(())
    }

    /// Key schedule, identical on both sides once AUTH/ACK are exchanged.
    pub fn derive_secrets(&self, initiator: bool) -> Result<Secrets, RLPxError> {
        let remote_ephemeral = self
            .remote_ephemeral_pubkey
            .ok_or_else(|| RLPxError::HandshakeError("incomplete handshake".to_string()))?;
        let remote_nonce = self
            .remote_nonce
            .ok_or_else(|| RLPxError::HandshakeError("incomplete handshake".to_string()))?;
        let remote_static = self
            .remote_static_pubkey
            .ok_or_else(|| RLPxError::HandshakeError("incomplete handshake".to_string()))?;

        let ephemeral_shared = ecdh_xchng(&remote_ephemeral, &self.ephemeral_key);
        let (initiator_nonce, recipient_nonce) = if initiator {
            (self.nonce, remote_nonce)
        } else {
            (remote_nonce, self.nonce)
        };
        let h_nonce = keccak_concat(&[recipient_nonce.as_bytes(), initiator_nonce.as_bytes()]);
        let shared_secret = keccak_concat(&[&ephemeral_shared, h_nonce.as_bytes()]);
        let aes_secret = keccak_concat(&[&ephemeral_shared, shared_secret.as_bytes()]);
        let mac_secret = keccak_concat(&[&ephemeral_shared, aes_secret.as_bytes()]);

        let mut egress_mac = Keccak256::default();
        egress_mac.update(mac_secret ^ remote_nonce);
        egress_mac.update(&self.init_message);

        let mut ingress_mac = Keccak256::default();
        ingress_mac.update(mac_secret ^ self.nonce);
        ingress_mac.update(&self.remote_init_message);

        let zero_iv = [0u8; 16];
        let ingress_aes = <Aes256Ctr64BE as aes::cipher::KeyIvInit>::new(
            &aes_secret.0.into(),
            &zero_iv.into(),
        );
        let egress_aes = <Aes256Ctr64BE as aes::cipher::KeyIvInit>::new(
            &aes_secret.0.into(),
            &zero_iv.into(),
        );

        Ok(Secrets {
            remote_node_id: pk2id(&remote_static),
            mac_key: mac_secret,
            ingress_mac,
            egress_mac,
            ingress_aes,
            egress_aes,
        })
    }
}

fn split_prefixed(message: &[u8]) -> Result<(&[u8], &[u8]), RLPxError> {
    if message.len() < 2 {
        return Err(RLPxError::InvalidMessageLength);
    }
    let (prefix, sealed) = message.split_at(2);
    let size = u16::from_be_bytes([prefix[0], prefix[1]]) as usize;
    if sealed.len() != size {
        return Err(RLPxError::InvalidMessageLength);
    }
    Ok((prefix, sealed))
}

/// Reads one handshake message off the stream. A leading `0x04` means the
/// fixed-size format; anything else is a two-byte big-endian length prefix
/// followed by that many bytes.
pub async fn read_handshake_message<S: AsyncRead + Unpin>(
    stream: &mut S,
    legacy_size: usize,
) -> Result<Vec<u8>, RLPxError> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let total = if head[0] == 0x04 {
        legacy_size
    } else {
        u16::from_be_bytes(head) as usize + 2
    };
    if total < 2 {
        return Err(RLPxError::InvalidMessageLength);
    }
    let mut message = vec![0u8; total];
    message[..2].copy_from_slice(&head);
    stream.read_exact(&mut message[2..]).await?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::StreamCipher as _;

    fn keypair() -> (SecretKey, H512) {
        let secret_key = SecretKey::new(&mut OsRng);
        (secret_key, pk2id(&public_key(&secret_key)))
    }

    fn run_handshake(require_eip8: bool) -> (Secrets, Secrets) {
        let (initiator_key, initiator_id) = keypair();
        let (responder_key, responder_id) = keypair();

        let mut initiator = Handshake::new(initiator_key, require_eip8);
        let mut responder = Handshake::new(responder_key, require_eip8);

        let auth = initiator.encode_auth(responder_id).unwrap();
        let recovered = responder.decode_auth(&auth).unwrap();
        assert_eq!(recovered, initiator_id);

        let ack = responder.encode_ack().unwrap();
        initiator.decode_ack(&ack).unwrap();

        (
            initiator.derive_secrets(true).unwrap(),
            responder.derive_secrets(false).unwrap(),
        )
    }

    #[test]
    fn eip8_handshake_derives_matching_secrets() {
        let (initiator, responder) = run_handshake(true);
        assert_eq!(initiator.mac_key, responder.mac_key);
        assert_ne!(initiator.remote_node_id, responder.remote_node_id);
    }

    #[test]
    fn legacy_handshake_derives_matching_secrets() {
        let (initiator, responder) = run_handshake(false);
        assert_eq!(initiator.mac_key, responder.mac_key);
    }

    #[test]
    fn legacy_messages_have_fixed_sizes() {
        let (initiator_key, _) = keypair();
        let (responder_key, responder_id) = keypair();
        let mut initiator = Handshake::new(initiator_key, false);
        let mut responder = Handshake::new(responder_key, false);

        let auth = initiator.encode_auth(responder_id).unwrap();
        assert_eq!(auth.len(), LEGACY_AUTH_SIZE);
        responder.decode_auth(&auth).unwrap();
        let ack = responder.encode_ack().unwrap();
        assert_eq!(ack.len(), LEGACY_ACK_SIZE);
    }

    #[test]
    fn egress_and_ingress_streams_pair_up() {
        let (mut initiator, mut responder) = run_handshake(true);

        let mut payload = b"sixteen byte blk".to_vec();
        initiator.egress_aes.apply_keystream(&mut payload);
        responder.ingress_aes.apply_keystream(&mut payload);
        assert_eq!(payload, b"sixteen byte blk");
    }

    #[test]
    fn responder_answers_in_the_format_the_auth_used() {
        let (initiator_key, _) = keypair();
        let (responder_key, responder_id) = keypair();

        // Legacy AUTH gets a legacy ACK even from an EIP-8-preferring peer.
        let mut initiator = Handshake::new(initiator_key, false);
        let mut responder = Handshake::new(responder_key, true);
        let auth = initiator.encode_auth(responder_id).unwrap();
        responder.decode_auth(&auth).unwrap();
        let ack = responder.encode_ack().unwrap();
        assert_eq!(ack.len(), LEGACY_ACK_SIZE);
        initiator.decode_ack(&ack).unwrap();

        let a = initiator.derive_secrets(true).unwrap();
        let b = responder.derive_secrets(false).unwrap();
        assert_eq!(a.mac_key, b.mac_key);
    }
}
