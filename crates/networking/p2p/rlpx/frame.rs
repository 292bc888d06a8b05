use super::{error::RLPxError, handshake::Secrets};
use crate::utils::constant_time_eq;
use aes::{
    Aes256Enc,
    cipher::{BlockEncrypt as _, KeyInit as _, StreamCipher as _},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use ethereum_types::H128;
use ethrune_rlp::{decode::RLPDecode, encode::RLPEncode};
use sha3::{Digest, Keccak256};
use tokio_util::codec::{Decoder, Encoder};

/// Frame cap, matching the three-byte size field.
const MAX_FRAME_SIZE: usize = 0xFFFFFF;

/// One frame: `rlp(code) || payload` on the inside,
/// `header(16) || header-mac(16) || body(padded to 16) || body-mac(16)` on the
/// wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u8,
    pub payload: Bytes,
}

/// Encrypting codec over a completed handshake. Each side owns one; the
/// egress and ingress cipher/MAC chains advance with every frame.
pub struct FrameCodec {
    secrets: Secrets,
    mac_cipher: Aes256Enc,
    /// Size of a frame whose header is processed but whose body has not
    /// fully arrived. The MAC chain must not re-run over the header.
    pending_body: Option<usize>,
}

impl FrameCodec {
    pub fn new(secrets: Secrets) -> Result<Self, RLPxError> {
        let mac_cipher = Aes256Enc::new_from_slice(secrets.mac_key.as_bytes())
            .map_err(|err| RLPxError::CryptographyError(err.to_string()))?;
        Ok(Self {
            secrets,
            mac_cipher,
            pending_body: None,
        })
    }

    pub fn remote_node_id(&self) -> ethereum_types::H512 {
        self.secrets.remote_node_id
    }

    /// `aes(mac-secret, digest[..16]) ^ seed_input`, the per-frame MAC seed.
    fn mac_seed(&self, digest: [u8; 16], seed_input: [u8; 16]) -> [u8; 16] {
        let mut block = digest.into();
        self.mac_cipher.encrypt_block(&mut block);
        (H128(block.into()) ^ H128(seed_input)).0
    }
}

fn mac_digest(mac: &Keccak256) -> Result<[u8; 16], RLPxError> {
    mac.clone().finalize()[..16]
        .try_into()
        .map_err(|_| RLPxError::CryptographyError("invalid mac digest".to_string()))
}

impl Encoder<Frame> for FrameCodec {
    type Error = RLPxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = Vec::with_capacity(frame.payload.len() + 1);
        frame.code.encode(&mut body);
        body.extend_from_slice(&frame.payload);
        let frame_size = body.len();
        if frame_size > MAX_FRAME_SIZE {
            return Err(RLPxError::InvalidMessageLength);
        }

        // header = frame-size || header-data || padding, with
        // header-data = [capability-id, context-id], both always zero.
        let mut header = Vec::with_capacity(32);
        header.extend_from_slice(&frame_size.to_be_bytes()[5..8]);
        (0u8, 0u8).encode(&mut header);
        header.resize(16, 0);
        self.secrets.egress_aes.apply_keystream(&mut header[..16]);

        let header_ciphertext: [u8; 16] = header[..16]
            .try_into()
            .map_err(|_| RLPxError::InvalidMessageLength)?;
        let seed = self.mac_seed(mac_digest(&self.secrets.egress_mac)?, header_ciphertext);
        self.secrets.egress_mac.update(seed);
        let header_mac = mac_digest(&self.secrets.egress_mac)?;
        dst.put_slice(&header);
        dst.put_slice(&header_mac);

        // Body, padded to the cipher block size.
        body.resize(frame_size.next_multiple_of(16), 0);
        self.secrets.egress_aes.apply_keystream(&mut body);
        self.secrets.egress_mac.update(&body);
        let digest = mac_digest(&self.secrets.egress_mac)?;
        let seed = self.mac_seed(digest, digest);
        self.secrets.egress_mac.update(seed);
        let body_mac = mac_digest(&self.secrets.egress_mac)?;
        dst.put_slice(&body);
        dst.put_slice(&body_mac);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = RLPxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let frame_size = match self.pending_body {
            Some(frame_size) => frame_size,
            None => {
                if src.len() < 32 {
                    // Not enough data for the frame header.
                    return Ok(None);
                }
                let header_ciphertext: [u8; 16] = src[..16]
                    .try_into()
                    .map_err(|_| RLPxError::InvalidMessageLength)?;
                let header_mac = &src[16..32];

                let seed =
                    self.mac_seed(mac_digest(&self.secrets.ingress_mac)?, header_ciphertext);
                self.secrets.ingress_mac.update(seed);
                let expected_header_mac = mac_digest(&self.secrets.ingress_mac)?;
                if !constant_time_eq(header_mac, &expected_header_mac) {
                    return Err(RLPxError::InvalidMac);
                }

                let mut header_plaintext = header_ciphertext;
                self.secrets.ingress_aes.apply_keystream(&mut header_plaintext);
                let frame_size = u32::from_be_bytes([
                    0,
                    header_plaintext[0],
                    header_plaintext[1],
                    header_plaintext[2],
                ]) as usize;
                if frame_size == 0 || frame_size > MAX_FRAME_SIZE {
                    return Err(RLPxError::InvalidMessageLength);
                }
                src.advance(32);
                self.pending_body = Some(frame_size);
                frame_size
            }
        };
        let padded_size = frame_size.next_multiple_of(16);

        if src.len() < padded_size + 16 {
            // The full body has not arrived yet.
            src.reserve(padded_size + 16 - src.len());
            return Ok(None);
        }
        self.pending_body = None;
        let mut body = src[..padded_size].to_vec();
        let body_mac = &src[padded_size..padded_size + 16];

        self.secrets.ingress_mac.update(&body);
        let digest = mac_digest(&self.secrets.ingress_mac)?;
        let seed = self.mac_seed(digest, digest);
        self.secrets.ingress_mac.update(seed);
        let expected_body_mac = mac_digest(&self.secrets.ingress_mac)?;
        if !constant_time_eq(body_mac, &expected_body_mac) {
            return Err(RLPxError::InvalidMac);
        }
        src.advance(padded_size + 16);

        self.secrets.ingress_aes.apply_keystream(&mut body);
        body.truncate(frame_size);
        let (code, payload) = u8::decode_unfinished(&body)?;
        Ok(Some(Frame {
            code,
            payload: Bytes::copy_from_slice(payload),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rlpx::handshake::Handshake;
    use ethrune_crypto::secp::{pk2id, public_key};
    use rand::rngs::OsRng;
    use secp256k1::SecretKey;

    fn paired_codecs() -> (FrameCodec, FrameCodec) {
        let initiator_key = SecretKey::new(&mut OsRng);
        let responder_key = SecretKey::new(&mut OsRng);
        let responder_id = pk2id(&public_key(&responder_key));

        let mut initiator = Handshake::new(initiator_key, true);
        let mut responder = Handshake::new(responder_key, true);
        let auth = initiator.encode_auth(responder_id).unwrap();
        responder.decode_auth(&auth).unwrap();
        let ack = responder.encode_ack().unwrap();
        initiator.decode_ack(&ack).unwrap();

        (
            FrameCodec::new(initiator.derive_secrets(true).unwrap()).unwrap(),
            FrameCodec::new(responder.derive_secrets(false).unwrap()).unwrap(),
        )
    }

    #[test]
    fn frame_round_trip_across_paired_codecs() {
        let (mut egress, mut ingress) = paired_codecs();
        let frame = Frame {
            code: 0x07,
            payload: Bytes::from(vec![0xab; 1024]),
        };

        let mut wire = BytesMut::new();
        egress.encode(frame.clone(), &mut wire).unwrap();
        let decoded = ingress.decode(&mut wire).unwrap().expect("whole frame");
        assert_eq!(decoded, frame);
        assert!(wire.is_empty());
    }

    #[test]
    fn consecutive_frames_share_the_cipher_chain() {
        let (mut egress, mut ingress) = paired_codecs();
        let mut wire = BytesMut::new();
        for code in 0..4u8 {
            let frame = Frame {
                code,
                payload: Bytes::from(vec![code; 100]),
            };
            egress.encode(frame, &mut wire).unwrap();
        }
        for code in 0..4u8 {
            let decoded = ingress.decode(&mut wire).unwrap().expect("frame");
            assert_eq!(decoded.code, code);
            assert_eq!(decoded.payload, Bytes::from(vec![code; 100]));
        }
    }

    #[test]
    fn single_byte_flip_fails_the_mac() {
        for index in [0usize, 5, 20, 40] {
            let (mut egress, mut ingress) = paired_codecs();
            let frame = Frame {
                code: 0x02,
                payload: Bytes::from(vec![0x11; 64]),
            };
            let mut wire = BytesMut::new();
            egress.encode(frame, &mut wire).unwrap();
            wire[index] ^= 0x01;
            assert!(matches!(
                ingress.decode(&mut wire),
                Err(RLPxError::InvalidMac)
            ));
        }
    }

    #[test]
    fn partial_frames_wait_for_more_data() {
        let (mut egress, mut ingress) = paired_codecs();
        let frame = Frame {
            code: 0x01,
            payload: Bytes::from(vec![0x22; 256]),
        };
        let mut wire = BytesMut::new();
        egress.encode(frame.clone(), &mut wire).unwrap();

        let mut partial = BytesMut::new();
        partial.extend_from_slice(&wire[..40]);
        assert!(ingress.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&wire[40..]);
        assert_eq!(ingress.decode(&mut partial).unwrap().unwrap(), frame);
    }
}
