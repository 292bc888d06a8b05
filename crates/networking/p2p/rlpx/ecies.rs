use super::error::RLPxError;
use aes::cipher::{KeyIvInit as _, StreamCipher as _};
use ethrune_crypto::secp::{ecdh_xchng, kdf, sha256, sha256_hmac};
use rand::{Rng, rngs::OsRng};
use secp256k1::{PublicKey, SECP256K1, SecretKey};

pub(crate) type Aes128Ctr64BE = ctr::Ctr64BE<aes::Aes128>;

const PUBKEY_SIZE: usize = 65;
const IV_SIZE: usize = 16;
const MAC_FOOTER_SIZE: usize = 32;

/// Bytes the envelope adds on top of the plaintext.
pub const ECIES_OVERHEAD: usize = PUBKEY_SIZE + IV_SIZE + MAC_FOOTER_SIZE;

/// Seals a message for the remote static key:
/// `ephemeral-pubkey(65) || iv(16) || aes128-ctr(plaintext) || hmac-sha256(32)`,
/// with a fresh ephemeral key and a concat-KDF derived key pair. The MAC
/// covers `iv || ciphertext || shared_mac_data`.
pub fn encrypt_message(
    remote_pubkey: &PublicKey,
    mut plaintext: Vec<u8>,
    shared_mac_data: &[u8],
) -> Result<Vec<u8>, RLPxError> {
    // Generate a keypair just for this message.
    let message_secret_key = SecretKey::new(&mut OsRng);
    let message_pubkey = PublicKey::from_secret_key(SECP256K1, &message_secret_key);

    // Derive the AES and MAC keys from the message shared secret.
    let message_secret = ecdh_xchng(remote_pubkey, &message_secret_key);
    let mut derived = [0; 32];
    kdf(&message_secret, &mut derived)
        .map_err(|err| RLPxError::CryptographyError(err.to_string()))?;
    let aes_key = &derived[..16];
    let mac_key = sha256(&derived[16..]);

    let iv: [u8; IV_SIZE] = OsRng.r#gen();
    let mut cipher = Aes128Ctr64BE::new_from_slices(aes_key, &iv)
        .map_err(|err| RLPxError::CryptographyError(err.to_string()))?;
    cipher.apply_keystream(&mut plaintext);
    let ciphertext = plaintext;

    let mac = sha256_hmac(&mac_key, &[&iv, &ciphertext], shared_mac_data)
        .map_err(|err| RLPxError::CryptographyError(err.to_string()))?;

    Ok([
        &message_pubkey.serialize_uncompressed(),
        iv.as_slice(),
        &ciphertext,
        &mac,
    ]
    .concat())
}

/// Opens an ECIES envelope addressed to our static key.
pub fn decrypt_message(
    secret_key: &SecretKey,
    message: &[u8],
    shared_mac_data: &[u8],
) -> Result<Vec<u8>, RLPxError> {
    if message.len() < ECIES_OVERHEAD {
        return Err(RLPxError::InvalidMessageLength);
    }
    let (pubkey_bytes, rest) = message.split_at(PUBKEY_SIZE);
    let (iv, rest) = rest.split_at(IV_SIZE);
    let (ciphertext, mac) = rest.split_at(rest.len() - MAC_FOOTER_SIZE);

    let message_pubkey = PublicKey::from_slice(pubkey_bytes)
        .map_err(|err| RLPxError::CryptographyError(err.to_string()))?;
    let message_secret = ecdh_xchng(&message_pubkey, secret_key);
    let mut derived = [0; 32];
    kdf(&message_secret, &mut derived)
        .map_err(|err| RLPxError::CryptographyError(err.to_string()))?;
    let aes_key = &derived[..16];
    let mac_key = sha256(&derived[16..]);

    let expected_mac = sha256_hmac(&mac_key, &[iv, ciphertext], shared_mac_data)
        .map_err(|err| RLPxError::CryptographyError(err.to_string()))?;
    if !crate::utils::constant_time_eq(mac, &expected_mac) {
        return Err(RLPxError::InvalidMac);
    }

    let mut plaintext = ciphertext.to_vec();
    let mut cipher = Aes128Ctr64BE::new_from_slices(aes_key, iv)
        .map_err(|err| RLPxError::CryptographyError(err.to_string()))?;
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let receiver = SecretKey::new(&mut OsRng);
        let receiver_pubkey = PublicKey::from_secret_key(SECP256K1, &receiver);

        let plaintext = b"framed transport handshake".to_vec();
        let sealed = encrypt_message(&receiver_pubkey, plaintext.clone(), &[]).unwrap();
        assert_eq!(sealed.len(), plaintext.len() + ECIES_OVERHEAD);

        let opened = decrypt_message(&receiver, &sealed, &[]).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn tampered_envelope_fails_mac() {
        let receiver = SecretKey::new(&mut OsRng);
        let receiver_pubkey = PublicKey::from_secret_key(SECP256K1, &receiver);

        let mut sealed =
            encrypt_message(&receiver_pubkey, b"payload".to_vec(), b"prefix").unwrap();
        let index = sealed.len() - MAC_FOOTER_SIZE - 1;
        sealed[index] ^= 0x01;
        assert!(matches!(
            decrypt_message(&receiver, &sealed, b"prefix"),
            Err(RLPxError::InvalidMac)
        ));
    }

    #[test]
    fn shared_mac_data_binds_the_envelope() {
        let receiver = SecretKey::new(&mut OsRng);
        let receiver_pubkey = PublicKey::from_secret_key(SECP256K1, &receiver);

        let sealed = encrypt_message(&receiver_pubkey, b"payload".to_vec(), b"aa").unwrap();
        assert!(decrypt_message(&receiver, &sealed, b"bb").is_err());
    }
}
