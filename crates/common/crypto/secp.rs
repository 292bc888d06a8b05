use crate::CryptoError;
use ethereum_types::{H256, H512};
use hmac::Mac;
use secp256k1::{
    Message, PublicKey, SECP256K1, SecretKey,
    ecdsa::{RecoverableSignature, RecoveryId},
};

/// A 65-byte recoverable signature as laid out on the wire: `r || s || v`,
/// with `v` being the recovery id (0 or 1).
pub type RecoverableSignatureBytes = [u8; 65];

/// Derives the 64-byte node id from a public key: the uncompressed
/// serialization minus its `0x04` prefix.
pub fn pk2id(public_key: &PublicKey) -> H512 {
    let encoded = public_key.serialize_uncompressed();
    H512::from_slice(&encoded[1..])
}

/// Rebuilds a public key from a 64-byte node id.
pub fn id2pk(id: H512) -> Result<PublicKey, CryptoError> {
    let mut encoded = [0u8; 65];
    encoded[0] = 4;
    encoded[1..].copy_from_slice(id.as_bytes());
    PublicKey::from_slice(&encoded).map_err(|_| CryptoError::InvalidPublicKey)
}

pub fn public_key(secret_key: &SecretKey) -> PublicKey {
    PublicKey::from_secret_key(SECP256K1, secret_key)
}

/// Signs a 32-byte digest, returning the wire layout `r || s || v`.
pub fn sign_digest(
    digest: H256,
    secret_key: &SecretKey,
) -> Result<RecoverableSignatureBytes, CryptoError> {
    let message = Message::from_digest(digest.0);
    let (recovery_id, signature) = SECP256K1
        .sign_ecdsa_recoverable(&message, secret_key)
        .serialize_compact();
    let mut bytes = [0u8; 65];
    bytes[..64].copy_from_slice(&signature);
    bytes[64] = recovery_id.to_i32() as u8;
    Ok(bytes)
}

/// Recovers the signer's public key from a 32-byte digest and a 65-byte
/// recoverable signature.
pub fn recover_public_key(digest: H256, signature: &[u8]) -> Result<PublicKey, CryptoError> {
    if signature.len() != 65 {
        return Err(CryptoError::InvalidSignature(
            "expected 65 byte signature".to_string(),
        ));
    }
    let recovery_id = RecoveryId::from_i32(signature[64] as i32)
        .map_err(|_| CryptoError::InvalidRecoveryId)?;
    let signature = RecoverableSignature::from_compact(&signature[..64], recovery_id)
        .map_err(|err| CryptoError::InvalidSignature(err.to_string()))?;
    SECP256K1
        .recover_ecdsa(&Message::from_digest(digest.0), &signature)
        .map_err(|err| CryptoError::InvalidSignature(err.to_string()))
}

/// X coordinate of the shared secp256k1 point (ecdh-x).
pub fn ecdh_xchng(public_key: &PublicKey, secret_key: &SecretKey) -> [u8; 32] {
    let point = secp256k1::ecdh::shared_secret_point(public_key, secret_key);
    let mut x = [0u8; 32];
    x.copy_from_slice(&point[..32]);
    x
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::Digest;
    sha2::Sha256::digest(data).into()
}

pub fn sha256_hmac(key: &[u8], inputs: &[&[u8]], size_data: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut hasher = hmac::Hmac::<sha2::Sha256>::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKeyLength)?;
    for input in inputs {
        hasher.update(input);
    }
    hasher.update(size_data);
    Ok(hasher.finalize().into_bytes().into())
}

/// NIST concat-KDF over SHA-256. The `other_info` field is unused.
pub fn kdf(secret: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
    concat_kdf::derive_key_into::<sha2::Sha256>(secret, &[], output)
        .map_err(|_| CryptoError::KdfError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn sign_and_recover_round_trip() {
        let secret_key = SecretKey::new(&mut OsRng);
        let digest = H256([0xab; 32]);

        let signature = sign_digest(digest, &secret_key).unwrap();
        let recovered = recover_public_key(digest, &signature).unwrap();
        assert_eq!(recovered, public_key(&secret_key));
    }

    #[test]
    fn different_keys_recover_different_ids() {
        let digest = H256([0x42; 32]);
        let key_a = SecretKey::new(&mut OsRng);
        let key_b = SecretKey::new(&mut OsRng);

        let sig_a = sign_digest(digest, &key_a).unwrap();
        let sig_b = sign_digest(digest, &key_b).unwrap();

        let id_a = pk2id(&recover_public_key(digest, &sig_a).unwrap());
        let id_b = pk2id(&recover_public_key(digest, &sig_b).unwrap());
        assert_ne!(id_a, id_b);
        assert_eq!(id_a, pk2id(&public_key(&key_a)));
    }

    #[test]
    fn pk2id_id2pk_round_trip() {
        let secret_key = SecretKey::new(&mut OsRng);
        let pk = public_key(&secret_key);
        assert_eq!(id2pk(pk2id(&pk)).unwrap(), pk);
    }

    #[test]
    fn ecdh_is_symmetric() {
        let a = SecretKey::new(&mut OsRng);
        let b = SecretKey::new(&mut OsRng);
        // a * (b * G) = b * (a * G)
        assert_eq!(
            ecdh_xchng(&public_key(&b), &a),
            ecdh_xchng(&public_key(&a), &b)
        );
    }
}
