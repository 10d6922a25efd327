//! Ephemeral X25519 key pairs and public key encoding

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use linkbus_core::{BrokerError, BrokerResult};

/// Size of an X25519 public key
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Key pair generated by the broker for one handshake
#[derive(Clone)]
pub struct EphemeralKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// Generate a fresh key pair
    pub fn generate<R: RngCore + CryptoRng + ?Sized>(rng: &mut R) -> Self {
        let secret = StaticSecret::random_from_rng(rng);
        let public = PublicKey::from(&secret);
        EphemeralKeyPair { secret, public }
    }

    /// Rebuild a key pair from secret scalar bytes
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        EphemeralKeyPair { secret, public }
    }

    /// Public key bytes
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Public key in its wire encoding (URL-safe base64)
    pub fn public_key_string(&self) -> String {
        encode_public_key(&self.public)
    }

    pub(crate) fn diffie_hellman(&self, peer: &PublicKey) -> x25519_dalek::SharedSecret {
        self.secret.diffie_hellman(peer)
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &self.public_key_string())
            .finish_non_exhaustive()
    }
}

/// Encode a public key for the wire
pub fn encode_public_key(key: &PublicKey) -> String {
    URL_SAFE_NO_PAD.encode(key.as_bytes())
}

/// Decode a peer-declared public key; trailing padding is tolerated
pub fn decode_public_key(encoded: &str) -> BrokerResult<PublicKey> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| BrokerError::InvalidKeyMaterial(e.to_string()))?;

    let bytes: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|b: Vec<u8>| {
        BrokerError::InvalidKeyMaterial(format!(
            "expected {PUBLIC_KEY_SIZE} key bytes, got {}",
            b.len()
        ))
    })?;

    Ok(PublicKey::from(bytes))
}

/// Hash of a public key as used in link identifiers (43 characters)
pub fn public_key_hash(key: &PublicKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkbus_core::{DsId, PUB_KEY_HASH_LEN};
    use rand::rngs::OsRng;

    #[test]
    fn test_key_generation() {
        let a = EphemeralKeyPair::generate(&mut OsRng);
        let b = EphemeralKeyPair::generate(&mut OsRng);

        assert_ne!(a.public_key_bytes(), b.public_key_bytes());
    }

    #[test]
    fn test_public_key_encoding() {
        let pair = EphemeralKeyPair::generate(&mut OsRng);
        let encoded = pair.public_key_string();
        let decoded = decode_public_key(&encoded).unwrap();

        assert_eq!(decoded.to_bytes(), pair.public_key_bytes());

        let padded = format!("{encoded}=");
        assert!(decode_public_key(&padded).is_ok());
    }

    #[test]
    fn test_decode_rejects_bad_keys() {
        assert!(matches!(
            decode_public_key("not base64!"),
            Err(BrokerError::InvalidKeyMaterial(_))
        ));
        assert!(matches!(
            decode_public_key(&URL_SAFE_NO_PAD.encode([7u8; 16])),
            Err(BrokerError::InvalidKeyMaterial(_))
        ));
    }

    #[test]
    fn test_hash_builds_valid_ds_id() {
        let pair = EphemeralKeyPair::generate(&mut OsRng);
        let hash = public_key_hash(&decode_public_key(&pair.public_key_string()).unwrap());

        assert_eq!(hash.len(), PUB_KEY_HASH_LEN);
        let id = DsId::compose("link", &hash).unwrap();
        assert_eq!(id.hash_segment(), hash);
    }

    #[test]
    fn test_debug_hides_secret() {
        let pair = EphemeralKeyPair::from_secret_bytes([9u8; 32]);
        let debug = format!("{:?}", pair);
        assert!(debug.contains(&pair.public_key_string()));
        assert!(debug.ends_with(".. }"));
    }
}
