//! Session authenticator - key agreement and token validation
//!
//! A link and the broker each contribute an X25519 key. The broker derives
//! the shared secret, hands the link a fresh salt, and later accepts the
//! link only if it presents `SHA-256(salt || shared_secret)`. No long-term
//! credential is stored on the broker.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use subtle::ConstantTimeEq;

use linkbus_core::{BrokerError, BrokerResult};

use crate::{
    compute_auth_token, decode_public_key, EphemeralKeyPair, Salt, SharedSecret, AUTH_TOKEN_SIZE,
    SALT_SIZE,
};

/// Cryptographically secure generator usable behind a trait object
pub trait SecureRng: RngCore + CryptoRng + Send {}

impl<T: RngCore + CryptoRng + Send> SecureRng for T {}

/// Handshake authenticator owning its random source
pub struct SessionAuthenticator {
    rng: Mutex<Box<dyn SecureRng>>,
}

impl SessionAuthenticator {
    /// Authenticator backed by the operating system generator
    pub fn new() -> Self {
        Self::with_rng(OsRng)
    }

    /// Authenticator backed by a caller-supplied generator
    pub fn with_rng<R: SecureRng + 'static>(rng: R) -> Self {
        SessionAuthenticator {
            rng: Mutex::new(Box::new(rng)),
        }
    }

    /// Fresh key pair for one connection attempt
    pub fn generate_ephemeral_key_pair(&self) -> EphemeralKeyPair {
        let mut rng = self.rng.lock();
        EphemeralKeyPair::generate(&mut **rng)
    }

    /// Agree on a shared secret with the peer's declared public key
    pub fn derive_shared_secret(
        &self,
        local: &EphemeralKeyPair,
        peer_public_key: &str,
    ) -> BrokerResult<SharedSecret> {
        let peer = decode_public_key(peer_public_key)?;
        let shared = local.diffie_hellman(&peer);

        // Low-order peer points force an all-zero secret
        if !shared.was_contributory() {
            return Err(BrokerError::InvalidKeyMaterial(
                "peer key is not contributory".to_string(),
            ));
        }

        Ok(SharedSecret::from_bytes(shared.to_bytes()))
    }

    /// Fresh salt for one session
    pub fn generate_salt(&self) -> Salt {
        let mut bytes = [0u8; SALT_SIZE];
        self.rng.lock().fill_bytes(&mut bytes);
        Salt::from_bytes(&bytes)
    }

    /// `SHA-256(salt || shared_secret)`
    pub fn compute_auth_token(&self, salt: &Salt, secret: &SharedSecret) -> [u8; AUTH_TOKEN_SIZE] {
        compute_auth_token(salt, secret)
    }

    /// Check a token submitted by the peer
    ///
    /// An absent or undecodable token is a mismatch, not an error.
    pub fn validate_auth_token(
        &self,
        submitted: Option<&str>,
        salt: &Salt,
        secret: &SharedSecret,
    ) -> bool {
        let Some(submitted) = submitted else {
            return false;
        };

        let decoded = match URL_SAFE_NO_PAD.decode(submitted.trim_end_matches('=')) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::debug!("undecodable auth token: {}", e);
                return false;
            }
        };

        let expected = compute_auth_token(salt, secret);
        expected.as_slice().ct_eq(decoded.as_slice()).into()
    }
}

impl Default for SessionAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAuthenticator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode_auth_token;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn handshake(auth: &SessionAuthenticator) -> (EphemeralKeyPair, SharedSecret, SharedSecret) {
        let broker = auth.generate_ephemeral_key_pair();
        let link = auth.generate_ephemeral_key_pair();

        let broker_side = auth
            .derive_shared_secret(&broker, &link.public_key_string())
            .unwrap();
        let link_side = auth
            .derive_shared_secret(&link, &broker.public_key_string())
            .unwrap();
        (broker, broker_side, link_side)
    }

    #[test]
    fn test_both_sides_agree() {
        let auth = SessionAuthenticator::new();
        let (_, broker_side, link_side) = handshake(&auth);

        assert_eq!(broker_side, link_side);
    }

    #[test]
    fn test_validate_roundtrip() {
        let auth = SessionAuthenticator::new();
        let (_, secret, _) = handshake(&auth);
        let salt = auth.generate_salt();

        let token = encode_auth_token(&auth.compute_auth_token(&salt, &secret));
        assert!(auth.validate_auth_token(Some(&token), &salt, &secret));
    }

    #[test]
    fn test_absent_and_garbage_tokens() {
        let auth = SessionAuthenticator::new();
        let (_, secret, _) = handshake(&auth);
        let salt = auth.generate_salt();

        assert!(!auth.validate_auth_token(None, &salt, &secret));
        assert!(!auth.validate_auth_token(Some("%%%"), &salt, &secret));
        assert!(!auth.validate_auth_token(Some(""), &salt, &secret));
        assert!(!auth.validate_auth_token(Some("AAAA"), &salt, &secret));
    }

    #[test]
    fn test_salts_are_fresh() {
        let auth = SessionAuthenticator::new();
        let a = auth.generate_salt();
        let b = auth.generate_salt();

        assert_ne!(a, b);
    }

    #[test]
    fn test_distinct_pairs_distinct_secrets() {
        let auth = SessionAuthenticator::new();
        let (_, first, _) = handshake(&auth);
        let (_, second, _) = handshake(&auth);

        assert_ne!(first, second);
    }

    #[test]
    fn test_low_order_peer_rejected() {
        let auth = SessionAuthenticator::new();
        let local = auth.generate_ephemeral_key_pair();
        let identity_point = URL_SAFE_NO_PAD.encode([0u8; 32]);

        assert!(matches!(
            auth.derive_shared_secret(&local, &identity_point),
            Err(BrokerError::InvalidKeyMaterial(_))
        ));
    }

    #[test]
    fn test_seeded_rng_is_deterministic() {
        let a = SessionAuthenticator::with_rng(StdRng::seed_from_u64(7));
        let b = SessionAuthenticator::with_rng(StdRng::seed_from_u64(7));

        assert_eq!(a.generate_salt(), b.generate_salt());
        assert_eq!(
            a.generate_ephemeral_key_pair().public_key_bytes(),
            b.generate_ephemeral_key_pair().public_key_bytes()
        );
    }

    proptest! {
        #[test]
        fn prop_single_bit_flip_rejected(
            salt_bytes in proptest::array::uniform32(any::<u8>()),
            secret_bytes in proptest::array::uniform32(any::<u8>()),
            bit in 0usize..256,
        ) {
            let auth = SessionAuthenticator::new();
            let salt = Salt::from_bytes(&salt_bytes);
            let secret = SharedSecret::from_bytes(secret_bytes);
            let token = auth.compute_auth_token(&salt, &secret);
            prop_assert!(auth.validate_auth_token(Some(&encode_auth_token(&token)), &salt, &secret));

            let mut flipped = token;
            flipped[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(!auth.validate_auth_token(Some(&encode_auth_token(&flipped)), &salt, &secret));

            let mut secret_flipped = secret_bytes;
            secret_flipped[bit / 8] ^= 1 << (bit % 8);
            let other_secret = SharedSecret::from_bytes(secret_flipped);
            prop_assert!(!auth.validate_auth_token(Some(&encode_auth_token(&token)), &salt, &other_secret));

            let mut salt_flipped = salt_bytes;
            salt_flipped[bit / 8] ^= 1 << (bit % 8);
            let other_salt = Salt::from_bytes(&salt_flipped);
            prop_assert!(!auth.validate_auth_token(Some(&encode_auth_token(&token)), &other_salt, &secret));
        }
    }
}
