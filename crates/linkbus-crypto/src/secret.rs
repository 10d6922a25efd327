//! Session secrets and authentication tokens

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Number of random bytes in a salt
pub const SALT_SIZE: usize = 32;

/// Size of a shared secret
pub const SHARED_SECRET_SIZE: usize = 32;

/// Size of an authentication token (SHA-256 digest)
pub const AUTH_TOKEN_SIZE: usize = 32;

/// Shared secret from key agreement; wiped when dropped
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_SIZE]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; SHARED_SECRET_SIZE]) -> Self {
        SharedSecret(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Per-session salt, held in the text form sent to the peer
///
/// The text is the URL-safe base64 encoding of [`SALT_SIZE`] random bytes.
/// Token derivation hashes the text bytes, which is exactly what the peer
/// receives.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Salt(String);

impl Salt {
    pub fn from_bytes(bytes: &[u8; SALT_SIZE]) -> Self {
        Salt(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Salt as received on the wire, used on the link side of a handshake
    pub fn from_encoded(text: impl Into<String>) -> Self {
        Salt(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for Salt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Salt({})", self.0)
    }
}

/// `SHA-256(salt || shared_secret)`
pub fn compute_auth_token(salt: &Salt, secret: &SharedSecret) -> [u8; AUTH_TOKEN_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

/// Wire form of an authentication token
pub fn encode_auth_token(token: &[u8; AUTH_TOKEN_SIZE]) -> String {
    URL_SAFE_NO_PAD.encode(token)
}
