//! linkbus Crypto - Session establishment primitives
//!
//! Provides the cryptographic side of the link handshake:
//! - Ephemeral key agreement (X25519)
//! - Per-session salts from an injectable CSPRNG
//! - Authentication tokens (SHA-256 over salt and shared secret)
//! - Constant-time token validation

pub mod authenticator;
pub mod keys;
pub mod secret;

pub use authenticator::*;
pub use keys::*;
pub use secret::*;
