//! linkbus Core - Fundamental types shared by every broker crate
//!
//! This crate defines:
//! - Identifiers (DsId, SessionId, RequestId)
//! - Wire messages (requests, responses, stream states, diff entries)
//! - Handshake payloads
//! - The broker error taxonomy

pub mod error;
pub mod handshake;
pub mod id;
pub mod message;

pub use error::*;
pub use handshake::*;
pub use id::*;
pub use message::*;
