//! linkbus Broker - Sessions and subscription multiplexing
//!
//! This crate implements the broker core:
//! - Client sessions built from a completed handshake
//! - The session registry and its lifecycle notifications
//! - Outstanding request tables per session
//! - Producer links that survive reconnects
//! - The cached list stream fanning one upstream subscription out to
//!   many requesters

pub mod collab;
pub mod outstanding;
pub mod producer;
pub mod registry;
pub mod session;
pub mod stream;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use collab::*;
pub use outstanding::*;
pub use producer::*;
pub use registry::*;
pub use session::*;
pub use stream::*;
