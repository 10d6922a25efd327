//! linkbus Runtime - Wiring the broker core into a running service
//!
//! This crate provides:
//! - Broker configuration and logging setup
//! - The in-memory node tree links are mounted in
//! - A channel transport handing frames to connection writers
//! - Stream routing: list/close requests, producer responses, garbage collection
//! - The `Broker` facade tying handshake, sessions and streams together

pub mod broker;
pub mod config;
pub mod streams;
pub mod telemetry;
pub mod transport;
pub mod tree;

pub use broker::*;
pub use config::*;
pub use streams::*;
pub use telemetry::*;
pub use transport::*;
pub use tree::*;
