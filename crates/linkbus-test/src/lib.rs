//! linkbus Test Harness - Simulated links and end-to-end scenarios
//!
//! This crate provides:
//! - Simulated links driving a broker through its public surface
//! - A seeded fan-out harness with producer churn
//! - End-to-end integration tests

pub mod integration;
pub mod simulator;

pub use integration::*;
pub use simulator::*;
