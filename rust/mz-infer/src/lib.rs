//! mz-infer: wire protocol and micro-batching client for remote leaf evaluation.

pub mod client;
pub mod codec;
pub mod frame;
pub mod protocol;
pub mod server;

pub use client::{
    ClientError, ClientOptions, ClientStatsSnapshot, InferenceClient, LatencySnapshot, Ticket,
};
pub use protocol::{BatchRequest, EvaluationResult};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod client_tests;
