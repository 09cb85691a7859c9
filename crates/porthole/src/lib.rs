//! Porthole tunnel agent.
//!
//! Owns one persistent outbound WebSocket to the public edge and multiplexes
//! it into any number of concurrent HTTP exchanges against local ports. The
//! binary in `main.rs` wires the CLI to these modules.

pub mod auth;
pub mod config;
pub mod connector;
pub mod forwarder;
pub mod mux;
