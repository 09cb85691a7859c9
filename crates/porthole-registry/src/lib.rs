//! Connection and service registry for Porthole edge routing.
//!
//! Maps live subdomains (and their derived `<subdomain>-<service>` hostnames)
//! to the agent and local port serving them, with a 300s TTL refreshed by
//! heartbeats so stale tunnels expire without an explicit disconnect.

mod connection;
mod store;

pub use connection::{ConnectionRegistry, TunnelConnectionInfo, CONNECTION_TTL};
pub use store::TtlStore;
