#![warn(missing_docs)]

//! netlane-host: everything between a connection and the wire.
//!
//! The [`Endpoint`] assigns per-packet sequence numbers, surfaces acks
//! through a redundant ack bitfield, estimates RTT and loss, and
//! fragments packets that outgrow the datagram budget. The
//! [`NetworkSimulator`] injects latency, jitter, loss and duplicates for
//! deterministic lossy-link testing. [`Client`] and [`Server`] bundle a
//! connection, an endpoint and the simulator per peer and drive them
//! against a pluggable transport.

/// The reliable endpoint: sequences, acks, RTT, packet fragmentation.
pub mod endpoint;
/// Latency/jitter/loss/duplicate injection for testing.
pub mod simulator;
/// Transport traits and the in-memory loopback network.
pub mod transport;

/// Client host glue.
pub mod client;
/// Server host glue.
pub mod server;

pub use client::{Client, ClientState};
pub use endpoint::{Endpoint, EndpointCounters, NetworkInfo};
pub use server::Server;
pub use simulator::NetworkSimulator;
pub use transport::{
    ClientTransport, ConnectToken, MemoryNetwork, ServerTransport, TransportState,
};
