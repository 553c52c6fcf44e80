#![warn(missing_docs)]

//! Netlane: a small public API facade for the workspace.
//!
//! This crate re-exports the surface most applications need:
//!
//! - Client and server hosts (`Client`, `Server`) with the in-memory
//!   loopback network (`MemoryNetwork`)
//! - The per-peer connection and channels (`Connection`)
//! - Typed messages (`Message`, `NetMessage`, `MessageFactory`)
//! - Configuration (`ClientServerConfig`, `ChannelConfig`, ...)
//! - The network simulator for lossy-link testing
//!
//! Example
//! ```ignore
//! use netlane::prelude::*;
//!
//! let network = MemoryNetwork::new(PROTOCOL_ID);
//! let mut server = Server::new(
//!     ClientServerConfig::default(),
//!     factory.clone(),
//!     Box::new(network.server_transport()),
//!     0.0,
//! );
//! server.start(16).unwrap();
//!
//! let mut client = Client::new(
//!     ClientServerConfig::default(),
//!     factory,
//!     Box::new(network.client_transport(0)),
//!     0.0,
//! )
//! .unwrap();
//! client.connect(&ConnectToken::new(server_address, CLIENT_ID, PROTOCOL_ID));
//!
//! // Each tick, in order:
//! client.receive_packets();
//! client.advance_time(time);
//! client.send_packets();
//! ```

// Configuration and errors
pub use netlane_core::config::{
    ChannelConfig, ChannelKind, ClientServerConfig, ConnectionConfig, EndpointConfig,
};
pub use netlane_core::error::{ErrorKind, Result};
// Messages
pub use netlane_protocol::{Message, MessageFactory, MessageRef, NetMessage};
// Connection layer
pub use netlane_peer::{
    Channel, ChannelCounters, ChannelErrorLevel, Connection, ConnectionErrorLevel,
};
// Hosts, endpoint and simulator
pub use netlane_host::{
    Client, ClientState, ClientTransport, ConnectToken, Endpoint, MemoryNetwork, NetworkInfo,
    NetworkSimulator, Server, ServerTransport, TransportState,
};
// Bit-level serialization, for implementing `Message`
pub use netlane_stream::{
    read_int_range, write_int_range, BitReader, BitWriter, StreamError, WireWrite,
};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        ChannelConfig, ChannelErrorLevel, ChannelKind, Client, ClientServerConfig, ClientState,
        ConnectToken, Connection, ConnectionConfig, ConnectionErrorLevel, MemoryNetwork, Message,
        MessageFactory, MessageRef, NetMessage, NetworkInfo, NetworkSimulator, Server,
        TransportState,
    };
}
