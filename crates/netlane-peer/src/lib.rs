#![warn(missing_docs)]

//! netlane-peer: per-peer channel state machines and the connection.
//!
//! A [`Connection`] owns one channel per slot of its configuration and
//! multiplexes them into single packets under a shared bit budget. The
//! reliable-ordered channel retransmits until acked and delivers strictly
//! in order, fragmenting block messages across packets; the
//! unreliable-unordered channel is fire-and-forget.

/// Channel state machines and error levels.
pub mod channel;
/// The per-peer connection bundling the channels.
pub mod connection;

pub use channel::{Channel, ChannelCounters, ChannelErrorLevel};
pub use connection::{Connection, ConnectionErrorLevel};
