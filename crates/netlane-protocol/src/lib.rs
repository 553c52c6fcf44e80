#![warn(missing_docs)]

//! netlane-protocol: messages, sequence buffers and wire formats.
//!
//! This crate defines the typed message abstraction applications program
//! against, the sequence-indexed ring buffer the channel state machines
//! are built on, and the bit-level wire formats of per-channel packet
//! payloads and the connection packet that carries them.

/// Message trait, the shared message handle and the message factory.
pub mod message;
/// Per-channel payload and connection packet wire formats.
pub mod packet_data;
/// Sequence-indexed ring buffer.
pub mod sequence_buffer;

pub use message::{Message, MessageFactory, MessageRef, NetMessage};
pub use packet_data::{ChannelPacketContent, ChannelPacketData, ConnectionPacket};
pub use sequence_buffer::SequenceBuffer;
