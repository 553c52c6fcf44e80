//! Channel state machines.
//!
//! A channel is a per-peer delivery pipeline with fixed semantics. Both
//! implementations share the same operation set, dispatched through the
//! [`Channel`] enum; the connection never cares which variant it holds.

use std::fmt;
use std::rc::Rc;

use netlane_core::config::{ChannelConfig, ChannelKind};
use netlane_protocol::{ChannelPacketData, MessageFactory, MessageRef};

mod reliable;
mod unreliable;

pub use reliable::ReliableOrderedChannel;
pub use unreliable::UnreliableUnorderedChannel;

/// Latched channel error state.
///
/// Any state other than `None` sticks until the connection is reset; all
/// further send and receive operations no-op while latched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChannelErrorLevel {
    /// All good.
    #[default]
    None,
    /// The peer ran ahead of the receive window, or block bookkeeping
    /// disagreed between peers.
    Desync,
    /// The producer outran the send queue.
    SendQueueFull,
    /// A block message was sent on a channel with blocks disabled.
    BlocksDisabled,
    /// An allocation was refused.
    OutOfMemory,
    /// A sub-message failed to deserialize.
    FailedToSerialize,
}

impl fmt::Display for ChannelErrorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelErrorLevel::None => "CHANNEL_ERROR_NONE",
            ChannelErrorLevel::Desync => "CHANNEL_ERROR_DESYNC",
            ChannelErrorLevel::SendQueueFull => "CHANNEL_ERROR_SEND_QUEUE_FULL",
            ChannelErrorLevel::BlocksDisabled => "CHANNEL_ERROR_BLOCKS_DISABLED",
            ChannelErrorLevel::OutOfMemory => "CHANNEL_ERROR_OUT_OF_MEMORY",
            ChannelErrorLevel::FailedToSerialize => "CHANNEL_ERROR_FAILED_TO_SERIALIZE",
        };
        f.write_str(name)
    }
}

/// Per-channel delivery counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChannelCounters {
    /// Messages accepted by `send_message`.
    pub messages_sent: u64,
    /// Messages handed out by `receive_message`.
    pub messages_received: u64,
}

impl ChannelCounters {
    /// Resets both counters to zero.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A channel of either delivery semantics.
pub enum Channel {
    /// Reliable-ordered delivery with retransmission and block transfer.
    Reliable(ReliableOrderedChannel),
    /// Unreliable-unordered fire-and-forget delivery.
    Unreliable(UnreliableUnorderedChannel),
}

impl Channel {
    /// Creates a channel of the kind the config selects.
    pub fn new(
        config: ChannelConfig,
        channel_index: usize,
        factory: Rc<dyn MessageFactory>,
        time: f64,
    ) -> Self {
        match config.kind {
            ChannelKind::ReliableOrdered => {
                Self::Reliable(ReliableOrderedChannel::new(config, channel_index, factory, time))
            }
            ChannelKind::UnreliableUnordered => Self::Unreliable(UnreliableUnorderedChannel::new(
                config,
                channel_index,
                factory,
                time,
            )),
        }
    }

    /// Whether a message can be enqueued right now.
    pub fn can_send_message(&self) -> bool {
        match self {
            Channel::Reliable(channel) => channel.can_send_message(),
            Channel::Unreliable(channel) => channel.can_send_message(),
        }
    }

    /// Whether the channel has anything waiting to go out.
    pub fn has_messages_to_send(&self) -> bool {
        match self {
            Channel::Reliable(channel) => channel.has_messages_to_send(),
            Channel::Unreliable(channel) => channel.has_messages_to_send(),
        }
    }

    /// Enqueues a message. The channel takes ownership of the reference.
    pub fn send_message(&mut self, message: MessageRef) {
        match self {
            Channel::Reliable(channel) => channel.send_message(message),
            Channel::Unreliable(channel) => channel.send_message(message),
        }
    }

    /// Dequeues the next deliverable message, transferring ownership to
    /// the caller.
    pub fn receive_message(&mut self) -> Option<MessageRef> {
        match self {
            Channel::Reliable(channel) => channel.receive_message(),
            Channel::Unreliable(channel) => channel.receive_message(),
        }
    }

    /// Produces this channel's share of an outgoing packet, if any, and
    /// the conservative bit count it consumed.
    pub fn get_packet_data(
        &mut self,
        packet_sequence: u16,
        available_bits: usize,
    ) -> Option<(ChannelPacketData, usize)> {
        match self {
            Channel::Reliable(channel) => channel.get_packet_data(packet_sequence, available_bits),
            Channel::Unreliable(channel) => channel.get_packet_data(available_bits),
        }
    }

    /// Dispatches an inbound channel payload.
    pub fn process_packet_data(&mut self, data: &ChannelPacketData, packet_sequence: u16) {
        match self {
            Channel::Reliable(channel) => channel.process_packet_data(data),
            Channel::Unreliable(channel) => channel.process_packet_data(data, packet_sequence),
        }
    }

    /// Applies an ack for an outer packet sequence.
    pub fn process_ack(&mut self, ack: u16) {
        match self {
            Channel::Reliable(channel) => channel.process_ack(ack),
            Channel::Unreliable(_) => {}
        }
    }

    /// Advances channel time.
    pub fn advance_time(&mut self, time: f64) {
        match self {
            Channel::Reliable(channel) => channel.advance_time(time),
            Channel::Unreliable(_) => {}
        }
    }

    /// Releases every queued message and clears all state.
    pub fn reset(&mut self) {
        match self {
            Channel::Reliable(channel) => channel.reset(),
            Channel::Unreliable(channel) => channel.reset(),
        }
    }

    /// Current latched error state.
    pub fn error_level(&self) -> ChannelErrorLevel {
        match self {
            Channel::Reliable(channel) => channel.error_level(),
            Channel::Unreliable(channel) => channel.error_level(),
        }
    }

    /// Delivery counters.
    pub fn counters(&self) -> &ChannelCounters {
        match self {
            Channel::Reliable(channel) => channel.counters(),
            Channel::Unreliable(channel) => channel.counters(),
        }
    }
}
