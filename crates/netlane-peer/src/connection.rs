//! The per-peer connection: a bundle of channels multiplexed into single
//! packets under a shared bit budget.

use std::fmt;
use std::rc::Rc;

use netlane_core::config::ConnectionConfig;
use netlane_core::constants::{
    CONSERVATIVE_CHANNEL_HEADER_BITS, CONSERVATIVE_PACKET_HEADER_BITS,
};
use netlane_core::error::Result;
use netlane_protocol::{ConnectionPacket, MessageFactory, MessageRef};
use netlane_stream::{BitReader, BitWriter};

use crate::channel::{Channel, ChannelCounters, ChannelErrorLevel};

/// Latched connection error state, promoted from the channels and
/// collaborators each tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionErrorLevel {
    /// All good.
    #[default]
    None,
    /// A child channel latched an error.
    Channel,
    /// The bounded allocator refused an allocation.
    Allocator,
    /// The message factory flagged an error.
    MessageFactory,
    /// Top-level packet deserialization failed.
    ReadPacketFailed,
}

impl fmt::Display for ConnectionErrorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionErrorLevel::None => "CONNECTION_ERROR_NONE",
            ConnectionErrorLevel::Channel => "CONNECTION_ERROR_CHANNEL",
            ConnectionErrorLevel::Allocator => "CONNECTION_ERROR_ALLOCATOR",
            ConnectionErrorLevel::MessageFactory => "CONNECTION_ERROR_MESSAGE_FACTORY",
            ConnectionErrorLevel::ReadPacketFailed => "CONNECTION_ERROR_READ_PACKET_FAILED",
        };
        f.write_str(name)
    }
}

/// A connection to one remote peer.
///
/// Owns one channel per configured slot. Each tick the application (or
/// the host glue) calls [`Connection::generate_packet`] with the next
/// outer packet sequence, pushes received payloads through
/// [`Connection::process_packet`], and distributes endpoint acks via
/// [`Connection::process_acks`].
pub struct Connection {
    config: ConnectionConfig,
    factory: Rc<dyn MessageFactory>,
    channels: Vec<Channel>,
    error_level: ConnectionErrorLevel,
}

impl Connection {
    /// Creates a connection with one channel per config slot.
    pub fn new(
        factory: Rc<dyn MessageFactory>,
        config: ConnectionConfig,
        time: f64,
    ) -> Result<Self> {
        config.validate()?;
        let channels = config
            .channels
            .iter()
            .enumerate()
            .map(|(index, channel_config)| {
                Channel::new(channel_config.clone(), index, factory.clone(), time)
            })
            .collect();
        Ok(Self { config, factory, channels, error_level: ConnectionErrorLevel::None })
    }

    /// Number of channels.
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Current latched error level.
    pub fn error_level(&self) -> ConnectionErrorLevel {
        self.error_level
    }

    /// Error level of one channel.
    pub fn channel_error_level(&self, channel_index: usize) -> ChannelErrorLevel {
        self.channels[channel_index].error_level()
    }

    /// Delivery counters of one channel.
    pub fn channel_counters(&self, channel_index: usize) -> &ChannelCounters {
        self.channels[channel_index].counters()
    }

    /// Whether a message can be enqueued on the channel right now.
    pub fn can_send_message(&self, channel_index: usize) -> bool {
        self.channels[channel_index].can_send_message()
    }

    /// Whether the channel has anything waiting to go out.
    pub fn has_messages_to_send(&self, channel_index: usize) -> bool {
        self.channels[channel_index].has_messages_to_send()
    }

    /// Enqueues a message on a channel. The connection owns the handed
    /// reference from here on.
    pub fn send_message(&mut self, channel_index: usize, message: MessageRef) {
        self.channels[channel_index].send_message(message);
    }

    /// Dequeues the next deliverable message from a channel. Ownership
    /// transfers to the caller; dropping the handle releases it.
    pub fn receive_message(&mut self, channel_index: usize) -> Option<MessageRef> {
        self.channels[channel_index].receive_message()
    }

    /// Builds the outgoing packet for this tick.
    ///
    /// Each channel negotiates a share of the bit budget in channel
    /// order; the assembled packet is then serialized in one pass. A
    /// packet with no channel data is still produced — it keeps acks
    /// flowing.
    pub fn generate_packet(
        &mut self,
        packet_sequence: u16,
        max_packet_bytes: usize,
    ) -> Option<Vec<u8>> {
        let mut entries = Vec::new();
        let mut available_bits =
            (max_packet_bytes * 8).saturating_sub(CONSERVATIVE_PACKET_HEADER_BITS);

        for channel in &mut self.channels {
            if let Some((data, data_bits)) = channel.get_packet_data(packet_sequence, available_bits)
            {
                available_bits =
                    available_bits.saturating_sub(CONSERVATIVE_CHANNEL_HEADER_BITS + data_bits);
                entries.push(data);
            }
        }

        let packet = ConnectionPacket { entries };
        let mut writer = BitWriter::with_capacity(max_packet_bytes);
        match packet.write(&mut writer, self.factory.as_ref(), &self.config) {
            Ok(()) => Some(writer.finish()),
            Err(error) => {
                tracing::error!(%error, "failed to serialize connection packet");
                None
            }
        }
    }

    /// Parses an inbound packet body and dispatches each channel entry.
    ///
    /// Returns false when the packet was rejected — either the top-level
    /// parse failed (latching `ReadPacketFailed`) or a channel latched an
    /// error while processing its entry.
    pub fn process_packet(&mut self, packet_sequence: u16, packet_data: &[u8]) -> bool {
        if self.error_level != ConnectionErrorLevel::None {
            tracing::debug!("dropped packet: connection is in error state");
            return false;
        }

        let mut reader = BitReader::new(packet_data);
        let packet = match ConnectionPacket::read(&mut reader, self.factory.as_ref(), &self.config)
        {
            Ok(packet) => packet,
            Err(error) => {
                tracing::error!(%error, "failed to read connection packet");
                self.error_level = ConnectionErrorLevel::ReadPacketFailed;
                return false;
            }
        };

        for entry in &packet.entries {
            let channel = &mut self.channels[entry.channel_index];
            channel.process_packet_data(entry, packet_sequence);
            if channel.error_level() != ChannelErrorLevel::None {
                tracing::debug!(
                    channel = entry.channel_index,
                    "channel latched an error processing packet data"
                );
                return false;
            }
        }
        true
    }

    /// Distributes each acked packet sequence to every channel.
    pub fn process_acks(&mut self, acks: &[u16]) {
        for &ack in acks {
            for channel in &mut self.channels {
                channel.process_ack(ack);
            }
        }
    }

    /// Advances time on every channel and promotes collaborator error
    /// levels to the connection.
    pub fn advance_time(&mut self, time: f64) {
        for channel in &mut self.channels {
            channel.advance_time(time);
            if channel.error_level() != ChannelErrorLevel::None {
                self.error_level = ConnectionErrorLevel::Channel;
                return;
            }
        }
        if self.factory.error() {
            self.error_level = ConnectionErrorLevel::MessageFactory;
        }
    }

    /// Releases every queued message on every channel and clears all
    /// error state.
    pub fn reset(&mut self) {
        self.error_level = ConnectionErrorLevel::None;
        for channel in &mut self.channels {
            channel.reset();
        }
    }
}
