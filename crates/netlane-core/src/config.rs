use std::default::Default;

use crate::constants::MAX_CHANNELS;
use crate::error::{ErrorKind, Result};

/// Delivery semantics of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    /// Messages are delivered exactly once, in send order. Lost packets are
    /// retransmitted until acked.
    ReliableOrdered,
    /// Messages are delivered at most once, in arbitrary order. Messages
    /// that miss their packet are dropped, never retransmitted.
    UnreliableUnordered,
}

/// Per-channel configuration.
///
/// The three queue sizes must divide 65536 so the sequence-indexed ring
/// buffers tile the 16-bit sequence space without bias.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Delivery semantics for this channel.
    pub kind: ChannelKind,
    /// Maximum bytes this channel may contribute to one packet. 0 = no cap
    /// beyond the packet itself.
    pub packet_budget: usize,
    /// Maximum number of messages packed into one packet.
    pub max_messages_per_packet: usize,
    /// Maximum size of a block message payload in bytes.
    pub max_block_size: usize,
    /// Size of each block fragment in bytes.
    pub block_fragment_size: usize,
    /// Capacity of the message send queue.
    pub message_send_queue_size: usize,
    /// Capacity of the message receive queue.
    pub message_receive_queue_size: usize,
    /// Capacity of the sent-packet record buffer.
    pub sent_packet_buffer_size: usize,
    /// Seconds to wait before resending an unacked message.
    pub message_resend_time: f64,
    /// Seconds to wait before resending an unacked block fragment.
    pub block_fragment_resend_time: f64,
    /// Disallow block messages on this channel.
    pub disable_blocks: bool,
}

impl ChannelConfig {
    /// Creates a config of the given kind with default tuning.
    pub fn new(kind: ChannelKind) -> Self {
        Self { kind, ..Self::default() }
    }

    /// Maximum number of fragments a block may split into.
    pub fn max_fragments_per_block(&self) -> usize {
        self.max_block_size.div_ceil(self.block_fragment_size)
    }

    /// Validates queue sizing against the 16-bit sequence space.
    pub fn validate(&self) -> Result<()> {
        for (name, size) in [
            ("message_send_queue_size", self.message_send_queue_size),
            ("message_receive_queue_size", self.message_receive_queue_size),
            ("sent_packet_buffer_size", self.sent_packet_buffer_size),
        ] {
            if size == 0 || 65536 % size != 0 {
                return Err(ErrorKind::InvalidConfig(name));
            }
        }
        if self.block_fragment_size == 0 {
            return Err(ErrorKind::InvalidConfig("block_fragment_size"));
        }
        if self.max_messages_per_packet == 0 {
            return Err(ErrorKind::InvalidConfig("max_messages_per_packet"));
        }
        Ok(())
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            kind: ChannelKind::ReliableOrdered,
            packet_budget: 0,                // No per-channel cap
            max_messages_per_packet: 256,
            max_block_size: 256 * 1024,      // 256 KB
            block_fragment_size: 1024,
            message_send_queue_size: 1024,   // Divides 65536
            message_receive_queue_size: 1024,
            sent_packet_buffer_size: 1024,
            message_resend_time: 0.1,
            block_fragment_resend_time: 0.25,
            disable_blocks: false,
        }
    }
}

/// Configuration of a connection: an ordered list of channels plus the
/// packet size ceiling the channels share.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Channel configurations, in channel-index order (1..=MAX_CHANNELS).
    pub channels: Vec<ChannelConfig>,
    /// Maximum connection packet size in bytes.
    pub max_packet_size: usize,
}

impl ConnectionConfig {
    /// Returns the number of configured channels.
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Validates the channel list and every channel config.
    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() || self.channels.len() > MAX_CHANNELS {
            return Err(ErrorKind::InvalidConfig("channels"));
        }
        if self.max_packet_size == 0 {
            return Err(ErrorKind::InvalidConfig("max_packet_size"));
        }
        for channel in &self.channels {
            channel.validate()?;
        }
        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { channels: vec![ChannelConfig::default()], max_packet_size: 8 * 1024 }
    }
}

/// Configuration of the reliable endpoint sitting between a connection and
/// its transport.
#[derive(Clone, Debug)]
pub struct EndpointConfig {
    /// Maximum packet size accepted for sending.
    pub max_packet_size: usize,
    /// Packets larger than this many bytes are fragmented.
    pub fragment_above: usize,
    /// Maximum number of fragments per packet.
    pub max_fragments: usize,
    /// Size of each packet fragment in bytes.
    pub fragment_size: usize,
    /// Capacity of the sent-packet (ack tracking) buffer.
    pub ack_buffer_size: usize,
    /// Capacity of the received-packet buffer backing the ack bitfield.
    pub received_packets_buffer_size: usize,
    /// Capacity of the fragment reassembly buffer.
    pub packet_reassembly_buffer_size: usize,
    /// Smoothing factor (0..1) applied to RTT samples.
    pub rtt_smoothing_factor: f64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 8 * 1024,
            fragment_above: 1024,
            max_fragments: 16,
            fragment_size: 1024,
            ack_buffer_size: 256,
            received_packets_buffer_size: 256,
            packet_reassembly_buffer_size: 64,
            rtt_smoothing_factor: 0.0025,
        }
    }
}

/// Top-level configuration shared by clients and servers.
#[derive(Clone, Debug)]
pub struct ClientServerConfig {
    /// Connection (channel) configuration, shared by both peers.
    pub connection: ConnectionConfig,
    /// Reliable endpoint configuration.
    pub endpoint: EndpointConfig,
    /// Application protocol id; peers with mismatched ids do not connect.
    pub protocol_id: u64,
    /// Connection timeout in seconds.
    pub timeout: f64,
    /// Per-client memory budget in bytes (client side).
    pub client_memory: usize,
    /// Server-wide memory budget in bytes.
    pub server_global_memory: usize,
    /// Per-client memory budget in bytes (server side).
    pub server_per_client_memory: usize,
    /// Create a network simulator between the endpoint and the transport.
    pub network_simulator: bool,
    /// Capacity of the simulator packet ring.
    pub max_simulator_packets: usize,
}

impl Default for ClientServerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            endpoint: EndpointConfig::default(),
            protocol_id: 0,
            timeout: 10.0,
            client_memory: 10 * 1024 * 1024,
            server_global_memory: 10 * 1024 * 1024,
            server_per_client_memory: 10 * 1024 * 1024,
            network_simulator: true,
            max_simulator_packets: 4 * 1024,
        }
    }
}
