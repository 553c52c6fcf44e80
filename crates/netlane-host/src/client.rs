//! Client host glue.
//!
//! Owns one connection, one endpoint, an optional network simulator and
//! the transport, and drives them in the receive → advance → send
//! cadence each tick.

use std::rc::Rc;

use netlane_core::config::ClientServerConfig;
use netlane_core::error::Result;
use netlane_peer::{ChannelCounters, Connection, ConnectionErrorLevel};
use netlane_protocol::{MessageFactory, MessageRef};

use crate::endpoint::{Endpoint, NetworkInfo};
use crate::simulator::NetworkSimulator;
use crate::transport::{ClientTransport, ConnectToken, TransportState};

/// High-level client session state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientState {
    /// The session failed.
    Error,
    /// Not connected.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Connected; messages flow.
    Connected,
}

/// A client: one connection to a server, driven against a transport.
pub struct Client {
    config: ClientServerConfig,
    connection: Connection,
    endpoint: Endpoint,
    simulator: Option<NetworkSimulator>,
    transport: Box<dyn ClientTransport>,
    state: ClientState,
    time: f64,
}

impl Client {
    /// Creates a disconnected client.
    pub fn new(
        config: ClientServerConfig,
        factory: Rc<dyn MessageFactory>,
        transport: Box<dyn ClientTransport>,
        time: f64,
    ) -> Result<Self> {
        let connection = Connection::new(factory, config.connection.clone(), time)?;
        let endpoint = Endpoint::new(config.endpoint.clone(), time);
        let simulator = config
            .network_simulator
            .then(|| NetworkSimulator::new(config.max_simulator_packets, time));
        Ok(Self {
            config,
            connection,
            endpoint,
            simulator,
            transport,
            state: ClientState::Disconnected,
            time,
        })
    }

    /// Begins connecting with the given token.
    pub fn connect(&mut self, token: &ConnectToken) {
        self.transport.connect(token);
        self.state = Self::map_state(self.transport.state());
    }

    /// Disconnects and releases every queued message.
    pub fn disconnect(&mut self) {
        self.transport.disconnect();
        self.connection.reset();
        self.endpoint.reset();
        if let Some(simulator) = self.simulator.as_mut() {
            simulator.discard_packets();
        }
        self.state = ClientState::Disconnected;
    }

    /// Current session state.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Time of the last `advance_time`.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Whether messages flow right now.
    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    /// Slot index assigned by the server, once connected.
    pub fn client_index(&self) -> Option<usize> {
        self.transport.client_index()
    }

    /// Connection error level, for diagnostics.
    pub fn connection_error_level(&self) -> ConnectionErrorLevel {
        self.connection.error_level()
    }

    /// Whether a message can be enqueued on the channel right now.
    pub fn can_send_message(&self, channel_index: usize) -> bool {
        self.connection.can_send_message(channel_index)
    }

    /// Enqueues a message on a channel.
    pub fn send_message(&mut self, channel_index: usize, message: MessageRef) {
        self.connection.send_message(channel_index, message);
    }

    /// Dequeues the next deliverable message from a channel.
    pub fn receive_message(&mut self, channel_index: usize) -> Option<MessageRef> {
        self.connection.receive_message(channel_index)
    }

    /// Delivery counters of one channel.
    pub fn channel_counters(&self, channel_index: usize) -> &ChannelCounters {
        self.connection.channel_counters(channel_index)
    }

    /// Link statistics from the endpoint.
    pub fn network_info(&self) -> NetworkInfo {
        self.endpoint.network_info()
    }

    /// Sets simulated one-way latency in milliseconds.
    pub fn set_latency(&mut self, milliseconds: f32) {
        if let Some(simulator) = self.simulator.as_mut() {
            simulator.set_latency(milliseconds);
        }
    }

    /// Sets simulated jitter in milliseconds.
    pub fn set_jitter(&mut self, milliseconds: f32) {
        if let Some(simulator) = self.simulator.as_mut() {
            simulator.set_jitter(milliseconds);
        }
    }

    /// Sets simulated packet loss in percent.
    pub fn set_packet_loss(&mut self, percent: f32) {
        if let Some(simulator) = self.simulator.as_mut() {
            simulator.set_packet_loss(percent);
        }
    }

    /// Sets simulated duplicate probability in percent.
    pub fn set_duplicates(&mut self, percent: f32) {
        if let Some(simulator) = self.simulator.as_mut() {
            simulator.set_duplicates(percent);
        }
    }

    /// Builds and ships this tick's outgoing packet.
    pub fn send_packets(&mut self) {
        if !self.is_connected() {
            return;
        }
        let sequence = self.endpoint.next_packet_sequence();
        let Some(packet) =
            self.connection.generate_packet(sequence, self.config.connection.max_packet_size)
        else {
            return;
        };
        let Self { endpoint, simulator, transport, .. } = self;
        endpoint.send_packet(&packet, |_, datagram| {
            match simulator.as_mut().filter(|simulator| simulator.is_active()) {
                Some(simulator) => simulator.send_packet(0, datagram),
                None => transport.send_packet(datagram),
            }
        });
    }

    /// Drains the transport into the endpoint and the connection.
    pub fn receive_packets(&mut self) {
        let Self { endpoint, connection, transport, .. } = self;
        while let Some(datagram) = transport.receive_packet() {
            endpoint.receive_packet(&datagram, |sequence, payload| {
                connection.process_packet(sequence, payload)
            });
        }
    }

    /// Advances time: drives the connection, pumps acks, flushes
    /// simulator-delayed packets into the transport, and syncs session
    /// state. A latched connection error terminates the session here.
    pub fn advance_time(&mut self, time: f64) {
        self.time = time;

        self.connection.advance_time(time);
        if self.connection.error_level() != ConnectionErrorLevel::None {
            tracing::debug!(
                error = %self.connection.error_level(),
                "connection error, disconnecting client"
            );
            self.disconnect();
            return;
        }

        self.endpoint.update(time);
        self.connection.process_acks(self.endpoint.acks());
        self.endpoint.clear_acks();

        if let Some(simulator) = self.simulator.as_mut() {
            simulator.advance_time(time);
            if simulator.is_active() {
                let max_packets = self.config.max_simulator_packets;
                for (_, packet) in simulator.receive_packets(max_packets) {
                    self.transport.send_packet(&packet);
                }
            }
        }

        self.transport.update(time);
        self.state = Self::map_state(self.transport.state());
    }

    fn map_state(transport_state: TransportState) -> ClientState {
        match transport_state {
            TransportState::Error => ClientState::Error,
            TransportState::Disconnected => ClientState::Disconnected,
            TransportState::SendingRequest | TransportState::SendingResponse => {
                ClientState::Connecting
            }
            TransportState::Connected => ClientState::Connected,
        }
    }
}
