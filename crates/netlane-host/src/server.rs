//! Server host glue.
//!
//! One connection and one endpoint per client slot, a network simulator
//! shared across all of them, and a pluggable server transport.

use std::rc::Rc;

use netlane_core::config::ClientServerConfig;
use netlane_core::error::{ErrorKind, Result};
use netlane_peer::{ChannelCounters, Connection, ConnectionErrorLevel};
use netlane_protocol::{MessageFactory, MessageRef};

use crate::endpoint::{Endpoint, NetworkInfo};
use crate::simulator::NetworkSimulator;
use crate::transport::ServerTransport;

struct ClientSlot {
    connection: Connection,
    endpoint: Endpoint,
}

/// A server: one connection per client slot, driven against a transport.
pub struct Server {
    config: ClientServerConfig,
    factory: Rc<dyn MessageFactory>,
    transport: Box<dyn ServerTransport>,
    simulator: Option<NetworkSimulator>,
    slots: Vec<ClientSlot>,
    running: bool,
    time: f64,
}

impl Server {
    /// Creates a stopped server.
    pub fn new(
        config: ClientServerConfig,
        factory: Rc<dyn MessageFactory>,
        transport: Box<dyn ServerTransport>,
        time: f64,
    ) -> Self {
        Self { config, factory, transport, simulator: None, slots: Vec::new(), running: false, time }
    }

    /// Starts listening with `max_clients` slots.
    pub fn start(&mut self, max_clients: usize) -> Result<()> {
        self.stop();
        for _ in 0..max_clients {
            self.slots.push(ClientSlot {
                connection: Connection::new(
                    self.factory.clone(),
                    self.config.connection.clone(),
                    self.time,
                )?,
                endpoint: Endpoint::new(self.config.endpoint.clone(), self.time),
            });
        }
        self.simulator = self
            .config
            .network_simulator
            .then(|| NetworkSimulator::new(self.config.max_simulator_packets, self.time));
        self.transport.start(max_clients);
        self.running = true;
        Ok(())
    }

    /// Stops listening and drops every client.
    pub fn stop(&mut self) {
        if self.running {
            self.transport.stop();
        }
        self.slots.clear();
        self.simulator = None;
        self.running = false;
    }

    /// Whether the server is listening.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Time of the last `advance_time`.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Number of client slots.
    pub fn max_clients(&self) -> usize {
        self.slots.len()
    }

    /// Whether a client occupies the slot.
    pub fn is_client_connected(&self, client_index: usize) -> bool {
        self.transport.client_connected(client_index)
    }

    fn check_slot(&self, client_index: usize) -> Result<()> {
        if client_index < self.slots.len() {
            Ok(())
        } else {
            Err(ErrorKind::ClientOutOfRange(client_index))
        }
    }

    /// Kicks a client: resets its connection and endpoint, releases its
    /// queued messages and drops its in-flight simulated packets.
    pub fn disconnect_client(&mut self, client_index: usize) -> Result<()> {
        self.check_slot(client_index)?;
        self.transport.disconnect_client(client_index);
        let slot = &mut self.slots[client_index];
        slot.connection.reset();
        slot.endpoint.reset();
        if let Some(simulator) = self.simulator.as_mut() {
            simulator.discard_client_packets(client_index);
        }
        Ok(())
    }

    /// Whether a message can be enqueued for the client right now.
    pub fn can_send_message(&self, client_index: usize, channel_index: usize) -> bool {
        self.slots[client_index].connection.can_send_message(channel_index)
    }

    /// Enqueues a message for one client.
    pub fn send_message(&mut self, client_index: usize, channel_index: usize, message: MessageRef) {
        self.slots[client_index].connection.send_message(channel_index, message);
    }

    /// Dequeues the next deliverable message from one client.
    pub fn receive_message(
        &mut self,
        client_index: usize,
        channel_index: usize,
    ) -> Option<MessageRef> {
        self.slots[client_index].connection.receive_message(channel_index)
    }

    /// Delivery counters of one client's channel.
    pub fn channel_counters(&self, client_index: usize, channel_index: usize) -> &ChannelCounters {
        self.slots[client_index].connection.channel_counters(channel_index)
    }

    /// Link statistics of one client's endpoint.
    pub fn network_info(&self, client_index: usize) -> NetworkInfo {
        self.slots[client_index].endpoint.network_info()
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

    /// Builds and ships each connected client's packet for this tick.
    pub fn send_packets(&mut self) {
        if !self.running {
            return;
        }
        for client_index in 0..self.slots.len() {
            if !self.transport.client_connected(client_index) {
                continue;
            }
            let Self { slots, simulator, transport, config, .. } = self;
            let slot = &mut slots[client_index];
            let sequence = slot.endpoint.next_packet_sequence();
            let Some(packet) =
                slot.connection.generate_packet(sequence, config.connection.max_packet_size)
            else {
                continue;
            };
            slot.endpoint.send_packet(&packet, |_, datagram| {
                match simulator.as_mut().filter(|simulator| simulator.is_active()) {
                    Some(simulator) => simulator.send_packet(client_index, datagram),
                    None => transport.send_packet(client_index, datagram),
                }
            });
        }
    }

    /// Drains the transport into the per-client endpoints and
    /// connections.
    pub fn receive_packets(&mut self) {
        if !self.running {
            return;
        }
        while let Some((client_index, datagram)) = self.transport.receive_packet() {
            let Some(slot) = self.slots.get_mut(client_index) else {
                continue;
            };
            let ClientSlot { endpoint, connection } = slot;
            endpoint.receive_packet(&datagram, |sequence, payload| {
                connection.process_packet(sequence, payload)
            });
        }
    }

    /// Advances time on every slot, pumping acks and flushing
    /// simulator-delayed packets into the transport. A slot whose
    /// connection latched an error is disconnected.
    pub fn advance_time(&mut self, time: f64) {
        self.time = time;
        if !self.running {
            return;
        }

        let mut failed: Vec<usize> = Vec::new();
        for (client_index, slot) in self.slots.iter_mut().enumerate() {
            slot.connection.advance_time(time);
            if slot.connection.error_level() != ConnectionErrorLevel::None {
                tracing::debug!(
                    client = client_index,
                    error = %slot.connection.error_level(),
                    "connection error, disconnecting client"
                );
                failed.push(client_index);
                continue;
            }
            slot.endpoint.update(time);
            slot.connection.process_acks(slot.endpoint.acks());
            slot.endpoint.clear_acks();
        }
        for client_index in failed {
            let _ = self.disconnect_client(client_index);
        }

        if let Some(simulator) = self.simulator.as_mut() {
            simulator.advance_time(time);
            if simulator.is_active() {
                let max_packets = self.config.max_simulator_packets;
                for (client_index, packet) in simulator.receive_packets(max_packets) {
                    self.transport.send_packet(client_index, &packet);
                }
            }
        }

        self.transport.update(time);
    }
}
