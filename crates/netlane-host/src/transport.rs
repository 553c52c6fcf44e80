//! Transport abstraction.
//!
//! The secure connect-token handshake, encryption and the UDP socket
//! layer live below this library; hosts only see these traits. The
//! in-memory [`MemoryNetwork`] implements them for tests, demos and
//! loopback play.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;

/// Connection state reported by a transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportState {
    /// The transport failed; the session is dead.
    Error,
    /// No connection attempt in progress.
    #[default]
    Disconnected,
    /// Handshake: connection request sent.
    SendingRequest,
    /// Handshake: challenge response sent.
    SendingResponse,
    /// Connected; datagrams flow.
    Connected,
}

impl TransportState {
    /// Whether datagrams can flow.
    pub fn is_connected(&self) -> bool {
        matches!(self, TransportState::Connected)
    }

    /// Whether a handshake is in progress.
    pub fn is_connecting(&self) -> bool {
        matches!(self, TransportState::SendingRequest | TransportState::SendingResponse)
    }
}

/// Parameters a client presents to connect. Generated out of band by the
/// application's backend and validated by the transport implementation.
#[derive(Clone)]
pub struct ConnectToken {
    /// Server addresses as seen from the internet.
    pub public_addresses: Vec<SocketAddr>,
    /// Server addresses as seen from inside the datacenter.
    pub internal_addresses: Vec<SocketAddr>,
    /// Token lifetime in seconds.
    pub expire_seconds: f64,
    /// Connection inactivity timeout in seconds.
    pub timeout_seconds: f64,
    /// Unique client id.
    pub client_id: u64,
    /// Application protocol id; must match the server's.
    pub protocol_id: u64,
    /// Shared private key the token is sealed with.
    pub private_key: [u8; 32],
    /// Opaque application data carried through the handshake.
    pub user_data: [u8; 256],
}

impl ConnectToken {
    /// Builds a token for one server address with the given identity.
    pub fn new(address: SocketAddr, client_id: u64, protocol_id: u64) -> Self {
        Self {
            public_addresses: vec![address],
            internal_addresses: vec![address],
            expire_seconds: 30.0,
            timeout_seconds: 10.0,
            client_id,
            protocol_id,
            private_key: [0; 32],
            user_data: [0; 256],
        }
    }
}

/// Client side of the secure transport.
pub trait ClientTransport {
    /// Begins connecting with the given token.
    fn connect(&mut self, token: &ConnectToken);
    /// Tears the session down.
    fn disconnect(&mut self);
    /// Current transport state.
    fn state(&self) -> TransportState;
    /// Slot index assigned by the server once connected.
    fn client_index(&self) -> Option<usize>;
    /// Ships one datagram to the server.
    fn send_packet(&mut self, data: &[u8]);
    /// Takes the next datagram from the server, if any.
    fn receive_packet(&mut self) -> Option<Vec<u8>>;
    /// Drives timers and handshake progress.
    fn update(&mut self, time: f64);
}

/// Server side of the secure transport.
pub trait ServerTransport {
    /// Begins listening with capacity for `max_clients` slots.
    fn start(&mut self, max_clients: usize);
    /// Stops listening and drops every client.
    fn stop(&mut self);
    /// Whether a client occupies the slot.
    fn client_connected(&self, client_index: usize) -> bool;
    /// Kicks the client in the slot.
    fn disconnect_client(&mut self, client_index: usize);
    /// Ships one datagram to the client in the slot.
    fn send_packet(&mut self, client_index: usize, data: &[u8]);
    /// Takes the next datagram from any client, tagged with its slot.
    fn receive_packet(&mut self) -> Option<(usize, Vec<u8>)>;
    /// Drives timers.
    fn update(&mut self, time: f64);
}

#[derive(Default)]
struct ClientLane {
    connected: bool,
    to_client: VecDeque<Vec<u8>>,
}

#[derive(Default)]
struct MemoryNetworkState {
    server_running: bool,
    max_clients: usize,
    protocol_id: u64,
    lanes: Vec<ClientLane>,
    to_server: VecDeque<(usize, Vec<u8>)>,
}

/// An in-memory network connecting one server transport with any number
/// of client transports, single-threaded by design.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Rc<RefCell<MemoryNetworkState>>,
}

impl MemoryNetwork {
    /// Creates a network validating the given protocol id.
    pub fn new(protocol_id: u64) -> Self {
        let network = Self::default();
        network.state.borrow_mut().protocol_id = protocol_id;
        network
    }

    /// Creates the server-side transport.
    pub fn server_transport(&self) -> MemoryServerTransport {
        MemoryServerTransport { state: self.state.clone() }
    }

    /// Creates a client-side transport bound to a slot index.
    pub fn client_transport(&self, client_index: usize) -> MemoryClientTransport {
        MemoryClientTransport {
            state: self.state.clone(),
            client_index,
            client_state: TransportState::Disconnected,
        }
    }
}

/// Client transport over a [`MemoryNetwork`].
pub struct MemoryClientTransport {
    state: Rc<RefCell<MemoryNetworkState>>,
    client_index: usize,
    client_state: TransportState,
}

impl ClientTransport for MemoryClientTransport {
    fn connect(&mut self, token: &ConnectToken) {
        let mut network = self.state.borrow_mut();
        if token.protocol_id != network.protocol_id {
            self.client_state = TransportState::Error;
            return;
        }
        if network.server_running && self.client_index < network.max_clients {
            network.lanes[self.client_index].connected = true;
            self.client_state = TransportState::Connected;
        } else {
            self.client_state = TransportState::SendingRequest;
        }
    }

    fn disconnect(&mut self) {
        let mut network = self.state.borrow_mut();
        if let Some(lane) = network.lanes.get_mut(self.client_index) {
            lane.connected = false;
            lane.to_client.clear();
        }
        self.client_state = TransportState::Disconnected;
    }

    fn state(&self) -> TransportState {
        self.client_state
    }

    fn client_index(&self) -> Option<usize> {
        self.client_state.is_connected().then_some(self.client_index)
    }

    fn send_packet(&mut self, data: &[u8]) {
        if !self.client_state.is_connected() {
            return;
        }
        self.state.borrow_mut().to_server.push_back((self.client_index, data.to_vec()));
    }

    fn receive_packet(&mut self) -> Option<Vec<u8>> {
        self.state
            .borrow_mut()
            .lanes
            .get_mut(self.client_index)
            .and_then(|lane| lane.to_client.pop_front())
    }

    fn update(&mut self, _time: f64) {
        // A pending request connects as soon as the server is up.
        if self.client_state == TransportState::SendingRequest {
            let mut network = self.state.borrow_mut();
            if network.server_running && self.client_index < network.max_clients {
                network.lanes[self.client_index].connected = true;
                self.client_state = TransportState::Connected;
            }
        }
        // Server may have kicked us.
        if self.client_state.is_connected() {
            let network = self.state.borrow();
            let still_connected = network
                .lanes
                .get(self.client_index)
                .is_some_and(|lane| lane.connected && network.server_running);
            if !still_connected {
                drop(network);
                self.client_state = TransportState::Disconnected;
            }
        }
    }
}

/// Server transport over a [`MemoryNetwork`].
pub struct MemoryServerTransport {
    state: Rc<RefCell<MemoryNetworkState>>,
}

impl ServerTransport for MemoryServerTransport {
    fn start(&mut self, max_clients: usize) {
        let mut network = self.state.borrow_mut();
        network.server_running = true;
        network.max_clients = max_clients;
        network.lanes = (0..max_clients).map(|_| ClientLane::default()).collect();
        network.to_server.clear();
    }

    fn stop(&mut self) {
        let mut network = self.state.borrow_mut();
        network.server_running = false;
        network.lanes.clear();
        network.to_server.clear();
    }

    fn client_connected(&self, client_index: usize) -> bool {
        self.state
            .borrow()
            .lanes
            .get(client_index)
            .is_some_and(|lane| lane.connected)
    }

    fn disconnect_client(&mut self, client_index: usize) {
        let mut network = self.state.borrow_mut();
        if let Some(lane) = network.lanes.get_mut(client_index) {
            lane.connected = false;
            lane.to_client.clear();
        }
    }

    fn send_packet(&mut self, client_index: usize, data: &[u8]) {
        let mut network = self.state.borrow_mut();
        if let Some(lane) = network.lanes.get_mut(client_index) {
            if lane.connected {
                lane.to_client.push_back(data.to_vec());
            }
        }
    }

    fn receive_packet(&mut self) -> Option<(usize, Vec<u8>)> {
        self.state.borrow_mut().to_server.pop_front()
    }

    fn update(&mut self, _time: f64) {}
}
