//! Network condition simulator.
//!
//! Sits between an endpoint and the transport, delaying, dropping,
//! duplicating and reordering datagrams. Pending packets live in a fixed
//! ring scanned in ring order on receive, so jitter reorders deliveries
//! relative to insertion order on purpose.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

struct PacketEntry {
    to: usize,
    delivery_time: f64,
    data: Option<Vec<u8>>,
}

/// Latency / jitter / loss / duplicate injector for testing.
pub struct NetworkSimulator {
    entries: Vec<PacketEntry>,
    current_index: usize,
    time: f64,
    /// One-way latency in milliseconds.
    latency: f32,
    /// Random jitter applied on top of latency, in milliseconds.
    jitter: f32,
    /// Packet loss in percent.
    packet_loss: f32,
    /// Duplicate probability in percent.
    duplicates: f32,
    active: bool,
    rng: StdRng,
}

impl NetworkSimulator {
    /// Creates a simulator with a ring of `num_packets` pending slots.
    pub fn new(num_packets: usize, time: f64) -> Self {
        Self::with_seed(num_packets, time, rand::rng().random())
    }

    /// Creates a simulator with a deterministic random seed.
    pub fn with_seed(num_packets: usize, time: f64, seed: u64) -> Self {
        debug_assert!(num_packets > 0);
        let mut entries = Vec::with_capacity(num_packets);
        entries.resize_with(num_packets, || PacketEntry {
            to: 0,
            delivery_time: 0.0,
            data: None,
        });
        Self {
            entries,
            current_index: 0,
            time,
            latency: 0.0,
            jitter: 0.0,
            packet_loss: 0.0,
            duplicates: 0.0,
            active: false,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Sets one-way latency in milliseconds.
    pub fn set_latency(&mut self, milliseconds: f32) {
        self.latency = milliseconds;
        self.update_active();
    }

    /// Sets jitter in milliseconds.
    pub fn set_jitter(&mut self, milliseconds: f32) {
        self.jitter = milliseconds;
        self.update_active();
    }

    /// Sets packet loss in percent.
    pub fn set_packet_loss(&mut self, percent: f32) {
        self.packet_loss = percent;
        self.update_active();
    }

    /// Sets duplicate probability in percent.
    pub fn set_duplicates(&mut self, percent: f32) {
        self.duplicates = percent;
        self.update_active();
    }

    /// Whether any condition knob is non-zero. Inactive simulators are
    /// bypassed by the hosts.
    pub fn is_active(&self) -> bool {
        self.active
    }

    fn update_active(&mut self) {
        let previous = self.active;
        self.active = self.latency != 0.0
            || self.jitter != 0.0
            || self.packet_loss != 0.0
            || self.duplicates != 0.0;
        if previous && !self.active {
            self.discard_packets();
        }
    }

    fn store(&mut self, to: usize, data: &[u8], delivery_time: f64) {
        let entry = &mut self.entries[self.current_index];
        entry.to = to;
        entry.data = Some(data.to_vec());
        entry.delivery_time = delivery_time;
        self.current_index = (self.current_index + 1) % self.entries.len();
    }

    /// Queues a datagram for delayed delivery to `to`, applying loss,
    /// latency, jitter and duplication.
    pub fn send_packet(&mut self, to: usize, data: &[u8]) {
        debug_assert!(!data.is_empty());

        if self.rng.random_range(0.0..100.0) <= self.packet_loss {
            return;
        }

        let mut delay = f64::from(self.latency) / 1000.0;
        if self.jitter > 0.0 {
            delay += f64::from(self.rng.random_range(-self.jitter..=self.jitter)) / 1000.0;
        }

        self.store(to, data, self.time + delay);

        if self.rng.random_range(0.0..100.0) <= self.duplicates {
            let extra_delay = self.rng.random_range(0.0..1.0);
            self.store(to, data, self.time + delay + extra_delay);
        }
    }

    /// Drains up to `max_packets` entries whose delivery time has
    /// passed, in ring order — not delivery-time order, so jitter
    /// produces reordering.
    pub fn receive_packets(&mut self, max_packets: usize) -> Vec<(usize, Vec<u8>)> {
        if !self.active {
            return Vec::new();
        }
        let mut delivered = Vec::new();
        for entry in self.entries.iter_mut().take(max_packets) {
            if entry.delivery_time < self.time {
                if let Some(data) = entry.data.take() {
                    delivered.push((entry.to, data));
                }
            }
        }
        delivered
    }

    /// Drops every pending packet.
    pub fn discard_packets(&mut self) {
        for entry in &mut self.entries {
            entry.data = None;
        }
    }

    /// Drops pending packets addressed to one recipient.
    pub fn discard_client_packets(&mut self, client_index: usize) {
        for entry in &mut self.entries {
            if entry.to == client_index {
                entry.data = None;
            }
        }
    }

    /// Advances simulator time.
    pub fn advance_time(&mut self, time: f64) {
        self.time = time;
    }
}
