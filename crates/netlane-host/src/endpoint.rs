//! The reliable endpoint.
//!
//! Sits between a connection and its transport: stamps outgoing packets
//! with a 16-bit sequence plus an ack header (most recent remote
//! sequence and a 32-bit redundancy bitfield), fragments packets above a
//! size threshold, reassembles inbound fragments, and surfaces each
//! acked sequence exactly once for the connection to translate into
//! message releases.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use netlane_core::buffer_pool::BufferPool;
use netlane_core::config::EndpointConfig;
use netlane_protocol::SequenceBuffer;
use netlane_stream::sequence_less_than;

/// Ack redundancy window: each header re-acks this many sequences
/// preceding the newest one.
const ACK_BITS: usize = 32;

/// Datagram discriminators.
const PACKET_REGULAR: u8 = 0;
const PACKET_FRAGMENT: u8 = 1;

/// Regular header: type, sequence, ack, ack_bits.
const HEADER_BYTES: usize = 1 + 2 + 2 + 4;
/// Fragment header adds fragment_id and num_fragments.
const FRAGMENT_HEADER_BYTES: usize = HEADER_BYTES + 2;

struct SentPacketData {
    time_sent: f64,
    acked: bool,
    packet_bytes: usize,
}

struct ReceivedPacketData;

struct FragmentReassemblyData {
    num_fragments: usize,
    num_received: usize,
    received: Vec<bool>,
    data: Vec<u8>,
    total_size: usize,
}

/// Endpoint packet counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointCounters {
    /// Packets handed to `send_packet`.
    pub packets_sent: u64,
    /// Packets delivered up to the processing callback.
    pub packets_received: u64,
    /// Sequences confirmed by the remote peer.
    pub packets_acked: u64,
    /// Inbound packets dropped as stale or duplicate.
    pub packets_stale: u64,
    /// Inbound datagrams dropped as malformed.
    pub packets_invalid: u64,
}

/// Point-in-time link statistics surfaced to applications.
#[derive(Clone, Copy, Debug, Default)]
pub struct NetworkInfo {
    /// Smoothed round-trip time in seconds.
    pub rtt: f64,
    /// Estimated packet loss, 0.0 to 1.0.
    pub packet_loss: f64,
    /// Outbound bandwidth in kilobits per second.
    pub sent_bandwidth_kbps: f64,
    /// Inbound bandwidth in kilobits per second.
    pub received_bandwidth_kbps: f64,
    /// Acked outbound bandwidth in kilobits per second.
    pub acked_bandwidth_kbps: f64,
    /// Packets sent through the endpoint.
    pub num_packets_sent: u64,
    /// Packets received through the endpoint.
    pub num_packets_received: u64,
    /// Packets acked by the remote peer.
    pub num_packets_acked: u64,
}

/// The reliable endpoint for one peer.
pub struct Endpoint {
    config: EndpointConfig,
    time: f64,
    /// Next outgoing packet sequence.
    sequence: u16,
    /// Acked sequences not yet drained by the connection.
    acks: Vec<u16>,
    sent_packets: SequenceBuffer<SentPacketData>,
    received_packets: SequenceBuffer<ReceivedPacketData>,
    reassembly: SequenceBuffer<FragmentReassemblyData>,
    buffer_pool: BufferPool,
    rtt: f64,
    packet_loss: f64,
    sent_bandwidth_kbps: f64,
    received_bandwidth_kbps: f64,
    acked_bandwidth_kbps: f64,
    /// Loss and bandwidth sampling state, refreshed about once a second.
    last_sample_time: f64,
    sent_at_last_sample: u64,
    acked_at_last_sample: u64,
    bytes_sent_accum: u64,
    bytes_received_accum: u64,
    bytes_acked_accum: u64,
    counters: EndpointCounters,
}

impl Endpoint {
    /// Creates an endpoint at the given time.
    pub fn new(config: EndpointConfig, time: f64) -> Self {
        Self {
            sent_packets: SequenceBuffer::with_capacity(config.ack_buffer_size),
            received_packets: SequenceBuffer::with_capacity(config.received_packets_buffer_size),
            reassembly: SequenceBuffer::with_capacity(config.packet_reassembly_buffer_size),
            buffer_pool: BufferPool::new(config.fragment_size + FRAGMENT_HEADER_BYTES, 64),
            config,
            time,
            sequence: 0,
            acks: Vec::new(),
            rtt: 0.0,
            packet_loss: 0.0,
            sent_bandwidth_kbps: 0.0,
            received_bandwidth_kbps: 0.0,
            acked_bandwidth_kbps: 0.0,
            last_sample_time: time,
            sent_at_last_sample: 0,
            acked_at_last_sample: 0,
            bytes_sent_accum: 0,
            bytes_received_accum: 0,
            bytes_acked_accum: 0,
            counters: EndpointCounters::default(),
        }
    }

    /// The sequence number the next `send_packet` will use.
    pub fn next_packet_sequence(&self) -> u16 {
        self.sequence
    }

    /// Smoothed round-trip time in seconds.
    pub fn rtt(&self) -> f64 {
        self.rtt
    }

    /// Estimated packet loss, 0.0 to 1.0.
    pub fn packet_loss(&self) -> f64 {
        self.packet_loss
    }

    /// Sent, received and acked bandwidth in kilobits per second.
    pub fn bandwidth(&self) -> (f64, f64, f64) {
        (self.sent_bandwidth_kbps, self.received_bandwidth_kbps, self.acked_bandwidth_kbps)
    }

    /// Packet counters.
    pub fn counters(&self) -> &EndpointCounters {
        &self.counters
    }

    /// Link statistics snapshot.
    pub fn network_info(&self) -> NetworkInfo {
        NetworkInfo {
            rtt: self.rtt,
            packet_loss: self.packet_loss,
            sent_bandwidth_kbps: self.sent_bandwidth_kbps,
            received_bandwidth_kbps: self.received_bandwidth_kbps,
            acked_bandwidth_kbps: self.acked_bandwidth_kbps,
            num_packets_sent: self.counters.packets_sent,
            num_packets_received: self.counters.packets_received,
            num_packets_acked: self.counters.packets_acked,
        }
    }

    /// Acked sequences waiting to be drained.
    pub fn acks(&self) -> &[u16] {
        &self.acks
    }

    /// Clears the drained ack list.
    pub fn clear_acks(&mut self) {
        self.acks.clear();
    }

    /// Ack header for outgoing packets: the most recent remote sequence
    /// plus a bitfield re-acking the 32 sequences before it.
    fn ack_header(&self) -> (u16, u32) {
        let ack = self.received_packets.sequence().wrapping_sub(1);
        let mut ack_bits: u32 = 0;
        let mut mask: u32 = 1;
        for i in 1..=ACK_BITS as u16 {
            if self.received_packets.exists(ack.wrapping_sub(i)) {
                ack_bits |= mask;
            }
            mask <<= 1;
        }
        (ack, ack_bits)
    }

    fn write_header(datagram: &mut Vec<u8>, kind: u8, sequence: u16, ack: u16, ack_bits: u32) {
        // Writes to Vec<u8> cannot fail.
        let _ = datagram.write_u8(kind);
        let _ = datagram.write_u16::<BigEndian>(sequence);
        let _ = datagram.write_u16::<BigEndian>(ack);
        let _ = datagram.write_u32::<BigEndian>(ack_bits);
    }

    /// Sends one packet, fragmenting above the configured threshold.
    /// `transmit` is called once per datagram with the sequence and the
    /// bytes to put on the wire.
    pub fn send_packet<F>(&mut self, packet_data: &[u8], mut transmit: F)
    where
        F: FnMut(u16, &[u8]),
    {
        if packet_data.is_empty() || packet_data.len() > self.config.max_packet_size {
            tracing::error!(bytes = packet_data.len(), "refused to send out-of-range packet");
            return;
        }

        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        let (ack, ack_bits) = self.ack_header();

        self.sent_packets.insert(
            sequence,
            SentPacketData { time_sent: self.time, acked: false, packet_bytes: packet_data.len() },
        );
        self.bytes_sent_accum += packet_data.len() as u64;

        if packet_data.len() <= self.config.fragment_above {
            let mut datagram = self.buffer_pool.allocate();
            Self::write_header(&mut datagram, PACKET_REGULAR, sequence, ack, ack_bits);
            datagram.extend_from_slice(packet_data);
            transmit(sequence, &datagram);
            self.buffer_pool.free(datagram);
        } else {
            let num_fragments = packet_data.len().div_ceil(self.config.fragment_size);
            if num_fragments > self.config.max_fragments {
                tracing::error!(num_fragments, "packet needs more fragments than configured");
                return;
            }
            for fragment_id in 0..num_fragments {
                let start = fragment_id * self.config.fragment_size;
                let end = (start + self.config.fragment_size).min(packet_data.len());
                let mut datagram = self.buffer_pool.allocate();
                Self::write_header(&mut datagram, PACKET_FRAGMENT, sequence, ack, ack_bits);
                let _ = datagram.write_u8(fragment_id as u8);
                let _ = datagram.write_u8(num_fragments as u8);
                datagram.extend_from_slice(&packet_data[start..end]);
                transmit(sequence, &datagram);
                self.buffer_pool.free(datagram);
            }
        }

        self.counters.packets_sent += 1;
    }

    /// Marks sequences confirmed by an inbound ack header, surfacing
    /// each exactly once and feeding the RTT estimate.
    fn harvest_acks(&mut self, ack: u16, ack_bits: u32) {
        for i in 0..=ACK_BITS as u16 {
            let confirmed = if i == 0 { true } else { (ack_bits >> (i - 1)) & 1 == 1 };
            if !confirmed {
                continue;
            }
            let sequence = ack.wrapping_sub(i);
            if let Some(entry) = self.sent_packets.get_mut(sequence) {
                if !entry.acked {
                    entry.acked = true;
                    self.acks.push(sequence);
                    self.counters.packets_acked += 1;
                    self.bytes_acked_accum += entry.packet_bytes as u64;

                    let sample = self.time - entry.time_sent;
                    if sample >= 0.0 {
                        if self.rtt == 0.0 {
                            self.rtt = sample;
                        } else {
                            self.rtt += (sample - self.rtt) * self.config.rtt_smoothing_factor;
                        }
                    }
                }
            }
        }
    }

    /// Delivers a reassembled (or unfragmented) payload: dedupes against
    /// the received buffer, invokes the processing callback, and only
    /// records the sequence as received when the callback accepts it —
    /// a rejected payload must not be acked back to the sender.
    fn deliver<F>(&mut self, sequence: u16, payload: &[u8], process: &mut F)
    where
        F: FnMut(u16, &[u8]) -> bool,
    {
        let stale_before = self
            .received_packets
            .sequence()
            .wrapping_sub(self.config.received_packets_buffer_size as u16);
        if self.received_packets.exists(sequence)
            || sequence_less_than(sequence, stale_before)
        {
            self.counters.packets_stale += 1;
            return;
        }
        if process(sequence, payload) {
            self.received_packets.insert(sequence, ReceivedPacketData);
            self.counters.packets_received += 1;
        }
    }

    /// Accepts one datagram from the transport. Harvests ack
    /// information, reassembles fragments, and hands complete payloads
    /// to `process`.
    pub fn receive_packet<F>(&mut self, datagram: &[u8], mut process: F)
    where
        F: FnMut(u16, &[u8]) -> bool,
    {
        if datagram.len() < HEADER_BYTES {
            self.counters.packets_invalid += 1;
            return;
        }
        self.bytes_received_accum += datagram.len() as u64;
        let mut cursor = Cursor::new(datagram);
        // Header reads cannot fail past the length check above.
        let Ok(kind) = cursor.read_u8() else { return };
        let Ok(sequence) = cursor.read_u16::<BigEndian>() else { return };
        let Ok(ack) = cursor.read_u16::<BigEndian>() else { return };
        let Ok(ack_bits) = cursor.read_u32::<BigEndian>() else { return };

        self.harvest_acks(ack, ack_bits);

        match kind {
            PACKET_REGULAR => {
                let payload = &datagram[HEADER_BYTES..];
                self.deliver(sequence, payload, &mut process);
            }
            PACKET_FRAGMENT => {
                let mut ids = [0u8; 2];
                if cursor.read_exact(&mut ids).is_err() {
                    self.counters.packets_invalid += 1;
                    return;
                }
                let payload = &datagram[FRAGMENT_HEADER_BYTES..];
                self.receive_fragment(sequence, ids[0] as usize, ids[1] as usize, payload, &mut process);
            }
            _ => {
                self.counters.packets_invalid += 1;
            }
        }
    }

    fn receive_fragment<F>(
        &mut self,
        sequence: u16,
        fragment_id: usize,
        num_fragments: usize,
        payload: &[u8],
        process: &mut F,
    ) where
        F: FnMut(u16, &[u8]) -> bool,
    {
        if num_fragments == 0
            || num_fragments > self.config.max_fragments
            || fragment_id >= num_fragments
        {
            self.counters.packets_invalid += 1;
            return;
        }
        // All fragments except the last must be full-size.
        if fragment_id + 1 < num_fragments && payload.len() != self.config.fragment_size {
            self.counters.packets_invalid += 1;
            return;
        }
        if payload.is_empty() || payload.len() > self.config.fragment_size {
            self.counters.packets_invalid += 1;
            return;
        }

        if self.reassembly.get(sequence).is_none() {
            let fragment_size = self.config.fragment_size;
            self.reassembly.insert(
                sequence,
                FragmentReassemblyData {
                    num_fragments,
                    num_received: 0,
                    received: vec![false; num_fragments],
                    data: vec![0u8; num_fragments * fragment_size],
                    total_size: 0,
                },
            );
        }

        let fragment_size = self.config.fragment_size;
        let completed = {
            let Some(entry) = self.reassembly.get_mut(sequence) else {
                // Too old for the reassembly window.
                self.counters.packets_stale += 1;
                return;
            };
            if num_fragments != entry.num_fragments {
                self.counters.packets_invalid += 1;
                return;
            }
            if entry.received[fragment_id] {
                return;
            }
            entry.received[fragment_id] = true;
            let start = fragment_id * fragment_size;
            entry.data[start..start + payload.len()].copy_from_slice(payload);
            if fragment_id == num_fragments - 1 {
                entry.total_size = (num_fragments - 1) * fragment_size + payload.len();
            }
            entry.num_received += 1;
            entry.num_received == entry.num_fragments
        };

        if completed {
            if let Some(entry) = self.reassembly.remove(sequence) {
                self.deliver(sequence, &entry.data[..entry.total_size], process);
            }
        }
    }

    /// Advances endpoint time and refreshes the loss and bandwidth
    /// estimates roughly once per second from counter deltas.
    pub fn update(&mut self, time: f64) {
        self.time = time;
        let elapsed = time - self.last_sample_time;
        if elapsed >= 1.0 {
            let sent = self.counters.packets_sent - self.sent_at_last_sample;
            let acked = self.counters.packets_acked - self.acked_at_last_sample;
            if sent > 0 {
                let sample = 1.0 - (acked as f64 / sent as f64).min(1.0);
                self.packet_loss += (sample - self.packet_loss) * 0.1;
            }
            let kbps = |bytes: u64| bytes as f64 * 8.0 / 1000.0 / elapsed;
            self.sent_bandwidth_kbps = kbps(self.bytes_sent_accum);
            self.received_bandwidth_kbps = kbps(self.bytes_received_accum);
            self.acked_bandwidth_kbps = kbps(self.bytes_acked_accum);
            self.bytes_sent_accum = 0;
            self.bytes_received_accum = 0;
            self.bytes_acked_accum = 0;
            self.sent_at_last_sample = self.counters.packets_sent;
            self.acked_at_last_sample = self.counters.packets_acked;
            self.last_sample_time = time;
        }
    }

    /// Clears all sequencing state; counters persist.
    pub fn reset(&mut self) {
        self.sequence = 0;
        self.acks.clear();
        self.sent_packets.reset();
        self.received_packets.reset();
        self.reassembly.reset();
        self.rtt = 0.0;
        self.packet_loss = 0.0;
        self.sent_bandwidth_kbps = 0.0;
        self.received_bandwidth_kbps = 0.0;
        self.acked_bandwidth_kbps = 0.0;
        self.bytes_sent_accum = 0;
        self.bytes_received_accum = 0;
        self.bytes_acked_accum = 0;
        self.sent_at_last_sample = self.counters.packets_sent;
        self.acked_at_last_sample = self.counters.packets_acked;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Endpoint, Endpoint) {
        let config = EndpointConfig::default();
        (Endpoint::new(config.clone(), 0.0), Endpoint::new(config, 0.0))
    }

    /// Passes every datagram of one `send_packet` straight into `to`.
    fn transfer(from: &mut Endpoint, to: &mut Endpoint, payload: &[u8]) -> Vec<(u16, Vec<u8>)> {
        let mut wire = Vec::new();
        from.send_packet(payload, |sequence, datagram| {
            wire.push((sequence, datagram.to_vec()));
        });
        let mut delivered = Vec::new();
        for (_, datagram) in &wire {
            to.receive_packet(datagram, |sequence, data| {
                delivered.push((sequence, data.to_vec()));
                true
            });
        }
        delivered
    }

    #[test]
    fn small_packets_round_trip() {
        let (mut a, mut b) = pair();
        let delivered = transfer(&mut a, &mut b, b"hello");
        assert_eq!(delivered, vec![(0u16, b"hello".to_vec())]);
        assert_eq!(b.counters().packets_received, 1);
    }

    #[test]
    fn large_packets_fragment_and_reassemble() {
        let (mut a, mut b) = pair();
        let payload: Vec<u8> = (0..5000u32).map(|i| (i & 0xFF) as u8).collect();

        let mut datagrams = 0;
        a.send_packet(&payload, |_, _| datagrams += 1);
        assert_eq!(datagrams, 5, "5000 bytes over 1024-byte fragments");

        let delivered = transfer(&mut a, &mut b, &payload);
        // `transfer` resent it as sequence 1; both complete identically.
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1, payload);
    }

    #[test]
    fn acks_flow_back_and_surface_once() {
        let (mut a, mut b) = pair();

        // a -> b carries data; b receives it.
        assert_eq!(transfer(&mut a, &mut b, b"data").len(), 1);

        // b -> a: any packet from b now acks a's sequence 0.
        a.update(0.05);
        b.update(0.05);
        let _ = transfer(&mut b, &mut a, b"reply");
        assert_eq!(a.acks(), &[0]);
        assert!(a.rtt() > 0.0);

        a.clear_acks();
        // A duplicate of the same ack header surfaces nothing new.
        let _ = transfer(&mut b, &mut a, b"reply again");
        assert_eq!(a.acks(), &[] as &[u16]);
        assert_eq!(a.counters().packets_acked, 1);
    }

    #[test]
    fn ack_bitfield_covers_earlier_sequences() {
        let (mut a, mut b) = pair();
        // a sends 5 packets; b sees them all.
        for i in 0..5u8 {
            let delivered = transfer(&mut a, &mut b, &[i]);
            assert_eq!(delivered.len(), 1);
        }
        // One reply acks all five at once.
        let _ = transfer(&mut b, &mut a, b"ack all");
        let mut acked = a.acks().to_vec();
        acked.sort_unstable();
        assert_eq!(acked, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn duplicate_payloads_are_dropped() {
        let (mut a, mut b) = pair();
        let mut wire = Vec::new();
        a.send_packet(b"once", |_, datagram| wire.push(datagram.to_vec()));

        let mut deliveries = 0;
        for _ in 0..3 {
            for datagram in &wire {
                b.receive_packet(datagram, |_, _| {
                    deliveries += 1;
                    true
                });
            }
        }
        assert_eq!(deliveries, 1);
        assert_eq!(b.counters().packets_stale, 2);
    }

    #[test]
    fn rejected_payloads_are_not_recorded_as_received() {
        let (mut a, mut b) = pair();
        let mut wire = Vec::new();
        a.send_packet(b"payload", |_, datagram| wire.push(datagram.to_vec()));

        // Connection rejects it the first time.
        b.receive_packet(&wire[0], |_, _| false);
        assert_eq!(b.counters().packets_received, 0);

        // The same sequence can still be accepted later.
        let mut accepted = false;
        b.receive_packet(&wire[0], |_, _| {
            accepted = true;
            true
        });
        assert!(accepted);
        assert_eq!(b.counters().packets_received, 1);
    }

    #[test]
    fn malformed_datagrams_count_invalid() {
        let (_, mut b) = pair();
        b.receive_packet(&[1, 2, 3], |_, _| true);
        b.receive_packet(&[9, 0, 0, 0, 0, 0, 0, 0, 0, 0], |_, _| true);
        assert_eq!(b.counters().packets_invalid, 2);
    }

    #[test]
    fn bandwidth_estimates_update_over_time() {
        let (mut a, mut b) = pair();
        for _ in 0..10 {
            let delivered = transfer(&mut a, &mut b, &[0u8; 100]);
            assert_eq!(delivered.len(), 1);
        }
        a.update(1.5);
        b.update(1.5);
        let (sent, _, _) = a.bandwidth();
        assert!(sent > 0.0);
        let (_, received, _) = b.bandwidth();
        assert!(received > 0.0);
    }

    #[test]
    fn oversized_send_is_refused() {
        let (mut a, _) = pair();
        let oversized = vec![0u8; a.config.max_packet_size + 1];
        let mut transmitted = false;
        a.send_packet(&oversized, |_, _| transmitted = true);
        assert!(!transmitted);
        assert_eq!(a.counters().packets_sent, 0);
    }
}
