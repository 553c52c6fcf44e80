//! The reliable-ordered channel.
//!
//! Messages are retransmitted until acked and delivered strictly in send
//! order. Small messages batch into packets under an exact measured-bits
//! budget; a block message suspends batching and streams through the
//! fragmentation path, one fragment per packet, until every fragment is
//! acked.

use std::rc::Rc;

use netlane_core::config::ChannelConfig;
use netlane_core::constants::{
    CONSERVATIVE_FRAGMENT_HEADER_BITS, CONSERVATIVE_MESSAGE_HEADER_BITS,
};
use netlane_protocol::packet_data::message_type_bits;
use netlane_protocol::{
    ChannelPacketContent, ChannelPacketData, MessageFactory, MessageRef, SequenceBuffer,
};
use netlane_stream::{sequence_greater_than, sequence_less_than, sequence_relative_bits};

use super::{ChannelCounters, ChannelErrorLevel};

/// Stop packing once the remaining budget drops below this.
const GIVE_UP_BITS: usize = 4 * 8;

struct SendQueueEntry {
    message: MessageRef,
    /// Exact body serialization size, measured once at send time.
    measured_bits: usize,
    time_last_sent: f64,
    block: bool,
}

/// What an outgoing packet carried, so a future ack can be translated
/// back into message releases. The discriminator is explicit: a
/// message-list record has no fragment fields and vice versa.
enum SentPacketRecord {
    Messages(Vec<u16>),
    BlockFragment { message_id: u16, fragment_id: usize },
}

struct SentPacketEntry {
    time_sent: f64,
    acked: bool,
    record: SentPacketRecord,
}

/// Progress of the one block transfer allowed in flight.
struct SendBlockState {
    active: bool,
    block_size: usize,
    block_message_id: u16,
    num_fragments: usize,
    num_acked_fragments: usize,
    acked_fragment: Box<[bool]>,
    fragment_send_time: Box<[f64]>,
}

impl SendBlockState {
    fn new(max_fragments: usize) -> Self {
        Self {
            active: false,
            block_size: 0,
            block_message_id: 0,
            num_fragments: 0,
            num_acked_fragments: 0,
            acked_fragment: vec![false; max_fragments].into_boxed_slice(),
            fragment_send_time: vec![f64::NEG_INFINITY; max_fragments].into_boxed_slice(),
        }
    }

    fn reset(&mut self) {
        self.active = false;
        self.block_size = 0;
        self.block_message_id = 0;
        self.num_fragments = 0;
        self.num_acked_fragments = 0;
        self.acked_fragment.fill(false);
        self.fragment_send_time.fill(f64::NEG_INFINITY);
    }
}

/// Progress of the one block reassembly allowed at a time.
struct ReceiveBlockState {
    active: bool,
    message_id: u16,
    message_type: u8,
    num_fragments: usize,
    num_received_fragments: usize,
    received_fragment: Box<[bool]>,
    block_size: usize,
    block_data: Box<[u8]>,
    message: Option<MessageRef>,
}

impl ReceiveBlockState {
    fn new(max_block_size: usize, max_fragments: usize) -> Self {
        Self {
            active: false,
            message_id: 0,
            message_type: 0,
            num_fragments: 0,
            num_received_fragments: 0,
            received_fragment: vec![false; max_fragments].into_boxed_slice(),
            block_size: 0,
            block_data: vec![0u8; max_block_size].into_boxed_slice(),
            message: None,
        }
    }

    fn reset(&mut self) {
        self.active = false;
        self.message_id = 0;
        self.message_type = 0;
        self.num_fragments = 0;
        self.num_received_fragments = 0;
        self.received_fragment.fill(false);
        self.block_size = 0;
        self.message = None;
    }
}

/// Reliable-ordered channel state machine.
pub struct ReliableOrderedChannel {
    config: ChannelConfig,
    channel_index: usize,
    factory: Rc<dyn MessageFactory>,
    error_level: ChannelErrorLevel,
    counters: ChannelCounters,
    time: f64,

    /// Next id to assign on send.
    send_message_id: u16,
    /// Next id to deliver in order.
    receive_message_id: u16,
    /// Oldest id not yet fully acked; packing starts here.
    oldest_unacked_message_id: u16,

    send_queue: SequenceBuffer<SendQueueEntry>,
    receive_queue: SequenceBuffer<MessageRef>,
    sent_packets: SequenceBuffer<SentPacketEntry>,

    /// Present unless blocks are disabled for this channel.
    send_block: Option<SendBlockState>,
    receive_block: Option<ReceiveBlockState>,
}

impl ReliableOrderedChannel {
    /// Creates the channel. Queue sizes must already be validated.
    pub fn new(
        config: ChannelConfig,
        channel_index: usize,
        factory: Rc<dyn MessageFactory>,
        time: f64,
    ) -> Self {
        let max_fragments = config.max_fragments_per_block();
        let (send_block, receive_block) = if config.disable_blocks {
            (None, None)
        } else {
            (
                Some(SendBlockState::new(max_fragments)),
                Some(ReceiveBlockState::new(config.max_block_size, max_fragments)),
            )
        };
        Self {
            send_queue: SequenceBuffer::with_capacity(config.message_send_queue_size),
            receive_queue: SequenceBuffer::with_capacity(config.message_receive_queue_size),
            sent_packets: SequenceBuffer::with_capacity(config.sent_packet_buffer_size),
            config,
            channel_index,
            factory,
            error_level: ChannelErrorLevel::None,
            counters: ChannelCounters::default(),
            time,
            send_message_id: 0,
            receive_message_id: 0,
            oldest_unacked_message_id: 0,
            send_block,
            receive_block,
        }
    }

    fn set_error_level(&mut self, level: ChannelErrorLevel) {
        if level != self.error_level && level != ChannelErrorLevel::None {
            tracing::warn!(channel = self.channel_index, error = %level, "channel went into error state");
        }
        self.error_level = level;
    }

    /// Current latched error state.
    pub fn error_level(&self) -> ChannelErrorLevel {
        self.error_level
    }

    /// Delivery counters.
    pub fn counters(&self) -> &ChannelCounters {
        &self.counters
    }

    /// Whether the send queue has room for another message.
    pub fn can_send_message(&self) -> bool {
        self.send_queue.available(self.send_message_id)
    }

    /// Whether any message is unacked and waiting.
    pub fn has_messages_to_send(&self) -> bool {
        self.oldest_unacked_message_id != self.send_message_id
    }

    /// Enqueues a message for reliable delivery. The channel owns the
    /// reference from here; on any failure the reference is released.
    pub fn send_message(&mut self, message: MessageRef) {
        if self.error_level != ChannelErrorLevel::None {
            return;
        }
        if !self.can_send_message() {
            // Increase the send queue size, or drain acks more often.
            self.set_error_level(ChannelErrorLevel::SendQueueFull);
            return;
        }

        let (block, measured_bits) = {
            let mut message = message.borrow_mut();
            if message.is_block() && self.config.disable_blocks {
                drop(message);
                self.set_error_level(ChannelErrorLevel::BlocksDisabled);
                return;
            }
            if message.is_block() {
                debug_assert!(message.block_size() > 0);
                debug_assert!(message.block_size() <= self.config.max_block_size);
            }
            message.set_id(self.send_message_id);
            match message.measure_body_bits() {
                Ok(bits) => (message.is_block(), bits),
                Err(_) => {
                    drop(message);
                    self.set_error_level(ChannelErrorLevel::FailedToSerialize);
                    return;
                }
            }
        };

        self.send_queue.insert(
            self.send_message_id,
            SendQueueEntry {
                message,
                measured_bits,
                time_last_sent: f64::NEG_INFINITY,
                block,
            },
        );
        self.counters.messages_sent += 1;
        self.send_message_id = self.send_message_id.wrapping_add(1);
    }

    /// Returns the next in-order message, if it has arrived. Ownership
    /// transfers to the caller; dropping the handle releases it.
    pub fn receive_message(&mut self) -> Option<MessageRef> {
        if self.error_level != ChannelErrorLevel::None {
            return None;
        }
        let message = self.receive_queue.remove(self.receive_message_id)?;
        self.counters.messages_received += 1;
        self.receive_message_id = self.receive_message_id.wrapping_add(1);
        Some(message)
    }

    /// Advances channel time; resend decisions key off this.
    pub fn advance_time(&mut self, time: f64) {
        self.time = time;
    }

    /// Produces this channel's share of the outgoing packet.
    pub fn get_packet_data(
        &mut self,
        packet_sequence: u16,
        available_bits: usize,
    ) -> Option<(ChannelPacketData, usize)> {
        if !self.has_messages_to_send() {
            return None;
        }

        if self.sending_block_message() {
            if self.config.block_fragment_size * 8 > available_bits {
                return None;
            }
            let (message_id, fragment_id, fragment_data, num_fragments, message_type) =
                self.get_fragment_to_send()?;
            let result = self.get_fragment_packet_data(
                message_id,
                fragment_id,
                fragment_data,
                num_fragments,
                message_type,
            );
            self.add_fragment_packet_entry(message_id, fragment_id, packet_sequence);
            Some(result)
        } else {
            let (message_ids, used_bits) = self.get_messages_to_send(available_bits);
            if message_ids.is_empty() {
                return None;
            }
            let data = self.get_message_packet_data(&message_ids);
            self.add_message_packet_entry(message_ids, packet_sequence);
            Some((data, used_bits))
        }
    }

    /// Whether the oldest unacked message is a block, which switches the
    /// channel into fragment streaming.
    fn sending_block_message(&self) -> bool {
        self.send_queue
            .get(self.oldest_unacked_message_id)
            .is_some_and(|entry| entry.block)
    }

    /// Walks the send window selecting messages eligible to (re)send
    /// under the bit budget. Header costs are accounted exactly: the
    /// first id costs 16 raw bits, each subsequent id its relative delta.
    fn get_messages_to_send(&mut self, mut available_bits: usize) -> (Vec<u16>, usize) {
        if self.config.packet_budget > 0 {
            available_bits = available_bits.min(self.config.packet_budget * 8);
        }

        let type_bits = message_type_bits(self.factory.as_ref()) as usize;
        let message_limit =
            self.config.message_send_queue_size.min(self.config.message_receive_queue_size);

        let mut message_ids: Vec<u16> = Vec::new();
        let mut previous_message_id = 0u16;
        let mut used_bits = CONSERVATIVE_MESSAGE_HEADER_BITS;
        let mut give_up_counter = 0usize;

        for i in 0..message_limit {
            if available_bits < used_bits + GIVE_UP_BITS {
                break;
            }
            // Bound the scan over a sparse window.
            if give_up_counter > self.config.message_send_queue_size {
                break;
            }

            let message_id = self.oldest_unacked_message_id.wrapping_add(i as u16);
            let Some(entry) = self.send_queue.get_mut(message_id) else {
                continue;
            };

            // A block terminates message packing.
            if entry.block {
                break;
            }

            if entry.time_last_sent + self.config.message_resend_time <= self.time
                && available_bits >= entry.measured_bits
            {
                let mut message_bits = entry.measured_bits + type_bits;
                if message_ids.is_empty() {
                    message_bits += 16;
                } else {
                    message_bits += sequence_relative_bits(previous_message_id, message_id);
                }

                if used_bits + message_bits > available_bits {
                    give_up_counter += 1;
                    continue;
                }

                used_bits += message_bits;
                message_ids.push(message_id);
                previous_message_id = message_id;
                entry.time_last_sent = self.time;
            }

            if message_ids.len() == self.config.max_messages_per_packet {
                break;
            }
        }

        (message_ids, used_bits)
    }

    fn get_message_packet_data(&self, message_ids: &[u16]) -> ChannelPacketData {
        let messages = message_ids
            .iter()
            .filter_map(|&id| self.send_queue.get(id).map(|entry| entry.message.clone()))
            .collect();
        ChannelPacketData::messages(self.channel_index, messages)
    }

    fn add_message_packet_entry(&mut self, message_ids: Vec<u16>, sequence: u16) {
        self.sent_packets.insert(
            sequence,
            SentPacketEntry {
                time_sent: self.time,
                acked: false,
                record: SentPacketRecord::Messages(message_ids),
            },
        );
    }

    /// Selects the next block fragment due for (re)send, starting the
    /// transfer on first selection.
    fn get_fragment_to_send(&mut self) -> Option<(u16, usize, Vec<u8>, usize, u8)> {
        let message = self.send_queue.get(self.oldest_unacked_message_id)?.message.clone();
        let message = message.borrow();
        let message_id = message.id();
        let block_size = message.block_size();
        let message_type = message.kind();

        let send_block = self.send_block.as_mut()?;

        if !send_block.active {
            // Start sending this block.
            send_block.active = true;
            send_block.block_size = block_size;
            send_block.block_message_id = message_id;
            send_block.num_fragments = block_size.div_ceil(self.config.block_fragment_size);
            send_block.num_acked_fragments = 0;
            send_block.acked_fragment.fill(false);
            send_block.fragment_send_time.fill(f64::NEG_INFINITY);
            debug_assert!(send_block.num_fragments > 0);
            debug_assert!(send_block.num_fragments <= self.config.max_fragments_per_block());
        }

        let fragment_id = (0..send_block.num_fragments).find(|&i| {
            !send_block.acked_fragment[i]
                && send_block.fragment_send_time[i] + self.config.block_fragment_resend_time
                    < self.time
        })?;

        let start = fragment_id * self.config.block_fragment_size;
        let fragment_bytes = self.config.block_fragment_size.min(send_block.block_size - start);
        let fragment_data = message.block()?[start..start + fragment_bytes].to_vec();
        send_block.fragment_send_time[fragment_id] = self.time;

        Some((message_id, fragment_id, fragment_data, send_block.num_fragments, message_type))
    }

    fn get_fragment_packet_data(
        &self,
        message_id: u16,
        fragment_id: usize,
        fragment_data: Vec<u8>,
        num_fragments: usize,
        message_type: u8,
    ) -> (ChannelPacketData, usize) {
        let mut fragment_bits = CONSERVATIVE_FRAGMENT_HEADER_BITS + fragment_data.len() * 8;

        // Fragment 0 carries the block message itself so the receiver
        // learns the type and body exactly once per (re)send.
        let message = if fragment_id == 0 {
            self.send_queue.get(message_id).map(|entry| {
                fragment_bits +=
                    entry.measured_bits + message_type_bits(self.factory.as_ref()) as usize;
                entry.message.clone()
            })
        } else {
            None
        };

        let data = ChannelPacketData::block_fragment(
            self.channel_index,
            message_id,
            num_fragments,
            fragment_id,
            fragment_data,
            message_type,
            message,
        );
        (data, fragment_bits)
    }

    fn add_fragment_packet_entry(&mut self, message_id: u16, fragment_id: usize, sequence: u16) {
        self.sent_packets.insert(
            sequence,
            SentPacketEntry {
                time_sent: self.time,
                acked: false,
                record: SentPacketRecord::BlockFragment { message_id, fragment_id },
            },
        );
    }

    /// Dispatches an inbound payload for this channel.
    pub fn process_packet_data(&mut self, data: &ChannelPacketData) {
        if self.error_level != ChannelErrorLevel::None {
            return;
        }
        match &data.content {
            ChannelPacketContent::Messages { failed_to_read: true, .. } => {
                // Mismatched read/write serialization on a sub-message.
                self.set_error_level(ChannelErrorLevel::FailedToSerialize);
            }
            ChannelPacketContent::Messages { messages, .. } => {
                self.process_packet_messages(messages);
            }
            ChannelPacketContent::Block {
                message_id,
                num_fragments,
                fragment_id,
                fragment_data,
                message_type,
                message,
            } => {
                self.process_packet_fragment(
                    *message_type,
                    *message_id,
                    *num_fragments,
                    *fragment_id,
                    fragment_data,
                    message.clone(),
                );
            }
        }
    }

    fn process_packet_messages(&mut self, messages: &[MessageRef]) {
        let min_message_id = self.receive_message_id;
        let max_message_id = self
            .receive_message_id
            .wrapping_add(self.config.message_receive_queue_size as u16)
            .wrapping_sub(1);

        for message in messages {
            let message_id = message.borrow().id();

            if sequence_less_than(message_id, min_message_id) {
                // Late duplicate of something already delivered.
                continue;
            }
            if sequence_greater_than(message_id, max_message_id) {
                // The sender ran ahead of our receive window; the
                // receiver stopped dequeueing messages.
                self.set_error_level(ChannelErrorLevel::Desync);
                return;
            }
            if self.receive_queue.exists(message_id) {
                continue;
            }
            self.receive_queue.insert(message_id, message.clone());
        }
    }

    /// Applies an ack of an outer packet sequence: releases acked
    /// messages, or advances the in-flight block transfer.
    pub fn process_ack(&mut self, ack: u16) {
        enum AckAction {
            Messages(Vec<u16>),
            Fragment { message_id: u16, fragment_id: usize },
        }

        let (action, elapsed) = {
            let Some(entry) = self.sent_packets.get_mut(ack) else {
                return;
            };
            if entry.acked {
                return;
            }
            entry.acked = true;
            let action = match &entry.record {
                SentPacketRecord::Messages(ids) => AckAction::Messages(ids.clone()),
                SentPacketRecord::BlockFragment { message_id, fragment_id } => {
                    AckAction::Fragment { message_id: *message_id, fragment_id: *fragment_id }
                }
            };
            (action, self.time - entry.time_sent)
        };
        tracing::trace!(channel = self.channel_index, ack, elapsed, "packet acked");

        match action {
            AckAction::Messages(message_ids) => {
                for message_id in message_ids {
                    if self.send_queue.exists(message_id) {
                        self.send_queue.remove(message_id);
                        self.update_oldest_unacked_message_id();
                    }
                }
            }
            AckAction::Fragment { message_id, fragment_id } => {
                if self.config.disable_blocks {
                    return;
                }
                let mut block_completed = false;
                if let Some(send_block) = self.send_block.as_mut() {
                    if send_block.active
                        && send_block.block_message_id == message_id
                        && !send_block.acked_fragment[fragment_id]
                    {
                        send_block.acked_fragment[fragment_id] = true;
                        send_block.num_acked_fragments += 1;
                        if send_block.num_acked_fragments == send_block.num_fragments {
                            send_block.active = false;
                            block_completed = true;
                        }
                    }
                }
                if block_completed {
                    self.send_queue.remove(message_id);
                    self.update_oldest_unacked_message_id();
                }
            }
        }
    }

    /// Advances the oldest-unacked cursor across released slots, up to
    /// the next id to be assigned. Monotone in modular-16 order.
    fn update_oldest_unacked_message_id(&mut self) {
        let stop_message_id = self.send_message_id;
        while self.oldest_unacked_message_id != stop_message_id
            && !self.send_queue.exists(self.oldest_unacked_message_id)
        {
            self.oldest_unacked_message_id = self.oldest_unacked_message_id.wrapping_add(1);
        }
        debug_assert!(!sequence_greater_than(self.oldest_unacked_message_id, stop_message_id));
    }

    #[allow(clippy::too_many_arguments)]
    fn process_packet_fragment(
        &mut self,
        message_type: u8,
        message_id: u16,
        num_fragments: usize,
        fragment_id: usize,
        fragment_data: &[u8],
        message: Option<MessageRef>,
    ) {
        debug_assert!(!self.config.disable_blocks);

        // A block is only accepted as the next message to enter the
        // ordered stream; fragments of later blocks wait for a resend.
        let expected_message_id = self.receive_queue.sequence();
        if message_id != expected_message_id {
            return;
        }

        let fragment_size = self.config.block_fragment_size;
        let max_block_size = self.config.max_block_size;

        let mut latched: Option<ChannelErrorLevel> = None;

        if let Some(receive_block) = self.receive_block.as_mut() {
            'fragment: {
                if !receive_block.active {
                    // Start receiving a new block.
                    receive_block.active = true;
                    receive_block.num_fragments = num_fragments;
                    receive_block.num_received_fragments = 0;
                    receive_block.message_id = message_id;
                    receive_block.block_size = 0;
                    receive_block.received_fragment.fill(false);
                    receive_block.message = None;
                }

                if fragment_id >= receive_block.num_fragments
                    || num_fragments != receive_block.num_fragments
                {
                    // Fragment bookkeeping disagrees with the first
                    // fragment seen for this block.
                    latched = Some(ChannelErrorLevel::Desync);
                    break 'fragment;
                }

                if receive_block.received_fragment[fragment_id] {
                    break 'fragment;
                }

                let start = fragment_id * fragment_size;
                if start + fragment_data.len() > receive_block.block_data.len() {
                    // A full-size final fragment would overrun the block
                    // size limit.
                    latched = Some(ChannelErrorLevel::Desync);
                    break 'fragment;
                }

                receive_block.received_fragment[fragment_id] = true;
                receive_block.block_data[start..start + fragment_data.len()]
                    .copy_from_slice(fragment_data);

                if fragment_id == 0 {
                    receive_block.message_type = message_type;
                    receive_block.message = message;
                }

                if fragment_id == receive_block.num_fragments - 1 {
                    receive_block.block_size =
                        (receive_block.num_fragments - 1) * fragment_size + fragment_data.len();
                    if receive_block.block_size > max_block_size {
                        latched = Some(ChannelErrorLevel::Desync);
                        break 'fragment;
                    }
                }

                receive_block.num_received_fragments += 1;

                if receive_block.num_received_fragments == receive_block.num_fragments {
                    // Finished receiving the block.
                    let completed_id = receive_block.message_id;
                    if !self.receive_queue.available(completed_id) {
                        // The receiver stopped dequeueing messages.
                        latched = Some(ChannelErrorLevel::Desync);
                        break 'fragment;
                    }
                    let Some(block_message) = receive_block.message.take() else {
                        latched = Some(ChannelErrorLevel::Desync);
                        break 'fragment;
                    };
                    let block = receive_block.block_data[..receive_block.block_size].to_vec();
                    {
                        let mut block_message = block_message.borrow_mut();
                        debug_assert_eq!(block_message.kind(), receive_block.message_type);
                        block_message.attach_block(block);
                        block_message.set_id(completed_id);
                    }
                    self.receive_queue.insert(completed_id, block_message);
                    receive_block.active = false;
                }
            }
        }

        if let Some(level) = latched {
            self.set_error_level(level);
        }
    }

    /// Releases every queued and in-flight message and rewinds all state.
    pub fn reset(&mut self) {
        self.error_level = ChannelErrorLevel::None;
        self.send_message_id = 0;
        self.receive_message_id = 0;
        self.oldest_unacked_message_id = 0;
        self.send_queue.reset();
        self.receive_queue.reset();
        self.sent_packets.reset();
        if let Some(send_block) = self.send_block.as_mut() {
            send_block.reset();
        }
        if let Some(receive_block) = self.receive_block.as_mut() {
            receive_block.reset();
        }
        self.counters.reset();
    }
}
