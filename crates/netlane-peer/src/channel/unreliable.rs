//! The unreliable-unordered channel.
//!
//! A bounded FIFO on each side. Messages that fit the packet budget go
//! out exactly once; everything else is dropped, never requeued. Block
//! messages travel inline inside a single packet rather than through
//! fragmentation.

use std::collections::VecDeque;
use std::rc::Rc;

use netlane_core::config::ChannelConfig;
use netlane_core::constants::CONSERVATIVE_MESSAGE_HEADER_BITS;
use netlane_protocol::packet_data::{message_type_bits, write_inline_block};
use netlane_protocol::{
    ChannelPacketContent, ChannelPacketData, MessageFactory, MessageRef,
};
use netlane_stream::{BitCounter, WireWrite};

use super::{ChannelCounters, ChannelErrorLevel};

/// Stop packing once the remaining budget drops below this.
const GIVE_UP_BITS: usize = 4 * 8;

/// Unreliable-unordered channel state machine.
pub struct UnreliableUnorderedChannel {
    config: ChannelConfig,
    channel_index: usize,
    factory: Rc<dyn MessageFactory>,
    error_level: ChannelErrorLevel,
    counters: ChannelCounters,
    send_queue: VecDeque<MessageRef>,
    receive_queue: VecDeque<MessageRef>,
}

impl UnreliableUnorderedChannel {
    /// Creates the channel.
    pub fn new(
        config: ChannelConfig,
        channel_index: usize,
        factory: Rc<dyn MessageFactory>,
        _time: f64,
    ) -> Self {
        Self {
            send_queue: VecDeque::with_capacity(config.message_send_queue_size),
            receive_queue: VecDeque::with_capacity(config.message_receive_queue_size),
            config,
            channel_index,
            factory,
            error_level: ChannelErrorLevel::None,
            counters: ChannelCounters::default(),
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
        self.send_queue.len() < self.config.message_send_queue_size
    }

    /// Whether any message is queued to go out.
    pub fn has_messages_to_send(&self) -> bool {
        !self.send_queue.is_empty()
    }

    /// Enqueues a message. The channel owns the reference from here.
    pub fn send_message(&mut self, message: MessageRef) {
        if self.error_level != ChannelErrorLevel::None {
            return;
        }
        if !self.can_send_message() {
            self.set_error_level(ChannelErrorLevel::SendQueueFull);
            return;
        }
        {
            let message = message.borrow();
            if message.is_block() && self.config.disable_blocks {
                drop(message);
                self.set_error_level(ChannelErrorLevel::BlocksDisabled);
                return;
            }
            if message.is_block() {
                debug_assert!(message.block_size() > 0);
                debug_assert!(message.block_size() <= self.config.max_block_size);
            }
        }
        self.send_queue.push_back(message);
        self.counters.messages_sent += 1;
    }

    /// Pops the next received message, in arrival order.
    pub fn receive_message(&mut self) -> Option<MessageRef> {
        if self.error_level != ChannelErrorLevel::None {
            return None;
        }
        let message = self.receive_queue.pop_front()?;
        self.counters.messages_received += 1;
        Some(message)
    }

    /// Drains queued messages into a packet payload until the budget or
    /// the per-packet message cap is hit. Messages that do not fit are
    /// dropped — unreliable by contract.
    pub fn get_packet_data(
        &mut self,
        mut available_bits: usize,
    ) -> Option<(ChannelPacketData, usize)> {
        if self.send_queue.is_empty() {
            return None;
        }
        if self.config.packet_budget > 0 {
            available_bits = available_bits.min(self.config.packet_budget * 8);
        }

        let type_bits = message_type_bits(self.factory.as_ref()) as usize;
        let mut used_bits = CONSERVATIVE_MESSAGE_HEADER_BITS;
        let mut messages: Vec<MessageRef> = Vec::new();

        loop {
            if available_bits < used_bits + GIVE_UP_BITS {
                break;
            }
            if messages.len() == self.config.max_messages_per_packet {
                break;
            }
            let Some(message) = self.send_queue.pop_front() else {
                break;
            };

            let measured = {
                let message = message.borrow();
                let mut counter = BitCounter::new();
                let mut ok = message.body().write(&mut counter).is_ok();
                if ok && message.is_block() {
                    ok = message.block().is_some_and(|block| {
                        write_inline_block(&mut counter, block, self.config.max_block_size).is_ok()
                    });
                }
                ok.then(|| counter.bits_written())
            };
            let Some(measured) = measured else {
                // Unserializable message: dropped.
                continue;
            };

            let message_bits = type_bits + measured;
            if used_bits + message_bits > available_bits {
                // Does not fit this packet; dropped, not requeued.
                continue;
            }

            used_bits += message_bits;
            messages.push(message);
        }

        if messages.is_empty() {
            return None;
        }
        Some((ChannelPacketData::messages(self.channel_index, messages), used_bits))
    }

    /// Accepts an inbound payload. Each message id is overwritten with
    /// the containing packet sequence, a cheap ordering hint consumers
    /// use for deduplication.
    pub fn process_packet_data(&mut self, data: &ChannelPacketData, packet_sequence: u16) {
        if self.error_level != ChannelErrorLevel::None {
            return;
        }
        match &data.content {
            ChannelPacketContent::Messages { failed_to_read: true, .. } => {
                self.set_error_level(ChannelErrorLevel::FailedToSerialize);
            }
            ChannelPacketContent::Messages { messages, .. } => {
                for message in messages {
                    message.borrow_mut().set_id(packet_sequence);
                    if self.receive_queue.len() < self.config.message_receive_queue_size {
                        self.receive_queue.push_back(message.clone());
                    }
                }
            }
            ChannelPacketContent::Block { .. } => {
                // Unreliable payloads never carry standalone fragments.
                tracing::warn!(
                    channel = self.channel_index,
                    "ignored block fragment on unreliable channel"
                );
            }
        }
    }

    /// Releases every queued message and clears all state.
    pub fn reset(&mut self) {
        self.error_level = ChannelErrorLevel::None;
        self.send_queue.clear();
        self.receive_queue.clear();
        self.counters.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlane_core::config::ChannelKind;
    use netlane_protocol::{Message, NetMessage};
    use netlane_stream::{BitReader, StreamError};

    #[derive(Default)]
    struct Numbered {
        value: u32,
    }

    impl Message for Numbered {
        fn write(&self, writer: &mut dyn WireWrite) -> Result<(), StreamError> {
            writer.write_bits(self.value, 32)
        }

        fn read(&mut self, reader: &mut BitReader<'_>) -> Result<(), StreamError> {
            self.value = reader.read_bits(32)?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Payload;

    impl Message for Payload {
        fn write(&self, _writer: &mut dyn WireWrite) -> Result<(), StreamError> {
            Ok(())
        }

        fn read(&mut self, _reader: &mut BitReader<'_>) -> Result<(), StreamError> {
            Ok(())
        }

        fn is_block(&self) -> bool {
            true
        }
    }

    struct Factory;

    impl MessageFactory for Factory {
        fn num_types(&self) -> usize {
            2
        }

        fn create(&self, kind: u8) -> Option<NetMessage> {
            match kind {
                0 => Some(NetMessage::new(0, Box::new(Numbered::default()))),
                1 => Some(NetMessage::new(1, Box::new(Payload))),
                _ => None,
            }
        }
    }

    fn channel() -> UnreliableUnorderedChannel {
        let mut config = ChannelConfig::new(ChannelKind::UnreliableUnordered);
        config.message_send_queue_size = 8;
        config.message_receive_queue_size = 8;
        config.max_messages_per_packet = 4;
        UnreliableUnorderedChannel::new(config, 0, Rc::new(Factory), 0.0)
    }

    fn numbered(channel: &UnreliableUnorderedChannel, value: u32) -> MessageRef {
        let message = channel.factory.create_message(0).unwrap();
        message.borrow_mut().downcast_mut::<Numbered>().unwrap().value = value;
        message
    }

    #[test]
    fn fifo_send_and_receive() {
        let mut sender = channel();
        let mut receiver = channel();
        for value in 0..3 {
            sender.send_message(numbered(&sender, value));
        }
        let (data, _) = sender.get_packet_data(8000).unwrap();
        receiver.process_packet_data(&data, 42);

        for value in 0..3 {
            let message = receiver.receive_message().unwrap();
            let message = message.borrow();
            assert_eq!(message.downcast_ref::<Numbered>().unwrap().value, value);
            assert_eq!(message.id(), 42, "id is overwritten with the packet sequence");
        }
        assert!(receiver.receive_message().is_none());
    }

    #[test]
    fn per_packet_message_cap_drops_the_tail() {
        let mut sender = channel();
        for value in 0..8 {
            sender.send_message(numbered(&sender, value));
        }
        let (data, _) = sender.get_packet_data(100_000).unwrap();
        let ChannelPacketContent::Messages { messages, .. } = &data.content else {
            panic!("expected message list");
        };
        // max_messages_per_packet is 4; the rest of the queue remains
        // for the next packet.
        assert_eq!(messages.len(), 4);
        assert_eq!(sender.send_queue.len(), 4);
    }

    #[test]
    fn small_budget_packs_a_prefix_and_leaves_the_rest() {
        let mut sender = channel();
        for value in 0..4 {
            sender.send_message(numbered(&sender, value));
        }
        // Room for the header and one 33-bit message, then give-up.
        let (data, _) = sender.get_packet_data(CONSERVATIVE_MESSAGE_HEADER_BITS + 40).unwrap();
        let ChannelPacketContent::Messages { messages, .. } = &data.content else {
            panic!("expected message list");
        };
        assert_eq!(messages.len(), 1);
        assert_eq!(sender.send_queue.len(), 3);
    }

    #[test]
    fn oversized_message_is_dropped_not_requeued() {
        let mut sender = channel();
        let block = sender.factory.create_message(1).unwrap();
        block.borrow_mut().attach_block(vec![9u8; 2048]);
        sender.send_message(block);
        sender.send_message(numbered(&sender, 5));

        // Budget too small for the inline block but fine for the
        // numbered message behind it.
        let (data, _) = sender.get_packet_data(1000).unwrap();
        let ChannelPacketContent::Messages { messages, .. } = &data.content else {
            panic!("expected message list");
        };
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].borrow().is_block());
        assert!(sender.send_queue.is_empty(), "the block was dropped, not requeued");
    }

    #[test]
    fn receive_queue_overflow_drops_incoming() {
        let mut sender = channel();
        let mut receiver = channel();
        for round in 0..3u32 {
            for value in 0..4 {
                sender.send_message(numbered(&sender, round * 4 + value));
            }
            let (data, _) = sender.get_packet_data(100_000).unwrap();
            receiver.process_packet_data(&data, round as u16);
        }
        // Receive queue caps at 8; the third packet's messages dropped.
        assert_eq!(receiver.receive_queue.len(), 8);
    }

    #[test]
    fn queue_overflow_latches_error() {
        let mut sender = channel();
        for value in 0..8 {
            sender.send_message(numbered(&sender, value));
        }
        sender.send_message(numbered(&sender, 99));
        assert_eq!(sender.error_level(), ChannelErrorLevel::SendQueueFull);
    }
}
