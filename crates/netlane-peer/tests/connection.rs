//! Integration tests for the connection layer: two connections wired
//! back to back with a hand-driven packet sequence and ack feed.

use std::rc::Rc;

use netlane_core::config::{ChannelConfig, ChannelKind, ConnectionConfig};
use netlane_peer::{ChannelErrorLevel, Connection, ConnectionErrorLevel};
use netlane_protocol::{Message, MessageFactory, MessageRef, NetMessage};
use netlane_stream::{BitReader, StreamError, WireWrite};

#[derive(Default)]
struct TestMessage {
    counter: u32,
}

impl Message for TestMessage {
    fn write(&self, writer: &mut dyn WireWrite) -> Result<(), StreamError> {
        writer.write_bits(self.counter, 32)
    }

    fn read(&mut self, reader: &mut BitReader<'_>) -> Result<(), StreamError> {
        self.counter = reader.read_bits(32)?;
        Ok(())
    }
}

#[derive(Default)]
struct TestBlockMessage;

impl Message for TestBlockMessage {
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

struct TestMessageFactory;

impl MessageFactory for TestMessageFactory {
    fn num_types(&self) -> usize {
        2
    }

    fn create(&self, kind: u8) -> Option<NetMessage> {
        match kind {
            0 => Some(NetMessage::new(0, Box::new(TestMessage::default()))),
            1 => Some(NetMessage::new(1, Box::new(TestBlockMessage))),
            _ => None,
        }
    }
}

fn two_channel_config() -> ConnectionConfig {
    let mut config = ConnectionConfig::default();
    config.channels = vec![
        ChannelConfig::default(),
        ChannelConfig::new(ChannelKind::UnreliableUnordered),
    ];
    config
}

fn connection(config: &ConnectionConfig) -> Connection {
    Connection::new(Rc::new(TestMessageFactory), config.clone(), 0.0).unwrap()
}

fn test_message(counter: u32) -> MessageRef {
    let message = TestMessageFactory.create_message(0).unwrap();
    message.borrow_mut().downcast_mut::<TestMessage>().unwrap().counter = counter;
    message
}

/// Moves one packet from `from` to `to` over a perfect link, acking it
/// back immediately. Returns the bytes on the wire.
fn pump(from: &mut Connection, to: &mut Connection, sequence: u16, max_bytes: usize) -> usize {
    let bytes = from.generate_packet(sequence, max_bytes).unwrap();
    assert!(bytes.len() <= max_bytes, "packet overran its byte budget");
    assert!(to.process_packet(sequence, &bytes));
    from.process_acks(&[sequence]);
    bytes.len()
}

#[test]
fn reliable_messages_arrive_in_order() {
    let config = two_channel_config();
    let mut sender = connection(&config);
    let mut receiver = connection(&config);

    const NUM_MESSAGES: u32 = 300;
    let mut next_send = 0u32;
    let mut next_receive = 0u32;
    let mut sequence = 0u16;
    let mut time = 0.0;

    while next_receive < NUM_MESSAGES {
        while next_send < NUM_MESSAGES && sender.can_send_message(0) {
            sender.send_message(0, test_message(next_send));
            next_send += 1;
        }
        pump(&mut sender, &mut receiver, sequence, config.max_packet_size);
        sequence = sequence.wrapping_add(1);

        while let Some(message) = receiver.receive_message(0) {
            let message = message.borrow();
            assert_eq!(
                message.downcast_ref::<TestMessage>().unwrap().counter,
                next_receive,
                "messages must arrive in send order"
            );
            next_receive += 1;
        }

        time += 0.1;
        sender.advance_time(time);
        receiver.advance_time(time);
        assert_eq!(sender.error_level(), ConnectionErrorLevel::None);
        assert_eq!(receiver.error_level(), ConnectionErrorLevel::None);
    }

    assert_eq!(sender.channel_counters(0).messages_sent, u64::from(NUM_MESSAGES));
    assert_eq!(receiver.channel_counters(0).messages_received, u64::from(NUM_MESSAGES));
}

#[test]
fn retransmission_recovers_lost_packets() {
    let config = two_channel_config();
    let mut sender = connection(&config);
    let mut receiver = connection(&config);

    for counter in 0..10 {
        sender.send_message(0, test_message(counter));
    }

    // First packet is lost in transit: never processed, never acked.
    let _lost = sender.generate_packet(0, config.max_packet_size).unwrap();

    // Advance past the resend time; the messages go out again.
    let mut time = 0.0;
    for tick in 1..5u16 {
        time += 0.2;
        sender.advance_time(time);
        receiver.advance_time(time);
        pump(&mut sender, &mut receiver, tick, config.max_packet_size);
    }

    let mut received = Vec::new();
    while let Some(message) = receiver.receive_message(0) {
        received.push(message.borrow().downcast_ref::<TestMessage>().unwrap().counter);
    }
    assert_eq!(received, (0..10).collect::<Vec<_>>());
    assert!(!sender.has_messages_to_send(0), "acked messages are released");
}

#[test]
fn channels_multiplex_into_one_packet() {
    let config = two_channel_config();
    let mut sender = connection(&config);
    let mut receiver = connection(&config);

    sender.send_message(0, test_message(1));
    sender.send_message(1, test_message(2));

    pump(&mut sender, &mut receiver, 0, config.max_packet_size);

    let reliable = receiver.receive_message(0).unwrap();
    assert_eq!(reliable.borrow().downcast_ref::<TestMessage>().unwrap().counter, 1);
    let unreliable = receiver.receive_message(1).unwrap();
    assert_eq!(unreliable.borrow().downcast_ref::<TestMessage>().unwrap().counter, 2);
}

#[test]
fn unreliable_receive_stamps_packet_sequence_as_id() {
    let config = two_channel_config();
    let mut sender = connection(&config);
    let mut receiver = connection(&config);

    sender.send_message(1, test_message(7));
    pump(&mut sender, &mut receiver, 321, config.max_packet_size);

    let message = receiver.receive_message(1).unwrap();
    assert_eq!(message.borrow().id(), 321);
}

#[test]
fn empty_packets_are_valid_and_processed() {
    let config = two_channel_config();
    let mut sender = connection(&config);
    let mut receiver = connection(&config);

    let bytes = sender.generate_packet(0, config.max_packet_size).unwrap();
    assert!(!bytes.is_empty());
    assert!(receiver.process_packet(0, &bytes));
    assert!(receiver.receive_message(0).is_none());
}

#[test]
fn filling_the_send_queue_latches_and_drops() {
    let mut config = two_channel_config();
    config.channels[0].message_send_queue_size = 256;
    config.channels[0].message_receive_queue_size = 256;
    let mut sender = connection(&config);

    for counter in 0..256 {
        assert!(sender.can_send_message(0));
        sender.send_message(0, test_message(counter));
    }
    assert_eq!(sender.channel_error_level(0), ChannelErrorLevel::None);

    // The 257th send latches the error; further sends are dropped.
    sender.send_message(0, test_message(256));
    assert_eq!(sender.channel_error_level(0), ChannelErrorLevel::SendQueueFull);
    sender.send_message(0, test_message(257));
    assert_eq!(sender.channel_counters(0).messages_sent, 256);

    sender.advance_time(0.1);
    assert_eq!(sender.error_level(), ConnectionErrorLevel::Channel);

    sender.reset();
    assert_eq!(sender.error_level(), ConnectionErrorLevel::None);
    assert!(sender.can_send_message(0));
}

#[test]
fn corrupt_packet_latches_read_packet_failed() {
    let config = two_channel_config();
    let mut receiver = connection(&config);

    // A packet claiming channel entries it does not contain.
    let garbage = [0xFFu8, 0xFF, 0xFF];
    assert!(!receiver.process_packet(0, &garbage));
    assert_eq!(receiver.error_level(), ConnectionErrorLevel::ReadPacketFailed);

    // Latched: even a valid packet is now refused until reset.
    let mut sender = connection(&config);
    let bytes = sender.generate_packet(1, config.max_packet_size).unwrap();
    assert!(!receiver.process_packet(1, &bytes));

    receiver.reset();
    let bytes = sender.generate_packet(2, config.max_packet_size).unwrap();
    assert!(receiver.process_packet(2, &bytes));
}

#[test]
fn block_message_transfers_across_many_packets() {
    let mut config = two_channel_config();
    config.channels[0].block_fragment_size = 256;
    config.channels[0].max_block_size = 64 * 1024;
    let mut sender = connection(&config);
    let mut receiver = connection(&config);

    let block: Vec<u8> = (0..10_000u32).map(|i| (i & 0xFF) as u8).collect();
    let message = TestMessageFactory.create_message(1).unwrap();
    message.borrow_mut().attach_block(block.clone());
    sender.send_message(0, message);

    let mut sequence = 0u16;
    let mut time = 0.0;
    let mut delivered = None;
    while delivered.is_none() {
        pump(&mut sender, &mut receiver, sequence, config.max_packet_size);
        sequence = sequence.wrapping_add(1);
        time += 0.05;
        sender.advance_time(time);
        receiver.advance_time(time);
        delivered = receiver.receive_message(0);
        assert!(sequence < 200, "block transfer failed to complete");
    }

    let delivered = delivered.unwrap();
    let delivered = delivered.borrow();
    assert!(delivered.is_block());
    assert_eq!(delivered.block_size(), block.len());
    assert_eq!(delivered.block().unwrap(), block.as_slice());

    // Exactly one message delivered, nothing else.
    drop(delivered);
    assert!(receiver.receive_message(0).is_none());
}

#[test]
fn generated_packets_respect_small_byte_budgets() {
    let mut config = two_channel_config();
    config.max_packet_size = 128;
    let mut sender = connection(&config);
    let mut receiver = connection(&config);

    for counter in 0..100 {
        sender.send_message(0, test_message(counter));
    }

    let mut sequence = 0u16;
    let mut received = 0u32;
    let mut time = 0.0;
    while received < 100 {
        let bytes = sender.generate_packet(sequence, config.max_packet_size).unwrap();
        assert!(bytes.len() <= config.max_packet_size);
        assert!(receiver.process_packet(sequence, &bytes));
        sender.process_acks(&[sequence]);
        sequence = sequence.wrapping_add(1);
        while let Some(message) = receiver.receive_message(0) {
            assert_eq!(
                message.borrow().downcast_ref::<TestMessage>().unwrap().counter,
                received
            );
            received += 1;
        }
        time += 0.1;
        sender.advance_time(time);
        receiver.advance_time(time);
        assert!(sequence < 1000, "small-budget delivery failed to make progress");
    }
}
