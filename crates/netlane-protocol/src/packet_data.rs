use netlane_core::config::{ChannelConfig, ChannelKind, ConnectionConfig};
use netlane_stream::{
    bits_required, read_int_range, read_sequence_relative, write_int_range,
    write_sequence_relative, BitReader, StreamError, WireWrite,
};

use crate::message::{MessageFactory, MessageRef};

/// Bits used to encode a message type index for this factory.
pub fn message_type_bits(factory: &dyn MessageFactory) -> u32 {
    bits_required(0, factory.num_types().saturating_sub(1) as u32)
}

/// Per-channel payload of a connection packet: either a list of messages
/// or a single block fragment.
pub struct ChannelPacketData {
    /// Index of the channel this payload belongs to.
    pub channel_index: usize,
    /// The payload itself.
    pub content: ChannelPacketContent,
}

/// The two payload shapes a channel can contribute to a packet.
pub enum ChannelPacketContent {
    /// A batch of whole messages.
    Messages {
        /// Message handles, each holding one reference.
        messages: Vec<MessageRef>,
        /// Set on the read side when a sub-message failed to deserialize.
        /// The packet is still accepted as a structural unit; the owning
        /// channel latches an error on dispatch.
        failed_to_read: bool,
    },
    /// One fragment of a block message in flight.
    Block {
        /// Id of the block message being transferred.
        message_id: u16,
        /// Total fragments in the transfer.
        num_fragments: usize,
        /// Index of this fragment.
        fragment_id: usize,
        /// Fragment payload bytes.
        fragment_data: Vec<u8>,
        /// Message type index, meaningful on fragment 0.
        message_type: u8,
        /// The block message itself; rides along with fragment 0 only.
        message: Option<MessageRef>,
    },
}

impl ChannelPacketData {
    /// Builds a message-list payload.
    pub fn messages(channel_index: usize, messages: Vec<MessageRef>) -> Self {
        Self {
            channel_index,
            content: ChannelPacketContent::Messages { messages, failed_to_read: false },
        }
    }

    /// Builds a block-fragment payload.
    pub fn block_fragment(
        channel_index: usize,
        message_id: u16,
        num_fragments: usize,
        fragment_id: usize,
        fragment_data: Vec<u8>,
        message_type: u8,
        message: Option<MessageRef>,
    ) -> Self {
        Self {
            channel_index,
            content: ChannelPacketContent::Block {
                message_id,
                num_fragments,
                fragment_id,
                fragment_data,
                message_type,
                message,
            },
        }
    }

    /// Serializes (or measures) this payload.
    pub fn write(
        &self,
        writer: &mut dyn WireWrite,
        factory: &dyn MessageFactory,
        configs: &[ChannelConfig],
    ) -> Result<(), StreamError> {
        if configs.len() > 1 {
            write_int_range(writer, self.channel_index as u32, 0, (configs.len() - 1) as u32)?;
        }
        let config = &configs[self.channel_index];
        match &self.content {
            ChannelPacketContent::Messages { messages, .. } => {
                writer.write_bool(false)?;
                match config.kind {
                    ChannelKind::ReliableOrdered => {
                        write_ordered_messages(writer, factory, messages, config)
                    }
                    ChannelKind::UnreliableUnordered => {
                        write_unordered_messages(writer, factory, messages, config)
                    }
                }
            }
            ChannelPacketContent::Block {
                message_id,
                num_fragments,
                fragment_id,
                fragment_data,
                message,
                ..
            } => {
                writer.write_bool(true)?;
                if config.disable_blocks {
                    return Err(StreamError::ValueOutOfRange);
                }
                write_block_fragment(
                    writer,
                    factory,
                    *message_id,
                    *num_fragments,
                    *fragment_id,
                    fragment_data,
                    message.as_ref(),
                    config,
                )
            }
        }
    }

    /// Deserializes one payload.
    ///
    /// A sub-message failure inside a message list does not abort the
    /// packet: the payload comes back with `failed_to_read` set so
    /// subsequent channel entries can still be parsed. Block-fragment
    /// failures are structural and abort the packet.
    pub fn read(
        reader: &mut BitReader<'_>,
        factory: &dyn MessageFactory,
        configs: &[ChannelConfig],
    ) -> Result<Self, StreamError> {
        let channel_index = if configs.len() > 1 {
            read_int_range(reader, 0, (configs.len() - 1) as u32)? as usize
        } else {
            0
        };
        let config = &configs[channel_index];
        let block = reader.read_bool()?;
        let content = if block {
            if config.disable_blocks {
                return Err(StreamError::ValueOutOfRange);
            }
            read_block_fragment(reader, factory, config)?
        } else {
            match config.kind {
                ChannelKind::ReliableOrdered => read_ordered_messages(reader, factory, config)?,
                ChannelKind::UnreliableUnordered => {
                    read_unordered_messages(reader, factory, config)?
                }
            }
        };
        Ok(Self { channel_index, content })
    }
}

fn write_ordered_messages(
    writer: &mut dyn WireWrite,
    factory: &dyn MessageFactory,
    messages: &[MessageRef],
    config: &ChannelConfig,
) -> Result<(), StreamError> {
    let has_messages = !messages.is_empty();
    writer.write_bool(has_messages)?;
    if !has_messages {
        return Ok(());
    }

    write_int_range(writer, messages.len() as u32, 1, config.max_messages_per_packet as u32)?;

    let ids: Vec<u16> = messages.iter().map(|message| message.borrow().id()).collect();
    writer.write_bits(u32::from(ids[0]), 16)?;
    for pair in ids.windows(2) {
        write_sequence_relative(writer, pair[0], pair[1])?;
    }

    let type_bits = message_type_bits(factory);
    for message in messages {
        let message = message.borrow();
        if type_bits > 0 {
            write_int_range(writer, u32::from(message.kind()), 0, factory.num_types() as u32 - 1)?;
        }
        message.body().write(writer)?;
    }
    Ok(())
}

fn read_ordered_messages(
    reader: &mut BitReader<'_>,
    factory: &dyn MessageFactory,
    config: &ChannelConfig,
) -> Result<ChannelPacketContent, StreamError> {
    if !reader.read_bool()? {
        return Ok(ChannelPacketContent::Messages { messages: Vec::new(), failed_to_read: false });
    }

    let num_messages = read_int_range(reader, 1, config.max_messages_per_packet as u32)? as usize;

    let mut ids = Vec::with_capacity(num_messages);
    ids.push(reader.read_bits(16)? as u16);
    for i in 1..num_messages {
        let id = read_sequence_relative(reader, ids[i - 1])?;
        ids.push(id);
    }

    let type_bits = message_type_bits(factory);
    let mut messages: Vec<MessageRef> = Vec::with_capacity(num_messages);
    for &id in &ids {
        let kind = if type_bits > 0 {
            read_int_range(reader, 0, factory.num_types() as u32 - 1)? as u8
        } else {
            0
        };
        let Some(message) = factory.create_message(kind) else {
            tracing::error!(kind, "failed to create message while reading ordered messages");
            return Ok(ChannelPacketContent::Messages { messages, failed_to_read: true });
        };
        {
            let mut message = message.borrow_mut();
            message.set_id(id);
            if message.body_mut().read(reader).is_err() {
                tracing::error!(kind, id, "failed to deserialize ordered message body");
                return Ok(ChannelPacketContent::Messages { messages, failed_to_read: true });
            }
        }
        messages.push(message);
    }
    Ok(ChannelPacketContent::Messages { messages, failed_to_read: false })
}

fn write_unordered_messages(
    writer: &mut dyn WireWrite,
    factory: &dyn MessageFactory,
    messages: &[MessageRef],
    config: &ChannelConfig,
) -> Result<(), StreamError> {
    let has_messages = !messages.is_empty();
    writer.write_bool(has_messages)?;
    if !has_messages {
        return Ok(());
    }

    write_int_range(writer, messages.len() as u32, 1, config.max_messages_per_packet as u32)?;

    let type_bits = message_type_bits(factory);
    for message in messages {
        let message = message.borrow();
        if type_bits > 0 {
            write_int_range(writer, u32::from(message.kind()), 0, factory.num_types() as u32 - 1)?;
        }
        message.body().write(writer)?;
        if message.is_block() {
            let block = message.block().ok_or(StreamError::ValueOutOfRange)?;
            write_inline_block(writer, block, config.max_block_size)?;
        }
    }
    Ok(())
}

fn read_unordered_messages(
    reader: &mut BitReader<'_>,
    factory: &dyn MessageFactory,
    config: &ChannelConfig,
) -> Result<ChannelPacketContent, StreamError> {
    if !reader.read_bool()? {
        return Ok(ChannelPacketContent::Messages { messages: Vec::new(), failed_to_read: false });
    }

    let num_messages = read_int_range(reader, 1, config.max_messages_per_packet as u32)? as usize;
    let type_bits = message_type_bits(factory);
    let mut messages: Vec<MessageRef> = Vec::with_capacity(num_messages);
    for _ in 0..num_messages {
        let kind = if type_bits > 0 {
            read_int_range(reader, 0, factory.num_types() as u32 - 1)? as u8
        } else {
            0
        };
        let Some(message) = factory.create_message(kind) else {
            tracing::error!(kind, "failed to create message while reading unordered messages");
            return Ok(ChannelPacketContent::Messages { messages, failed_to_read: true });
        };
        {
            let mut message = message.borrow_mut();
            if message.body_mut().read(reader).is_err() {
                tracing::error!(kind, "failed to deserialize unordered message body");
                return Ok(ChannelPacketContent::Messages { messages, failed_to_read: true });
            }
            if message.is_block() {
                match read_inline_block(reader, config.max_block_size) {
                    Ok(block) => message.attach_block(block),
                    Err(_) => {
                        return Ok(ChannelPacketContent::Messages {
                            messages,
                            failed_to_read: true,
                        });
                    }
                }
            }
        }
        messages.push(message);
    }
    Ok(ChannelPacketContent::Messages { messages, failed_to_read: false })
}

/// Writes (or measures) the inline block appendage an unreliable channel
/// attaches after a block message body.
pub fn write_inline_block<W: WireWrite + ?Sized>(
    writer: &mut W,
    block: &[u8],
    max_block_size: usize,
) -> Result<(), StreamError> {
    write_int_range(writer, block.len() as u32, 1, max_block_size as u32)?;
    writer.write_bytes(block)
}

fn read_inline_block(
    reader: &mut BitReader<'_>,
    max_block_size: usize,
) -> Result<Vec<u8>, StreamError> {
    let block_size = read_int_range(reader, 1, max_block_size as u32)? as usize;
    let mut block = vec![0u8; block_size];
    reader.read_bytes(&mut block)?;
    Ok(block)
}

#[allow(clippy::too_many_arguments)]
fn write_block_fragment(
    writer: &mut dyn WireWrite,
    factory: &dyn MessageFactory,
    message_id: u16,
    num_fragments: usize,
    fragment_id: usize,
    fragment_data: &[u8],
    message: Option<&MessageRef>,
    config: &ChannelConfig,
) -> Result<(), StreamError> {
    writer.write_bits(u32::from(message_id), 16)?;

    let max_fragments = config.max_fragments_per_block();
    if max_fragments > 1 {
        write_int_range(writer, num_fragments as u32, 1, max_fragments as u32)?;
    }
    if num_fragments > 1 {
        write_int_range(writer, fragment_id as u32, 0, num_fragments as u32 - 1)?;
    }
    write_int_range(writer, fragment_data.len() as u32, 1, config.block_fragment_size as u32)?;
    writer.write_bytes(fragment_data)?;

    if fragment_id == 0 {
        // The block message itself rides with fragment 0 so the receiver
        // learns the type and body exactly once.
        let message = message.ok_or(StreamError::ValueOutOfRange)?.borrow();
        if message_type_bits(factory) > 0 {
            write_int_range(writer, u32::from(message.kind()), 0, factory.num_types() as u32 - 1)?;
        }
        message.body().write(writer)?;
    }
    Ok(())
}

fn read_block_fragment(
    reader: &mut BitReader<'_>,
    factory: &dyn MessageFactory,
    config: &ChannelConfig,
) -> Result<ChannelPacketContent, StreamError> {
    let message_id = reader.read_bits(16)? as u16;

    let max_fragments = config.max_fragments_per_block();
    let num_fragments = if max_fragments > 1 {
        read_int_range(reader, 1, max_fragments as u32)? as usize
    } else {
        1
    };
    let fragment_id = if num_fragments > 1 {
        read_int_range(reader, 0, num_fragments as u32 - 1)? as usize
    } else {
        0
    };
    let fragment_size = read_int_range(reader, 1, config.block_fragment_size as u32)? as usize;
    let mut fragment_data = vec![0u8; fragment_size];
    reader.read_bytes(&mut fragment_data)?;

    let (message_type, message) = if fragment_id == 0 {
        let kind = if message_type_bits(factory) > 0 {
            read_int_range(reader, 0, factory.num_types() as u32 - 1)? as u8
        } else {
            0
        };
        let message = factory.create_message(kind).ok_or(StreamError::ValueOutOfRange)?;
        {
            let mut message = message.borrow_mut();
            if !message.is_block() {
                tracing::error!(kind, "received block fragment attached to a non-block message");
                return Err(StreamError::ValueOutOfRange);
            }
            message.body_mut().read(reader)?;
        }
        (kind, Some(message))
    } else {
        (0, None)
    };

    Ok(ChannelPacketContent::Block {
        message_id,
        num_fragments,
        fragment_id,
        fragment_data,
        message_type,
        message,
    })
}

/// The body of one connection packet: the channel entries that had data
/// this tick. A packet with zero entries is still valid.
pub struct ConnectionPacket {
    /// Channel payloads in channel-index order.
    pub entries: Vec<ChannelPacketData>,
}

impl ConnectionPacket {
    /// Serializes (or measures) the packet body.
    pub fn write(
        &self,
        writer: &mut dyn WireWrite,
        factory: &dyn MessageFactory,
        config: &ConnectionConfig,
    ) -> Result<(), StreamError> {
        write_int_range(writer, self.entries.len() as u32, 0, config.num_channels() as u32)?;
        for entry in &self.entries {
            entry.write(writer, factory, &config.channels)?;
        }
        Ok(())
    }

    /// Deserializes a packet body.
    pub fn read(
        reader: &mut BitReader<'_>,
        factory: &dyn MessageFactory,
        config: &ConnectionConfig,
    ) -> Result<Self, StreamError> {
        let num_entries = read_int_range(reader, 0, config.num_channels() as u32)? as usize;
        let mut entries = Vec::with_capacity(num_entries);
        for _ in 0..num_entries {
            entries.push(ChannelPacketData::read(reader, factory, &config.channels)?);
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, NetMessage};
    use netlane_core::config::{ChannelConfig, ChannelKind};
    use netlane_stream::BitWriter;

    #[derive(Default)]
    struct Counter {
        value: u32,
    }

    impl Message for Counter {
        fn write(&self, writer: &mut dyn WireWrite) -> Result<(), StreamError> {
            writer.write_bits(self.value, 32)
        }

        fn read(&mut self, reader: &mut BitReader<'_>) -> Result<(), StreamError> {
            self.value = reader.read_bits(32)?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Blob;

    impl Message for Blob {
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

    struct TestFactory;

    impl MessageFactory for TestFactory {
        fn num_types(&self) -> usize {
            2
        }

        fn create(&self, kind: u8) -> Option<NetMessage> {
            match kind {
                0 => Some(NetMessage::new(0, Box::new(Counter::default()))),
                1 => Some(NetMessage::new(1, Box::new(Blob))),
                _ => None,
            }
        }
    }

    /// Factory whose only message type refuses to deserialize.
    struct BrokenFactory;

    struct Unreadable;

    impl Message for Unreadable {
        fn write(&self, _writer: &mut dyn WireWrite) -> Result<(), StreamError> {
            Ok(())
        }

        fn read(&mut self, _reader: &mut BitReader<'_>) -> Result<(), StreamError> {
            Err(StreamError::ValueOutOfRange)
        }
    }

    impl MessageFactory for BrokenFactory {
        fn num_types(&self) -> usize {
            2
        }

        fn create(&self, kind: u8) -> Option<NetMessage> {
            (kind < 2).then(|| NetMessage::new(kind, Box::new(Unreadable)))
        }
    }

    fn counter_message(factory: &dyn MessageFactory, id: u16, value: u32) -> MessageRef {
        let message = factory.create_message(0).unwrap();
        {
            let mut m = message.borrow_mut();
            m.set_id(id);
            m.downcast_mut::<Counter>().unwrap().value = value;
        }
        message
    }

    fn reliable_configs() -> Vec<ChannelConfig> {
        vec![ChannelConfig::default(), ChannelConfig::new(ChannelKind::UnreliableUnordered)]
    }

    #[test]
    fn ordered_message_list_round_trips() {
        let factory = TestFactory;
        let configs = reliable_configs();

        let ids = [65530u16, 65531, 2, 3]; // wraps through zero
        let messages: Vec<MessageRef> =
            ids.iter().map(|&id| counter_message(&factory, id, u32::from(id) * 3)).collect();
        let data = ChannelPacketData::messages(0, messages);

        let mut writer = BitWriter::with_capacity(256);
        data.write(&mut writer, &factory, &configs).unwrap();
        let bytes = writer.finish();

        let mut reader = BitReader::new(&bytes);
        let decoded = ChannelPacketData::read(&mut reader, &factory, &configs).unwrap();
        assert_eq!(decoded.channel_index, 0);
        let ChannelPacketContent::Messages { messages, failed_to_read } = decoded.content else {
            panic!("expected message list");
        };
        assert!(!failed_to_read);
        assert_eq!(messages.len(), ids.len());
        for (message, &id) in messages.iter().zip(&ids) {
            let message = message.borrow();
            assert_eq!(message.id(), id);
            assert_eq!(message.downcast_ref::<Counter>().unwrap().value, u32::from(id) * 3);
        }
    }

    #[test]
    fn unordered_list_carries_inline_blocks() {
        let factory = TestFactory;
        let configs = reliable_configs();

        let block = factory.create_message(1).unwrap();
        block.borrow_mut().attach_block((0u8..100).collect());
        let plain = counter_message(&factory, 0, 42);
        let data = ChannelPacketData::messages(1, vec![plain, block]);

        let mut writer = BitWriter::with_capacity(256);
        data.write(&mut writer, &factory, &configs).unwrap();
        let bytes = writer.finish();

        let mut reader = BitReader::new(&bytes);
        let decoded = ChannelPacketData::read(&mut reader, &factory, &configs).unwrap();
        assert_eq!(decoded.channel_index, 1);
        let ChannelPacketContent::Messages { messages, failed_to_read } = decoded.content else {
            panic!("expected message list");
        };
        assert!(!failed_to_read);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].borrow().downcast_ref::<Counter>().unwrap().value, 42);
        let received = messages[1].borrow();
        assert_eq!(received.block().unwrap(), (0u8..100).collect::<Vec<u8>>().as_slice());
    }

    #[test]
    fn block_fragment_round_trips_with_message_on_fragment_zero() {
        let factory = TestFactory;
        let configs = reliable_configs();

        let message = factory.create_message(1).unwrap();
        message.borrow_mut().set_id(9);
        let fragment: Vec<u8> = (0u8..=255).collect();
        let data =
            ChannelPacketData::block_fragment(0, 9, 5, 0, fragment.clone(), 1, Some(message));

        let mut writer = BitWriter::with_capacity(512);
        data.write(&mut writer, &factory, &configs).unwrap();
        let bytes = writer.finish();

        let mut reader = BitReader::new(&bytes);
        let decoded = ChannelPacketData::read(&mut reader, &factory, &configs).unwrap();
        let ChannelPacketContent::Block {
            message_id,
            num_fragments,
            fragment_id,
            fragment_data,
            message,
            ..
        } = decoded.content
        else {
            panic!("expected block fragment");
        };
        assert_eq!(message_id, 9);
        assert_eq!(num_fragments, 5);
        assert_eq!(fragment_id, 0);
        assert_eq!(fragment_data, fragment);
        assert!(message.is_some());
    }

    #[test]
    fn non_zero_fragment_omits_the_message() {
        let factory = TestFactory;
        let configs = reliable_configs();

        let data = ChannelPacketData::block_fragment(0, 9, 5, 3, vec![7; 64], 0, None);
        let mut writer = BitWriter::with_capacity(256);
        data.write(&mut writer, &factory, &configs).unwrap();
        let bytes = writer.finish();

        let mut reader = BitReader::new(&bytes);
        let decoded = ChannelPacketData::read(&mut reader, &factory, &configs).unwrap();
        let ChannelPacketContent::Block { fragment_id, message, .. } = decoded.content else {
            panic!("expected block fragment");
        };
        assert_eq!(fragment_id, 3);
        assert!(message.is_none());
    }

    #[test]
    fn sub_message_failure_flags_instead_of_aborting() {
        let configs = reliable_configs();

        let factory = TestFactory;
        let messages = vec![counter_message(&factory, 0, 1), counter_message(&factory, 1, 2)];
        let data = ChannelPacketData::messages(0, messages);
        let mut writer = BitWriter::with_capacity(256);
        data.write(&mut writer, &factory, &configs).unwrap();
        let bytes = writer.finish();

        // Read back with a factory whose bodies refuse to deserialize.
        let mut reader = BitReader::new(&bytes);
        let decoded = ChannelPacketData::read(&mut reader, &BrokenFactory, &configs).unwrap();
        let ChannelPacketContent::Messages { failed_to_read, .. } = decoded.content else {
            panic!("expected message list");
        };
        assert!(failed_to_read);
    }

    #[test]
    fn connection_packet_round_trips_multiple_entries() {
        let factory = TestFactory;
        let config = netlane_core::config::ConnectionConfig {
            channels: reliable_configs(),
            max_packet_size: 4096,
        };

        let reliable = ChannelPacketData::messages(
            0,
            vec![counter_message(&factory, 5, 50), counter_message(&factory, 6, 60)],
        );
        let unreliable = ChannelPacketData::messages(1, vec![counter_message(&factory, 0, 70)]);
        let packet = ConnectionPacket { entries: vec![reliable, unreliable] };

        let mut writer = BitWriter::with_capacity(512);
        packet.write(&mut writer, &factory, &config).unwrap();
        let bytes = writer.finish();

        let mut reader = BitReader::new(&bytes);
        let decoded = ConnectionPacket::read(&mut reader, &factory, &config).unwrap();
        assert_eq!(decoded.entries.len(), 2);
        assert_eq!(decoded.entries[0].channel_index, 0);
        assert_eq!(decoded.entries[1].channel_index, 1);
    }

    #[test]
    fn empty_connection_packet_is_valid() {
        let factory = TestFactory;
        let config = netlane_core::config::ConnectionConfig::default();
        let packet = ConnectionPacket { entries: Vec::new() };

        let mut writer = BitWriter::with_capacity(16);
        packet.write(&mut writer, &factory, &config).unwrap();
        let bytes = writer.finish();
        assert!(!bytes.is_empty());

        let mut reader = BitReader::new(&bytes);
        let decoded = ConnectionPacket::read(&mut reader, &factory, &config).unwrap();
        assert!(decoded.entries.is_empty());
    }
}
