use std::{any::Any, cell::RefCell, rc::Rc};

use netlane_stream::{BitCounter, BitReader, StreamError, WireWrite};

/// An application-defined message body.
///
/// The write body runs against [`WireWrite`], so the same code path
/// produces wire bits and exact measured sizes; `read` mirrors it. Block
/// message types override [`Message::is_block`] and leave their payload
/// bytes to the wrapper — the payload travels as fragments (reliable
/// channels) or an inline appendage (unreliable channels), never through
/// the body serialization itself.
pub trait Message: Any {
    /// Serializes the message body. Also used to measure it.
    fn write(&self, writer: &mut dyn WireWrite) -> Result<(), StreamError>;

    /// Deserializes the message body into `self`.
    fn read(&mut self, reader: &mut BitReader<'_>) -> Result<(), StreamError>;

    /// Whether this message carries a block payload.
    fn is_block(&self) -> bool {
        false
    }
}

/// Library-side wrapper around a message body: the wire identity (id and
/// type index) plus the block payload for block messages.
pub struct NetMessage {
    /// Message id; assigned by the channel on send. On unreliable
    /// channels the receiver overwrites it with the packet sequence.
    id: u16,
    /// Factory type index.
    kind: u8,
    /// Application body.
    body: Box<dyn Message>,
    /// Block payload, attached on send or after reassembly on receive.
    block: Option<Vec<u8>>,
}

impl NetMessage {
    /// Wraps a freshly created body of the given factory type.
    pub fn new(kind: u8, body: Box<dyn Message>) -> Self {
        Self { id: 0, kind, body, block: None }
    }

    /// Returns the message id.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Sets the message id.
    pub fn set_id(&mut self, id: u16) {
        self.id = id;
    }

    /// Returns the factory type index.
    pub fn kind(&self) -> u8 {
        self.kind
    }

    /// Whether this message carries a block payload.
    pub fn is_block(&self) -> bool {
        self.body.is_block()
    }

    /// Borrows the message body.
    pub fn body(&self) -> &dyn Message {
        self.body.as_ref()
    }

    /// Mutably borrows the message body.
    pub fn body_mut(&mut self) -> &mut dyn Message {
        self.body.as_mut()
    }

    /// Downcasts the body to a concrete message type.
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        (self.body.as_ref() as &dyn Any).downcast_ref::<T>()
    }

    /// Mutably downcasts the body to a concrete message type.
    pub fn downcast_mut<T: Message>(&mut self) -> Option<&mut T> {
        (self.body.as_mut() as &mut dyn Any).downcast_mut::<T>()
    }

    /// Attaches a block payload to a block message.
    pub fn attach_block(&mut self, data: Vec<u8>) {
        debug_assert!(self.is_block());
        self.block = Some(data);
    }

    /// Borrows the block payload, if attached.
    pub fn block(&self) -> Option<&[u8]> {
        self.block.as_deref()
    }

    /// Detaches and returns the block payload.
    pub fn take_block(&mut self) -> Option<Vec<u8>> {
        self.block.take()
    }

    /// Size of the attached block payload, 0 when none.
    pub fn block_size(&self) -> usize {
        self.block.as_ref().map_or(0, Vec::len)
    }

    /// Measures the body serialization in bits.
    pub fn measure_body_bits(&self) -> Result<usize, StreamError> {
        let mut counter = BitCounter::new();
        self.body.write(&mut counter)?;
        Ok(counter.bits_written())
    }
}

/// Shared-ownership handle to a message.
///
/// Cloning the handle takes a reference (a queue, a sent-packet payload,
/// or the application holding it); dropping the last clone destroys the
/// message. The factory is the only creator.
pub type MessageRef = Rc<RefCell<NetMessage>>;

/// Creates, on both send and receive paths, the message bodies an
/// application has registered.
pub trait MessageFactory {
    /// Number of registered message types. Type indices encode on the
    /// wire in `bits_required(0, num_types - 1)` bits.
    fn num_types(&self) -> usize;

    /// Creates a blank message of the given type, or `None` for an
    /// unknown type index.
    fn create(&self, kind: u8) -> Option<NetMessage>;

    /// Creates a blank message wrapped in a shared handle.
    fn create_message(&self, kind: u8) -> Option<MessageRef> {
        self.create(kind).map(|message| Rc::new(RefCell::new(message)))
    }

    /// Latched factory failure flag, sampled by the connection each tick.
    fn error(&self) -> bool {
        false
    }
}
