#![warn(missing_docs)]

//! netlane-stream: bit-level serialization.
//!
//! Every wire format in the workspace is expressed once as a write-side
//! serialization body over [`WireWrite`], which is implemented both by the
//! real [`BitWriter`] and by the [`BitCounter`] measure stream, plus a
//! mirrored read body over [`BitReader`]. Measuring a value therefore
//! always yields exactly the bit count that writing it produces and
//! reading it consumes.

/// Bit readers, writers and the measure counter.
pub mod bit_buffer;
/// Sequence-number comparison and the relative-sequence delta code.
pub mod sequence;

pub use bit_buffer::{
    bits_required, read_int_range, write_int_range, BitCounter, BitReader, BitWriter, StreamError,
    WireWrite,
};
pub use sequence::{
    read_sequence_relative, sequence_greater_than, sequence_less_than, sequence_relative_bits,
    write_sequence_relative,
};
