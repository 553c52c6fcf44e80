use crate::bit_buffer::{BitReader, StreamError, WireWrite};

/// Compares 16-bit sequence numbers with wrapping arithmetic.
pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= 32768)) || ((s1 < s2) && (s2 - s1 > 32768))
}

/// Compares 16-bit sequence numbers with wrapping arithmetic.
pub fn sequence_less_than(s1: u16, s2: u16) -> bool {
    sequence_greater_than(s2, s1)
}

/// Writes `current` as a variable-length delta from `previous`.
///
/// The delta `(current - previous) mod 2^16` is encoded through a chain of
/// range flags: 3 payload bits when below 8, then 6 below 64, 10 below
/// 1024, 15 below 32768, and finally 16 raw bits. Nearby ids — the common
/// case inside one packet — cost 4 bits instead of 16.
pub fn write_sequence_relative<W: WireWrite + ?Sized>(
    writer: &mut W,
    previous: u16,
    current: u16,
) -> Result<(), StreamError> {
    let delta = u32::from(current.wrapping_sub(previous));
    writer.write_bool(delta < 8)?;
    if delta < 8 {
        return writer.write_bits(delta, 3);
    }
    writer.write_bool(delta < 64)?;
    if delta < 64 {
        return writer.write_bits(delta, 6);
    }
    writer.write_bool(delta < 1024)?;
    if delta < 1024 {
        return writer.write_bits(delta, 10);
    }
    writer.write_bool(delta < 32768)?;
    if delta < 32768 {
        return writer.write_bits(delta, 15);
    }
    writer.write_bits(delta, 16)
}

/// Reads a sequence number written by [`write_sequence_relative`].
pub fn read_sequence_relative(
    reader: &mut BitReader<'_>,
    previous: u16,
) -> Result<u16, StreamError> {
    let delta = if reader.read_bool()? {
        reader.read_bits(3)?
    } else if reader.read_bool()? {
        reader.read_bits(6)?
    } else if reader.read_bool()? {
        reader.read_bits(10)?
    } else if reader.read_bool()? {
        reader.read_bits(15)?
    } else {
        reader.read_bits(16)?
    };
    Ok(previous.wrapping_add(delta as u16))
}

/// Exact encoded size of [`write_sequence_relative`] for this pair.
pub fn sequence_relative_bits(previous: u16, current: u16) -> usize {
    let delta = u32::from(current.wrapping_sub(previous));
    match delta {
        0..=7 => 1 + 3,
        8..=63 => 2 + 6,
        64..=1023 => 3 + 10,
        1024..=32767 => 4 + 15,
        _ => 4 + 16,
    }
}
