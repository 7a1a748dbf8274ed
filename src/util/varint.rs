//! Variable-length integer encoding utilities.
//!
//! Values are written 7 bits per byte, least significant group first, with
//! the high bit of every byte except the last set as a continuation flag.
//! Besides the allocating `encode_*` helpers there are appending
//! (`encode_*_into`) and cursor-based (`decode_*_at`) variants used on the
//! hot posting paths, where a decoder walks a byte slice and advances a
//! position in place.

use std::io::{Read, Write};

use byteorder::ReadBytesExt;

use crate::error::{IrIndexError, Result};

/// Maximum encoded length of a u32.
pub const MAX_VINT_LEN: usize = 5;

/// Maximum encoded length of a u64.
pub const MAX_VLONG_LEN: usize = 10;

/// Encode a u32 value using variable-length encoding.
pub fn encode_u32(value: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(MAX_VINT_LEN);
    encode_u32_into(value, &mut bytes);
    bytes
}

/// Append the variable-length encoding of a u32 to `out`, returning the
/// number of bytes written.
pub fn encode_u32_into(value: u32, out: &mut Vec<u8>) -> usize {
    encode_u64_into(value as u64, out)
}

/// Encode a u64 value using variable-length encoding.
pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(MAX_VLONG_LEN);
    encode_u64_into(value, &mut bytes);
    bytes
}

/// Append the variable-length encoding of a u64 to `out`, returning the
/// number of bytes written.
pub fn encode_u64_into(value: u64, out: &mut Vec<u8>) -> usize {
    let mut val = value;
    let mut written = 0;

    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;

        if val != 0 {
            byte |= 0x80;
        }

        out.push(byte);
        written += 1;

        if val == 0 {
            break;
        }
    }

    written
}

/// Number of bytes `value` occupies once encoded.
pub fn encoded_len_u64(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Number of bytes `value` occupies once encoded.
pub fn encoded_len_u32(value: u32) -> usize {
    encoded_len_u64(value as u64)
}

/// Decode a u32 value from variable-length encoding.
pub fn decode_u32(bytes: &[u8]) -> Result<(u32, usize)> {
    let mut pos = 0;
    let value = decode_u32_at(bytes, &mut pos)?;
    Ok((value, pos))
}

/// Decode a u64 value from variable-length encoding.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut pos = 0;
    let value = decode_u64_at(bytes, &mut pos)?;
    Ok((value, pos))
}

/// Decode a u32 starting at `*pos`, advancing the cursor past it.
pub fn decode_u32_at(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let mut result = 0u32;
    let mut shift = 0;

    while let Some(&byte) = bytes.get(*pos) {
        *pos += 1;

        if shift >= 32 || (shift == 28 && byte & 0x70 != 0) {
            return Err(IrIndexError::corrupt("VarInt overflow"));
        }

        result |= ((byte & 0x7F) as u32) << shift;

        if (byte & 0x80) == 0 {
            return Ok(result);
        }

        shift += 7;
    }

    Err(IrIndexError::corrupt("Incomplete VarInt"))
}

/// Decode a u64 starting at `*pos`, advancing the cursor past it.
pub fn decode_u64_at(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0;

    while let Some(&byte) = bytes.get(*pos) {
        *pos += 1;

        if shift >= 64 || (shift == 63 && byte & 0x7E != 0) {
            return Err(IrIndexError::corrupt("VarInt overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok(result);
        }

        shift += 7;
    }

    Err(IrIndexError::corrupt("Incomplete VarInt"))
}

/// Write a variable-length encoded u32 to a writer.
pub fn write_u32<W: Write>(writer: &mut W, value: u32) -> Result<usize> {
    let bytes = encode_u32(value);
    writer.write_all(&bytes)?;
    Ok(bytes.len())
}

/// Read a variable-length encoded u32 from a reader.
pub fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let value = read_u64(reader)?;
    u32::try_from(value).map_err(|_| IrIndexError::corrupt("VarInt overflow"))
}

/// Write a variable-length encoded u64 to a writer.
pub fn write_u64<W: Write>(writer: &mut W, value: u64) -> Result<usize> {
    let bytes = encode_u64(value);
    writer.write_all(&bytes)?;
    Ok(bytes.len())
}

/// Read a variable-length encoded u64 from a reader.
pub fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0;

    loop {
        let byte = reader.read_u8()?;

        if shift >= 64 {
            return Err(IrIndexError::corrupt("VarInt overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok(result);
        }

        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encode_decode_u32() {
        let test_values = [0, 1, 127, 128, 255, 256, 16383, 16384, u32::MAX];

        for &value in &test_values {
            let encoded = encode_u32(value);
            let (decoded, bytes_read) = decode_u32(&encoded).unwrap();

            assert_eq!(value, decoded);
            assert_eq!(encoded.len(), bytes_read);
            assert_eq!(encoded.len(), encoded_len_u32(value));
        }
    }

    #[test]
    fn test_encode_decode_u64() {
        let test_values = [0, 1, 127, 128, 255, 256, 16383, 16384, u64::MAX];

        for &value in &test_values {
            let encoded = encode_u64(value);
            let (decoded, bytes_read) = decode_u64(&encoded).unwrap();

            assert_eq!(value, decoded);
            assert_eq!(encoded.len(), bytes_read);
            assert_eq!(encoded.len(), encoded_len_u64(value));
        }
    }

    #[test]
    fn test_cursor_decoding_walks_a_stream() {
        let mut buffer = Vec::new();
        for value in [3u32, 300, 70000, 0] {
            encode_u32_into(value, &mut buffer);
        }

        let mut pos = 0;
        assert_eq!(decode_u32_at(&buffer, &mut pos).unwrap(), 3);
        assert_eq!(decode_u32_at(&buffer, &mut pos).unwrap(), 300);
        assert_eq!(decode_u32_at(&buffer, &mut pos).unwrap(), 70000);
        assert_eq!(decode_u32_at(&buffer, &mut pos).unwrap(), 0);
        assert_eq!(pos, buffer.len());
        assert!(decode_u32_at(&buffer, &mut pos).is_err());
    }

    #[test]
    fn test_write_read_u32() {
        let mut buffer = Vec::new();
        let value = 12345u32;

        let bytes_written = write_u32(&mut buffer, value).unwrap();
        assert_eq!(bytes_written, buffer.len());

        let mut cursor = Cursor::new(buffer);
        let decoded = read_u32(&mut cursor).unwrap();

        assert_eq!(value, decoded);
    }

    #[test]
    fn test_write_read_u64() {
        let mut buffer = Vec::new();
        let value = 123456789012345u64;

        let bytes_written = write_u64(&mut buffer, value).unwrap();
        assert_eq!(bytes_written, buffer.len());

        let mut cursor = Cursor::new(buffer);
        let decoded = read_u64(&mut cursor).unwrap();

        assert_eq!(value, decoded);
    }

    #[test]
    fn test_encoding_efficiency() {
        assert_eq!(encode_u32(0).len(), 1);
        assert_eq!(encode_u32(127).len(), 1);
        assert_eq!(encode_u32(128).len(), 2);
        assert_eq!(encode_u32(16383).len(), 2);
        assert_eq!(encode_u32(16384).len(), 3);

        assert_eq!(encode_u32(u32::MAX).len(), MAX_VINT_LEN);
        assert_eq!(encode_u64(u64::MAX).len(), MAX_VLONG_LEN);
    }

    #[test]
    fn test_incomplete_varint() {
        let incomplete = vec![0x80];
        assert!(decode_u32(&incomplete).unwrap_err().is_corrupt());
        assert!(decode_u64(&incomplete).unwrap_err().is_corrupt());
    }

    #[test]
    fn test_overflow() {
        let overflow_data = vec![0xFF; 10];
        assert!(decode_u32(&overflow_data).is_err());

        let wide = encode_u64(u32::MAX as u64 + 1);
        assert!(decode_u32(&wide).is_err());
    }
}
