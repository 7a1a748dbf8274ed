//! Structured binary I/O over storage streams.
//!
//! [`IndexOutput`] and [`IndexInput`] wrap the raw storage streams with the
//! primitives the posting codecs are written against: var-ints, fixed-width
//! little-endian integers, raw byte runs, and an explicit file pointer.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{IrIndexError, Result};
use crate::storage::memory::MemoryInput;
use crate::storage::{StorageInput, StorageOutput};
use crate::util::varint;

const COPY_BUFFER_SIZE: usize = 8192;

/// A positioned binary writer.
#[derive(Debug)]
pub struct IndexOutput {
    writer: Box<dyn StorageOutput>,
    hasher: crc32fast::Hasher,
    position: u64,
}

impl IndexOutput {
    /// Wrap a storage output stream.
    pub fn new(writer: Box<dyn StorageOutput>) -> Result<Self> {
        let position = writer.position()?;
        Ok(IndexOutput {
            writer,
            hasher: crc32fast::Hasher::new(),
            position,
        })
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.hasher.update(bytes);
        self.position += bytes.len() as u64;
        Ok(())
    }

    /// Write a single byte.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.put(&[value])
    }

    /// Write a u32 value (little-endian).
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    /// Write a u64 value (little-endian).
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    /// Write a var-int encoded u32.
    pub fn write_vint(&mut self, value: u32) -> Result<()> {
        let mut buf = [0u8; varint::MAX_VINT_LEN];
        let n = encode_into_array(value as u64, &mut buf);
        self.put(&buf[..n])
    }

    /// Write a var-int encoded u64.
    pub fn write_vlong(&mut self, value: u64) -> Result<()> {
        let mut buf = [0u8; varint::MAX_VLONG_LEN];
        let n = encode_into_array(value, &mut buf);
        self.put(&buf[..n])
    }

    /// Write raw bytes without a length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.put(value)
    }

    /// Copy `len` bytes from the current position of `input`.
    pub fn copy_from(&mut self, input: &mut IndexInput, len: u64) -> Result<()> {
        let mut buffer = [0u8; COPY_BUFFER_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(COPY_BUFFER_SIZE as u64) as usize;
            input.read_exact(&mut buffer[..n])?;
            self.put(&buffer[..n])?;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Current write offset.
    pub fn file_pointer(&self) -> u64 {
        self.position
    }

    /// Move the write offset. Checksums only cover sequential writes.
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        self.position = self.writer.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    /// CRC32 of every byte written so far.
    pub fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Flush buffered bytes to the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flush, sync and close the stream.
    pub fn close(mut self) -> Result<()> {
        self.writer.flush_and_sync()?;
        self.writer.close()
    }
}

fn encode_into_array(mut value: u64, buf: &mut [u8]) -> usize {
    let mut n = 0;
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf[n] = byte;
        n += 1;
        if value == 0 {
            return n;
        }
    }
}

/// A positioned binary reader.
#[derive(Debug)]
pub struct IndexInput {
    reader: Box<dyn StorageInput>,
    position: u64,
    length: u64,
}

impl IndexInput {
    /// Wrap a storage input stream positioned at its start.
    pub fn new(reader: Box<dyn StorageInput>) -> Result<Self> {
        let length = reader.size()?;
        Ok(IndexInput {
            reader,
            position: 0,
            length,
        })
    }

    /// Read over an owned byte buffer.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let length = bytes.len() as u64;
        IndexInput {
            reader: Box::new(MemoryInput::new(Arc::new(bytes))),
            position: 0,
            length,
        }
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        let value = self.reader.read_u8()?;
        self.position += 1;
        Ok(value)
    }

    /// Read a u32 value (little-endian).
    pub fn read_u32(&mut self) -> Result<u32> {
        let value = self.reader.read_u32::<LittleEndian>()?;
        self.position += 4;
        Ok(value)
    }

    /// Read a u64 value (little-endian).
    pub fn read_u64(&mut self) -> Result<u64> {
        let value = self.reader.read_u64::<LittleEndian>()?;
        self.position += 8;
        Ok(value)
    }

    /// Read a var-int encoded u32.
    pub fn read_vint(&mut self) -> Result<u32> {
        let value = self.read_vlong()?;
        u32::try_from(value).map_err(|_| IrIndexError::corrupt("VarInt overflow"))
    }

    /// Read a var-int encoded u64.
    pub fn read_vlong(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            if self.position >= self.length {
                return Err(IrIndexError::corrupt("Incomplete VarInt"));
            }
            let byte = self.read_u8()?;
            if shift >= 64 {
                return Err(IrIndexError::corrupt("VarInt overflow"));
            }
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Fill `buf` completely.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.position + buf.len() as u64 > self.length {
            return Err(IrIndexError::corrupt(format!(
                "read of {} bytes at {} past end of input ({})",
                buf.len(),
                self.position,
                self.length
            )));
        }
        self.reader.read_exact(buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    /// Read exactly `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; len];
        self.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// Current read offset.
    pub fn file_pointer(&self) -> u64 {
        self.position
    }

    /// Move the read offset.
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        if pos > self.length {
            return Err(IrIndexError::corrupt(format!(
                "seek to {pos} past end of input ({})",
                self.length
            )));
        }
        if pos != self.position {
            self.position = self.reader.seek(SeekFrom::Start(pos))?;
        }
        Ok(())
    }

    /// Total length of the input.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Whether the read offset reached the end of the input.
    pub fn is_eof(&self) -> bool {
        self.position >= self.length
    }

    /// Open an independent reader over the same data, positioned at 0.
    pub fn clone_input(&self) -> Result<IndexInput> {
        IndexInput::new(self.reader.clone_input()?)
    }
}
