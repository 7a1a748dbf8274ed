//! Append-only byte arena for encoded posting data.
//!
//! A [`VariantDataPool`] is a list of owned byte chunks. Chunks grow
//! geometrically up to a cap, sealed bytes are never moved or copied, and
//! every chunk allocation is charged to the shared [`MemoryBudget`].

use crate::error::{IrIndexError, Result};
use crate::index::config::PoolConfig;
use crate::storage::{IndexInput, IndexOutput};
use crate::util::budget::MemoryBudget;
use crate::util::varint::{self, MAX_VINT_LEN, MAX_VLONG_LEN};

pub use crate::util::varint::{decode_u32_at as decode_vdata32, decode_u64_at as decode_vdata64};

const COPY_BUFFER_SIZE: usize = 8192;

/// A point in the pool that [`VariantDataPool::rollback`] can return to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolMark {
    chunks: usize,
    last_len: usize,
    total: u64,
}

#[derive(Debug)]
struct PoolChunk {
    bytes: Vec<u8>,
    /// Bytes charged to the budget for this chunk.
    limit: usize,
}

impl PoolChunk {
    fn room(&self) -> usize {
        self.limit - self.bytes.len()
    }
}

/// Chunked, append-only storage of var-byte encoded integers.
#[derive(Debug)]
pub struct VariantDataPool {
    chunks: Vec<PoolChunk>,
    total: u64,
    reserved: u64,
    next_chunk_size: usize,
    config: PoolConfig,
    budget: MemoryBudget,
}

impl VariantDataPool {
    /// Create an empty pool. No memory is allocated until the first append.
    pub fn new(config: PoolConfig, budget: MemoryBudget) -> Self {
        VariantDataPool {
            chunks: Vec::new(),
            total: 0,
            reserved: 0,
            next_chunk_size: config.initial_chunk_size,
            config,
            budget,
        }
    }

    /// Number of bytes appended.
    pub fn len(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Bytes allocated for chunks, used or not.
    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    fn remaining_in_last(&self) -> usize {
        self.chunks.last().map(PoolChunk::room).unwrap_or(0)
    }

    fn allocate_chunk(&mut self, min_size: usize) -> Result<()> {
        let size = self.next_chunk_size.max(min_size);
        self.budget.try_allocate(size as u64)?;

        let mut bytes = Vec::new();
        if bytes.try_reserve_exact(size).is_err() {
            self.budget.release(size as u64);
            return Err(IrIndexError::out_of_memory(format!(
                "failed to allocate a {size} byte pool chunk"
            )));
        }

        self.reserved += size as u64;
        self.chunks.push(PoolChunk { bytes, limit: size });

        let grown = (self.next_chunk_size as f64 * self.config.growth_factor) as usize;
        self.next_chunk_size =
            grown.clamp(self.config.initial_chunk_size, self.config.max_chunk_size);
        Ok(())
    }

    fn ensure(&mut self, needed: usize) -> Result<()> {
        if self.remaining_in_last() < needed {
            self.allocate_chunk(needed)?;
        }
        Ok(())
    }

    /// Append a var-byte encoded u32. A value never straddles two chunks.
    pub fn add_vdata32(&mut self, value: u32) -> Result<usize> {
        self.ensure(MAX_VINT_LEN)?;
        let chunk = self.last_chunk_mut()?;
        let written = varint::encode_u32_into(value, chunk);
        self.total += written as u64;
        Ok(written)
    }

    /// Append a var-byte encoded u64. A value never straddles two chunks.
    pub fn add_vdata64(&mut self, value: u64) -> Result<usize> {
        self.ensure(MAX_VLONG_LEN)?;
        let chunk = self.last_chunk_mut()?;
        let written = varint::encode_u64_into(value, chunk);
        self.total += written as u64;
        Ok(written)
    }

    fn last_chunk_mut(&mut self) -> Result<&mut Vec<u8>> {
        self.chunks
            .last_mut()
            .map(|chunk| &mut chunk.bytes)
            .ok_or_else(|| IrIndexError::out_of_memory("pool has no chunk"))
    }

    /// Bulk-append pre-encoded bytes, filling the current chunk first.
    pub fn append_raw(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            if self.remaining_in_last() == 0 {
                self.allocate_chunk(0)?;
            }
            let room = self.remaining_in_last();
            let n = room.min(bytes.len());
            let chunk = self.last_chunk_mut()?;
            chunk.extend_from_slice(&bytes[..n]);
            self.total += n as u64;
            bytes = &bytes[n..];
        }
        Ok(())
    }

    /// Bulk-append `len` bytes read from the current position of `input`.
    pub fn append_from(&mut self, input: &mut IndexInput, len: u64) -> Result<()> {
        let mut buffer = [0u8; COPY_BUFFER_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(COPY_BUFFER_SIZE as u64) as usize;
            input.read_exact(&mut buffer[..n])?;
            self.append_raw(&buffer[..n])?;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Stream every chunk, in order, to `output`. Returns the bytes written.
    pub fn write_to(&self, output: &mut IndexOutput) -> Result<u64> {
        for chunk in &self.chunks {
            output.write_bytes(&chunk.bytes)?;
        }
        Ok(self.total)
    }

    /// Copy the pool contents into `out`.
    pub fn copy_into(&self, out: &mut Vec<u8>) {
        out.reserve(self.total as usize);
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.bytes);
        }
    }

    /// The pool contents as one contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.copy_into(&mut out);
        out
    }

    /// Remember the current end of the pool.
    pub fn mark(&self) -> PoolMark {
        PoolMark {
            chunks: self.chunks.len(),
            last_len: self.chunks.last().map(|c| c.bytes.len()).unwrap_or(0),
            total: self.total,
        }
    }

    /// Drop everything appended after `mark`, releasing chunks allocated since.
    pub fn rollback(&mut self, mark: PoolMark) {
        while self.chunks.len() > mark.chunks {
            if let Some(chunk) = self.chunks.pop() {
                self.release_chunk(&chunk);
            }
        }
        if let Some(last) = self.chunks.last_mut() {
            last.bytes.truncate(mark.last_len);
        }
        self.total = mark.total;
    }

    /// Release all chunks.
    pub fn reset(&mut self) {
        for chunk in std::mem::take(&mut self.chunks) {
            self.release_chunk(&chunk);
        }
        self.total = 0;
        self.next_chunk_size = self.config.initial_chunk_size;
    }

    fn release_chunk(&mut self, chunk: &PoolChunk) {
        self.reserved -= chunk.limit as u64;
        self.budget.release(chunk.limit as u64);
    }
}

impl Drop for VariantDataPool {
    fn drop(&mut self) {
        self.budget.release(self.reserved);
    }
}
