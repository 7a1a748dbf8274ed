//! Posting lists: accumulation, on-disk layout and decoding.
//!
//! A term's postings live in two streams. The doc stream holds the skip
//! list followed by the doc chunks; the position stream holds the chunks'
//! positions. [`InMemoryPosting`] builds both streams in memory pools,
//! grouping chunks the way its [`PostingFormat`] says, and
//! [`TermPositions`] decodes them back.

pub mod block_writer;
pub mod chunk_writer;
pub mod in_memory;
pub mod term_positions;

pub use block_writer::BlockPostingWriter;
pub use chunk_writer::ChunkPostingWriter;
pub use in_memory::{InMemoryPosting, PostingSnapshot};
pub use term_positions::{OnDiskPosting, TermPositions};

use crate::error::Result;
use crate::index::DocId;
use crate::index::chunk::PostingChunk;
use crate::index::config::{PostingConfig, PostingFormat};
use crate::index::pool::{PoolMark, VariantDataPool};
use crate::index::skip_list::SkipListWriter;
use crate::index::term_info::TermInfo;
use crate::storage::IndexOutput;
use crate::util::budget::MemoryBudget;
use crate::util::varint::encode_u32_into;

/// Shared read interface of in-memory and on-disk postings.
pub trait Posting {
    /// Number of documents containing the term.
    fn doc_freq(&self) -> u32;

    /// Total number of occurrences.
    fn ctf(&self) -> u64;

    fn last_doc_id(&self) -> Option<DocId>;

    /// Decode the next chunk with its positions; `None` once exhausted.
    fn decode_next_chunk(&mut self) -> Result<Option<PostingChunk>>;

    /// Rewind to the first chunk.
    fn reset(&mut self) -> Result<()>;
}

/// The doc and position outputs of one field of a barrel.
#[derive(Debug)]
pub struct PostingOutputs<'a> {
    pub doc: &'a mut IndexOutput,
    pub pos: &'a mut IndexOutput,
}

/// Encoded streams of one term under construction.
#[derive(Debug)]
pub struct PostingStreams {
    pub(crate) doc_pool: VariantDataPool,
    pub(crate) pos_pool: VariantDataPool,
    pub(crate) skip: SkipListWriter,
    /// Last doc id of the last sealed chunk; 0 before the first.
    pub(crate) chain_last_doc: DocId,
    /// Postings in sealed chunks.
    pub(crate) sealed_postings: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamsMark {
    doc: PoolMark,
    pos: PoolMark,
}

impl PostingStreams {
    pub fn new(config: &PostingConfig, budget: &MemoryBudget) -> Self {
        PostingStreams {
            doc_pool: VariantDataPool::new(config.pool, budget.clone()),
            pos_pool: VariantDataPool::new(config.pool, budget.clone()),
            skip: SkipListWriter::new(config.skip_interval, config.max_skip_level),
            chain_last_doc: 0,
            sealed_postings: 0,
        }
    }

    pub(crate) fn mark(&self) -> StreamsMark {
        StreamsMark {
            doc: self.doc_pool.mark(),
            pos: self.pos_pool.mark(),
        }
    }

    pub(crate) fn rollback(&mut self, mark: StreamsMark) {
        self.doc_pool.rollback(mark.doc);
        self.pos_pool.rollback(mark.pos);
    }

    pub(crate) fn append_doc(&mut self, bytes: &[u8]) -> Result<()> {
        self.doc_pool.append_raw(bytes)
    }

    pub(crate) fn append_pos(&mut self, bytes: &[u8]) -> Result<()> {
        self.pos_pool.append_raw(bytes)
    }

    /// Append a block: its chunk count followed by the encoded chunks.
    pub(crate) fn append_block(&mut self, chunk_count: u32, parts: &[&[u8]]) -> Result<()> {
        let mut header = Vec::with_capacity(5);
        encode_u32_into(chunk_count, &mut header);
        self.doc_pool.append_raw(&header)?;
        for part in parts {
            self.doc_pool.append_raw(part)?;
        }
        Ok(())
    }

    /// Bytes reserved by both pools.
    pub fn reserved(&self) -> u64 {
        self.doc_pool.reserved() + self.pos_pool.reserved()
    }

    /// Write skip list, doc chunks and positions; fills in the pointers of a
    /// [`TermInfo`] whose statistics the caller supplies.
    pub(crate) fn write(
        &self,
        outputs: &mut PostingOutputs<'_>,
        doc_tail: &[u8],
        pos_tail: &[u8],
        stats: TermInfo,
    ) -> Result<TermInfo> {
        let skip_pointer = outputs.doc.file_pointer();
        let skip_level = self.skip.num_levels() as u32;
        if skip_level > 0 {
            self.skip.write_to(outputs.doc)?;
        }
        let doc_pointer = outputs.doc.file_pointer();
        let doc_posting_len = self.doc_pool.write_to(outputs.doc)? + doc_tail.len() as u64;
        outputs.doc.write_bytes(doc_tail)?;
        let pos_pointer = outputs.pos.file_pointer();
        let pos_posting_len = self.pos_pool.write_to(outputs.pos)? + pos_tail.len() as u64;
        outputs.pos.write_bytes(pos_tail)?;

        Ok(TermInfo {
            skip_level,
            skip_pointer,
            doc_pointer,
            doc_posting_len,
            pos_pointer,
            pos_posting_len,
            ..stats
        })
    }
}

/// Chunk grouping strategy of an accumulator.
#[derive(Debug)]
pub(crate) enum PostingLayout {
    Chunk(ChunkPostingWriter),
    Block(BlockPostingWriter),
}

impl PostingLayout {
    pub(crate) fn new(config: &PostingConfig) -> Self {
        match config.format {
            PostingFormat::Chunk => PostingLayout::Chunk(ChunkPostingWriter::new(config.skip_interval)),
            PostingFormat::Block => PostingLayout::Block(BlockPostingWriter::new(config.block_chunks)),
        }
    }

    pub(crate) fn format(&self) -> PostingFormat {
        match self {
            PostingLayout::Chunk(_) => PostingFormat::Chunk,
            PostingLayout::Block(_) => PostingFormat::Block,
        }
    }

    /// Seal `chunk` into the streams. `followed` tells whether another chunk
    /// is known to come after it.
    pub(crate) fn seal(
        &mut self,
        streams: &mut PostingStreams,
        chunk: &PostingChunk,
        followed: bool,
    ) -> Result<()> {
        match self {
            PostingLayout::Chunk(writer) => writer.seal(streams, chunk, followed),
            PostingLayout::Block(writer) => writer.seal(streams, chunk, followed),
        }
    }

    /// Commit anything buffered when there is no pending chunk to seal.
    pub(crate) fn finish(&mut self, streams: &mut PostingStreams) -> Result<()> {
        match self {
            PostingLayout::Chunk(_) => Ok(()),
            PostingLayout::Block(writer) => writer.finish(streams),
        }
    }

    /// Encode buffered state plus `pending` after the pooled bytes, without
    /// changing the accumulator.
    pub(crate) fn encode_tail(
        &self,
        streams: &PostingStreams,
        pending: &PostingChunk,
        doc_out: &mut Vec<u8>,
        pos_out: &mut Vec<u8>,
    ) -> Result<()> {
        match self {
            PostingLayout::Chunk(_) => {
                if !pending.is_empty() {
                    pending.encode(streams.chain_last_doc, doc_out, pos_out)?;
                }
                Ok(())
            }
            PostingLayout::Block(writer) => writer.encode_tail(streams, pending, doc_out, pos_out),
        }
    }

    pub(crate) fn buffered_bytes(&self) -> usize {
        match self {
            PostingLayout::Chunk(_) => 0,
            PostingLayout::Block(writer) => writer.buffered_bytes(),
        }
    }

    /// Account for postings appended without going through `seal`.
    pub(crate) fn after_raw_append(&mut self, postings_since_skip: u32) {
        if let PostingLayout::Chunk(writer) = self {
            writer.set_postings_since_skip(postings_since_skip);
        }
    }

    pub(crate) fn postings_since_skip(&self) -> u32 {
        match self {
            PostingLayout::Chunk(writer) => writer.postings_since_skip(),
            PostingLayout::Block(_) => 0,
        }
    }
}
