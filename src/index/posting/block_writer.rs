//! Block layout: chunks grouped `block_chunks` at a time behind a
//! `vint chunk_count` header, with skip points only at block boundaries.
//!
//! The doc bytes of the open block stay in a side buffer until the block
//! is complete, since its header has to be written first. Positions go
//! straight to the position pool.

use crate::error::Result;
use crate::index::chunk::PostingChunk;
use crate::index::posting::PostingStreams;
use crate::index::skip_list::SkipPoint;
use crate::util::varint::encode_u32_into;

#[derive(Debug, Clone)]
pub struct BlockPostingWriter {
    block_chunks: usize,
    block: Vec<u8>,
    block_count: u32,
}

impl BlockPostingWriter {
    pub fn new(block_chunks: usize) -> Self {
        BlockPostingWriter {
            block_chunks: block_chunks.max(1),
            block: Vec::new(),
            block_count: 0,
        }
    }

    /// Chunks buffered in the open block.
    pub fn open_chunks(&self) -> u32 {
        self.block_count
    }

    pub fn buffered_bytes(&self) -> usize {
        self.block.capacity()
    }

    /// Add `chunk` to the open block, committing the block first when it is
    /// full. Without a follower the block is committed right away.
    pub fn seal(
        &mut self,
        streams: &mut PostingStreams,
        chunk: &PostingChunk,
        followed: bool,
    ) -> Result<()> {
        let Some(last_doc) = chunk.last_doc_id() else {
            return Ok(());
        };
        let (mut doc, mut pos) = (Vec::new(), Vec::new());
        chunk.encode(streams.chain_last_doc, &mut doc, &mut pos)?;

        let full = self.block_count as usize >= self.block_chunks;
        let mark = streams.mark();
        let result = (|| -> Result<()> {
            let mut boundary = None;
            if full {
                streams.append_block(self.block_count, &[&self.block])?;
                boundary = Some(SkipPoint {
                    doc_id: streams.chain_last_doc,
                    doc_offset: streams.doc_pool.len(),
                    pos_offset: streams.pos_pool.len(),
                    postings: streams.sealed_postings,
                });
            }
            streams.append_pos(&pos)?;
            if !followed {
                if full || self.block_count == 0 {
                    streams.append_block(1, &[&doc])?;
                } else {
                    streams.append_block(self.block_count + 1, &[&self.block, &doc])?;
                }
            }
            if let Some(point) = boundary {
                streams.skip.add_skip_point(point)?;
            }
            Ok(())
        })();
        if let Err(err) = result {
            streams.rollback(mark);
            return Err(err);
        }

        if full || !followed {
            self.block.clear();
            self.block_count = 0;
        }
        if followed {
            self.block.extend_from_slice(&doc);
            self.block_count += 1;
        }
        streams.chain_last_doc = last_doc;
        streams.sealed_postings += chunk.len() as u32;
        Ok(())
    }

    /// Commit the open block, if any.
    pub fn finish(&mut self, streams: &mut PostingStreams) -> Result<()> {
        if self.block_count == 0 {
            return Ok(());
        }
        let mark = streams.mark();
        if let Err(err) = streams.append_block(self.block_count, &[&self.block]) {
            streams.rollback(mark);
            return Err(err);
        }
        self.block.clear();
        self.block_count = 0;
        Ok(())
    }

    /// Encode the open block and `pending` as they would be committed.
    pub fn encode_tail(
        &self,
        streams: &PostingStreams,
        pending: &PostingChunk,
        doc_out: &mut Vec<u8>,
        pos_out: &mut Vec<u8>,
    ) -> Result<()> {
        let mut count = self.block_count;
        let mut pending_doc = Vec::new();
        if !pending.is_empty() {
            pending.encode(streams.chain_last_doc, &mut pending_doc, pos_out)?;
            count += 1;
        }
        if count > 0 {
            encode_u32_into(count, doc_out);
            doc_out.extend_from_slice(&self.block);
            doc_out.extend_from_slice(&pending_doc);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::config::PostingConfig;
    use crate::util::budget::MemoryBudget;
    use crate::util::varint::decode_u32_at;

    fn chunk(docs: std::ops::Range<u32>) -> PostingChunk {
        let mut chunk = PostingChunk::default();
        for doc in docs {
            chunk.push_posting(doc, &[1, 2]);
        }
        chunk
    }

    #[test]
    fn test_blocks_commit_when_full() {
        let config = PostingConfig::default();
        let mut streams = PostingStreams::new(&config, &MemoryBudget::unlimited());
        let mut writer = BlockPostingWriter::new(2);

        writer.seal(&mut streams, &chunk(1..4), true).unwrap();
        writer.seal(&mut streams, &chunk(4..7), true).unwrap();
        assert!(streams.doc_pool.is_empty());
        assert_eq!(writer.open_chunks(), 2);

        // The third chunk opens a new block and records the boundary.
        writer.seal(&mut streams, &chunk(7..10), true).unwrap();
        let point = streams.skip.last_point().unwrap();
        assert_eq!(point.doc_id, 6);
        assert_eq!(point.postings, 6);
        assert_eq!(point.doc_offset, streams.doc_pool.len());
        assert_eq!(writer.open_chunks(), 1);

        writer.seal(&mut streams, &chunk(10..12), false).unwrap();
        assert_eq!(writer.open_chunks(), 0);
        assert_eq!(streams.sealed_postings, 11);

        let bytes = streams.doc_pool.to_vec();
        let mut pos = 0;
        assert_eq!(decode_u32_at(&bytes, &mut pos).unwrap(), 2);
        pos = point.doc_offset as usize;
        assert_eq!(decode_u32_at(&bytes, &mut pos).unwrap(), 2);
    }

    #[test]
    fn test_tail_matches_committed_bytes() {
        let config = PostingConfig::default();
        let mut streams = PostingStreams::new(&config, &MemoryBudget::unlimited());
        let mut writer = BlockPostingWriter::new(4);
        writer.seal(&mut streams, &chunk(1..4), true).unwrap();
        let pending = chunk(4..6);

        let (mut doc, mut pos) = (streams.doc_pool.to_vec(), streams.pos_pool.to_vec());
        writer
            .encode_tail(&streams, &pending, &mut doc, &mut pos)
            .unwrap();

        writer.seal(&mut streams, &pending, false).unwrap();
        assert_eq!(doc, streams.doc_pool.to_vec());
        assert_eq!(pos, streams.pos_pool.to_vec());
    }

    #[test]
    fn test_finish_commits_open_block() {
        let config = PostingConfig::default();
        let mut streams = PostingStreams::new(&config, &MemoryBudget::unlimited());
        let mut writer = BlockPostingWriter::new(4);
        writer.seal(&mut streams, &chunk(1..4), true).unwrap();
        writer.finish(&mut streams).unwrap();
        assert_eq!(writer.open_chunks(), 0);
        assert_eq!(streams.doc_pool.to_vec()[0], 1);
    }
}
