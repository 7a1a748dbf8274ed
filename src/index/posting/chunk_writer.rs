//! Plain chunk layout: chunks back to back, a skip point every
//! `skip_interval` postings (rounded up to the next chunk boundary).

use crate::error::Result;
use crate::index::chunk::PostingChunk;
use crate::index::posting::PostingStreams;
use crate::index::skip_list::SkipPoint;

#[derive(Debug, Clone)]
pub struct ChunkPostingWriter {
    skip_interval: u32,
    since_skip: u32,
}

impl ChunkPostingWriter {
    pub fn new(skip_interval: u32) -> Self {
        ChunkPostingWriter {
            skip_interval,
            since_skip: 0,
        }
    }

    pub fn postings_since_skip(&self) -> u32 {
        self.since_skip
    }

    pub(crate) fn set_postings_since_skip(&mut self, postings: u32) {
        self.since_skip = postings;
    }

    /// Encode `chunk` into the pools. Either everything lands or nothing does.
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

        let mark = streams.mark();
        let postings = streams.sealed_postings + chunk.len() as u32;
        let mut since_skip = self.since_skip + chunk.len() as u32;
        let result = (|| -> Result<()> {
            streams.append_doc(&doc)?;
            streams.append_pos(&pos)?;
            if followed && since_skip >= self.skip_interval {
                streams.skip.add_skip_point(SkipPoint {
                    doc_id: last_doc,
                    doc_offset: streams.doc_pool.len(),
                    pos_offset: streams.pos_pool.len(),
                    postings,
                })?;
                since_skip = 0;
            }
            Ok(())
        })();
        if let Err(err) = result {
            streams.rollback(mark);
            return Err(err);
        }

        streams.chain_last_doc = last_doc;
        streams.sealed_postings = postings;
        self.since_skip = since_skip;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::config::{PoolConfig, PostingConfig};
    use crate::util::budget::MemoryBudget;

    fn chunk(docs: std::ops::Range<u32>) -> PostingChunk {
        let mut chunk = PostingChunk::default();
        for doc in docs {
            chunk.push_posting(doc, &[doc % 7]);
        }
        chunk
    }

    #[test]
    fn test_skip_points_follow_interval() {
        let config = PostingConfig {
            skip_interval: 8,
            ..PostingConfig::default()
        };
        let mut streams = PostingStreams::new(&config, &MemoryBudget::unlimited());
        let mut writer = ChunkPostingWriter::new(8);

        // Two chunks of 5 postings reach the interval on the second seal.
        writer.seal(&mut streams, &chunk(1..6), true).unwrap();
        assert!(streams.skip.is_empty());
        writer.seal(&mut streams, &chunk(6..11), true).unwrap();
        let point = streams.skip.last_point().unwrap();
        assert_eq!(point.doc_id, 10);
        assert_eq!(point.postings, 10);
        assert_eq!(point.doc_offset, streams.doc_pool.len());

        // The final seal never records a point.
        writer.seal(&mut streams, &chunk(11..30), false).unwrap();
        assert_eq!(streams.skip.len(), 1);
        assert_eq!(streams.sealed_postings, 29);
        assert_eq!(streams.chain_last_doc, 29);
    }

    #[test]
    fn test_failed_seal_leaves_streams_untouched() {
        let config = PostingConfig {
            pool: PoolConfig {
                initial_chunk_size: 16,
                growth_factor: 1.0,
                max_chunk_size: 16,
            },
            ..PostingConfig::default()
        };
        let budget = MemoryBudget::new(Some(48));
        let mut streams = PostingStreams::new(&config, &budget);
        let mut writer = ChunkPostingWriter::new(8);

        writer.seal(&mut streams, &chunk(1..4), true).unwrap();
        let (doc_len, pos_len) = (streams.doc_pool.len(), streams.pos_pool.len());

        let err = writer.seal(&mut streams, &chunk(4..40), true).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(streams.doc_pool.len(), doc_len);
        assert_eq!(streams.pos_pool.len(), pos_len);
        assert_eq!(streams.sealed_postings, 3);
        assert_eq!(streams.chain_last_doc, 3);
        assert_eq!(budget.used(), streams.reserved());
    }
}
