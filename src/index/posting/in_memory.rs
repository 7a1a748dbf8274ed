//! The per-term accumulator used while a barrel is open.

use std::fmt;

use crate::error::{IrIndexError, Result};
use crate::index::DocId;
use crate::index::chunk::PostingChunk;
use crate::index::config::{PostingConfig, PostingFormat};
use crate::index::posting::term_positions::OnDiskPosting;
use crate::index::posting::{Posting, PostingLayout, PostingOutputs, PostingStreams, TermPositions};
use crate::index::skip_list::{SkipListMerger, SkipPoint, SkipRebase};
use crate::index::term_info::TermInfo;
use crate::storage::IndexInput;
use crate::util::budget::MemoryBudget;

/// Postings of one term, accumulated in increasing doc id order.
pub struct InMemoryPosting {
    config: PostingConfig,
    streams: PostingStreams,
    layout: PostingLayout,
    pending: PostingChunk,
    doc_freq: u32,
    ctf: u64,
    cursor: Option<TermPositions>,
}

impl fmt::Debug for InMemoryPosting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryPosting")
            .field("format", &self.layout.format())
            .field("doc_freq", &self.doc_freq)
            .field("ctf", &self.ctf)
            .field("last_doc_id", &self.last_doc_id())
            .finish()
    }
}

impl InMemoryPosting {
    pub fn new(config: PostingConfig, budget: &MemoryBudget) -> Self {
        InMemoryPosting {
            streams: PostingStreams::new(&config, budget),
            layout: PostingLayout::new(&config),
            pending: PostingChunk::with_capacity(config.chunk_capacity),
            config,
            doc_freq: 0,
            ctf: 0,
            cursor: None,
        }
    }

    pub fn format(&self) -> PostingFormat {
        self.layout.format()
    }

    pub fn doc_freq(&self) -> u32 {
        self.doc_freq
    }

    pub fn ctf(&self) -> u64 {
        self.ctf
    }

    pub fn last_doc_id(&self) -> Option<DocId> {
        self.pending.last_doc_id().or(if self.streams.sealed_postings > 0 {
            Some(self.streams.chain_last_doc)
        } else {
            None
        })
    }

    pub fn is_empty(&self) -> bool {
        self.doc_freq == 0
    }

    /// Approximate heap bytes held by this accumulator.
    pub fn memory_usage(&self) -> usize {
        self.streams.reserved() as usize
            + self.layout.buffered_bytes()
            + self.pending.doc_ids.capacity() * 8
            + self.pending.positions.capacity() * 4
    }

    /// Record one occurrence of the term at `position` in `doc_id`.
    ///
    /// On error nothing has changed.
    pub fn add(&mut self, doc_id: DocId, position: u32) -> Result<()> {
        match self.last_doc_id() {
            Some(last) if doc_id < last => {
                return Err(IrIndexError::invalid_argument(format!(
                    "doc id {doc_id} added after {last}"
                )));
            }
            Some(last) if doc_id == last => {
                if self.pending.last_doc_id() != Some(doc_id) {
                    return Err(IrIndexError::invalid_operation(format!(
                        "doc {doc_id} is already sealed"
                    )));
                }
                let current_freq = self.pending.freqs.last().copied().unwrap_or(0);
                if current_freq > 0 {
                    let previous = self.pending.positions.last().copied().unwrap_or(0);
                    if position < previous {
                        return Err(IrIndexError::invalid_argument(format!(
                            "position {position} of doc {doc_id} added after {previous}"
                        )));
                    }
                }
                self.pending.push_position(position);
            }
            _ => {
                self.seal_if_full()?;
                self.pending.push_doc(doc_id);
                self.pending.push_position(position);
                self.doc_freq += 1;
            }
        }
        self.ctf += 1;
        self.cursor = None;
        Ok(())
    }

    /// Record a whole posting for a document not seen before.
    pub fn add_posting(&mut self, doc_id: DocId, positions: &[u32]) -> Result<()> {
        if let Some(last) = self.last_doc_id() {
            if doc_id <= last {
                return Err(IrIndexError::invalid_argument(format!(
                    "doc id {doc_id} added after {last}"
                )));
            }
        }
        if positions.windows(2).any(|w| w[1] < w[0]) {
            return Err(IrIndexError::invalid_argument(format!(
                "positions of doc {doc_id} are not sorted"
            )));
        }
        self.seal_if_full()?;
        self.pending.push_posting(doc_id, positions);
        self.doc_freq += 1;
        self.ctf += positions.len() as u64;
        self.cursor = None;
        Ok(())
    }

    fn seal_if_full(&mut self) -> Result<()> {
        if self.pending.len() >= self.config.chunk_capacity {
            self.layout.seal(&mut self.streams, &self.pending, true)?;
            self.pending.clear();
        }
        Ok(())
    }

    /// Undo the postings of `doc_id` if it is the newest document.
    pub fn rollback_document(&mut self, doc_id: DocId) -> bool {
        if self.pending.last_doc_id() != Some(doc_id) {
            return false;
        }
        if let Some((_, freq)) = self.pending.pop_doc() {
            self.doc_freq -= 1;
            self.ctf -= freq as u64;
        }
        self.cursor = None;
        true
    }

    /// Seal the partial chunk and anything the layout still buffers.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return self.layout.finish(&mut self.streams);
        }
        self.layout.seal(&mut self.streams, &self.pending, false)?;
        self.pending.clear();
        Ok(())
    }

    fn stats(&self) -> TermInfo {
        TermInfo {
            doc_freq: self.doc_freq,
            ctf: self.ctf,
            last_doc_id: self.last_doc_id().unwrap_or(0),
            ..TermInfo::default()
        }
    }

    /// Write skip list, chunks and positions to `outputs`.
    ///
    /// The partial chunk is encoded straight to the outputs rather than
    /// sealed into the pools, so writing never charges the budget.
    pub fn write(&self, outputs: &mut PostingOutputs<'_>) -> Result<TermInfo> {
        let (mut doc_tail, mut pos_tail) = (Vec::new(), Vec::new());
        self.layout
            .encode_tail(&self.streams, &self.pending, &mut doc_tail, &mut pos_tail)?;
        self.streams.write(outputs, &doc_tail, &pos_tail, self.stats())
    }

    /// A self-contained copy of the postings as they stand, readable while
    /// this accumulator keeps growing.
    pub fn snapshot(&self) -> Result<PostingSnapshot> {
        let mut skip = Vec::new();
        if !self.streams.skip.is_empty() {
            self.streams.skip.encode(&mut skip);
        }
        let skip_len = skip.len() as u64;

        let mut doc_bytes = skip;
        self.streams.doc_pool.copy_into(&mut doc_bytes);
        let mut pos_bytes = self.streams.pos_pool.to_vec();
        self.layout
            .encode_tail(&self.streams, &self.pending, &mut doc_bytes, &mut pos_bytes)?;

        let info = TermInfo {
            skip_level: self.streams.skip.num_levels() as u32,
            skip_pointer: 0,
            doc_pointer: skip_len,
            doc_posting_len: doc_bytes.len() as u64 - skip_len,
            pos_pointer: 0,
            pos_posting_len: pos_bytes.len() as u64,
            ..self.stats()
        };
        Ok(PostingSnapshot {
            info,
            format: self.format(),
            doc_bytes,
            pos_bytes,
        })
    }

    /// Append one sealed on-disk posting list without decoding it, shifting
    /// its doc ids by `doc_shift`.
    ///
    /// Only the input's first chunk header is re-encoded, to continue the
    /// delta chain; the rest of its doc stream and all of its positions are
    /// copied as raw bytes and its skip points move by the size change.
    pub fn append_on_disk(&mut self, input: &mut OnDiskPosting<'_>, doc_shift: DocId) -> Result<()> {
        if input.format() != self.format() {
            return Err(IrIndexError::merge(format!(
                "cannot copy {:?} postings into {:?} postings",
                input.format(),
                self.format()
            )));
        }
        let info = *input.term_info();
        let input_points = input.skip_points()?;
        let head = input.raw_head()?;
        if head.header.is_empty() {
            return Ok(());
        }

        self.flush()?;
        let out_doc_start = self.streams.doc_pool.len();
        let out_pos_start = self.streams.pos_pool.len();
        let out_postings = self.streams.sealed_postings;

        let mut header = head.header;
        for doc_id in header.doc_ids.iter_mut() {
            *doc_id = doc_id
                .checked_add(doc_shift)
                .ok_or_else(|| IrIndexError::merge("rebased doc id overflows u32"))?;
        }
        let mut first_chunk = Vec::new();
        header.encode(self.streams.chain_last_doc, &mut first_chunk)?;

        if let Some(count) = head.block_chunks {
            self.streams.append_block(count, &[&first_chunk])?;
        } else {
            self.streams.append_doc(&first_chunk)?;
        }
        {
            let (doc_in, pos_in) = input.inputs_mut();
            doc_in.seek(head.rest_offset)?;
            self.streams
                .doc_pool
                .append_from(doc_in, info.doc_end() - head.rest_offset)?;
            pos_in.seek(info.pos_pointer)?;
            self.streams.pos_pool.append_from(pos_in, info.pos_posting_len)?;
        }

        let size_change = first_chunk.len() as i64 - head.chunk_len as i64;
        let mut merger = SkipListMerger::new(&mut self.streams.skip);
        let mut since_skip = self.layout.postings_since_skip();
        if out_postings > 0 {
            let added = merger.add_boundary(SkipPoint {
                doc_id: self.streams.chain_last_doc,
                doc_offset: out_doc_start,
                pos_offset: out_pos_start,
                postings: out_postings,
            })?;
            if added {
                since_skip = 0;
            }
        }
        merger.merge_points(
            input_points.iter().copied(),
            SkipRebase {
                doc_id: doc_shift,
                doc_offset: out_doc_start as i64 + size_change,
                pos_offset: out_pos_start,
                postings: out_postings,
            },
        )?;
        since_skip = match input_points.last() {
            Some(point) => info.doc_freq.saturating_sub(point.postings),
            None => since_skip + info.doc_freq,
        };
        self.layout.after_raw_append(since_skip);

        self.streams.chain_last_doc = info
            .last_doc_id
            .checked_add(doc_shift)
            .ok_or_else(|| IrIndexError::merge("rebased doc id overflows u32"))?;
        self.streams.sealed_postings += info.doc_freq;
        self.doc_freq += info.doc_freq;
        self.ctf += info.ctf;
        self.cursor = None;
        Ok(())
    }
}

impl Posting for InMemoryPosting {
    fn doc_freq(&self) -> u32 {
        self.doc_freq
    }

    fn ctf(&self) -> u64 {
        self.ctf
    }

    fn last_doc_id(&self) -> Option<DocId> {
        InMemoryPosting::last_doc_id(self)
    }

    fn decode_next_chunk(&mut self) -> Result<Option<PostingChunk>> {
        if self.cursor.is_none() {
            self.cursor = Some(self.snapshot()?.term_positions(0));
        }
        match self.cursor.as_mut() {
            Some(cursor) => cursor.decode_next_chunk(),
            None => Ok(None),
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.cursor = None;
        Ok(())
    }
}

/// A frozen copy of an in-memory posting list in its on-disk layout.
#[derive(Debug, Clone)]
pub struct PostingSnapshot {
    info: TermInfo,
    format: PostingFormat,
    doc_bytes: Vec<u8>,
    pos_bytes: Vec<u8>,
}

impl PostingSnapshot {
    pub fn term_info(&self) -> &TermInfo {
        &self.info
    }

    pub fn doc_freq(&self) -> u32 {
        self.info.doc_freq
    }

    pub fn ctf(&self) -> u64 {
        self.info.ctf
    }

    /// Iterate the snapshot; returned doc ids are shifted by `doc_base`.
    pub fn term_positions(&self, doc_base: DocId) -> TermPositions {
        TermPositions::new(
            IndexInput::from_bytes(self.doc_bytes.clone()),
            IndexInput::from_bytes(self.pos_bytes.clone()),
            self.info,
            self.format,
            doc_base,
        )
    }
}
