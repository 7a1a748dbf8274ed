//! Decoding a term's postings: document iteration, `skip_to` and lazy
//! position reads.

use std::borrow::BorrowMut;

use crate::error::{IrIndexError, Result};
use crate::index::DocId;
use crate::index::chunk::{ChunkHeader, PostingChunk, read_positions, skip_positions};
use crate::index::config::PostingFormat;
use crate::index::posting::Posting;
use crate::index::skip_list::{SkipListReader, SkipPoint};
use crate::index::term_info::TermInfo;
use crate::storage::IndexInput;

/// A term's postings read through borrowed barrel inputs, as the merger
/// does it.
pub type OnDiskPosting<'a> = TermPositions<&'a mut IndexInput>;

/// The start of a posting list, as needed to splice it into another one.
#[derive(Debug, Clone)]
pub(crate) struct RawHead {
    /// Chunk count of the first block; `None` for the chunk format.
    pub block_chunks: Option<u32>,
    /// First chunk header, doc ids local to the input.
    pub header: ChunkHeader,
    /// Encoded size of the first chunk header.
    pub chunk_len: u64,
    /// Absolute doc stream offset right after the first chunk.
    pub rest_offset: u64,
}

/// Iterates one term's documents and positions.
///
/// Doc ids are reported shifted by `doc_base`. `next` and `skip_to` only
/// move forward; positions of the current document are decoded one at a
/// time by `next_position`.
#[derive(Debug)]
pub struct TermPositions<I: BorrowMut<IndexInput> = IndexInput> {
    doc_in: I,
    pos_in: I,
    info: TermInfo,
    format: PostingFormat,
    doc_base: DocId,
    skip: Option<SkipListReader>,

    header: ChunkHeader,
    index: Option<usize>,
    exhausted: bool,
    postings_read: u32,
    prev_last_doc: DocId,
    chunks_left_in_block: u32,
    next_doc_offset: u64,
    next_pos_offset: u64,
    chunk_pos_start: u64,

    pos_doc: Option<usize>,
    pos_left: u32,
    last_position: u32,
    first_position: bool,

    chunks_decoded: u64,
}

impl<I: BorrowMut<IndexInput>> TermPositions<I> {
    pub fn new(doc_in: I, pos_in: I, info: TermInfo, format: PostingFormat, doc_base: DocId) -> Self {
        TermPositions {
            doc_in,
            pos_in,
            format,
            doc_base,
            skip: None,
            header: ChunkHeader::default(),
            index: None,
            exhausted: false,
            postings_read: 0,
            prev_last_doc: 0,
            chunks_left_in_block: 0,
            next_doc_offset: info.doc_pointer,
            next_pos_offset: info.pos_pointer,
            chunk_pos_start: info.pos_pointer,
            pos_doc: None,
            pos_left: 0,
            last_position: 0,
            first_position: true,
            chunks_decoded: 0,
            info,
        }
    }

    pub fn term_info(&self) -> &TermInfo {
        &self.info
    }

    pub fn format(&self) -> PostingFormat {
        self.format
    }

    pub fn doc_base(&self) -> DocId {
        self.doc_base
    }

    /// Number of chunk headers decoded so far.
    pub fn chunks_decoded(&self) -> u64 {
        self.chunks_decoded
    }

    /// Current document, once `next` or `skip_to` succeeded.
    pub fn doc(&self) -> Option<DocId> {
        self.index.map(|i| self.header.doc_ids[i] + self.doc_base)
    }

    /// Term frequency in the current document.
    pub fn freq(&self) -> u32 {
        self.index.map(|i| self.header.freqs[i]).unwrap_or(0)
    }

    /// Advance to the next document; false at the end.
    pub fn next(&mut self) -> Result<bool> {
        if self.exhausted {
            return Ok(false);
        }
        if let Some(i) = self.index {
            if i + 1 < self.header.len() {
                self.index = Some(i + 1);
                return Ok(true);
            }
        }
        if self.load_next_chunk()? {
            self.index = Some(0);
            Ok(true)
        } else {
            self.finish();
            Ok(false)
        }
    }

    /// Advance to the first document `>= target`; false when there is none.
    ///
    /// A target at or before the current document leaves it unchanged.
    pub fn skip_to(&mut self, target: DocId) -> Result<bool> {
        if self.exhausted {
            return Ok(false);
        }
        let local = target.saturating_sub(self.doc_base);

        if let Some(i) = self.index {
            if self.header.doc_ids[i] >= local {
                return Ok(true);
            }
            if self.header.last_doc_id().is_some_and(|last| last >= local) {
                let rest = &self.header.doc_ids[i + 1..];
                self.index = Some(i + 1 + rest.partition_point(|&d| d < local));
                return Ok(true);
            }
        }

        self.skip_ahead(local)?;
        loop {
            if !self.load_next_chunk()? {
                self.finish();
                return Ok(false);
            }
            if self.header.last_doc_id().is_some_and(|last| last >= local) {
                self.index = Some(self.header.doc_ids.partition_point(|&d| d < local));
                return Ok(true);
            }
        }
    }

    /// Next position of the current document; `None` when all were read.
    pub fn next_position(&mut self) -> Result<Option<u32>> {
        let Some(current) = self.index else {
            return Ok(None);
        };
        if self.pos_doc != Some(current) {
            self.seek_positions(current)?;
        }
        if self.pos_left == 0 {
            return Ok(None);
        }
        let value = self.pos_in.borrow_mut().read_vint()?;
        let position = if self.first_position {
            value
        } else {
            self.last_position
                .checked_add(value)
                .ok_or_else(|| IrIndexError::corrupt("position delta overflows u32"))?
        };
        self.first_position = false;
        self.last_position = position;
        self.pos_left -= 1;
        Ok(Some(position))
    }

    /// All remaining positions of the current document.
    pub fn positions(&mut self) -> Result<Vec<u32>> {
        let mut out = Vec::with_capacity(self.freq() as usize);
        while let Some(position) = self.next_position()? {
            out.push(position);
        }
        Ok(out)
    }

    fn seek_positions(&mut self, current: usize) -> Result<()> {
        let pos_in = self.pos_in.borrow_mut();
        let skip = match self.pos_doc {
            Some(doc) if doc < current => {
                let between: u64 = self.header.freqs[doc + 1..current]
                    .iter()
                    .map(|&f| f as u64)
                    .sum();
                self.pos_left as u64 + between
            }
            _ => {
                pos_in.seek(self.chunk_pos_start)?;
                self.header.freqs[..current].iter().map(|&f| f as u64).sum()
            }
        };
        skip_positions(pos_in, skip)?;
        self.pos_doc = Some(current);
        self.pos_left = self.header.freqs[current];
        self.first_position = true;
        self.last_position = 0;
        Ok(())
    }

    fn finish(&mut self) {
        self.exhausted = true;
        self.index = None;
        self.pos_doc = None;
    }

    fn skip_ahead(&mut self, local: DocId) -> Result<()> {
        if self.info.skip_level == 0 || local == 0 {
            return Ok(());
        }
        let point = match self.skip_reader()?.skip_to(local - 1) {
            Some(point) => point,
            None => return Ok(()),
        };
        if point.postings > self.postings_read {
            self.jump_to(point)?;
        }
        Ok(())
    }

    fn skip_reader(&mut self) -> Result<&mut SkipListReader> {
        if self.skip.is_none() {
            let doc_in = self.doc_in.borrow_mut();
            doc_in.seek(self.info.skip_pointer)?;
            self.skip = Some(SkipListReader::read(doc_in, self.info.skip_len())?);
        }
        self.skip
            .as_mut()
            .ok_or_else(|| IrIndexError::corrupt("skip list missing"))
    }

    fn jump_to(&mut self, point: SkipPoint) -> Result<()> {
        if point.postings > self.info.doc_freq || point.doc_offset > self.info.doc_posting_len {
            return Err(IrIndexError::corrupt(format!(
                "skip point {point:?} outside a posting list of {} documents",
                self.info.doc_freq
            )));
        }
        self.next_doc_offset = self.info.doc_pointer + point.doc_offset;
        self.next_pos_offset = self.info.pos_pointer + point.pos_offset;
        self.postings_read = point.postings;
        self.prev_last_doc = point.doc_id;
        self.chunks_left_in_block = 0;
        self.index = None;
        self.pos_doc = None;
        Ok(())
    }

    /// Decode the next chunk header; false once `doc_freq` postings were read.
    fn load_next_chunk(&mut self) -> Result<bool> {
        if self.postings_read >= self.info.doc_freq {
            return Ok(false);
        }
        let doc_end = self.info.doc_end();
        let doc_in = self.doc_in.borrow_mut();
        doc_in.seek(self.next_doc_offset)?;

        if self.format == PostingFormat::Block && self.chunks_left_in_block == 0 {
            if doc_in.file_pointer() >= doc_end {
                return Err(IrIndexError::corrupt("posting list ends before its last block"));
            }
            let count = doc_in.read_vint()?;
            if count == 0 {
                return Err(IrIndexError::corrupt("empty posting block"));
            }
            self.chunks_left_in_block = count;
        }
        if doc_in.file_pointer() >= doc_end {
            return Err(IrIndexError::corrupt(format!(
                "posting list ends after {} of {} documents",
                self.postings_read, self.info.doc_freq
            )));
        }

        self.header.read(doc_in, self.prev_last_doc)?;
        self.next_doc_offset = doc_in.file_pointer();
        if self.next_doc_offset > doc_end {
            return Err(IrIndexError::corrupt("chunk runs past the posting list"));
        }
        self.chunks_left_in_block = self.chunks_left_in_block.saturating_sub(1);

        self.postings_read += self.header.len() as u32;
        if self.postings_read > self.info.doc_freq {
            return Err(IrIndexError::corrupt(format!(
                "posting list holds more than {} documents",
                self.info.doc_freq
            )));
        }
        self.prev_last_doc = self.header.last_doc_id().unwrap_or(self.prev_last_doc);

        self.chunk_pos_start = self.next_pos_offset;
        self.next_pos_offset += self.header.pos_bytes;
        if self.next_pos_offset > self.info.pos_pointer + self.info.pos_posting_len {
            return Err(IrIndexError::corrupt("chunk positions run past the posting list"));
        }
        self.index = None;
        self.pos_doc = None;
        self.chunks_decoded += 1;
        Ok(true)
    }

    /// Level-0 skip points of the term; empty without a skip list.
    pub fn skip_points(&mut self) -> Result<Vec<SkipPoint>> {
        if self.info.skip_level == 0 {
            return Ok(Vec::new());
        }
        Ok(self.skip_reader()?.points().collect())
    }

    /// Rewind and read the first chunk header without its positions.
    pub(crate) fn raw_head(&mut self) -> Result<RawHead> {
        Posting::reset(self)?;
        let doc_in = self.doc_in.borrow_mut();
        doc_in.seek(self.info.doc_pointer)?;
        let block_chunks = match self.format {
            PostingFormat::Block => Some(doc_in.read_vint()?),
            PostingFormat::Chunk => None,
        };
        let chunk_start = doc_in.file_pointer();
        let mut header = ChunkHeader::default();
        header.read(doc_in, 0)?;
        let rest_offset = doc_in.file_pointer();
        if rest_offset > self.info.doc_end() {
            return Err(IrIndexError::corrupt("first chunk runs past the posting list"));
        }
        Ok(RawHead {
            block_chunks,
            header,
            chunk_len: rest_offset - chunk_start,
            rest_offset,
        })
    }

    /// The underlying doc and position inputs.
    pub(crate) fn inputs_mut(&mut self) -> (&mut IndexInput, &mut IndexInput) {
        (self.doc_in.borrow_mut(), self.pos_in.borrow_mut())
    }
}

impl<I: BorrowMut<IndexInput>> Posting for TermPositions<I> {
    fn doc_freq(&self) -> u32 {
        self.info.doc_freq
    }

    fn ctf(&self) -> u64 {
        self.info.ctf
    }

    fn last_doc_id(&self) -> Option<DocId> {
        (self.info.doc_freq > 0).then_some(self.info.last_doc_id + self.doc_base)
    }

    /// Decode the chunk after the current one with all its positions.
    fn decode_next_chunk(&mut self) -> Result<Option<PostingChunk>> {
        if self.exhausted || !self.load_next_chunk()? {
            self.finish();
            return Ok(None);
        }
        let pos_in = self.pos_in.borrow_mut();
        pos_in.seek(self.chunk_pos_start)?;
        let mut chunk = PostingChunk::with_capacity(self.header.len());
        for (&doc_id, &freq) in self.header.doc_ids.iter().zip(self.header.freqs.iter()) {
            chunk.doc_ids.push(doc_id + self.doc_base);
            chunk.freqs.push(freq);
            read_positions(pos_in, freq, &mut chunk.positions)?;
        }
        if pos_in.file_pointer() != self.next_pos_offset {
            return Err(IrIndexError::corrupt(format!(
                "chunk declares {} position bytes, read {}",
                self.header.pos_bytes,
                pos_in.file_pointer() - self.chunk_pos_start
            )));
        }
        // The whole chunk is consumed; the next call moves to the next one.
        self.index = Some(self.header.len() - 1);
        self.pos_doc = None;
        Ok(Some(chunk))
    }

    fn reset(&mut self) -> Result<()> {
        self.header = ChunkHeader::default();
        self.index = None;
        self.exhausted = false;
        self.postings_read = 0;
        self.prev_last_doc = 0;
        self.chunks_left_in_block = 0;
        self.next_doc_offset = self.info.doc_pointer;
        self.next_pos_offset = self.info.pos_pointer;
        self.chunk_pos_start = self.info.pos_pointer;
        self.pos_doc = None;
        if let Some(skip) = self.skip.as_mut() {
            skip.reset();
        }
        Ok(())
    }
}
