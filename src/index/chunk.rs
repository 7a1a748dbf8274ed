//! Chunk encoding of postings.
//!
//! A chunk holds up to `chunk_capacity` postings of one term. In the doc
//! stream it is laid out as
//!
//! ```text
//! vint n | n doc deltas | n freqs | vint pos_bytes
//! ```
//!
//! The first delta is taken from the previous chunk's last doc id (0 before
//! the first chunk), so the delta chain runs across chunk boundaries. The
//! chunk's positions go to the position stream, `freq` var-ints per
//! document, first absolute and the rest deltas inside that document.

use crate::error::{IrIndexError, Result};
use crate::index::DocId;
use crate::storage::IndexInput;
use crate::util::varint::{decode_u32_at, encode_u32_into};

/// Buffered postings of one term, not yet encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostingChunk {
    pub doc_ids: Vec<DocId>,
    pub freqs: Vec<u32>,
    /// Positions of all documents, concatenated in doc order.
    pub positions: Vec<u32>,
}

impl PostingChunk {
    pub fn with_capacity(capacity: usize) -> Self {
        PostingChunk {
            doc_ids: Vec::with_capacity(capacity),
            freqs: Vec::with_capacity(capacity),
            positions: Vec::new(),
        }
    }

    /// Number of documents in the chunk.
    pub fn len(&self) -> usize {
        self.doc_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }

    pub fn last_doc_id(&self) -> Option<DocId> {
        self.doc_ids.last().copied()
    }

    pub fn clear(&mut self) {
        self.doc_ids.clear();
        self.freqs.clear();
        self.positions.clear();
    }

    /// Start a new document with no positions yet.
    pub fn push_doc(&mut self, doc_id: DocId) {
        self.doc_ids.push(doc_id);
        self.freqs.push(0);
    }

    /// Add a position to the last document.
    pub fn push_position(&mut self, position: u32) {
        if let Some(freq) = self.freqs.last_mut() {
            *freq += 1;
            self.positions.push(position);
        }
    }

    /// Add a whole posting.
    pub fn push_posting(&mut self, doc_id: DocId, positions: &[u32]) {
        self.doc_ids.push(doc_id);
        self.freqs.push(positions.len() as u32);
        self.positions.extend_from_slice(positions);
    }

    /// Remove the last document and its positions, returning its id and freq.
    pub fn pop_doc(&mut self) -> Option<(DocId, u32)> {
        let doc_id = self.doc_ids.pop()?;
        let freq = self.freqs.pop().unwrap_or(0);
        self.positions
            .truncate(self.positions.len().saturating_sub(freq as usize));
        Some((doc_id, freq))
    }

    /// Iterate `(doc_id, freq, positions)` triples.
    pub fn postings(&self) -> impl Iterator<Item = (DocId, u32, &[u32])> + '_ {
        let mut offset = 0usize;
        self.doc_ids
            .iter()
            .zip(self.freqs.iter())
            .map(move |(&doc_id, &freq)| {
                let start = offset;
                offset += freq as usize;
                (doc_id, freq, &self.positions[start..offset])
            })
    }

    /// Encode the chunk after a chunk whose last doc id was `prev_last_doc`.
    ///
    /// Doc bytes are appended to `doc_out` and position bytes to `pos_out`;
    /// returns the number of position bytes written.
    pub fn encode(
        &self,
        prev_last_doc: DocId,
        doc_out: &mut Vec<u8>,
        pos_out: &mut Vec<u8>,
    ) -> Result<u64> {
        let pos_start = pos_out.len();
        for (_, _, positions) in self.postings() {
            encode_positions(positions, pos_out)?;
        }
        let pos_bytes = (pos_out.len() - pos_start) as u64;
        encode_doc_part(&self.doc_ids, &self.freqs, pos_bytes, prev_last_doc, doc_out)?;
        Ok(pos_bytes)
    }

    /// Decode a chunk from contiguous doc and position buffers.
    pub fn decode(
        doc_bytes: &[u8],
        doc_pos: &mut usize,
        pos_bytes: &[u8],
        pos_pos: &mut usize,
        prev_last_doc: DocId,
    ) -> Result<PostingChunk> {
        let header = ChunkHeader::decode_from(doc_bytes, doc_pos, prev_last_doc)?;
        let start = *pos_pos;
        let mut chunk = PostingChunk::with_capacity(header.len());
        for (&doc_id, &freq) in header.doc_ids.iter().zip(header.freqs.iter()) {
            chunk.push_doc(doc_id);
            let mut prev = 0u32;
            for i in 0..freq {
                let value = decode_u32_at(pos_bytes, pos_pos)?;
                let position = if i == 0 { value } else { add_delta(prev, value)? };
                chunk.push_position(position);
                prev = position;
            }
        }
        if (*pos_pos - start) as u64 != header.pos_bytes {
            return Err(IrIndexError::corrupt(format!(
                "chunk declares {} position bytes, decoded {}",
                header.pos_bytes,
                *pos_pos - start
            )));
        }
        Ok(chunk)
    }
}

fn encode_doc_part(
    doc_ids: &[DocId],
    freqs: &[u32],
    pos_bytes: u64,
    prev_last_doc: DocId,
    doc_out: &mut Vec<u8>,
) -> Result<()> {
    let pos_bytes = u32::try_from(pos_bytes)
        .map_err(|_| IrIndexError::invalid_argument("chunk positions exceed u32 bytes"))?;
    encode_u32_into(doc_ids.len() as u32, doc_out);
    let mut prev = prev_last_doc;
    for (i, &doc_id) in doc_ids.iter().enumerate() {
        let ordered = if i == 0 { doc_id >= prev } else { doc_id > prev };
        if !ordered {
            return Err(IrIndexError::invalid_argument(format!(
                "doc id {doc_id} out of order after {prev}"
            )));
        }
        encode_u32_into(doc_id - prev, doc_out);
        prev = doc_id;
    }
    for &freq in freqs {
        encode_u32_into(freq, doc_out);
    }
    encode_u32_into(pos_bytes, doc_out);
    Ok(())
}

/// Encode one document's positions: first absolute, the rest deltas.
pub fn encode_positions(positions: &[u32], out: &mut Vec<u8>) -> Result<()> {
    let mut prev = 0u32;
    for (i, &position) in positions.iter().enumerate() {
        if i == 0 {
            encode_u32_into(position, out);
        } else {
            if position < prev {
                return Err(IrIndexError::invalid_argument(format!(
                    "position {position} out of order after {prev}"
                )));
            }
            encode_u32_into(position - prev, out);
        }
        prev = position;
    }
    Ok(())
}

/// Read `freq` positions of one document from `input` into `out`.
pub fn read_positions(input: &mut IndexInput, freq: u32, out: &mut Vec<u32>) -> Result<()> {
    let mut prev = 0u32;
    for i in 0..freq {
        let value = input.read_vint()?;
        let position = if i == 0 { value } else { add_delta(prev, value)? };
        out.push(position);
        prev = position;
    }
    Ok(())
}

/// Skip `count` position var-ints in `input`.
pub fn skip_positions(input: &mut IndexInput, count: u64) -> Result<()> {
    for _ in 0..count {
        input.read_vint()?;
    }
    Ok(())
}

fn add_delta(prev: u32, delta: u32) -> Result<u32> {
    prev.checked_add(delta)
        .ok_or_else(|| IrIndexError::corrupt("delta overflows u32"))
}

/// Reject a posting count that is zero or that `remaining` bytes cannot
/// hold; every posting takes at least a delta byte and a freq byte.
fn check_chunk_len(n: usize, remaining: u64) -> Result<()> {
    if n == 0 {
        return Err(IrIndexError::corrupt("empty chunk"));
    }
    if n as u64 > remaining / 2 {
        return Err(IrIndexError::corrupt(format!(
            "chunk claims {n} postings in {remaining} bytes"
        )));
    }
    Ok(())
}

/// The doc-stream part of a decoded chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkHeader {
    pub doc_ids: Vec<DocId>,
    pub freqs: Vec<u32>,
    /// Bytes the chunk occupies in the position stream.
    pub pos_bytes: u64,
}

impl ChunkHeader {
    pub fn len(&self) -> usize {
        self.doc_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }

    pub fn last_doc_id(&self) -> Option<DocId> {
        self.doc_ids.last().copied()
    }

    /// Decode a chunk header from `input`, reusing this header's buffers.
    pub fn read(&mut self, input: &mut IndexInput, prev_last_doc: DocId) -> Result<()> {
        self.doc_ids.clear();
        self.freqs.clear();

        let n = input.read_vint()? as usize;
        check_chunk_len(n, input.length().saturating_sub(input.file_pointer()))?;
        let mut prev = prev_last_doc;
        for _ in 0..n {
            let doc_id = add_delta(prev, input.read_vint()?)?;
            self.doc_ids.push(doc_id);
            prev = doc_id;
        }
        for _ in 0..n {
            self.freqs.push(input.read_vint()?);
        }
        self.pos_bytes = input.read_vint()? as u64;
        Ok(())
    }

    /// Encode the header after a chunk whose last doc id was `prev_last_doc`.
    pub fn encode(&self, prev_last_doc: DocId, doc_out: &mut Vec<u8>) -> Result<()> {
        encode_doc_part(&self.doc_ids, &self.freqs, self.pos_bytes, prev_last_doc, doc_out)
    }

    /// Decode a chunk header from a byte slice.
    pub fn decode_from(bytes: &[u8], pos: &mut usize, prev_last_doc: DocId) -> Result<Self> {
        let n = decode_u32_at(bytes, pos)? as usize;
        check_chunk_len(n, bytes.len().saturating_sub(*pos) as u64)?;
        let mut header = ChunkHeader {
            doc_ids: Vec::with_capacity(n),
            freqs: Vec::with_capacity(n),
            pos_bytes: 0,
        };
        let mut prev = prev_last_doc;
        for _ in 0..n {
            let doc_id = add_delta(prev, decode_u32_at(bytes, pos)?)?;
            header.doc_ids.push(doc_id);
            prev = doc_id;
        }
        for _ in 0..n {
            header.freqs.push(decode_u32_at(bytes, pos)?);
        }
        header.pos_bytes = decode_u32_at(bytes, pos)? as u64;
        Ok(header)
    }
}
