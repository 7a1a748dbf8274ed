//! Per-term metadata and the vocabulary file.
//!
//! A vocabulary file is a run of fixed-size little-endian records sorted by
//! term id, followed by a `(vocLength: u64, termCount: u64)` trailer:
//!
//! ```text
//! termId:u32 df:u32 ctf:u32 lastDocId:u32 skipLevel:u32
//! skipPointer:u64 docPointer:u64 docPostingLen:u32
//! positionPointer:u64 positionPostingLen:u32
//! ```

use crate::error::{IrIndexError, Result};
use crate::index::{DocId, TermId};
use crate::storage::{IndexInput, IndexOutput};

/// Bytes per vocabulary record.
pub const VOCABULARY_RECORD_SIZE: u64 = 52;

/// Bytes of the vocabulary trailer.
pub const VOCABULARY_TRAILER_SIZE: u64 = 16;

/// Where and how large one term's postings are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TermInfo {
    pub doc_freq: u32,
    pub ctf: u64,
    pub last_doc_id: DocId,
    /// Number of skip levels; 0 when the term has no skip list.
    pub skip_level: u32,
    /// Start of the skip list in the doc stream.
    pub skip_pointer: u64,
    /// Start of the first chunk in the doc stream.
    pub doc_pointer: u64,
    /// Chunk bytes, excluding the skip list.
    pub doc_posting_len: u64,
    pub pos_pointer: u64,
    pub pos_posting_len: u64,
}

impl TermInfo {
    /// Bytes of skip list stored in front of the chunks.
    pub fn skip_len(&self) -> u64 {
        self.doc_pointer - self.skip_pointer
    }

    /// End of the term's chunks in the doc stream.
    pub fn doc_end(&self) -> u64 {
        self.doc_pointer + self.doc_posting_len
    }

    fn write_record(&self, term_id: TermId, output: &mut IndexOutput) -> Result<()> {
        output.write_u32(term_id)?;
        output.write_u32(self.doc_freq)?;
        output.write_u32(narrow(self.ctf, "ctf")?)?;
        output.write_u32(self.last_doc_id)?;
        output.write_u32(self.skip_level)?;
        output.write_u64(self.skip_pointer)?;
        output.write_u64(self.doc_pointer)?;
        output.write_u32(narrow(self.doc_posting_len, "doc posting length")?)?;
        output.write_u64(self.pos_pointer)?;
        output.write_u32(narrow(self.pos_posting_len, "position posting length")?)?;
        Ok(())
    }

    fn read_record(input: &mut IndexInput) -> Result<(TermId, TermInfo)> {
        let term_id = input.read_u32()?;
        let info = TermInfo {
            doc_freq: input.read_u32()?,
            ctf: input.read_u32()? as u64,
            last_doc_id: input.read_u32()?,
            skip_level: input.read_u32()?,
            skip_pointer: input.read_u64()?,
            doc_pointer: input.read_u64()?,
            doc_posting_len: input.read_u32()? as u64,
            pos_pointer: input.read_u64()?,
            pos_posting_len: input.read_u32()? as u64,
        };
        if info.doc_freq == 0 || info.skip_pointer > info.doc_pointer {
            return Err(IrIndexError::corrupt(format!(
                "bad vocabulary record for term {term_id}"
            )));
        }
        Ok((term_id, info))
    }
}

fn narrow(value: u64, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| IrIndexError::invalid_operation(format!("{what} {value} exceeds u32")))
}

/// Streams vocabulary records in increasing term id order.
#[derive(Debug)]
pub struct VocabularyWriter<'a> {
    output: &'a mut IndexOutput,
    count: u64,
    last_term: Option<TermId>,
}

impl<'a> VocabularyWriter<'a> {
    pub fn new(output: &'a mut IndexOutput) -> Self {
        VocabularyWriter {
            output,
            count: 0,
            last_term: None,
        }
    }

    pub fn add(&mut self, term_id: TermId, info: &TermInfo) -> Result<()> {
        if self.last_term.is_some_and(|last| last >= term_id) {
            return Err(IrIndexError::invalid_argument(format!(
                "vocabulary term {term_id} out of order"
            )));
        }
        info.write_record(term_id, self.output)?;
        self.last_term = Some(term_id);
        self.count += 1;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Write the trailer; returns the number of terms.
    pub fn finish(self) -> Result<u64> {
        self.output.write_u64(self.count * VOCABULARY_RECORD_SIZE)?;
        self.output.write_u64(self.count)?;
        Ok(self.count)
    }
}

/// A fully loaded vocabulary, sorted by term id.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    entries: Vec<(TermId, TermInfo)>,
}

impl Vocabulary {
    pub fn read(input: &mut IndexInput) -> Result<Self> {
        let length = input.length();
        if length < VOCABULARY_TRAILER_SIZE {
            return Err(IrIndexError::corrupt("vocabulary shorter than its trailer"));
        }
        input.seek(length - VOCABULARY_TRAILER_SIZE)?;
        let voc_length = input.read_u64()?;
        let term_count = input.read_u64()?;
        if term_count.checked_mul(VOCABULARY_RECORD_SIZE) != Some(voc_length)
            || voc_length + VOCABULARY_TRAILER_SIZE != length
        {
            return Err(IrIndexError::corrupt(format!(
                "vocabulary trailer ({voc_length}, {term_count}) does not match a {length} byte file"
            )));
        }

        input.seek(0)?;
        let mut entries = Vec::with_capacity(term_count as usize);
        for _ in 0..term_count {
            let (term_id, info) = TermInfo::read_record(input)?;
            if entries
                .last()
                .is_some_and(|&(last, _): &(TermId, TermInfo)| last >= term_id)
            {
                return Err(IrIndexError::corrupt("vocabulary terms not sorted"));
            }
            entries.push((term_id, info));
        }
        Ok(Vocabulary { entries })
    }

    pub fn get(&self, term_id: TermId) -> Option<&TermInfo> {
        self.entries
            .binary_search_by_key(&term_id, |&(term, _)| term)
            .ok()
            .map(|i| &self.entries[i].1)
    }

    /// The `index`-th record in term id order.
    pub fn entry(&self, index: usize) -> Option<(TermId, TermInfo)> {
        self.entries.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TermId, &TermInfo)> + '_ {
        self.entries.iter().map(|(term, info)| (*term, info))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
