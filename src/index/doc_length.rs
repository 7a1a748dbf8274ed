//! Per-document field lengths (number of indexed positions).
//!
//! Stored as `vint count` followed by `vint doc delta, vint length` pairs
//! in increasing doc id order.

use crate::error::{IrIndexError, Result};
use crate::index::DocId;
use crate::storage::{IndexInput, IndexOutput};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocLengths {
    entries: Vec<(DocId, u32)>,
}

impl DocLengths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the length of a document newer than every recorded one.
    pub fn record(&mut self, doc_id: DocId, length: u32) -> Result<()> {
        if let Some(&(last, _)) = self.entries.last() {
            if doc_id <= last {
                return Err(IrIndexError::invalid_argument(format!(
                    "doc length for {doc_id} recorded after {last}"
                )));
            }
        }
        self.entries.push((doc_id, length));
        Ok(())
    }

    /// Drop the entry of `doc_id` if it is the newest.
    pub fn rollback_document(&mut self, doc_id: DocId) {
        if self.entries.last().is_some_and(|&(last, _)| last == doc_id) {
            self.entries.pop();
        }
    }

    pub fn get(&self, doc_id: DocId) -> Option<u32> {
        self.entries
            .binary_search_by_key(&doc_id, |&(doc, _)| doc)
            .ok()
            .map(|i| self.entries[i].1)
    }

    pub fn last_doc_id(&self) -> Option<DocId> {
        self.entries.last().map(|&(doc, _)| doc)
    }

    pub fn iter(&self) -> impl Iterator<Item = (DocId, u32)> + '_ {
        self.entries.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all lengths.
    pub fn total_length(&self) -> u64 {
        self.entries.iter().map(|&(_, len)| len as u64).sum()
    }

    pub fn memory_usage(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<(DocId, u32)>()
    }

    /// Append the entries of `other` shifted by `doc_shift`, keeping those
    /// for which `keep` returns true.
    pub fn append_shifted<F>(&mut self, other: &DocLengths, doc_shift: DocId, mut keep: F) -> Result<()>
    where
        F: FnMut(DocId) -> bool,
    {
        for (doc_id, length) in other.iter() {
            if !keep(doc_id) {
                continue;
            }
            let shifted = doc_id
                .checked_add(doc_shift)
                .ok_or_else(|| IrIndexError::merge("rebased doc id overflows u32"))?;
            self.record(shifted, length)?;
        }
        Ok(())
    }

    pub fn write(&self, output: &mut IndexOutput) -> Result<()> {
        output.write_vint(self.entries.len() as u32)?;
        let mut prev = 0;
        for &(doc_id, length) in &self.entries {
            output.write_vint(doc_id - prev)?;
            output.write_vint(length)?;
            prev = doc_id;
        }
        Ok(())
    }

    pub fn read(input: &mut IndexInput) -> Result<Self> {
        let count = input.read_vint()? as usize;
        if count as u64 > input.length() {
            return Err(IrIndexError::corrupt(format!("{count} doc lengths in a short file")));
        }
        let mut entries = Vec::with_capacity(count);
        let mut prev: DocId = 0;
        for i in 0..count {
            let delta = input.read_vint()?;
            if i > 0 && delta == 0 {
                return Err(IrIndexError::corrupt("doc lengths not increasing"));
            }
            let doc_id = prev
                .checked_add(delta)
                .ok_or_else(|| IrIndexError::corrupt("doc length delta overflows u32"))?;
            entries.push((doc_id, input.read_vint()?));
            prev = doc_id;
        }
        Ok(DocLengths { entries })
    }
}
