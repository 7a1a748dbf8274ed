//! Deleted-document filters.
//!
//! One [`DocFilter`] per collection marks deleted global doc ids. Bits
//! are never cleared: doc ids are not reused, and merges drop the marked
//! documents' postings while the bits stay set.

use std::collections::BTreeMap;
use std::sync::Arc;

use bit_vec::BitVec;

use crate::error::{IrIndexError, Result};
use crate::index::{CollectionId, DocId, doc_filter_file};
use crate::storage::{IndexInput, IndexOutput, Storage};

const FILTER_MAGIC: u32 = 0x4446_4C54; // "DFLT"
const FILTER_VERSION: u32 = 1;

/// A growable bit set of deleted doc ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocFilter {
    bits: BitVec,
    deleted: u64,
}

impl DocFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `doc_id` deleted; returns false if it already was.
    pub fn set(&mut self, doc_id: DocId) -> bool {
        let index = doc_id as usize;
        if index >= self.bits.len() {
            self.bits.grow(index + 1 - self.bits.len(), false);
        }
        if self.bits.get(index).unwrap_or(false) {
            return false;
        }
        self.bits.set(index, true);
        self.deleted += 1;
        true
    }

    /// Whether `doc_id` is deleted.
    pub fn test(&self, doc_id: DocId) -> bool {
        self.bits.get(doc_id as usize).unwrap_or(false)
    }

    /// Whether any doc id in `start..=end` is deleted.
    pub fn any_in(&self, start: DocId, end: DocId) -> bool {
        if self.deleted == 0 {
            return false;
        }
        let end = (end as usize).min(self.bits.len().saturating_sub(1));
        (start as usize..=end).any(|i| self.bits.get(i).unwrap_or(false))
    }

    /// Number of deleted documents.
    pub fn count(&self) -> u64 {
        self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.deleted == 0
    }

    pub fn deleted_docs(&self) -> impl Iterator<Item = DocId> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, bit)| *bit)
            .map(|(i, _)| i as DocId)
    }

    pub fn write(&self, output: &mut IndexOutput) -> Result<()> {
        output.write_u32(FILTER_MAGIC)?;
        output.write_u32(FILTER_VERSION)?;
        output.write_u64(self.bits.len() as u64)?;
        output.write_u64(self.deleted)?;
        let bytes = self.bits.to_bytes();
        output.write_u32(bytes.len() as u32)?;
        output.write_bytes(&bytes)?;
        let checksum = output.checksum();
        output.write_u32(checksum)?;
        Ok(())
    }

    pub fn read(input: &mut IndexInput) -> Result<Self> {
        let length = input.length();
        if length < 4 {
            return Err(IrIndexError::corrupt("doc filter too short"));
        }
        let body = input.read_bytes((length - 4) as usize)?;
        let checksum = input.read_u32()?;
        if crc32fast::hash(&body) != checksum {
            return Err(IrIndexError::corrupt("doc filter checksum mismatch"));
        }

        let mut body = IndexInput::from_bytes(body);
        if body.read_u32()? != FILTER_MAGIC {
            return Err(IrIndexError::corrupt("not a doc filter"));
        }
        let version = body.read_u32()?;
        if version != FILTER_VERSION {
            return Err(IrIndexError::corrupt(format!(
                "unsupported doc filter version {version}"
            )));
        }
        let bit_len = body.read_u64()? as usize;
        let deleted = body.read_u64()?;
        let byte_len = body.read_u32()? as usize;
        if byte_len != bit_len.div_ceil(8) {
            return Err(IrIndexError::corrupt("doc filter length mismatch"));
        }
        let mut bits = BitVec::from_bytes(&body.read_bytes(byte_len)?);
        bits.truncate(bit_len);

        let filter = DocFilter { bits, deleted };
        if filter.bits.iter().filter(|bit| *bit).count() as u64 != deleted {
            return Err(IrIndexError::corrupt("doc filter count mismatch"));
        }
        Ok(filter)
    }
}

/// The filters of every collection, shared between the writer, the merge
/// manager and readers.
#[derive(Debug, Clone, Default)]
pub struct DocFilters {
    filters: BTreeMap<CollectionId, Arc<DocFilter>>,
}

impl DocFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, collection: CollectionId) -> Option<&Arc<DocFilter>> {
        self.filters.get(&collection)
    }

    pub fn is_deleted(&self, collection: CollectionId, doc_id: DocId) -> bool {
        self.filters
            .get(&collection)
            .is_some_and(|filter| filter.test(doc_id))
    }

    /// Mark a document deleted; copy-on-write so readers keep their view.
    pub fn delete(&mut self, collection: CollectionId, doc_id: DocId) -> bool {
        let filter = self.filters.entry(collection).or_default();
        Arc::make_mut(filter).set(doc_id)
    }

    pub fn collections(&self) -> impl Iterator<Item = CollectionId> + '_ {
        self.filters.keys().copied()
    }

    pub fn total_deleted(&self) -> u64 {
        self.filters.values().map(|f| f.count()).sum()
    }

    /// Persist every filter as `deleted.c<collection>`.
    pub fn write(&self, storage: &dyn Storage) -> Result<()> {
        for (&collection, filter) in &self.filters {
            let name = doc_filter_file(collection);
            let (temp_name, temp) = storage.create_temp_output(&name)?;
            let mut output = IndexOutput::new(temp)?;
            filter.write(&mut output)?;
            output.close()?;
            storage.rename_file(&temp_name, &name)?;
        }
        Ok(())
    }

    /// Load the filters of `collections` that exist in `storage`.
    pub fn read<I>(storage: &dyn Storage, collections: I) -> Result<Self>
    where
        I: IntoIterator<Item = CollectionId>,
    {
        let mut filters = BTreeMap::new();
        for collection in collections {
            let name = doc_filter_file(collection);
            if !storage.file_exists(&name) {
                continue;
            }
            let mut input = IndexInput::new(storage.open_input(&name)?)?;
            filters.insert(collection, Arc::new(DocFilter::read(&mut input)?));
        }
        Ok(DocFilters { filters })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    #[test]
    fn test_set_and_test() {
        let mut filter = DocFilter::new();
        assert!(!filter.test(1000));
        assert!(filter.set(10));
        assert!(!filter.set(10));
        assert!(filter.set(3));
        assert!(filter.test(10));
        assert!(!filter.test(11));
        assert_eq!(filter.count(), 2);
        assert!(filter.any_in(0, 5));
        assert!(!filter.any_in(4, 9));
        assert!(filter.any_in(4, 100));
        assert_eq!(filter.deleted_docs().collect::<Vec<_>>(), vec![3, 10]);
    }

    #[test]
    fn test_filters_round_trip() {
        let storage = MemoryStorage::new_default();
        let mut filters = DocFilters::new();
        filters.delete(0, 7);
        filters.delete(0, 70);
        filters.delete(3, 1);
        filters.write(&storage).unwrap();
        assert!(storage.file_exists("deleted.c0"));
        assert!(storage.file_exists("deleted.c3"));

        let loaded = DocFilters::read(&storage, [0, 1, 3]).unwrap();
        assert!(loaded.is_deleted(0, 70));
        assert!(loaded.is_deleted(3, 1));
        assert!(!loaded.is_deleted(1, 1));
        assert_eq!(loaded.total_deleted(), 3);
        assert_eq!(loaded.get(0).map(|f| f.as_ref()), filters.get(0).map(|f| f.as_ref()));
    }

    #[test]
    fn test_corrupt_filter_detected() {
        let storage = MemoryStorage::new_default();
        let mut filter = DocFilter::new();
        filter.set(5);
        let mut output = IndexOutput::new(storage.create_output("f").unwrap()).unwrap();
        filter.write(&mut output).unwrap();
        output.close().unwrap();

        let mut input = IndexInput::new(storage.open_input("f").unwrap()).unwrap();
        let mut bytes = input.read_bytes(input.length() as usize).unwrap();
        bytes[24] ^= 0xFF;
        let err = DocFilter::read(&mut IndexInput::from_bytes(bytes)).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_delete_is_copy_on_write() {
        let mut filters = DocFilters::new();
        filters.delete(0, 1);
        let view = filters.clone();
        filters.delete(0, 2);
        assert!(!view.is_deleted(0, 2));
        assert!(filters.is_deleted(0, 2));
    }
}
