//! The read path over sealed barrels.
//!
//! [`FieldReader`] loads one field of one barrel, [`BarrelReader`] groups
//! the fields of a barrel and [`IndexReader`] spans every searchable barrel
//! of an index, hiding deleted documents.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;

use crate::error::Result;
use crate::index::barrel::{Barrel, BarrelsInfo};
use crate::index::config::PostingFormat;
use crate::index::doc_filter::{DocFilter, DocFilters};
use crate::index::doc_length::DocLengths;
use crate::index::posting::{OnDiskPosting, TermPositions};
use crate::index::term_info::{TermInfo, Vocabulary};
use crate::index::{
    CollectionId, DocId, FieldId, FieldKey, TermId, TermKey, doc_length_file, doc_posting_file,
    position_posting_file, vocabulary_file,
};
use crate::storage::{IndexInput, Storage};

/// One field of one barrel: vocabulary, doc lengths and the two posting
/// streams.
#[derive(Debug)]
pub struct FieldReader {
    key: FieldKey,
    format: PostingFormat,
    vocabulary: Vocabulary,
    lengths: DocLengths,
    doc_in: IndexInput,
    pos_in: IndexInput,
}

impl FieldReader {
    pub fn open(storage: &dyn Storage, barrel: &Barrel, key: FieldKey) -> Result<Self> {
        let name = barrel.name.as_str();
        let mut voc_in = IndexInput::new(storage.open_input(&vocabulary_file(name, key))?)?;
        let vocabulary = Vocabulary::read(&mut voc_in)?;
        let mut dln_in = IndexInput::new(storage.open_input(&doc_length_file(name, key))?)?;
        let lengths = DocLengths::read(&mut dln_in)?;
        Ok(FieldReader {
            key,
            format: barrel.posting_format,
            vocabulary,
            lengths,
            doc_in: IndexInput::new(storage.open_input(&doc_posting_file(name, key))?)?,
            pos_in: IndexInput::new(storage.open_input(&position_posting_file(name, key))?)?,
        })
    }

    pub fn key(&self) -> FieldKey {
        self.key
    }

    pub fn format(&self) -> PostingFormat {
        self.format
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// Doc lengths, local doc ids.
    pub fn lengths(&self) -> &DocLengths {
        &self.lengths
    }

    pub fn term_info(&self, term: TermId) -> Option<TermInfo> {
        self.vocabulary.get(term).copied()
    }

    /// An independent cursor over `term`, doc ids shifted by `doc_base`.
    pub fn term_positions(&self, term: TermId, doc_base: DocId) -> Result<Option<TermPositions>> {
        let Some(info) = self.term_info(term) else {
            return Ok(None);
        };
        Ok(Some(TermPositions::new(
            self.doc_in.clone_input()?,
            self.pos_in.clone_input()?,
            info,
            self.format,
            doc_base,
        )))
    }

    /// A cursor borrowing this reader's streams, local doc ids.
    pub fn on_disk(&mut self, info: TermInfo) -> OnDiskPosting<'_> {
        TermPositions::new(&mut self.doc_in, &mut self.pos_in, info, self.format, 0)
    }
}

/// Every field of one sealed barrel.
#[derive(Debug)]
pub struct BarrelReader {
    barrel: Barrel,
    fields: BTreeMap<FieldKey, FieldReader>,
}

impl BarrelReader {
    pub fn open(storage: &dyn Storage, barrel: &Barrel) -> Result<Self> {
        let mut fields = BTreeMap::new();
        for &key in &barrel.fields {
            fields.insert(key, FieldReader::open(storage, barrel, key)?);
        }
        Ok(BarrelReader {
            barrel: barrel.clone(),
            fields,
        })
    }

    pub fn barrel(&self) -> &Barrel {
        &self.barrel
    }

    pub fn field(&self, key: FieldKey) -> Option<&FieldReader> {
        self.fields.get(&key)
    }

    pub fn field_mut(&mut self, key: FieldKey) -> Option<&mut FieldReader> {
        self.fields.get_mut(&key)
    }

    pub fn term_info(&self, key: TermKey) -> Option<TermInfo> {
        self.field(key.field_key())?.term_info(key.term)
    }

    /// Document frequency in this barrel, deleted documents included.
    pub fn doc_freq(&self, key: TermKey) -> u32 {
        self.term_info(key).map(|info| info.doc_freq).unwrap_or(0)
    }

    /// Iterate `key` with global doc ids.
    pub fn term_positions(&self, key: TermKey) -> Result<Option<TermPositions>> {
        let (Some(field), Some(base)) = (
            self.field(key.field_key()),
            self.barrel.base_doc_id(key.collection),
        ) else {
            return Ok(None);
        };
        field.term_positions(key.term, base)
    }

    /// Whether the barrel covers global `doc_id` of `collection`.
    pub fn covers(&self, collection: CollectionId, doc_id: DocId) -> bool {
        match (
            self.barrel.base_doc_id(collection),
            self.barrel.max_doc_id(collection),
        ) {
            (Some(base), Some(max)) => base <= doc_id && doc_id <= max,
            _ => false,
        }
    }

    /// Length of a document in one field, global doc id.
    pub fn doc_length(&self, collection: CollectionId, field: FieldId, doc_id: DocId) -> Option<u32> {
        let base = self.barrel.base_doc_id(collection)?;
        let local = doc_id.checked_sub(base)?;
        self.field(FieldKey::new(collection, field))?
            .lengths()
            .get(local)
    }
}

/// A read-only view of every searchable barrel of an index.
#[derive(Debug)]
pub struct IndexReader {
    barrels: Vec<BarrelReader>,
    filters: DocFilters,
}

impl IndexReader {
    /// Open the barrels and doc filters the manifest names.
    pub fn open(storage: &dyn Storage) -> Result<Self> {
        let manifest = BarrelsInfo::read(storage)?;
        let filters = DocFilters::read(storage, manifest.collections())?;
        let reader = Self::with_manifest(storage, &manifest, filters)?;
        debug!("opened reader over {} barrels", reader.barrels.len());
        Ok(reader)
    }

    /// Open the searchable barrels of `manifest`.
    pub fn with_manifest(
        storage: &dyn Storage,
        manifest: &BarrelsInfo,
        filters: DocFilters,
    ) -> Result<Self> {
        let barrels = manifest
            .iter()
            .filter(|barrel| barrel.searchable)
            .map(|barrel| BarrelReader::open(storage, barrel))
            .collect::<Result<Vec<_>>>()?;
        Ok(IndexReader { barrels, filters })
    }

    pub fn barrels(&self) -> &[BarrelReader] {
        &self.barrels
    }

    pub fn barrel_count(&self) -> usize {
        self.barrels.len()
    }

    pub fn filters(&self) -> &DocFilters {
        &self.filters
    }

    pub fn is_deleted(&self, collection: CollectionId, doc_id: DocId) -> bool {
        self.filters.is_deleted(collection, doc_id)
    }

    /// Documents over all barrels, deleted ones included.
    pub fn max_doc_count(&self) -> u64 {
        self.barrels.iter().map(|b| b.barrel().doc_count).sum()
    }

    /// Summed document frequency; deleted documents still count until a
    /// merge drops them.
    pub fn doc_freq(&self, key: TermKey) -> u64 {
        self.barrels.iter().map(|b| b.doc_freq(key) as u64).sum()
    }

    /// Iterate a term across every barrel, skipping deleted documents.
    pub fn term_positions(&self, key: TermKey) -> Result<Option<MultiTermPositions>> {
        let mut parts = Vec::new();
        for barrel in &self.barrels {
            if let Some(positions) = barrel.term_positions(key)? {
                parts.push(positions);
            }
        }
        if parts.is_empty() {
            return Ok(None);
        }
        Ok(Some(MultiTermPositions::new(
            parts,
            self.filters.get(key.collection).cloned(),
        )))
    }

    /// Length of a live document in one field.
    pub fn doc_length(&self, collection: CollectionId, field: FieldId, doc_id: DocId) -> Option<u32> {
        if self.is_deleted(collection, doc_id) {
            return None;
        }
        self.barrels
            .iter()
            .find(|b| b.covers(collection, doc_id))?
            .doc_length(collection, field, doc_id)
    }
}

/// One term's postings across several barrels, in doc id order.
///
/// Parts must cover increasing, disjoint doc id ranges. Deleted documents
/// are never reported.
#[derive(Debug)]
pub struct MultiTermPositions {
    parts: Vec<TermPositions>,
    current: usize,
    deleted: Option<Arc<DocFilter>>,
}

impl MultiTermPositions {
    pub fn new(parts: Vec<TermPositions>, deleted: Option<Arc<DocFilter>>) -> Self {
        MultiTermPositions {
            parts,
            current: 0,
            deleted,
        }
    }

    /// Summed document frequency of the parts.
    pub fn doc_freq(&self) -> u64 {
        self.parts.iter().map(|p| p.term_info().doc_freq as u64).sum()
    }

    fn is_deleted(&self, doc_id: DocId) -> bool {
        self.deleted.as_ref().is_some_and(|f| f.test(doc_id))
    }

    pub fn doc(&self) -> Option<DocId> {
        self.parts.get(self.current)?.doc()
    }

    pub fn freq(&self) -> u32 {
        self.parts.get(self.current).map(|p| p.freq()).unwrap_or(0)
    }

    /// Advance to the next live document; false at the end.
    pub fn next(&mut self) -> Result<bool> {
        while let Some(part) = self.parts.get_mut(self.current) {
            if part.next()? {
                match part.doc() {
                    Some(doc) if self.is_deleted(doc) => continue,
                    _ => return Ok(true),
                }
            }
            self.current += 1;
        }
        Ok(false)
    }

    /// Advance to the first live document `>= target`.
    pub fn skip_to(&mut self, target: DocId) -> Result<bool> {
        while let Some(part) = self.parts.get_mut(self.current) {
            let info = part.term_info();
            if info.last_doc_id + part.doc_base() < target {
                self.current += 1;
                continue;
            }
            if part.skip_to(target)? {
                return match part.doc() {
                    Some(doc) if self.is_deleted(doc) => self.next(),
                    _ => Ok(true),
                };
            }
            self.current += 1;
        }
        Ok(false)
    }

    /// Next position of the current document.
    pub fn next_position(&mut self) -> Result<Option<u32>> {
        match self.parts.get_mut(self.current) {
            Some(part) => part.next_position(),
            None => Ok(None),
        }
    }

    /// Remaining positions of the current document.
    pub fn positions(&mut self) -> Result<Vec<u32>> {
        match self.parts.get_mut(self.current) {
            Some(part) => part.positions(),
            None => Ok(Vec::new()),
        }
    }
}
