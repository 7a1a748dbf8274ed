//! Per-field accumulation for the open barrel.
//!
//! A [`FieldIndexer`] owns every term accumulator of one (collection, field)
//! while its barrel is open, or an [`ExternalSorter`] when the field
//! indexes through sorted runs. At flush time it writes the field's four
//! barrel files.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::error::{IrIndexError, Result};
use crate::index::config::{IndexingMode, PostingConfig};
use crate::index::doc_length::DocLengths;
use crate::index::external_sort::ExternalSorter;
use crate::index::posting::{InMemoryPosting, PostingOutputs, PostingSnapshot, TermPositions};
use crate::index::term_info::VocabularyWriter;
use crate::index::{
    DocId, FieldKey, TermId, doc_length_file, doc_posting_file, position_posting_file,
    vocabulary_file,
};
use crate::storage::{IndexOutput, Storage};
use crate::util::budget::MemoryBudget;

/// The four output files of one field of a barrel under construction.
#[derive(Debug)]
pub struct FieldOutputs {
    pub vocabulary: IndexOutput,
    pub doc: IndexOutput,
    pub pos: IndexOutput,
    pub lengths: IndexOutput,
}

impl FieldOutputs {
    /// Create (truncating) the files of `key` in `barrel`.
    pub fn create(storage: &dyn Storage, barrel: &str, key: FieldKey) -> Result<Self> {
        Ok(FieldOutputs {
            vocabulary: IndexOutput::new(storage.create_output(&vocabulary_file(barrel, key))?)?,
            doc: IndexOutput::new(storage.create_output(&doc_posting_file(barrel, key))?)?,
            pos: IndexOutput::new(storage.create_output(&position_posting_file(barrel, key))?)?,
            lengths: IndexOutput::new(storage.create_output(&doc_length_file(barrel, key))?)?,
        })
    }

    /// Split out the vocabulary writer and the posting streams.
    pub fn split(&mut self) -> (VocabularyWriter<'_>, PostingOutputs<'_>) {
        (
            VocabularyWriter::new(&mut self.vocabulary),
            PostingOutputs {
                doc: &mut self.doc,
                pos: &mut self.pos,
            },
        )
    }

    /// Total bytes written to all four files.
    pub fn bytes_written(&self) -> u64 {
        self.vocabulary.file_pointer()
            + self.doc.file_pointer()
            + self.pos.file_pointer()
            + self.lengths.file_pointer()
    }

    /// Sync and close every file.
    pub fn close(self) -> Result<()> {
        self.vocabulary.close()?;
        self.doc.close()?;
        self.pos.close()?;
        self.lengths.close()
    }
}

/// What writing one field produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldWriteStats {
    pub terms: u64,
    pub postings: u64,
    pub bytes: u64,
}

/// Term accumulators of one field of the open barrel.
///
/// All methods take `&self`: the term map sits behind a read/write lock so
/// real-time readers can snapshot postings while the writer inserts.
#[derive(Debug)]
pub struct FieldIndexer {
    key: FieldKey,
    doc_base: DocId,
    config: PostingConfig,
    budget: MemoryBudget,
    terms: RwLock<AHashMap<TermId, InMemoryPosting>>,
    doc_lengths: RwLock<DocLengths>,
    sorter: Option<Mutex<ExternalSorter>>,
}

impl FieldIndexer {
    /// Create an indexer for `key`; `doc_base` is the global id of local
    /// doc 0 in this barrel.
    pub fn new(
        key: FieldKey,
        doc_base: DocId,
        config: PostingConfig,
        mode: IndexingMode,
        budget: MemoryBudget,
        storage: &Arc<dyn Storage>,
        barrel: &str,
    ) -> Self {
        let sorter = match mode {
            IndexingMode::InMemory => None,
            IndexingMode::ExternalSort { run_size } => Some(Mutex::new(ExternalSorter::new(
                Arc::clone(storage),
                format!("{barrel}.c{}f{}.run", key.collection, key.field),
                run_size,
                budget.clone(),
            ))),
        };
        FieldIndexer {
            key,
            doc_base,
            config,
            budget,
            terms: RwLock::new(AHashMap::new()),
            doc_lengths: RwLock::new(DocLengths::new()),
            sorter,
        }
    }

    pub fn key(&self) -> FieldKey {
        self.key
    }

    pub fn doc_base(&self) -> DocId {
        self.doc_base
    }

    /// Number of documents that reached this field.
    pub fn doc_count(&self) -> usize {
        self.doc_lengths.read().len()
    }

    /// Number of distinct terms held in memory.
    pub fn term_count(&self) -> usize {
        self.terms.read().len()
    }

    /// Approximate bytes held by the accumulators.
    pub fn memory_usage(&self) -> usize {
        let postings: usize = self.terms.read().values().map(|p| p.memory_usage()).sum();
        let sorted = self
            .sorter
            .as_ref()
            .map(|s| s.lock().memory_usage() as usize)
            .unwrap_or(0);
        postings + sorted + self.doc_lengths.read().memory_usage()
    }

    /// Index the `(term, position)` pairs of one document.
    ///
    /// `local_doc` must be newer than every document seen so far. On error
    /// the field holds no trace of the document.
    pub fn add_field(&self, local_doc: DocId, terms: &[(TermId, u32)]) -> Result<()> {
        let mut lengths = self.doc_lengths.write();
        if let Some(last) = lengths.last_doc_id() {
            if local_doc <= last {
                return Err(IrIndexError::invalid_argument(format!(
                    "doc {} reached field {:?} after doc {}",
                    local_doc + self.doc_base,
                    self.key,
                    last + self.doc_base
                )));
            }
        }
        let length = u32::try_from(terms.len())
            .map_err(|_| IrIndexError::invalid_argument("field has more than u32::MAX terms"))?;

        match &self.sorter {
            Some(sorter) => sorter.lock().add_document(local_doc, terms)?,
            None => self.accumulate(local_doc, terms)?,
        }
        lengths.record(local_doc, length)
    }

    fn accumulate(&self, local_doc: DocId, terms: &[(TermId, u32)]) -> Result<()> {
        let mut map = self.terms.write();
        let mut touched = AHashSet::new();
        let mut result = Ok(());
        for &(term, position) in terms {
            touched.insert(term);
            let posting = map
                .entry(term)
                .or_insert_with(|| InMemoryPosting::new(self.config, &self.budget));
            if let Err(e) = posting.add(local_doc, position) {
                result = Err(e);
                break;
            }
        }
        if result.is_err() {
            for term in touched {
                if let Some(posting) = map.get_mut(&term) {
                    posting.rollback_document(local_doc);
                    if posting.is_empty() {
                        map.remove(&term);
                    }
                }
            }
        }
        result
    }

    /// Remove every posting of `local_doc`, the newest document.
    pub fn rollback_document(&self, local_doc: DocId) {
        let mut lengths = self.doc_lengths.write();
        if lengths.last_doc_id() != Some(local_doc) {
            return;
        }
        lengths.rollback_document(local_doc);
        match &self.sorter {
            Some(sorter) => sorter.lock().rollback_document(local_doc),
            None => {
                let mut map = self.terms.write();
                map.retain(|_, posting| {
                    if posting.last_doc_id() == Some(local_doc) {
                        posting.rollback_document(local_doc);
                    }
                    !posting.is_empty()
                });
            }
        }
    }

    /// A consistent snapshot of one term's postings, local doc ids.
    ///
    /// `None` for unknown terms and for fields indexed through external
    /// sort, whose postings do not exist before flush.
    pub fn term_reader(&self, term: TermId) -> Result<Option<PostingSnapshot>> {
        let map = self.terms.read();
        map.get(&term).map(|posting| posting.snapshot()).transpose()
    }

    /// Iterate one term's in-memory postings with global doc ids.
    pub fn term_positions(&self, term: TermId) -> Result<Option<TermPositions>> {
        Ok(self
            .term_reader(term)?
            .map(|snapshot| snapshot.term_positions(self.doc_base)))
    }

    /// Document frequency of `term` so far.
    pub fn doc_freq(&self, term: TermId) -> u32 {
        self.terms.read().get(&term).map(|p| p.doc_freq()).unwrap_or(0)
    }

    /// Length of a document in this field, local doc id.
    pub fn doc_length(&self, local_doc: DocId) -> Option<u32> {
        self.doc_lengths.read().get(local_doc)
    }

    /// Write vocabulary, postings and doc lengths, draining the field.
    pub fn write(&self, outputs: &mut FieldOutputs) -> Result<FieldWriteStats> {
        let mut stats = match &self.sorter {
            Some(sorter) => self.write_sorted(&mut sorter.lock(), outputs)?,
            None => self.write_accumulated(outputs)?,
        };
        self.doc_lengths.read().write(&mut outputs.lengths)?;
        stats.bytes = outputs.bytes_written();
        debug!(
            "wrote field {:?}: {} terms, {} postings, {} bytes",
            self.key, stats.terms, stats.postings, stats.bytes
        );
        Ok(stats)
    }

    fn write_accumulated(&self, outputs: &mut FieldOutputs) -> Result<FieldWriteStats> {
        let mut map = self.terms.write();
        let mut term_ids: Vec<TermId> = map.keys().copied().collect();
        term_ids.sort_unstable();

        let mut stats = FieldWriteStats::default();
        let (mut vocabulary, mut postings) = outputs.split();
        for term in term_ids {
            let Some(posting) = map.get(&term) else {
                continue;
            };
            let info = posting.write(&mut postings)?;
            vocabulary.add(term, &info)?;
            stats.postings += info.doc_freq as u64;
        }
        stats.terms = vocabulary.finish()?;
        map.clear();
        Ok(stats)
    }

    fn write_sorted(
        &self,
        sorter: &mut ExternalSorter,
        outputs: &mut FieldOutputs,
    ) -> Result<FieldWriteStats> {
        let mut sorted = sorter.sorted()?;
        let mut stats = FieldWriteStats::default();
        let (mut vocabulary, mut postings) = outputs.split();

        let mut current: Option<(TermId, InMemoryPosting)> = None;
        while let Some((term, doc, position)) = sorted.next_tuple()? {
            if current.as_ref().is_some_and(|(t, _)| *t != term) {
                if let Some((done, posting)) = current.take() {
                    let info = posting.write(&mut postings)?;
                    vocabulary.add(done, &info)?;
                    stats.postings += info.doc_freq as u64;
                }
            }
            let (_, posting) = current
                .get_or_insert_with(|| (term, InMemoryPosting::new(self.config, &self.budget)));
            posting.add(doc, position)?;
        }
        if let Some((done, posting)) = current.take() {
            let info = posting.write(&mut postings)?;
            vocabulary.add(done, &info)?;
            stats.postings += info.doc_freq as u64;
        }
        stats.terms = vocabulary.finish()?;
        Ok(stats)
    }

    /// Drop everything without writing; deletes external-sort runs.
    pub fn discard(&self) -> Result<()> {
        self.terms.write().clear();
        if let Some(sorter) = &self.sorter {
            sorter.lock().clear()?;
        }
        Ok(())
    }
}
