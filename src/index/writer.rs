//! Index writer.
//!
//! [`IndexWriter`] routes documents into the field indexers of the open
//! barrel, seals the barrel when its cache is full, keeps the manifest and
//! the doc filters current and triggers merges, either inline or through
//! the background [`MergeManager`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use parking_lot::RwLock;
use rayon::prelude::*;

use crate::document::Document;
use crate::error::{IrIndexError, Result};
use crate::index::barrel::{Barrel, BarrelsInfo};
use crate::index::config::IndexConfig;
use crate::index::doc_filter::DocFilters;
use crate::index::field_indexer::{FieldIndexer, FieldOutputs, FieldWriteStats};
use crate::index::merge_manager::{MergeEngine, MergeManager};
use crate::index::merge_policy;
use crate::index::merger::IndexMerger;
use crate::index::posting::PostingSnapshot;
use crate::index::reader::{IndexReader, MultiTermPositions};
use crate::index::{
    CollectionId, DocId, FieldId, FieldKey, MANIFEST_FILE, TermKey, WRITE_LOCK, barrel_of_file,
};
use crate::storage::{Storage, StorageLock};
use crate::util::budget::MemoryBudget;

/// What one flush wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Name of the sealed barrel.
    pub barrel: String,
    pub doc_count: u64,
    pub fields: usize,
    pub terms: u64,
    pub postings: u64,
    pub bytes: u64,
    pub elapsed_ms: u64,
}

/// A point-in-time summary of the index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Sealed barrels in the manifest.
    pub barrel_count: usize,

    /// Documents in sealed barrels, deleted ones included until merged away.
    pub doc_count: u64,

    /// Documents in the open barrel.
    pub buffered_docs: u64,

    /// Documents marked deleted.
    pub deleted_docs: u64,

    /// Barrels sealed by this writer.
    pub flushes: u64,

    /// Merges finished by this writer.
    pub merges: u64,

    /// Bytes the open barrel's accumulators hold.
    pub memory_used: u64,

    pub peak_memory: u64,
}

type LiveFields = Arc<RwLock<BTreeMap<FieldKey, Arc<FieldIndexer>>>>;

/// The barrel currently receiving documents.
#[derive(Debug)]
struct OpenBarrel {
    name: String,
    doc_count: u64,
    base_doc_ids: BTreeMap<CollectionId, DocId>,
    max_doc_ids: BTreeMap<CollectionId, DocId>,
    fields: BTreeMap<FieldKey, Arc<FieldIndexer>>,
}

impl OpenBarrel {
    fn new(name: String) -> Self {
        OpenBarrel {
            name,
            doc_count: 0,
            base_doc_ids: BTreeMap::new(),
            max_doc_ids: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    /// Sealed metadata of the barrel.
    fn barrel(&self, config: &IndexConfig) -> Barrel {
        let mut barrel = Barrel::new(self.name.clone(), config.posting_format);
        barrel.doc_count = self.doc_count;
        barrel.base_doc_ids = self.base_doc_ids.clone();
        barrel.max_doc_ids = self.max_doc_ids.clone();
        barrel.fields = self.fields.keys().copied().collect();
        barrel.searchable = true;
        barrel
    }

    /// Drop the accumulated postings and unpublish the fields.
    fn discard(self, live: &LiveFields) {
        live.write().clear();
        for indexer in self.fields.values() {
            if let Err(e) = indexer.discard() {
                warn!("failed to discard field {:?} of {}: {e}", indexer.key(), self.name);
            }
        }
    }
}

/// Single-writer entry point of an index.
///
/// Documents of a collection must arrive in strictly increasing doc id
/// order. Only one writer may hold an index; a second `open` fails on the
/// write lock.
#[derive(Debug)]
pub struct IndexWriter {
    storage: Arc<dyn Storage>,
    config: IndexConfig,
    budget: MemoryBudget,
    manifest: Arc<RwLock<BarrelsInfo>>,
    filters: Arc<RwLock<DocFilters>>,
    open: Option<OpenBarrel>,
    /// Field indexers of the open barrel, shared with realtime readers.
    live: LiveFields,
    engine: Arc<MergeEngine>,
    manager: Option<MergeManager>,
    filters_dirty: bool,
    flushes: u64,
    _lock: Box<dyn StorageLock>,
}

impl IndexWriter {
    /// Open or create the index in `storage`.
    ///
    /// Reloads the manifest and doc filters and deletes barrel and
    /// temporary files the manifest does not reference.
    pub fn open(storage: Arc<dyn Storage>, config: IndexConfig) -> Result<Self> {
        config.validate()?;
        let lock = storage.acquire_lock(WRITE_LOCK)?;
        let manifest = BarrelsInfo::read(storage.as_ref())?;
        let filters = DocFilters::read(storage.as_ref(), manifest.collections())?;
        let removed = remove_orphans(storage.as_ref(), &manifest)?;
        info!(
            "opened index: {} barrels, {} docs, {} orphan files removed",
            manifest.len(),
            manifest.doc_count(),
            removed
        );

        let manifest = Arc::new(RwLock::new(manifest));
        let filters = Arc::new(RwLock::new(filters));
        let merger = IndexMerger::new(
            Arc::clone(&storage),
            config.posting_config(),
            MemoryBudget::new(config.memory_limit),
            config.gc_on_merge,
        );
        let engine = Arc::new(MergeEngine::new(
            Arc::clone(&storage),
            Arc::clone(&manifest),
            Arc::clone(&filters),
            merge_policy::from_config(config.merge_policy),
            merger,
        ));
        let manager = if config.background_merge {
            Some(MergeManager::start(Arc::clone(&engine))?)
        } else {
            None
        };

        Ok(IndexWriter {
            budget: MemoryBudget::new(config.memory_limit),
            storage,
            config,
            manifest,
            filters,
            open: None,
            live: Arc::new(RwLock::new(BTreeMap::new())),
            engine,
            manager,
            filters_dirty: false,
            flushes: 0,
            _lock: lock,
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// The sealed barrels, in manifest order.
    pub fn barrels(&self) -> Vec<Barrel> {
        self.manifest.read().barrels().to_vec()
    }

    /// Documents waiting in the open barrel.
    pub fn buffered_docs(&self) -> u64 {
        self.open.as_ref().map(|open| open.doc_count).unwrap_or(0)
    }

    /// Largest doc id indexed in `collection`, buffered documents included.
    pub fn last_doc_id(&self, collection: CollectionId) -> Option<DocId> {
        let buffered = self
            .open
            .as_ref()
            .and_then(|open| open.max_doc_ids.get(&collection).copied());
        let sealed = self.manifest.read().max_doc(collection);
        buffered.max(sealed)
    }

    /// Add a document to the open barrel.
    ///
    /// On error, including `OutOfMemory`, the document leaves no trace. A
    /// full cache seals the barrel afterwards.
    pub fn index_document(&mut self, doc: &Document) -> Result<()> {
        // Merges count surviving documents by their length records.
        if doc.fields.is_empty() {
            return Err(IrIndexError::invalid_argument(format!(
                "doc {} of collection {} has no fields",
                doc.doc_id, doc.collection
            )));
        }
        let mut seen = BTreeSet::new();
        if let Some(field) = doc.fields.iter().find(|f| !seen.insert(f.field)) {
            return Err(IrIndexError::invalid_argument(format!(
                "field {} appears twice in doc {}",
                field.field, doc.doc_id
            )));
        }
        if let Some(last) = self.last_doc_id(doc.collection) {
            if doc.doc_id <= last {
                return Err(IrIndexError::invalid_argument(format!(
                    "doc {} of collection {} is not above {last}",
                    doc.doc_id, doc.collection
                )));
            }
        }

        if self.open.is_none() {
            let name = self.manifest.write().next_barrel_name();
            debug!("opened barrel {name}");
            self.open = Some(OpenBarrel::new(name));
        }
        if let Some(open) = self.open.as_mut() {
            add_document(open, doc, &self.config, &self.budget, &self.storage, &self.live)?;
        }

        if self.cache_full() {
            self.flush()?;
        }
        Ok(())
    }

    fn cache_full(&self) -> bool {
        self.budget.used() >= self.config.memory_cache_size
            || self.buffered_docs() >= self.config.max_docs_per_barrel
    }

    /// Mark a document deleted. Returns false if it already was.
    pub fn remove_document(&mut self, collection: CollectionId, doc_id: DocId) -> Result<bool> {
        self.check_indexed(collection, doc_id)?;
        let newly = self.filters.write().delete(collection, doc_id);
        if newly {
            self.filters_dirty = true;
            debug!("deleted doc {doc_id} of collection {collection}");
        }
        Ok(newly)
    }

    /// Replace `old_doc_id` by `doc`, which carries a fresh doc id.
    ///
    /// The new version is indexed first, so a failure keeps the old one.
    pub fn update_document(&mut self, old_doc_id: DocId, doc: &Document) -> Result<()> {
        self.check_indexed(doc.collection, old_doc_id)?;
        self.index_document(doc)?;
        self.remove_document(doc.collection, old_doc_id)?;
        Ok(())
    }

    fn check_indexed(&self, collection: CollectionId, doc_id: DocId) -> Result<()> {
        match self.last_doc_id(collection) {
            Some(last) if doc_id <= last => Ok(()),
            _ => Err(IrIndexError::invalid_argument(format!(
                "doc {doc_id} of collection {collection} was never indexed"
            ))),
        }
    }

    /// Seal the open barrel and run or schedule merges.
    ///
    /// Barrel files are complete before the manifest names them. If writing
    /// fails the open barrel is dropped and the manifest stays as it was.
    pub fn flush(&mut self) -> Result<Option<FlushStats>> {
        let stats = self.seal_open_barrel()?;
        if stats.is_some() {
            self.maybe_merge()?;
        }
        Ok(stats)
    }

    fn seal_open_barrel(&mut self) -> Result<Option<FlushStats>> {
        let Some(open) = self.open.take() else {
            return Ok(None);
        };
        if open.doc_count == 0 {
            open.discard(&self.live);
            return Ok(None);
        }

        let started = Instant::now();
        let barrel = open.barrel(&self.config);
        let written = self
            .write_fields(&open)
            .and_then(|stats| self.register(barrel.clone()).map(|()| stats));
        open.discard(&self.live);
        let mut stats = match written {
            Ok(stats) => stats,
            Err(e) => {
                let _ = barrel.remove_files(self.storage.as_ref());
                return Err(e);
            }
        };
        self.write_filters()?;

        self.flushes += 1;
        stats.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            "sealed barrel {} ({} docs, {} terms, {} bytes)",
            stats.barrel, stats.doc_count, stats.terms, stats.bytes
        );
        Ok(Some(stats))
    }

    fn write_fields(&self, open: &OpenBarrel) -> Result<FlushStats> {
        let mut stats = FlushStats {
            barrel: open.name.clone(),
            doc_count: open.doc_count,
            fields: open.fields.len(),
            ..FlushStats::default()
        };
        let storage = self.storage.as_ref();
        let name = open.name.as_str();
        let written = open
            .fields
            .par_iter()
            .map(|(&key, indexer)| -> Result<FieldWriteStats> {
                let mut outputs = FieldOutputs::create(storage, name, key)?;
                let written = indexer.write(&mut outputs)?;
                outputs.close()?;
                Ok(written)
            })
            .collect::<Result<Vec<FieldWriteStats>>>()?;
        for field in written {
            stats.terms += field.terms;
            stats.postings += field.postings;
            stats.bytes += field.bytes;
        }
        Ok(stats)
    }

    fn register(&self, barrel: Barrel) -> Result<()> {
        let mut manifest = self.manifest.write();
        let mut updated = manifest.clone();
        updated.add_barrel(barrel)?;
        updated.write(self.storage.as_ref())?;
        *manifest = updated;
        Ok(())
    }

    fn write_filters(&mut self) -> Result<()> {
        if self.filters_dirty {
            self.filters.read().write(self.storage.as_ref())?;
            self.filters_dirty = false;
        }
        Ok(())
    }

    fn maybe_merge(&self) -> Result<()> {
        match &self.manager {
            Some(manager) => manager.barrel_sealed(),
            None => self.engine.merge_by_policy().map(|_| ()),
        }
    }

    /// Flush, persist deletions and sync storage.
    pub fn commit(&mut self) -> Result<Option<FlushStats>> {
        let stats = self.flush()?;
        self.write_filters()?;
        self.storage.sync()?;
        Ok(stats)
    }

    /// Merge all barrels into one, dropping deleted documents.
    ///
    /// With a background merge manager this only schedules the merge; see
    /// [`IndexWriter::wait_for_merges`].
    pub fn optimize(&mut self) -> Result<()> {
        self.seal_open_barrel()?;
        self.write_filters()?;
        match &self.manager {
            Some(manager) => manager.optimize(),
            None => self.engine.optimize().map(|_| ()),
        }
    }

    /// Block until scheduled background merges are done; reports the last
    /// background failure.
    pub fn wait_for_merges(&self) -> Result<()> {
        let Some(manager) = &self.manager else {
            return Ok(());
        };
        manager.wait()?;
        match manager.take_error() {
            Some(message) => Err(IrIndexError::merge(message)),
            None => Ok(()),
        }
    }

    /// The last background merge failure, if any.
    pub fn last_merge_error(&self) -> Option<String> {
        self.manager.as_ref().and_then(MergeManager::last_error)
    }

    /// A reader over the sealed barrels as of now.
    pub fn reader(&self) -> Result<IndexReader> {
        let filters = self.filters.read().clone();
        // Holding the manifest keeps merged-away files alive while opening.
        let manifest = self.manifest.read();
        IndexReader::with_manifest(self.storage.as_ref(), &manifest, filters)
    }

    /// A handle for reading the open barrel from other threads.
    pub fn realtime_reader(&self) -> Result<RealtimeReader> {
        if !self.config.realtime {
            return Err(IrIndexError::invalid_operation(
                "realtime readers are disabled for this index",
            ));
        }
        Ok(RealtimeReader {
            fields: Arc::clone(&self.live),
            filters: Arc::clone(&self.filters),
        })
    }

    /// Snapshot of a term's postings in the open barrel, local doc ids.
    pub fn term_reader(&self, key: TermKey) -> Result<Option<PostingSnapshot>> {
        self.realtime_reader()?.term_reader(key)
    }

    pub fn stats(&self) -> IndexStats {
        let manifest = self.manifest.read();
        IndexStats {
            barrel_count: manifest.len(),
            doc_count: manifest.doc_count(),
            buffered_docs: self.buffered_docs(),
            deleted_docs: self.filters.read().total_deleted(),
            flushes: self.flushes,
            merges: self.engine.merges_completed(),
            memory_used: self.budget.used(),
            peak_memory: self.budget.peak(),
        }
    }

    /// Commit, stop the merge manager and release the write lock.
    pub fn close(mut self) -> Result<()> {
        self.commit()?;
        if let Some(manager) = self.manager.take() {
            manager.shutdown()?;
        }
        info!("closed index writer");
        Ok(())
    }
}

/// Index `doc` into `open`, undoing every field on failure.
fn add_document(
    open: &mut OpenBarrel,
    doc: &Document,
    config: &IndexConfig,
    budget: &MemoryBudget,
    storage: &Arc<dyn Storage>,
    live: &LiveFields,
) -> Result<()> {
    let collection = doc.collection;
    let new_collection = !open.base_doc_ids.contains_key(&collection);
    let base = *open.base_doc_ids.entry(collection).or_insert(doc.doc_id);
    let local = doc.doc_id - base;

    let mut created = Vec::new();
    let mut added = Vec::new();
    let mut result = Ok(());
    for field in &doc.fields {
        let key = FieldKey::new(collection, field.field);
        let indexer = match open.fields.get(&key) {
            Some(indexer) => Arc::clone(indexer),
            None => {
                let indexer = Arc::new(FieldIndexer::new(
                    key,
                    base,
                    config.posting_config(),
                    config.indexing_mode,
                    budget.clone(),
                    storage,
                    &open.name,
                ));
                open.fields.insert(key, Arc::clone(&indexer));
                live.write().insert(key, Arc::clone(&indexer));
                created.push(key);
                indexer
            }
        };
        if let Err(e) = indexer.add_field(local, &field.terms) {
            result = Err(e);
            break;
        }
        added.push(indexer);
    }

    if let Err(e) = result {
        for indexer in &added {
            indexer.rollback_document(local);
        }
        for key in created {
            if let Some(indexer) = open.fields.remove(&key) {
                live.write().remove(&key);
                let _ = indexer.discard();
            }
        }
        if new_collection {
            open.base_doc_ids.remove(&collection);
        }
        return Err(e);
    }

    open.doc_count += 1;
    open.max_doc_ids.insert(collection, doc.doc_id);
    Ok(())
}

/// Delete barrel and temporary files the manifest does not reference.
fn remove_orphans(storage: &dyn Storage, manifest: &BarrelsInfo) -> Result<usize> {
    let referenced = manifest.referenced_files();
    let mut removed = 0;
    for name in storage.list_files()? {
        let orphan = name.ends_with(".tmp")
            || (barrel_of_file(&name).is_some() && !referenced.contains(&name));
        if !orphan || name == MANIFEST_FILE {
            continue;
        }
        warn!("deleting unreferenced file {name}");
        storage.delete_file(&name)?;
        removed += 1;
    }
    Ok(removed)
}

/// Reads the open barrel of a realtime writer concurrently with indexing.
///
/// Terms disappear from here once their barrel is sealed; read sealed
/// barrels through [`IndexReader`].
#[derive(Debug, Clone)]
pub struct RealtimeReader {
    fields: LiveFields,
    filters: Arc<RwLock<DocFilters>>,
}

impl RealtimeReader {
    fn field(&self, key: FieldKey) -> Option<Arc<FieldIndexer>> {
        self.fields.read().get(&key).cloned()
    }

    /// Snapshot of a term's buffered postings, local doc ids.
    pub fn term_reader(&self, key: TermKey) -> Result<Option<PostingSnapshot>> {
        match self.field(key.field_key()) {
            Some(field) => field.term_reader(key.term),
            None => Ok(None),
        }
    }

    /// Iterate a term's buffered postings with global doc ids, skipping
    /// deleted documents.
    pub fn term_positions(&self, key: TermKey) -> Result<Option<MultiTermPositions>> {
        let Some(field) = self.field(key.field_key()) else {
            return Ok(None);
        };
        let Some(positions) = field.term_positions(key.term)? else {
            return Ok(None);
        };
        let deleted = self.filters.read().get(key.collection).cloned();
        Ok(Some(MultiTermPositions::new(vec![positions], deleted)))
    }

    pub fn doc_freq(&self, key: TermKey) -> u32 {
        self.field(key.field_key())
            .map(|field| field.doc_freq(key.term))
            .unwrap_or(0)
    }

    /// Length of a buffered document in one field, global doc id.
    pub fn doc_length(&self, collection: CollectionId, field: FieldId, doc_id: DocId) -> Option<u32> {
        let field = self.field(FieldKey::new(collection, field))?;
        field.doc_length(doc_id.checked_sub(field.doc_base())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::TermId;
    use crate::index::config::{IndexingMode, MergePolicyConfig};
    use crate::storage::memory::MemoryStorage;

    fn storage() -> Arc<dyn Storage> {
        Arc::new(MemoryStorage::new_default())
    }

    fn config() -> IndexConfig {
        IndexConfig {
            chunk_capacity: 4,
            skip_interval: 2,
            merge_policy: MergePolicyConfig::NoMerge,
            ..IndexConfig::default()
        }
    }

    fn doc(doc_id: DocId, terms: &[TermId]) -> Document {
        Document::builder(0, doc_id).add_tokens(0, terms.iter().copied()).build()
    }

    fn docs_of(reader: &IndexReader, term: TermId) -> Vec<DocId> {
        let mut docs = Vec::new();
        if let Some(mut positions) = reader.term_positions(TermKey::new(0, 0, term)).unwrap() {
            while positions.next().unwrap() {
                docs.push(positions.doc().unwrap());
            }
        }
        docs
    }

    #[test]
    fn test_index_flush_and_read() {
        let mut writer = IndexWriter::open(storage(), config()).unwrap();
        for id in 1..=10 {
            writer.index_document(&doc(id, &[1, 2, 1])).unwrap();
        }
        assert_eq!(writer.buffered_docs(), 10);
        let stats = writer.flush().unwrap().unwrap();
        assert_eq!(stats.barrel, "_0");
        assert_eq!(stats.doc_count, 10);
        assert_eq!(stats.terms, 2);
        assert_eq!(stats.postings, 20);
        assert_eq!(writer.buffered_docs(), 0);
        assert!(writer.flush().unwrap().is_none());

        let reader = writer.reader().unwrap();
        assert_eq!(docs_of(&reader, 1), (1..=10).collect::<Vec<_>>());
        assert_eq!(reader.doc_length(0, 0, 4), Some(3));
        let mut positions = reader.term_positions(TermKey::new(0, 0, 1)).unwrap().unwrap();
        assert!(positions.skip_to(7).unwrap());
        assert_eq!(positions.positions().unwrap(), vec![0, 2]);
    }

    #[test]
    fn test_doc_ids_must_increase() {
        let mut writer = IndexWriter::open(storage(), config()).unwrap();
        writer.index_document(&doc(5, &[1])).unwrap();
        assert!(writer.index_document(&doc(5, &[1])).is_err());
        writer.flush().unwrap();
        assert!(writer.index_document(&doc(3, &[1])).is_err());
        writer.index_document(&doc(6, &[1])).unwrap();

        // Collections number their documents independently.
        let other = Document::builder(1, 0).add_tokens(0, [1]).build();
        writer.index_document(&other).unwrap();
        assert_eq!(writer.last_doc_id(1), Some(0));
        assert_eq!(writer.last_doc_id(0), Some(6));
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let mut writer = IndexWriter::open(storage(), config()).unwrap();
        let bad = Document::builder(0, 1)
            .add_tokens(0, [1])
            .add_tokens(0, [2])
            .build();
        assert!(writer.index_document(&bad).is_err());
        assert_eq!(writer.buffered_docs(), 0);
    }

    #[test]
    fn test_cache_full_seals_barrel() {
        let config = IndexConfig {
            max_docs_per_barrel: 4,
            ..config()
        };
        let mut writer = IndexWriter::open(storage(), config).unwrap();
        for id in 0..10 {
            writer.index_document(&doc(id, &[1])).unwrap();
        }
        assert_eq!(writer.barrels().len(), 2);
        assert_eq!(writer.buffered_docs(), 2);
        let stats = writer.stats();
        assert_eq!(stats.flushes, 2);
        assert_eq!(stats.doc_count, 8);
        assert_eq!(stats.buffered_docs, 2);
    }

    #[test]
    fn test_out_of_memory_leaves_no_trace() {
        let config = IndexConfig {
            chunk_capacity: 4,
            memory_limit: Some(4096),
            memory_cache_size: u64::MAX,
            ..config()
        };
        let mut writer = IndexWriter::open(storage(), config).unwrap();
        let terms: Vec<TermId> = (0..20).collect();
        let mut failed = None;
        for id in 0..10 {
            if let Err(e) = writer.index_document(&doc(id, &terms)) {
                assert!(e.is_out_of_memory());
                failed = Some(id);
                break;
            }
        }
        let failed = failed.unwrap();
        assert_eq!(writer.buffered_docs(), failed as u64);
        assert_eq!(writer.last_doc_id(0), failed.checked_sub(1));

        writer.flush().unwrap();
        let reader = writer.reader().unwrap();
        assert_eq!(docs_of(&reader, 0), (0..failed).collect::<Vec<_>>());
        assert_eq!(reader.doc_length(0, 0, failed), None);

        // The freed budget takes the rejected document.
        writer.index_document(&doc(failed, &terms)).unwrap();
    }

    #[test]
    fn test_remove_and_update() {
        let mut writer = IndexWriter::open(storage(), config()).unwrap();
        for id in 0..5 {
            writer.index_document(&doc(id, &[1])).unwrap();
        }
        assert!(writer.remove_document(0, 2).unwrap());
        assert!(!writer.remove_document(0, 2).unwrap());
        assert!(writer.remove_document(0, 9).is_err());

        writer.update_document(3, &doc(5, &[1, 2])).unwrap();
        writer.commit().unwrap();

        let reader = writer.reader().unwrap();
        assert_eq!(docs_of(&reader, 1), vec![0, 1, 4, 5]);
        assert_eq!(docs_of(&reader, 2), vec![5]);
        assert_eq!(writer.stats().deleted_docs, 2);
    }

    #[test]
    fn test_optimize_collects_garbage() {
        let mut writer = IndexWriter::open(storage(), config()).unwrap();
        for id in 0..30 {
            writer.index_document(&doc(id, &[id % 3])).unwrap();
            if id % 10 == 9 {
                writer.flush().unwrap();
            }
        }
        writer.remove_document(0, 0).unwrap();
        writer.remove_document(0, 15).unwrap();
        writer.optimize().unwrap();

        let barrels = writer.barrels();
        assert_eq!(barrels.len(), 1);
        assert_eq!(barrels[0].doc_count, 28);
        let reader = writer.reader().unwrap();
        assert_eq!(reader.doc_freq(TermKey::new(0, 0, 0)), 8);
        assert_eq!(docs_of(&reader, 0), vec![3, 6, 9, 12, 18, 21, 24, 27]);
    }

    #[test]
    fn test_merged_doc_count_tracks_dropped_documents() {
        let mut writer = IndexWriter::open(storage(), config()).unwrap();
        assert!(writer.index_document(&Document::builder(0, 0).build()).is_err());

        for id in [0, 2, 4, 6] {
            writer.index_document(&doc(id, &[5])).unwrap();
        }
        writer.flush().unwrap();
        writer
            .index_document(&Document::builder(0, 8).add_field(0, vec![]).build())
            .unwrap();
        writer.index_document(&doc(10, &[5])).unwrap();
        writer.flush().unwrap();

        // Doc 3 was never indexed; doc 8 has only an empty field.
        writer.remove_document(0, 3).unwrap();
        writer.remove_document(0, 4).unwrap();
        writer.remove_document(0, 8).unwrap();
        let stats = writer.engine.optimize().unwrap().unwrap();
        assert_eq!(stats.dropped_docs, 2);
        assert_eq!(writer.barrels()[0].doc_count, 4);

        // Deleted bits survive the merge but are not subtracted again.
        writer.optimize().unwrap();
        assert_eq!(writer.barrels()[0].doc_count, 4);
        assert_eq!(docs_of(&writer.reader().unwrap(), 5), vec![0, 2, 6, 10]);
    }

    #[test]
    fn test_policy_merges_after_flush() {
        let config = IndexConfig {
            merge_policy: MergePolicyConfig::Level { collision_factor: 3 },
            ..config()
        };
        let mut writer = IndexWriter::open(storage(), config).unwrap();
        for id in 0..3 {
            writer.index_document(&doc(id, &[1])).unwrap();
            writer.flush().unwrap();
        }
        assert_eq!(writer.barrels().len(), 1);
        assert_eq!(writer.stats().merges, 1);
        assert_eq!(docs_of(&writer.reader().unwrap(), 1), vec![0, 1, 2]);
    }

    #[test]
    fn test_policy_merges_interleaved_barrel_sizes() {
        let config = IndexConfig {
            merge_policy: MergePolicyConfig::Level { collision_factor: 3 },
            ..config()
        };
        let mut writer = IndexWriter::open(storage(), config).unwrap();
        let mut next_id = 0;
        for _ in 0..12 {
            for size in [3, 1] {
                for _ in 0..size {
                    writer.index_document(&doc(next_id, &[1])).unwrap();
                    next_id += 1;
                }
                writer.flush().unwrap();
                writer.wait_for_merges().unwrap();
            }
        }

        let barrels = writer.barrels();
        assert!(barrels.len() <= 4, "{} barrels left", barrels.len());
        assert_eq!(barrels.iter().map(|b| b.doc_count).sum::<u64>(), 48);
        assert!(writer.stats().merges > 0);
        assert_eq!(docs_of(&writer.reader().unwrap(), 1), (0..48).collect::<Vec<DocId>>());
    }

    #[test]
    fn test_realtime_reader_sees_buffered_documents() {
        let config = IndexConfig {
            realtime: true,
            ..config()
        };
        let mut writer = IndexWriter::open(storage(), config).unwrap();
        let realtime = writer.realtime_reader().unwrap();
        writer.index_document(&doc(10, &[4, 4])).unwrap();
        writer.index_document(&doc(11, &[4])).unwrap();
        writer.remove_document(0, 10).unwrap();

        let snapshot = writer.term_reader(TermKey::new(0, 0, 4)).unwrap().unwrap();
        assert_eq!(snapshot.doc_freq(), 2);
        assert_eq!(snapshot.ctf(), 3);
        assert_eq!(realtime.doc_freq(TermKey::new(0, 0, 4)), 2);
        assert_eq!(realtime.doc_length(0, 0, 10), Some(2));

        let mut positions = realtime.term_positions(TermKey::new(0, 0, 4)).unwrap().unwrap();
        assert!(positions.next().unwrap());
        assert_eq!(positions.doc(), Some(11));
        assert!(!positions.next().unwrap());

        writer.flush().unwrap();
        assert!(realtime.term_reader(TermKey::new(0, 0, 4)).unwrap().is_none());
    }

    #[test]
    fn test_realtime_reader_requires_realtime() {
        let writer = IndexWriter::open(storage(), config()).unwrap();
        assert!(writer.realtime_reader().is_err());
    }

    #[test]
    fn test_external_sort_matches_in_memory() {
        let sorted = IndexConfig {
            indexing_mode: IndexingMode::ExternalSort { run_size: 16 },
            ..config()
        };
        let mut results = Vec::new();
        for config in [config(), sorted] {
            let mut writer = IndexWriter::open(storage(), config).unwrap();
            for id in 0..50 {
                writer.index_document(&doc(id, &[id % 5, 7, id % 3])).unwrap();
            }
            writer.flush().unwrap();
            let reader = writer.reader().unwrap();
            let per_term: Vec<Vec<DocId>> = (0..8).map(|t| docs_of(&reader, t)).collect();
            let mut positions = reader.term_positions(TermKey::new(0, 0, 7)).unwrap().unwrap();
            assert!(positions.skip_to(33).unwrap());
            results.push((per_term, positions.positions().unwrap()));
        }
        assert_eq!(results[0], results[1]);
    }

    #[test]
    fn test_second_writer_is_locked_out() {
        let storage = storage();
        let writer = IndexWriter::open(Arc::clone(&storage), config()).unwrap();
        assert!(IndexWriter::open(Arc::clone(&storage), config()).is_err());
        writer.close().unwrap();
        IndexWriter::open(storage, config()).unwrap();
    }

    #[test]
    fn test_snapshot_uses_local_doc_ids() {
        let config = IndexConfig {
            realtime: true,
            ..config()
        };
        let mut writer = IndexWriter::open(storage(), config).unwrap();
        for id in 100..109 {
            writer.index_document(&doc(id, &[3])).unwrap();
        }
        let snapshot = writer.term_reader(TermKey::new(0, 0, 3)).unwrap().unwrap();
        assert_eq!(snapshot.term_info().doc_freq, 9);
        assert_eq!(snapshot.term_info().last_doc_id, 8);

        let mut positions = snapshot.term_positions(100);
        assert!(positions.skip_to(105).unwrap());
        assert_eq!(positions.doc(), Some(105));
    }
}
