//! Running merges, in the foreground or on a background thread.
//!
//! [`MergeEngine`] owns everything a merge needs and registers results in
//! the shared manifest. The writer calls it directly for synchronous
//! merging; [`MergeManager`] feeds it from a channel on its own thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::error::{IrIndexError, Result};
use crate::index::barrel::{Barrel, BarrelsInfo};
use crate::index::doc_filter::DocFilters;
use crate::index::merge_policy::MergePolicy;
use crate::index::merger::{IndexMerger, MergeStats};
use crate::storage::Storage;

/// Merges barrels and swaps the results into the manifest.
#[derive(Debug)]
pub struct MergeEngine {
    storage: Arc<dyn Storage>,
    manifest: Arc<RwLock<BarrelsInfo>>,
    filters: Arc<RwLock<DocFilters>>,
    policy: Box<dyn MergePolicy>,
    merger: IndexMerger,
    /// Serializes merges so two never claim the same barrel.
    running: Mutex<()>,
    completed: AtomicU64,
}

impl MergeEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        manifest: Arc<RwLock<BarrelsInfo>>,
        filters: Arc<RwLock<DocFilters>>,
        policy: Box<dyn MergePolicy>,
        merger: IndexMerger,
    ) -> Self {
        MergeEngine {
            storage,
            manifest,
            filters,
            policy,
            merger,
            running: Mutex::new(()),
            completed: AtomicU64::new(0),
        }
    }

    /// Merges finished since the engine was created.
    pub fn merges_completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Merge what the policy selects until it selects nothing.
    pub fn merge_by_policy(&self) -> Result<Vec<MergeStats>> {
        let _running = self.running.lock();
        let mut done = Vec::new();
        loop {
            let candidate = {
                let manifest = self.manifest.read();
                self.policy.select_merges(manifest.barrels()).into_iter().next()
            };
            let Some(candidate) = candidate else {
                break;
            };
            debug!(
                "policy selected {:?} at level {}",
                candidate.barrels, candidate.level
            );
            done.push(self.merge_run(&candidate.barrels)?);
        }
        Ok(done)
    }

    /// Merge every barrel into one.
    ///
    /// A lone barrel is merged with itself only when it holds deleted
    /// documents to drop.
    pub fn optimize(&self) -> Result<Option<MergeStats>> {
        let _running = self.running.lock();
        let names: Vec<String> = {
            let manifest = self.manifest.read();
            match manifest.barrels() {
                [] => return Ok(None),
                [only] if !self.has_deletions(only) => return Ok(None),
                barrels => barrels.iter().map(|b| b.name.clone()).collect(),
            }
        };
        let stats = self.merge_run(&names)?;
        info!("optimized index into barrel {}", stats.output);
        Ok(Some(stats))
    }

    fn has_deletions(&self, barrel: &Barrel) -> bool {
        let filters = self.filters.read();
        barrel.collections().any(|collection| {
            match (
                filters.get(collection),
                barrel.base_doc_id(collection),
                barrel.max_doc_id(collection),
            ) {
                (Some(filter), Some(base), Some(max)) => filter.any_in(base, max),
                _ => false,
            }
        })
    }

    /// Merge the consecutive barrels `names` and register the output.
    ///
    /// The manifest is rewritten only after the output files are complete;
    /// input files are deleted after that.
    fn merge_run(&self, names: &[String]) -> Result<MergeStats> {
        let (inputs, output_name) = {
            let mut manifest = self.manifest.write();
            let inputs = names
                .iter()
                .map(|name| {
                    manifest.get(name).cloned().ok_or_else(|| {
                        IrIndexError::merge(format!("barrel {name} is not registered"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            (inputs, manifest.next_barrel_name())
        };
        let filters = self.filters.read().clone();

        let (output, stats) = self.merger.merge(&inputs, &output_name, &filters)?;

        let registered = {
            let mut manifest = self.manifest.write();
            let mut updated = manifest.clone();
            let result = updated
                .replace_run(names, output.clone())
                .and_then(|_| updated.write(self.storage.as_ref()));
            if result.is_ok() {
                *manifest = updated;
            }
            result
        };
        if let Err(e) = registered {
            let _ = output.remove_files(self.storage.as_ref());
            return Err(e);
        }

        for barrel in &inputs {
            if let Err(e) = barrel.remove_files(self.storage.as_ref()) {
                warn!("failed to delete files of merged barrel {}: {e}", barrel.name);
            }
        }
        self.completed.fetch_add(1, Ordering::Relaxed);
        Ok(stats)
    }
}

/// Requests understood by the merge thread.
#[derive(Debug)]
pub enum MergeMessage {
    /// A barrel was registered; consult the policy.
    BarrelSealed,

    /// Merge everything into one barrel.
    Optimize,

    /// Reply once every earlier message is handled.
    Barrier(Sender<()>),

    Shutdown,
}

/// A background thread that performs merges while indexing continues.
#[derive(Debug)]
pub struct MergeManager {
    sender: Sender<MergeMessage>,
    handle: Option<thread::JoinHandle<()>>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl MergeManager {
    /// Spawn the merge thread over `engine`.
    pub fn start(engine: Arc<MergeEngine>) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let last_error = Arc::new(Mutex::new(None));
        let errors = Arc::clone(&last_error);
        let handle = thread::Builder::new()
            .name("irindex-merge".to_string())
            .spawn(move || run(engine, receiver, errors))?;
        info!("merge manager started");
        Ok(MergeManager {
            sender,
            handle: Some(handle),
            last_error,
        })
    }

    /// Report a newly registered barrel.
    pub fn barrel_sealed(&self) -> Result<()> {
        self.send(MergeMessage::BarrelSealed)
    }

    /// Ask for a full merge.
    pub fn optimize(&self) -> Result<()> {
        self.send(MergeMessage::Optimize)
    }

    /// Block until every request sent so far has been handled.
    pub fn wait(&self) -> Result<()> {
        let (done, finished) = bounded(1);
        self.send(MergeMessage::Barrier(done))?;
        finished
            .recv()
            .map_err(|_| IrIndexError::merge("merge manager stopped"))
    }

    /// The most recent merge failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Return and clear the most recent merge failure.
    pub fn take_error(&self) -> Option<String> {
        self.last_error.lock().take()
    }

    /// Stop the thread after it drains pending requests.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn send(&self, message: MergeMessage) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| IrIndexError::merge("merge manager channel closed"))
    }

    fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        if self.sender.send(MergeMessage::Shutdown).is_err() {
            warn!("merge manager channel closed before shutdown");
        }
        handle
            .join()
            .map_err(|_| IrIndexError::ThreadJoin("merge manager panicked".to_string()))?;
        info!("merge manager stopped");
        Ok(())
    }
}

impl Drop for MergeManager {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("{e}");
        }
    }
}

fn run(engine: Arc<MergeEngine>, receiver: Receiver<MergeMessage>, errors: Arc<Mutex<Option<String>>>) {
    let record = |what: &str, error: IrIndexError| {
        warn!("{what} failed: {error}");
        *errors.lock() = Some(error.to_string());
    };
    for message in receiver.iter() {
        match message {
            MergeMessage::BarrelSealed => {
                if let Err(e) = engine.merge_by_policy() {
                    record("background merge", e);
                }
            }
            MergeMessage::Optimize => {
                if let Err(e) = engine.optimize() {
                    record("background optimize", e);
                }
            }
            MergeMessage::Barrier(done) => {
                let _ = done.send(());
            }
            MergeMessage::Shutdown => return,
        }
    }
    warn!("merge manager channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::config::{IndexingMode, PostingConfig, PostingFormat};
    use crate::index::field_indexer::{FieldIndexer, FieldOutputs};
    use crate::index::merge_policy::{LevelMergePolicy, NoMergePolicy};
    use crate::index::reader::IndexReader;
    use crate::index::{DocId, FieldKey, TermKey};
    use crate::storage::memory::MemoryStorage;
    use crate::util::budget::MemoryBudget;

    const KEY: FieldKey = FieldKey {
        collection: 0,
        field: 0,
    };

    fn config() -> PostingConfig {
        PostingConfig {
            chunk_capacity: 4,
            skip_interval: 2,
            ..PostingConfig::default()
        }
    }

    fn add_barrel(storage: &Arc<dyn Storage>, manifest: &RwLock<BarrelsInfo>, docs: std::ops::Range<DocId>) {
        let name = manifest.write().next_barrel_name();
        let field = FieldIndexer::new(
            KEY,
            docs.start,
            config(),
            IndexingMode::InMemory,
            MemoryBudget::unlimited(),
            storage,
            &name,
        );
        for doc in docs.clone() {
            field.add_field(doc - docs.start, &[(7, 0)]).unwrap();
        }
        let mut outputs = FieldOutputs::create(storage.as_ref(), &name, KEY).unwrap();
        field.write(&mut outputs).unwrap();
        outputs.close().unwrap();

        let mut barrel = Barrel::new(name, PostingFormat::Chunk);
        barrel.doc_count = docs.len() as u64;
        barrel.base_doc_ids.insert(0, docs.start);
        barrel.max_doc_ids.insert(0, docs.end - 1);
        barrel.fields = vec![KEY];
        barrel.searchable = true;
        let mut manifest = manifest.write();
        manifest.add_barrel(barrel).unwrap();
        manifest.write(storage.as_ref()).unwrap();
    }

    fn engine(
        storage: &Arc<dyn Storage>,
        policy: Box<dyn MergePolicy>,
    ) -> (Arc<MergeEngine>, Arc<RwLock<BarrelsInfo>>, Arc<RwLock<DocFilters>>) {
        let manifest = Arc::new(RwLock::new(BarrelsInfo::new()));
        let filters = Arc::new(RwLock::new(DocFilters::new()));
        let merger = IndexMerger::new(Arc::clone(storage), config(), MemoryBudget::unlimited(), true);
        let engine = MergeEngine::new(
            Arc::clone(storage),
            Arc::clone(&manifest),
            Arc::clone(&filters),
            policy,
            merger,
        );
        (Arc::new(engine), manifest, filters)
    }

    fn postings(storage: &Arc<dyn Storage>) -> Vec<DocId> {
        let reader = IndexReader::open(storage.as_ref()).unwrap();
        let mut positions = reader.term_positions(TermKey::new(0, 0, 7)).unwrap().unwrap();
        let mut docs = Vec::new();
        while positions.next().unwrap() {
            docs.push(positions.doc().unwrap());
        }
        docs
    }

    #[test]
    fn test_policy_merges_cascade() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let (engine, manifest, _) = engine(&storage, Box::new(LevelMergePolicy::new(3)));
        for i in 0..3 {
            add_barrel(&storage, &manifest, i * 10..i * 10 + 1);
        }
        let done = engine.merge_by_policy().unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(manifest.read().len(), 1);
        assert_eq!(engine.merges_completed(), 1);
        assert_eq!(postings(&storage), vec![0, 10, 20]);

        // Inputs are gone from storage; the output is on disk.
        let files = storage.list_files().unwrap();
        assert!(files.iter().all(|f| !f.starts_with("_0.") && !f.starts_with("_1.")));
        assert!(files.iter().any(|f| f.starts_with("_3.")));
    }

    #[test]
    fn test_optimize_drops_deleted_documents() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let (engine, manifest, filters) = engine(&storage, Box::new(NoMergePolicy));
        add_barrel(&storage, &manifest, 0..5);
        assert!(engine.optimize().unwrap().is_none());

        filters.write().delete(0, 2);
        filters.read().write(storage.as_ref()).unwrap();
        let stats = engine.optimize().unwrap().unwrap();
        assert_eq!(stats.dropped_docs, 1);
        assert_eq!(manifest.read().doc_count(), 4);
        assert_eq!(postings(&storage), vec![0, 1, 3, 4]);
    }

    #[test]
    fn test_manager_runs_in_background() {
        let _ = env_logger::builder().is_test(true).try_init();
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let (engine, manifest, _) = engine(&storage, Box::new(LevelMergePolicy::new(2)));
        let manager = MergeManager::start(Arc::clone(&engine)).unwrap();

        add_barrel(&storage, &manifest, 0..1);
        add_barrel(&storage, &manifest, 1..2);
        manager.barrel_sealed().unwrap();
        manager.wait().unwrap();
        assert_eq!(manifest.read().len(), 1);

        add_barrel(&storage, &manifest, 2..3);
        manager.optimize().unwrap();
        manager.wait().unwrap();
        assert!(manager.last_error().is_none());
        assert_eq!(manifest.read().len(), 1);
        assert_eq!(postings(&storage), vec![0, 1, 2]);
        manager.shutdown().unwrap();
    }

    #[test]
    fn test_manager_records_errors() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let (engine, manifest, _) = engine(&storage, Box::new(NoMergePolicy));
        add_barrel(&storage, &manifest, 0..3);
        add_barrel(&storage, &manifest, 3..6);
        storage.delete_file("_1.c0f0.dfp").unwrap();

        let manager = MergeManager::start(engine).unwrap();
        manager.optimize().unwrap();
        manager.wait().unwrap();
        assert!(manager.last_error().is_some());
        assert!(manager.take_error().is_some());
        assert!(manager.last_error().is_none());
        // The failed merge left the manifest untouched.
        assert_eq!(manifest.read().len(), 2);
    }
}
