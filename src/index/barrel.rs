//! Barrels and the barrel manifest.
//!
//! A [`Barrel`] is one sealed segment: the files of every (collection,
//! field) it covers plus its document count and per-collection base doc
//! ids. [`BarrelsInfo`] keeps the ordered list of live barrels and is
//! persisted as `barrels.json`, always through a temporary file that is
//! renamed into place.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{IrIndexError, Result};
use crate::index::config::PostingFormat;
use crate::index::{
    CollectionId, DocId, FieldKey, MANIFEST_FILE, doc_length_file, doc_posting_file,
    position_posting_file, vocabulary_file,
};
use crate::storage::{IndexInput, IndexOutput, Storage};

const MANIFEST_VERSION: u32 = 1;

/// One sealed segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Barrel {
    /// File name prefix, `_<n>`.
    pub name: String,

    /// Documents indexed into the barrel, deleted ones included.
    pub doc_count: u64,

    /// Global id of local doc 0, per collection.
    pub base_doc_ids: BTreeMap<CollectionId, DocId>,

    /// Largest global doc id, per collection.
    pub max_doc_ids: BTreeMap<CollectionId, DocId>,

    /// Fields with files in this barrel, sorted.
    pub fields: Vec<FieldKey>,

    /// Chunk grouping of the barrel's postings.
    pub posting_format: PostingFormat,

    /// Whether readers may open the barrel.
    pub searchable: bool,

    pub created_at: DateTime<Utc>,
}

impl Barrel {
    pub fn new(name: impl Into<String>, posting_format: PostingFormat) -> Self {
        Barrel {
            name: name.into(),
            doc_count: 0,
            base_doc_ids: BTreeMap::new(),
            max_doc_ids: BTreeMap::new(),
            fields: Vec::new(),
            posting_format,
            searchable: false,
            created_at: Utc::now(),
        }
    }

    /// Base doc id of `collection`, if the barrel holds any of its docs.
    pub fn base_doc_id(&self, collection: CollectionId) -> Option<DocId> {
        self.base_doc_ids.get(&collection).copied()
    }

    pub fn max_doc_id(&self, collection: CollectionId) -> Option<DocId> {
        self.max_doc_ids.get(&collection).copied()
    }

    pub fn collections(&self) -> impl Iterator<Item = CollectionId> + '_ {
        self.base_doc_ids.keys().copied()
    }

    pub fn has_field(&self, key: FieldKey) -> bool {
        self.fields.binary_search(&key).is_ok()
    }

    /// Every file the barrel owns.
    pub fn file_names(&self) -> Vec<String> {
        self.fields
            .iter()
            .flat_map(|&key| {
                [
                    vocabulary_file(&self.name, key),
                    doc_posting_file(&self.name, key),
                    position_posting_file(&self.name, key),
                    doc_length_file(&self.name, key),
                ]
            })
            .collect()
    }

    /// Delete the barrel's files; missing files are ignored.
    pub fn remove_files(&self, storage: &dyn Storage) -> Result<()> {
        for name in self.file_names() {
            storage.delete_file(&name)?;
        }
        Ok(())
    }
}

/// The ordered list of live barrels.
///
/// Barrels are kept in creation order, which is also increasing doc id
/// order within every collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarrelsInfo {
    version: u32,

    /// Next barrel number to hand out.
    barrel_counter: u64,

    /// Largest doc id assigned, per collection.
    max_doc_ids: BTreeMap<CollectionId, DocId>,

    barrels: Vec<Barrel>,
}

impl Default for BarrelsInfo {
    fn default() -> Self {
        BarrelsInfo {
            version: MANIFEST_VERSION,
            barrel_counter: 0,
            max_doc_ids: BTreeMap::new(),
            barrels: Vec::new(),
        }
    }
}

impl BarrelsInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh barrel name; names are never reused.
    pub fn next_barrel_name(&mut self) -> String {
        let name = format!("_{}", self.barrel_counter);
        self.barrel_counter += 1;
        name
    }

    /// Register a sealed barrel at the end of the list.
    pub fn add_barrel(&mut self, barrel: Barrel) -> Result<()> {
        if self.get(&barrel.name).is_some() {
            return Err(IrIndexError::index(format!(
                "barrel {} is already registered",
                barrel.name
            )));
        }
        for (&collection, &max_doc) in &barrel.max_doc_ids {
            self.update_max_doc(collection, max_doc);
        }
        debug!("registered barrel {} ({} docs)", barrel.name, barrel.doc_count);
        self.barrels.push(barrel);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Barrel> {
        self.barrels.iter().find(|b| b.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Barrel> {
        self.barrels.iter_mut().find(|b| b.name == name)
    }

    pub fn barrels(&self) -> &[Barrel] {
        &self.barrels
    }

    pub fn iter(&self) -> impl Iterator<Item = &Barrel> {
        self.barrels.iter()
    }

    pub fn len(&self) -> usize {
        self.barrels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.barrels.is_empty()
    }

    /// Total documents over all barrels.
    pub fn doc_count(&self) -> u64 {
        self.barrels.iter().map(|b| b.doc_count).sum()
    }

    /// Unregister a barrel and delete its files.
    pub fn remove_barrel(&mut self, name: &str, storage: &dyn Storage) -> Result<Option<Barrel>> {
        let Some(index) = self.barrels.iter().position(|b| b.name == name) else {
            return Ok(None);
        };
        let barrel = self.barrels.remove(index);
        barrel.remove_files(storage)?;
        info!("removed barrel {name}");
        Ok(Some(barrel))
    }

    /// Replace the consecutive barrels `inputs` by their merge `output`.
    ///
    /// Returns the replaced barrels; their files are left for the caller to
    /// delete once the manifest no longer references them.
    pub fn replace_run(&mut self, inputs: &[String], output: Barrel) -> Result<Vec<Barrel>> {
        let Some(first) = inputs.first() else {
            return Err(IrIndexError::merge("empty merge input"));
        };
        let start = self
            .barrels
            .iter()
            .position(|b| &b.name == first)
            .ok_or_else(|| IrIndexError::merge(format!("barrel {first} is not registered")))?;
        let end = start + inputs.len();
        let consecutive = end <= self.barrels.len()
            && self.barrels[start..end]
                .iter()
                .zip(inputs)
                .all(|(barrel, name)| &barrel.name == name);
        if !consecutive {
            return Err(IrIndexError::merge(format!(
                "barrels {inputs:?} are not a consecutive run"
            )));
        }
        for (&collection, &max_doc) in &output.max_doc_ids {
            self.update_max_doc(collection, max_doc);
        }
        Ok(self.barrels.splice(start..end, [output]).collect())
    }

    pub fn update_max_doc(&mut self, collection: CollectionId, doc_id: DocId) {
        let max = self.max_doc_ids.entry(collection).or_insert(doc_id);
        *max = (*max).max(doc_id);
    }

    /// Largest doc id assigned in `collection`.
    pub fn max_doc(&self, collection: CollectionId) -> Option<DocId> {
        self.max_doc_ids.get(&collection).copied()
    }

    /// Every collection that has seen a document.
    pub fn collections(&self) -> impl Iterator<Item = CollectionId> + '_ {
        self.max_doc_ids.keys().copied()
    }

    /// Names of every file the manifest references.
    pub fn referenced_files(&self) -> BTreeSet<String> {
        self.barrels.iter().flat_map(Barrel::file_names).collect()
    }

    /// Persist the manifest: temporary file first, then rename.
    pub fn write(&self, storage: &dyn Storage) -> Result<()> {
        let content = serde_json::to_vec_pretty(self)?;
        let (temp_name, raw) = storage.create_temp_output(MANIFEST_FILE)?;
        let written = (|| -> Result<()> {
            let mut output = IndexOutput::new(raw)?;
            output.write_bytes(&content)?;
            output.close()
        })();
        if let Err(e) = written {
            let _ = storage.delete_file(&temp_name);
            return Err(e);
        }
        storage.rename_file(&temp_name, MANIFEST_FILE)?;
        debug!("wrote manifest with {} barrels", self.barrels.len());
        Ok(())
    }

    /// Load the manifest; an index without one is empty.
    pub fn read(storage: &dyn Storage) -> Result<Self> {
        if !storage.file_exists(MANIFEST_FILE) {
            return Ok(Self::new());
        }
        let mut input = IndexInput::new(storage.open_input(MANIFEST_FILE)?)?;
        let content = input.read_bytes(input.length() as usize)?;
        let mut manifest: BarrelsInfo = serde_json::from_slice(&content)?;
        if manifest.version != MANIFEST_VERSION {
            return Err(IrIndexError::corrupt(format!(
                "unsupported manifest version {}",
                manifest.version
            )));
        }

        // Never hand out a name that is already on disk.
        let highest = manifest
            .barrels
            .iter()
            .filter_map(|b| b.name.strip_prefix('_'))
            .filter_map(|n| n.parse::<u64>().ok())
            .max();
        if let Some(highest) = highest {
            manifest.barrel_counter = manifest.barrel_counter.max(highest + 1);
        }
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn barrel(name: &str, docs: u64, bases: &[(CollectionId, DocId, DocId)]) -> Barrel {
        let mut barrel = Barrel::new(name, PostingFormat::Chunk);
        barrel.doc_count = docs;
        barrel.searchable = true;
        for &(collection, base, max) in bases {
            barrel.base_doc_ids.insert(collection, base);
            barrel.max_doc_ids.insert(collection, max);
            barrel.fields.push(FieldKey::new(collection, 0));
        }
        barrel
    }

    #[test]
    fn test_manifest_round_trip() {
        let storage = MemoryStorage::new_default();
        let mut manifest = BarrelsInfo::new();
        for (i, docs) in [10u64, 3, 250].into_iter().enumerate() {
            let name = manifest.next_barrel_name();
            let base = i as DocId * 1000;
            manifest
                .add_barrel(barrel(&name, docs, &[(0, base, base + docs as DocId), (4, 7, 9)]))
                .unwrap();
        }
        manifest.write(&storage).unwrap();
        assert!(storage.file_exists(MANIFEST_FILE));

        let loaded = BarrelsInfo::read(&storage).unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.max_doc(0), Some(2250));
        assert_eq!(loaded.max_doc(4), Some(9));
        assert_eq!(loaded.barrels()[1].doc_count, 3);

        let temp_files = storage
            .list_files()
            .unwrap()
            .into_iter()
            .filter(|f| f.ends_with(".tmp"))
            .count();
        assert_eq!(temp_files, 0);
    }

    #[test]
    fn test_missing_manifest_is_empty() {
        let storage = MemoryStorage::new_default();
        let manifest = BarrelsInfo::read(&storage).unwrap();
        assert!(manifest.is_empty());
    }

    #[test]
    fn test_replace_run_requires_consecutive_barrels() {
        let mut manifest = BarrelsInfo::new();
        for name in ["_0", "_1", "_2"] {
            manifest.add_barrel(barrel(name, 1, &[(0, 0, 0)])).unwrap();
        }
        let names = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert!(manifest
            .replace_run(&names(&["_0", "_2"]), barrel("_3", 2, &[]))
            .is_err());
        let replaced = manifest
            .replace_run(&names(&["_1", "_2"]), barrel("_3", 2, &[]))
            .unwrap();
        assert_eq!(replaced.len(), 2);
        let order: Vec<_> = manifest.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(order, vec!["_0", "_3"]);
    }

    #[test]
    fn test_barrel_names_continue_after_reload() {
        let storage = MemoryStorage::new_default();
        let mut manifest = BarrelsInfo::new();
        manifest.add_barrel(barrel("_7", 1, &[(0, 0, 0)])).unwrap();
        manifest.write(&storage).unwrap();

        let mut loaded = BarrelsInfo::read(&storage).unwrap();
        assert_eq!(loaded.next_barrel_name(), "_8");
    }

    #[test]
    fn test_remove_barrel_deletes_files() {
        let storage = MemoryStorage::new_default();
        let mut manifest = BarrelsInfo::new();
        let b = barrel("_0", 1, &[(0, 0, 0)]);
        for name in b.file_names() {
            storage.create_output(&name).unwrap();
        }
        manifest.add_barrel(b).unwrap();
        assert_eq!(manifest.referenced_files().len(), 4);

        manifest.remove_barrel("_0", &storage).unwrap();
        assert!(manifest.is_empty());
        assert!(storage.list_files().unwrap().is_empty());
    }
}
