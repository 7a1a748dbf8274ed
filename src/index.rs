//! The inverted-index core: posting accumulation and encoding, barrels,
//! merging and the read path.

// Encoding building blocks
pub mod chunk;
pub mod pool;
pub mod skip_list;

// Postings and per-field files
pub mod doc_length;
pub mod external_sort;
pub mod field_indexer;
pub mod posting;
pub mod term_info;

// Barrels and their lifecycle
pub mod barrel;
pub mod doc_filter;
pub mod merge_manager;
pub mod merge_policy;
pub mod merger;
pub mod reader;
pub mod writer;

pub mod config;

use serde::{Deserialize, Serialize};

/// Document identifier, unique inside a collection.
pub type DocId = u32;

/// Term identifier handed out by the external id manager.
pub type TermId = u32;

pub type FieldId = u32;

pub type CollectionId = u32;

/// One indexed field of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldKey {
    pub collection: CollectionId,
    pub field: FieldId,
}

impl FieldKey {
    pub fn new(collection: CollectionId, field: FieldId) -> Self {
        FieldKey { collection, field }
    }
}

/// A term of one field of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TermKey {
    pub collection: CollectionId,
    pub field: FieldId,
    pub term: TermId,
}

impl TermKey {
    pub fn new(collection: CollectionId, field: FieldId, term: TermId) -> Self {
        TermKey {
            collection,
            field,
            term,
        }
    }

    pub fn field_key(&self) -> FieldKey {
        FieldKey::new(self.collection, self.field)
    }
}

/// Name of the segment manifest.
pub const MANIFEST_FILE: &str = "barrels.json";

/// Name of the writer lock; file storage holds it as `write.lock`.
pub const WRITE_LOCK: &str = "write";

/// Vocabulary file of one field of a barrel.
pub fn vocabulary_file(barrel: &str, key: FieldKey) -> String {
    field_file(barrel, key, "voc")
}

/// Doc stream (skip lists and doc chunks) of one field of a barrel.
pub fn doc_posting_file(barrel: &str, key: FieldKey) -> String {
    field_file(barrel, key, "dfp")
}

/// Position stream of one field of a barrel.
pub fn position_posting_file(barrel: &str, key: FieldKey) -> String {
    field_file(barrel, key, "pop")
}

/// Document lengths of one field of a barrel.
pub fn doc_length_file(barrel: &str, key: FieldKey) -> String {
    field_file(barrel, key, "dln")
}

/// Deleted-document filter of a collection.
pub fn doc_filter_file(collection: CollectionId) -> String {
    format!("deleted.c{collection}")
}

fn field_file(barrel: &str, key: FieldKey, extension: &str) -> String {
    format!("{barrel}.c{}f{}.{extension}", key.collection, key.field)
}

/// The barrel a file belongs to, if it is a barrel file.
pub fn barrel_of_file(name: &str) -> Option<&str> {
    let (barrel, rest) = name.split_once('.')?;
    let is_field_file = rest.starts_with('c')
        && [".voc", ".dfp", ".pop", ".dln"]
            .iter()
            .any(|ext| rest.ends_with(ext));
    is_field_file.then_some(barrel)
}
