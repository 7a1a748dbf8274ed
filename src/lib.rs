//! # irindex
//!
//! The core of an inverted index: positional posting lists built in
//! memory, written as immutable barrels, merged in the background and
//! read back with sub-linear `skip_to`.
//!
//! ## Features
//!
//! - Var-byte chunked postings in two layouts (chunk and block)
//! - Multi-level skip lists, rebased rather than rebuilt when merging
//! - Arena pools charged to a shared memory budget with clean rollback
//! - External-sort ingestion for bounded-memory indexing
//! - Level merge policy, optional background merge thread
//! - Deleted-document filters and garbage-collecting merges
//! - Pluggable storage: file system or memory
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use irindex::document::Document;
//! use irindex::index::TermKey;
//! use irindex::index::config::IndexConfig;
//! use irindex::index::writer::IndexWriter;
//! use irindex::storage::Storage;
//! use irindex::storage::memory::MemoryStorage;
//!
//! # fn main() -> irindex::error::Result<()> {
//! let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
//! let mut writer = IndexWriter::open(storage, IndexConfig::default())?;
//! for doc_id in 1..=3 {
//!     writer.index_document(&Document::builder(0, doc_id).add_tokens(0, [7, 8]).build())?;
//! }
//! writer.commit()?;
//!
//! let reader = writer.reader()?;
//! assert_eq!(reader.doc_freq(TermKey::new(0, 0, 7)), 3);
//! # Ok(())
//! # }
//! ```

pub mod document;
pub mod error;
pub mod index;
pub mod storage;
pub mod util;

pub mod prelude {
    pub use crate::document::{Document, DocumentBuilder};
    pub use crate::error::{IrIndexError, Result};
    pub use crate::index::config::{IndexConfig, IndexingMode, MergePolicyConfig, PostingFormat};
    pub use crate::index::reader::{IndexReader, MultiTermPositions};
    pub use crate::index::writer::{IndexWriter, RealtimeReader};
    pub use crate::index::{CollectionId, DocId, FieldId, FieldKey, TermId, TermKey};
    pub use crate::storage::{Storage, StorageConfig, StorageFactory};
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
