//! Configuration for the indexing core.
//!
//! [`IndexConfig`] gathers every knob the writer, the posting accumulators
//! and the merger read. It serializes with serde so deployments can keep it
//! in a JSON file next to the index.
//!
//! ```
//! use irindex::index::config::{IndexConfig, PostingFormat};
//!
//! let config = IndexConfig::from_json_str(r#"{ "chunk_capacity": 64, "posting_format": "Block" }"#).unwrap();
//! assert_eq!(config.chunk_capacity, 64);
//! assert_eq!(config.posting_format, PostingFormat::Block);
//! assert_eq!(config.skip_interval, 8);
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IrIndexError, Result};

/// On-disk grouping of posting chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PostingFormat {
    /// Chunks are written back to back; skip points every `skip_interval` postings.
    #[default]
    Chunk,
    /// Chunks are grouped into blocks; skip points at block boundaries.
    Block,
}

/// How a field indexer ingests postings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IndexingMode {
    /// Accumulate postings per term in memory.
    #[default]
    InMemory,
    /// Spill `(term, doc, position)` tuples into sorted runs and build
    /// postings at flush time.
    ExternalSort {
        /// Tuples per sorted run.
        run_size: usize,
    },
}

/// Which merge policy the writer consults after every flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergePolicyConfig {
    /// Level-structured merging, see [`crate::index::merge_policy::LevelMergePolicy`].
    Level {
        /// Barrels per level that trigger a merge.
        collision_factor: usize,
    },
    /// Never merge automatically.
    NoMerge,
}

impl Default for MergePolicyConfig {
    fn default() -> Self {
        MergePolicyConfig::Level {
            collision_factor: 3,
        }
    }
}

/// Configuration of an index writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Level-0 skip point cadence in postings; also the promotion factor.
    pub skip_interval: u32,

    /// Maximum skip-list height.
    pub max_skip_level: u32,

    /// Postings per sealed chunk.
    pub chunk_capacity: usize,

    /// Chunks per block (block format only).
    pub block_chunks: usize,

    /// On-disk chunk grouping for newly written postings.
    pub posting_format: PostingFormat,

    /// Bytes in the first pool chunk of an accumulator.
    pub initial_pool_chunk_size: usize,

    /// Growth of successive pool chunks.
    pub pool_growth_factor: f64,

    /// Cap on a single pool chunk.
    pub max_pool_chunk_size: usize,

    /// Accumulator memory that marks the open barrel full.
    pub memory_cache_size: u64,

    /// Hard memory budget; exceeding it raises `OutOfMemory`.
    pub memory_limit: Option<u64>,

    /// Document count that marks the open barrel full.
    pub max_docs_per_barrel: u64,

    /// Posting ingestion mode.
    pub indexing_mode: IndexingMode,

    /// Allow concurrent term readers over the open barrel.
    pub realtime: bool,

    /// Merge policy consulted after every flush.
    pub merge_policy: MergePolicyConfig,

    /// Run merges on the background merge-manager thread.
    pub background_merge: bool,

    /// Drop deleted documents while merging.
    pub gc_on_merge: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            skip_interval: 8,
            max_skip_level: 4,
            chunk_capacity: 128,
            block_chunks: 4,
            posting_format: PostingFormat::Chunk,
            initial_pool_chunk_size: 256,
            pool_growth_factor: 2.0,
            max_pool_chunk_size: 64 * 1024,
            memory_cache_size: 64 * 1024 * 1024,
            memory_limit: None,
            max_docs_per_barrel: 1_000_000,
            indexing_mode: IndexingMode::InMemory,
            realtime: false,
            merge_policy: MergePolicyConfig::default(),
            background_merge: false,
            gc_on_merge: true,
        }
    }
}

impl IndexConfig {
    /// Parse a configuration from JSON; missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: IndexConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Reject settings the codecs cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.skip_interval < 2 {
            return Err(IrIndexError::invalid_config("skip_interval must be at least 2"));
        }
        if self.max_skip_level == 0 {
            return Err(IrIndexError::invalid_config("max_skip_level must be > 0"));
        }
        if self.chunk_capacity == 0 {
            return Err(IrIndexError::invalid_config("chunk_capacity must be > 0"));
        }
        if self.block_chunks == 0 {
            return Err(IrIndexError::invalid_config("block_chunks must be > 0"));
        }
        if self.initial_pool_chunk_size == 0 || self.max_pool_chunk_size == 0 {
            return Err(IrIndexError::invalid_config("pool chunk sizes must be > 0"));
        }
        if self.initial_pool_chunk_size > self.max_pool_chunk_size {
            return Err(IrIndexError::invalid_config(
                "initial_pool_chunk_size must not exceed max_pool_chunk_size",
            ));
        }
        if !(self.pool_growth_factor >= 1.0) {
            return Err(IrIndexError::invalid_config("pool_growth_factor must be >= 1.0"));
        }
        if self.max_docs_per_barrel == 0 {
            return Err(IrIndexError::invalid_config("max_docs_per_barrel must be > 0"));
        }
        if let IndexingMode::ExternalSort { run_size: 0 } = self.indexing_mode {
            return Err(IrIndexError::invalid_config("run_size must be > 0"));
        }
        if self.realtime && matches!(self.indexing_mode, IndexingMode::ExternalSort { .. }) {
            return Err(IrIndexError::invalid_config(
                "realtime readers need in-memory indexing",
            ));
        }
        if let MergePolicyConfig::Level { collision_factor } = self.merge_policy {
            if collision_factor < 2 {
                return Err(IrIndexError::invalid_config(
                    "collision_factor must be at least 2",
                ));
            }
        }
        Ok(())
    }

    /// The subset of settings a posting accumulator needs.
    pub fn posting_config(&self) -> PostingConfig {
        PostingConfig {
            skip_interval: self.skip_interval,
            max_skip_level: self.max_skip_level,
            chunk_capacity: self.chunk_capacity,
            block_chunks: self.block_chunks,
            format: self.posting_format,
            pool: PoolConfig {
                initial_chunk_size: self.initial_pool_chunk_size,
                growth_factor: self.pool_growth_factor,
                max_chunk_size: self.max_pool_chunk_size,
            },
        }
    }
}

/// Growth settings of a [`crate::index::pool::VariantDataPool`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolConfig {
    pub initial_chunk_size: usize,
    pub growth_factor: f64,
    pub max_chunk_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        IndexConfig::default().posting_config().pool
    }
}

/// Settings shared by posting writers, mergers and readers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostingConfig {
    pub skip_interval: u32,
    pub max_skip_level: u32,
    pub chunk_capacity: usize,
    pub block_chunks: usize,
    pub format: PostingFormat,
    pub pool: PoolConfig,
}

impl Default for PostingConfig {
    fn default() -> Self {
        IndexConfig::default().posting_config()
    }
}
