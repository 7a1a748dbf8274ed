//! Error types for the irindex library.
//!
//! All fallible operations return [`Result`], whose error side is the
//! [`IrIndexError`] enum. The variants follow the failure classes the
//! indexing core distinguishes:
//!
//! - allocation failures while accumulating or merging postings
//!   ([`IrIndexError::OutOfMemory`]),
//! - I/O failures on vocabulary, posting or manifest files
//!   ([`IrIndexError::Io`] and [`IrIndexError::Storage`]),
//! - malformed var-byte data or skip offsets ([`IrIndexError::CorruptData`]).
//!
//! # Examples
//!
//! ```
//! use irindex::error::{IrIndexError, Result};
//!
//! fn example_operation() -> Result<()> {
//!     Err(IrIndexError::invalid_argument("skip interval must be at least 2"))
//! }
//!
//! assert!(example_operation().is_err());
//! ```

use std::io;

use thiserror::Error;

/// The main error type for irindex operations.
#[derive(Error, Debug)]
pub enum IrIndexError {
    /// I/O errors raised by the storage backends.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A pool or buffer allocation could not be satisfied.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Encoded data did not decode (bad var-int, bad offsets, bad magic).
    #[error("Corrupt data: {0}")]
    CorruptData(String),

    /// Index-level errors (unknown barrel, unknown field, ...).
    #[error("Index error: {0}")]
    Index(String),

    /// Storage-related errors.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid argument supplied by the caller.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not allowed in the current state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Segment merge failures.
    #[error("Merge error: {0}")]
    Merge(String),

    /// Background thread could not be joined.
    #[error("Thread join error: {0}")]
    ThreadJoin(String),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases.
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error.
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with IrIndexError.
pub type Result<T> = std::result::Result<T, IrIndexError>;

impl IrIndexError {
    /// Create a new out-of-memory error.
    pub fn out_of_memory<S: Into<String>>(msg: S) -> Self {
        IrIndexError::OutOfMemory(msg.into())
    }

    /// Create a new corrupt-data error.
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        IrIndexError::CorruptData(msg.into())
    }

    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        IrIndexError::Index(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        IrIndexError::Storage(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        IrIndexError::InvalidArgument(msg.into())
    }

    /// Create a new invalid operation error.
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        IrIndexError::InvalidOperation(msg.into())
    }

    /// Create a new invalid config error.
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        IrIndexError::InvalidArgument(format!("Invalid configuration: {}", msg.into()))
    }

    /// Create a new merge error.
    pub fn merge<S: Into<String>>(msg: S) -> Self {
        IrIndexError::Merge(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        IrIndexError::Other(msg.into())
    }

    /// Whether this error reports an allocation failure.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, IrIndexError::OutOfMemory(_))
    }

    /// Whether this error reports malformed encoded data.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, IrIndexError::CorruptData(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = IrIndexError::index("unknown barrel b3");
        assert_eq!(error.to_string(), "Index error: unknown barrel b3");

        let error = IrIndexError::out_of_memory("pool budget exhausted");
        assert_eq!(error.to_string(), "Out of memory: pool budget exhausted");
        assert!(error.is_out_of_memory());

        let error = IrIndexError::corrupt("var-int overflow");
        assert!(error.is_corrupt());
        assert!(!error.is_out_of_memory());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let error = IrIndexError::from(io_error);

        match error {
            IrIndexError::Io(_) => {}
            _ => panic!("Expected IO error variant"),
        }
    }

    #[test]
    fn test_invalid_config_message() {
        let error = IrIndexError::invalid_config("chunk_capacity must be > 0");
        assert_eq!(
            error.to_string(),
            "Invalid argument: Invalid configuration: chunk_capacity must be > 0"
        );
    }
}
