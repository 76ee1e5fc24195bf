//! Error handling for tansu operations.
//!
//! All public APIs return `Result<T, TansuError>`. Store lookups that can
//! legitimately miss (`get`, `vsiz`) return `Ok(None)` instead of an error,
//! and removals report a missing record as `Ok(false)`; errors are reserved
//! for I/O, corruption, and misuse.

use std::io;
use thiserror::Error;

/// Result type for tansu operations.
pub type Result<T> = std::result::Result<T, TansuError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum TansuError {
    /// I/O error from the underlying filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Data corruption detected in the database file or journal.
    ///
    /// Checksum mismatches, truncated pages, and malformed records all
    /// surface as this variant. The file may be repairable with `optimize`
    /// on a copy, but data loss is possible.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// Requested resource was not found.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Invalid argument or operation.
    ///
    /// Oversized keys, nested transactions, mutating a reader handle's
    /// tuning, and comparator mismatches all report this variant.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `put_keep` refused to overwrite an existing record.
    #[error("record already exists")]
    KeyExists,

    /// A mutating operation was attempted on a store opened read-only.
    #[error("database opened as reader")]
    ReadOnly,

    /// The database file is locked by another process.
    #[error("database file is locked")]
    Locked,
}
