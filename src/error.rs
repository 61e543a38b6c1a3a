//! Error types for the storage engine.

use crate::types::PageId;
use thiserror::Error;

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error from the underlying file system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested page is beyond the end of the database
    #[error("Page {0} not found")]
    PageNotFound(PageId),

    /// Page does not have enough space for the operation
    #[error("Page {page_id} is full, need {needed} bytes but only {available} available")]
    PageFull {
        page_id: PageId,
        needed: usize,
        available: usize,
    },

    /// Payload exceeds what a single cell can hold
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Data corruption detected (e.g., checksum mismatch, malformed page)
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Invalid page format or type
    #[error("Invalid page: {0}")]
    InvalidPage(String),

    /// Allocation of a page cache or page frame failed
    #[error("Out of memory: {0}")]
    NoMem(String),

    /// Another handle holds the write transaction
    #[error("Database is busy: {0}")]
    Busy(String),

    /// Write attempted without a write transaction or through a read-only cursor
    #[error("Read-only: {0}")]
    ReadOnly(String),

    /// Invalid operation for the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The cursor hit an unrecoverable error and must be repositioned
    #[error("Cursor fault: {0}")]
    CursorFault(String),

    /// Database file is corrupted or has invalid format
    #[error("Invalid database file: {0}")]
    InvalidDatabaseFile(String),
}

impl StorageError {
    /// Create a corruption error with a message
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create an invalid page error
    pub fn invalid_page(msg: impl Into<String>) -> Self {
        Self::InvalidPage(msg.into())
    }

    /// Create an invalid operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Create an invalid database file error
    pub fn invalid_db(msg: impl Into<String>) -> Self {
        Self::InvalidDatabaseFile(msg.into())
    }

    /// Create an out-of-memory error
    pub fn no_mem(msg: impl Into<String>) -> Self {
        Self::NoMem(msg.into())
    }

    /// Create a read-only error
    pub fn read_only(msg: impl Into<String>) -> Self {
        Self::ReadOnly(msg.into())
    }

    /// Whether the error came from disk I/O or detected corruption.
    ///
    /// These are the errors that fault a cursor during a tree descent.
    pub fn is_io_or_corruption(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Corruption(_)
                | Self::InvalidPage(_)
                | Self::PageNotFound(_)
                | Self::InvalidDatabaseFile(_)
        )
    }
}
