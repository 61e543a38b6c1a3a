//! Page layer: slotted page format with cell-based layout.
//!
//! This module implements the in-memory view of a B-tree page.
//! Pages use a slotted format where:
//! - A fixed header contains metadata
//! - Cell pointers grow from the header toward the end
//! - Cell content grows from the end toward the header
//! - Free space is in the middle
//!
//! The page size is a runtime property of the buffer, so the same code serves
//! every page size the pager accepts.

mod cell;
mod header;
mod slotted;

pub use cell::{Cell, CellType};
pub use header::{PageHeader, INTERIOR_HEADER_SIZE, LEAF_HEADER_SIZE};
pub use slotted::SlottedPage;

/// A raw page buffer of a fixed length chosen at creation
#[derive(Clone, PartialEq, Eq)]
pub struct PageBuf {
    data: Box<[u8]>,
}

impl PageBuf {
    /// Create a new zeroed page buffer
    pub fn new(page_size: usize) -> Self {
        Self {
            data: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    /// Create a page buffer of `page_size` bytes from raw bytes.
    ///
    /// Shorter input is zero-padded, longer input is truncated.
    pub fn from_bytes(bytes: &[u8], page_size: usize) -> Self {
        let mut buf = Self::new(page_size);
        let len = bytes.len().min(page_size);
        buf.data[..len].copy_from_slice(&bytes[..len]);
        buf
    }

    /// Size of the page in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer has zero length
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get a reference to the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get a mutable reference to the raw bytes
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for PageBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBuf").field("len", &self.data.len()).finish()
    }
}

impl std::ops::Deref for PageBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl std::ops::DerefMut for PageBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl AsRef<[u8]> for PageBuf {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
