//! Common types used throughout the storage engine.

mod page_id;
mod varint;

pub use page_id::PageId;
pub use varint::{
    decode_varint, encode_varint, put_varint, varint_size, zigzag_decode, zigzag_encode,
    MAX_VARINT_LEN,
};

use serde::{Deserialize, Serialize};

/// Default page size in bytes (4KB)
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest page size accepted by the pager
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest page size accepted by the pager
pub const MAX_PAGE_SIZE: usize = 65536;

/// Default cache budget: negative values are a size in KiB, positive values a page count
pub const DEFAULT_CACHE_SIZE: i64 = -2000;

/// Default number of dirty pages held in the cache before spilling to the pager
pub const DEFAULT_SPILL_SIZE: usize = 64;

/// Check that a page size is a power of two within the supported range
pub fn is_valid_page_size(size: usize) -> bool {
    (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size) && size.is_power_of_two()
}

/// Largest payload stored in a single cell for a given page size.
///
/// Overflow pages are not supported, so the limit keeps at least four
/// cells per leaf.
pub fn max_payload(page_size: usize) -> usize {
    page_size / 4 - 24
}

/// Transaction level of a handle or of the shared state.
///
/// The ordering is meaningful: `None < Read < Write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransState {
    /// No transaction open
    None,
    /// Read transaction open
    Read,
    /// Write transaction open
    Write,
}

impl Default for TransState {
    fn default() -> Self {
        Self::None
    }
}

/// Page types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Free/unallocated page
    Free = 0x00,
    /// Interior node of a table B-tree (keys + child pointers)
    InteriorTable = 0x05,
    /// Leaf node of a table B-tree (keys + payloads)
    LeafTable = 0x0D,
}

impl PageType {
    /// Check if this is a leaf page type
    pub fn is_leaf(self) -> bool {
        matches!(self, Self::LeafTable)
    }

    /// Check if this is an interior page type
    pub fn is_interior(self) -> bool {
        matches!(self, Self::InteriorTable)
    }

    /// Convert from byte value
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Free),
            0x05 => Some(Self::InteriorTable),
            0x0D => Some(Self::LeafTable),
            _ => None,
        }
    }
}
