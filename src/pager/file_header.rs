//! Database file header.
//!
//! The first page (page 0) of the database file contains metadata
//! about the database. Only the first [`FILE_HEADER_LEN`] bytes are used;
//! the rest of the page is zero.

use crate::error::{Result, StorageError};
use crate::types::{is_valid_page_size, PageId};

/// Magic bytes to identify a valid database file
pub const MAGIC: &[u8; 16] = b"SharedBtreeV001\0";

/// Bytes of page 0 occupied by the header
pub const FILE_HEADER_LEN: usize = 40;

/// Database file header
///
/// Layout:
/// ```text
/// Offset  Size  Description
/// 0       16    Magic string "SharedBtreeV001\0"
/// 16      4     Page size
/// 20      4     Total page count
/// 24      4     First freelist page (0 if none)
/// 28      4     Freelist page count
/// 32      4     Change counter, bumped by every commit
/// 36      4     Checksum of bytes 0..36 (CRC32)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Page size in bytes
    pub page_size: u32,
    /// Total number of pages in the file (including header page)
    pub page_count: u32,
    /// First page in the free list (0 if no free pages)
    pub first_free_page: PageId,
    /// Number of free pages
    pub free_page_count: u32,
    /// Number of committed write transactions
    pub change_counter: u32,
}

impl FileHeader {
    /// Create a new file header for an empty database
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size as u32,
            page_count: 1,
            first_free_page: PageId::HEADER,
            free_page_count: 0,
            change_counter: 0,
        }
    }

    /// Read a file header from bytes
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FILE_HEADER_LEN {
            return Err(StorageError::invalid_db("header too short"));
        }

        if &bytes[0..16] != MAGIC {
            return Err(StorageError::invalid_db("invalid magic bytes"));
        }

        let field = |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);

        let stored_checksum = field(36);
        let computed_checksum = crc32fast::hash(&bytes[0..36]);
        if stored_checksum != computed_checksum {
            return Err(StorageError::corruption("header checksum mismatch"));
        }

        let page_size = field(16);
        if !is_valid_page_size(page_size as usize) {
            return Err(StorageError::invalid_db(format!(
                "unsupported page size: {}",
                page_size
            )));
        }

        let header = Self {
            page_size,
            page_count: field(20),
            first_free_page: PageId::new(field(24)),
            free_page_count: field(28),
            change_counter: field(32),
        };
        if header.page_count == 0 || header.free_page_count >= header.page_count {
            return Err(StorageError::corruption(format!(
                "inconsistent page counts: {} pages, {} free",
                header.page_count, header.free_page_count
            )));
        }
        Ok(header)
    }

    /// Write this header to the start of `bytes`
    pub fn write(&self, bytes: &mut [u8]) {
        bytes[..FILE_HEADER_LEN].fill(0);
        bytes[0..16].copy_from_slice(MAGIC);

        bytes[16..20].copy_from_slice(&self.page_size.to_be_bytes());
        bytes[20..24].copy_from_slice(&self.page_count.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.first_free_page.value().to_be_bytes());
        bytes[28..32].copy_from_slice(&self.free_page_count.to_be_bytes());
        bytes[32..36].copy_from_slice(&self.change_counter.to_be_bytes());

        let checksum = crc32fast::hash(&bytes[0..36]);
        bytes[36..40].copy_from_slice(&checksum.to_be_bytes());
    }

    /// Allocate a new page at the end of the file
    pub fn allocate_page(&mut self) -> PageId {
        let page_id = PageId::new(self.page_count);
        self.page_count += 1;
        page_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FileHeader {
            page_size: 1024,
            page_count: 100,
            first_free_page: PageId::new(50),
            free_page_count: 5,
            change_counter: 7,
        };

        let mut bytes = vec![0u8; 1024];
        header.write(&mut bytes);

        assert_eq!(FileHeader::read(&bytes).unwrap(), header);
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = vec![0u8; FILE_HEADER_LEN];
        bytes[0..16].copy_from_slice(b"InvalidMagic0000");

        assert!(matches!(
            FileHeader::read(&bytes),
            Err(StorageError::InvalidDatabaseFile(_))
        ));
    }

    #[test]
    fn test_checksum_validation() {
        let mut bytes = vec![0u8; FILE_HEADER_LEN];
        FileHeader::new(4096).write(&mut bytes);

        bytes[20] ^= 0xFF;

        assert!(matches!(
            FileHeader::read(&bytes),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_rejects_bad_page_size() {
        let mut bytes = vec![0u8; FILE_HEADER_LEN];
        FileHeader::new(1000).write(&mut bytes);
        assert!(FileHeader::read(&bytes).is_err());
    }

    #[test]
    fn test_allocate_page() {
        let mut header = FileHeader::new(4096);
        assert_eq!(header.page_count, 1);

        assert_eq!(header.allocate_page(), PageId::new(1));
        assert_eq!(header.allocate_page(), PageId::new(2));
        assert_eq!(header.page_count, 3);
    }
}
