//! Pager layer: durable page I/O behind a narrow trait.
//!
//! The B-tree only talks to a [`Pager`]. [`FilePager`] implements it over a
//! single database file with a rollback journal; tests wrap it to inject
//! failures.

mod file_header;
mod file_pager;
mod freelist;

pub use file_header::{FileHeader, FILE_HEADER_LEN};
pub use file_pager::{journal_path, FilePager};
pub use freelist::FreeList;

use crate::error::Result;
use crate::page::PageBuf;
use crate::types::PageId;

/// Durable page storage with two-phase commit
pub trait Pager: Send {
    /// Bytes per page
    fn page_size(&self) -> usize;

    /// Change the page size of a database that holds no pages yet
    fn set_page_size(&mut self, page_size: usize) -> Result<()>;

    /// Number of pages in the file, including the header page
    fn page_count(&self) -> u32;

    /// Read a B-tree page
    fn read_page(&mut self, page_id: PageId) -> Result<PageBuf>;

    /// Open a write transaction
    fn begin(&mut self) -> Result<()>;

    /// Whether a write transaction is open
    fn in_write(&self) -> bool;

    /// Write a page inside the write transaction
    fn write_page(&mut self, page_id: PageId, data: &[u8]) -> Result<()>;

    /// Hand out a page, reusing the freelist first
    fn allocate_page(&mut self) -> Result<PageId>;

    /// Return a page to the freelist
    fn free_page(&mut self, page_id: PageId) -> Result<()>;

    /// Number of pages on the freelist
    fn free_page_count(&self) -> u32;

    /// Write out the file header and make the journal durable
    fn commit_phase_one(&mut self) -> Result<()>;

    /// Finish the commit: sync the file and drop the journal.
    ///
    /// Increments [`Pager::data_version`] by one on every call made inside a
    /// transaction, whether or not the commit then succeeds.
    fn commit_phase_two(&mut self) -> Result<()>;

    /// Undo every change made since `begin`
    fn rollback(&mut self) -> Result<()>;

    /// Counter bumped once per finished write transaction
    fn data_version(&self) -> u64;
}
