//! Free list management.
//!
//! Freed pages form a linked list on disk: each free page starts with the
//! free page type byte followed by the number of the next free page (0 ends
//! the list). The file header holds the head and the length. [`FreeList`]
//! mirrors the chain in memory so allocation never has to read it back.

use crate::types::{PageId, PageType};

/// In-memory mirror of the on-disk freelist chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeList {
    /// Free pages, head of the chain last
    pages: Vec<PageId>,
}

impl FreeList {
    /// Create a new empty free list
    pub fn new() -> Self {
        Self { pages: Vec::new() }
    }

    /// Build from a chain walked head first
    pub fn from_chain(chain: Vec<PageId>) -> Self {
        let mut pages = chain;
        pages.reverse();
        Self { pages }
    }

    /// Head of the chain (0 if empty)
    pub fn head(&self) -> PageId {
        self.pages.last().copied().unwrap_or(PageId::HEADER)
    }

    /// Push a page onto the chain, making it the new head
    pub fn push(&mut self, page_id: PageId) {
        self.pages.push(page_id);
    }

    /// Take the head of the chain
    pub fn pop(&mut self) -> Option<PageId> {
        self.pages.pop()
    }

    /// Get the number of free pages
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Check if the free list is empty
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Whether a page is on the list
    pub fn contains(&self, page_id: PageId) -> bool {
        self.pages.contains(&page_id)
    }

    /// Page image for a free page linking to `next`
    pub fn encode_link(next: PageId, page_size: usize) -> Vec<u8> {
        let mut image = vec![0u8; page_size];
        image[0] = PageType::Free as u8;
        image[1..5].copy_from_slice(&next.value().to_be_bytes());
        image
    }

    /// Next pointer stored in a free page, `None` if the page is not free
    pub fn decode_link(image: &[u8]) -> Option<PageId> {
        if image.len() < 5 || image[0] != PageType::Free as u8 {
            return None;
        }
        Some(PageId::new(u32::from_be_bytes([
            image[1], image[2], image[3], image[4],
        ])))
    }
}
