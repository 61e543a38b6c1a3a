//! Header at the start of every B-tree page.
//!
//! Offsets are relative to the page, whose size is only known at run time.
//! The content-area offset is stored in two bytes, so a 65536-byte page with
//! an empty content area writes it as 0.
//!
//! ```text
//! 0   1  page type
//! 1   2  first freeblock (unused, kept zero)
//! 3   2  cell count
//! 5   2  start of cell content (0 = 65536)
//! 7   1  fragmented free bytes
//! 8   4  right-most child (interior pages only)
//! ```

use crate::types::{PageType, MAX_PAGE_SIZE};

pub const LEAF_HEADER_SIZE: usize = 8;
pub const INTERIOR_HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub page_type: PageType,
    pub first_freeblock: u16,
    pub cell_count: u16,
    /// Offset of the lowest cell byte; equals the page size when the page is empty
    pub cell_content_start: u32,
    /// Bytes lost to fragments too small to reuse (saturating)
    pub fragmented_bytes: u8,
    /// Raw page number of the right-most child, 0 on leaves
    pub right_child: u32,
}

impl PageHeader {
    /// Header of an empty page of `page_size` bytes
    pub fn empty(page_type: PageType, page_size: usize) -> Self {
        Self {
            page_type,
            first_freeblock: 0,
            cell_count: 0,
            cell_content_start: page_size as u32,
            fragmented_bytes: 0,
            right_child: 0,
        }
    }

    pub fn new_leaf(page_size: usize) -> Self {
        Self::empty(PageType::LeafTable, page_size)
    }

    pub fn new_interior(page_size: usize) -> Self {
        Self::empty(PageType::InteriorTable, page_size)
    }

    /// Bytes the header takes for a page of this type
    pub const fn encoded_len(page_type: PageType) -> usize {
        match page_type {
            PageType::InteriorTable => INTERIOR_HEADER_SIZE,
            _ => LEAF_HEADER_SIZE,
        }
    }

    /// Decode the header of a whole page image.
    ///
    /// The page size is the length of `page`. Returns `None` for an unknown
    /// page type, a page too short for its header, or a content offset past
    /// the end of the page.
    pub fn read(page: &[u8]) -> Option<Self> {
        let page_type = PageType::from_byte(*page.first()?)?;
        if page.len() < Self::encoded_len(page_type) {
            return None;
        }

        let u16_at = |at: usize| u16::from_be_bytes([page[at], page[at + 1]]);
        let cell_content_start = match u16_at(5) {
            0 if page.len() == MAX_PAGE_SIZE => MAX_PAGE_SIZE as u32,
            0 => return None,
            raw => u32::from(raw),
        };
        if cell_content_start as usize > page.len() {
            return None;
        }

        let right_child = if page_type.is_interior() {
            u32::from_be_bytes([page[8], page[9], page[10], page[11]])
        } else {
            0
        };

        Some(Self {
            page_type,
            first_freeblock: u16_at(1),
            cell_count: u16_at(3),
            cell_content_start,
            fragmented_bytes: page[7],
            right_child,
        })
    }

    /// Encode into the front of `page`
    pub fn write(&self, page: &mut [u8]) {
        page[0] = self.page_type as u8;
        page[1..3].copy_from_slice(&self.first_freeblock.to_be_bytes());
        page[3..5].copy_from_slice(&self.cell_count.to_be_bytes());
        page[5..7].copy_from_slice(&(self.cell_content_start as u16).to_be_bytes());
        page[7] = self.fragmented_bytes;
        if self.page_type.is_interior() {
            page[8..12].copy_from_slice(&self.right_child.to_be_bytes());
        }
    }

    /// Offset of the first cell pointer
    pub fn cell_pointer_offset(&self) -> usize {
        Self::encoded_len(self.page_type)
    }

    pub fn cell_pointer_array_end(&self) -> usize {
        self.cell_pointer_offset() + self.cell_count as usize * 2
    }

    /// Gap between the pointer array and the content area
    pub fn free_space(&self) -> usize {
        (self.cell_content_start as usize).saturating_sub(self.cell_pointer_array_end())
    }
}
