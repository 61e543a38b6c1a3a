//! Slotted page implementation.
//!
//! A slotted page uses the following layout:
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │                    Page Header                      │
//! ├────────────────────────────────────────────────────┤
//! │                 Cell Pointer Array                  │
//! │  [ptr0][ptr1][ptr2]...      →                      │
//! ├────────────────────────────────────────────────────┤
//! │                                                    │
//! │                   Free Space                        │
//! │                                                    │
//! ├────────────────────────────────────────────────────┤
//! │                 Cell Content Area                   │
//! │      ←  [cell2][cell1][cell0]                      │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! Cell pointers are sorted by key order for binary search.
//! Cell content grows from the end of the page toward the header.
//!
//! Interior pages route a key to the left child of the first cell whose key
//! is greater than or equal to it, or to the right child when no such cell
//! exists. Child index `i < cell_count` names `cell[i].left_child`; child
//! index `cell_count` names the right child.

use crate::error::{Result, StorageError};
use crate::page::{Cell, PageBuf, PageHeader};
use crate::types::{PageId, PageType};

/// A slotted page providing cell-based storage
#[derive(Clone)]
pub struct SlottedPage {
    /// The raw page data
    data: PageBuf,
    /// Cached header (kept in sync with data)
    header: PageHeader,
}

impl SlottedPage {
    /// Create a new empty leaf page
    pub fn new_leaf(page_size: usize) -> Self {
        let mut data = PageBuf::new(page_size);
        let header = PageHeader::new_leaf(page_size);
        header.write(&mut data);
        Self { data, header }
    }

    /// Create a new empty interior page
    pub fn new_interior(page_size: usize) -> Self {
        let mut data = PageBuf::new(page_size);
        let header = PageHeader::new_interior(page_size);
        header.write(&mut data);
        Self { data, header }
    }

    /// Build a leaf page holding `cells` (which must be sorted by key)
    pub fn leaf_from_cells(page_size: usize, cells: &[Cell]) -> Result<Self> {
        let mut page = Self::new_leaf(page_size);
        for (i, cell) in cells.iter().enumerate() {
            page.insert_cell_at(i, cell)?;
        }
        Ok(page)
    }

    /// Build an interior page holding `cells` (sorted by key) and a right child
    pub fn interior_from_cells(
        page_size: usize,
        cells: &[Cell],
        right_child: PageId,
    ) -> Result<Self> {
        let mut page = Self::new_interior(page_size);
        page.set_right_child(right_child);
        for (i, cell) in cells.iter().enumerate() {
            page.insert_cell_at(i, cell)?;
        }
        Ok(page)
    }

    /// Load a page from raw bytes; the page size is the length of `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let data = PageBuf::from_bytes(bytes, bytes.len());
        let header = PageHeader::read(&data)
            .ok_or_else(|| StorageError::invalid_page("invalid page header"))?;
        if header.page_type == PageType::Free {
            return Err(StorageError::invalid_page("free page used as B-tree page"));
        }
        if header.cell_content_start as usize > data.len()
            || header.cell_pointer_array_end() > header.cell_content_start as usize
        {
            return Err(StorageError::corruption("page header offsets out of range"));
        }
        Ok(Self { data, header })
    }

    /// Get the raw bytes of this page
    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    /// Size of this page in bytes
    pub fn page_size(&self) -> usize {
        self.data.len()
    }

    /// Get the page header
    pub fn header(&self) -> &PageHeader {
        &self.header
    }

    /// Get the number of cells in this page
    pub fn cell_count(&self) -> usize {
        self.header.cell_count as usize
    }

    /// Check if this is a leaf page
    pub fn is_leaf(&self) -> bool {
        self.header.page_type.is_leaf()
    }

    /// Check if this is an interior page
    pub fn is_interior(&self) -> bool {
        self.header.page_type.is_interior()
    }

    /// Get the right-most child pointer (for interior pages)
    pub fn right_child(&self) -> PageId {
        PageId::new(self.header.right_child)
    }

    /// Set the right-most child pointer (for interior pages)
    pub fn set_right_child(&mut self, page_id: PageId) {
        self.header.right_child = page_id.value();
        self.sync_header();
    }

    /// Get the cell pointer at the given index
    fn cell_pointer(&self, index: usize) -> usize {
        let offset = self.header.cell_pointer_offset() + index * 2;
        let raw = u16::from_be_bytes([self.data[offset], self.data[offset + 1]]);
        // 65536-byte pages can hold a cell starting at 65536 - n only, never 0
        if raw == 0 {
            65536
        } else {
            raw as usize
        }
    }

    /// Set the cell pointer at the given index
    fn set_cell_pointer(&mut self, index: usize, pointer: usize) {
        let offset = self.header.cell_pointer_offset() + index * 2;
        let raw = (pointer & 0xFFFF) as u16;
        self.data[offset..offset + 2].copy_from_slice(&raw.to_be_bytes());
    }

    fn cell_bytes(&self, index: usize) -> Result<&[u8]> {
        if index >= self.cell_count() {
            return Err(StorageError::invalid_operation(format!(
                "cell index {} out of bounds (count: {})",
                index,
                self.cell_count()
            )));
        }
        let pointer = self.cell_pointer(index);
        self.data
            .get(pointer..)
            .filter(|bytes| !bytes.is_empty())
            .ok_or_else(|| StorageError::corruption(format!("cell pointer {} past page end", pointer)))
    }

    /// Get the cell at the given index
    pub fn get_cell(&self, index: usize) -> Result<Cell> {
        let cell_bytes = self.cell_bytes(index)?;

        let cell = if self.is_leaf() {
            Cell::decode_leaf(cell_bytes)
                .ok_or_else(|| StorageError::corruption("failed to decode leaf cell"))?
                .0
        } else {
            Cell::decode_interior(cell_bytes)
                .ok_or_else(|| StorageError::corruption("failed to decode interior cell"))?
                .0
        };

        Ok(cell)
    }

    /// Get only the key of the cell at the given index
    pub fn cell_key(&self, index: usize) -> Result<i64> {
        let cell_bytes = self.cell_bytes(index)?;
        if self.is_leaf() {
            Cell::decode_leaf_key(cell_bytes)
                .ok_or_else(|| StorageError::corruption("failed to decode leaf key"))
        } else {
            Cell::decode_interior(cell_bytes)
                .map(|(cell, _)| cell.key)
                .ok_or_else(|| StorageError::corruption("failed to decode interior key"))
        }
    }

    /// Get all cells in this page (in sorted key order)
    pub fn get_all_cells(&self) -> Result<Vec<Cell>> {
        (0..self.cell_count()).map(|i| self.get_cell(i)).collect()
    }

    /// Child page at a child index (see module docs for numbering)
    pub fn child_at(&self, index: usize) -> Result<PageId> {
        if !self.is_interior() {
            return Err(StorageError::invalid_operation("child_at called on leaf page"));
        }
        if index == self.cell_count() {
            Ok(self.right_child())
        } else {
            Ok(self.get_cell(index)?.left_child)
        }
    }

    /// Calculate free space available for new cells
    pub fn free_space(&self) -> usize {
        // Available space minus the 2 bytes needed for a new cell pointer
        self.header.free_space().saturating_sub(2)
    }

    /// Check if a cell of the given size can fit
    pub fn can_fit(&self, cell_size: usize) -> bool {
        self.free_space() >= cell_size
    }

    /// Bytes in use by the header, pointers and live cells
    pub fn used_space(&self) -> Result<usize> {
        let mut used = self.header.cell_pointer_array_end();
        for i in 0..self.cell_count() {
            used += self.get_cell(i)?.encoded_size();
        }
        Ok(used)
    }

    /// Check whether a cell would fit after reclaiming fragmented space
    pub fn can_fit_after_defragment(&self, cell_size: usize) -> Result<bool> {
        Ok(self.used_space()? + cell_size + 2 <= self.page_size())
    }

    /// Binary search for a key.
    ///
    /// Returns `Ok(index)` when found, or `Err(insert_position)`.
    pub fn search(&self, key: i64) -> Result<std::result::Result<usize, usize>> {
        let mut low = 0;
        let mut high = self.cell_count();

        while low < high {
            let mid = low + (high - low) / 2;
            match self.cell_key(mid)?.cmp(&key) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return Ok(Ok(mid)),
            }
        }

        Ok(Err(low))
    }

    /// Find the child index and page for a given key (for interior pages)
    ///
    /// Example with keys [10, 20, 30]:
    /// - cell[0].left_child → keys <= 10
    /// - cell[1].left_child → keys in 11..=20
    /// - cell[2].left_child → keys in 21..=30
    /// - right_child → keys > 30
    pub fn find_child(&self, key: i64) -> Result<(usize, PageId)> {
        if !self.is_interior() {
            return Err(StorageError::invalid_operation(
                "find_child called on leaf page",
            ));
        }

        let index = match self.search(key)? {
            Ok(index) | Err(index) => index,
        };
        Ok((index, self.child_at(index)?))
    }

    /// Insert a cell at the correct sorted position
    ///
    /// Returns the index where the cell was inserted.
    pub fn insert_cell(&mut self, cell: &Cell) -> Result<usize> {
        match self.search(cell.key)? {
            Ok(_) => Err(StorageError::invalid_operation(format!(
                "duplicate key {} in page",
                cell.key
            ))),
            Err(pos) => {
                self.insert_cell_at(pos, cell)?;
                Ok(pos)
            }
        }
    }

    /// Insert a cell at a given index without checking key order
    pub fn insert_cell_at(&mut self, index: usize, cell: &Cell) -> Result<()> {
        let encoded = cell.encode();
        let cell_size = encoded.len();

        if index > self.cell_count() {
            return Err(StorageError::invalid_operation(format!(
                "insert index {} out of bounds",
                index
            )));
        }

        if !self.can_fit(cell_size) {
            if !self.can_fit_after_defragment(cell_size)? {
                return Err(StorageError::PageFull {
                    page_id: PageId::INVALID,
                    needed: cell_size + 2,
                    available: self.free_space(),
                });
            }
            self.defragment()?;
        }

        // Allocate space for the cell content
        let new_content_start = self.header.cell_content_start as usize - cell_size;
        self.data[new_content_start..new_content_start + cell_size].copy_from_slice(&encoded);

        // Shift cell pointers to make room
        let cell_count = self.cell_count();
        for i in (index..cell_count).rev() {
            let ptr = self.cell_pointer(i);
            self.set_cell_pointer(i + 1, ptr);
        }

        self.set_cell_pointer(index, new_content_start);

        self.header.cell_count += 1;
        self.header.cell_content_start = new_content_start as u32;
        self.sync_header();

        Ok(())
    }

    /// Replace the payload of an existing leaf cell, keeping its position
    pub fn update_payload(&mut self, index: usize, payload: &[u8]) -> Result<()> {
        if !self.is_leaf() {
            return Err(StorageError::invalid_operation(
                "update_payload called on interior page",
            ));
        }

        let old = self.delete_cell(index)?;
        let new_cell = Cell::new_leaf(old.key, payload.to_vec());
        if let Err(e) = self.insert_cell_at(index, &new_cell) {
            // Put the old cell back so a failed update leaves the page unchanged
            self.insert_cell_at(index, &old)?;
            return Err(e);
        }
        Ok(())
    }

    /// Replace the left child pointer of an interior cell
    pub fn set_left_child(&mut self, index: usize, child: PageId) -> Result<()> {
        let old = self.delete_cell(index)?;
        self.insert_cell_at(index, &Cell::new_interior(old.key, child))
    }

    /// Delete the cell at the given index
    pub fn delete_cell(&mut self, index: usize) -> Result<Cell> {
        if index >= self.cell_count() {
            return Err(StorageError::invalid_operation(format!(
                "delete index {} out of bounds",
                index
            )));
        }

        let cell = self.get_cell(index)?;

        // Shift cell pointers down
        let cell_count = self.cell_count();
        for i in index..cell_count - 1 {
            let ptr = self.cell_pointer(i + 1);
            self.set_cell_pointer(i, ptr);
        }

        self.header.cell_count -= 1;
        // Content space is reclaimed lazily by defragment()
        self.header.fragmented_bytes = self
            .header
            .fragmented_bytes
            .saturating_add(cell.encoded_size().min(u8::MAX as usize) as u8);
        self.sync_header();

        Ok(cell)
    }

    /// Defragment the page to reclaim fragmented space
    pub fn defragment(&mut self) -> Result<()> {
        let cells = self.get_all_cells()?;
        let page_size = self.page_size();

        let rebuilt = if self.is_leaf() {
            Self::leaf_from_cells(page_size, &cells)?
        } else {
            Self::interior_from_cells(page_size, &cells, self.right_child())?
        };

        self.data = rebuilt.data;
        self.header = rebuilt.header;

        Ok(())
    }

    /// Sync the header to the raw page data
    fn sync_header(&mut self) {
        self.header.write(&mut self.data);
    }
}

impl std::fmt::Debug for SlottedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlottedPage")
            .field("page_type", &self.header.page_type)
            .field("cell_count", &self.header.cell_count)
            .field("page_size", &self.page_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_leaf_page() {
        let page = SlottedPage::new_leaf(4096);
        assert!(page.is_leaf());
        assert!(!page.is_interior());
        assert_eq!(page.cell_count(), 0);
        assert_eq!(page.page_size(), 4096);
        assert!(page.free_space() > 0);
    }

    #[test]
    fn test_insert_and_get() {
        let mut page = SlottedPage::new_leaf(1024);

        page.insert_cell(&Cell::new_leaf(20, b"yellow".to_vec())).unwrap();
        page.insert_cell(&Cell::new_leaf(-5, b"red".to_vec())).unwrap();
        page.insert_cell(&Cell::new_leaf(30, b"green".to_vec())).unwrap();

        assert_eq!(page.cell_count(), 3);

        // Cells should be in sorted order
        assert_eq!(page.cell_key(0).unwrap(), -5);
        assert_eq!(page.cell_key(1).unwrap(), 20);
        assert_eq!(page.get_cell(2).unwrap().payload, b"green");
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut page = SlottedPage::new_leaf(1024);
        page.insert_cell(&Cell::new_leaf(1, b"a".to_vec())).unwrap();
        assert!(page.insert_cell(&Cell::new_leaf(1, b"b".to_vec())).is_err());
        assert_eq!(page.cell_count(), 1);
    }

    #[test]
    fn test_search() {
        let mut page = SlottedPage::new_leaf(1024);

        page.insert_cell(&Cell::new_leaf(1, b"1".to_vec())).unwrap();
        page.insert_cell(&Cell::new_leaf(3, b"3".to_vec())).unwrap();
        page.insert_cell(&Cell::new_leaf(2, b"2".to_vec())).unwrap();

        assert_eq!(page.search(1).unwrap(), Ok(0));
        assert_eq!(page.search(2).unwrap(), Ok(1));
        assert_eq!(page.search(3).unwrap(), Ok(2));
        assert_eq!(page.search(0).unwrap(), Err(0));
        assert_eq!(page.search(4).unwrap(), Err(3));
    }

    #[test]
    fn test_delete_and_update() {
        let mut page = SlottedPage::new_leaf(1024);

        for key in 1..=3 {
            page.insert_cell(&Cell::new_leaf(key, vec![key as u8])).unwrap();
        }

        let deleted = page.delete_cell(1).unwrap();
        assert_eq!(deleted.key, 2);
        assert_eq!(page.cell_count(), 2);
        assert_eq!(page.cell_key(0).unwrap(), 1);
        assert_eq!(page.cell_key(1).unwrap(), 3);

        page.update_payload(1, b"three").unwrap();
        assert_eq!(page.get_cell(1).unwrap().payload, b"three");
        assert_eq!(page.cell_key(1).unwrap(), 3);
    }

    #[test]
    fn test_fragmented_space_is_reclaimed() {
        let mut page = SlottedPage::new_leaf(512);
        let mut key = 0;
        while page.can_fit(Cell::new_leaf(key, vec![0u8; 40]).encoded_size()) {
            page.insert_cell(&Cell::new_leaf(key, vec![0u8; 40])).unwrap();
            key += 1;
        }
        page.delete_cell(0).unwrap();

        // Contiguous free space is still too small, but defragmenting makes room
        page.insert_cell(&Cell::new_leaf(key, vec![1u8; 40])).unwrap();
        assert_eq!(page.cell_key(page.cell_count() - 1).unwrap(), key);
    }

    #[test]
    fn test_interior_page() {
        let cells = vec![
            Cell::new_interior(10, PageId::new(2)),
            Cell::new_interior(20, PageId::new(3)),
        ];
        let page = SlottedPage::interior_from_cells(1024, &cells, PageId::new(4)).unwrap();

        assert_eq!(page.find_child(-100).unwrap(), (0, PageId::new(2)));
        assert_eq!(page.find_child(10).unwrap(), (0, PageId::new(2)));
        assert_eq!(page.find_child(11).unwrap(), (1, PageId::new(3)));
        assert_eq!(page.find_child(20).unwrap(), (1, PageId::new(3)));
        assert_eq!(page.find_child(21).unwrap(), (2, PageId::new(4)));
        assert_eq!(page.child_at(2).unwrap(), PageId::new(4));
    }

    #[test]
    fn test_from_bytes_roundtrip() {
        let mut page = SlottedPage::new_leaf(2048);
        page.insert_cell(&Cell::new_leaf(7, b"data".to_vec())).unwrap();

        let restored = SlottedPage::from_bytes(page.as_bytes()).unwrap();

        assert_eq!(restored.page_size(), 2048);
        assert_eq!(restored.cell_count(), 1);
        let cell = restored.get_cell(0).unwrap();
        assert_eq!(cell.key, 7);
        assert_eq!(cell.payload, b"data");
    }

    #[test]
    fn test_from_bytes_rejects_free_page() {
        let zeros = vec![0u8; 512];
        assert!(SlottedPage::from_bytes(&zeros).is_err());
    }
}
