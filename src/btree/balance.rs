//! Tree modification: inserts with page splits, deletes with page removal.
//!
//! Interior cells hold the largest key of their left subtree, so a split
//! leaf or interior page keeps its page number for the upper half and hands
//! the lower half to a fresh page. The root never moves: when it overflows
//! its content is pushed down into two new children, and when it is left
//! with a single child that child is pulled back up into it.

use crate::btree::shared::BtSharedInner;
use crate::error::{Result, StorageError};
use crate::page::{Cell, SlottedPage};
use crate::types::PageId;
use tracing::{debug, trace};

/// Deepest tree walked before the file is declared corrupt
pub(crate) const MAX_DEPTH: usize = 40;

/// Cells that no longer fit in one page
enum Overflow {
    Leaf(Vec<Cell>),
    Interior(Vec<Cell>, PageId),
}

/// Path from the root to a leaf: (page, child index) for each interior page
type Path = Vec<(PageId, usize)>;

impl BtSharedInner {
    /// Walk from `root` to the leaf that should hold `key`
    fn descend(&mut self, root: PageId, key: i64) -> Result<(Path, PageId)> {
        let mut path = Vec::new();
        let mut page_id = root;
        for _ in 0..MAX_DEPTH {
            let page = self.page(page_id)?;
            if page.is_leaf() {
                return Ok((path, page_id));
            }
            let (index, child) = page.find_child(key)?;
            path.push((page_id, index));
            page_id = child;
        }
        Err(StorageError::corruption(format!(
            "tree rooted at {} is deeper than {} levels",
            root, MAX_DEPTH
        )))
    }

    /// Insert a row, replacing the payload if the key exists
    pub(crate) fn tree_insert(&mut self, root: PageId, key: i64, payload: &[u8]) -> Result<()> {
        let (path, leaf_id) = self.descend(root, key)?;
        let mut leaf = SlottedPage::clone(&*self.page(leaf_id)?);

        let index = match leaf.search(key)? {
            Ok(index) => {
                leaf.delete_cell(index)?;
                index
            }
            Err(index) => index,
        };

        let cell = Cell::new_leaf(key, payload.to_vec());
        let size = cell.encoded_size();
        if leaf.can_fit(size) || leaf.can_fit_after_defragment(size)? {
            leaf.insert_cell_at(index, &cell)?;
            return self.write_page(leaf_id, leaf);
        }

        let mut cells = leaf.get_all_cells()?;
        cells.insert(index, cell);
        self.split(root, path, leaf_id, Overflow::Leaf(cells))
    }

    /// Split an overflowing page and push separators up as far as needed
    fn split(&mut self, root: PageId, mut path: Path, page_id: PageId, overflow: Overflow) -> Result<()> {
        let page_size = self.pager.page_size();
        let mut page_id = page_id;
        let mut overflow = overflow;

        loop {
            let (lower, separator, upper) = split_cells(overflow, page_size)?;

            if page_id == root {
                let lower_id = self.allocate_page()?;
                let upper_id = self.allocate_page()?;
                self.write_page(lower_id, lower)?;
                self.write_page(upper_id, upper)?;
                let new_root = SlottedPage::interior_from_cells(
                    page_size,
                    &[Cell::new_interior(separator, lower_id)],
                    upper_id,
                )?;
                self.write_page(root, new_root)?;
                debug!(root = %root, lower = %lower_id, upper = %upper_id, "root split");
                return Ok(());
            }

            let lower_id = self.allocate_page()?;
            self.write_page(lower_id, lower)?;
            self.write_page(page_id, upper)?;
            trace!(page = %page_id, lower = %lower_id, separator, "page split");

            let (parent_id, child_index) = path
                .pop()
                .ok_or_else(|| StorageError::corruption("split page has no parent"))?;
            let mut parent = SlottedPage::clone(&*self.page(parent_id)?);
            let cell = Cell::new_interior(separator, lower_id);
            let size = cell.encoded_size();
            if parent.can_fit(size) || parent.can_fit_after_defragment(size)? {
                parent.insert_cell_at(child_index, &cell)?;
                return self.write_page(parent_id, parent);
            }

            let mut cells = parent.get_all_cells()?;
            cells.insert(child_index, cell);
            overflow = Overflow::Interior(cells, parent.right_child());
            page_id = parent_id;
        }
    }

    /// Delete a row; returns false if the key is absent
    pub(crate) fn tree_delete(&mut self, root: PageId, key: i64) -> Result<bool> {
        let (mut path, leaf_id) = self.descend(root, key)?;
        let mut leaf = SlottedPage::clone(&*self.page(leaf_id)?);

        let Ok(index) = leaf.search(key)? else {
            return Ok(false);
        };
        leaf.delete_cell(index)?;

        if leaf.cell_count() > 0 || leaf_id == root {
            self.write_page(leaf_id, leaf)?;
            return Ok(true);
        }

        self.free_page(leaf_id)?;
        self.remove_child(root, &mut path)?;
        Ok(true)
    }

    /// Drop the pointer to a freed child from the last page on `path`
    fn remove_child(&mut self, root: PageId, path: &mut Path) -> Result<()> {
        let page_size = self.pager.page_size();

        loop {
            let (parent_id, child_index) = path
                .pop()
                .ok_or_else(|| StorageError::corruption("removed page has no parent"))?;
            let mut parent = SlottedPage::clone(&*self.page(parent_id)?);
            let count = parent.cell_count();

            if count == 0 {
                // The freed page was the only child
                if parent_id == root {
                    return self.write_page(root, SlottedPage::new_leaf(page_size));
                }
                self.free_page(parent_id)?;
                continue;
            }

            if child_index < count {
                parent.delete_cell(child_index)?;
            } else {
                let last = parent.delete_cell(count - 1)?;
                parent.set_right_child(last.left_child);
            }

            if parent.cell_count() > 0 {
                return self.write_page(parent_id, parent);
            }

            // A single child is left; splice it into the grandparent
            let only = parent.right_child();
            if parent_id == root {
                let child = SlottedPage::clone(&*self.page(only)?);
                self.free_page(only)?;
                self.write_page(root, child)?;
                debug!(root = %root, "root collapsed");
                return Ok(());
            }

            self.free_page(parent_id)?;
            let &(grand_id, grand_index) = path
                .last()
                .ok_or_else(|| StorageError::corruption("interior page has no parent"))?;
            let mut grand = SlottedPage::clone(&*self.page(grand_id)?);
            if grand_index < grand.cell_count() {
                grand.set_left_child(grand_index, only)?;
            } else {
                grand.set_right_child(only);
            }
            return self.write_page(grand_id, grand);
        }
    }

    /// Free every page below `page_id`; the root itself becomes an empty leaf.
    ///
    /// Returns the number of rows removed.
    pub(crate) fn clear_subtree(&mut self, page_id: PageId, is_root: bool, depth: usize) -> Result<u64> {
        if depth > MAX_DEPTH {
            return Err(StorageError::corruption("tree too deep while clearing"));
        }
        let page = self.page(page_id)?;
        let mut rows = 0;
        if page.is_leaf() {
            rows = page.cell_count() as u64;
        } else {
            for index in 0..=page.cell_count() {
                let child = page.child_at(index)?;
                rows += self.clear_subtree(child, false, depth + 1)?;
            }
        }
        drop(page);

        if is_root {
            let page_size = self.pager.page_size();
            self.write_page(page_id, SlottedPage::new_leaf(page_size))?;
        } else {
            self.free_page(page_id)?;
        }
        Ok(rows)
    }
}

/// Index that splits `cells` into two halves of similar encoded size
fn split_point(cells: &[Cell], min: usize, max: usize) -> usize {
    let total: usize = cells.iter().map(|c| c.encoded_size() + 2).sum();
    let mut acc = 0;
    let mut point = cells.len();
    for (i, cell) in cells.iter().enumerate() {
        acc += cell.encoded_size() + 2;
        if acc * 2 >= total {
            point = i + 1;
            break;
        }
    }
    point.clamp(min, max)
}

/// Split overflowing cells into lower page, separator key and upper page
fn split_cells(overflow: Overflow, page_size: usize) -> Result<(SlottedPage, i64, SlottedPage)> {
    match overflow {
        Overflow::Leaf(cells) => {
            if cells.len() < 2 {
                return Err(StorageError::corruption("leaf overflow with a single cell"));
            }
            let m = split_point(&cells, 1, cells.len() - 1);
            let separator = cells[m - 1].key;
            let lower = SlottedPage::leaf_from_cells(page_size, &cells[..m])?;
            let upper = SlottedPage::leaf_from_cells(page_size, &cells[m..])?;
            Ok((lower, separator, upper))
        }
        Overflow::Interior(cells, right_child) => {
            if cells.len() < 3 {
                return Err(StorageError::corruption("interior overflow with too few cells"));
            }
            let m = split_point(&cells, 1, cells.len() - 2);
            let middle = &cells[m];
            let lower = SlottedPage::interior_from_cells(page_size, &cells[..m], middle.left_child)?;
            let upper = SlottedPage::interior_from_cells(page_size, &cells[m + 1..], right_child)?;
            Ok((lower, middle.key, upper))
        }
    }
}
