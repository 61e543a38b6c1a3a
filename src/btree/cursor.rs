//! B-tree cursor.
//!
//! A cursor keeps the path from the root to its current row as a stack of
//! (page, index) pairs, plus the key of that row. The cached key lets
//! [`BtCursor::move_to`] answer repeated and sequential lookups without a
//! descent and without entering the shared mutex.
//!
//! Writes through one cursor raise a signal on every other cursor open on
//! the same table. A signalled cursor drops its path and reseeks to its
//! cached key the next time it is used.

use crate::btree::balance::MAX_DEPTH;
use crate::btree::shared::{BtShared, BtSharedInner, HandleId, SIGNAL_CLOSED, SIGNAL_MOVED, SIGNAL_NONE};
use crate::error::{Result, StorageError};
use crate::types::{max_payload, PageId};
use bitflags::bitflags;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

bitflags! {
    /// Positioning hints kept alongside the cached key
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CursorFlags: u8 {
        /// The cached key belongs to the row the cursor was last on
        const VALID_NKEY = 0x01;
        /// The cursor is on the last row of the table
        const AT_LAST = 0x02;
    }
}

/// Cursor position state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CursorState {
    /// Not on a row
    Invalid,
    /// On a row; the path and cached key can be trusted
    Valid,
    /// Was on a row, but the tree may have changed since
    RequireSeek,
    /// A descent failed; the cursor must be repositioned
    Fault,
}

/// Where a seek left the cursor relative to the requested key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SeekResult {
    /// On a row with exactly the requested key
    Found,
    /// On a row with a smaller key
    Less,
    /// On a row with a larger key
    Greater,
}

/// Navigator over one table
pub struct BtCursor {
    shared: Arc<BtShared>,
    slot: usize,
    signal: Arc<AtomicU8>,
    owner: HandleId,
    root: PageId,
    writable: bool,
    state: CursorState,
    flags: CursorFlags,
    n_key: i64,
    /// Path to the current row; the last entry is the leaf and cell index
    stack: Vec<(PageId, usize)>,
}

impl BtCursor {
    pub(crate) fn new(
        shared: Arc<BtShared>,
        slot: usize,
        signal: Arc<AtomicU8>,
        owner: HandleId,
        root: PageId,
        writable: bool,
    ) -> Self {
        Self {
            shared,
            slot,
            signal,
            owner,
            root,
            writable,
            state: CursorState::Invalid,
            flags: CursorFlags::empty(),
            n_key: 0,
            stack: Vec::with_capacity(8),
        }
    }

    /// Root page of the table
    pub fn root(&self) -> PageId {
        self.root
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn flags(&self) -> CursorFlags {
        self.flags
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Key of the last row the cursor was on, if it is still known
    pub fn cached_key(&self) -> Option<i64> {
        self.flags
            .contains(CursorFlags::VALID_NKEY)
            .then_some(self.n_key)
    }

    /// Whether the cursor is on a row
    pub fn is_valid(&self) -> bool {
        self.state == CursorState::Valid
    }

    /// Pick up notices left by other cursors and handles
    fn sync_signal(&mut self) -> Result<()> {
        match self.signal.load(Ordering::Acquire) {
            SIGNAL_NONE => Ok(()),
            SIGNAL_CLOSED => {
                self.state = CursorState::Fault;
                self.stack.clear();
                Err(StorageError::CursorFault(
                    "the handle that opened this cursor is closed".into(),
                ))
            }
            _ => {
                if self
                    .signal
                    .compare_exchange(SIGNAL_MOVED, SIGNAL_NONE, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // Closed since the load
                    return self.sync_signal();
                }
                if self.state == CursorState::Valid {
                    self.state = CursorState::RequireSeek;
                }
                self.flags.remove(CursorFlags::AT_LAST);
                self.stack.clear();
                trace!(cursor = self.slot, "cursor needs reseek");
                Ok(())
            }
        }
    }

    /// Put the cursor in the fault state for I/O and corruption errors
    fn fault(&mut self, err: StorageError) -> StorageError {
        if err.is_io_or_corruption() {
            warn!(cursor = self.slot, root = %self.root, error = %err, "cursor fault");
            self.state = CursorState::Fault;
            self.stack.clear();
        }
        err
    }

    fn fault_error(&self) -> StorageError {
        StorageError::CursorFault(format!(
            "cursor on table {} must be repositioned",
            self.root
        ))
    }

    fn set_invalid(&mut self) {
        self.state = CursorState::Invalid;
        self.flags = CursorFlags::empty();
        self.stack.clear();
    }

    /// Move to `key`, or next to where it would be.
    ///
    /// When the key is absent the cursor stops on a neighbour: the smaller
    /// one unless `bias_right` is set and the key falls between two rows of
    /// the same leaf. On an empty table the result is `Less` and the cursor
    /// is left invalid.
    pub fn move_to(&mut self, key: i64, bias_right: bool) -> Result<SeekResult> {
        self.sync_signal()?;

        if self.state == CursorState::Valid && self.flags.contains(CursorFlags::VALID_NKEY) {
            if self.n_key == key {
                return Ok(SeekResult::Found);
            }
            if self.n_key < key {
                if self.flags.contains(CursorFlags::AT_LAST) {
                    return Ok(SeekResult::Less);
                }
                if self.n_key.checked_add(1) == Some(key) && self.step(true)? && self.n_key == key {
                    return Ok(SeekResult::Found);
                }
            }
        }

        self.seek(key, bias_right)
    }

    /// Full descent from the root, counted in the shared stats
    fn seek(&mut self, key: i64, bias_right: bool) -> Result<SeekResult> {
        let shared = Arc::clone(&self.shared);
        let mut inner = shared.enter();
        shared.record_descent();
        let result = self.descend_to(&mut inner, key, bias_right);
        drop(inner);
        result.map_err(|e| self.fault(e))
    }

    fn descend_to(&mut self, inner: &mut BtSharedInner, key: i64, bias_right: bool) -> Result<SeekResult> {
        self.stack.clear();
        self.flags.remove(CursorFlags::AT_LAST);

        let mut page_id = self.root;
        for _ in 0..MAX_DEPTH {
            let page = inner.page(page_id)?;
            if page.is_interior() {
                let (index, child) = page.find_child(key)?;
                self.stack.push((page_id, index));
                page_id = child;
                continue;
            }

            let count = page.cell_count();
            if count == 0 {
                self.set_invalid();
                return Ok(SeekResult::Less);
            }
            let (index, result) = match page.search(key)? {
                Ok(i) => (i, SeekResult::Found),
                Err(i) if i == count => (count - 1, SeekResult::Less),
                Err(0) => (0, SeekResult::Greater),
                Err(i) if bias_right => (i, SeekResult::Greater),
                Err(i) => (i - 1, SeekResult::Less),
            };
            self.stack.push((page_id, index));
            self.n_key = page.cell_key(index)?;
            self.flags.insert(CursorFlags::VALID_NKEY);
            self.state = CursorState::Valid;
            return Ok(result);
        }

        Err(StorageError::corruption(format!(
            "tree rooted at {} is deeper than {} levels",
            self.root, MAX_DEPTH
        )))
    }

    /// Follow first or last children from `page_id` down to a leaf
    fn descend_edge(&mut self, inner: &mut BtSharedInner, page_id: PageId, last: bool) -> Result<bool> {
        let mut page_id = page_id;
        for _ in 0..MAX_DEPTH {
            let page = inner.page(page_id)?;
            let count = page.cell_count();
            if page.is_interior() {
                let index = if last { count } else { 0 };
                self.stack.push((page_id, index));
                page_id = page.child_at(index)?;
                continue;
            }
            if count == 0 {
                self.set_invalid();
                return Ok(false);
            }
            let index = if last { count - 1 } else { 0 };
            self.stack.push((page_id, index));
            self.n_key = page.cell_key(index)?;
            self.flags.insert(CursorFlags::VALID_NKEY);
            self.state = CursorState::Valid;
            return Ok(true);
        }
        Err(StorageError::corruption("tree too deep"))
    }

    fn move_to_edge(&mut self, last: bool) -> Result<bool> {
        self.sync_signal()?;
        let shared = Arc::clone(&self.shared);
        let mut inner = shared.enter();
        self.stack.clear();
        self.flags.remove(CursorFlags::AT_LAST);
        let root = self.root;
        let result = self.descend_edge(&mut inner, root, last);
        drop(inner);
        result.map_err(|e| self.fault(e))
    }

    /// Move to the first row; false if the table is empty
    pub fn first(&mut self) -> Result<bool> {
        self.move_to_edge(false)
    }

    /// Move to the last row; false if the table is empty
    pub fn last(&mut self) -> Result<bool> {
        let found = self.move_to_edge(true)?;
        if found {
            self.flags.insert(CursorFlags::AT_LAST);
        }
        Ok(found)
    }

    /// Step to the neighbouring row along the current path
    fn advance(&mut self, inner: &mut BtSharedInner, forward: bool) -> Result<bool> {
        let Some(&(leaf_id, index)) = self.stack.last() else {
            return Ok(false);
        };
        let leaf = inner.page(leaf_id)?;
        let within = if forward {
            (index + 1 < leaf.cell_count()).then_some(index + 1)
        } else {
            index.checked_sub(1)
        };
        if let Some(next) = within {
            self.n_key = leaf.cell_key(next)?;
            if let Some(top) = self.stack.last_mut() {
                top.1 = next;
            }
            return Ok(true);
        }

        self.stack.pop();
        while let Some(&(page_id, child)) = self.stack.last() {
            let page = inner.page(page_id)?;
            let sibling = if forward {
                (child < page.cell_count()).then_some(child + 1)
            } else {
                child.checked_sub(1)
            };
            if let Some(sibling) = sibling {
                if let Some(top) = self.stack.last_mut() {
                    top.1 = sibling;
                }
                let child_id = page.child_at(sibling)?;
                return self.descend_edge(inner, child_id, !forward);
            }
            self.stack.pop();
        }

        self.set_invalid();
        Ok(false)
    }

    fn step(&mut self, forward: bool) -> Result<bool> {
        let shared = Arc::clone(&self.shared);
        let mut inner = shared.enter();
        self.flags.remove(CursorFlags::AT_LAST);
        let moved = self.advance(&mut inner, forward);
        drop(inner);
        moved.map_err(|e| self.fault(e))
    }

    /// Reseek to the cached key; `None` if there is nothing to return to
    fn restore(&mut self, bias_right: bool) -> Result<Option<SeekResult>> {
        if !self.flags.contains(CursorFlags::VALID_NKEY) {
            self.set_invalid();
            return Ok(None);
        }
        let key = self.n_key;
        let result = self.seek(key, bias_right)?;
        Ok(self.is_valid().then_some(result))
    }

    /// Bring a cursor that needs a reseek back onto its row.
    ///
    /// Returns true if the cursor is on a row with the key it had before.
    /// If that row was deleted the cursor ends up on a neighbour and the
    /// result is false.
    pub fn restore_position(&mut self) -> Result<bool> {
        self.sync_signal()?;
        match self.state {
            CursorState::Valid => Ok(true),
            CursorState::RequireSeek => Ok(self.restore(false)? == Some(SeekResult::Found)),
            CursorState::Invalid => Ok(false),
            CursorState::Fault => Err(self.fault_error()),
        }
    }

    /// Move to the next row; false at the end of the table
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<bool> {
        self.sync_signal()?;
        match self.state {
            CursorState::Invalid => return Ok(false),
            CursorState::Fault => return Err(self.fault_error()),
            CursorState::RequireSeek => match self.restore(true)? {
                None => return Ok(false),
                // Already past the row we were on
                Some(SeekResult::Greater) => return Ok(true),
                Some(_) => {}
            },
            CursorState::Valid => {}
        }
        self.step(true)
    }

    /// Move to the previous row; false at the start of the table
    pub fn prev(&mut self) -> Result<bool> {
        self.sync_signal()?;
        match self.state {
            CursorState::Invalid => return Ok(false),
            CursorState::Fault => return Err(self.fault_error()),
            CursorState::RequireSeek => match self.restore(false)? {
                None => return Ok(false),
                Some(SeekResult::Less) => return Ok(true),
                Some(_) => {}
            },
            CursorState::Valid => {}
        }
        self.step(false)
    }

    /// Make sure the cursor is on the row it claims to be on
    fn ensure_row(&mut self) -> Result<()> {
        self.sync_signal()?;
        match self.state {
            CursorState::Valid => Ok(()),
            CursorState::RequireSeek => {
                let key = self.n_key;
                if self.restore(false)? == Some(SeekResult::Found) {
                    Ok(())
                } else {
                    Err(StorageError::invalid_operation(format!(
                        "row {} no longer exists",
                        key
                    )))
                }
            }
            CursorState::Invalid => Err(StorageError::invalid_operation(
                "cursor is not positioned on a row",
            )),
            CursorState::Fault => Err(self.fault_error()),
        }
    }

    /// Key of the current row
    pub fn key(&mut self) -> Result<i64> {
        self.ensure_row()?;
        Ok(self.n_key)
    }

    /// Payload of the current row
    pub fn payload(&mut self) -> Result<Vec<u8>> {
        self.ensure_row()?;
        let Some(&(leaf_id, index)) = self.stack.last() else {
            return Err(StorageError::invalid_operation("cursor has no path"));
        };
        let shared = Arc::clone(&self.shared);
        let mut inner = shared.enter();
        let cell = inner.page(leaf_id).and_then(|page| page.get_cell(index));
        drop(inner);
        Ok(cell.map_err(|e| self.fault(e))?.payload)
    }

    fn check_writable(&self, inner: &BtSharedInner) -> Result<()> {
        if !self.writable {
            return Err(StorageError::read_only("cursor was opened read-only"));
        }
        if inner.writer != Some(self.owner) {
            return Err(StorageError::read_only(
                "handle does not hold the write transaction",
            ));
        }
        Ok(())
    }

    /// Insert a row, replacing the payload of an existing key.
    ///
    /// The cursor is left on the new row and every other cursor on the
    /// table is told to reseek.
    pub fn insert(&mut self, key: i64, payload: &[u8]) -> Result<()> {
        self.sync_signal()?;
        let shared = Arc::clone(&self.shared);
        let mut inner = shared.enter();
        self.check_writable(&inner)?;
        let max = max_payload(inner.pager.page_size());
        if payload.len() > max {
            return Err(StorageError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }

        let root = self.root;
        let result = self.insert_locked(&mut inner, key, payload);
        drop(inner);
        match result.map_err(|e| self.fault(e))? {
            SeekResult::Found => {
                trace!(root = %root, key, "row inserted");
                Ok(())
            }
            _ => Err(StorageError::corruption(format!(
                "row {} missing right after insert",
                key
            ))),
        }
    }

    fn insert_locked(&mut self, inner: &mut BtSharedInner, key: i64, payload: &[u8]) -> Result<SeekResult> {
        inner.tree_insert(self.root, key, payload)?;
        inner.has_content.insert(self.root, true);
        inner.invalidate_cursors(Some(self.root), Some(self.slot));
        self.descend_to(inner, key, false)
    }

    /// Delete the current row.
    ///
    /// The cursor keeps the deleted key, so `next` and `prev` continue from
    /// where the row used to be.
    pub fn delete(&mut self) -> Result<()> {
        self.ensure_row()?;
        let shared = Arc::clone(&self.shared);
        let mut inner = shared.enter();
        self.check_writable(&inner)?;

        let root = self.root;
        let key = self.n_key;
        let result = inner.tree_delete(root, key);
        if result.is_ok() {
            inner.has_content.remove(&root);
            inner.invalidate_cursors(Some(root), Some(self.slot));
        }
        drop(inner);

        if !result.map_err(|e| self.fault(e))? {
            return Err(StorageError::corruption(format!(
                "row {} vanished before delete",
                key
            )));
        }
        self.stack.clear();
        self.flags.remove(CursorFlags::AT_LAST);
        self.state = CursorState::RequireSeek;
        trace!(root = %root, key, "row deleted");
        Ok(())
    }

    /// Close the cursor and release its arena slot
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for BtCursor {
    fn drop(&mut self) {
        if self.signal.load(Ordering::Acquire) == SIGNAL_CLOSED {
            return;
        }
        let mut inner = self.shared.enter();
        inner.release_cursor(self.slot, &self.signal);
    }
}

impl std::fmt::Debug for BtCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtCursor")
            .field("slot", &self.slot)
            .field("root", &self.root)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("n_key", &self.n_key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::Btree;
    use crate::pager::FilePager;
    use crate::pcache::LruAllocator;
    use crate::testing::{FailSwitch, FailingPager};
    use crate::Config;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn table(keys: impl IntoIterator<Item = i64>) -> Result<(Btree, PageId, tempfile::TempDir)> {
        let dir = tempdir()?;
        let config = Config::new(dir.path().join("cursor.db")).page_size(512);
        let mut handle = Btree::open(&config)?;
        handle.begin_trans(true)?;
        let root = handle.create_table()?;
        let mut cursor = handle.cursor(root, true)?;
        for key in keys {
            cursor.insert(key, format!("row-{}", key).as_bytes())?;
        }
        Ok((handle, root, dir))
    }

    #[test]
    fn test_exact_hit_skips_descent() -> Result<()> {
        let (handle, root, _dir) = table(0..200)?;
        let mut cursor = handle.cursor(root, false)?;
        assert_eq!(cursor.move_to(120, false)?, SeekResult::Found);

        let before = handle.shared().stats();
        for _ in 0..10 {
            assert_eq!(cursor.move_to(120, false)?, SeekResult::Found);
        }
        let after = handle.shared().stats();
        assert_eq!(after.full_descents, before.full_descents);
        assert_eq!(after.mutex_entries, before.mutex_entries);
        assert_eq!(cursor.key()?, 120);
        Ok(())
    }

    #[test]
    fn test_at_last_short_circuit() -> Result<()> {
        let (handle, root, _dir) = table(0..200)?;
        let mut cursor = handle.cursor(root, false)?;
        assert!(cursor.last()?);
        assert!(cursor.flags().contains(CursorFlags::AT_LAST));

        let before = handle.shared().stats();
        for target in [200, 201, 5_000, i64::MAX] {
            assert_eq!(cursor.move_to(target, false)?, SeekResult::Less);
        }
        let after = handle.shared().stats();
        assert_eq!(after.full_descents, before.full_descents);
        assert_eq!(after.mutex_entries, before.mutex_entries);
        assert_eq!(cursor.cached_key(), Some(199));
        Ok(())
    }

    #[test]
    fn test_successor_without_descent() -> Result<()> {
        let (handle, root, _dir) = table(0..100)?;
        let mut cursor = handle.cursor(root, false)?;
        assert_eq!(cursor.move_to(41, false)?, SeekResult::Found);
        assert!(!cursor.flags().contains(CursorFlags::AT_LAST));

        let descents = handle.shared().stats().full_descents;
        assert_eq!(cursor.move_to(42, false)?, SeekResult::Found);
        assert_eq!(cursor.cached_key(), Some(42));
        assert_eq!(handle.shared().stats().full_descents, descents);

        // Crossing leaf boundaries the same way
        for key in 43..100 {
            assert_eq!(cursor.move_to(key, false)?, SeekResult::Found);
        }
        assert_eq!(handle.shared().stats().full_descents, descents);
        assert_eq!(cursor.payload()?, b"row-99".to_vec());
        Ok(())
    }

    #[test]
    fn test_successor_miss_falls_back() -> Result<()> {
        let (handle, root, _dir) = table((0..100).map(|k| k * 2))?;
        let mut cursor = handle.cursor(root, false)?;
        let mut fresh = handle.cursor(root, false)?;

        assert_eq!(cursor.move_to(40, false)?, SeekResult::Found);
        let descents = handle.shared().stats().full_descents;
        let result = cursor.move_to(41, false)?;
        assert_eq!(handle.shared().stats().full_descents, descents + 1);
        assert_eq!(result, fresh.move_to(41, false)?);
        assert_eq!(cursor.cached_key(), fresh.cached_key());
        Ok(())
    }

    #[test]
    fn test_successor_past_end() -> Result<()> {
        let (handle, root, _dir) = table(0..10)?;
        let mut cursor = handle.cursor(root, false)?;
        assert_eq!(cursor.move_to(9, false)?, SeekResult::Found);
        assert_eq!(cursor.move_to(10, false)?, SeekResult::Less);
        assert_eq!(cursor.key()?, 9);
        Ok(())
    }

    #[test]
    fn test_fast_paths_match_full_descent() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let keys: BTreeSet<i64> = (0..400).map(|_| rng.gen_range(0..1_000)).collect();
        let (handle, root, _dir) = table(keys.iter().copied())?;
        let mut cursor = handle.cursor(root, false)?;

        for _ in 0..2_000 {
            let target = match rng.gen_range(0..4) {
                0 => {
                    cursor.last()?;
                    rng.gen_range(990..1_100)
                }
                1 => cursor.cached_key().map_or(0, |k| k + 1),
                2 => cursor.cached_key().unwrap_or(0),
                _ => rng.gen_range(-10..1_010),
            };
            let mut fresh = handle.cursor(root, false)?;
            let got = cursor.move_to(target, false)?;
            let want = fresh.move_to(target, false)?;
            assert_eq!(got, want, "seek {}", target);
            assert_eq!(cursor.cached_key(), fresh.cached_key(), "seek {}", target);
            assert_eq!(got == SeekResult::Found, keys.contains(&target));
            match got {
                SeekResult::Found => assert_eq!(cursor.key()?, target),
                SeekResult::Less => assert!(cursor.key()? < target),
                SeekResult::Greater => assert!(cursor.key()? > target),
            }
        }
        Ok(())
    }

    #[test]
    fn test_bias_right_between_rows() -> Result<()> {
        let (handle, root, _dir) = table([10, 20, 30])?;
        let mut cursor = handle.cursor(root, false)?;
        assert_eq!(cursor.move_to(15, false)?, SeekResult::Less);
        assert_eq!(cursor.key()?, 10);
        assert_eq!(cursor.move_to(25, true)?, SeekResult::Greater);
        assert_eq!(cursor.key()?, 30);
        assert_eq!(cursor.move_to(5, false)?, SeekResult::Greater);
        assert_eq!(cursor.key()?, 10);
        Ok(())
    }

    #[test]
    fn test_empty_table_seek() -> Result<()> {
        let (handle, root, _dir) = table(0..0)?;
        let mut cursor = handle.cursor(root, false)?;
        assert_eq!(cursor.move_to(1, false)?, SeekResult::Less);
        assert_eq!(cursor.state(), CursorState::Invalid);
        assert!(!cursor.first()?);
        assert!(!cursor.last()?);
        assert!(!cursor.next()?);
        assert!(cursor.key().is_err());
        Ok(())
    }

    #[test]
    fn test_scan_both_directions() -> Result<()> {
        let (handle, root, _dir) = table(0..300)?;
        let mut cursor = handle.cursor(root, false)?;

        let mut forward = Vec::new();
        let mut more = cursor.first()?;
        while more {
            forward.push(cursor.key()?);
            more = cursor.next()?;
        }
        assert_eq!(forward, (0..300).collect::<Vec<_>>());
        assert_eq!(cursor.state(), CursorState::Invalid);

        let mut backward = Vec::new();
        let mut more = cursor.last()?;
        while more {
            backward.push(cursor.key()?);
            more = cursor.prev()?;
        }
        assert_eq!(backward, (0..300).rev().collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_write_marks_other_cursors() -> Result<()> {
        let (handle, root, _dir) = table((0..50).map(|k| k * 10))?;
        let other_root = handle.create_table()?;
        let mut reader = handle.cursor(root, false)?;
        let mut bystander = handle.cursor(other_root, false)?;
        let mut writer = handle.cursor(root, true)?;

        assert_eq!(reader.move_to(100, false)?, SeekResult::Found);
        assert!(reader.last()?);
        assert_eq!(reader.move_to(100, false)?, SeekResult::Found);
        bystander.first()?;

        writer.insert(105, b"new")?;

        // The writer stays put; only the reader reseeks
        assert_eq!(writer.key()?, 105);
        let descents = handle.shared().stats().full_descents;
        assert_eq!(reader.move_to(100, false)?, SeekResult::Found);
        assert_eq!(handle.shared().stats().full_descents, descents + 1);
        assert!(reader.next()?);
        assert_eq!(reader.key()?, 105);
        assert_eq!(bystander.state(), CursorState::Invalid);
        Ok(())
    }

    #[test]
    fn test_append_by_other_cursor_clears_at_last() -> Result<()> {
        let (handle, root, _dir) = table(0..300)?;
        let mut tail = handle.cursor(root, false)?;
        let mut writer = handle.cursor(root, true)?;

        assert!(tail.last()?);
        assert!(tail.flags().contains(CursorFlags::AT_LAST));
        assert_eq!(tail.move_to(1_000, false)?, SeekResult::Less);

        writer.insert(1_000, b"appended")?;
        assert_eq!(tail.move_to(1_000, false)?, SeekResult::Found);
        assert_eq!(tail.payload()?, b"appended".to_vec());

        // Deleting the new tail leaves the old last row behind it
        assert!(tail.last()?);
        assert_eq!(writer.move_to(1_000, false)?, SeekResult::Found);
        writer.delete()?;
        assert_eq!(tail.move_to(1_000, false)?, SeekResult::Less);
        assert_eq!(tail.key()?, 299);
        Ok(())
    }

    #[test]
    fn test_restore_after_own_row_deleted() -> Result<()> {
        let (handle, root, _dir) = table(0..20)?;
        let mut reader = handle.cursor(root, false)?;
        let mut writer = handle.cursor(root, true)?;

        assert_eq!(reader.move_to(7, false)?, SeekResult::Found);
        assert_eq!(writer.move_to(7, false)?, SeekResult::Found);
        writer.delete()?;

        assert!(!reader.restore_position()?);
        assert_eq!(reader.key()?, 6);
        assert!(writer.next()?);
        assert_eq!(writer.key()?, 8);
        assert!(writer.prev()?);
        assert_eq!(writer.key()?, 6);
        Ok(())
    }

    #[test]
    fn test_delete_while_scanning() -> Result<()> {
        let (handle, root, _dir) = table(0..200)?;
        let mut cursor = handle.cursor(root, true)?;
        let mut more = cursor.first()?;
        while more {
            if cursor.key()? % 3 == 0 {
                cursor.delete()?;
            }
            more = cursor.next()?;
        }

        let mut kept = Vec::new();
        let mut more = cursor.first()?;
        while more {
            kept.push(cursor.key()?);
            more = cursor.next()?;
        }
        assert_eq!(kept, (0..200).filter(|k| k % 3 != 0).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_read_only_cursor_rejects_writes() -> Result<()> {
        let (handle, root, _dir) = table(0..5)?;
        let mut cursor = handle.cursor(root, false)?;
        assert!(matches!(cursor.insert(9, b"x"), Err(StorageError::ReadOnly(_))));
        cursor.first()?;
        assert!(matches!(cursor.delete(), Err(StorageError::ReadOnly(_))));
        Ok(())
    }

    #[test]
    fn test_payload_limit() -> Result<()> {
        let (handle, root, _dir) = table(0..0)?;
        let mut cursor = handle.cursor(root, true)?;
        let max = max_payload(512);
        cursor.insert(1, &vec![0u8; max])?;
        let err = cursor.insert(2, &vec![0u8; max + 1]).unwrap_err();
        assert!(matches!(err, StorageError::PayloadTooLarge { .. }));
        Ok(())
    }

    #[test]
    fn test_read_error_faults_cursor() -> Result<()> {
        let dir = tempdir()?;
        let config = Config::new(dir.path().join("fault.db")).page_size(512);
        let root = {
            let mut handle = Btree::open(&config)?;
            handle.begin_trans(true)?;
            let root = handle.create_table()?;
            let mut cursor = handle.cursor(root, true)?;
            for key in 0..1_000 {
                cursor.insert(key, &[3u8; 20])?;
            }
            drop(cursor);
            handle.commit()?;
            root
        };

        let switch = FailSwitch::default();
        let pager = FilePager::open(&config.path, config.page_size, false)?;
        let shared = crate::btree::BtShared::with_pager(
            Box::new(FailingPager::new(Box::new(pager), switch.clone())),
            Arc::new(LruAllocator),
            &config,
        )?;
        let mut handle = Btree::new(shared);
        handle.begin_trans(false)?;
        let mut cursor = handle.cursor(root, false)?;
        assert_eq!(cursor.move_to(7, false)?, SeekResult::Found);

        switch.fail_read(true);
        let err = cursor.move_to(900, false).unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
        assert_eq!(cursor.state(), CursorState::Fault);
        assert_eq!(cursor.cached_key(), Some(7));
        assert!(matches!(cursor.key(), Err(StorageError::CursorFault(_))));
        assert!(matches!(cursor.next(), Err(StorageError::CursorFault(_))));

        switch.fail_read(false);
        assert_eq!(cursor.move_to(900, false)?, SeekResult::Found);
        assert_eq!(cursor.state(), CursorState::Valid);
        Ok(())
    }
}
