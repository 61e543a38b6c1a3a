//! Per-connection B-tree handle.
//!
//! A [`Btree`] tracks this connection's own transaction level and holds the
//! shared state for the file. Several handles may share one [`BtShared`];
//! they all read the same page cache, so a reader sees rows written by an
//! open write transaction on another handle.

use crate::btree::balance::MAX_DEPTH;
use crate::btree::cursor::BtCursor;
use crate::btree::shared::{BtShared, BtSharedInner, HandleId};
use crate::error::{Result, StorageError};
use crate::page::SlottedPage;
use crate::types::{is_valid_page_size, PageId, TransState};
use crate::{Config, TreeNode};
use std::sync::Arc;
use tracing::{debug, warn};

/// One connection to a shared B-tree file
#[derive(Debug)]
pub struct Btree {
    id: HandleId,
    shared: Arc<BtShared>,
    in_trans: TransState,
    /// Added to the pager's data version when reporting it
    data_version_offset: i64,
    closed: bool,
}

impl Btree {
    /// Open the file named by `config` with fresh shared state
    pub fn open(config: &Config) -> Result<Self> {
        Ok(Self::new(BtShared::open(config)?))
    }

    /// Attach a new handle to existing shared state
    pub fn new(shared: Arc<BtShared>) -> Self {
        let id = shared.next_handle_id();
        Self {
            id,
            shared,
            in_trans: TransState::None,
            data_version_offset: 0,
            closed: false,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn shared(&self) -> &Arc<BtShared> {
        &self.shared
    }

    /// This handle's transaction level
    pub fn txn_state(&self) -> TransState {
        self.in_trans
    }

    /// Start a transaction, or upgrade a read transaction to a write.
    ///
    /// Only one handle may hold the write transaction; a second writer gets
    /// [`StorageError::Busy`].
    pub fn begin_trans(&mut self, write: bool) -> Result<()> {
        let wanted = if write { TransState::Write } else { TransState::Read };
        if self.in_trans >= wanted {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let mut inner = shared.enter();
        if write {
            if let Some(writer) = inner.writer.filter(|w| *w != self.id) {
                return Err(StorageError::Busy(format!(
                    "handle {} holds the write transaction",
                    writer
                )));
            }
            inner.pager.begin()?;
            inner.writer = Some(self.id);
            inner.in_transaction = TransState::Write;
        }
        if self.in_trans == TransState::None {
            inner.n_transaction += 1;
            if inner.in_transaction == TransState::None {
                inner.in_transaction = TransState::Read;
            }
        }
        self.in_trans = wanted;
        debug!(handle = self.id, state = ?wanted, "transaction started");
        Ok(())
    }

    /// Write every dirty page and the file header.
    ///
    /// Nothing changes state here; a failure leaves the write transaction
    /// open for a rollback.
    pub fn commit_phase_one(&mut self) -> Result<()> {
        if self.in_trans != TransState::Write {
            return Ok(());
        }
        let mut inner = self.shared.enter();
        let pages = inner.flush_dirty()?;
        inner.pager.commit_phase_one()?;
        debug!(handle = self.id, pages, "commit phase one done");
        Ok(())
    }

    /// Finish the commit and end this handle's transaction.
    ///
    /// A handle without a transaction returns at once without entering the
    /// mutex. If the pager fails and `cleanup` is false, the error is
    /// returned and the write transaction stays open. With `cleanup` set the
    /// transaction is torn down whatever the pager said.
    pub fn commit_phase_two(&mut self, cleanup: bool) -> Result<()> {
        if self.in_trans == TransState::None {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let mut inner = shared.enter();
        debug_assert!(
            inner.in_transaction != TransState::Write || inner.n_transaction > 0,
            "write transaction with no registered handles"
        );

        if self.in_trans == TransState::Write {
            let version = inner.pager.data_version();
            if let Err(err) = finish_write(&mut inner) {
                if !cleanup {
                    warn!(handle = self.id, error = %err, "commit failed");
                    return Err(err);
                }
                warn!(handle = self.id, error = %err, "commit failed, discarding the transaction");
                if let Err(rollback_err) = inner.pager.rollback() {
                    warn!(handle = self.id, error = %rollback_err, "rollback after failed commit");
                }
                inner.cache.purge();
                inner.invalidate_cursors(None, None);
            }
            // The pager's bump is this handle's own change
            if inner.pager.data_version() != version {
                self.data_version_offset -= 1;
            }
            inner.in_transaction = TransState::Read;
            inner.has_content.clear();
            inner.writer = None;
        }

        self.end_transaction(&mut inner);
        debug!(handle = self.id, state = ?self.in_trans, "transaction committed");
        Ok(())
    }

    /// Both commit phases
    pub fn commit(&mut self) -> Result<()> {
        self.commit_phase_one()?;
        self.commit_phase_two(false)
    }

    /// Abandon the transaction.
    ///
    /// Changes made by a write transaction are undone and every cursor on
    /// the file is told to reseek.
    pub fn rollback(&mut self) -> Result<()> {
        if self.in_trans == TransState::None {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let mut inner = shared.enter();
        let mut result = Ok(());
        if self.in_trans == TransState::Write {
            result = inner.pager.rollback();
            inner.cache.purge();
            inner.has_content.clear();
            inner.invalidate_cursors(None, None);
            inner.writer = None;
            inner.in_transaction = TransState::Read;
        }
        self.end_transaction(&mut inner);
        debug!(handle = self.id, "transaction rolled back");
        result
    }

    /// Release this handle's hold on the shared transaction.
    ///
    /// A handle with open cursors keeps a read transaction.
    fn end_transaction(&mut self, inner: &mut BtSharedInner) {
        if self.in_trans == TransState::None {
            return;
        }
        if inner.cursor_count(self.id) > 0 {
            self.in_trans = TransState::Read;
            return;
        }
        debug_assert!(inner.n_transaction > 0);
        inner.n_transaction = inner.n_transaction.saturating_sub(1);
        if inner.n_transaction == 0 {
            inner.in_transaction = TransState::None;
        }
        self.in_trans = TransState::None;
    }

    fn require_write(&self) -> Result<()> {
        if self.in_trans != TransState::Write {
            return Err(StorageError::read_only("no write transaction is open"));
        }
        Ok(())
    }

    fn check_root(inner: &BtSharedInner, root: PageId) -> Result<()> {
        if !inner.is_root_candidate(root) {
            return Err(StorageError::PageNotFound(root));
        }
        Ok(())
    }

    /// Open a cursor on the table rooted at `root`
    pub fn cursor(&self, root: PageId, writable: bool) -> Result<BtCursor> {
        if self.in_trans == TransState::None {
            return Err(StorageError::invalid_operation(
                "a transaction must be open to use a cursor",
            ));
        }
        if writable {
            self.require_write()?;
        }

        let mut inner = self.shared.enter();
        Self::check_root(&inner, root)?;
        let (slot, signal) = inner.register_cursor(self.id, root);
        drop(inner);
        Ok(BtCursor::new(
            Arc::clone(&self.shared),
            slot,
            signal,
            self.id,
            root,
            writable,
        ))
    }

    /// Create an empty table and return its root page
    pub fn create_table(&self) -> Result<PageId> {
        self.require_write()?;
        let mut inner = self.shared.enter();
        let root = inner.allocate_page()?;
        let page_size = inner.pager.page_size();
        inner.write_page(root, SlottedPage::new_leaf(page_size))?;
        inner.has_content.insert(root, false);
        debug!(handle = self.id, root = %root, "table created");
        Ok(root)
    }

    /// Delete every row of a table, keeping its root page.
    ///
    /// Returns the number of rows removed.
    pub fn clear_table(&self, root: PageId) -> Result<u64> {
        self.require_write()?;
        let mut inner = self.shared.enter();
        Self::check_root(&inner, root)?;
        let rows = inner.clear_subtree(root, true, 0)?;
        inner.has_content.insert(root, false);
        inner.invalidate_cursors(Some(root), None);
        debug!(handle = self.id, root = %root, rows, "table cleared");
        Ok(rows)
    }

    /// Whether the table has no rows, answered from the content flags when
    /// they are known
    pub fn is_empty(&self, root: PageId) -> Result<bool> {
        if self.in_trans == TransState::None {
            return Err(StorageError::invalid_operation("no transaction is open"));
        }
        let mut inner = self.shared.enter();
        if let Some(&has_rows) = inner.has_content.get(&root) {
            return Ok(!has_rows);
        }
        Self::check_root(&inner, root)?;
        let page = inner.page(root)?;
        let empty = page.is_leaf() && page.cell_count() == 0;
        inner.has_content.insert(root, !empty);
        Ok(empty)
    }

    /// Change the page size of an empty database.
    ///
    /// Refused while any transaction or cursor is open on the file. If the
    /// page cache cannot be rebuilt at the new size the pager is put back and
    /// [`StorageError::NoMem`] is returned.
    pub fn set_page_size(&self, page_size: usize) -> Result<()> {
        if !is_valid_page_size(page_size) {
            return Err(StorageError::invalid_operation(format!(
                "invalid page size {}",
                page_size
            )));
        }
        let mut inner = self.shared.enter();
        if inner.n_transaction > 0 || inner.has_cursors() {
            return Err(StorageError::invalid_operation(
                "page size cannot change while transactions or cursors are open",
            ));
        }

        let old = inner.pager.page_size();
        if old == page_size {
            return Ok(());
        }
        inner.pager.set_page_size(page_size)?;
        if let Err(err) = inner.cache.set_page_size(page_size) {
            if let Err(revert_err) = inner.pager.set_page_size(old) {
                warn!(error = %revert_err, "could not restore page size");
            }
            return Err(err);
        }
        debug!(old, new = page_size, "page size changed");
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.shared.page_size()
    }

    /// Set the cache budget (pages if positive, KiB if negative)
    pub fn set_cache_size(&self, cache_size: i64) {
        let mut inner = self.shared.enter();
        inner.cache.set_cache_size(cache_size);
        debug!(
            cache_size,
            pages = inner.cache.number_of_cache_pages(),
            "cache size set"
        );
    }

    pub fn set_spill_size(&self, spill_size: usize) {
        self.shared.enter().cache.set_spill_size(spill_size);
    }

    /// Version of the file contents as seen by this handle.
    ///
    /// Commits made through other handles change it; this handle's own
    /// commits do not.
    pub fn data_version(&self) -> u64 {
        let inner = self.shared.enter();
        inner
            .pager
            .data_version()
            .wrapping_add_signed(self.data_version_offset)
    }

    /// Snapshot of the tree rooted at `root`
    pub fn export_tree(&self, root: PageId) -> Result<TreeNode> {
        let mut inner = self.shared.enter();
        Self::check_root(&inner, root)?;
        export_node(&mut inner, root, 0)
    }

    /// Close the handle, detaching its cursors and rolling back any
    /// transaction still open
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let detached = self.shared.enter().close_cursors_of(self.id);
        let result = self.rollback();
        debug!(handle = self.id, cursors = detached, "handle closed");
        result
    }
}

impl Drop for Btree {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(handle = self.id, error = %err, "error while closing handle");
        }
    }
}

/// Flush dirty pages and run the pager's final commit step
fn finish_write(inner: &mut BtSharedInner) -> Result<()> {
    inner.flush_dirty()?;
    inner.pager.commit_phase_two()
}

fn export_node(inner: &mut BtSharedInner, page_id: PageId, depth: usize) -> Result<TreeNode> {
    if depth > MAX_DEPTH {
        return Err(StorageError::corruption("tree too deep to export"));
    }
    let page = inner.page(page_id)?;
    let mut keys = Vec::with_capacity(page.cell_count());
    let mut payloads = Vec::new();
    let mut children = Vec::new();

    if page.is_leaf() {
        for cell in page.get_all_cells()? {
            keys.push(cell.key);
            payloads.push(String::from_utf8_lossy(&cell.payload).into_owned());
        }
    } else {
        for index in 0..page.cell_count() {
            keys.push(page.cell_key(index)?);
        }
        for index in 0..=page.cell_count() {
            let child = page.child_at(index)?;
            children.push(export_node(inner, child, depth + 1)?);
        }
    }

    Ok(TreeNode {
        page_id: page_id.value(),
        is_leaf: page.is_leaf(),
        keys,
        payloads,
        children,
    })
}
