//! State shared by every handle open on one database file.
//!
//! [`BtShared`] owns the pager, the page cache, the transaction bookkeeping
//! and the cursor arena, all behind one mutex. Handles and cursors hold an
//! `Arc<BtShared>` and enter the mutex for each operation.

use crate::error::Result;
use crate::page::SlottedPage;
use crate::pager::{FilePager, Pager};
use crate::pcache::{CacheAllocator, LruAllocator, PageCache, PageRef};
use crate::types::{PageId, TransState};
use crate::{BtStats, Config};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Identifies a [`Btree`](super::Btree) handle within its shared state
pub type HandleId = u64;

/// Cursor signal: nothing happened
pub(crate) const SIGNAL_NONE: u8 = 0;
/// Cursor signal: the tree under the cursor changed, reseek before use
pub(crate) const SIGNAL_MOVED: u8 = 1;
/// Cursor signal: the owning handle was closed
pub(crate) const SIGNAL_CLOSED: u8 = 2;

/// Arena entry for an open cursor
pub(crate) struct CursorSlot {
    pub owner: HandleId,
    pub root: PageId,
    pub signal: Arc<AtomicU8>,
}

/// Everything guarded by the per-file mutex
pub(crate) struct BtSharedInner {
    pub pager: Box<dyn Pager>,
    pub cache: PageCache,
    /// Highest transaction level held by any handle
    pub in_transaction: TransState,
    /// Handles holding at least a read transaction
    pub n_transaction: usize,
    /// Handle holding the write transaction
    pub writer: Option<HandleId>,
    /// Cached answers to "does the table rooted here have rows"
    pub has_content: HashMap<PageId, bool>,
    pub cursors: Vec<Option<CursorSlot>>,
}

/// Shared B-tree state for one database file
pub struct BtShared {
    inner: Mutex<BtSharedInner>,
    next_handle: AtomicU64,
    mutex_entries: AtomicU64,
    full_descents: AtomicU64,
}

impl BtShared {
    /// Open the database file named by `config`
    pub fn open(config: &Config) -> Result<Arc<Self>> {
        let pager = FilePager::open(&config.path, config.page_size, config.sync_on_commit)?;
        Self::with_pager(Box::new(pager), Arc::new(LruAllocator), config)
    }

    /// Build shared state over any pager and cache allocator.
    ///
    /// The page size comes from the pager; the cache options from `config`.
    pub fn with_pager(
        pager: Box<dyn Pager>,
        allocator: Arc<dyn CacheAllocator>,
        config: &Config,
    ) -> Result<Arc<Self>> {
        let mut cache = PageCache::new(allocator, config.extra_bytes, config.purgeable);
        cache.set_cache_size(config.cache_size);
        cache.set_spill_size(config.spill_size);
        cache.set_page_size(pager.page_size())?;

        debug!(
            page_size = pager.page_size(),
            page_count = pager.page_count(),
            cache_pages = cache.number_of_cache_pages(),
            "shared btree opened"
        );

        Ok(Arc::new(Self {
            inner: Mutex::new(BtSharedInner {
                pager,
                cache,
                in_transaction: TransState::None,
                n_transaction: 0,
                writer: None,
                has_content: HashMap::new(),
                cursors: Vec::new(),
            }),
            next_handle: AtomicU64::new(1),
            mutex_entries: AtomicU64::new(0),
            full_descents: AtomicU64::new(0),
        }))
    }

    /// Enter the per-file mutex
    pub(crate) fn enter(&self) -> MutexGuard<'_, BtSharedInner> {
        self.mutex_entries.fetch_add(1, Ordering::Relaxed);
        self.inner.lock()
    }

    /// Lock for introspection without counting an entry
    fn peek(&self) -> MutexGuard<'_, BtSharedInner> {
        self.inner.lock()
    }

    pub(crate) fn next_handle_id(&self) -> HandleId {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn record_descent(&self) {
        self.full_descents.fetch_add(1, Ordering::Relaxed);
    }

    /// Shared transaction level
    pub fn transaction_state(&self) -> TransState {
        self.peek().in_transaction
    }

    /// Number of handles holding a transaction
    pub fn transaction_count(&self) -> usize {
        self.peek().n_transaction
    }

    /// Current page size
    pub fn page_size(&self) -> usize {
        self.peek().pager.page_size()
    }

    /// Counters and cache figures
    pub fn stats(&self) -> BtStats {
        let inner = self.peek();
        BtStats {
            mutex_entries: self.mutex_entries.load(Ordering::Relaxed),
            full_descents: self.full_descents.load(Ordering::Relaxed),
            page_size: inner.pager.page_size(),
            page_count: inner.pager.page_count(),
            free_pages: inner.pager.free_page_count(),
            cache_size: inner.cache.cache_size(),
            cache_capacity: inner.cache.number_of_cache_pages(),
            cached_pages: inner.cache.clean_count(),
            dirty_pages: inner.cache.dirty_count(),
            content_flags: inner.has_content.len(),
            open_cursors: inner.cursors.iter().flatten().count(),
            transactions: inner.n_transaction,
        }
    }
}

impl std::fmt::Debug for BtShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtShared")
            .field("mutex_entries", &self.mutex_entries.load(Ordering::Relaxed))
            .field("full_descents", &self.full_descents.load(Ordering::Relaxed))
            .finish()
    }
}

impl BtSharedInner {
    /// Fetch a B-tree page through the cache
    pub fn page(&mut self, page_id: PageId) -> Result<PageRef> {
        if let Some(page) = self.cache.fetch(page_id) {
            return Ok(page);
        }
        let buf = self.pager.read_page(page_id)?;
        let page = SlottedPage::from_bytes(&buf)?;
        Ok(self.cache.insert_clean(page_id, page))
    }

    /// Store a modified page, spilling to the pager past the spill size
    pub fn write_page(&mut self, page_id: PageId, page: SlottedPage) -> Result<()> {
        self.cache.put_dirty(page_id, page);
        if self.cache.needs_spill() {
            let spilled = self.flush_dirty()?;
            debug!(pages = spilled, "spilled dirty pages");
        }
        Ok(())
    }

    /// Write every dirty page to the pager
    pub fn flush_dirty(&mut self) -> Result<usize> {
        let dirty = self.cache.dirty_pages();
        let mut written = Vec::with_capacity(dirty.len());
        for (page_id, page) in &dirty {
            self.pager.write_page(*page_id, page.as_bytes())?;
            written.push(*page_id);
        }
        drop(dirty);
        self.cache.mark_clean(&written);
        Ok(written.len())
    }

    pub fn allocate_page(&mut self) -> Result<PageId> {
        let page_id = self.pager.allocate_page()?;
        self.cache.remove(page_id);
        Ok(page_id)
    }

    pub fn free_page(&mut self, page_id: PageId) -> Result<()> {
        self.cache.remove(page_id);
        self.pager.free_page(page_id)
    }

    /// Whether a page number can be the root of a table
    pub fn is_root_candidate(&self, root: PageId) -> bool {
        root.is_btree_page() && root.value() < self.pager.page_count()
    }

    pub fn register_cursor(&mut self, owner: HandleId, root: PageId) -> (usize, Arc<AtomicU8>) {
        let signal = Arc::new(AtomicU8::new(SIGNAL_NONE));
        let slot = CursorSlot {
            owner,
            root,
            signal: Arc::clone(&signal),
        };
        let index = match self.cursors.iter().position(Option::is_none) {
            Some(index) => {
                self.cursors[index] = Some(slot);
                index
            }
            None => {
                self.cursors.push(Some(slot));
                self.cursors.len() - 1
            }
        };
        trace!(cursor = index, owner, root = %root, "cursor opened");
        (index, signal)
    }

    /// Free an arena slot if it still belongs to `signal`
    pub fn release_cursor(&mut self, index: usize, signal: &Arc<AtomicU8>) {
        if let Some(entry) = self.cursors.get_mut(index) {
            if entry
                .as_ref()
                .is_some_and(|slot| Arc::ptr_eq(&slot.signal, signal))
            {
                *entry = None;
                trace!(cursor = index, "cursor closed");
            }
        }
    }

    /// Open cursors owned by a handle
    pub fn cursor_count(&self, owner: HandleId) -> usize {
        self.cursors
            .iter()
            .flatten()
            .filter(|slot| slot.owner == owner)
            .count()
    }

    /// Whether any cursor is open on the file
    pub fn has_cursors(&self) -> bool {
        self.cursors.iter().any(Option::is_some)
    }

    /// Tell cursors that the tree moved under them.
    ///
    /// `root` limits the notice to one table; `except` skips the cursor that
    /// made the change.
    pub fn invalidate_cursors(&self, root: Option<PageId>, except: Option<usize>) {
        for (index, slot) in self.cursors.iter().enumerate() {
            let Some(slot) = slot else { continue };
            if Some(index) == except || root.is_some_and(|r| r != slot.root) {
                continue;
            }
            slot.signal.fetch_max(SIGNAL_MOVED, Ordering::AcqRel);
        }
    }

    /// Detach every cursor owned by a handle that is going away
    pub fn close_cursors_of(&mut self, owner: HandleId) -> usize {
        let mut closed = 0;
        for entry in self.cursors.iter_mut() {
            if entry.as_ref().is_some_and(|slot| slot.owner == owner) {
                if let Some(slot) = entry.take() {
                    slot.signal.store(SIGNAL_CLOSED, Ordering::Release);
                    closed += 1;
                }
            }
        }
        closed
    }
}
