//! Page cache: clean pages in a swappable backing cache, dirty pages pinned.
//!
//! The [`PageCache`] owns one [`BackingCache`] created by a [`CacheAllocator`]
//! for the current page size. Changing the page size builds a new backing
//! cache first and only tears the old one down once the new one exists, so a
//! failed allocation leaves the cache usable at its old size.
//!
//! Dirty pages are held outside the backing cache until they are written to
//! the pager, either at commit or when their number exceeds the spill size.

mod allocator;
mod lru;

pub use allocator::{BackingCache, CacheAllocator, LruAllocator, LruBackingCache, PageRef};

use crate::error::{Result, StorageError};
use crate::page::SlottedPage;
use crate::types::{PageId, DEFAULT_CACHE_SIZE, DEFAULT_SPILL_SIZE};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Per-file page cache
pub struct PageCache {
    allocator: Arc<dyn CacheAllocator>,
    /// Bytes per page; 0 until the first successful `set_page_size`
    page_size: usize,
    extra_bytes: usize,
    purgeable: bool,
    backing: Option<Box<dyn BackingCache>>,
    /// Positive: page count. Negative: budget in KiB.
    cache_size: i64,
    spill_size: usize,
    dirty: BTreeMap<PageId, PageRef>,
}

impl PageCache {
    /// Create an unconfigured cache. No backing cache exists until the page
    /// size is set.
    pub fn new(allocator: Arc<dyn CacheAllocator>, extra_bytes: usize, purgeable: bool) -> Self {
        Self {
            allocator,
            page_size: 0,
            extra_bytes,
            purgeable,
            backing: None,
            cache_size: DEFAULT_CACHE_SIZE,
            spill_size: DEFAULT_SPILL_SIZE,
            dirty: BTreeMap::new(),
        }
    }

    /// Current page size, 0 if never configured
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Page size the installed backing cache was created for
    pub fn backing_page_size(&self) -> Option<usize> {
        self.backing.as_ref().map(|b| b.page_size())
    }

    /// Change the page size by replacing the backing cache.
    ///
    /// A size of 0, or a cache that still has pinned or dirty pages, makes
    /// this a no-op. On allocation failure `NoMem` is returned and the old
    /// backing cache and page size are left in place.
    pub fn set_page_size(&mut self, page_size: usize) -> Result<()> {
        if page_size == 0 {
            return Ok(());
        }
        if self.pinned_pages() > 0 || !self.dirty.is_empty() {
            debug!(
                page_size,
                current = self.page_size,
                "page size locked by pinned or dirty pages"
            );
            return Ok(());
        }

        let mut new_cache = self
            .allocator
            .create(page_size, self.extra_bytes, self.purgeable)
            .ok_or_else(|| {
                StorageError::no_mem(format!("cannot create page cache for {} byte pages", page_size))
            })?;
        new_cache.set_capacity(self.pages_for(page_size));

        if let Some(old) = self.backing.take() {
            self.allocator.destroy(old);
        }
        self.backing = Some(new_cache);

        debug!(old = self.page_size, new = page_size, "page cache resized");
        self.page_size = page_size;
        Ok(())
    }

    /// Set the cache budget and pass the resulting page count on
    pub fn set_cache_size(&mut self, cache_size: i64) {
        self.cache_size = cache_size;
        let pages = self.number_of_cache_pages();
        if let Some(backing) = self.backing.as_mut() {
            backing.set_capacity(pages);
        }
    }

    /// Configured cache budget
    pub fn cache_size(&self) -> i64 {
        self.cache_size
    }

    /// Number of pages the configured budget allows at the current page size
    pub fn number_of_cache_pages(&self) -> usize {
        self.pages_for(self.page_size)
    }

    fn pages_for(&self, page_size: usize) -> usize {
        if self.cache_size >= 0 {
            return self.cache_size as usize;
        }
        let per_page = (page_size + self.extra_bytes).max(1) as i128;
        let pages = -1024 * i128::from(self.cache_size) / per_page;
        usize::try_from(pages).unwrap_or(usize::MAX)
    }

    /// Set how many dirty pages may accumulate before a spill
    pub fn set_spill_size(&mut self, spill_size: usize) {
        self.spill_size = spill_size;
    }

    /// Configured spill threshold
    pub fn spill_size(&self) -> usize {
        self.spill_size
    }

    /// Look up a page, dirty pages first
    pub fn fetch(&mut self, page_id: PageId) -> Option<PageRef> {
        if let Some(page) = self.dirty.get(&page_id) {
            return Some(Arc::clone(page));
        }
        let page = self.backing.as_mut()?.fetch(page_id);
        if page.is_some() {
            trace!(page = %page_id, "page cache hit");
        }
        page
    }

    /// Cache a page just read from the pager
    pub fn insert_clean(&mut self, page_id: PageId, page: SlottedPage) -> PageRef {
        let page = Arc::new(page);
        if let Some(backing) = self.backing.as_mut() {
            if backing.page_size() == page.page_size() {
                backing.insert(page_id, Arc::clone(&page));
            }
        }
        page
    }

    /// Record a modified page; it stays in memory until written out
    pub fn put_dirty(&mut self, page_id: PageId, page: SlottedPage) {
        if let Some(backing) = self.backing.as_mut() {
            backing.remove(page_id);
        }
        self.dirty.insert(page_id, Arc::new(page));
    }

    /// Number of dirty pages
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Whether the dirty set has grown past the spill threshold
    pub fn needs_spill(&self) -> bool {
        self.dirty.len() > self.spill_size
    }

    /// Dirty pages in page order; they stay dirty until [`Self::mark_clean`]
    pub fn dirty_pages(&self) -> Vec<(PageId, PageRef)> {
        self.dirty
            .iter()
            .map(|(id, page)| (*id, Arc::clone(page)))
            .collect()
    }

    /// Move written pages from the dirty set into the backing cache
    pub fn mark_clean(&mut self, page_ids: &[PageId]) {
        for page_id in page_ids {
            if let Some(page) = self.dirty.remove(page_id) {
                if let Some(backing) = self.backing.as_mut() {
                    if backing.page_size() == page.page_size() {
                        backing.insert(*page_id, page);
                    }
                }
            }
        }
    }

    /// Forget a page entirely, dirty or not
    pub fn remove(&mut self, page_id: PageId) {
        self.dirty.remove(&page_id);
        if let Some(backing) = self.backing.as_mut() {
            backing.remove(page_id);
        }
    }

    /// Drop every page, discarding unwritten changes
    pub fn purge(&mut self) {
        self.dirty.clear();
        if let Some(backing) = self.backing.as_mut() {
            backing.clear();
        }
    }

    /// Pages referenced from outside the cache
    pub fn pinned_pages(&self) -> usize {
        let dirty_pinned = self
            .dirty
            .values()
            .filter(|p| Arc::strong_count(p) > 1)
            .count();
        dirty_pinned + self.backing.as_ref().map_or(0, |b| b.pinned())
    }

    /// Number of clean pages held by the backing cache
    pub fn clean_count(&self) -> usize {
        self.backing.as_ref().map_or(0, |b| b.len())
    }

    /// Approximate memory held by clean pages
    pub fn memory_used(&self) -> usize {
        self.backing.as_ref().map_or(0, |b| b.memory_used())
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("page_size", &self.page_size)
            .field("cache_size", &self.cache_size)
            .field("clean", &self.clean_count())
            .field("dirty", &self.dirty.len())
            .finish()
    }
}
