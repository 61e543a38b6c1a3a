//! Backing cache allocator interface and the default LRU implementation.
//!
//! A [`CacheAllocator`] creates and destroys [`BackingCache`] instances. The
//! [`PageCache`](super::PageCache) owns exactly one backing cache at a time and
//! replaces it whenever the page size changes. Only clean pages live in a
//! backing cache; dirty pages are tracked by the page cache itself, so a
//! backing cache may evict any page nobody else holds.

use crate::page::SlottedPage;
use crate::pcache::lru::LruList;
use crate::types::PageId;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared reference to a cached page.
///
/// A page is pinned while any `PageRef` besides the cache's own is alive.
pub type PageRef = Arc<SlottedPage>;

/// Storage for clean page images of one page size
pub trait BackingCache: Send {
    /// Page size this cache was created for
    fn page_size(&self) -> usize;

    /// Set the target number of pages kept before eviction
    fn set_capacity(&mut self, pages: usize);

    /// Current target number of pages
    fn capacity(&self) -> usize;

    /// Look up a page, marking it recently used
    fn fetch(&mut self, page_id: PageId) -> Option<PageRef>;

    /// Add or replace a page, evicting unpinned pages above capacity
    fn insert(&mut self, page_id: PageId, page: PageRef);

    /// Drop a page if present
    fn remove(&mut self, page_id: PageId);

    /// Drop every page
    fn clear(&mut self);

    /// Number of cached pages
    fn len(&self) -> usize;

    /// Number of cached pages referenced from outside the cache
    fn pinned(&self) -> usize;

    /// Approximate bytes held by cached pages and their per-page extra space
    fn memory_used(&self) -> usize;
}

/// Factory for backing caches
pub trait CacheAllocator: Send + Sync {
    /// Create a backing cache; `None` means the allocation failed
    fn create(
        &self,
        page_size: usize,
        extra_bytes: usize,
        purgeable: bool,
    ) -> Option<Box<dyn BackingCache>>;

    /// Release a backing cache created by this allocator
    fn destroy(&self, cache: Box<dyn BackingCache>) {
        drop(cache);
    }
}

/// Number of map slots reserved when a cache is created
const INITIAL_SLOTS: usize = 64;

/// Default allocator producing [`LruBackingCache`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct LruAllocator;

impl CacheAllocator for LruAllocator {
    fn create(
        &self,
        page_size: usize,
        extra_bytes: usize,
        purgeable: bool,
    ) -> Option<Box<dyn BackingCache>> {
        if page_size == 0 {
            return None;
        }
        let mut pages = HashMap::new();
        pages.try_reserve(INITIAL_SLOTS).ok()?;

        Some(Box::new(LruBackingCache {
            page_size,
            extra_bytes,
            purgeable,
            capacity: 0,
            pages,
            lru: LruList::with_capacity(INITIAL_SLOTS),
        }))
    }
}

/// Hash map of pages with least-recently-used eviction
pub struct LruBackingCache {
    page_size: usize,
    extra_bytes: usize,
    /// Non-purgeable caches never evict
    purgeable: bool,
    capacity: usize,
    pages: HashMap<PageId, PageRef>,
    lru: LruList,
}

impl LruBackingCache {
    fn evict_to(&mut self, target: usize) {
        while self.pages.len() > target {
            let victim = self
                .lru
                .iter_cold()
                .find(|id| self.pages.get(id).is_some_and(|p| Arc::strong_count(p) == 1));
            match victim {
                Some(page_id) => {
                    self.pages.remove(&page_id);
                    self.lru.remove(page_id);
                }
                // Everything left is pinned; the cache grows past capacity
                None => break,
            }
        }
    }
}

impl BackingCache for LruBackingCache {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn set_capacity(&mut self, pages: usize) {
        self.capacity = pages;
        if self.purgeable {
            self.evict_to(pages);
        }
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn fetch(&mut self, page_id: PageId) -> Option<PageRef> {
        let page = self.pages.get(&page_id)?;
        let page = Arc::clone(page);
        self.lru.touch(page_id);
        Some(page)
    }

    fn insert(&mut self, page_id: PageId, page: PageRef) {
        debug_assert_eq!(page.page_size(), self.page_size);
        if self.purgeable && !self.pages.contains_key(&page_id) {
            self.evict_to(self.capacity.saturating_sub(1));
        }
        self.pages.insert(page_id, page);
        self.lru.touch(page_id);
    }

    fn remove(&mut self, page_id: PageId) {
        self.pages.remove(&page_id);
        self.lru.remove(page_id);
    }

    fn clear(&mut self) {
        self.pages.clear();
        self.lru.clear();
    }

    fn len(&self) -> usize {
        self.pages.len()
    }

    fn pinned(&self) -> usize {
        self.pages.values().filter(|p| Arc::strong_count(p) > 1).count()
    }

    fn memory_used(&self) -> usize {
        self.pages.len() * (self.page_size + self.extra_bytes)
    }
}
