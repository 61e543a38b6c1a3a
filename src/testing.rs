//! Test doubles shared by the unit tests.

use crate::error::{Result, StorageError};
use crate::page::PageBuf;
use crate::pager::Pager;
use crate::pcache::{BackingCache, CacheAllocator, LruAllocator, PageRef};
use crate::types::PageId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct AllocatorLog {
    events: Vec<String>,
    last_capacity: Option<usize>,
}

/// Allocator that records create/destroy calls and can be told to fail
#[derive(Default)]
pub struct CountingAllocator {
    inner: LruAllocator,
    log: Arc<Mutex<AllocatorLog>>,
    fail_next: AtomicBool,
}

impl CountingAllocator {
    pub fn fail_next_create(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<String> {
        self.log.lock().events.clone()
    }

    pub fn creates(&self) -> usize {
        self.count("create:")
    }

    pub fn destroys(&self) -> usize {
        self.count("destroy:")
    }

    pub fn last_capacity(&self) -> Option<usize> {
        self.log.lock().last_capacity
    }

    fn count(&self, prefix: &str) -> usize {
        self.log
            .lock()
            .events
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

impl CacheAllocator for CountingAllocator {
    fn create(
        &self,
        page_size: usize,
        extra_bytes: usize,
        purgeable: bool,
    ) -> Option<Box<dyn BackingCache>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            self.log.lock().events.push(format!("failed:{}", page_size));
            return None;
        }
        let inner = self.inner.create(page_size, extra_bytes, purgeable)?;
        self.log.lock().events.push(format!("create:{}", page_size));
        Some(Box::new(CountingCache {
            inner,
            log: Arc::clone(&self.log),
        }))
    }

    fn destroy(&self, cache: Box<dyn BackingCache>) {
        self.log
            .lock()
            .events
            .push(format!("destroy:{}", cache.page_size()));
        drop(cache);
    }
}

struct CountingCache {
    inner: Box<dyn BackingCache>,
    log: Arc<Mutex<AllocatorLog>>,
}

impl BackingCache for CountingCache {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn set_capacity(&mut self, pages: usize) {
        self.log.lock().last_capacity = Some(pages);
        self.inner.set_capacity(pages);
    }

    fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    fn fetch(&mut self, page_id: PageId) -> Option<PageRef> {
        self.inner.fetch(page_id)
    }

    fn insert(&mut self, page_id: PageId, page: PageRef) {
        self.inner.insert(page_id, page);
    }

    fn remove(&mut self, page_id: PageId) {
        self.inner.remove(page_id);
    }

    fn clear(&mut self) {
        self.inner.clear();
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn pinned(&self) -> usize {
        self.inner.pinned()
    }

    fn memory_used(&self) -> usize {
        self.inner.memory_used()
    }
}

/// Switches that make a [`FailingPager`] return I/O errors
#[derive(Default, Clone)]
pub struct FailSwitch {
    pub commit: Arc<AtomicBool>,
    pub read: Arc<AtomicBool>,
}

impl FailSwitch {
    pub fn fail_commit(&self, on: bool) {
        self.commit.store(on, Ordering::SeqCst);
    }

    pub fn fail_read(&self, on: bool) {
        self.read.store(on, Ordering::SeqCst);
    }
}

fn injected(what: &str) -> StorageError {
    StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("injected {} failure", what),
    ))
}

/// Pager wrapper that fails commit phase two or page reads on request
pub struct FailingPager {
    inner: Box<dyn Pager>,
    switch: FailSwitch,
    /// Commits that failed before reaching the inner pager
    failed_commits: u64,
}

impl FailingPager {
    pub fn new(inner: Box<dyn Pager>, switch: FailSwitch) -> Self {
        Self {
            inner,
            switch,
            failed_commits: 0,
        }
    }
}

impl Pager for FailingPager {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn set_page_size(&mut self, page_size: usize) -> Result<()> {
        self.inner.set_page_size(page_size)
    }

    fn page_count(&self) -> u32 {
        self.inner.page_count()
    }

    fn read_page(&mut self, page_id: PageId) -> Result<PageBuf> {
        if self.switch.read.load(Ordering::SeqCst) {
            return Err(injected("read"));
        }
        self.inner.read_page(page_id)
    }

    fn begin(&mut self) -> Result<()> {
        self.inner.begin()
    }

    fn in_write(&self) -> bool {
        self.inner.in_write()
    }

    fn write_page(&mut self, page_id: PageId, data: &[u8]) -> Result<()> {
        self.inner.write_page(page_id, data)
    }

    fn allocate_page(&mut self) -> Result<PageId> {
        self.inner.allocate_page()
    }

    fn free_page(&mut self, page_id: PageId) -> Result<()> {
        self.inner.free_page(page_id)
    }

    fn free_page_count(&self) -> u32 {
        self.inner.free_page_count()
    }

    fn commit_phase_one(&mut self) -> Result<()> {
        self.inner.commit_phase_one()
    }

    fn commit_phase_two(&mut self) -> Result<()> {
        if self.switch.commit.load(Ordering::SeqCst) {
            if self.inner.in_write() {
                self.failed_commits += 1;
            }
            return Err(injected("commit"));
        }
        self.inner.commit_phase_two()
    }

    fn rollback(&mut self) -> Result<()> {
        self.inner.rollback()
    }

    fn data_version(&self) -> u64 {
        self.inner.data_version() + self.failed_commits
    }
}
