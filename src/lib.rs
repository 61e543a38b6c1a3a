//! # Shared B-tree
//!
//! A transactional page store with cursor-based integer-key B-trees, shared
//! by any number of connection handles on one database file.
//!
//! ## Architecture
//!
//! - **Page Layer** (`page`): Slotted page format with integer-key cells
//! - **Page Cache** (`pcache`): LRU page cache behind a swappable allocator
//! - **Pager** (`pager`): File I/O, rollback journal and two-phase commit
//! - **B-Tree Layer** (`btree`): Shared state, handles, cursors and balancing
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shared_btree::{Btree, Config, SeekResult};
//!
//! let mut db = Btree::open(&Config::new("my_database.db"))?;
//! db.begin_trans(true)?;
//! let table = db.create_table()?;
//!
//! let mut cursor = db.cursor(table, true)?;
//! cursor.insert(42, b"hello")?;
//! assert_eq!(cursor.move_to(42, false)?, SeekResult::Found);
//! drop(cursor);
//!
//! db.commit()?;
//! ```

pub mod btree;
pub mod error;
pub mod page;
pub mod pager;
pub mod pcache;
pub mod types;

#[cfg(test)]
mod testing;

pub use btree::{BtCursor, BtShared, Btree, CursorFlags, CursorState, HandleId, SeekResult};
pub use error::{Result, StorageError};
pub use types::{PageId, TransState};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use types::{DEFAULT_CACHE_SIZE, DEFAULT_PAGE_SIZE, DEFAULT_SPILL_SIZE};

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Path to the database file
    pub path: PathBuf,
    /// Page size for a new file; an existing file keeps its own (default: 4096)
    pub page_size: usize,
    /// Cache budget: pages if positive, KiB if negative (default: -2000)
    pub cache_size: i64,
    /// Dirty pages held before spilling to the file (default: 64)
    pub spill_size: usize,
    /// Whether commit syncs the file (default: true)
    pub sync_on_commit: bool,
    /// Extra bytes the cache accounts per page
    pub extra_bytes: usize,
    /// Whether clean pages may be evicted (default: true)
    pub purgeable: bool,
}

impl Config {
    /// Create a new configuration with default settings
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            spill_size: DEFAULT_SPILL_SIZE,
            sync_on_commit: true,
            extra_bytes: 0,
            purgeable: true,
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn cache_size(mut self, cache_size: i64) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn spill_size(mut self, spill_size: usize) -> Self {
        self.spill_size = spill_size;
        self
    }

    /// Disable for speed when durability does not matter
    pub fn sync_on_commit(mut self, enabled: bool) -> Self {
        self.sync_on_commit = enabled;
        self
    }

    pub fn extra_bytes(mut self, extra_bytes: usize) -> Self {
        self.extra_bytes = extra_bytes;
        self
    }

    pub fn purgeable(mut self, purgeable: bool) -> Self {
        self.purgeable = purgeable;
        self
    }
}

/// Node of an exported tree
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    /// Page ID
    pub page_id: u32,
    /// Whether this is a leaf node
    pub is_leaf: bool,
    /// Row keys for leaves, separator keys for interior nodes
    pub keys: Vec<i64>,
    /// Payloads (only for leaf nodes), lossily decoded as UTF-8
    pub payloads: Vec<String>,
    /// Child nodes in key order (only for interior nodes)
    pub children: Vec<TreeNode>,
}

/// Counters and cache figures for one shared B-tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BtStats {
    /// Times the per-file mutex was entered
    pub mutex_entries: u64,
    /// Cursor seeks that walked down from the root
    pub full_descents: u64,
    pub page_size: usize,
    /// Pages in the file, header included
    pub page_count: u32,
    pub free_pages: u32,
    pub cache_size: i64,
    /// Clean pages the cache may hold
    pub cache_capacity: usize,
    pub cached_pages: usize,
    pub dirty_pages: usize,
    /// Tables with a cached "has rows" answer
    pub content_flags: usize,
    pub open_cursors: usize,
    /// Handles holding a transaction
    pub transactions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_rows_survive_reopen() -> Result<()> {
        let dir = tempdir()?;
        let config = Config::new(dir.path().join("test.db")).page_size(1024);

        let (first, second) = {
            let mut db = Btree::open(&config)?;
            db.begin_trans(true)?;
            let first = db.create_table()?;
            let second = db.create_table()?;
            let mut cursor = db.cursor(first, true)?;
            for key in 0..1_000 {
                cursor.insert(key, format!("value-{}", key).as_bytes())?;
            }
            let mut cursor = db.cursor(second, true)?;
            cursor.insert(-1, b"other table")?;
            drop(cursor);
            db.commit()?;
            (first, second)
        };

        let mut db = Btree::open(&config)?;
        db.begin_trans(false)?;
        let mut cursor = db.cursor(first, false)?;
        assert_eq!(cursor.move_to(777, false)?, SeekResult::Found);
        assert_eq!(cursor.payload()?, b"value-777".to_vec());
        let mut count = 0;
        let mut more = cursor.first()?;
        while more {
            count += 1;
            more = cursor.next()?;
        }
        assert_eq!(count, 1_000);

        let mut cursor = db.cursor(second, false)?;
        assert!(cursor.first()?);
        assert_eq!(cursor.key()?, -1);
        assert!(!cursor.next()?);
        Ok(())
    }

    #[test]
    fn test_uncommitted_rows_vanish_on_reopen() -> Result<()> {
        let dir = tempdir()?;
        let config = Config::new(dir.path().join("test.db")).page_size(512);

        let root = {
            let mut db = Btree::open(&config)?;
            db.begin_trans(true)?;
            let root = db.create_table()?;
            db.commit()?;
            db.begin_trans(true)?;
            let mut cursor = db.cursor(root, true)?;
            for key in 0..200 {
                cursor.insert(key, b"never committed")?;
            }
            drop(cursor);
            db.commit_phase_one()?;
            // Dropped here; the open transaction is rolled back
            root
        };

        let mut db = Btree::open(&config)?;
        db.begin_trans(false)?;
        assert!(db.is_empty(root)?);
        Ok(())
    }

    #[test]
    fn test_random_operations_match_btreemap() -> Result<()> {
        let dir = tempdir()?;
        let config = Config::new(dir.path().join("test.db"))
            .page_size(512)
            .spill_size(8)
            .sync_on_commit(false);
        let mut db = Btree::open(&config)?;
        db.begin_trans(true)?;
        let root = db.create_table()?;

        let mut rng = StdRng::seed_from_u64(42);
        let mut model = BTreeMap::new();
        for round in 0..10 {
            let mut cursor = db.cursor(root, true)?;
            for _ in 0..300 {
                let key = rng.gen_range(-500..500);
                if rng.gen_bool(0.7) {
                    let len = rng.gen_range(0..60);
                    let payload = vec![(key & 0xff) as u8; len];
                    cursor.insert(key, &payload)?;
                    model.insert(key, payload);
                } else if cursor.move_to(key, false)? == SeekResult::Found {
                    cursor.delete()?;
                    assert!(model.remove(&key).is_some());
                } else {
                    assert!(!model.contains_key(&key));
                }
            }
            drop(cursor);
            db.commit()?;
            db.begin_trans(true)?;

            let mut cursor = db.cursor(root, false)?;
            let mut rows = Vec::new();
            let mut more = cursor.first()?;
            while more {
                rows.push((cursor.key()?, cursor.payload()?));
                more = cursor.next()?;
            }
            let expected: Vec<_> = model.iter().map(|(k, v)| (*k, v.clone())).collect();
            assert_eq!(rows, expected, "round {}", round);
        }
        Ok(())
    }

    #[test]
    fn test_handles_on_threads() -> Result<()> {
        let dir = tempdir()?;
        let config = Config::new(dir.path().join("test.db")).sync_on_commit(false);
        let mut setup = Btree::open(&config)?;
        setup.begin_trans(true)?;
        let root = setup.create_table()?;
        setup.commit()?;
        let shared = Arc::clone(setup.shared());

        std::thread::scope(|scope| -> Result<()> {
            let workers: Vec<_> = (0..4i64)
                .map(|worker| {
                    let shared = Arc::clone(&shared);
                    scope.spawn(move || -> Result<()> {
                        let mut db = Btree::new(shared);
                        for batch in 0..10 {
                            loop {
                                match db.begin_trans(true) {
                                    Ok(()) => break,
                                    Err(StorageError::Busy(_)) => std::thread::yield_now(),
                                    Err(err) => return Err(err),
                                }
                            }
                            let mut cursor = db.cursor(root, true)?;
                            for i in 0..25 {
                                let key = worker * 1_000 + batch * 25 + i;
                                cursor.insert(key, &key.to_be_bytes())?;
                            }
                            drop(cursor);
                            db.commit()?;
                        }
                        Ok(())
                    })
                })
                .collect();
            for worker in workers {
                worker
                    .join()
                    .map_err(|_| StorageError::invalid_operation("worker panicked"))??;
            }
            Ok(())
        })?;

        setup.begin_trans(false)?;
        let mut cursor = setup.cursor(root, false)?;
        let mut count = 0;
        let mut more = cursor.first()?;
        while more {
            let key = cursor.key()?;
            assert_eq!(cursor.payload()?, key.to_be_bytes().to_vec());
            count += 1;
            more = cursor.next()?;
        }
        assert_eq!(count, 4 * 10 * 25);
        assert_eq!(shared.stats().transactions, 1);
        Ok(())
    }

    #[test]
    fn test_config_serializes() {
        let config = Config::new("/tmp/x.db").cache_size(100);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"cacheSize\":100"));
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cache_size, 100);
        assert_eq!(back.page_size, DEFAULT_PAGE_SIZE);
    }
}
