//! Shared B-tree layer.
//!
//! - [`BtShared`]: per-file state (pager, page cache, transaction counts)
//! - [`Btree`]: per-connection handle and the commit protocol
//! - [`BtCursor`]: seek, scan, insert and delete over one table
//!
//! Tables are keyed by `i64`. Leaves hold rows, interior pages hold
//! separator keys and child pointers.

mod balance;
mod cursor;
mod handle;
mod shared;

pub use cursor::{BtCursor, CursorFlags, CursorState, SeekResult};
pub use handle::Btree;
pub use shared::{BtShared, HandleId};
