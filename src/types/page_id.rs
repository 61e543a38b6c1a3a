use std::fmt;

/// Page number within the database file.
///
/// Page 0 is the file header. Table roots and every other B-tree page live
/// at 1 and above. Offsets are computed from the page size in force, so the
/// same number maps to different bytes after a page-size change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PageId(u32);

impl PageId {
    /// Sentinel for "no page", e.g. the child of a leaf cell
    pub const INVALID: PageId = PageId(u32::MAX);

    pub const HEADER: PageId = PageId(0);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// Whether the page may hold B-tree cells
    pub const fn is_btree_page(self) -> bool {
        self.0 != Self::HEADER.0 && self.0 != Self::INVALID.0
    }

    /// Byte offset of the page in a file of `page_size` pages
    pub const fn file_offset(self, page_size: usize) -> u64 {
        self.0 as u64 * page_size as u64
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::INVALID => f.write_str("none"),
            Self(id) => write!(f, "{}", id),
        }
    }
}
