//! Recency list used by the default backing cache.

use crate::types::PageId;
use std::collections::HashMap;

/// Doubly-linked recency list over page numbers, stored in a slot vector
pub struct LruList {
    /// Maps page ID to its slot
    positions: HashMap<PageId, usize>,
    /// List nodes; unlinked nodes are recycled through `free_slots`
    nodes: Vec<LruNode>,
    /// Most recently used
    head: Option<usize>,
    /// Least recently used
    tail: Option<usize>,
    free_slots: Vec<usize>,
}

#[derive(Clone, Copy)]
struct LruNode {
    page_id: PageId,
    prev: Option<usize>,
    next: Option<usize>,
}

impl LruList {
    /// Create an empty list sized for `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            positions: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            head: None,
            tail: None,
            free_slots: Vec::new(),
        }
    }

    /// Mark a page as most recently used, adding it if absent
    pub fn touch(&mut self, page_id: PageId) {
        match self.positions.get(&page_id) {
            Some(&pos) => {
                if self.head != Some(pos) {
                    self.unlink(pos);
                    self.link_front(pos);
                }
            }
            None => {
                let node = LruNode {
                    page_id,
                    prev: None,
                    next: None,
                };
                let pos = match self.free_slots.pop() {
                    Some(pos) => {
                        self.nodes[pos] = node;
                        pos
                    }
                    None => {
                        self.nodes.push(node);
                        self.nodes.len() - 1
                    }
                };
                self.link_front(pos);
                self.positions.insert(page_id, pos);
            }
        }
    }

    /// Remove a page from the list
    pub fn remove(&mut self, page_id: PageId) {
        if let Some(pos) = self.positions.remove(&page_id) {
            self.unlink(pos);
            self.free_slots.push(pos);
        }
    }

    /// Least recently used page
    pub fn lru(&self) -> Option<PageId> {
        self.tail.map(|pos| self.nodes[pos].page_id)
    }

    /// Pages from least to most recently used
    pub fn iter_cold(&self) -> impl Iterator<Item = PageId> + '_ {
        let mut cursor = self.tail;
        std::iter::from_fn(move || {
            let pos = cursor?;
            cursor = self.nodes[pos].prev;
            Some(self.nodes[pos].page_id)
        })
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.positions.clear();
        self.nodes.clear();
        self.free_slots.clear();
        self.head = None;
        self.tail = None;
    }

    /// Number of tracked pages
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn link_front(&mut self, pos: usize) {
        self.nodes[pos].prev = None;
        self.nodes[pos].next = self.head;
        if let Some(old_head) = self.head {
            self.nodes[old_head].prev = Some(pos);
        }
        self.head = Some(pos);
        if self.tail.is_none() {
            self.tail = Some(pos);
        }
    }

    fn unlink(&mut self, pos: usize) {
        let node = self.nodes[pos];

        match node.prev {
            Some(prev) => self.nodes[prev].next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.nodes[next].prev = node.prev,
            None => self.tail = node.prev,
        }
    }
}
