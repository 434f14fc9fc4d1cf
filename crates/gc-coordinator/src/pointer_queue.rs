//! Reusable queue of raw addresses.
//!
//! Filled in arbitrary order during a pass, then optionally sorted and
//! uniquified so it can be binary searched. Storage comes from an
//! [`IndexArray`], so clearing keeps the buckets for the next collection.

use crate::array_list::IndexArray;
use crate::fatal;

/// Queue of addresses backed by an [`IndexArray`].
#[derive(Debug)]
pub struct PointerQueue {
    slots: IndexArray,
}

impl PointerQueue {
    /// An empty queue. `what` names it in allocation failures.
    #[must_use]
    pub fn new(what: &'static str) -> Self {
        Self {
            slots: IndexArray::new(what),
        }
    }

    /// Number of entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the queue has no entries.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Append `addr`.
    #[inline]
    pub fn add(&mut self, addr: usize) {
        self.slots.push(addr);
    }

    /// Append every entry of `other`.
    pub fn add_queue(&mut self, other: &Self) {
        for addr in other.iter() {
            self.slots.push(addr);
        }
    }

    /// Entry at `index`.
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> Option<usize> {
        self.slots.get(index)
    }

    /// Overwrite an existing entry.
    pub fn set(&mut self, index: usize, addr: usize) {
        self.slots.set(index, addr);
    }

    /// Entries in queue order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter()
    }

    /// Drop every entry, keeping the storage.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Keep only the first `len` entries.
    pub fn truncate(&mut self, len: usize) {
        self.slots.truncate(len);
    }

    /// Remove zero entries, preserving order.
    pub fn remove_nulls(&mut self) {
        self.slots.remove_nulls();
    }

    /// Index of `addr` by linear scan.
    #[must_use]
    pub fn find(&self, addr: usize) -> Option<usize> {
        self.slots.find(addr)
    }

    /// Sort ascending and drop duplicates.
    pub fn sort_uniq(&mut self) {
        let len = self.len();
        if len < 2 {
            return;
        }

        let mut sorted = Vec::new();
        fatal::reserve(&mut sorted, len, "pointer queue sort");
        sorted.extend(self.iter());
        sorted.sort_unstable();
        sorted.dedup();

        for (i, &addr) in sorted.iter().enumerate() {
            self.slots.set(i, addr);
        }
        self.slots.truncate(sorted.len());
    }

    /// Index of the first entry `>= addr` in a sorted queue; `len()` if none.
    #[must_use]
    pub fn search(&self, addr: usize) -> usize {
        let mut lo = 0;
        let mut hi = self.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.slots.get(mid) {
                Some(value) if value < addr => lo = mid + 1,
                _ => hi = mid,
            }
        }
        lo
    }
}
