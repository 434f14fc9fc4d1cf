//! Sectioned gray queue with section-granular stealing.
//!
//! The owner pushes and pops entries at the head section. Stealers detach
//! whole sections from the tail. The two ends only meet when the queue is
//! down to its last section, and `num_sections` arbitrates that case:
//!
//! - The owner decrements the count before unlinking an emptied head. Only if
//!   the result is `<= 0` (it may be consuming the last section) does it take
//!   the steal mutex.
//! - A stealer takes the steal mutex, then decrements. If the result is still
//!   positive there is at least one section besides the owner's head and the
//!   tail is safe to detach. Otherwise it restores the count and gives up.
//!
//! Linking a new head publishes the section with a `Release` increment, which
//! every stealer's `AcqRel` decrement synchronizes with.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicIsize, AtomicPtr, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;

use super::section::{GrayQueueSection, SectionState};
use super::GrayEntry;
use crate::metrics::GrayQueueStats;
use crate::trace::{Descriptor, ObjectRef};

/// Free sections a queue keeps around after [`GrayQueue::trim_free_list`].
pub const GRAY_QUEUE_LENGTH_LIMIT: usize = 64;

struct Shared {
    first: AtomicPtr<GrayQueueSection>,
    last: AtomicPtr<GrayQueueSection>,
    num_sections: CachePadded<AtomicIsize>,
    steal_mutex: Mutex<()>,
    stats: Arc<GrayQueueStats>,
}

/// A gray queue owned by a single marking thread.
///
/// The queue may move between threads but is not `Sync`: every mutating
/// operation needs `&mut self`. Other threads take work through a
/// [`Stealer`].
pub struct GrayQueue {
    shared: Arc<Shared>,
    /// Number of live entries in the head section.
    cursor: usize,
    free_list: Vec<Box<GrayQueueSection>>,
    section_capacity: usize,
    _not_sync: PhantomData<Cell<()>>,
}

/// Empty sections detached from a disposed queue, ready to seed a new one.
#[derive(Debug, Default)]
pub struct FreeSections {
    sections: Vec<Box<GrayQueueSection>>,
}

impl FreeSections {
    /// Number of parked sections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    /// Whether nothing is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

impl GrayQueue {
    /// Create an empty queue whose sections hold `section_capacity` entries.
    #[must_use]
    pub fn new(section_capacity: usize, stats: Arc<GrayQueueStats>) -> Self {
        Self::with_free_list(section_capacity, stats, FreeSections::default())
    }

    /// Create an empty queue that reuses `free` before allocating.
    #[must_use]
    pub fn with_free_list(
        section_capacity: usize,
        stats: Arc<GrayQueueStats>,
        free: FreeSections,
    ) -> Self {
        assert!(section_capacity > 0, "gray queue section capacity must be positive");
        debug_assert!(
            free.sections
                .iter()
                .all(|s| s.capacity() == section_capacity),
            "reused sections have a different capacity"
        );
        Self {
            shared: Arc::new(Shared {
                first: AtomicPtr::new(ptr::null_mut()),
                last: AtomicPtr::new(ptr::null_mut()),
                num_sections: CachePadded::new(AtomicIsize::new(0)),
                steal_mutex: Mutex::new(()),
                stats,
            }),
            cursor: 0,
            free_list: free.sections,
            section_capacity,
            _not_sync: PhantomData,
        }
    }

    /// A handle other threads use to take sections from this queue.
    #[must_use]
    pub fn stealer(&self) -> Stealer {
        Stealer {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Entries per section.
    #[must_use]
    pub const fn section_capacity(&self) -> usize {
        self.section_capacity
    }

    /// True iff no section is linked, so no dequeue can succeed.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.first.load(Ordering::Relaxed).is_null()
    }

    /// Number of linked sections as last published.
    #[must_use]
    pub fn section_count(&self) -> usize {
        usize::try_from(self.shared.num_sections.load(Ordering::Acquire)).unwrap_or(0)
    }

    /// Entries per linked section, head first.
    #[must_use]
    pub fn section_sizes(&self) -> Vec<usize> {
        let _guard = self.shared.steal_mutex.lock();
        let mut sizes = Vec::new();
        let mut cur = self.shared.first.load(Ordering::Relaxed);
        while !cur.is_null() {
            // SAFETY: stealers only detach sections under the steal mutex,
            // which is held, and only the owner (us) unlinks the head.
            let section = unsafe { &*cur };
            sizes.push(if sizes.is_empty() { self.cursor } else { section.len() });
            cur = section.next.load(Ordering::Acquire);
        }
        sizes
    }

    /// Total number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.section_sizes().iter().sum()
    }

    /// Empty sections parked on the free list.
    #[must_use]
    pub fn free_sections(&self) -> usize {
        self.free_list.len()
    }

    /// Push an object to scan.
    #[inline]
    pub fn enqueue(&mut self, obj: ObjectRef, desc: Descriptor) {
        debug_assert!(!obj.is_null(), "enqueueing a null object");

        let mut head = self.shared.first.load(Ordering::Relaxed);
        // SAFETY: a linked head is only freed by the owner.
        if head.is_null() || self.cursor == unsafe { (*head).capacity() } {
            head = self.push_fresh_section();
        }
        // SAFETY: entries of the head section are only touched by the owner.
        unsafe { (*head).write(self.cursor, GrayEntry::new(obj, desc)) };
        self.cursor += 1;
    }

    /// Pop an object to scan. Order is unspecified.
    #[inline]
    pub fn dequeue(&mut self) -> Option<GrayEntry> {
        let head = self.shared.first.load(Ordering::Relaxed);
        if head.is_null() {
            return None;
        }
        debug_assert!(self.cursor > 0, "linked head section is empty");

        self.cursor -= 1;
        // SAFETY: as in `enqueue`.
        let entry = unsafe { (*head).read(self.cursor) };

        if self.cursor == 0 {
            self.shared.stats.record_dequeue_slow_path();
            let section = self.unlink_head(head);
            section.transition(SectionState::Enqueued, SectionState::FreeList);
            self.free_list.push(section);
        }
        Some(entry)
    }

    /// Link a whole section as the new head. Empty sections are freed.
    pub fn enqueue_section(&mut self, section: Box<GrayQueueSection>) {
        if section.is_empty() {
            self.shared.stats.record_sections_freed(1);
            return;
        }
        let len = section.len();
        self.link_head(section, len);
    }

    /// Detach the head section with its entries.
    pub fn dequeue_section(&mut self) -> Option<Box<GrayQueueSection>> {
        let head = self.shared.first.load(Ordering::Relaxed);
        if head.is_null() {
            return None;
        }
        // SAFETY: the head is ours until unlinked.
        unsafe { (*head).set_size(self.cursor) };
        let section = self.unlink_head(head);
        section.transition(SectionState::Enqueued, SectionState::Floating);
        Some(section)
    }

    /// Free parked sections beyond `limit`.
    pub fn trim_free_list(&mut self, limit: usize) {
        if self.free_list.len() > limit {
            let excess = self.free_list.len() - limit;
            self.free_list.truncate(limit);
            self.shared.stats.record_sections_freed(excess);
        }
    }

    /// Retire an empty queue, keeping its trimmed free list for reuse.
    ///
    /// # Panics
    ///
    /// Panics if the queue still holds entries.
    #[must_use]
    pub fn dispose(mut self) -> FreeSections {
        assert!(self.is_empty(), "disposing a gray queue that still has work");
        self.trim_free_list(GRAY_QUEUE_LENGTH_LIMIT);
        FreeSections {
            sections: std::mem::take(&mut self.free_list),
        }
    }

    fn push_fresh_section(&mut self) -> *mut GrayQueueSection {
        self.shared.stats.record_enqueue_slow_path();
        let section = if let Some(section) = self.free_list.pop() {
            section.transition(SectionState::FreeList, SectionState::Floating);
            section
        } else {
            self.shared.stats.record_section_allocated();
            GrayQueueSection::new(self.section_capacity)
        };
        section.set_size(0);
        self.link_head(section, 0)
    }

    fn link_head(&mut self, section: Box<GrayQueueSection>, cursor: usize) -> *mut GrayQueueSection {
        section.transition(SectionState::Floating, SectionState::Enqueued);

        let first = self.shared.first.load(Ordering::Relaxed);
        if !first.is_null() {
            // SAFETY: the old head is still ours; stealers cannot see its size
            // before the increment below.
            unsafe { (*first).set_size(self.cursor) };
        }
        section.next.store(first, Ordering::Relaxed);
        section.prev.store(ptr::null_mut(), Ordering::Relaxed);

        let raw = Box::into_raw(section);
        if first.is_null() {
            self.shared.last.store(raw, Ordering::Release);
        } else {
            // SAFETY: `first` is linked; only the owner writes a head's `prev`.
            unsafe { (*first).prev.store(raw, Ordering::Release) };
        }
        self.shared.first.store(raw, Ordering::Release);
        self.cursor = cursor;

        self.shared.num_sections.fetch_add(1, Ordering::Release);
        raw
    }

    /// Unlink `head` and take ownership of it. Resets the cursor to the size
    /// of the next section.
    fn unlink_head(&mut self, head: *mut GrayQueueSection) -> Box<GrayQueueSection> {
        let remaining = self.shared.num_sections.fetch_sub(1, Ordering::AcqRel) - 1;
        // A stealer may be detaching the section below us as its tail.
        let guard = (remaining <= 0).then(|| self.shared.steal_mutex.lock());

        // SAFETY: `head` is linked. A stealer can only reach it as the new
        // tail, which requires the steal mutex whenever `remaining <= 0`.
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        self.shared.first.store(next, Ordering::Relaxed);
        if next.is_null() {
            debug_assert!(guard.is_some(), "last section unlinked without the steal mutex");
            debug_assert_eq!(
                self.shared.num_sections.load(Ordering::Relaxed),
                0,
                "inconsistent gray section count"
            );
            self.shared.last.store(ptr::null_mut(), Ordering::Relaxed);
            self.cursor = 0;
        } else {
            // SAFETY: `next` is linked and cannot be stolen: the count still
            // includes it and a stealer needs at least two sections.
            unsafe {
                (*next).prev.store(ptr::null_mut(), Ordering::Relaxed);
                self.cursor = (*next).len();
            }
        }
        drop(guard);

        // SAFETY: `head` came from `Box::into_raw` in `link_head` and is no
        // longer reachable from the queue.
        let section = unsafe { Box::from_raw(head) };
        section.unlink();
        section
    }
}

impl Drop for GrayQueue {
    fn drop(&mut self) {
        let _guard = self.shared.steal_mutex.lock();
        self.shared.num_sections.store(0, Ordering::Release);
        self.shared.last.store(ptr::null_mut(), Ordering::Relaxed);
        let mut cur = self.shared.first.swap(ptr::null_mut(), Ordering::Relaxed);

        let mut freed = self.free_list.len();
        while !cur.is_null() {
            // SAFETY: every linked section came from `Box::into_raw`, and the
            // count is zero so no stealer will touch the list again.
            let section = unsafe { Box::from_raw(cur) };
            cur = section.next.load(Ordering::Relaxed);
            section.unlink();
            section.transition(SectionState::Enqueued, SectionState::Floating);
            freed += 1;
        }
        self.free_list.clear();
        self.shared.stats.record_sections_freed(freed);
    }
}

impl std::fmt::Debug for GrayQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrayQueue")
            .field("sections", &self.section_count())
            .field("cursor", &self.cursor)
            .field("free_sections", &self.free_list.len())
            .field("section_capacity", &self.section_capacity)
            .finish()
    }
}

/// Takes whole sections from the tail of a [`GrayQueue`].
#[derive(Clone)]
pub struct Stealer {
    shared: Arc<Shared>,
}

impl Stealer {
    /// Detach the tail section.
    ///
    /// Returns `None` when the queue has at most one section, or when the
    /// owner raced us down to its last section. Neither is an error; callers
    /// retry or look elsewhere.
    #[must_use]
    pub fn steal_section(&self) -> Option<Box<GrayQueueSection>> {
        let shared = &*self.shared;
        if shared.num_sections.load(Ordering::Acquire) <= 1 {
            return None;
        }

        let _guard = shared.steal_mutex.lock();
        let remaining = shared.num_sections.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining <= 0 {
            shared.num_sections.fetch_add(1, Ordering::AcqRel);
            shared.stats.record_abandoned_steal();
            return None;
        }

        let tail = shared.last.load(Ordering::Acquire);
        assert!(!tail.is_null(), "gray queue has sections but no tail");
        // SAFETY: with at least two sections counted the tail is not the
        // owner's head, and only stealers holding the mutex detach it.
        let new_last = unsafe { (*tail).prev.load(Ordering::Acquire) };
        assert!(!new_last.is_null(), "stealing the only gray section");

        shared.last.store(new_last, Ordering::Release);
        // SAFETY: `new_last` stays linked; the owner only reads its `next`
        // under the mutex once it becomes the last section.
        unsafe { (*new_last).next.store(ptr::null_mut(), Ordering::Release) };

        // SAFETY: `tail` came from `Box::into_raw` and is now unreachable.
        let section = unsafe { Box::from_raw(tail) };
        section.unlink();
        section.transition(SectionState::Enqueued, SectionState::Floating);
        shared.stats.record_steal();
        Some(section)
    }

    /// Number of sections in the victim queue as last published.
    #[must_use]
    pub fn section_count(&self) -> usize {
        usize::try_from(self.shared.num_sections.load(Ordering::Acquire)).unwrap_or(0)
    }
}

impl std::fmt::Debug for Stealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stealer")
            .field("sections", &self.section_count())
            .finish()
    }
}
