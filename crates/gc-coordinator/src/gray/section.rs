//! Gray queue sections and their lifecycle.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use super::GrayEntry;
use crate::fatal;

/// Entries per section: 128 words minus the section header.
pub const DEFAULT_SECTION_SIZE: usize = 128 - 3;

/// Where a section currently lives.
///
/// ```text
/// Floating --> Enqueued --> FreeList
///    ^  |         |            |
///    |  |         v            |
///    |  +----- Floating <------+
///    v                         v
///  Freed <---------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SectionState {
    /// Detached and owned by whoever holds the `Box`.
    Floating = 0,
    /// Linked into a queue.
    Enqueued = 1,
    /// Empty, parked on a queue's free list.
    FreeList = 2,
    /// Returned to the allocator.
    Freed = 3,
}

impl SectionState {
    #[must_use]
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Floating,
            1 => Self::Enqueued,
            2 => Self::FreeList,
            _ => Self::Freed,
        }
    }

    /// Whether `self -> to` is a legal edge.
    #[must_use]
    pub const fn can_become(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Floating, Self::Enqueued | Self::Freed)
                | (Self::Enqueued, Self::Floating | Self::FreeList)
                | (Self::FreeList, Self::Floating | Self::Freed)
        )
    }
}

/// A fixed-capacity run of gray entries.
///
/// While a section is enqueued only the queue owner touches its entries; the
/// link fields are atomics because a stealer walks `prev` from the tail while
/// the owner relinks the head.
pub struct GrayQueueSection {
    entries: UnsafeCell<Box<[GrayEntry]>>,
    /// Number of live entries. Stale for the head section of a queue, whose
    /// size is the queue's cursor until another section is pushed above it.
    size: AtomicUsize,
    pub(super) next: AtomicPtr<GrayQueueSection>,
    pub(super) prev: AtomicPtr<GrayQueueSection>,
    state: AtomicU8,
}

impl GrayQueueSection {
    /// Allocate an empty floating section.
    #[must_use]
    pub fn new(capacity: usize) -> Box<Self> {
        assert!(capacity > 0, "gray queue sections need room for one entry");
        let entries = fatal::alloc_slice(capacity, "gray queue section", |_| GrayEntry::default());
        Box::new(Self {
            entries: UnsafeCell::new(entries),
            size: AtomicUsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
            prev: AtomicPtr::new(ptr::null_mut()),
            state: AtomicU8::new(SectionState::Floating as u8),
        })
    }

    /// Build a floating section holding `entries`.
    ///
    /// # Panics
    ///
    /// Panics if `entries` does not fit in `capacity`.
    #[must_use]
    pub fn from_entries(capacity: usize, entries: &[GrayEntry]) -> Box<Self> {
        assert!(entries.len() <= capacity, "too many entries for section");
        let section = Self::new(capacity);
        for (i, &entry) in entries.iter().enumerate() {
            // SAFETY: the section is floating and owned here.
            unsafe { section.write(i, entry) };
        }
        section.set_size(entries.len());
        section
    }

    /// Maximum number of entries.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        // SAFETY: the boxed slice is never replaced, only its elements are
        // written, so its length is stable.
        unsafe { (&*self.entries.get()).len() }
    }

    /// Live entries. Meaningful for floating sections and for enqueued
    /// sections below the head.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Whether [`len`](Self::len) is zero.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The live entries of a floating section.
    #[must_use]
    pub fn entries(&self) -> &[GrayEntry] {
        // SAFETY: callers reach a section by `&` only through an owning `Box`,
        // so no queue is writing to it.
        unsafe { &(&*self.entries.get())[..self.len()] }
    }

    #[inline]
    pub(super) fn set_size(&self, size: usize) {
        debug_assert!(size <= self.capacity());
        self.size.store(size, Ordering::Relaxed);
    }

    /// # Safety
    ///
    /// The caller must be the only thread accessing the entries.
    #[inline]
    pub(super) unsafe fn write(&self, index: usize, entry: GrayEntry) {
        unsafe { (&mut *self.entries.get())[index] = entry };
    }

    /// # Safety
    ///
    /// The caller must be the only thread accessing the entries.
    #[inline]
    pub(super) unsafe fn read(&self, index: usize) -> GrayEntry {
        unsafe { (&*self.entries.get())[index] }
    }

    pub(super) fn unlink(&self) {
        self.next.store(ptr::null_mut(), Ordering::Relaxed);
        self.prev.store(ptr::null_mut(), Ordering::Relaxed);
    }

    /// Current lifecycle state. Only tracked in debug builds; release builds
    /// report the state the section was created in.
    #[must_use]
    pub fn state(&self) -> SectionState {
        SectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`, checking both the edge and the current
    /// state. Does nothing in release builds.
    #[inline]
    pub(super) fn transition(&self, from: SectionState, to: SectionState) {
        if !cfg!(debug_assertions) {
            return;
        }
        assert!(
            from.can_become(to),
            "illegal gray section transition {from:?} -> {to:?}"
        );
        if let Err(actual) =
            self.state
                .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
        {
            panic!(
                "gray section is {:?}, expected {from:?} before moving to {to:?}",
                SectionState::from_u8(actual)
            );
        }
    }
}

impl Drop for GrayQueueSection {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let from = match self.state() {
            SectionState::FreeList => SectionState::FreeList,
            _ => SectionState::Floating,
        };
        self.transition(from, SectionState::Freed);
    }
}

impl std::fmt::Debug for GrayQueueSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrayQueueSection")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
