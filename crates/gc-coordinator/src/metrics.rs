//! Collector statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of the governor's accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GovernorStats {
    /// Bytes currently mapped from the OS through the governor.
    pub total_os_alloc: usize,
    /// High-water mark of `total_os_alloc`.
    pub max_os_alloc: usize,
    /// Bytes reserved against the heap limit.
    pub allocated_heap: usize,
    /// Heap size at which the next major collection triggers.
    pub trigger_size: usize,
    /// Bytes promoted out of the nursery since startup.
    pub promoted: usize,
    /// Bytes allocated directly into the major heap since startup.
    pub allocated_major: usize,
}

/// Gray queue counters, shared by every queue created from one context.
#[derive(Debug, Default)]
pub struct GrayQueueStats {
    sections_allocated: AtomicU64,
    sections_freed: AtomicU64,
    enqueue_slow_path: AtomicU64,
    dequeue_slow_path: AtomicU64,
    steals: AtomicU64,
    abandoned_steals: AtomicU64,
}

/// Snapshot of [`GrayQueueStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GrayQueueStatsSnapshot {
    /// Sections taken from the allocator.
    pub sections_allocated: u64,
    /// Sections returned to the allocator, including dropped empty ones.
    pub sections_freed: u64,
    /// Enqueues that had to link a new section.
    pub enqueue_slow_path: u64,
    /// Dequeues that had to unlink the head section.
    pub dequeue_slow_path: u64,
    /// Sections successfully stolen.
    pub steals: u64,
    /// Steals that lost the race for the last section.
    pub abandoned_steals: u64,
}

impl GrayQueueStats {
    /// All counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sections_allocated: AtomicU64::new(0),
            sections_freed: AtomicU64::new(0),
            enqueue_slow_path: AtomicU64::new(0),
            dequeue_slow_path: AtomicU64::new(0),
            steals: AtomicU64::new(0),
            abandoned_steals: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_section_allocated(&self) {
        self.sections_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sections_freed(&self, count: usize) {
        self.sections_freed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_enqueue_slow_path(&self) {
        self.enqueue_slow_path.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dequeue_slow_path(&self) {
        self.dequeue_slow_path.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_steal(&self) {
        self.steals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abandoned_steal(&self) {
        self.abandoned_steals.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter.
    #[must_use]
    pub fn snapshot(&self) -> GrayQueueStatsSnapshot {
        GrayQueueStatsSnapshot {
            sections_allocated: self.sections_allocated.load(Ordering::Relaxed),
            sections_freed: self.sections_freed.load(Ordering::Relaxed),
            enqueue_slow_path: self.enqueue_slow_path.load(Ordering::Relaxed),
            dequeue_slow_path: self.dequeue_slow_path.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
            abandoned_steals: self.abandoned_steals.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = GrayQueueStats::new();
        stats.record_section_allocated();
        stats.record_section_allocated();
        stats.record_sections_freed(2);
        stats.record_steal();
        stats.record_abandoned_steal();
        stats.record_enqueue_slow_path();
        stats.record_dequeue_slow_path();

        let snap = stats.snapshot();
        assert_eq!(snap.sections_allocated, 2);
        assert_eq!(snap.sections_freed, 2);
        assert_eq!(snap.steals, 1);
        assert_eq!(snap.abandoned_steals, 1);
        assert_eq!(snap.enqueue_slow_path, 1);
        assert_eq!(snap.dequeue_slow_path, 1);
    }
}
