//! What the coordinator needs to know about the heap it serves.

/// Which part of the heap a collection covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    /// Nursery-only (minor) collection.
    Nursery,
    /// Whole-heap (major) collection.
    Old,
}

impl Generation {
    /// Lowercase name used in log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Nursery => "nursery",
            Self::Old => "old",
        }
    }
}

/// The major heap and large-object space, as seen by the governor.
///
/// Sizes are in bytes. Implementations are queried from the collecting
/// thread while the world is stopped, except for
/// [`concurrent_collection_in_progress`](Self::concurrent_collection_in_progress)
/// which may be polled at any time.
pub trait MajorHeap {
    /// Bytes occupied by the major heap's blocks.
    fn major_heap_size(&self) -> usize;

    /// Number of major heap sections currently allocated.
    fn major_section_count(&self) -> usize;

    /// Bytes currently held by large objects.
    fn los_usage(&self) -> usize;

    /// Bytes ever allocated in the large-object space.
    fn los_usage_total(&self) -> usize;

    /// Whether the sweep of the last major collection has completed.
    fn have_swept(&self) -> bool;

    /// Bytes that survived the last completed sweep.
    fn bytes_survived_last_sweep(&self) -> usize;

    /// Block until any lazy or concurrent sweep has completed.
    fn finish_sweeping(&self);

    /// Release swept empty blocks, keeping about `keep_sections` of them.
    fn free_swept_blocks(&self, keep_sections: usize) {
        let _ = keep_sections;
    }

    /// Whether a concurrent major collection is marking right now.
    fn concurrent_collection_in_progress(&self) -> bool;
}
