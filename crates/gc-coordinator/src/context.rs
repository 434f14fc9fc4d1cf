//! Per-collector state shared by every collection.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::CollectorConfig;
use crate::governor::MemoryGovernor;
use crate::gray::{FreeSections, GrayQueue, SectionGrayQueue};
use crate::metrics::GrayQueueStats;
use crate::pinning::PinRegistry;

/// Everything the coordinator keeps between collections: pins and cement
/// table, the governor, the shared section queue and gray queue statistics.
///
/// One context serves one heap. It is `Sync`; marking threads share it by
/// reference.
#[derive(Debug)]
pub struct CollectorContext {
    config: CollectorConfig,
    pins: PinRegistry,
    governor: MemoryGovernor,
    global_sections: SectionGrayQueue,
    gray_stats: Arc<GrayQueueStats>,
    /// Free sections of the last disposed queue, handed to the next one.
    parked: Mutex<Option<FreeSections>>,
}

impl CollectorContext {
    /// Build every component from `config`.
    #[must_use]
    pub fn new(config: CollectorConfig) -> Self {
        tracing::debug!(target: "gc", ?config, "collector_context");
        let gray_stats = Arc::new(GrayQueueStats::new());
        Self {
            pins: PinRegistry::new(&config.pinning),
            governor: MemoryGovernor::new(&config.governor),
            global_sections: SectionGrayQueue::new(Arc::clone(&gray_stats)),
            gray_stats,
            parked: Mutex::new(None),
            config,
        }
    }

    /// The configuration this context was built from.
    #[must_use]
    pub const fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Pin registry and cement table.
    #[must_use]
    pub const fn pins(&self) -> &PinRegistry {
        &self.pins
    }

    /// The memory governor.
    #[must_use]
    pub const fn governor(&self) -> &MemoryGovernor {
        &self.governor
    }

    /// Sections handed between marking threads.
    #[must_use]
    pub const fn global_sections(&self) -> &SectionGrayQueue {
        &self.global_sections
    }

    /// Counters shared by every gray queue and the shared section queue.
    #[must_use]
    pub const fn gray_stats(&self) -> &Arc<GrayQueueStats> {
        &self.gray_stats
    }

    /// A new empty gray queue, reusing the sections of the last disposed one.
    #[must_use]
    pub fn new_gray_queue(&self) -> GrayQueue {
        let free = self.parked.lock().take().unwrap_or_default();
        GrayQueue::with_free_list(
            self.config.gray.section_capacity,
            Arc::clone(&self.gray_stats),
            free,
        )
    }

    /// Retire an empty queue and park its free sections for the next
    /// [`new_gray_queue`](Self::new_gray_queue).
    ///
    /// # Panics
    ///
    /// Panics if `queue` still holds entries.
    pub fn dispose_gray_queue(&self, queue: GrayQueue) {
        let free = queue.dispose();
        let mut parked = self.parked.lock();
        if let Some(previous) = parked.replace(free) {
            tracing::debug!(
                target: "gc",
                dropped = previous.len(),
                "two gray queues disposed without reuse"
            );
            self.gray_stats.record_sections_freed(previous.len());
        }
    }

    /// Number of sections parked for reuse.
    #[must_use]
    pub fn parked_sections(&self) -> usize {
        self.parked.lock().as_ref().map_or(0, FreeSections::len)
    }
}

impl Default for CollectorContext {
    fn default() -> Self {
        Self::new(CollectorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{Descriptor, ObjectRef};

    #[test]
    fn test_gray_queue_sections_are_recycled() {
        let mut config = CollectorConfig::default();
        config.gray.set_section_capacity(4);
        let ctx = CollectorContext::new(config);

        let mut queue = ctx.new_gray_queue();
        for i in 1..=10 {
            queue.enqueue(ObjectRef::from_addr(i * 8), Descriptor::default());
        }
        while queue.dequeue().is_some() {}
        ctx.dispose_gray_queue(queue);
        assert_eq!(ctx.parked_sections(), 3);

        let mut queue = ctx.new_gray_queue();
        assert_eq!(ctx.parked_sections(), 0);
        for i in 1..=10 {
            queue.enqueue(ObjectRef::from_addr(i * 8), Descriptor::default());
        }
        assert_eq!(ctx.gray_stats().snapshot().sections_allocated, 3);
        while queue.dequeue().is_some() {}
        ctx.dispose_gray_queue(queue);
    }

    #[test]
    fn test_context_is_shareable() {
        fn assert_sync<T: Send + Sync>() {}
        assert_sync::<CollectorContext>();
    }
}
