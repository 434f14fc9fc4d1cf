use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::section::GrayQueueSection;
use crate::metrics::GrayQueueStats;

/// Locked FIFO of whole gray sections, used to hand work between threads.
#[derive(Debug)]
pub struct SectionGrayQueue {
    sections: Mutex<VecDeque<Box<GrayQueueSection>>>,
    stats: Arc<GrayQueueStats>,
}

impl SectionGrayQueue {
    /// An empty queue reporting into `stats`.
    #[must_use]
    pub fn new(stats: Arc<GrayQueueStats>) -> Self {
        Self {
            sections: Mutex::new(VecDeque::new()),
            stats,
        }
    }

    /// Append a section. Empty sections are dropped and counted as freed.
    pub fn enqueue(&self, section: Box<GrayQueueSection>) {
        if section.is_empty() {
            drop(section);
            self.stats.record_sections_freed(1);
            return;
        }
        self.sections.lock().push_back(section);
    }

    /// Take the oldest section.
    #[must_use]
    pub fn dequeue(&self) -> Option<Box<GrayQueueSection>> {
        self.sections.lock().pop_front()
    }

    /// Whether no section is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sections.lock().is_empty()
    }

    /// Sections waiting, not entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sections.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gray::GrayEntry;
    use crate::trace::{Descriptor, ObjectRef};

    fn section_of(addr: usize) -> Box<GrayQueueSection> {
        GrayQueueSection::from_entries(
            4,
            &[GrayEntry::new(ObjectRef::from_addr(addr), Descriptor::default())],
        )
    }

    fn shared_queue() -> SectionGrayQueue {
        SectionGrayQueue::new(Arc::new(GrayQueueStats::new()))
    }

    #[test]
    fn test_fifo_order() {
        let queue = shared_queue();
        queue.enqueue(section_of(0x10));
        queue.enqueue(section_of(0x20));
        queue.enqueue(section_of(0x30));
        assert_eq!(queue.len(), 3);

        let order: Vec<_> = std::iter::from_fn(|| queue.dequeue())
            .map(|s| s.entries()[0].obj.addr())
            .collect();
        assert_eq!(order, vec![0x10, 0x20, 0x30]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_empty_sections_are_dropped() {
        let queue = shared_queue();
        queue.enqueue(GrayQueueSection::new(4));
        assert!(queue.is_empty());
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_dropped_empty_sections_count_as_freed() {
        let stats = Arc::new(GrayQueueStats::new());
        let queue = SectionGrayQueue::new(Arc::clone(&stats));
        queue.enqueue(GrayQueueSection::new(4));
        queue.enqueue(section_of(0x10));
        queue.enqueue(GrayQueueSection::new(4));

        assert_eq!(queue.len(), 1);
        assert_eq!(stats.snapshot().sections_freed, 2);
    }
}
