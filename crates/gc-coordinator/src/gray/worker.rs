//! Drain loops run by marking workers.

use crossbeam::utils::Backoff;

use super::{GrayQueue, SectionGrayQueue, Stealer};
use crate::trace::TraceVisitor;

/// What a [`drain_with_stealing`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Entries handed to the visitor.
    pub visited: usize,
    /// Sections taken from the shared section queue.
    pub sections_taken: usize,
    /// Sections stolen from other workers.
    pub sections_stolen: usize,
}

/// Visit entries until `queue` is empty. Returns the number visited.
pub fn drain<V: TraceVisitor + ?Sized>(queue: &mut GrayQueue, visitor: &mut V) -> usize {
    let mut visited = 0;
    while let Some(entry) = queue.dequeue() {
        visitor.visit(entry, queue);
        visited += 1;
    }
    visited
}

/// Drain `queue`, refilling it from `shared` and then from `victims` when it
/// runs dry.
///
/// Returns once `idle_rounds` consecutive refill attempts found nothing. Work
/// may still exist elsewhere at that point; deciding global termination is up
/// to the caller.
pub fn drain_with_stealing<V: TraceVisitor + ?Sized>(
    queue: &mut GrayQueue,
    shared: Option<&SectionGrayQueue>,
    victims: &[Stealer],
    visitor: &mut V,
    idle_rounds: u32,
) -> DrainOutcome {
    let mut outcome = DrainOutcome::default();
    let backoff = Backoff::new();
    let mut idle = 0;

    loop {
        outcome.visited += drain(queue, visitor);

        if let Some(section) = shared.and_then(SectionGrayQueue::dequeue) {
            queue.enqueue_section(section);
            outcome.sections_taken += 1;
        } else if let Some(section) = victims.iter().find_map(Stealer::steal_section) {
            queue.enqueue_section(section);
            outcome.sections_stolen += 1;
        } else {
            idle += 1;
            if idle >= idle_rounds {
                tracing::trace!(
                    visited = outcome.visited,
                    stolen = outcome.sections_stolen,
                    "gray_drain_idle"
                );
                return outcome;
            }
            backoff.snooze();
            continue;
        }

        idle = 0;
        backoff.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gray::{GrayEntry, GrayQueueSection};
    use crate::metrics::GrayQueueStats;
    use crate::trace::{Descriptor, ObjectRef};
    use std::sync::Arc;

    /// Visits a binary tree laid out implicitly: node `n` has children
    /// `2n` and `2n + 1` while they are below `limit`.
    struct TreeVisitor {
        limit: usize,
        seen: Vec<usize>,
    }

    impl TraceVisitor for TreeVisitor {
        fn descriptor_of(&self, obj: ObjectRef) -> Descriptor {
            Descriptor(obj.addr())
        }

        fn visit(&mut self, entry: GrayEntry, queue: &mut GrayQueue) {
            let n = entry.obj.addr();
            self.seen.push(n);
            for child in [2 * n, 2 * n + 1] {
                if child < self.limit {
                    let obj = ObjectRef::from_addr(child);
                    queue.enqueue(obj, self.descriptor_of(obj));
                }
            }
        }
    }

    fn queue(capacity: usize) -> GrayQueue {
        GrayQueue::new(capacity, Arc::new(GrayQueueStats::new()))
    }

    #[test]
    fn test_drain_visits_transitive_closure() {
        let mut q = queue(8);
        let mut visitor = TreeVisitor {
            limit: 1000,
            seen: Vec::new(),
        };
        q.enqueue(ObjectRef::from_addr(1), Descriptor(1));
        assert_eq!(drain(&mut q, &mut visitor), 999);

        visitor.seen.sort_unstable();
        assert_eq!(visitor.seen, (1..1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_drain_with_stealing_takes_shared_then_victims() {
        let shared = SectionGrayQueue::new(Arc::new(GrayQueueStats::new()));
        shared.enqueue(GrayQueueSection::from_entries(
            4,
            &[GrayEntry::new(ObjectRef::from_addr(500), Descriptor(500))],
        ));

        let mut victim = queue(4);
        for n in 600..612 {
            victim.enqueue(ObjectRef::from_addr(n), Descriptor(n));
        }

        let mut q = queue(4);
        let mut visitor = TreeVisitor {
            limit: 0,
            seen: Vec::new(),
        };
        let outcome =
            drain_with_stealing(&mut q, Some(&shared), &[victim.stealer()], &mut visitor, 2);

        assert_eq!(outcome.sections_taken, 1);
        // Two of the victim's three sections are stealable; its head stays.
        assert_eq!(outcome.sections_stolen, 2);
        assert_eq!(outcome.visited, 9);
        assert_eq!(victim.len(), 4);
    }
}
