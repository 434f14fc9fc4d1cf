//! Gray queue throughput.
//!
//! Measures the owner's enqueue/dequeue path, which every marked object goes
//! through, and the cost of stealing sections from a full queue.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use gc_coordinator::gray::{drain, GrayEntry, GrayQueue, DEFAULT_SECTION_SIZE};
use gc_coordinator::{Descriptor, GrayQueueStats, ObjectRef, TraceVisitor};
use std::hint::black_box;

const OBJECTS: usize = 100_000;

fn new_queue() -> GrayQueue {
    GrayQueue::new(DEFAULT_SECTION_SIZE, Arc::new(GrayQueueStats::new()))
}

fn fill(queue: &mut GrayQueue, objects: usize) {
    for n in 1..=objects {
        queue.enqueue(ObjectRef::from_addr(n * 16), Descriptor(n));
    }
}

/// Binary tree over `1..limit`, discovered one level at a time.
struct Tree {
    limit: usize,
}

impl TraceVisitor for Tree {
    fn descriptor_of(&self, obj: ObjectRef) -> Descriptor {
        Descriptor(obj.addr())
    }

    fn visit(&mut self, entry: GrayEntry, queue: &mut GrayQueue) {
        let n = entry.obj.addr();
        for child in [2 * n, 2 * n + 1] {
            if child < self.limit {
                let obj = ObjectRef::from_addr(child);
                queue.enqueue(obj, self.descriptor_of(obj));
            }
        }
    }
}

fn benchmark_enqueue_dequeue(c: &mut Criterion) {
    let mut group = c.benchmark_group("gray_queue");

    // Sections are recycled through the queue's free list after the first
    // iteration.
    let mut queue = new_queue();
    group.bench_function("enqueue_dequeue_100k", |b| {
        b.iter(|| {
            fill(&mut queue, OBJECTS);
            while let Some(entry) = queue.dequeue() {
                black_box(entry);
            }
        });
    });

    group.bench_function("drain_tree_100k", |b| {
        b.iter(|| {
            queue.enqueue(ObjectRef::from_addr(1), Descriptor(1));
            black_box(drain(&mut queue, &mut Tree { limit: OBJECTS }))
        });
    });

    group.finish();
}

fn benchmark_steal(c: &mut Criterion) {
    let mut group = c.benchmark_group("gray_queue_steal");
    group.sample_size(20);

    group.bench_function("steal_all_sections_100k", |b| {
        b.iter_batched(
            || {
                let mut queue = new_queue();
                fill(&mut queue, OBJECTS);
                queue
            },
            |queue| {
                let stealer = queue.stealer();
                let mut stolen = 0;
                while let Some(section) = stealer.steal_section() {
                    stolen += section.len();
                }
                black_box(stolen);
                queue
            },
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

criterion_group!(benches, benchmark_enqueue_dequeue, benchmark_steal);
criterion_main!(benches);
