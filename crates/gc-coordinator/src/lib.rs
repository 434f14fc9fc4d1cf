//! Coordination layer for a generational, partly concurrent tracing collector.
//!
//! `gc-coordinator` does not scan or move objects itself. It provides the
//! shared machinery a collector's marking and pinning phases are built on:
//!
//! - **Gray queues** ([`gray`]): sectioned trace worklists owned by one
//!   marking thread, with whole sections stolen by idle threads.
//! - **Pinning** ([`PinRegistry`]): a per-pass queue of addresses that must
//!   not move, deduplicated and sorted for range lookups, plus a forced-pin
//!   set that can be frozen across a concurrent major collection.
//! - **Cementing** ([`cement`]): nursery objects pinned over and over stay
//!   pinned until the next reset.
//! - **Governor** ([`MemoryGovernor`]): decides when a major collection is
//!   due, accounts for heap and OS memory, and buffers collection logs.
//! - **Index arrays** ([`IndexArray`]): growable arrays whose slots never
//!   move, backing the pin and pointer queues.
//!
//! # Example
//!
//! ```
//! use gc_coordinator::gray::{drain, GrayEntry, GrayQueue};
//! use gc_coordinator::{CollectorContext, Descriptor, Generation, ObjectRef, TraceVisitor};
//!
//! struct CountingVisitor(usize);
//!
//! impl TraceVisitor for CountingVisitor {
//!     fn descriptor_of(&self, _obj: ObjectRef) -> Descriptor {
//!         Descriptor::default()
//!     }
//!
//!     fn visit(&mut self, _entry: GrayEntry, _queue: &mut GrayQueue) {
//!         self.0 += 1;
//!     }
//! }
//!
//! let ctx = CollectorContext::default();
//!
//! let mut pass = ctx.pins().begin_pass(Generation::Nursery);
//! for addr in [0x1000, 0x2000, 0x1000, 0x3000] {
//!     pass.stage(addr);
//! }
//! pass.finalize();
//! assert_eq!(pass.pinned_count(), 3);
//! pass.finish();
//!
//! let mut queue = ctx.new_gray_queue();
//! queue.enqueue(ObjectRef::from_addr(0x1000), Descriptor(1));
//! let mut visitor = CountingVisitor(0);
//! assert_eq!(drain(&mut queue, &mut visitor), 1);
//! ctx.dispose_gray_queue(queue);
//! ```
//!
//! # Logging
//!
//! Everything is reported through [`tracing`] on target `gc`. Collection log
//! lines (`GC_MINOR`, `GC_MAJOR`, ...) are buffered only while an `INFO`
//! subscriber for that target is installed, and written by
//! [`MemoryGovernor::collection_end`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod array_list;
pub mod cement;
mod config;
mod context;
pub mod fatal;
mod governor;
pub mod gray;
mod heap;
pub mod log;
mod metrics;
mod pinning;
mod pointer_queue;
mod trace;

pub use array_list::{bucket_size, bucketize, index_of, IndexArray, MAX_BUCKETS, MIN_BUCKET_SIZE};
pub use config::{
    CollectorConfig, ConfigDiagnostic, GovernorConfig, GrayQueueConfig, HeapLimits,
    PinningConfig, DEFAULT_ALLOWANCE_NURSERY_SIZE_RATIO, DEFAULT_NURSERY_SIZE,
    DEFAULT_SAVE_TARGET_RATIO,
};
pub use context::CollectorContext;
pub use governor::{
    compute_allowance, AllowanceDecision, AllowanceInputs, MemoryGovernor,
    ALLOWANCE_HEAP_SIZE_RATIO,
};
pub use heap::{Generation, MajorHeap};
pub use metrics::{GovernorStats, GrayQueueStats, GrayQueueStatsSnapshot};
pub use pinning::{PinPass, PinRegistry, PinnedSection, PIN_HASH_SIZE};
pub use pointer_queue::PointerQueue;
pub use trace::{Descriptor, ObjectRef, TraceVisitor};
