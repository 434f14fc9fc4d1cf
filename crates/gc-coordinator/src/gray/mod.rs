//! Gray queues: the trace worklist.
//!
//! Entries are grouped into fixed-capacity sections so that synchronization
//! happens once per section rather than once per object:
//!
//! - [`GrayQueue`] is owned by one marking thread, which pushes and pops at
//!   the head. Any number of [`Stealer`] handles detach whole sections from
//!   the tail.
//! - [`SectionGrayQueue`] is a locked FIFO of whole sections used to hand work
//!   between threads.
//! - [`drain_with_stealing`] runs a visitor over a local queue and refills it
//!   from the other queues when it runs dry.

mod section;
mod section_queue;
mod worker;
mod worklist;

pub use section::{GrayQueueSection, SectionState, DEFAULT_SECTION_SIZE};
pub use section_queue::SectionGrayQueue;
pub use worker::{drain, drain_with_stealing, DrainOutcome};
pub use worklist::{FreeSections, GrayQueue, Stealer, GRAY_QUEUE_LENGTH_LIMIT};

use crate::trace::{Descriptor, ObjectRef};

/// An object waiting to be scanned, with the descriptor to scan it by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GrayEntry {
    /// The gray object.
    pub obj: ObjectRef,
    /// How to scan it.
    pub desc: Descriptor,
}

impl GrayEntry {
    /// Pair an object with its descriptor.
    #[inline]
    #[must_use]
    pub const fn new(obj: ObjectRef, desc: Descriptor) -> Self {
        Self { obj, desc }
    }
}
