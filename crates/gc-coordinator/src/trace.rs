//! The tracing surface the coordinator hands work to.
//!
//! Objects are opaque addresses and descriptors are opaque words; their
//! meaning belongs to the object model. The coordinator never scans an object
//! itself, it only calls a [`TraceVisitor`] supplied by the collection driver.

use crate::gray::{GrayEntry, GrayQueue};

/// Address of a heap object awaiting tracing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ObjectRef(usize);

impl ObjectRef {
    /// The null reference. Never enqueued.
    pub const NULL: Self = Self(0);

    /// Wrap a raw address.
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    /// The raw address.
    #[inline]
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0
    }

    /// Whether this is [`NULL`](Self::NULL).
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Layout descriptor telling the visitor how to scan an object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Descriptor(pub usize);

/// Scans objects popped from a gray queue.
///
/// Implementations push every newly discovered gray object back onto
/// `queue`. The order in which entries are visited is unspecified.
pub trait TraceVisitor {
    /// Descriptor for `obj`, read from its header.
    fn descriptor_of(&self, obj: ObjectRef) -> Descriptor;

    /// Scan one object.
    fn visit(&mut self, entry: GrayEntry, queue: &mut GrayQueue);
}

impl<V: TraceVisitor + ?Sized> TraceVisitor for &mut V {
    fn descriptor_of(&self, obj: ObjectRef) -> Descriptor {
        (**self).descriptor_of(obj)
    }

    fn visit(&mut self, entry: GrayEntry, queue: &mut GrayQueue) {
        (**self).visit(entry, queue);
    }
}
