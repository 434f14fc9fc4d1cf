//! Append-only index array whose slots never move.
//!
//! Storage is a fixed table of bucket pointers. Bucket `k` holds
//! `MIN_BUCKET_SIZE << k` slots and is allocated the first time an index
//! falls into it:
//!
//! ```text
//!           |-------|-- MIN_BUCKET_SIZE
//!    [0] -> xxxxxxxx
//!    [1] -> xxxxxxxxxxxxxxxx
//!    [2] -> xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx
//!    ...
//! ```
//!
//! Because buckets are never reallocated, a reference to a slot obtained for
//! any index below the observed capacity stays valid while the array keeps
//! growing. Appends are serialized by a writer lock; readers are lock-free.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::fatal;

/// Log2 of the size of bucket 0.
pub const MIN_BUCKET_BITS: u32 = 5;

/// Number of slots in bucket 0.
pub const MIN_BUCKET_SIZE: usize = 1 << MIN_BUCKET_BITS;

/// Number of bucket pointers. Enough for any index representable in 32 bits.
pub const MAX_BUCKETS: usize = 32;

/// Number of slots in `bucket`.
#[inline]
#[must_use]
pub const fn bucket_size(bucket: usize) -> usize {
    1 << (bucket + MIN_BUCKET_BITS as usize)
}

/// Split an index into `(bucket, offset)`.
///
/// Computes `floor(log2(index + MIN_BUCKET_SIZE)) - MIN_BUCKET_BITS` with a
/// single leading-zeros count.
#[inline]
#[must_use]
pub const fn bucketize(index: usize) -> (usize, usize) {
    let biased = index + MIN_BUCKET_SIZE;
    let bucket = (usize::BITS - 1 - biased.leading_zeros() - MIN_BUCKET_BITS) as usize;
    (bucket, biased - bucket_size(bucket))
}

/// Inverse of [`bucketize`].
#[inline]
#[must_use]
pub const fn index_of(bucket: usize, offset: usize) -> usize {
    bucket_size(bucket) - MIN_BUCKET_SIZE + offset
}

/// Growable array of pointer-sized slots.
pub struct IndexArray {
    buckets: [AtomicPtr<AtomicUsize>; MAX_BUCKETS],
    /// Sum of the sizes of all allocated buckets.
    capacity: AtomicUsize,
    /// One past the highest appended index.
    len: AtomicUsize,
    writer: Mutex<()>,
    what: &'static str,
}

impl IndexArray {
    /// Create an empty array. `what` names the array in allocation failures.
    #[must_use]
    pub fn new(what: &'static str) -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            capacity: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
            writer: Mutex::new(()),
            what,
        }
    }

    /// Number of slots that have been appended.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Whether nothing has been appended.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots backed by allocated buckets.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Allocate the next bucket. Caller holds the writer lock or `&mut self`.
    fn grow(&self) {
        let old_capacity = self.capacity.load(Ordering::Relaxed);
        let (new_bucket, _) = bucketize(old_capacity);
        assert!(new_bucket < MAX_BUCKETS, "index array {} is full", self.what);

        let growth = bucket_size(new_bucket);
        let slots = fatal::alloc_slice(growth, self.what, |_| AtomicUsize::new(0));
        let bucket = Box::into_raw(slots).cast::<AtomicUsize>();

        // The bucket pointer must be visible before any index into it is.
        self.buckets[new_bucket].store(bucket, Ordering::Release);
        self.capacity.store(old_capacity + growth, Ordering::Release);
    }

    /// Append `value` and return its index.
    pub fn append(&self, value: usize) -> usize {
        let _guard = self.writer.lock();
        let index = self.len.load(Ordering::Relaxed);
        if index >= self.capacity.load(Ordering::Relaxed) {
            self.grow();
        }
        self.slot(index).store(value, Ordering::Relaxed);
        self.len.store(index + 1, Ordering::Release);
        index
    }

    /// Append through exclusive access, without taking the writer lock.
    pub fn push(&mut self, value: usize) -> usize {
        let index = *self.len.get_mut();
        if index >= *self.capacity.get_mut() {
            self.grow();
        }
        self.slot(index).store(value, Ordering::Relaxed);
        *self.len.get_mut() = index + 1;
        index
    }

    /// The slot for `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [`capacity`](Self::capacity).
    #[inline]
    #[must_use]
    pub fn slot(&self, index: usize) -> &AtomicUsize {
        self.try_slot(index)
            .unwrap_or_else(|| panic!("index {index} beyond capacity of {}", self.what))
    }

    /// The slot for `index`, or `None` if no bucket covers it yet.
    #[inline]
    #[must_use]
    pub fn try_slot(&self, index: usize) -> Option<&AtomicUsize> {
        if index >= self.capacity() {
            return None;
        }
        let (bucket, offset) = bucketize(index);
        let base = self.buckets[bucket].load(Ordering::Acquire);
        debug_assert!(!base.is_null(), "bucket {bucket} published after capacity");
        // SAFETY: capacity was read with Acquire after the bucket pointer was
        // stored with Release, so `base` points at `bucket_size(bucket)`
        // slots that live until `self` is dropped.
        Some(unsafe { &*base.add(offset) })
    }

    /// Value at `index`, if it has been appended.
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> Option<usize> {
        if index >= self.len() {
            return None;
        }
        Some(self.slot(index).load(Ordering::Relaxed))
    }

    /// Overwrite the value at an appended index.
    ///
    /// # Panics
    ///
    /// Panics if `index` has not been appended.
    pub fn set(&self, index: usize, value: usize) {
        assert!(index < self.len(), "set beyond the end of {}", self.what);
        self.slot(index).store(value, Ordering::Relaxed);
    }

    /// Iterate the appended values in index order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let len = self.len();
        (0..len).map(move |i| self.slot(i).load(Ordering::Relaxed))
    }

    /// Forget every value past `len`. Buckets stay allocated.
    pub fn truncate(&self, len: usize) {
        let _guard = self.writer.lock();
        if len < self.len.load(Ordering::Relaxed) {
            self.len.store(len, Ordering::Release);
        }
    }

    /// Forget all values. Buckets stay allocated for reuse.
    pub fn clear(&self) {
        self.truncate(0);
    }

    /// Compact the array by removing every zero slot, preserving order.
    pub fn remove_nulls(&self) {
        let _guard = self.writer.lock();
        let len = self.len.load(Ordering::Relaxed);
        let mut kept = 0;
        for i in 0..len {
            let value = self.slot(i).load(Ordering::Relaxed);
            if value != 0 {
                self.slot(kept).store(value, Ordering::Relaxed);
                kept += 1;
            }
        }
        self.len.store(kept, Ordering::Release);
    }

    /// Linear search for `value`.
    #[must_use]
    pub fn find(&self, value: usize) -> Option<usize> {
        self.iter().position(|v| v == value)
    }
}

impl Drop for IndexArray {
    fn drop(&mut self) {
        for (bucket, slot) in self.buckets.iter_mut().enumerate() {
            let base = *slot.get_mut();
            if base.is_null() {
                break;
            }
            // SAFETY: `base` came from `Box::into_raw` on a slice of exactly
            // `bucket_size(bucket)` slots in `grow`.
            unsafe {
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                    base,
                    bucket_size(bucket),
                )));
            }
        }
    }
}

impl std::fmt::Debug for IndexArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexArray")
            .field("what", &self.what)
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_bucketize_boundaries() {
        assert_eq!(bucketize(0), (0, 0));
        assert_eq!(bucketize(MIN_BUCKET_SIZE - 1), (0, MIN_BUCKET_SIZE - 1));
        assert_eq!(bucketize(MIN_BUCKET_SIZE), (1, 0));
        assert_eq!(bucketize(3 * MIN_BUCKET_SIZE - 1), (1, 2 * MIN_BUCKET_SIZE - 1));
        assert_eq!(bucketize(3 * MIN_BUCKET_SIZE), (2, 0));
    }

    #[test]
    fn test_bucketize_round_trip() {
        for index in 0..100_000 {
            let (bucket, offset) = bucketize(index);
            assert!(offset < bucket_size(bucket));
            assert_eq!(index_of(bucket, offset), index);
        }
    }

    #[test]
    fn test_append_grows_by_whole_buckets() {
        let array = IndexArray::new("test");
        assert_eq!(array.capacity(), 0);

        assert_eq!(array.append(1), 0);
        assert_eq!(array.capacity(), MIN_BUCKET_SIZE);

        for i in 1..=MIN_BUCKET_SIZE {
            array.append(i + 1);
        }
        assert_eq!(array.len(), MIN_BUCKET_SIZE + 1);
        assert_eq!(array.capacity(), MIN_BUCKET_SIZE + bucket_size(1));
    }

    #[test]
    fn test_push_and_append_share_indices() {
        let mut array = IndexArray::new("test");
        for i in 0..MIN_BUCKET_SIZE {
            assert_eq!(array.push(i + 1), i);
        }
        assert_eq!(array.capacity(), MIN_BUCKET_SIZE);

        // Crosses into bucket 1 through the exclusive path.
        assert_eq!(array.push(100), MIN_BUCKET_SIZE);
        assert_eq!(array.capacity(), MIN_BUCKET_SIZE + bucket_size(1));
        assert_eq!(array.append(200), MIN_BUCKET_SIZE + 1);

        assert_eq!(array.len(), MIN_BUCKET_SIZE + 2);
        assert_eq!(array.get(MIN_BUCKET_SIZE), Some(100));
        assert_eq!(array.get(MIN_BUCKET_SIZE + 1), Some(200));
        assert_eq!(array.iter().take(3).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_slot_addresses_survive_growth() {
        let array = IndexArray::new("test");
        let mut addresses = Vec::new();
        for i in 0..5000 {
            let index = array.append(i);
            addresses.push(std::ptr::from_ref(array.slot(index)));
        }
        for (i, &addr) in addresses.iter().enumerate() {
            assert_eq!(std::ptr::from_ref(array.slot(i)), addr);
            assert_eq!(array.get(i), Some(i));
        }
    }

    #[test]
    fn test_get_beyond_len_is_none() {
        let array = IndexArray::new("test");
        array.append(7);
        assert_eq!(array.get(0), Some(7));
        assert_eq!(array.get(1), None);
        assert!(array.try_slot(MIN_BUCKET_SIZE).is_none());
    }

    #[test]
    #[should_panic(expected = "beyond capacity")]
    fn test_slot_beyond_capacity_panics() {
        let array = IndexArray::new("test");
        let _ = array.slot(0);
    }

    #[test]
    fn test_remove_nulls_keeps_order() {
        let array = IndexArray::new("test");
        for v in [0, 3, 0, 0, 5, 9, 0] {
            array.append(v);
        }
        array.remove_nulls();
        assert_eq!(array.iter().collect::<Vec<_>>(), vec![3, 5, 9]);
    }

    #[test]
    fn test_find_and_clear() {
        let array = IndexArray::new("test");
        for v in 10..20 {
            array.append(v);
        }
        assert_eq!(array.find(15), Some(5));
        assert_eq!(array.find(99), None);

        let capacity = array.capacity();
        array.clear();
        assert!(array.is_empty());
        assert_eq!(array.capacity(), capacity);
        assert_eq!(array.append(42), 0);
    }

    #[test]
    fn test_concurrent_reader_sees_published_values() {
        let array = Arc::new(IndexArray::new("test"));
        let reader = {
            let array = Arc::clone(&array);
            thread::spawn(move || {
                let mut seen = 0;
                while seen < 10_000 {
                    let len = array.len();
                    for i in seen..len {
                        assert_eq!(array.get(i), Some(i + 1));
                    }
                    seen = len;
                }
            })
        };
        for i in 0..10_000 {
            array.append(i + 1);
        }
        reader.join().unwrap();
    }
}
