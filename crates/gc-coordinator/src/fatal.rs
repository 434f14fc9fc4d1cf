//! Unrecoverable allocation failures.
//!
//! Every structure the coordinator allocates for itself (array buckets, gray
//! queue sections, log entry storage, OS memory requested with a description)
//! is load-bearing. When one cannot be obtained the process reports what was
//! requested and exits.

/// Report that `requested` bytes could not be allocated for `what`, then exit.
#[cold]
pub fn out_of_memory(requested: usize, what: &str) -> ! {
    tracing::error!(target: "gc", requested, what, "allocation failed");
    eprintln!("Error: Garbage collector could not allocate {requested} bytes of memory for {what}.");
    std::process::exit(1);
}

/// Allocate a boxed slice of `count` elements built by `init`, or exit.
pub(crate) fn alloc_slice<T>(count: usize, what: &str, init: impl FnMut(usize) -> T) -> Box<[T]> {
    let mut slots = Vec::new();
    if slots.try_reserve_exact(count).is_err() {
        out_of_memory(count.saturating_mul(std::mem::size_of::<T>()), what);
    }
    slots.extend((0..count).map(init));
    slots.into_boxed_slice()
}

/// Make room for `additional` more elements in `vec`, or exit.
pub(crate) fn reserve<T>(vec: &mut Vec<T>, additional: usize, what: &str) {
    if vec.try_reserve(additional).is_err() {
        out_of_memory(additional.saturating_mul(std::mem::size_of::<T>()), what);
    }
}
