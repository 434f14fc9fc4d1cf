//! Pinned-address registry.
//!
//! During a collection pass, conservatively discovered addresses are staged
//! into a pin queue through a small lossy dedup filter, then sorted so the
//! collector can look up the pinned addresses inside any address range.
//!
//! Two sets survive across passes:
//!
//! - the forced-pin set, nursery objects pinned by the most recent nursery
//!   pass. [`PinRegistry::freeze`] locks it in while a concurrent major
//!   collection runs; every pass then re-pins it until that major pass ends.
//! - the cement table (see [`crate::cement`]).
//!
//! Lock order is pin state, then cement table.

use std::ops::Range;

use parking_lot::{Mutex, MutexGuard};

use crate::cement::CementTable;
use crate::config::PinningConfig;
use crate::fatal;
use crate::gray::{GrayEntry, GrayQueue};
use crate::heap::Generation;
use crate::pointer_queue::PointerQueue;
use crate::trace::{ObjectRef, TraceVisitor};

/// Slots in the per-pass dedup filter.
pub const PIN_HASH_SIZE: usize = 1024;

const PIN_HASH_MULTIPLIER: usize = 1_737_350_767;

#[inline]
const fn filter_slot(addr: usize) -> usize {
    addr.wrapping_mul(PIN_HASH_MULTIPLIER) & (PIN_HASH_SIZE - 1)
}

/// An address range of the heap and the part of the pin queue covering it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PinnedSection {
    /// First address of the range.
    pub start: usize,
    /// One past the last address.
    pub end: usize,
    /// Pin queue index of the first entry in the range.
    pub first_entry: usize,
    /// Pin queue index one past the last entry in the range.
    pub last_entry: usize,
}

impl PinnedSection {
    /// Pin queue indices inside the range.
    #[must_use]
    pub const fn entries(&self) -> Range<usize> {
        self.first_entry..self.last_entry
    }

    /// Whether anything in the range is pinned.
    #[must_use]
    pub const fn has_pins(&self) -> bool {
        self.first_entry != self.last_entry
    }
}

struct PinState {
    pin_queue: PointerQueue,
    forced_pin_queue: PointerQueue,
    hash_filter: Box<[usize]>,
    last_num_pinned: usize,
    forced_pin: bool,
}

/// Pin queue, forced-pin set and cement table for one collector.
pub struct PinRegistry {
    state: Mutex<PinState>,
    cement: Mutex<CementTable>,
}

impl PinRegistry {
    /// An empty registry with a cement table built from `config`.
    #[must_use]
    pub fn new(config: &PinningConfig) -> Self {
        Self {
            state: Mutex::new(PinState {
                pin_queue: PointerQueue::new("pin queue"),
                forced_pin_queue: PointerQueue::new("forced pin queue"),
                hash_filter: fatal::alloc_slice(PIN_HASH_SIZE, "pin hash filter", |_| 0),
                last_num_pinned: 0,
                forced_pin: false,
            }),
            cement: Mutex::new(CementTable::new(
                config.cementing,
                config.forced_cementing,
                config.cement_threshold,
            )),
        }
    }

    /// Start a pinning pass.
    ///
    /// The pass holds the registry lock until it is dropped; calling
    /// [`freeze`](Self::freeze) or another `begin_pass` from the same thread
    /// meanwhile deadlocks.
    pub fn begin_pass(&self, generation: Generation) -> PinPass<'_> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.hash_filter.fill(0);
        state.pin_queue.clear();
        if state.forced_pin {
            state.pin_queue.add_queue(&state.forced_pin_queue);
        } else {
            state.forced_pin_queue.clear();
        }
        tracing::trace!(target: "gc", generation = generation.as_str(), "pin_pass_start");
        PinPass {
            state: guard,
            cement: &self.cement,
            generation,
        }
    }

    /// Keep the current forced-pin set pinned until the end of the next
    /// major pass.
    pub fn freeze(&self) {
        self.state.lock().forced_pin = true;
    }

    /// Whether [`freeze`](Self::freeze) is in effect.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.state.lock().forced_pin
    }

    /// Number of addresses pinned by the last finished pass.
    #[must_use]
    pub fn last_pinned_count(&self) -> usize {
        self.state.lock().last_num_pinned
    }

    /// Count one pin of a nursery address. Returns `true` if it was already
    /// cemented.
    pub fn observe(&self, addr: usize) -> bool {
        self.cement.lock().lookup_or_register(addr)
    }

    /// Whether `addr` has reached the cement threshold.
    #[must_use]
    pub fn is_cemented(&self, addr: usize) -> bool {
        self.cement.lock().lookup(addr)
    }

    /// Whether `addr` is cemented and will survive the next reset.
    #[must_use]
    pub fn is_forced(&self, addr: usize) -> bool {
        self.cement.lock().is_forced(addr)
    }

    /// Mark cemented addresses pinned by the last pass as forced, so they
    /// stay cemented across the next reset.
    pub fn force_pinned_if_cemented(&self) {
        let state = self.state.lock();
        let mut cement = self.cement.lock();
        if !cement.forced_enabled() {
            return;
        }
        for addr in state.pin_queue.iter().take(state.last_num_pinned) {
            cement.force_if_cemented(addr);
        }
    }

    /// Uncement everything not forced; forced entries lose the flag.
    pub fn cement_reset(&self) {
        self.cement.lock().reset();
    }

    /// Forget addresses that never reached the threshold.
    pub fn cement_clear_below_threshold(&self) {
        self.cement.lock().clear_below_threshold();
    }

    /// Visit every forced cemented object.
    pub fn cement_scan_forced<V: TraceVisitor + ?Sized>(&self, visitor: &mut V, queue: &mut GrayQueue) {
        let forced: Vec<usize> = {
            let cement = self.cement.lock();
            if !cement.forced_enabled() {
                return;
            }
            cement.forced().collect()
        };
        for addr in forced {
            visit(visitor, queue, addr);
        }
    }

    /// Log the addresses pinned by the last pass.
    pub fn dump(&self) {
        let state = self.state.lock();
        for addr in state.pin_queue.iter().take(state.last_num_pinned) {
            tracing::debug!(target: "gc", addr = format_args!("{addr:#x}"), "pinned");
        }
    }
}

impl std::fmt::Debug for PinRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PinRegistry")
            .field("pinned", &state.pin_queue.len())
            .field("forced", &state.forced_pin_queue.len())
            .field("frozen", &state.forced_pin)
            .finish_non_exhaustive()
    }
}

fn visit<V: TraceVisitor + ?Sized>(visitor: &mut V, queue: &mut GrayQueue, addr: usize) {
    let obj = ObjectRef::from_addr(addr);
    let desc = visitor.descriptor_of(obj);
    visitor.visit(GrayEntry::new(obj, desc), queue);
}

/// One pinning pass. Finishes when dropped.
pub struct PinPass<'a> {
    state: MutexGuard<'a, PinState>,
    cement: &'a Mutex<CementTable>,
    generation: Generation,
}

impl PinPass<'_> {
    /// Generation being collected.
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Stage a potential pin. Repeats are usually filtered out; the rest are
    /// removed by [`finalize`](Self::finalize).
    #[inline]
    pub fn stage(&mut self, addr: usize) {
        let slot = filter_slot(addr);
        if self.state.hash_filter[slot] == addr {
            return;
        }
        self.state.hash_filter[slot] = addr;
        self.state.pin_queue.add(addr);
    }

    /// Sort the pin queue and drop duplicates.
    pub fn finalize(&mut self) {
        self.state.pin_queue.sort_uniq();
    }

    /// Pin queue indices of the addresses in `start..end`. Needs a finalized
    /// queue.
    #[must_use]
    pub fn find_range(&self, start: usize, end: usize) -> Range<usize> {
        let queue = &self.state.pin_queue;
        let first = queue.search(start);
        let last = queue.search(end);
        assert!(
            last == queue.len() || queue.get(last).is_some_and(|addr| addr >= end),
            "pin queue search gone awry"
        );
        first..last
    }

    /// [`find_range`](Self::find_range) for a heap section.
    #[must_use]
    pub fn find_section(&self, start: usize, end: usize) -> PinnedSection {
        let range = self.find_range(start, end);
        tracing::trace!(
            target: "gc",
            start = format_args!("{start:#x}"),
            end = format_args!("{end:#x}"),
            pins = range.len(),
            "pin_section"
        );
        PinnedSection {
            start,
            end,
            first_entry: range.start,
            last_entry: range.end,
        }
    }

    /// A section covering the whole pin queue.
    #[must_use]
    pub fn setup_section(&self, start: usize, end: usize) -> PinnedSection {
        PinnedSection {
            start,
            end,
            first_entry: 0,
            last_entry: self.state.pin_queue.len(),
        }
    }

    /// Shrink the pin queue to the entries of `section`.
    ///
    /// # Panics
    ///
    /// Panics unless `section` starts at the head of the queue.
    pub fn trim_queue_to(&mut self, section: &PinnedSection) {
        assert_eq!(
            section.first_entry, 0,
            "pin queue trimming assumes the section owns the whole queue"
        );
        self.state.pin_queue.truncate(section.last_entry);
    }

    /// Null out the entries between `section.last_entry` and `max_pin_slot`
    /// that still point into `section`. These are addresses the section
    /// discarded after compacting its own entries.
    pub fn clear_discarded_entries(&mut self, section: &PinnedSection, max_pin_slot: usize) {
        let queue = &mut self.state.pin_queue;
        let end = max_pin_slot.min(queue.len());
        for index in section.last_entry..end {
            match queue.get(index) {
                Some(addr) if (section.start..=section.end).contains(&addr) => queue.set(index, 0),
                _ => break,
            }
        }
    }

    /// Entry at `index`.
    #[must_use]
    pub fn entry(&self, index: usize) -> Option<usize> {
        self.state.pin_queue.get(index)
    }

    /// Replace entry `index`, typically with 0 to discard it.
    pub fn set_entry(&mut self, index: usize, addr: usize) {
        self.state.pin_queue.set(index, addr);
    }

    /// Pin queue entries in order. Sorted and unique after
    /// [`finalize`](Self::finalize).
    pub fn entries(&self) -> impl Iterator<Item = usize> + '_ {
        self.state.pin_queue.iter()
    }

    /// Entries in the pin queue.
    #[must_use]
    pub fn pinned_count(&self) -> usize {
        self.state.pin_queue.len()
    }

    /// Record a nursery object pinned by this pass in the forced-pin set.
    /// Ignored while the set is frozen.
    pub fn register_pinned_in_nursery(&mut self, addr: usize) {
        if !self.state.forced_pin {
            self.state.forced_pin_queue.add(addr);
        }
    }

    /// Stage every address with a cement count.
    pub fn pin_cemented(&mut self) {
        let addrs: Vec<usize> = {
            let cement = self.cement.lock();
            cement
                .counted()
                .inspect(|entry| {
                    debug_assert!(
                        entry.count >= cement.threshold(),
                        "cement table holds an entry below the threshold"
                    );
                })
                .map(|entry| entry.addr)
                .collect()
        };
        for addr in addrs {
            self.stage(addr);
        }
    }

    /// Visit every object of the frozen forced-pin set.
    ///
    /// # Panics
    ///
    /// Panics if the set is not frozen.
    pub fn scan_forced<V: TraceVisitor + ?Sized>(&self, visitor: &mut V, queue: &mut GrayQueue) {
        assert!(
            self.state.forced_pin,
            "forced pins must be frozen before they are scanned"
        );
        for addr in self.state.forced_pin_queue.iter() {
            visit(visitor, queue, addr);
        }
    }

    /// End the pass.
    pub fn finish(self) {}
}

impl Drop for PinPass<'_> {
    fn drop(&mut self) {
        let state = &mut *self.state;
        state.last_num_pinned = state.pin_queue.len();
        if self.generation == Generation::Old && state.forced_pin {
            state.forced_pin_queue.clear();
            state.forced_pin = false;
        }
        tracing::trace!(
            target: "gc",
            generation = self.generation.as_str(),
            pinned = state.last_num_pinned,
            "pin_pass_finish"
        );
    }
}
