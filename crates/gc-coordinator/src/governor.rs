//! Heap sizing and major collection triggering.
//!
//! After every major collection the governor derives an allowance: how far
//! the heap may grow before the next major collection is worthwhile. The
//! allowance is a fraction of the surviving heap, shrunk by the growth seen
//! while a concurrent collection was marking and capped by the soft limit.
//!
//! It also accounts for OS memory mapped by the collector and for heap space
//! reserved against the configured hard limit, and buffers collection log
//! entries until the world has restarted.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sys_alloc::{Region, RegionOptions};
use tracing::Level;

use crate::config::{ConfigDiagnostic, GovernorConfig, HeapLimits};
use crate::fatal;
use crate::heap::{Generation, MajorHeap};
use crate::log::{span_collection_end, CollectionId, LogEntry};
use crate::metrics::GovernorStats;

/// The heap may grow by this fraction of its surviving size between major
/// collections.
pub const ALLOWANCE_HEAP_SIZE_RATIO: f64 = 0.33;

/// Inputs of [`compute_allowance`], all in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowanceInputs {
    /// Major heap bytes that survived the last sweep.
    pub survived_major: usize,
    /// LOS usage right after the last major collection.
    pub los_usage: usize,
    /// Heap size when the last major collection started.
    pub start_heap_size: usize,
    /// Heap size right before the last major sweep.
    pub pre_sweep_heap_size: usize,
    /// Allowance is capped so the trigger stays at or below this.
    pub soft_heap_limit: usize,
    /// Smallest allowance ever granted.
    pub min_allowance: usize,
}

/// Result of [`compute_allowance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowanceDecision {
    /// Surviving heap size, major plus LOS.
    pub new_heap_size: usize,
    /// Growth permitted before the next major collection.
    pub allowance: usize,
    /// How much concurrent growth took off the allowance.
    pub decrease: usize,
    /// Heap size above which the next major collection triggers.
    pub trigger_size: usize,
}

/// Derive the next major collection trigger.
///
/// Without concurrent growth (`pre_sweep_heap_size <= start_heap_size`) the
/// trigger never shrinks as the surviving heap grows. With growth it can:
/// the decrease scales with the survival rate, so a larger survivor set may
/// end up with a lower trigger.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn compute_allowance(inputs: &AllowanceInputs) -> AllowanceDecision {
    let new_heap_size = inputs.survived_major.saturating_add(inputs.los_usage);

    let allowance_target = (new_heap_size as f64 * ALLOWANCE_HEAP_SIZE_RATIO) as usize;
    let mut allowance = allowance_target.max(inputs.min_allowance);

    // Growth while a concurrent collection was marking, scaled by survival.
    let growth = inputs
        .pre_sweep_heap_size
        .saturating_sub(inputs.start_heap_size);
    let mut decrease = if inputs.pre_sweep_heap_size == 0 {
        0
    } else {
        (growth as f64
            * (new_heap_size as f64 / inputs.pre_sweep_heap_size as f64)
            * (ALLOWANCE_HEAP_SIZE_RATIO + 1.0)) as usize
    };
    decrease = decrease.min(allowance);
    allowance -= decrease;

    let soft = inputs.soft_heap_limit;
    if new_heap_size.saturating_add(allowance) > soft {
        allowance = if new_heap_size > soft {
            inputs.min_allowance
        } else {
            (soft - new_heap_size).max(inputs.min_allowance)
        };
    }

    AllowanceDecision {
        new_heap_size,
        allowance,
        decrease,
        trigger_size: new_heap_size.saturating_add(allowance),
    }
}

#[derive(Debug, Default)]
struct Timers {
    last_minor_start: Option<Instant>,
    last_major_start: Option<Instant>,
}

fn elapsed_since(start: Option<Instant>) -> Duration {
    start.map(|s| s.elapsed()).unwrap_or_default()
}

/// Decides when a major collection is due and accounts for heap memory.
///
/// Counters are updated with atomic adds from any thread. Derived thresholds
/// are written only by the thread running collections.
pub struct MemoryGovernor {
    limits: HeapLimits,
    diagnostics: Vec<ConfigDiagnostic>,

    total_promoted: AtomicUsize,
    total_allocated_major: AtomicUsize,
    allocated_heap: AtomicUsize,
    total_alloc: AtomicUsize,
    total_alloc_max: AtomicUsize,

    trigger_size: AtomicUsize,
    need_calculate_allowance: AtomicBool,
    start_heap_size: AtomicUsize,
    pre_sweep_heap_size: AtomicUsize,
    last_collection_los_usage: AtomicUsize,
    last_used_slots_size: AtomicUsize,
    promoted_at_minor_start: AtomicUsize,
    allocated_major_at_major_end: AtomicUsize,

    timers: Mutex<Timers>,
    log_entries: Mutex<Vec<LogEntry>>,
    /// Id of the latest collection started; 0 before the first.
    collection_id: AtomicU64,
}

impl MemoryGovernor {
    /// Build a governor from `config`. Corrected settings are logged and
    /// kept in [`diagnostics`](Self::diagnostics).
    #[must_use]
    pub fn new(config: &GovernorConfig) -> Self {
        let (limits, diagnostics) = config.validate();
        Self {
            limits,
            diagnostics,
            total_promoted: AtomicUsize::new(0),
            total_allocated_major: AtomicUsize::new(0),
            allocated_heap: AtomicUsize::new(0),
            total_alloc: AtomicUsize::new(0),
            total_alloc_max: AtomicUsize::new(0),
            trigger_size: AtomicUsize::new(limits.min_allowance),
            need_calculate_allowance: AtomicBool::new(false),
            start_heap_size: AtomicUsize::new(0),
            pre_sweep_heap_size: AtomicUsize::new(0),
            last_collection_los_usage: AtomicUsize::new(0),
            last_used_slots_size: AtomicUsize::new(0),
            promoted_at_minor_start: AtomicUsize::new(0),
            allocated_major_at_major_end: AtomicUsize::new(0),
            timers: Mutex::new(Timers::default()),
            log_entries: Mutex::new(Vec::new()),
            collection_id: AtomicU64::new(0),
        }
    }

    /// Validated limits.
    #[must_use]
    pub const fn limits(&self) -> &HeapLimits {
        &self.limits
    }

    /// Settings corrected during validation.
    #[must_use]
    pub fn diagnostics(&self) -> &[ConfigDiagnostic] {
        &self.diagnostics
    }

    /// Share of the major heap's sections kept as swept empty blocks when
    /// the allowance is recomputed.
    #[must_use]
    pub const fn save_target_ratio(&self) -> f64 {
        self.limits.save_target_ratio
    }

    /// Heap size above which the next major collection triggers.
    #[must_use]
    pub fn trigger_size(&self) -> usize {
        self.trigger_size.load(Ordering::Acquire)
    }

    /// Count bytes promoted from the nursery.
    pub fn add_promoted(&self, bytes: usize) {
        self.total_promoted.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count bytes allocated directly in the major heap.
    pub fn add_allocated_major(&self, bytes: usize) {
        self.total_allocated_major.fetch_add(bytes, Ordering::Relaxed);
    }

    fn heap_size(heap: &impl MajorHeap) -> usize {
        heap.major_heap_size().saturating_add(heap.los_usage())
    }

    fn logging_enabled() -> bool {
        tracing::enabled!(target: "gc", Level::INFO)
    }

    fn add_log_entry(&self, entry: LogEntry) {
        let mut entries = self.log_entries.lock();
        fatal::reserve(&mut *entries, 1, "collection log entry");
        entries.push(entry);
    }

    /// Whether the heap has outgrown the soft limit, in which case major
    /// collections should compact.
    #[must_use]
    pub fn need_compacting_collection(&self, heap: &impl MajorHeap) -> bool {
        Self::heap_size(heap) > self.limits.soft_heap_limit
    }

    /// Whether a major collection should run before `space_needed` more bytes
    /// are allocated.
    pub fn need_major_collection(&self, space_needed: usize, heap: &impl MajorHeap) -> bool {
        if !self.limits.enabled {
            return false;
        }

        if heap.concurrent_collection_in_progress() {
            let heap_size = Self::heap_size(heap);
            if heap_size <= self.trigger_size() {
                return false;
            }
            // Past the trigger, finish the running collection once growth
            // would have pushed the allowance below zero.
            let start = self.start_heap_size.load(Ordering::Relaxed);
            #[allow(
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss,
                clippy::cast_precision_loss
            )]
            let limit = (start as f64 * ALLOWANCE_HEAP_SIZE_RATIO) as usize;
            return heap_size.saturating_sub(start) > limit;
        }

        if !heap.have_swept() {
            return false;
        }
        if space_needed > self.available_free_space() {
            return true;
        }

        self.calculate_allowance(heap);
        Self::heap_size(heap) > self.trigger_size()
    }

    fn calculate_allowance(&self, heap: &impl MajorHeap) {
        if !self.need_calculate_allowance.load(Ordering::Relaxed) {
            return;
        }
        assert!(heap.have_swept(), "allowance needs a swept heap");

        let decision = compute_allowance(&AllowanceInputs {
            survived_major: heap.bytes_survived_last_sweep(),
            los_usage: self.last_collection_los_usage.load(Ordering::Relaxed),
            start_heap_size: self.start_heap_size.load(Ordering::Relaxed),
            pre_sweep_heap_size: self.pre_sweep_heap_size.load(Ordering::Relaxed),
            soft_heap_limit: self.limits.soft_heap_limit,
            min_allowance: self.limits.min_allowance,
        });

        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let keep = (heap.major_section_count() as f64 * self.limits.save_target_ratio) as usize;
        heap.free_swept_blocks(keep);

        self.trigger_size.store(decision.trigger_size, Ordering::Release);
        self.need_calculate_allowance.store(false, Ordering::Relaxed);

        if self.limits.debug_allowance {
            tracing::info!(
                target: "gc",
                surviving = decision.new_heap_size,
                los = self.last_collection_los_usage.load(Ordering::Relaxed),
                allowance = decision.allowance,
                trigger = decision.trigger_size,
                "allowance"
            );
        }
    }

    /// Record the start of a nursery collection.
    pub fn minor_collection_start(&self) {
        self.promoted_at_minor_start
            .store(self.total_promoted.load(Ordering::Relaxed), Ordering::Relaxed);
        self.timers.lock().last_minor_start = Some(Instant::now());
    }

    /// Record the end of a nursery collection and buffer its log line.
    pub fn minor_collection_end(&self, reason: &'static str, heap: &impl MajorHeap) {
        if !Self::logging_enabled() {
            return;
        }
        let time = elapsed_since(self.timers.lock().last_minor_start);
        let promoted = self
            .total_promoted
            .load(Ordering::Relaxed)
            .saturating_sub(self.promoted_at_minor_start.load(Ordering::Relaxed));
        self.add_log_entry(LogEntry::Nursery {
            reason,
            time,
            promoted,
            major_size: heap.major_heap_size(),
            major_in_use: self.major_in_use(self.last_used_slots_size.load(Ordering::Relaxed)),
            los_size: heap.los_usage_total(),
            los_in_use: heap.los_usage(),
        });
    }

    fn major_in_use(&self, used_slots_size: usize) -> usize {
        (used_slots_size + self.total_allocated_major.load(Ordering::Relaxed))
            .saturating_sub(self.allocated_major_at_major_end.load(Ordering::Relaxed))
    }

    /// Record the heap size before the sweep of a major collection.
    pub fn major_pre_sweep(&self, heap: &impl MajorHeap) {
        let size = if heap.concurrent_collection_in_progress() {
            Self::heap_size(heap)
        } else {
            // Nothing grew during a serial collection.
            self.start_heap_size.load(Ordering::Relaxed)
        };
        self.pre_sweep_heap_size.store(size, Ordering::Relaxed);
    }

    /// Record the end of a major sweep that left `used_slots_size` bytes of
    /// live slots.
    pub fn major_post_sweep(&self, used_slots_size: usize, heap: &impl MajorHeap) {
        if Self::logging_enabled() {
            self.add_log_entry(LogEntry::MajorSweepFinish {
                major_size: heap.major_heap_size(),
                major_in_use: self.major_in_use(used_slots_size),
            });
        }
        self.last_used_slots_size
            .store(used_slots_size, Ordering::Relaxed);
    }

    /// Record the start of a major collection. The allowance is recomputed
    /// once its sweep has finished.
    pub fn major_collection_start(&self, concurrent: bool, reason: &'static str, heap: &impl MajorHeap) {
        self.need_calculate_allowance.store(true, Ordering::Relaxed);
        let start = Self::heap_size(heap);
        self.start_heap_size.store(start, Ordering::Relaxed);
        tracing::debug!(target: "gc", concurrent, reason, start, "major_start");

        if concurrent && Self::logging_enabled() {
            self.add_log_entry(LogEntry::MajorConcurrentStart { reason });
        }
        self.timers.lock().last_major_start = Some(Instant::now());
    }

    /// Record the end of a major collection. A `forced` collection finishes
    /// sweeping right away so the next trigger is known immediately.
    pub fn major_collection_end(
        &self,
        forced: bool,
        concurrent: bool,
        reason: &'static str,
        heap: &impl MajorHeap,
    ) {
        if Self::logging_enabled() {
            let time = elapsed_since(self.timers.lock().last_major_start);
            let los_size = heap.los_usage_total();
            let los_in_use = heap.los_usage();
            self.add_log_entry(if concurrent {
                LogEntry::MajorConcurrentFinish {
                    reason,
                    time,
                    los_size,
                    los_in_use,
                }
            } else {
                LogEntry::MajorSerial {
                    reason,
                    time,
                    los_size,
                    los_in_use,
                }
            });
        }

        self.last_collection_los_usage
            .store(heap.los_usage(), Ordering::Relaxed);
        self.allocated_major_at_major_end.store(
            self.total_allocated_major.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );

        if forced {
            heap.finish_sweeping();
            self.calculate_allowance(heap);
        }
    }

    /// Number the collection that is starting.
    pub fn collection_start(&self, generation: Generation) -> CollectionId {
        let id = CollectionId(self.collection_id.fetch_add(1, Ordering::Relaxed) + 1);
        tracing::trace!(target: "gc", generation = generation.as_str(), id = id.0, "collection_start");
        id
    }

    /// Id of the latest collection passed to
    /// [`collection_start`](Self::collection_start), if any.
    #[must_use]
    pub fn current_collection(&self) -> Option<CollectionId> {
        match self.collection_id.load(Ordering::Relaxed) {
            0 => None,
            id => Some(CollectionId(id)),
        }
    }

    /// Write out buffered log entries. Call after the world has restarted.
    /// Returns the number of entries written.
    pub fn collection_end(&self, generation: Generation, stw_time: Duration) -> usize {
        if !Self::logging_enabled() {
            return 0;
        }
        let entries = std::mem::take(&mut *self.log_entries.lock());
        let id = self.current_collection().unwrap_or(CollectionId(0));
        let span = span_collection_end(generation, id);
        let _entered = span.enter();
        for entry in &entries {
            tracing::info!(target: "gc", "{}", entry.line(stw_time, generation));
        }
        entries.len()
    }

    /// Entries waiting for the next [`collection_end`](Self::collection_end).
    #[must_use]
    pub fn pending_log_entries(&self) -> usize {
        self.log_entries.lock().len()
    }

    fn record_os_alloc(&self, size: usize) {
        let total = self.total_alloc.fetch_add(size, Ordering::Relaxed) + size;
        self.total_alloc_max.fetch_max(total, Ordering::Relaxed);
    }

    fn map(&self, options: RegionOptions, size: usize, what: Option<&str>) -> io::Result<Region> {
        match options.reserve() {
            Ok(region) => {
                // Page-rounded, matching `free_os_memory`.
                self.record_os_alloc(region.len());
                Ok(region)
            }
            Err(err) => match what {
                Some(what) => fatal::out_of_memory(size, what),
                None => Err(err),
            },
        }
    }

    /// Map `size` bytes from the OS, accessible if `activate`.
    ///
    /// Failure is fatal when `what` describes the mapping, and an error
    /// otherwise.
    pub fn alloc_os_memory(&self, size: usize, activate: bool, what: Option<&str>) -> io::Result<Region> {
        self.map(RegionOptions::new().len(size).commit(activate), size, what)
    }

    /// Like [`alloc_os_memory`](Self::alloc_os_memory), aligned to
    /// `alignment`, which must be a power of two.
    pub fn alloc_os_memory_aligned(
        &self,
        size: usize,
        alignment: usize,
        activate: bool,
        what: Option<&str>,
    ) -> io::Result<Region> {
        assert!(alignment.is_power_of_two(), "alignment must be a power of two");
        self.map(
            RegionOptions::new().len(size).align(alignment).commit(activate),
            size,
            what,
        )
    }

    /// Return a mapping to the OS.
    pub fn free_os_memory(&self, region: Region) {
        self.total_alloc.fetch_sub(region.len(), Ordering::Relaxed);
        drop(region);
    }

    /// Bytes currently mapped through the governor.
    #[must_use]
    pub fn total_heap_bytes_allocated(&self) -> usize {
        self.total_alloc.load(Ordering::Relaxed)
    }

    /// Bytes that can still be reserved under the hard limit.
    #[must_use]
    pub fn available_free_space(&self) -> usize {
        let allocated = self.allocated_heap.load(Ordering::Relaxed);
        self.limits.max_heap_size - allocated.min(self.limits.max_heap_size)
    }

    /// Reserve `size` bytes against the heap limit.
    pub fn try_reserve_heap_space(&self, size: usize) -> bool {
        let max = self.limits.max_heap_size;
        self.allocated_heap
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |allocated| {
                let available = max - allocated.min(max);
                (available >= size).then(|| allocated + size)
            })
            .is_ok()
    }

    /// Give back a reservation made with
    /// [`try_reserve_heap_space`](Self::try_reserve_heap_space).
    pub fn release_heap_space(&self, size: usize) {
        self.allocated_heap.fetch_sub(size, Ordering::AcqRel);
    }

    /// Bytes currently reserved.
    #[must_use]
    pub fn allocated_heap(&self) -> usize {
        self.allocated_heap.load(Ordering::Relaxed)
    }

    /// Snapshot of the accounting counters.
    #[must_use]
    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            total_os_alloc: self.total_alloc.load(Ordering::Relaxed),
            max_os_alloc: self.total_alloc_max.load(Ordering::Relaxed),
            allocated_heap: self.allocated_heap(),
            trigger_size: self.trigger_size(),
            promoted: self.total_promoted.load(Ordering::Relaxed),
            allocated_major: self.total_allocated_major.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for MemoryGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGovernor")
            .field("limits", &self.limits)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
