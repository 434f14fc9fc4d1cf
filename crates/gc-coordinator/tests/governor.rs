//! Major collection triggering over a simulated heap.

use std::cell::Cell;

use gc_coordinator::{
    compute_allowance, AllowanceInputs, GovernorConfig, MajorHeap, MemoryGovernor,
};

const MIB: usize = 1 << 20;

/// A major heap whose sweeps complete instantly.
#[derive(Default)]
struct SimHeap {
    major: Cell<usize>,
    los: Cell<usize>,
    live: Cell<usize>,
    concurrent: Cell<bool>,
    kept_sections: Cell<Option<usize>>,
}

impl SimHeap {
    fn with_live(bytes: usize) -> Self {
        let heap = Self::default();
        heap.major.set(bytes);
        heap.live.set(bytes);
        heap
    }

    fn allocate(&self, bytes: usize) {
        self.major.set(self.major.get() + bytes);
    }
}

impl MajorHeap for SimHeap {
    fn major_heap_size(&self) -> usize {
        self.major.get()
    }

    fn major_section_count(&self) -> usize {
        self.major.get() / MIB
    }

    fn los_usage(&self) -> usize {
        self.los.get()
    }

    fn los_usage_total(&self) -> usize {
        self.los.get()
    }

    fn have_swept(&self) -> bool {
        true
    }

    fn bytes_survived_last_sweep(&self) -> usize {
        self.live.get()
    }

    fn finish_sweeping(&self) {}

    fn free_swept_blocks(&self, keep_sections: usize) {
        self.kept_sections.set(Some(keep_sections));
    }

    fn concurrent_collection_in_progress(&self) -> bool {
        self.concurrent.get()
    }
}

fn governor(max_heap: usize) -> MemoryGovernor {
    let mut config = GovernorConfig::new(max_heap, 0);
    config.set_nursery_size(4 * MIB);
    MemoryGovernor::new(&config)
}

fn serial_major(governor: &MemoryGovernor, heap: &SimHeap) {
    governor.major_collection_start(false, "test", heap);
    governor.major_pre_sweep(heap);
    governor.major_post_sweep(heap.live.get(), heap);
    governor.major_collection_end(false, false, "test", heap);
}

#[test]
fn test_heap_growth_past_allowance_triggers_major() {
    let governor = governor(1024 * MIB);
    let heap = SimHeap::with_live(100 * MIB);
    serial_major(&governor, &heap);

    assert!(!governor.need_major_collection(0, &heap));
    let trigger = governor.trigger_size();
    assert_eq!(trigger, 100 * MIB + (100.0 * MIB as f64 * 0.33) as usize);
    // Half of the 100 sections by default.
    assert_eq!(heap.kept_sections.get(), Some(50));

    heap.allocate(trigger - 100 * MIB);
    assert!(!governor.need_major_collection(0, &heap));
    heap.allocate(1);
    assert!(governor.need_major_collection(0, &heap));
}

#[test]
fn test_save_target_ratio_sets_kept_swept_blocks() {
    let mut config = GovernorConfig::new(1024 * MIB, 0);
    config.set_nursery_size(4 * MIB);
    config.set_save_target_ratio(0.25);
    let governor = MemoryGovernor::new(&config);
    let heap = SimHeap::with_live(100 * MIB);
    serial_major(&governor, &heap);

    assert_eq!(heap.kept_sections.get(), None);
    assert!(!governor.need_major_collection(0, &heap));
    assert_eq!(heap.kept_sections.get(), Some(25));
    assert!((governor.save_target_ratio() - 0.25).abs() < f64::EPSILON);
}

#[test]
fn test_small_heap_uses_nursery_based_minimum() {
    let governor = governor(1024 * MIB);
    let heap = SimHeap::with_live(MIB);
    serial_major(&governor, &heap);

    assert!(!governor.need_major_collection(0, &heap));
    // Four nurseries of 4 MiB.
    assert_eq!(governor.trigger_size(), 17 * MIB);
}

/// Holds only without growth during marking; see the concurrent case below.
#[test]
fn test_allowance_grows_with_surviving_heap() {
    let mut last = 0;
    for survived in (0..=2048).step_by(16).map(|m| m * MIB) {
        let decision = compute_allowance(&AllowanceInputs {
            survived_major: survived,
            los_usage: 0,
            start_heap_size: survived,
            pre_sweep_heap_size: survived,
            soft_heap_limit: usize::MAX,
            min_allowance: 16 * MIB,
        });
        assert!(decision.trigger_size >= last);
        assert!(decision.allowance >= 16 * MIB);
        last = decision.trigger_size;
    }
}

#[test]
fn test_concurrent_growth_can_lower_trigger_as_survival_rises() {
    let decide = |survived: usize| {
        compute_allowance(&AllowanceInputs {
            survived_major: survived,
            los_usage: 0,
            start_heap_size: 20 * MIB,
            pre_sweep_heap_size: 100 * MIB,
            soft_heap_limit: usize::MAX,
            min_allowance: 50 * MIB,
        })
    };

    // 80 MiB of growth: the decrease is 10.64 MiB at 10 MiB surviving and
    // 21.28 MiB at 20 MiB surviving.
    let low = decide(10 * MIB);
    let high = decide(20 * MIB);
    assert!(high.decrease > low.decrease);
    assert!(high.trigger_size < low.trigger_size);
    assert_eq!(low.trigger_size / (MIB / 100), 4936);
    assert_eq!(high.trigger_size / (MIB / 100), 4872);
}

#[test]
fn test_unlimited_heap_never_requests_major() {
    let governor = governor(0);
    let heap = SimHeap::with_live(100 * MIB);
    serial_major(&governor, &heap);

    heap.allocate(10_000 * MIB);
    assert!(!governor.need_major_collection(usize::MAX, &heap));
    assert!(governor.try_reserve_heap_space(1 << 40));
}

#[test]
fn test_request_beyond_free_space_triggers_major() {
    let governor = governor(64 * MIB);
    let heap = SimHeap::with_live(MIB);
    serial_major(&governor, &heap);

    assert_eq!(governor.available_free_space(), 60 * MIB);
    assert!(governor.try_reserve_heap_space(58 * MIB));
    assert!(!governor.try_reserve_heap_space(4 * MIB));
    assert!(governor.need_major_collection(4 * MIB, &heap));

    governor.release_heap_space(58 * MIB);
    assert_eq!(governor.allocated_heap(), 0);
    assert!(!governor.need_major_collection(4 * MIB, &heap));
}

#[test]
fn test_concurrent_collection_is_finished_once_growth_exceeds_ratio() {
    let governor = governor(1024 * MIB);
    let heap = SimHeap::with_live(100 * MIB);
    serial_major(&governor, &heap);
    assert!(!governor.need_major_collection(0, &heap));

    heap.allocate(40 * MIB);
    heap.concurrent.set(true);
    governor.major_collection_start(true, "test", &heap);

    // 140 MiB at start; finishing is forced only past 140 + 46.2 MiB.
    heap.allocate(40 * MIB);
    assert!(!governor.need_major_collection(0, &heap));
    heap.allocate(10 * MIB);
    assert!(governor.need_major_collection(0, &heap));
}

#[test]
fn test_config_corrections_are_reported() {
    let mut config = GovernorConfig::new(8 * MIB, 32 * MIB);
    config.set_nursery_size(4 * MIB);
    let governor = MemoryGovernor::new(&config);

    let settings: Vec<_> = governor.diagnostics().iter().map(|d| d.corrected_to).collect();
    assert_eq!(settings, vec![32 * MIB]);
    assert_eq!(governor.limits().max_heap_size, 28 * MIB);
}

#[test]
fn test_os_memory_is_accounted() {
    let governor = governor(0);
    let region = governor
        .alloc_os_memory(64 * 1024, true, None)
        .expect("mapping 64 KiB");
    assert_eq!(governor.total_heap_bytes_allocated(), 64 * 1024);

    let aligned = governor
        .alloc_os_memory_aligned(64 * 1024, 64 * 1024, false, Some("aligned test block"))
        .expect("mapping aligned block");
    assert_eq!(aligned.ptr() as usize % (64 * 1024), 0);
    assert_eq!(governor.stats().max_os_alloc, 128 * 1024);

    governor.free_os_memory(region);
    governor.free_os_memory(aligned);
    assert_eq!(governor.total_heap_bytes_allocated(), 0);
    assert_eq!(governor.stats().max_os_alloc, 128 * 1024);
}
