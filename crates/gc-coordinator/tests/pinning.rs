//! Pin registry, forced pins and cementing as seen through a collector context.

use gc_coordinator::gray::{GrayEntry, GrayQueue};
use gc_coordinator::{
    CollectorConfig, CollectorContext, Descriptor, Generation, ObjectRef, TraceVisitor,
};

fn context(cement_threshold: u32) -> CollectorContext {
    let mut config = CollectorConfig::default();
    config.pinning.set_cement_threshold(cement_threshold);
    CollectorContext::new(config)
}

/// Records visited addresses and pushes nothing.
#[derive(Default)]
struct Recorder(Vec<usize>);

impl TraceVisitor for Recorder {
    fn descriptor_of(&self, obj: ObjectRef) -> Descriptor {
        Descriptor(obj.addr() >> 4)
    }

    fn visit(&mut self, entry: GrayEntry, _queue: &mut GrayQueue) {
        assert_eq!(entry.desc, self.descriptor_of(entry.obj));
        self.0.push(entry.obj.addr());
    }
}

/// Forwards every visited object into the gray queue.
struct Enqueuer;

impl TraceVisitor for Enqueuer {
    fn descriptor_of(&self, _obj: ObjectRef) -> Descriptor {
        Descriptor::default()
    }

    fn visit(&mut self, entry: GrayEntry, queue: &mut GrayQueue) {
        queue.enqueue(entry.obj, entry.desc);
    }
}

#[test]
fn test_staged_addresses_are_sorted_and_unique() {
    let ctx = context(1000);
    let mut pass = ctx.pins().begin_pass(Generation::Nursery);
    for addr in [0x5000, 0x1000, 0x3000, 0x1000, 0x5000, 0x2000, 0x3000] {
        pass.stage(addr);
    }
    pass.finalize();
    assert_eq!(
        pass.entries().collect::<Vec<_>>(),
        vec![0x1000, 0x2000, 0x3000, 0x5000]
    );

    let section = pass.find_section(0x2000, 0x5000);
    assert_eq!(section.entries(), 1..3);
    assert!(section.has_pins());
    assert!(!pass.find_section(0x6000, 0x7000).has_pins());
    pass.finish();

    assert_eq!(ctx.pins().last_pinned_count(), 4);
}

#[test]
fn test_frozen_forced_pins_survive_until_major_pass_ends() {
    let ctx = context(1000);
    let pins = ctx.pins();

    let mut pass = pins.begin_pass(Generation::Nursery);
    pass.stage(0x8000);
    pass.finalize();
    pass.register_pinned_in_nursery(0x8000);
    pass.finish();

    pins.freeze();
    assert!(pins.is_frozen());

    // A nursery pass during the concurrent major collection re-pins the set
    // and cannot add to it.
    let mut pass = pins.begin_pass(Generation::Nursery);
    pass.stage(0x9000);
    pass.finalize();
    pass.register_pinned_in_nursery(0x9000);
    assert_eq!(pass.entries().collect::<Vec<_>>(), vec![0x8000, 0x9000]);
    pass.finish();

    let mut pass = pins.begin_pass(Generation::Old);
    pass.finalize();
    assert_eq!(pass.entries().collect::<Vec<_>>(), vec![0x8000]);
    let mut recorder = Recorder::default();
    let mut queue = ctx.new_gray_queue();
    pass.scan_forced(&mut recorder, &mut queue);
    assert_eq!(recorder.0, vec![0x8000]);
    pass.finish();

    assert!(!pins.is_frozen());
    let mut pass = pins.begin_pass(Generation::Nursery);
    pass.finalize();
    assert_eq!(pass.pinned_count(), 0);
}

#[test]
#[should_panic(expected = "forced pins must be frozen")]
fn test_scan_forced_requires_frozen_set() {
    let ctx = context(1000);
    let pass = ctx.pins().begin_pass(Generation::Old);
    let mut queue = ctx.new_gray_queue();
    pass.scan_forced(&mut Recorder::default(), &mut queue);
}

#[test]
fn test_repeatedly_pinned_object_gets_cemented() {
    let ctx = context(3);
    let pins = ctx.pins();

    assert!(!pins.observe(0x4000));
    assert!(!pins.observe(0x4000));
    assert!(!pins.is_cemented(0x4000));
    // The observation reaching the threshold does not report it yet.
    assert!(!pins.observe(0x4000));
    assert!(pins.is_cemented(0x4000));
    assert!(pins.observe(0x4000));

    let mut pass = pins.begin_pass(Generation::Nursery);
    pass.pin_cemented();
    pass.finalize();
    assert_eq!(pass.entries().collect::<Vec<_>>(), vec![0x4000]);
    pass.finish();

    pins.cement_reset();
    assert!(!pins.is_cemented(0x4000));
}

#[test]
fn test_forced_cement_survives_one_reset_and_is_scanned() {
    let ctx = context(2);
    let pins = ctx.pins();
    for addr in [0x4000, 0x6000] {
        pins.observe(addr);
        pins.observe(addr);
        assert!(pins.is_cemented(addr));
    }
    pins.observe(0x7000);

    let mut pass = pins.begin_pass(Generation::Nursery);
    pass.stage(0x4000);
    pass.finalize();
    pass.finish();

    pins.force_pinned_if_cemented();
    assert!(pins.is_forced(0x4000));
    assert!(!pins.is_forced(0x6000));

    let mut queue = ctx.new_gray_queue();
    pins.cement_scan_forced(&mut Enqueuer, &mut queue);
    assert_eq!(queue.dequeue().map(|e| e.obj.addr()), Some(0x4000));
    assert!(queue.is_empty());

    pins.cement_clear_below_threshold();
    assert!(!pins.observe(0x7000));
    assert!(!pins.is_cemented(0x7000));

    pins.cement_reset();
    assert!(pins.is_cemented(0x4000));
    assert!(!pins.is_forced(0x4000));
    assert!(!pins.is_cemented(0x6000));

    pins.cement_reset();
    assert!(!pins.is_cemented(0x4000));
}

#[test]
fn test_disabled_cementing_never_cements() {
    let mut config = CollectorConfig::default();
    config.pinning.set_cementing(false);
    config.pinning.set_cement_threshold(1);
    let ctx = CollectorContext::new(config);

    for _ in 0..10 {
        assert!(!ctx.pins().observe(0x4000));
    }
    assert!(!ctx.pins().is_cemented(0x4000));
}
