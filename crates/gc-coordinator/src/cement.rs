//! Cementing: keep nursery objects that keep getting pinned in place.
//!
//! A small direct-mapped table counts how often each nursery address is
//! pinned. Once an address reaches the threshold it is cemented and stays
//! pinned in every following nursery collection until the next reset. Hash
//! collisions simply lose the newcomer.

/// Log2 of the number of cement table slots.
pub const CEMENT_HASH_SHIFT: u32 = 6;

/// Number of cement table slots.
pub const CEMENT_HASH_SIZE: usize = 1 << CEMENT_HASH_SHIFT;

/// Observations after which an address is cemented.
pub const DEFAULT_CEMENT_THRESHOLD: u32 = 1000;

#[inline]
const fn slot_for(addr: usize) -> usize {
    let hv = addr >> 3;
    (hv ^ (hv >> CEMENT_HASH_SHIFT)) & (CEMENT_HASH_SIZE - 1)
}

/// One cement table slot. An `addr` of 0 marks a free slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CementEntry {
    /// Address counted in this slot.
    pub addr: usize,
    /// Pins observed since the last reset, saturating at the threshold.
    pub count: u32,
    /// Survives the next reset.
    pub forced: bool,
}

/// The cement table.
#[derive(Debug, Clone)]
pub struct CementTable {
    entries: [CementEntry; CEMENT_HASH_SIZE],
    threshold: u32,
    enabled: bool,
    forced_enabled: bool,
}

impl CementTable {
    /// `forced_enabled` is ignored when cementing itself is disabled.
    #[must_use]
    pub fn new(enabled: bool, forced_enabled: bool, threshold: u32) -> Self {
        Self {
            entries: [CementEntry::default(); CEMENT_HASH_SIZE],
            threshold: threshold.max(1),
            enabled,
            forced_enabled: enabled && forced_enabled,
        }
    }

    /// Whether addresses are counted at all.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    /// Whether forced entries survive a reset.
    #[must_use]
    pub const fn forced_enabled(&self) -> bool {
        self.forced_enabled
    }

    /// Pins needed to cement an address.
    #[must_use]
    pub const fn threshold(&self) -> u32 {
        self.threshold
    }

    fn entry_for(&self, addr: usize) -> Option<&CementEntry> {
        let entry = &self.entries[slot_for(addr)];
        (entry.addr != 0 && entry.addr == addr).then_some(entry)
    }

    /// Count one more pin of `addr`.
    ///
    /// Returns `true` only if `addr` was already cemented before this call.
    /// The observation that reaches the threshold returns `false`.
    pub fn lookup_or_register(&mut self, addr: usize) -> bool {
        if !self.enabled || addr == 0 {
            return false;
        }
        let threshold = self.threshold;
        let entry = &mut self.entries[slot_for(addr)];
        if entry.addr == 0 {
            debug_assert_eq!(entry.count, 0, "cement table inconsistent");
            entry.addr = addr;
        } else if entry.addr != addr {
            return false;
        }

        if entry.count >= threshold {
            return true;
        }
        entry.count += 1;
        if entry.count == threshold {
            tracing::debug!(target: "gc", addr, "cement");
        }
        false
    }

    /// Whether `addr` is cemented.
    #[must_use]
    pub fn lookup(&self, addr: usize) -> bool {
        self.enabled
            && self
                .entry_for(addr)
                .is_some_and(|entry| entry.count >= self.threshold)
    }

    /// Whether `addr` survives the next reset.
    #[must_use]
    pub fn is_forced(&self, addr: usize) -> bool {
        self.forced_enabled && self.entry_for(addr).is_some_and(|entry| entry.forced)
    }

    /// Mark `addr` forced if it is cemented.
    pub fn force_if_cemented(&mut self, addr: usize) {
        let threshold = self.threshold;
        let entry = &mut self.entries[slot_for(addr)];
        if entry.addr != 0 && entry.addr == addr && entry.count >= threshold {
            entry.forced = true;
        }
    }

    /// Forget every entry except forced ones, which lose the flag instead.
    pub fn reset(&mut self) {
        for entry in &mut self.entries {
            if entry.forced {
                entry.forced = false;
            } else {
                *entry = CementEntry::default();
            }
        }
        tracing::trace!(target: "gc", "cement_reset");
    }

    /// Forget every entry that has not reached the threshold.
    pub fn clear_below_threshold(&mut self) {
        let threshold = self.threshold;
        for entry in &mut self.entries {
            if entry.count < threshold {
                *entry = CementEntry::default();
            }
        }
    }

    /// Addresses with a non-zero count.
    pub fn counted(&self) -> impl Iterator<Item = &CementEntry> + '_ {
        self.entries.iter().filter(|entry| entry.count != 0)
    }

    /// Addresses marked forced.
    pub fn forced(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries
            .iter()
            .filter(|entry| entry.forced)
            .map(|entry| entry.addr)
    }
}

impl Default for CementTable {
    fn default() -> Self {
        Self::new(true, true, DEFAULT_CEMENT_THRESHOLD)
    }
}
