//! Collector configuration.
//!
//! Configs are plain values. Out-of-range settings are not rejected; they are
//! corrected during validation and reported as [`ConfigDiagnostic`]s, which
//! are also logged with `tracing::warn!`.

use crate::cement::DEFAULT_CEMENT_THRESHOLD;
use crate::gray::DEFAULT_SECTION_SIZE;
use crate::pinning::PIN_HASH_SIZE;

/// Nursery size assumed when none is configured.
pub const DEFAULT_NURSERY_SIZE: usize = 4 << 20;

/// Minimum allowance as a multiple of the nursery size.
pub const DEFAULT_ALLOWANCE_NURSERY_SIZE_RATIO: f64 = 4.0;

/// Swept empty blocks kept for reuse, as a fraction of the major heap's
/// section count.
pub const DEFAULT_SAVE_TARGET_RATIO: f64 = 0.5;

/// A setting that was changed during validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDiagnostic {
    /// Name of the corrected field.
    pub setting: &'static str,
    /// What was wrong with it.
    pub message: &'static str,
    /// The value used instead.
    pub corrected_to: usize,
}

impl std::fmt::Display for ConfigDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "`{}` {} Setting to {}.",
            self.setting, self.message, self.corrected_to
        )
    }
}

/// Heap limits and allowance tuning for the [`MemoryGovernor`].
///
/// [`MemoryGovernor`]: crate::MemoryGovernor
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GovernorConfig {
    /// Hard heap limit in bytes, nursery included. 0 disables the limit and
    /// limit-driven major collections.
    pub max_heap: usize,
    /// Heap size above which compaction is requested. 0 means unlimited.
    pub soft_heap_limit: usize,
    /// Nursery size in bytes.
    pub nursery_size: usize,
    /// 0.0 keeps [`DEFAULT_ALLOWANCE_NURSERY_SIZE_RATIO`].
    pub allowance_nursery_size_ratio: f64,
    /// 0.0 keeps [`DEFAULT_SAVE_TARGET_RATIO`].
    pub save_target_ratio: f64,
    /// Log every allowance computation.
    pub debug_allowance: bool,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_heap: 0,
            soft_heap_limit: 0,
            nursery_size: DEFAULT_NURSERY_SIZE,
            allowance_nursery_size_ratio: 0.0,
            save_target_ratio: 0.0,
            debug_allowance: false,
        }
    }
}

/// Limits derived from a validated [`GovernorConfig`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HeapLimits {
    /// Whether `max_heap` was set.
    pub enabled: bool,
    /// Usable major heap bytes: `max_heap - nursery_size`.
    pub max_heap_size: usize,
    /// Soft limit in bytes; `usize::MAX` when unset.
    pub soft_heap_limit: usize,
    /// Nursery size in bytes.
    pub nursery_size: usize,
    /// Effective minimum allowance ratio.
    pub allowance_nursery_size_ratio: f64,
    /// Effective share of sections kept as swept empty blocks.
    pub save_target_ratio: f64,
    /// `nursery_size * allowance_nursery_size_ratio`.
    pub min_allowance: usize,
    /// Log every allowance computation.
    pub debug_allowance: bool,
}

impl GovernorConfig {
    /// Defaults with the given limits. Either may be 0.
    #[must_use]
    pub fn new(max_heap: usize, soft_heap_limit: usize) -> Self {
        Self {
            max_heap,
            soft_heap_limit,
            ..Self::default()
        }
    }

    /// Set the nursery size in bytes.
    pub const fn set_nursery_size(&mut self, bytes: usize) {
        self.nursery_size = bytes;
    }

    /// Set the minimum allowance as a multiple of the nursery size.
    pub const fn set_allowance_ratio(&mut self, ratio: f64) {
        self.allowance_nursery_size_ratio = ratio;
    }

    /// Set the share of major sections kept as swept empty blocks.
    pub const fn set_save_target_ratio(&mut self, ratio: f64) {
        self.save_target_ratio = ratio;
    }

    /// Log every allowance computation at `INFO`.
    pub const fn set_debug_allowance(&mut self, enabled: bool) {
        self.debug_allowance = enabled;
    }

    /// Derive the governor's limits, correcting inconsistent settings.
    #[must_use]
    pub fn validate(&self) -> (HeapLimits, Vec<ConfigDiagnostic>) {
        let mut diagnostics = Vec::new();

        let soft_heap_limit = if self.soft_heap_limit == 0 {
            usize::MAX
        } else {
            self.soft_heap_limit
        };
        let allowance_nursery_size_ratio = if self.allowance_nursery_size_ratio > 0.0 {
            self.allowance_nursery_size_ratio
        } else {
            DEFAULT_ALLOWANCE_NURSERY_SIZE_RATIO
        };
        let save_target_ratio = if self.save_target_ratio > 0.0 {
            self.save_target_ratio
        } else {
            DEFAULT_SAVE_TARGET_RATIO
        };

        let (enabled, max_heap_size) = if self.max_heap == 0 {
            (false, usize::MAX)
        } else {
            let mut max_heap = self.max_heap;
            if max_heap < self.soft_heap_limit {
                max_heap = self.soft_heap_limit;
                diagnostics.push(ConfigDiagnostic {
                    setting: "max_heap",
                    message: "must be at least as large as `soft_heap_limit`.",
                    corrected_to: max_heap,
                });
            }
            let floor = self.nursery_size.saturating_mul(4);
            if max_heap < floor {
                max_heap = floor;
                diagnostics.push(ConfigDiagnostic {
                    setting: "max_heap",
                    message: "must be at least 4 times as large as `nursery_size`.",
                    corrected_to: max_heap,
                });
            }
            (true, max_heap - self.nursery_size)
        };

        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let min_allowance = (self.nursery_size as f64 * allowance_nursery_size_ratio) as usize;

        for diagnostic in &diagnostics {
            tracing::warn!(target: "gc", "{diagnostic}");
        }

        let limits = HeapLimits {
            enabled,
            max_heap_size,
            soft_heap_limit,
            nursery_size: self.nursery_size,
            allowance_nursery_size_ratio,
            save_target_ratio,
            min_allowance,
            debug_allowance: self.debug_allowance,
        };
        (limits, diagnostics)
    }
}

/// Pin registry tuning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PinningConfig {
    /// Whether frequently pinned nursery objects get cemented.
    pub cementing: bool,
    /// Whether cemented objects pinned in the last pass survive a cement
    /// reset. Only meaningful with `cementing`.
    pub forced_cementing: bool,
    /// Observations after which an address is cemented.
    pub cement_threshold: u32,
}

impl Default for PinningConfig {
    fn default() -> Self {
        Self {
            cementing: true,
            forced_cementing: true,
            cement_threshold: DEFAULT_CEMENT_THRESHOLD,
        }
    }
}

impl PinningConfig {
    /// Enable or disable cementing.
    pub const fn set_cementing(&mut self, enabled: bool) {
        self.cementing = enabled;
    }

    /// Enable or disable forced cementing.
    pub const fn set_forced_cementing(&mut self, enabled: bool) {
        self.forced_cementing = enabled;
    }

    /// Set the cement threshold. A threshold of 0 is raised to 1.
    pub const fn set_cement_threshold(&mut self, threshold: u32) {
        self.cement_threshold = if threshold == 0 { 1 } else { threshold };
    }

    /// Size of the per-pass dedup filter.
    #[must_use]
    pub const fn hash_filter_size(&self) -> usize {
        PIN_HASH_SIZE
    }
}

/// Gray queue tuning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GrayQueueConfig {
    /// Entries per section.
    pub section_capacity: usize,
    /// Consecutive empty refill attempts before a draining worker gives up.
    pub steal_attempts_before_yield: u32,
}

impl Default for GrayQueueConfig {
    fn default() -> Self {
        Self {
            section_capacity: DEFAULT_SECTION_SIZE,
            steal_attempts_before_yield: 10,
        }
    }
}

impl GrayQueueConfig {
    /// Set the section capacity. A capacity of 0 is raised to 1.
    pub const fn set_section_capacity(&mut self, capacity: usize) {
        self.section_capacity = if capacity == 0 { 1 } else { capacity };
    }

    /// Set how many empty refills a draining worker tolerates.
    pub const fn set_steal_attempts_before_yield(&mut self, attempts: u32) {
        self.steal_attempts_before_yield = attempts;
    }
}

/// Everything a [`CollectorContext`](crate::CollectorContext) is built from.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CollectorConfig {
    /// Memory governor settings.
    pub governor: GovernorConfig,
    /// Pin registry and cementing settings.
    pub pinning: PinningConfig,
    /// Gray queue settings.
    pub gray: GrayQueueConfig,
}
