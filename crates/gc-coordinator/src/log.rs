//! Collection log entries and GC-level tracing spans.
//!
//! Entries are recorded while the world is stopped and only written out,
//! through `tracing::info!` on target `gc`, once the collection has ended.

use std::fmt;
use std::time::Duration;

use tracing::Span;

use crate::heap::Generation;

/// Identifies one collection in log output. Numbered from 1 per governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectionId(pub u64);

/// Span wrapping the flush of a collection's log entries.
#[must_use]
pub fn span_collection_end(generation: Generation, id: CollectionId) -> Span {
    tracing::info_span!(target: "gc", "gc_pass", generation = generation.as_str(), id = id.0)
}

/// One buffered collection event.
///
/// Sizes are in bytes and printed in KiB. `reason` is the trigger given by
/// the collection driver and `time` the wall time of the collection.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum LogEntry {
    /// A nursery collection: `GC_MINOR`.
    Nursery {
        reason: &'static str,
        time: Duration,
        /// Bytes promoted by this collection.
        promoted: usize,
        major_size: usize,
        major_in_use: usize,
        los_size: usize,
        los_in_use: usize,
    },
    /// A stop-the-world major collection: `GC_MAJOR`.
    MajorSerial {
        reason: &'static str,
        time: Duration,
        los_size: usize,
        los_in_use: usize,
    },
    /// A concurrent major collection began: `GC_MAJOR_CONCURRENT_START`.
    MajorConcurrentStart { reason: &'static str },
    /// A concurrent major collection finished: `GC_MAJOR_CONCURRENT_FINISH`.
    MajorConcurrentFinish {
        reason: &'static str,
        time: Duration,
        los_size: usize,
        los_in_use: usize,
    },
    /// A major sweep completed: `GC_MAJOR_SWEEP`.
    MajorSweepFinish {
        major_size: usize,
        major_in_use: usize,
    },
}

impl LogEntry {
    /// The entry as printed at the end of a `generation` collection whose
    /// world stop took `stw`.
    #[must_use]
    pub const fn line(&self, stw: Duration, generation: Generation) -> LogLine<'_> {
        LogLine {
            entry: self,
            stw: Some(stw),
            generation,
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let line = LogLine {
            entry: self,
            stw: None,
            generation: Generation::Old,
        };
        fmt::Display::fmt(&line, f)
    }
}

/// Display adapter produced by [`LogEntry::line`].
#[derive(Debug, Clone, Copy)]
pub struct LogLine<'a> {
    entry: &'a LogEntry,
    stw: Option<Duration>,
    generation: Generation,
}

struct Millis(Duration);

impl fmt::Display for Millis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}ms", self.0.as_secs_f64() * 1000.0)
    }
}

struct Kib(usize);

impl fmt::Display for Kib {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}K", self.0 / 1024)
    }
}

impl fmt::Display for LogLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stw = |show: bool| {
            self.stw
                .filter(|_| show)
                .map(|stw| format!("stw {} ", Millis(stw)))
                .unwrap_or_default()
        };

        match *self.entry {
            LogEntry::Nursery {
                reason,
                time,
                promoted,
                major_size,
                major_in_use,
                los_size,
                los_in_use,
            } => write!(
                f,
                "GC_MINOR: ({reason}) time {}, {}promoted {} major size: {} in use: {} los size: {} in use: {}",
                Millis(time),
                stw(self.generation == Generation::Nursery),
                Kib(promoted),
                Kib(major_size),
                Kib(major_in_use),
                Kib(los_size),
                Kib(los_in_use),
            ),
            LogEntry::MajorSerial {
                reason,
                time,
                los_size,
                los_in_use,
            } => write!(
                f,
                "GC_MAJOR: ({reason}) time {}, {}los size: {} in use: {}",
                Millis(time),
                stw(true),
                Kib(los_size),
                Kib(los_in_use),
            ),
            LogEntry::MajorConcurrentStart { reason } => {
                write!(f, "GC_MAJOR_CONCURRENT_START: ({reason})")
            }
            LogEntry::MajorConcurrentFinish {
                reason,
                time,
                los_size,
                los_in_use,
            } => write!(
                f,
                "GC_MAJOR_CONCURRENT_FINISH: ({reason}) time {}, {}los size: {} in use: {}",
                Millis(time),
                stw(true),
                Kib(los_size),
                Kib(los_in_use),
            ),
            LogEntry::MajorSweepFinish {
                major_size,
                major_in_use,
            } => write!(
                f,
                "GC_MAJOR_SWEEP: major size: {} in use: {}",
                Kib(major_size),
                Kib(major_in_use),
            ),
        }
    }
}
