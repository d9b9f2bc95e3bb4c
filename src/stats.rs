//! Named counters for recoverable ingestion errors.
//!
//! Malformed input never aborts ingestion; it bumps one of these counters and
//! the offending record, group or bundle is skipped. Counters only ever go up.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stat {
    /// Bundle without a CPU field, or event without a timestamp.
    FtraceBundleTokenizerErrors,
    /// Bundle whose CPU is beyond the configured maximum.
    FtraceCpuOutOfRange,
    /// Compact sched column ended early/late or held a bad varint.
    CompactSchedHasParseErrors,
    /// Compact sched comm index past the end of the intern table.
    CompactSchedCommIndexOutOfRange,
    /// A source pushed a timestamp below its own high-water mark.
    SorterOutOfOrderPush,
    /// An event arrived older than what was already emitted.
    SorterLateEvents,
    /// A raw timestamp could not be converted to trace time.
    ClockSyncFailure,
}

const STAT_COUNT: usize = 7;

impl Stat {
    pub const ALL: [Stat; STAT_COUNT] = [
        Stat::FtraceBundleTokenizerErrors,
        Stat::FtraceCpuOutOfRange,
        Stat::CompactSchedHasParseErrors,
        Stat::CompactSchedCommIndexOutOfRange,
        Stat::SorterOutOfOrderPush,
        Stat::SorterLateEvents,
        Stat::ClockSyncFailure,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stat::FtraceBundleTokenizerErrors => "ftrace_bundle_tokenizer_errors",
            Stat::FtraceCpuOutOfRange => "ftrace_cpu_out_of_range",
            Stat::CompactSchedHasParseErrors => "compact_sched_has_parse_errors",
            Stat::CompactSchedCommIndexOutOfRange => "compact_sched_comm_index_out_of_range",
            Stat::SorterOutOfOrderPush => "sorter_out_of_order_push",
            Stat::SorterLateEvents => "sorter_late_events",
            Stat::ClockSyncFailure => "clock_sync_failure",
        }
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Destination for error counters.
pub trait StatsSink {
    fn increment(&self, stat: Stat);
}

/// Lock-free counter store, one slot per [`Stat`].
#[derive(Debug)]
pub struct Stats {
    counts: [AtomicU64; STAT_COUNT],
}

impl Stats {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn get(&self, stat: Stat) -> u64 {
        self.counts[stat as usize].load(Ordering::Relaxed)
    }

    /// Every counter by name, zeros included.
    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        Stat::ALL
            .iter()
            .map(|stat| (stat.name(), self.get(*stat)))
            .collect()
    }

    pub fn total(&self) -> u64 {
        Stat::ALL.iter().map(|stat| self.get(*stat)).sum()
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsSink for Stats {
    fn increment(&self, stat: Stat) {
        self.counts[stat as usize].fetch_add(1, Ordering::Relaxed);
    }
}
