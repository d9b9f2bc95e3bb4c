//! Records produced by the tokenizer and ordered by the sorter.

use crate::blob::TraceBlobView;
use crate::strings::StringId;

/// A `sched_switch` expanded from a compact sched block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlineSchedSwitch {
    pub prev_state: i64,
    pub next_pid: i32,
    pub next_prio: i32,
    pub next_comm: StringId,
}

/// A `sched_waking` expanded from a compact sched block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlineSchedWaking {
    pub pid: i32,
    pub target_cpu: i32,
    pub prio: i32,
    pub comm: StringId,
}

/// Payload handed downstream once a record's turn comes up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FtraceRecord {
    /// A verbose `FtraceEvent`, still encoded. `sequence_id` is the packet
    /// sequence the bundle arrived on.
    Event {
        blob: TraceBlobView,
        sequence_id: u32,
    },
    SchedSwitch(InlineSchedSwitch),
    SchedWaking(InlineSchedWaking),
}

impl FtraceRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            FtraceRecord::Event { .. } => "ftrace_event",
            FtraceRecord::SchedSwitch(_) => "sched_switch",
            FtraceRecord::SchedWaking(_) => "sched_waking",
        }
    }
}

/// Which per-CPU stream a record came from.
///
/// Each stream is internally ordered, but the compact switch block, the
/// compact waking block and the verbose events of one bundle each restart
/// from the bundle's first timestamp, so they are sorted as separate sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordStream {
    CompactSwitch,
    CompactWaking,
    Event,
}

/// Sorter source identity for ftrace records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId {
    pub cpu: u32,
    pub stream: RecordStream,
}

impl SourceId {
    pub fn new(cpu: u32, stream: RecordStream) -> Self {
        Self { cpu, stream }
    }
}
