//! Expansion of `FtraceEventBundle.compact_sched`.
//!
//! The recorder stores `sched_switch` and `sched_waking` structure-of-arrays
//! style: one packed repeated field per event member, delta-encoded
//! timestamps, and comm strings replaced by indices into a per-bundle intern
//! table. Here the columns of each group are walked in lock-step to rebuild
//! the individual events.

use tracing::debug;

use crate::clock::BuiltinClock;
use crate::event::{FtraceRecord, InlineSchedSwitch, InlineSchedWaking, RecordStream, SourceId};
use crate::stats::Stat;
use crate::strings::StringId;
use crate::tokenizer::TokenizerContext;
use crate::wire::{Field, PackedVarInt, ProtoDecoder};

/// `FtraceEventBundle.CompactSched` field ids.
const SWITCH_TIMESTAMP: u32 = 1;
const SWITCH_PREV_STATE: u32 = 2;
const SWITCH_NEXT_PID: u32 = 3;
const SWITCH_NEXT_PRIO: u32 = 4;
const INTERN_TABLE: u32 = 5;
const SWITCH_NEXT_COMM_INDEX: u32 = 6;
const WAKING_TIMESTAMP: u32 = 7;
const WAKING_PID: u32 = 8;
const WAKING_TARGET_CPU: u32 = 9;
const WAKING_PRIO: u32 = 10;
const WAKING_COMM_INDEX: u32 = 11;
const MAX_COLUMN_FIELD: u32 = WAKING_COMM_INDEX;

const SWITCH_COLUMNS: [&str; 5] = [
    "switch_timestamp",
    "switch_prev_state",
    "switch_next_pid",
    "switch_next_prio",
    "switch_next_comm_index",
];

const WAKING_COLUMNS: [&str; 5] = [
    "waking_timestamp",
    "waking_pid",
    "waking_target_cpu",
    "waking_prio",
    "waking_comm_index",
];

/// Why a group stopped before its columns ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupFault {
    /// A column held a truncated varint or had the wrong wire type.
    MalformedColumn(&'static str),
    /// Some columns ran out while others still had values.
    ColumnLengthMismatch,
    /// A comm index pointed past the end of the intern table.
    CommIndexOutOfRange { index: u64, table_len: usize },
}

/// Result of decoding one group. `events` counts the records queued before
/// the group finished or stopped; rows dropped by the clock resolver are not
/// included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupDecode {
    Complete { events: usize },
    Partial { events: usize, fault: GroupFault },
}

impl GroupDecode {
    pub fn events(&self) -> usize {
        match *self {
            GroupDecode::Complete { events } | GroupDecode::Partial { events, .. } => events,
        }
    }

    pub fn fault(&self) -> Option<GroupFault> {
        match *self {
            GroupDecode::Complete { .. } => None,
            GroupDecode::Partial { fault, .. } => Some(fault),
        }
    }
}

/// Outcome of both groups of one `CompactSched`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactDecode {
    pub switch: GroupDecode,
    pub waking: GroupDecode,
}

/// One step of a [`LockStep`] walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step<const N: usize> {
    Row([u64; N]),
    Finished,
    Misaligned,
    Malformed(usize),
}

/// Advances several packed columns together, one value from each per row.
struct LockStep<'a, const N: usize> {
    columns: [PackedVarInt<'a>; N],
}

impl<'a, const N: usize> LockStep<'a, N> {
    fn new(columns: [PackedVarInt<'a>; N]) -> Self {
        Self { columns }
    }

    fn step(&mut self) -> Step<N> {
        let mut row = [0u64; N];
        let mut present = 0;
        for (i, column) in self.columns.iter_mut().enumerate() {
            match column.next() {
                Some(value) => {
                    row[i] = value;
                    present += 1;
                }
                None if column.is_malformed() => return Step::Malformed(i),
                None => {}
            }
        }
        match present {
            0 => Step::Finished,
            n if n == N => Step::Row(row),
            _ => Step::Misaligned,
        }
    }
}

/// Last occurrence of each column field of a `CompactSched` message.
struct CompactColumns<'a> {
    fields: [Option<Field<'a>>; MAX_COLUMN_FIELD as usize + 1],
}

impl<'a> CompactColumns<'a> {
    fn packed(&self, field_id: u32) -> PackedVarInt<'a> {
        PackedVarInt::from_field(self.fields[field_id as usize])
    }

    fn lock_step<const N: usize>(&self, field_ids: [u32; N]) -> LockStep<'a, N> {
        LockStep::new(field_ids.map(|id| self.packed(id)))
    }
}

/// Decode a `CompactSched` message and queue its events.
///
/// Problems are counted, never returned: a broken group stops on its own and
/// the other group, and the rest of the bundle, are still decoded.
pub fn tokenize_compact_sched(
    cpu: u32,
    clock: BuiltinClock,
    compact: &[u8],
    ctx: &mut TokenizerContext<'_>,
) -> CompactDecode {
    let mut columns = CompactColumns {
        fields: [None; MAX_COLUMN_FIELD as usize + 1],
    };
    let mut string_table = Vec::with_capacity(512);

    let mut decoder = ProtoDecoder::new(compact);
    for field in decoder.by_ref() {
        match field.id {
            INTERN_TABLE => {
                if let Some(comm) = field.as_bytes() {
                    string_table.push(ctx.strings.intern(comm));
                }
            }
            id if id <= MAX_COLUMN_FIELD => columns.fields[id as usize] = Some(field),
            _ => {}
        }
    }
    if decoder.is_malformed() {
        debug!("CompactSched for cpu {} is truncated", cpu);
        ctx.stats.increment(Stat::CompactSchedHasParseErrors);
    }

    let switch = decode_switch_group(cpu, clock, &columns, &string_table, ctx);
    record_outcome(cpu, "switch", switch, ctx);

    let waking = decode_waking_group(cpu, clock, &columns, &string_table, ctx);
    record_outcome(cpu, "waking", waking, ctx);

    CompactDecode { switch, waking }
}

fn record_outcome(cpu: u32, group: &str, outcome: GroupDecode, ctx: &TokenizerContext<'_>) {
    let Some(fault) = outcome.fault() else {
        return;
    };
    debug!(
        "Compact sched {} group on cpu {} stopped after {} events: {:?}",
        group,
        cpu,
        outcome.events(),
        fault
    );
    let stat = match fault {
        GroupFault::CommIndexOutOfRange { .. } => Stat::CompactSchedCommIndexOutOfRange,
        GroupFault::MalformedColumn(_) | GroupFault::ColumnLengthMismatch => {
            Stat::CompactSchedHasParseErrors
        }
    };
    ctx.stats.increment(stat);
}

fn lookup_comm(string_table: &[StringId], index: u64) -> Result<StringId, GroupFault> {
    usize::try_from(index)
        .ok()
        .and_then(|i| string_table.get(i))
        .copied()
        .ok_or(GroupFault::CommIndexOutOfRange {
            index,
            table_len: string_table.len(),
        })
}

fn decode_switch_group(
    cpu: u32,
    clock: BuiltinClock,
    columns: &CompactColumns<'_>,
    string_table: &[StringId],
    ctx: &mut TokenizerContext<'_>,
) -> GroupDecode {
    let mut rows = columns.lock_step([
        SWITCH_TIMESTAMP,
        SWITCH_PREV_STATE,
        SWITCH_NEXT_PID,
        SWITCH_NEXT_PRIO,
        SWITCH_NEXT_COMM_INDEX,
    ]);
    let source = SourceId::new(cpu, RecordStream::CompactSwitch);
    let mut timestamp_acc: i64 = 0;
    let mut events = 0;

    loop {
        let [delta, prev_state, next_pid, next_prio, comm_index] = match rows.step() {
            Step::Row(row) => row,
            Step::Finished => return GroupDecode::Complete { events },
            Step::Misaligned => {
                return GroupDecode::Partial {
                    events,
                    fault: GroupFault::ColumnLengthMismatch,
                }
            }
            Step::Malformed(column) => {
                return GroupDecode::Partial {
                    events,
                    fault: GroupFault::MalformedColumn(SWITCH_COLUMNS[column]),
                }
            }
        };

        timestamp_acc = timestamp_acc.wrapping_add(delta as i64);
        let next_comm = match lookup_comm(string_table, comm_index) {
            Ok(comm) => comm,
            Err(fault) => return GroupDecode::Partial { events, fault },
        };
        let event = InlineSchedSwitch {
            prev_state: prev_state as i64,
            next_pid: next_pid as i32,
            next_prio: next_prio as i32,
            next_comm,
        };
        if ctx.push_record(
            source,
            clock,
            timestamp_acc,
            FtraceRecord::SchedSwitch(event),
        ) {
            events += 1;
        }
    }
}

fn decode_waking_group(
    cpu: u32,
    clock: BuiltinClock,
    columns: &CompactColumns<'_>,
    string_table: &[StringId],
    ctx: &mut TokenizerContext<'_>,
) -> GroupDecode {
    let mut rows = columns.lock_step([
        WAKING_TIMESTAMP,
        WAKING_PID,
        WAKING_TARGET_CPU,
        WAKING_PRIO,
        WAKING_COMM_INDEX,
    ]);
    let source = SourceId::new(cpu, RecordStream::CompactWaking);
    let mut timestamp_acc: i64 = 0;
    let mut events = 0;

    loop {
        let [delta, pid, target_cpu, prio, comm_index] = match rows.step() {
            Step::Row(row) => row,
            Step::Finished => return GroupDecode::Complete { events },
            Step::Misaligned => {
                return GroupDecode::Partial {
                    events,
                    fault: GroupFault::ColumnLengthMismatch,
                }
            }
            Step::Malformed(column) => {
                return GroupDecode::Partial {
                    events,
                    fault: GroupFault::MalformedColumn(WAKING_COLUMNS[column]),
                }
            }
        };

        timestamp_acc = timestamp_acc.wrapping_add(delta as i64);
        let comm = match lookup_comm(string_table, comm_index) {
            Ok(comm) => comm,
            Err(fault) => return GroupDecode::Partial { events, fault },
        };
        let event = InlineSchedWaking {
            pid: pid as i32,
            target_cpu: target_cpu as i32,
            prio: prio as i32,
            comm,
        };
        if ctx.push_record(
            source,
            clock,
            timestamp_acc,
            FtraceRecord::SchedWaking(event),
        ) {
            events += 1;
        }
    }
}
