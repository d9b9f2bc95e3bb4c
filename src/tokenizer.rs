//! Splits an `FtraceEventBundle` into timestamped records for the sorter.

use std::error::Error;
use std::fmt;

use perfetto_protos::ftrace_event_bundle::FtraceClock;
use protobuf::Enum;
use tracing::debug;

use crate::blob::TraceBlobView;
use crate::clock::{BuiltinClock, ClockResolver};
use crate::compact;
use crate::event::{FtraceRecord, RecordStream, SourceId};
use crate::sorter::EventSorter;
use crate::stats::{Stat, StatsSink};
use crate::strings::StringInterner;
use crate::wire::{make_tag_varint, parse_varint, ProtoDecoder, MAX_VARINT_LEN};

/// `FtraceEventBundle` field ids.
const BUNDLE_CPU: u32 = 1;
const BUNDLE_EVENT: u32 = 2;
const BUNDLE_COMPACT_SCHED: u32 = 4;
const BUNDLE_FTRACE_CLOCK: u32 = 5;

/// `FtraceEvent.timestamp`.
const EVENT_TIMESTAMP: u32 = 1;
const EVENT_TIMESTAMP_TAG: u8 = make_tag_varint(EVENT_TIMESTAMP);

/// Default upper bound (exclusive) on CPU indices.
pub const DEFAULT_MAX_CPUS: u32 = 128;

pub type FtraceSorter = EventSorter<SourceId, FtraceRecord>;

/// A bundle that can't be tokenized without corrupting every timestamp
/// derived from it. Malformed data is never reported this way; it goes to the
/// stats counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizeError {
    /// The bundle was recorded with the per-CPU `local` trace clock, which
    /// can't be related to any other clock.
    LocalClock,
    /// The bundle names a trace clock this tokenizer doesn't know.
    UnsupportedClock(i32),
}

impl fmt::Display for TokenizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenizeError::LocalClock => {
                write!(f, "Unable to parse ftrace packets with local clock")
            }
            TokenizeError::UnsupportedClock(clock) => {
                write!(f, "Unable to parse ftrace packets with unknown clock {clock}")
            }
        }
    }
}

impl Error for TokenizeError {}

/// The packet sequence a bundle was written on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceState {
    pub sequence_id: u32,
}

impl SequenceState {
    pub fn new(sequence_id: u32) -> Self {
        Self { sequence_id }
    }
}

/// Everything the tokenizer writes to or reads from while processing a
/// bundle.
pub struct TokenizerContext<'a> {
    pub clocks: &'a mut dyn ClockResolver,
    pub sorter: &'a mut FtraceSorter,
    pub stats: &'a dyn StatsSink,
    pub strings: &'a mut dyn StringInterner,
}

impl TokenizerContext<'_> {
    /// Convert `raw_ts` and queue `record`. Records whose clock can't be
    /// resolved are dropped; the resolver accounts for them.
    pub(crate) fn push_record(
        &mut self,
        source: SourceId,
        clock: BuiltinClock,
        raw_ts: i64,
        record: FtraceRecord,
    ) -> bool {
        let Some(ts) = self.clocks.to_trace_time(clock, raw_ts) else {
            return false;
        };
        self.sorter.push(source, ts, record, self.stats);
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FtraceTokenizer {
    max_cpus: u32,
}

impl Default for FtraceTokenizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CPUS)
    }
}

impl FtraceTokenizer {
    pub fn new(max_cpus: u32) -> Self {
        Self { max_cpus }
    }

    /// Tokenize one bundle.
    ///
    /// Bad data inside the bundle is counted and skipped; only a clock that
    /// can't be converted at all is an error.
    pub fn tokenize_bundle(
        &self,
        bundle: &TraceBlobView,
        state: &SequenceState,
        ctx: &mut TokenizerContext<'_>,
    ) -> Result<(), TokenizeError> {
        let mut cpu = None;
        let mut ftrace_clock = FtraceClock::FTRACE_CLOCK_UNSPECIFIED.value();
        let mut compact_sched = None;

        let mut decoder = ProtoDecoder::new(bundle.data());
        for field in decoder.by_ref() {
            match field.id {
                BUNDLE_CPU => cpu = field.as_u64(),
                BUNDLE_FTRACE_CLOCK => {
                    if let Some(value) = field.as_u64() {
                        ftrace_clock = value as i32;
                    }
                }
                BUNDLE_COMPACT_SCHED => compact_sched = field.as_bytes(),
                _ => {}
            }
        }
        let Some(cpu) = cpu else {
            debug!("CPU field not found in FtraceEventBundle");
            ctx.stats.increment(Stat::FtraceBundleTokenizerErrors);
            return Ok(());
        };
        let cpu = match u32::try_from(cpu) {
            Ok(cpu) if cpu < self.max_cpus => cpu,
            _ => {
                debug!("CPU {} is not below max_cpus {}", cpu, self.max_cpus);
                ctx.stats.increment(Stat::FtraceCpuOutOfRange);
                return Ok(());
            }
        };

        // Only kept bundles count truncation; rejected ones were counted above.
        if decoder.is_malformed() {
            debug!("FtraceEventBundle is truncated, using the fields before the damage");
            ctx.stats.increment(Stat::FtraceBundleTokenizerErrors);
        }

        let clock = bundle_clock(ftrace_clock)?;

        if let Some(compact_sched) = compact_sched {
            compact::tokenize_compact_sched(cpu, clock, compact_sched, ctx);
        }

        for field in ProtoDecoder::new(bundle.data()) {
            if field.id != BUNDLE_EVENT {
                continue;
            }
            let Some(data) = field.as_bytes() else {
                continue;
            };
            if let Some(event) = bundle.slice(field.offset, data.len()) {
                self.tokenize_event(cpu, clock, event, state, ctx);
            }
        }
        Ok(())
    }

    fn tokenize_event(
        &self,
        cpu: u32,
        clock: BuiltinClock,
        event: TraceBlobView,
        state: &SequenceState,
        ctx: &mut TokenizerContext<'_>,
    ) {
        let Some(raw_ts) = event_timestamp(event.data()) else {
            debug!("Timestamp field not found in FtraceEvent");
            ctx.stats.increment(Stat::FtraceBundleTokenizerErrors);
            return;
        };
        ctx.push_record(
            SourceId::new(cpu, RecordStream::Event),
            clock,
            raw_ts as i64,
            FtraceRecord::Event {
                blob: event,
                sequence_id: state.sequence_id,
            },
        );
    }
}

/// Trace clock the bundle's timestamps were taken in.
fn bundle_clock(ftrace_clock: i32) -> Result<BuiltinClock, TokenizeError> {
    match FtraceClock::from_i32(ftrace_clock) {
        Some(FtraceClock::FTRACE_CLOCK_UNSPECIFIED) => Ok(BuiltinClock::BUILTIN_CLOCK_BOOTTIME),
        Some(FtraceClock::FTRACE_CLOCK_GLOBAL) => Ok(BuiltinClock::BUILTIN_CLOCK_MONOTONIC),
        Some(FtraceClock::FTRACE_CLOCK_LOCAL) => Err(TokenizeError::LocalClock),
        _ => Err(TokenizeError::UnsupportedClock(ftrace_clock)),
    }
}

/// Raw timestamp of an encoded `FtraceEvent`.
///
/// The recorder writes the timestamp as the first field, so check for its tag
/// at byte 0 and decode the varint in place before falling back to a scan.
fn event_timestamp(data: &[u8]) -> Option<u64> {
    if data.len() > MAX_VARINT_LEN && data[0] == EVENT_TIMESTAMP_TAG {
        return parse_varint(&data[1..=MAX_VARINT_LEN]).map(|(ts, _)| ts);
    }
    ProtoDecoder::new(data)
        .find_field(EVENT_TIMESTAMP)
        .and_then(|field| field.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SnapshotClockResolver;
    use crate::sorter::{SortedEvent, StalenessPolicy};
    use crate::stats::Stats;
    use crate::strings::StringPool;
    use crate::wire::testing::{bytes_field, varint_field};
    use perfetto_protos::ftrace_event::FtraceEvent;
    use perfetto_protos::ftrace_event_bundle::FtraceEventBundle;
    use perfetto_protos::sched::SchedWakeupNewFtraceEvent;
    use protobuf::Message;
    use std::sync::Arc;

    /// Pieces a `TokenizerContext` borrows from.
    struct Harness {
        clocks: SnapshotClockResolver,
        sorter: FtraceSorter,
        stats: Arc<Stats>,
        strings: StringPool,
    }

    impl Harness {
        fn new() -> Self {
            let stats = Arc::new(Stats::new());
            Self {
                clocks: SnapshotClockResolver::new(Arc::clone(&stats)),
                sorter: EventSorter::new(StalenessPolicy::default()),
                stats,
                strings: StringPool::new(),
            }
        }

        fn tokenize(&mut self, bundle: Vec<u8>) -> Result<(), TokenizeError> {
            self.tokenize_with(FtraceTokenizer::default(), bundle)
        }

        fn tokenize_with(
            &mut self,
            tokenizer: FtraceTokenizer,
            bundle: Vec<u8>,
        ) -> Result<(), TokenizeError> {
            let mut ctx = TokenizerContext {
                clocks: &mut self.clocks,
                sorter: &mut self.sorter,
                stats: &*self.stats,
                strings: &mut self.strings,
            };
            tokenizer.tokenize_bundle(&bundle.into(), &SequenceState::new(7), &mut ctx)
        }

        fn drain(&mut self) -> Vec<SortedEvent<SourceId, FtraceRecord>> {
            let mut out = Vec::new();
            self.sorter.drain(&mut out);
            out
        }
    }

    fn ftrace_event(ts: u64, pid: u32) -> FtraceEvent {
        let mut event = FtraceEvent::default();
        event.set_timestamp(ts);
        event.set_pid(pid);
        let mut wakeup = SchedWakeupNewFtraceEvent::default();
        wakeup.set_pid(pid as i32);
        wakeup.set_comm("worker".to_string());
        event.set_sched_wakeup_new(wakeup);
        event
    }

    fn bundle(cpu: Option<u32>, events: Vec<FtraceEvent>) -> FtraceEventBundle {
        let mut bundle = FtraceEventBundle::default();
        if let Some(cpu) = cpu {
            bundle.set_cpu(cpu);
        }
        bundle.event = events;
        bundle
    }

    #[test]
    fn test_verbose_events_are_forwarded() {
        let mut harness = Harness::new();
        let bundle = bundle(Some(2), vec![ftrace_event(1000, 10), ftrace_event(2000, 11)]);
        harness.tokenize(bundle.write_to_bytes().unwrap()).unwrap();

        let out = harness.drain();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].key.ts, 1000);
        assert_eq!(out[1].key.ts, 2000);
        assert_eq!(out[0].key.source, SourceId::new(2, RecordStream::Event));
        let FtraceRecord::Event { blob, sequence_id } = &out[1].payload else {
            panic!("expected a verbose event");
        };
        assert_eq!(*sequence_id, 7);
        let decoded = FtraceEvent::parse_from_bytes(blob.data()).unwrap();
        assert_eq!(decoded.pid(), 11);
        assert_eq!(decoded.sched_wakeup_new().comm(), "worker");
        assert_eq!(harness.stats.total(), 0);
    }

    #[test]
    fn test_missing_cpu_is_soft_error() {
        let mut harness = Harness::new();
        let bundle = bundle(None, vec![ftrace_event(1000, 10)]);
        assert!(harness.tokenize(bundle.write_to_bytes().unwrap()).is_ok());

        assert_eq!(harness.stats.get(Stat::FtraceBundleTokenizerErrors), 1);
        assert_eq!(harness.stats.total(), 1);
        assert!(harness.drain().is_empty());
    }

    #[test]
    fn test_truncated_bundle_without_cpu_counted_once() {
        let mut harness = Harness::new();
        let mut data = bundle(None, vec![ftrace_event(1000, 10)])
            .write_to_bytes()
            .unwrap();
        // An event field claiming five bytes with only one present.
        data.extend_from_slice(&[0x12, 0x05, 0x08]);
        assert!(harness.tokenize(data).is_ok());

        assert_eq!(harness.stats.get(Stat::FtraceBundleTokenizerErrors), 1);
        assert!(harness.drain().is_empty());
    }

    #[test]
    fn test_truncated_bundle_keeps_leading_events() {
        let mut harness = Harness::new();
        let mut data = bundle(Some(1), vec![ftrace_event(1000, 10)])
            .write_to_bytes()
            .unwrap();
        data.extend_from_slice(&[0x12, 0x05, 0x08]);
        assert!(harness.tokenize(data).is_ok());

        assert_eq!(harness.stats.get(Stat::FtraceBundleTokenizerErrors), 1);
        let out = harness.drain();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key.ts, 1000);
    }

    #[test]
    fn test_cpu_out_of_range() {
        let mut harness = Harness::new();
        let bundle = bundle(Some(4), vec![ftrace_event(1000, 10)]);
        let result =
            harness.tokenize_with(FtraceTokenizer::new(4), bundle.write_to_bytes().unwrap());

        assert!(result.is_ok());
        assert_eq!(harness.stats.get(Stat::FtraceCpuOutOfRange), 1);
        assert!(harness.drain().is_empty());
    }

    #[test]
    fn test_clock_mapping() {
        let unspecified = FtraceClock::FTRACE_CLOCK_UNSPECIFIED.value();
        let global = FtraceClock::FTRACE_CLOCK_GLOBAL.value();
        let local = FtraceClock::FTRACE_CLOCK_LOCAL.value();
        assert_eq!(
            bundle_clock(unspecified),
            Ok(BuiltinClock::BUILTIN_CLOCK_BOOTTIME)
        );
        assert_eq!(bundle_clock(global), Ok(BuiltinClock::BUILTIN_CLOCK_MONOTONIC));
        assert_eq!(bundle_clock(local), Err(TokenizeError::LocalClock));
        assert_eq!(bundle_clock(99), Err(TokenizeError::UnsupportedClock(99)));
    }

    #[test]
    fn test_local_clock_is_hard_error() {
        let mut harness = Harness::new();
        let mut bundle = bundle(Some(0), vec![ftrace_event(1000, 10)]);
        bundle.set_ftrace_clock(FtraceClock::FTRACE_CLOCK_LOCAL);

        let result = harness.tokenize(bundle.write_to_bytes().unwrap());
        assert_eq!(result, Err(TokenizeError::LocalClock));
        assert!(harness.drain().is_empty());
        assert_eq!(harness.stats.total(), 0);
    }

    #[test]
    fn test_global_clock_is_resolved() {
        let mut harness = Harness::new();
        harness.clocks.add_readings(&[
            (BuiltinClock::BUILTIN_CLOCK_MONOTONIC, 1_000),
            (BuiltinClock::BUILTIN_CLOCK_BOOTTIME, 11_000),
        ]);
        let mut bundle = bundle(Some(0), vec![ftrace_event(1_500, 10)]);
        bundle.set_ftrace_clock(FtraceClock::FTRACE_CLOCK_GLOBAL);
        harness.tokenize(bundle.write_to_bytes().unwrap()).unwrap();

        let out = harness.drain();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key.ts, 11_500);
    }

    #[test]
    fn test_unresolvable_clock_drops_records() {
        let mut harness = Harness::new();
        let mut bundle = bundle(Some(0), vec![ftrace_event(1_500, 10), ftrace_event(1_600, 10)]);
        bundle.set_ftrace_clock(FtraceClock::FTRACE_CLOCK_GLOBAL);

        assert!(harness.tokenize(bundle.write_to_bytes().unwrap()).is_ok());
        assert!(harness.drain().is_empty());
        assert_eq!(harness.stats.get(Stat::ClockSyncFailure), 2);
    }

    #[test]
    fn test_timestamp_slow_path() {
        // pid before timestamp defeats the leading-tag fast path.
        let mut event = Vec::new();
        varint_field(&mut event, 2, 42);
        varint_field(&mut event, EVENT_TIMESTAMP, 123_456_789);

        let mut bundle = Vec::new();
        varint_field(&mut bundle, BUNDLE_CPU, 1);
        bytes_field(&mut bundle, BUNDLE_EVENT, &event);

        let mut harness = Harness::new();
        harness.tokenize(bundle).unwrap();
        let out = harness.drain();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key.ts, 123_456_789);
    }

    #[test]
    fn test_event_timestamp_paths() {
        let mut fast = Vec::new();
        varint_field(&mut fast, EVENT_TIMESTAMP, 1_700_000_000_000_000_000);
        varint_field(&mut fast, 2, 1);
        assert!(fast.len() > MAX_VARINT_LEN);
        assert_eq!(event_timestamp(&fast), Some(1_700_000_000_000_000_000));

        // Too short for the fast path, found by scanning.
        let mut short = Vec::new();
        varint_field(&mut short, EVENT_TIMESTAMP, 5);
        assert_eq!(event_timestamp(&short), Some(5));

        let mut none = Vec::new();
        varint_field(&mut none, 2, 5);
        assert_eq!(event_timestamp(&none), None);
    }

    #[test]
    fn test_event_without_timestamp_is_skipped() {
        let mut no_ts = Vec::new();
        varint_field(&mut no_ts, 2, 42);
        let with_ts = ftrace_event(900, 3).write_to_bytes().unwrap();

        let mut bundle = Vec::new();
        varint_field(&mut bundle, BUNDLE_CPU, 0);
        bytes_field(&mut bundle, BUNDLE_EVENT, &no_ts);
        bytes_field(&mut bundle, BUNDLE_EVENT, &with_ts);

        let mut harness = Harness::new();
        assert!(harness.tokenize(bundle).is_ok());
        assert_eq!(harness.stats.get(Stat::FtraceBundleTokenizerErrors), 1);
        let out = harness.drain();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key.ts, 900);
    }

    #[test]
    fn test_cpu_after_events_is_honored() {
        // Field order on the wire doesn't matter for the bundle header.
        let event = ftrace_event(500, 3).write_to_bytes().unwrap();
        let mut bundle = Vec::new();
        bytes_field(&mut bundle, BUNDLE_EVENT, &event);
        varint_field(&mut bundle, BUNDLE_CPU, 3);

        let mut harness = Harness::new();
        harness.tokenize(bundle).unwrap();
        let out = harness.drain();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key.source.cpu, 3);
    }
}
