//! Conversion of raw clock-domain timestamps into trace time.
//!
//! The tokenizer only depends on [`ClockResolver`]. [`SnapshotClockResolver`]
//! is the implementation used when ingesting a trace file: it learns offsets
//! between clocks from `ClockSnapshot` packets, the same snapshots the
//! recorder writes at startup (one reading each of BOOTTIME, MONOTONIC,
//! REALTIME, ...).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use perfetto_protos::clock_snapshot::ClockSnapshot;
use protobuf::Message;
use tracing::debug;

use crate::stats::{Stat, Stats, StatsSink};

pub use perfetto_protos::builtin_clock::BuiltinClock;

/// Converts a timestamp taken in `clock` into trace time (nanoseconds).
///
/// Returns `None` when no conversion is known. Implementations record their
/// own diagnostics for failed conversions; callers just drop the record.
pub trait ClockResolver {
    fn to_trace_time(&mut self, clock: BuiltinClock, ts: i64) -> Option<i64>;
}

/// Readings of several clocks taken at the same instant, keyed by clock id.
type SnapshotReadings = HashMap<u32, i64>;

pub struct SnapshotClockResolver {
    trace_clock: BuiltinClock,
    snapshots: Vec<SnapshotReadings>,
    stats: Arc<Stats>,
}

impl SnapshotClockResolver {
    /// Resolver with BOOTTIME as the trace clock and no snapshots yet.
    pub fn new(stats: Arc<Stats>) -> Self {
        Self {
            trace_clock: BuiltinClock::BUILTIN_CLOCK_BOOTTIME,
            snapshots: Vec::new(),
            stats,
        }
    }

    pub fn trace_clock(&self) -> BuiltinClock {
        self.trace_clock
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    /// Record clock readings taken at the same instant.
    pub fn add_readings(&mut self, readings: &[(BuiltinClock, i64)]) {
        let snapshot = readings
            .iter()
            .map(|(clock, ts)| (*clock as u32, *ts))
            .collect();
        self.snapshots.push(snapshot);
    }

    /// Record a `ClockSnapshot` message. Its `primary_trace_clock`, if set,
    /// becomes the trace clock.
    pub fn add_snapshot(&mut self, snapshot: &ClockSnapshot) {
        if snapshot.has_primary_trace_clock() {
            self.trace_clock = snapshot.primary_trace_clock();
        }
        let readings: SnapshotReadings = snapshot
            .clocks
            .iter()
            .filter(|clock| clock.has_clock_id() && clock.has_timestamp())
            .map(|clock| (clock.clock_id(), clock.timestamp() as i64))
            .collect();
        if readings.is_empty() {
            debug!("Ignoring clock snapshot without usable clocks");
            return;
        }
        self.snapshots.push(readings);
    }

    /// Parse and record a serialized `ClockSnapshot`.
    pub fn add_snapshot_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let snapshot =
            ClockSnapshot::parse_from_bytes(bytes).context("Failed to parse clock snapshot")?;
        self.add_snapshot(&snapshot);
        Ok(())
    }

    /// Offset from `clock` to the trace clock that applies at `ts`.
    ///
    /// Uses the latest snapshot whose `clock` reading is at or before `ts`,
    /// falling back to the earliest reading when `ts` precedes all of them.
    fn offset_at(&self, clock: u32, ts: i64) -> Option<i64> {
        let trace_clock = self.trace_clock as u32;
        let mut before: Option<(i64, i64)> = None;
        let mut earliest: Option<(i64, i64)> = None;
        for snapshot in &self.snapshots {
            let (Some(&src), Some(&dst)) = (snapshot.get(&clock), snapshot.get(&trace_clock))
            else {
                continue;
            };
            let offset = dst.checked_sub(src)?;
            if src <= ts && before.map_or(true, |(best, _)| src >= best) {
                before = Some((src, offset));
            }
            if earliest.map_or(true, |(best, _)| src < best) {
                earliest = Some((src, offset));
            }
        }
        before.or(earliest).map(|(_, offset)| offset)
    }
}

impl ClockResolver for SnapshotClockResolver {
    fn to_trace_time(&mut self, clock: BuiltinClock, ts: i64) -> Option<i64> {
        if clock == self.trace_clock {
            return Some(ts);
        }
        let resolved = self
            .offset_at(clock as u32, ts)
            .and_then(|offset| ts.checked_add(offset));
        if resolved.is_none() {
            debug!(
                "No clock snapshot converts {:?} to {:?} at {}",
                clock, self.trace_clock, ts
            );
            self.stats.increment(Stat::ClockSyncFailure);
        }
        resolved
    }
}
