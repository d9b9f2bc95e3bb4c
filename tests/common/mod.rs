//! Common test utilities for ftrace-ingest integration tests.
//!
//! Traces are assembled from the real perfetto message types, the same way
//! the recorder builds them.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use perfetto_protos::builtin_clock::BuiltinClock;
use perfetto_protos::clock_snapshot::clock_snapshot::Clock;
use perfetto_protos::clock_snapshot::ClockSnapshot;
use perfetto_protos::ftrace_event::FtraceEvent;
use perfetto_protos::ftrace_event_bundle::ftrace_event_bundle::CompactSched;
use perfetto_protos::ftrace_event_bundle::{FtraceClock, FtraceEventBundle};
use perfetto_protos::trace::Trace;
use perfetto_protos::trace_packet::TracePacket;
use protobuf::Message;
use tempfile::NamedTempFile;

pub const SEQUENCE_ID: u32 = 3;

/// Builds a `CompactSched` from absolute timestamps, delta encoding them and
/// interning comms as it goes.
#[derive(Default)]
pub struct CompactSchedBuilder {
    compact_sched: CompactSched,
    comm_mapping: HashMap<String, u32>,
    last_switch_ts: u64,
    last_waking_ts: u64,
}

impl CompactSchedBuilder {
    fn comm_index(&mut self, comm: &str) -> u32 {
        let table = &mut self.compact_sched.intern_table;
        *self.comm_mapping.entry(comm.to_string()).or_insert_with(|| {
            table.push(comm.to_string());
            (table.len() as u32) - 1
        })
    }

    pub fn switch(mut self, ts: u64, next_pid: i32, next_comm: &str) -> Self {
        let index = self.comm_index(next_comm);
        self.compact_sched
            .switch_timestamp
            .push(ts - self.last_switch_ts);
        self.last_switch_ts = ts;
        self.compact_sched.switch_prev_state.push(0);
        self.compact_sched.switch_next_pid.push(next_pid);
        self.compact_sched.switch_next_prio.push(120);
        self.compact_sched.switch_next_comm_index.push(index);
        self
    }

    pub fn waking(mut self, ts: u64, pid: i32, target_cpu: i32, comm: &str) -> Self {
        let index = self.comm_index(comm);
        self.compact_sched
            .waking_timestamp
            .push(ts - self.last_waking_ts);
        self.last_waking_ts = ts;
        self.compact_sched.waking_pid.push(pid);
        self.compact_sched.waking_target_cpu.push(target_cpu);
        self.compact_sched.waking_prio.push(120);
        self.compact_sched.waking_comm_index.push(index);
        self.compact_sched.waking_common_flags.push(1);
        self
    }

    pub fn build(self) -> CompactSched {
        self.compact_sched
    }
}

pub fn ftrace_event(ts: u64, pid: u32) -> FtraceEvent {
    let mut event = FtraceEvent::default();
    event.set_timestamp(ts);
    event.set_pid(pid);
    event
}

pub fn bundle(cpu: u32, timestamps: &[u64]) -> FtraceEventBundle {
    let mut bundle = FtraceEventBundle::default();
    bundle.set_cpu(cpu);
    bundle.event = timestamps
        .iter()
        .map(|ts| ftrace_event(*ts, 100 + cpu))
        .collect();
    bundle
}

pub fn compact_bundle(cpu: u32, compact_sched: CompactSched) -> FtraceEventBundle {
    let mut bundle = FtraceEventBundle::default();
    bundle.set_cpu(cpu);
    bundle.compact_sched = Some(compact_sched).into();
    bundle
}

pub fn with_clock(mut bundle: FtraceEventBundle, clock: FtraceClock) -> FtraceEventBundle {
    bundle.set_ftrace_clock(clock);
    bundle
}

pub fn bundle_packet(bundle: FtraceEventBundle) -> TracePacket {
    let mut packet = TracePacket::default();
    packet.set_trusted_packet_sequence_id(SEQUENCE_ID);
    packet.set_ftrace_events(bundle);
    packet
}

pub fn clock_snapshot_packet(readings: &[(BuiltinClock, u64)]) -> TracePacket {
    let mut snapshot = ClockSnapshot::default();
    for (clock_id, ts) in readings {
        let mut clock = Clock::default();
        clock.set_clock_id(*clock_id as u32);
        clock.set_timestamp(*ts);
        snapshot.clocks.push(clock);
    }
    let mut packet = TracePacket::default();
    packet.set_trusted_packet_sequence_id(SEQUENCE_ID);
    packet.set_clock_snapshot(snapshot);
    packet
}

pub fn trace_bytes(packets: Vec<TracePacket>) -> Vec<u8> {
    let mut trace = Trace::default();
    trace.packet = packets;
    trace.write_to_bytes().expect("serialize trace")
}

/// Write a trace to a temporary `.pb` file.
pub fn write_trace(packets: Vec<TracePacket>) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".pb")
        .tempfile()
        .expect("create temp trace");
    file.write_all(&trace_bytes(packets))
        .expect("write temp trace");
    file
}

/// Write a trace to a temporary gzip compressed `.pb.gz` file.
pub fn write_trace_gz(packets: Vec<TracePacket>) -> NamedTempFile {
    let file = tempfile::Builder::new()
        .suffix(".pb.gz")
        .tempfile()
        .expect("create temp trace");
    let mut encoder = GzEncoder::new(file.reopen().expect("reopen"), Compression::default());
    encoder
        .write_all(&trace_bytes(packets))
        .expect("write temp trace");
    encoder.finish().expect("finish gzip");
    file
}
