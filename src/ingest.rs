//! Drives a whole trace through the tokenizer and sorter.

use std::collections::{BTreeMap, HashSet};
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::blob::TraceBlobView;
use crate::clock::SnapshotClockResolver;
use crate::config::IngestConfig;
use crate::event::{FtraceRecord, SourceId};
use crate::reader::{open_trace_reader, TracePacketIterator};
use crate::sorter::{EventSorter, SortedEventSink};
use crate::stats::Stats;
use crate::strings::StringPool;
use crate::tokenizer::{FtraceSorter, FtraceTokenizer, SequenceState, TokenizerContext};
use crate::wire::ProtoDecoder;

/// `TracePacket` field ids.
const PACKET_FTRACE_EVENTS: u32 = 1;
const PACKET_CLOCK_SNAPSHOT: u32 = 6;
const PACKET_TRUSTED_SEQUENCE_ID: u32 = 10;
const BUNDLE_CPU: u32 = 1;

/// Sink for records in global timestamp order.
pub type FtraceSink<'a> = dyn SortedEventSink<SourceId, FtraceRecord> + 'a;

/// What a finished ingestion saw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub packets: u64,
    pub bundles: u64,
    pub emitted: u64,
    pub stats: BTreeMap<&'static str, u64>,
}

pub struct TraceIngester {
    tokenizer: FtraceTokenizer,
    sorter: FtraceSorter,
    clocks: SnapshotClockResolver,
    strings: StringPool,
    stats: Arc<Stats>,
    /// CPUs that delivered a bundle since the last flush.
    round: HashSet<u64>,
    packets: u64,
    bundles: u64,
    emitted: u64,
}

impl TraceIngester {
    pub fn new(config: IngestConfig) -> Self {
        let stats = Arc::new(Stats::new());
        Self {
            tokenizer: FtraceTokenizer::new(config.max_cpus),
            sorter: EventSorter::new(config.staleness),
            clocks: SnapshotClockResolver::new(Arc::clone(&stats)),
            strings: StringPool::new(),
            stats,
            round: HashSet::new(),
            packets: 0,
            bundles: 0,
            emitted: 0,
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn strings(&self) -> &StringPool {
        &self.strings
    }

    pub fn clocks(&self) -> &SnapshotClockResolver {
        &self.clocks
    }

    pub fn pending(&self) -> usize {
        self.sorter.pending_len()
    }

    /// Handle one encoded `TracePacket`, passing any records that became
    /// ready to `sink`.
    pub fn ingest_packet(
        &mut self,
        packet: &TraceBlobView,
        sink: &mut FtraceSink<'_>,
    ) -> Result<()> {
        self.packets += 1;

        let mut sequence_id = 0;
        let mut bundles = Vec::new();
        let mut decoder = ProtoDecoder::new(packet.data());
        for field in decoder.by_ref() {
            match field.id {
                PACKET_TRUSTED_SEQUENCE_ID => {
                    sequence_id = field.as_u64().unwrap_or_default() as u32;
                }
                PACKET_CLOCK_SNAPSHOT => {
                    if let Some(snapshot) = field.as_bytes() {
                        self.clocks.add_snapshot_bytes(snapshot).with_context(|| {
                            format!("Bad clock snapshot in packet {}", self.packets)
                        })?;
                    }
                }
                PACKET_FTRACE_EVENTS => {
                    if let Some(data) = field.as_bytes() {
                        bundles.extend(packet.slice(field.offset, data.len()));
                    }
                }
                _ => {}
            }
        }
        if decoder.is_malformed() {
            debug!("Packet {} is truncated", self.packets);
        }

        // The sequence id can follow the bundle in the packet, so bundles are
        // only tokenized once the whole packet has been read.
        let state = SequenceState::new(sequence_id);
        for bundle in bundles {
            self.ingest_bundle(&bundle, &state, sink)?;
        }
        Ok(())
    }

    /// Tokenize one `FtraceEventBundle`.
    ///
    /// The recorder writes one bundle per CPU each time it reads the ring
    /// buffers. A second bundle from the same CPU starts a new read, so the
    /// sorter is flushed then, once every CPU has had its say for the
    /// previous one.
    pub fn ingest_bundle(
        &mut self,
        bundle: &TraceBlobView,
        state: &SequenceState,
        sink: &mut FtraceSink<'_>,
    ) -> Result<()> {
        self.bundles += 1;
        let cpu = ProtoDecoder::new(bundle.data())
            .find_field(BUNDLE_CPU)
            .and_then(|field| field.as_u64());
        if let Some(cpu) = cpu {
            if !self.round.insert(cpu) {
                self.flush(sink);
                self.round.insert(cpu);
            }
        }

        let mut ctx = TokenizerContext {
            clocks: &mut self.clocks,
            sorter: &mut self.sorter,
            stats: &*self.stats,
            strings: &mut self.strings,
        };
        self.tokenizer
            .tokenize_bundle(bundle, state, &mut ctx)
            .with_context(|| {
                format!(
                    "Failed to tokenize ftrace bundle {} (packet {})",
                    self.bundles, self.packets
                )
            })?;
        Ok(())
    }

    /// Emit every queued record that no CPU can still undercut.
    pub fn flush(&mut self, sink: &mut FtraceSink<'_>) -> usize {
        self.round.clear();
        let flushed = self.sorter.flush_ready(sink);
        self.emitted += flushed as u64;
        flushed
    }

    /// Ingest every packet of a trace stream.
    pub fn ingest_reader<R: BufRead>(
        &mut self,
        reader: R,
        sink: &mut FtraceSink<'_>,
    ) -> Result<()> {
        for packet in TracePacketIterator::new(reader) {
            let packet =
                packet.with_context(|| format!("Failed to read packet {}", self.packets + 1))?;
            self.ingest_packet(&packet, sink)?;
        }
        Ok(())
    }

    /// Ingest a trace file, `.gz` or plain.
    pub fn ingest_file(&mut self, path: &Path, sink: &mut FtraceSink<'_>) -> Result<()> {
        info!("Ingesting {}", path.display());
        let reader = open_trace_reader(path)?;
        self.ingest_reader(reader, sink)
            .with_context(|| format!("Failed to ingest {}", path.display()))
    }

    /// Drain everything still queued and report the totals.
    pub fn finish(&mut self, sink: &mut FtraceSink<'_>) -> IngestSummary {
        self.round.clear();
        self.emitted += self.sorter.drain(sink) as u64;
        info!(
            "Ingested {} packets, {} ftrace bundles, {} records",
            self.packets, self.bundles, self.emitted
        );
        IngestSummary {
            packets: self.packets,
            bundles: self.bundles,
            emitted: self.emitted,
            stats: self.stats.snapshot(),
        }
    }
}

impl Default for TraceIngester {
    fn default() -> Self {
        Self::new(IngestConfig::default())
    }
}
