//! Ingestion of the ftrace data in perfetto traces.
//!
//! The recorder writes one `FtraceEventBundle` per CPU buffer read. Each
//! bundle carries verbose `FtraceEvent`s and, for the scheduler's hottest
//! events, a column-oriented `CompactSched` block. This crate turns those
//! bundles back into individual records with trace-clock timestamps and
//! merges the per-CPU streams into one globally ordered stream.
//!
//! # Modules
//!
//! - [`wire`] - zero-copy protobuf field and packed-varint decoding
//! - [`tokenizer`] - splits a bundle into timestamped records
//! - [`compact`] - expands `CompactSched` columns into sched events
//! - [`clock`] - clock domain conversion from `ClockSnapshot`s
//! - [`sorter`] - k-way merge of the per-source record streams
//! - [`ingest`] - drives a whole trace file through the above
//!
//! # Example
//!
//! ```no_run
//! use ftrace_ingest::{FtraceRecord, IngestConfig, SortedEvent, SourceId, TraceIngester};
//! use std::path::Path;
//!
//! let mut ingester = TraceIngester::new(IngestConfig::default());
//! let mut events: Vec<SortedEvent<SourceId, FtraceRecord>> = Vec::new();
//! ingester.ingest_file(Path::new("trace.pb.gz"), &mut events)?;
//! let summary = ingester.finish(&mut events);
//! println!("{} records", summary.emitted);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod blob;
pub mod clock;
pub mod compact;
pub mod config;
pub mod event;
pub mod ingest;
pub mod reader;
pub mod sorter;
pub mod stats;
pub mod strings;
pub mod tokenizer;
pub mod wire;

pub use blob::TraceBlobView;
pub use clock::{BuiltinClock, ClockResolver, SnapshotClockResolver};
pub use config::IngestConfig;
pub use event::{FtraceRecord, InlineSchedSwitch, InlineSchedWaking, RecordStream, SourceId};
pub use ingest::{IngestSummary, TraceIngester};
pub use sorter::{EventSorter, SortKey, SortedEvent, SortedEventSink, StalenessPolicy};
pub use stats::{Stat, Stats, StatsSink};
pub use strings::{StringId, StringInterner, StringPool};
pub use tokenizer::{FtraceTokenizer, SequenceState, TokenizeError, TokenizerContext};
