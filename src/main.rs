use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use ftrace_ingest::{
    FtraceRecord, IngestConfig, SortedEvent, SortedEventSink, SourceId, TraceIngester,
};

/// Tokenize the ftrace bundles of a perfetto trace and check that they come
/// out in global timestamp order.
#[derive(Debug, Parser)]
#[command(name = "ftrace-ingest", version)]
struct Command {
    /// Trace file (.pb or .pb.gz)
    trace: PathBuf,
    /// JSON ingest config
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Drop bundles from CPUs at or above this
    #[arg(long)]
    max_cpus: Option<u32>,
    /// Stop waiting on a CPU after this many flushes without data from it
    #[arg(long)]
    idle_flushes: Option<u32>,
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbosity: u8,
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Counts emitted records and remembers whether time ever went backwards.
#[derive(Default)]
struct OrderCheck {
    by_kind: BTreeMap<&'static str, u64>,
    last_ts: Option<i64>,
    first_ts: Option<i64>,
    inversions: u64,
}

impl SortedEventSink<SourceId, FtraceRecord> for OrderCheck {
    fn accept(&mut self, event: SortedEvent<SourceId, FtraceRecord>) {
        let ts = event.key.ts;
        if let Some(last) = self.last_ts {
            if ts < last {
                self.inversions += 1;
            }
        }
        self.first_ts.get_or_insert(ts);
        self.last_ts = Some(ts);
        *self.by_kind.entry(event.payload.kind()).or_default() += 1;
    }
}

fn main() -> Result<()> {
    let opts = Command::parse();
    init_logging(opts.verbosity);

    let mut config = match &opts.config {
        Some(path) => IngestConfig::load(path)?,
        None => IngestConfig::default(),
    };
    if let Some(max_cpus) = opts.max_cpus {
        config.max_cpus = max_cpus;
    }
    if let Some(idle_flushes) = opts.idle_flushes {
        config.staleness.idle_flushes = Some(idle_flushes);
    }

    let mut ingester = TraceIngester::new(config);
    let mut check = OrderCheck::default();
    ingester.ingest_file(&opts.trace, &mut check)?;
    let summary = ingester.finish(&mut check);

    if check.inversions > 0 {
        warn!("{} records were emitted out of order", check.inversions);
    }
    let kinds = check
        .by_kind
        .iter()
        .map(|(kind, count)| format!("{kind}={count}"))
        .collect::<Vec<_>>()
        .join(" ");
    println!(
        "{}: {} records from {} bundles in {} packets, span {}..{} ns, {} inversions [{}]",
        opts.trace.display(),
        summary.emitted,
        summary.bundles,
        summary.packets,
        check.first_ts.unwrap_or_default(),
        check.last_ts.unwrap_or_default(),
        check.inversions,
        kinds
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&summary.stats).context("Failed to serialize stats")?
    );
    Ok(())
}
