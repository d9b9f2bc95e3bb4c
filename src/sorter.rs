//! Bounded-window k-way merge of per-source event streams.
//!
//! Every source (a per-CPU record stream) delivers its events in timestamp
//! order, but sources are read in whatever order their buffers were drained,
//! so one CPU can be seconds ahead of another. The sorter keeps a queue per
//! source and the highest timestamp each source has pushed (its high-water
//! mark). No source can later push anything below its own mark, so every
//! pending event strictly older than the smallest mark across active sources
//! is safe to emit. How far behind a source may lag is never fixed up front;
//! the window grows and shrinks with the slowest source.
//!
//! Emission order is `(ts, source, sequence)` where `sequence` is the global
//! arrival order, so events with equal timestamps come out deterministically.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::fmt::Debug;

use serde::Deserialize;
use tracing::debug;

use crate::stats::{Stat, StatsSink};

/// Total order of emitted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SortKey<S> {
    pub ts: i64,
    pub source: S,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortedEvent<S, T> {
    pub key: SortKey<S>,
    pub payload: T,
}

/// Receives events from the sorter, in order.
pub trait SortedEventSink<S, T> {
    fn accept(&mut self, event: SortedEvent<S, T>);
}

impl<S, T> SortedEventSink<S, T> for Vec<SortedEvent<S, T>> {
    fn accept(&mut self, event: SortedEvent<S, T>) {
        self.push(event);
    }
}

/// When a source stops holding back `flush_ready`.
///
/// With neither limit set a source blocks flushing until it pushes again or
/// the stream is drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StalenessPolicy {
    /// Mark a source inactive after this many consecutive `flush_ready` calls
    /// without a push from it.
    pub idle_flushes: Option<u32>,
    /// Ignore a source whose high-water mark trails the most advanced source
    /// by more than this many nanoseconds.
    pub max_lag_ns: Option<i64>,
}

struct SourceQueue<S, T> {
    pending: VecDeque<SortedEvent<S, T>>,
    high_water: Option<i64>,
    pushed_since_flush: bool,
    idle_flushes: u32,
    active: bool,
}

impl<S, T> SourceQueue<S, T> {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            high_water: None,
            pushed_since_flush: false,
            idle_flushes: 0,
            active: true,
        }
    }
}

pub struct EventSorter<S, T> {
    sources: BTreeMap<S, SourceQueue<S, T>>,
    policy: StalenessPolicy,
    next_seq: u64,
    last_emitted_ts: Option<i64>,
    pending: usize,
}

impl<S, T> EventSorter<S, T>
where
    S: Copy + Ord + Debug,
{
    pub fn new(policy: StalenessPolicy) -> Self {
        Self {
            sources: BTreeMap::new(),
            policy,
            next_seq: 0,
            last_emitted_ts: None,
            pending: 0,
        }
    }

    /// Number of events waiting to be emitted.
    pub fn pending_len(&self) -> usize {
        self.pending
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn high_water_mark(&self, source: S) -> Option<i64> {
        self.sources.get(&source).and_then(|queue| queue.high_water)
    }

    pub fn is_active(&self, source: S) -> bool {
        self.sources.get(&source).is_some_and(|queue| queue.active)
    }

    /// Queue `payload` for `source` at trace time `ts`.
    ///
    /// A timestamp below the source's high-water mark is raised to it, and a
    /// timestamp below the last emitted one is raised to that, so a single bad
    /// record can never break the order of everything after it. Both cases
    /// are counted.
    pub fn push(&mut self, source: S, ts: i64, payload: T, stats: &dyn StatsSink) {
        let mut ts = ts;
        let queue = self.sources.entry(source).or_insert_with(SourceQueue::new);

        if let Some(high_water) = queue.high_water {
            if ts < high_water {
                debug!(
                    "Source {:?} went backwards: {} < high-water mark {}",
                    source, ts, high_water
                );
                stats.increment(Stat::SorterOutOfOrderPush);
                ts = high_water;
            }
        }
        if let Some(floor) = self.last_emitted_ts {
            if ts < floor {
                debug!(
                    "Late event from {:?}: {} is older than emitted {}",
                    source, ts, floor
                );
                stats.increment(Stat::SorterLateEvents);
                ts = floor;
            }
        }

        if !queue.active {
            debug!("Source {:?} is active again", source);
        }
        queue.high_water = Some(ts);
        queue.pushed_since_flush = true;
        queue.idle_flushes = 0;
        queue.active = true;

        let key = SortKey {
            ts,
            source,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        queue.pending.push_back(SortedEvent { key, payload });
        self.pending += 1;
    }

    /// Emit every event that no source can still undercut. Returns the
    /// number of events emitted.
    pub fn flush_ready(&mut self, sink: &mut dyn SortedEventSink<S, T>) -> usize {
        self.update_idle_sources();
        let bound = self.ready_bound();
        if bound.is_none() && self.pending > 0 {
            debug!("No active source bounds the window, flushing all pending events");
        }
        self.flush_before(bound, sink)
    }

    /// Emit everything, in order. Called once no more input can arrive.
    pub fn drain(&mut self, sink: &mut dyn SortedEventSink<S, T>) -> usize {
        self.flush_before(None, sink)
    }

    fn update_idle_sources(&mut self) {
        for (source, queue) in self.sources.iter_mut() {
            if queue.pushed_since_flush {
                queue.pushed_since_flush = false;
                queue.idle_flushes = 0;
                continue;
            }
            queue.idle_flushes = queue.idle_flushes.saturating_add(1);
            if let Some(limit) = self.policy.idle_flushes {
                if queue.active && queue.idle_flushes >= limit {
                    debug!(
                        "Source {:?} idle for {} flushes, no longer holding back the window",
                        source, queue.idle_flushes
                    );
                    queue.active = false;
                }
            }
        }
    }

    /// Smallest high-water mark over the sources that still hold back
    /// emission, or `None` if none do.
    fn ready_bound(&self) -> Option<i64> {
        let leader = self.sources.values().filter_map(|q| q.high_water).max();
        self.sources
            .values()
            .filter(|queue| queue.active)
            .filter_map(|queue| queue.high_water)
            .filter(|high_water| match (self.policy.max_lag_ns, leader) {
                (Some(max_lag), Some(leader)) => leader.saturating_sub(*high_water) <= max_lag,
                _ => true,
            })
            .min()
    }

    /// Merge the queue heads with `ts < bound` (everything if `bound` is
    /// `None`). Each queue is already sorted, so a heap of at most one entry
    /// per source is enough.
    fn flush_before(&mut self, bound: Option<i64>, sink: &mut dyn SortedEventSink<S, T>) -> usize {
        let eligible = |key: &SortKey<S>| bound.map_or(true, |bound| key.ts < bound);

        let mut heads = BinaryHeap::with_capacity(self.sources.len());
        for queue in self.sources.values() {
            if let Some(head) = queue.pending.front() {
                if eligible(&head.key) {
                    heads.push(Reverse(head.key));
                }
            }
        }

        let mut flushed = 0;
        while let Some(Reverse(key)) = heads.pop() {
            let Some(queue) = self.sources.get_mut(&key.source) else {
                continue;
            };
            let Some(event) = queue.pending.pop_front() else {
                continue;
            };
            if let Some(next) = queue.pending.front() {
                if eligible(&next.key) {
                    heads.push(Reverse(next.key));
                }
            }
            self.last_emitted_ts = Some(event.key.ts);
            sink.accept(event);
            flushed += 1;
        }

        self.pending -= flushed;
        flushed
    }
}
