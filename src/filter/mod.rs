pub mod parse;
pub mod pattern;
pub mod retention;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use prometheus::Histogram;
use tracing::debug;

use self::pattern::PatternStorage;

/// Match timing is observed on every Nth received line to keep the
/// observation cost off the common path.
const MATCH_TIMER_SAMPLE: i64 = 10;

/// A parsed wire point together with the patterns it matched.
///
/// Created by the line processor, classified once by the batcher, and
/// either dropped by dedup or handed to the sink inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedPoint {
    /// Dotted metric name.
    pub name: String,
    /// Prefixes of the patterns that matched `name`, in traversal order.
    pub patterns: Vec<String>,
    pub value: f64,
    /// Producer timestamp, seconds since the Unix epoch.
    pub timestamp: i64,
    /// `timestamp` rounded half-up to the retention grid.
    pub retention_timestamp: i64,
    /// Retention granularity in seconds.
    pub retention: i64,
}

/// Snapshot of the hot-path counters taken by the folding task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub total: i64,
    pub valid: i64,
    pub matched: i64,
}

/// Lock-free counters incremented on the hot path and swapped to zero
/// once per second when folded into the metrics registry.
#[derive(Debug, Default)]
pub struct ProcessingCounters {
    total: AtomicI64,
    valid: AtomicI64,
    matched: AtomicI64,
}

impl ProcessingCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the received-line counter, returning the new count.
    fn mark_total(&self) -> i64 {
        self.total.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn mark_valid(&self) {
        self.valid.fetch_add(1, Ordering::Relaxed);
    }

    fn mark_matched(&self) {
        self.matched.fetch_add(1, Ordering::Relaxed);
    }

    /// Swap all counters to zero, returning the accumulated values.
    pub fn take(&self) -> CounterSnapshot {
        CounterSnapshot {
            total: self.total.swap(0, Ordering::Relaxed),
            valid: self.valid.swap(0, Ordering::Relaxed),
            matched: self.matched.swap(0, Ordering::Relaxed),
        }
    }
}

/// Stateless (per line) processor shared by all connection readers.
///
/// Runs the parse and pattern-match stages and accounts every line in
/// the hot-path counters. Returns a point only for lines that are valid
/// and match at least one pattern.
pub struct LineProcessor {
    patterns: Arc<PatternStorage>,
    counters: Arc<ProcessingCounters>,
    match_timer: Histogram,
    log_parse_errors: bool,
}

impl LineProcessor {
    pub fn new(
        patterns: Arc<PatternStorage>,
        counters: Arc<ProcessingCounters>,
        match_timer: Histogram,
        log_parse_errors: bool,
    ) -> Self {
        Self {
            patterns,
            counters,
            match_timer,
            log_parse_errors,
        }
    }

    /// Process one raw line (newline already stripped).
    pub fn process(&self, line: &[u8]) -> Option<MatchedPoint> {
        let count = self.counters.mark_total();

        let (name, value, timestamp) = match parse::parse_line(line) {
            Ok(parsed) => parsed,
            Err(err) => {
                if self.log_parse_errors {
                    debug!(error = %err, "dropping unparseable line");
                }
                return None;
            }
        };

        self.counters.mark_valid();

        let started = Instant::now();
        let index = self.patterns.current();
        let matched = index.matches(name);
        if count % MATCH_TIMER_SAMPLE == 0 {
            self.match_timer.observe(started.elapsed().as_secs_f64());
        }

        if matched.is_empty() {
            return None;
        }
        self.counters.mark_matched();

        Some(MatchedPoint {
            name: name.to_string(),
            patterns: matched.iter().map(|prefix| (*prefix).to_string()).collect(),
            value,
            timestamp,
            retention_timestamp: timestamp,
            retention: retention::DEFAULT_RETENTION,
        })
    }
}
