//! Batching, deduplication, and sink dispatch.
//!
//! A single batcher task owns the in-flight batch, the dedup cache, and
//! the retention classifier, so none of them needs locking. Points
//! arrive over a bounded channel whose capacity is the backpressure
//! mechanism: a slow sink throttles the connection readers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use prometheus::Histogram;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::filter::retention::RetentionClassifier;
use crate::filter::MatchedPoint;
use crate::sink::Sink;

/// Last accepted `(retention_timestamp, value)` per metric name.
struct MetricCacheItem {
    retention_timestamp: i64,
    value: f64,
}

/// The batcher stage between the connection readers and the sink.
///
/// Flushes when the in-flight batch reaches `batch_size` or on every
/// `flush_interval` tick, whichever comes first. Delivery is
/// at-most-once: a failed sink write drops the batch and the pipeline
/// continues.
pub struct Batcher<S> {
    classifier: RetentionClassifier,
    sink: S,
    save_timer: Histogram,
    flush_interval: Duration,
    batch_size: usize,
    /// In-flight batch keyed by metric name; the latest point wins.
    batch: HashMap<String, MatchedPoint>,
    /// Dedup cache; grows with metric cardinality, see DESIGN.md.
    last_seen: HashMap<String, MetricCacheItem>,
}

impl<S: Sink> Batcher<S> {
    pub fn new(
        classifier: RetentionClassifier,
        sink: S,
        save_timer: Histogram,
        flush_interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            classifier,
            sink,
            save_timer,
            flush_interval,
            batch_size,
            batch: HashMap::new(),
            last_seen: HashMap::new(),
        }
    }

    /// Classify the point, then either drop it as a no-op repeat or
    /// place it into the in-flight batch. Returns whether it was kept.
    fn accept(&mut self, mut point: MatchedPoint) -> bool {
        self.classifier.classify(&mut point);

        match self.last_seen.get(point.name.as_str()) {
            Some(previous)
                if previous.retention_timestamp == point.retention_timestamp
                    && previous.value == point.value =>
            {
                false
            }
            _ => {
                self.last_seen.insert(
                    point.name.clone(),
                    MetricCacheItem {
                        retention_timestamp: point.retention_timestamp,
                        value: point.value,
                    },
                );
                self.batch.insert(point.name.clone(), point);
                true
            }
        }
    }

    /// Hand the in-flight batch to the sink and start a fresh one.
    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let points: Vec<MatchedPoint> = self.batch.drain().map(|(_, point)| point).collect();

        let started = Instant::now();
        if let Err(e) = self.sink.save_batch(&points).await {
            warn!(
                sink = self.sink.name(),
                error = %e,
                dropped = points.len(),
                "sink write failed, dropping batch",
            );
        }
        self.save_timer.observe(started.elapsed().as_secs_f64());
    }

    /// Run until the channel closes, then drain, flush once, and exit.
    pub async fn run(mut self, mut rx: mpsc::Receiver<MatchedPoint>) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Consume the immediate first tick so a timeout flush can only
        // fire a full interval after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(point) => {
                        if self.accept(point) && self.batch.len() >= self.batch_size {
                            self.flush().await;
                        }
                    }
                    None => {
                        // All readers are gone; final flush and exit.
                        self.flush().await;
                        debug!("batcher drained, exiting");
                        return;
                    }
                },
                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }
    }
}
