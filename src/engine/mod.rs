//! Component wiring and lifecycle.
//!
//! The engine owns every long-lived component and spawns the background
//! tasks: listener, batcher, pattern refresher, counter folding, and
//! heartbeat. There are no process globals; tests build the components
//! directly.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::export::Metrics;
use crate::filter::pattern::{PatternIndex, PatternStorage};
use crate::filter::retention::{RetentionClassifier, RetentionPolicy};
use crate::filter::{LineProcessor, ProcessingCounters};
use crate::ingest::LineListener;
use crate::pipeline::Batcher;
use crate::sink::{Heartbeat, PatternSource, RedisStore};

/// Orchestrates the filter pipeline: listener, batcher, refresher,
/// counter folding, and heartbeat.
pub struct Engine {
    cfg: Config,
    metrics: Arc<Metrics>,
    counters: Arc<ProcessingCounters>,
    patterns: Arc<PatternStorage>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Creates a new engine, initializing the metrics registry.
    pub fn new(cfg: Config) -> Result<Self> {
        let metrics = Arc::new(Metrics::new().context("creating metrics registry")?);

        Ok(Self {
            cfg,
            metrics,
            counters: Arc::new(ProcessingCounters::new()),
            patterns: Arc::new(PatternStorage::new()),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// Start all components and begin accepting traffic.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Retention rules; a malformed file is a startup error.
        let retention_text = std::fs::read_to_string(&self.cfg.retention_config)
            .with_context(|| format!("reading retention config {}", self.cfg.retention_config))?;
        let policy = RetentionPolicy::parse(&retention_text)
            .with_context(|| format!("parsing retention config {}", self.cfg.retention_config))?;
        info!(rules = policy.rule_count(), "retention rules loaded");

        // 2. Store connection.
        let store = RedisStore::connect(&self.cfg.redis).await?;

        // 3. Prime the pattern index before accepting traffic; the
        // refresher keeps it current from here on.
        match store.fetch_patterns().await {
            Ok(fetched) => match PatternIndex::build(&fetched) {
                Ok(index) => {
                    info!(patterns = index.pattern_count(), "pattern index primed");
                    self.patterns.install(index);
                }
                Err(e) => warn!(error = %e, "initial pattern compile failed, starting empty"),
            },
            Err(e) => warn!(error = %e, "initial pattern fetch failed, starting empty"),
        }

        // 4. Metrics exposition.
        if !self.cfg.metrics.addr.is_empty() {
            self.metrics
                .serve(&self.cfg.metrics.addr)
                .await
                .context("starting metrics server")?;
        }

        // 5. Pipeline channel and batcher.
        let (tx, rx) = mpsc::channel(self.cfg.channel_capacity);

        let batcher = Batcher::new(
            RetentionClassifier::new(policy),
            store.clone(),
            self.metrics.save_duration.clone(),
            self.cfg.flush_interval,
            self.cfg.batch_size,
        );
        self.tasks.push(tokio::spawn(batcher.run(rx)));

        // 6. Ingest listener; a bind failure is a startup error.
        let processor = Arc::new(LineProcessor::new(
            Arc::clone(&self.patterns),
            Arc::clone(&self.counters),
            self.metrics.match_duration.clone(),
            self.cfg.log_parse_errors,
        ));
        let listener = LineListener::bind(
            &self.cfg.listen,
            processor,
            tx,
            self.cancel.child_token(),
        )
        .await?;
        self.tasks.push(tokio::spawn(listener.run()));

        // 7. Background maintenance tasks.
        self.spawn_refresher(store.clone());
        self.spawn_counter_folding();
        self.spawn_heartbeat(store);

        info!("engine fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    ///
    /// Cancelling closes the listener; readers drain their connections,
    /// the channel closes, and the batcher flushes once before exiting.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "task join failed");
            }
        }

        self.metrics.stop();
    }

    /// Spawn the pattern refresher: fetch, rebuild, and atomically
    /// install the trie on a fixed cadence. The live index survives
    /// fetch and compile failures.
    fn spawn_refresher<P: PatternSource + 'static>(&mut self, source: P) {
        let patterns = Arc::clone(&self.patterns);
        let buildtree_timer = self.metrics.buildtree_duration.clone();
        let cancel = self.cancel.clone();
        let interval = self.cfg.refresh_interval;

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let fetched = match source.fetch_patterns().await {
                            Ok(fetched) => fetched,
                            Err(e) => {
                                warn!(error = %e, "pattern fetch failed, keeping previous index");
                                continue;
                            }
                        };

                        let started = Instant::now();
                        match PatternIndex::build(&fetched) {
                            Ok(index) => {
                                patterns.install(index);
                                buildtree_timer.observe(started.elapsed().as_secs_f64());
                            }
                            Err(e) => {
                                warn!(error = %e, "pattern compile failed, keeping previous index");
                            }
                        }
                    }
                }
            }
        }));
    }

    /// Spawn the counter folding task: swap the hot-path atomics to zero
    /// and add them to the registry once per interval.
    fn spawn_counter_folding(&mut self) {
        let counters = Arc::clone(&self.counters);
        let metrics = Arc::clone(&self.metrics);
        let cancel = self.cancel.clone();
        let interval = self.cfg.counter_flush_interval;

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        // Fold whatever accumulated since the last tick.
                        metrics.fold(counters.take());
                        return;
                    }
                    _ = ticker.tick() => {
                        metrics.fold(counters.take());
                    }
                }
            }
        }));
    }

    /// Spawn the heartbeat task: bump the store's liveness counter on
    /// every tick where ingest throughput advanced.
    fn spawn_heartbeat<H: Heartbeat + 'static>(&mut self, store: H) {
        let metrics = Arc::clone(&self.metrics);
        let cancel = self.cancel.clone();
        let interval = self.cfg.heartbeat_interval;

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_total = metrics.received_total.get();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let total = metrics.received_total.get();
                        if total == last_total {
                            continue;
                        }
                        match store.bump_heartbeat().await {
                            Ok(()) => last_total = total,
                            Err(e) => warn!(error = %e, "heartbeat update failed"),
                        }
                    }
                }
            }
        }));
    }
}
