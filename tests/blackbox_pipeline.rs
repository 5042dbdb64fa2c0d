use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use prometheus::{Histogram, HistogramOpts};
use tokio::sync::mpsc;

use siftd::filter::pattern::{PatternIndex, PatternStorage};
use siftd::filter::retention::{RetentionClassifier, RetentionPolicy};
use siftd::filter::{LineProcessor, MatchedPoint, ProcessingCounters};
use siftd::pipeline::Batcher;
use siftd::sink::Sink;

const PATTERNS: &[&str] = &[
    "Simple.matching.pattern",
    "Star.single.*",
    "Bracket.{one,two}.pattern",
    "Bracket.pr{one,two}suf",
    "Complex.*{one,two,three}suf*.pattern",
];

const RETENTIONS: &str = r#"
# ordered first-match-wins rules
pattern = ^Simple\.
retentions = 60:43200

pattern = suf$
retentions = 20m:8d

pattern = .*
retentions = 120:86400
"#;

/// Sink double capturing every flushed batch.
#[derive(Clone, Default)]
struct CapturingSink {
    batches: Arc<Mutex<Vec<Vec<MatchedPoint>>>>,
    fail: bool,
}

impl CapturingSink {
    fn points(&self) -> Vec<MatchedPoint> {
        self.batches
            .lock()
            .expect("not poisoned")
            .iter()
            .flatten()
            .cloned()
            .collect()
    }
}

impl Sink for CapturingSink {
    fn name(&self) -> &str {
        "capturing"
    }

    async fn save_batch(&self, batch: &[MatchedPoint]) -> anyhow::Result<()> {
        if self.fail {
            bail!("injected sink failure");
        }
        self.batches
            .lock()
            .expect("not poisoned")
            .push(batch.to_vec());
        Ok(())
    }
}

fn timer(name: &str) -> Histogram {
    Histogram::with_opts(HistogramOpts::new(name.to_string(), "test timer")).expect("histogram")
}

fn pattern_storage(patterns: &[&str]) -> Arc<PatternStorage> {
    let storage = Arc::new(PatternStorage::new());
    let owned: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
    storage.install(PatternIndex::build(&owned).expect("patterns compile"));
    storage
}

fn processor(storage: Arc<PatternStorage>, counters: Arc<ProcessingCounters>) -> LineProcessor {
    LineProcessor::new(
        storage,
        counters,
        timer("blackbox_match_duration_seconds"),
        false,
    )
}

fn batcher(sink: CapturingSink) -> Batcher<CapturingSink> {
    let policy = RetentionPolicy::parse(RETENTIONS).expect("valid retention rules");
    Batcher::new(
        RetentionClassifier::new(policy),
        sink,
        timer("blackbox_save_duration_seconds"),
        Duration::from_secs(1),
        10,
    )
}

/// Runs raw wire lines through parse, match, classify, dedup, and flush,
/// returning every point the sink saw.
async fn run_lines(lines: &[&str], sink: CapturingSink) -> Vec<MatchedPoint> {
    let counters = Arc::new(ProcessingCounters::new());
    let processor = processor(pattern_storage(PATTERNS), Arc::clone(&counters));

    let (tx, rx) = mpsc::channel(10);
    let batcher_task = tokio::spawn(batcher(sink.clone()).run(rx));

    for line in lines {
        if let Some(point) = processor.process(line.as_bytes()) {
            tx.send(point).await.expect("batcher alive");
        }
    }

    drop(tx);
    batcher_task.await.expect("batcher exits");

    sink.points()
}

#[test]
fn rejected_lines_count_only_as_received() {
    let counters = Arc::new(ProcessingCounters::new());
    let processor = processor(pattern_storage(PATTERNS), Arc::clone(&counters));

    let rejected: &[&[u8]] = &[
        b"a b",
        b"a b c d",
        b"a 12g5 1234567890",
        b"\x00x.y 1 1",
        b"a 1 0",
        b" a 1 1",
        b"",
    ];
    for line in rejected {
        assert!(processor.process(line).is_none(), "accepted {line:?}");
    }

    let snapshot = counters.take();
    assert_eq!(snapshot.total, rejected.len() as i64);
    assert_eq!(snapshot.valid, 0);
    assert_eq!(snapshot.matched, 0);
}

#[test]
fn match_results_follow_segment_rules() {
    let storage = pattern_storage(PATTERNS);
    let index = storage.current();

    assert_eq!(
        index.matches("Simple.matching.pattern"),
        vec!["Simple.matching.pattern"]
    );
    assert_eq!(index.matches("Star.single.x"), vec!["Star.single.*"]);
    assert_eq!(
        index.matches("Bracket.one.pattern"),
        vec!["Bracket.{one,two}.pattern"]
    );
    assert!(index.matches("Bracket.three.pattern").is_empty());
    assert_eq!(
        index.matches("Complex.prefixonesuffix.pattern"),
        vec!["Complex.*{one,two,three}suf*.pattern"]
    );
    assert!(index.matches("Star.nothing").is_empty());
}

#[tokio::test]
async fn pipeline_classifies_and_persists_matched_points() {
    let sink = CapturingSink::default();
    let saved = run_lines(
        &[
            "Simple.matching.pattern 1.23e2 1234567890",
            "Bracket.pronesuf .5 1234567890",
            "Star.single.x -3 1234567890",
        ],
        sink,
    )
    .await;

    assert_eq!(saved.len(), 3);

    let by_name = |name: &str| {
        saved
            .iter()
            .find(|point| point.name == name)
            .unwrap_or_else(|| panic!("{name} not saved"))
    };

    let simple = by_name("Simple.matching.pattern");
    assert_eq!(simple.value, 123.0);
    assert_eq!(simple.retention, 60);
    assert_eq!(simple.retention_timestamp, 1234567920);
    assert_eq!(simple.patterns, vec!["Simple.matching.pattern"]);

    let suffixed = by_name("Bracket.pronesuf");
    assert_eq!(suffixed.value, 0.5);
    assert_eq!(suffixed.patterns, vec!["Bracket.pr{one,two}suf"]);
    assert_eq!(suffixed.retention, 1200);
    assert_eq!(suffixed.retention_timestamp, 1234568400);

    let fallback = by_name("Star.single.x");
    assert_eq!(fallback.value, -3.0);
    assert_eq!(fallback.retention, 120);
    assert_eq!(fallback.retention_timestamp, 1234567920);

    // Classifier invariants hold for everything that reached the sink.
    for point in &saved {
        assert_eq!(point.retention_timestamp % point.retention, 0);
        assert!((point.retention_timestamp - point.timestamp).abs() <= point.retention / 2);
    }
}

#[tokio::test]
async fn identical_resubmission_reaches_sink_once() {
    let sink = CapturingSink::default();
    let saved = run_lines(
        &[
            "Star.single.m 1.0 1000",
            "Star.single.m 1.0 1000",
            // Same retention window (120s grid), same value: still a no-op.
            "Star.single.m 1.0 1010",
        ],
        sink,
    )
    .await;

    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].name, "Star.single.m");
    assert_eq!(saved[0].value, 1.0);
}

#[tokio::test]
async fn changed_value_survives_dedup() {
    let sink = CapturingSink::default();
    let saved = run_lines(
        &["Star.single.m 1.0 1000", "Star.single.m 2.0 1300"],
        sink,
    )
    .await;

    // Both points land in the same run; latest-wins coalescing keeps the
    // newer one, dedup must not swallow the changed value.
    assert!(!saved.is_empty());
    assert!(saved.iter().any(|point| point.value == 2.0));
}

#[tokio::test]
async fn sink_failure_does_not_stop_the_pipeline() {
    let sink = CapturingSink {
        fail: true,
        ..Default::default()
    };
    // The run completes; failed batches are dropped silently.
    let saved = run_lines(&["Star.single.m 1.0 1000"], sink).await;
    assert!(saved.is_empty());
}

#[test]
fn refresh_replaces_results_wholesale() {
    let storage = pattern_storage(&["generation.one.*"]);
    assert_eq!(
        storage.current().matches("generation.one.metric"),
        vec!["generation.one.*"]
    );

    // Install a disjoint generation; the old results disappear with it.
    storage.install(
        PatternIndex::build(&["generation.two.*".to_string()]).expect("patterns compile"),
    );
    assert!(storage.current().matches("generation.one.metric").is_empty());
    assert_eq!(
        storage.current().matches("generation.two.metric"),
        vec!["generation.two.*"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refresh_under_concurrent_matching_never_tears() {
    // One task swaps generations while this task matches continuously;
    // every result must be consistent with exactly one generation.
    let storage = pattern_storage(&["gen.a.*"]);
    let swapper_storage = Arc::clone(&storage);

    let swapper = tokio::spawn(async move {
        for _ in 0..200 {
            swapper_storage.install(
                PatternIndex::build(&["gen.a.*".to_string()]).expect("patterns compile"),
            );
            swapper_storage.install(
                PatternIndex::build(&["gen.b.*".to_string()]).expect("patterns compile"),
            );
            tokio::task::yield_now().await;
        }
    });

    for _ in 0..2000 {
        let index = storage.current();
        let a = index.matches("gen.a.x");
        let b = index.matches("gen.b.x");
        // A torn tree would answer both or neither.
        assert!(
            a.len() + b.len() == 1,
            "inconsistent generation: a={a:?} b={b:?}"
        );
    }

    swapper.await.expect("swapper exits");
}
