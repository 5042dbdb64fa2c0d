pub mod redis;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::filter::MatchedPoint;

pub use self::redis::RedisStore;

/// Persists matched points and publishes match events.
pub trait Sink: Send + Sync {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Persist one batch. Each point is recorded under its series key
    /// scored by the retention timestamp, its retention is stored, and
    /// one event is published per matched pattern.
    fn save_batch(
        &self,
        batch: &[MatchedPoint],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Source of truth for the subscription pattern set, polled by the
/// refresher.
pub trait PatternSource: Send + Sync {
    fn fetch_patterns(&self) -> impl std::future::Future<Output = Result<Vec<String>>> + Send;
}

/// Liveness counter bumped while ingest throughput is non-zero.
pub trait Heartbeat: Send + Sync {
    fn bump_heartbeat(&self) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Message published on the event channel for each (metric, pattern)
/// match in a saved batch.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventMessage<'a> {
    pub metric: &'a str,
    pub pattern: &'a str,
}
