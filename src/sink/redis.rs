//! Redis-backed store.
//!
//! Writes batches through one pipelined request: a sorted-set member per
//! point scored by the retention timestamp, the retention seconds under
//! the metric's retention key, and one published event per matched
//! pattern. Also serves the pattern set to the refresher and the
//! heartbeat counter.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::config::RedisConfig;
use crate::filter::MatchedPoint;
use crate::sink::{EventMessage, Heartbeat, PatternSource, Sink};

/// Sorted set holding `"<timestamp> <value>"` members per metric.
const METRIC_DATA_PREFIX: &str = "metric-data:";
/// String key holding the retention seconds per metric.
const METRIC_RETENTION_PREFIX: &str = "metric-retention:";
/// Set of subscription patterns maintained by the alerting side.
const PATTERN_SET_KEY: &str = "pattern-list";
/// Liveness counter read by the alerting side's self-state checks.
const HEARTBEAT_KEY: &str = "selfstate:metrics-heartbeat";
/// Pub/sub channel for match events.
const EVENT_CHANNEL: &str = "metric-event";

/// Key for a metric's data points.
pub fn metric_data_key(metric: &str) -> String {
    format!("{METRIC_DATA_PREFIX}{metric}")
}

/// Key for a metric's retention seconds.
pub fn metric_retention_key(metric: &str) -> String {
    format!("{METRIC_RETENTION_PREFIX}{metric}")
}

/// Multiplexed Redis client shared by the batcher, refresher, and
/// heartbeat tasks.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    /// Connect to the configured endpoint and verify connectivity.
    pub async fn connect(cfg: &RedisConfig) -> Result<Self> {
        let url = if cfg.db > 0 {
            format!("redis://{}/{}", cfg.endpoint, cfg.db)
        } else {
            format!("redis://{}", cfg.endpoint)
        };

        let client = redis::Client::open(url.as_str())
            .with_context(|| format!("opening redis client for {}", cfg.endpoint))?;

        let mut connection = ConnectionManager::new(client)
            .await
            .with_context(|| format!("connecting to redis at {}", cfg.endpoint))?;

        redis::cmd("PING")
            .query_async::<()>(&mut connection)
            .await
            .context("pinging redis")?;

        tracing::info!(endpoint = %cfg.endpoint, db = cfg.db, "redis store connected");

        Ok(Self { connection })
    }
}

impl Sink for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn save_batch(&self, batch: &[MatchedPoint]) -> Result<()> {
        let mut pipe = redis::pipe();

        for point in batch {
            let member = format!("{} {}", point.timestamp, point.value);
            pipe.zadd(metric_data_key(&point.name), member, point.retention_timestamp)
                .ignore();
            pipe.set(metric_retention_key(&point.name), point.retention)
                .ignore();

            for pattern in &point.patterns {
                let payload = serde_json::to_string(&EventMessage {
                    metric: &point.name,
                    pattern,
                })
                .context("encoding match event")?;
                pipe.publish(EVENT_CHANNEL, payload).ignore();
            }
        }

        let mut connection = self.connection.clone();
        pipe.query_async::<()>(&mut connection)
            .await
            .context("writing batch to redis")?;

        Ok(())
    }
}

impl PatternSource for RedisStore {
    async fn fetch_patterns(&self) -> Result<Vec<String>> {
        let mut connection = self.connection.clone();
        let patterns: Vec<String> = connection
            .smembers(PATTERN_SET_KEY)
            .await
            .context("fetching pattern set from redis")?;
        Ok(patterns)
    }
}

impl Heartbeat for RedisStore {
    async fn bump_heartbeat(&self) -> Result<()> {
        let mut connection = self.connection.clone();
        connection
            .incr::<_, _, i64>(HEARTBEAT_KEY, 1)
            .await
            .context("incrementing heartbeat counter")?;
        Ok(())
    }
}
