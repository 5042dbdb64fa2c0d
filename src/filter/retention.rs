//! Retention classification.
//!
//! A retention rules file maps metric-name regexes to a storage
//! granularity in seconds. Rules apply first-match-wins in file order;
//! names matching no rule fall back to 60 seconds. A per-metric cache
//! avoids re-scanning the rule list for hot metrics.

use std::collections::HashMap;

use regex::Regex;
use thiserror::Error;

use crate::filter::MatchedPoint;

/// Retention applied when no rule matches.
pub const DEFAULT_RETENTION: i64 = 60;

/// A cached retention entry stays fresh for this many seconds.
const CACHE_FRESH_SECS: i64 = 60;

/// Errors that can occur while parsing the retention rules file.
#[derive(Error, Debug)]
pub enum RetentionConfigError {
    #[error("invalid regex {pattern:?}")]
    BadRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("missing ':' in retentions value {value:?}")]
    MissingHistory { value: String },

    #[error("invalid granularity {value:?}")]
    BadGranularity { value: String },

    #[error("incomplete rule at end of file (pattern and retentions lines must pair up)")]
    IncompleteRule,
}

#[derive(Debug)]
struct RetentionRule {
    pattern: Regex,
    retention: i64,
}

/// Ordered retention rule list, built once at startup and read-only after.
#[derive(Debug)]
pub struct RetentionPolicy {
    rules: Vec<RetentionRule>,
}

impl RetentionPolicy {
    /// Parse the rules file text.
    ///
    /// The file is a sequence of paragraphs, each containing a
    /// `pattern = <regex>` line and a `retentions = <granularity>:<history>[,...]`
    /// line in either order. Comment lines (`#`) and lines without exactly
    /// one `=` are ignored. Only the first granularity of the retentions
    /// list is kept; the history halves are discarded.
    pub fn parse(text: &str) -> Result<Self, RetentionConfigError> {
        let mut rules = Vec::new();
        let mut pending_pattern: Option<Regex> = None;
        let mut pending_retention: Option<i64> = None;

        for line in text.lines() {
            let line = line.trim();
            if line.starts_with('#') || line.matches('=').count() != 1 {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };

            match key.trim() {
                "pattern" => {
                    let pattern = value.trim();
                    pending_pattern =
                        Some(
                            Regex::new(pattern).map_err(|source| RetentionConfigError::BadRegex {
                                pattern: pattern.to_string(),
                                source,
                            })?,
                        );
                }
                "retentions" => {
                    pending_retention = Some(parse_retention_spec(value.trim())?);
                }
                _ => {}
            }

            match (pending_pattern.take(), pending_retention.take()) {
                (Some(pattern), Some(retention)) => {
                    rules.push(RetentionRule { pattern, retention });
                }
                (pattern, retention) => {
                    pending_pattern = pattern;
                    pending_retention = retention;
                }
            }
        }

        if pending_pattern.is_some() || pending_retention.is_some() {
            return Err(RetentionConfigError::IncompleteRule);
        }

        Ok(Self { rules })
    }

    /// Number of compiled rules.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// First matching rule's retention, or the default.
    fn lookup(&self, name: &str) -> i64 {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(name))
            .map_or(DEFAULT_RETENTION, |rule| rule.retention)
    }
}

/// Take the granularity half of the first `granularity:history` pair.
fn parse_retention_spec(value: &str) -> Result<i64, RetentionConfigError> {
    let first = value.split(',').next().unwrap_or(value);
    let Some((granularity, _history)) = first.split_once(':') else {
        return Err(RetentionConfigError::MissingHistory {
            value: value.to_string(),
        });
    };
    granularity_seconds(granularity.trim())
}

/// Convert a granularity like `10`, `1m`, or `2h` to seconds.
fn granularity_seconds(raw: &str) -> Result<i64, RetentionConfigError> {
    let bad = || RetentionConfigError::BadGranularity {
        value: raw.to_string(),
    };

    if let Ok(seconds) = raw.parse::<i64>() {
        return if seconds > 0 { Ok(seconds) } else { Err(bad()) };
    }

    const SUFFIXES: [(&str, i64); 6] = [
        ("s", 1),
        ("m", 60),
        ("h", 60 * 60),
        ("d", 60 * 60 * 24),
        ("w", 60 * 60 * 24 * 7),
        ("y", 60 * 60 * 24 * 365),
    ];

    for (suffix, multiplier) in SUFFIXES {
        if let Some(digits) = raw.strip_suffix(suffix) {
            let count: i64 = digits.parse().map_err(|_| bad())?;
            if count <= 0 {
                return Err(bad());
            }
            return Ok(count * multiplier);
        }
    }

    Err(bad())
}

/// Round `timestamp` half-up to the nearest multiple of `retention`.
pub fn round_to_retention(timestamp: i64, retention: i64) -> i64 {
    (timestamp + retention / 2) / retention * retention
}

struct RetentionCacheItem {
    value: i64,
    timestamp: i64,
}

/// Stateful classifier owned by the batcher task.
///
/// The per-metric cache grows with metric cardinality and has no
/// eviction; see DESIGN.md.
pub struct RetentionClassifier {
    policy: RetentionPolicy,
    cache: HashMap<String, RetentionCacheItem>,
}

impl RetentionClassifier {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            policy,
            cache: HashMap::new(),
        }
    }

    /// Assign the point's retention and rounded retention timestamp.
    pub fn classify(&mut self, point: &mut MatchedPoint) {
        let retention = match self.cache.get(point.name.as_str()) {
            Some(item) if item.timestamp + CACHE_FRESH_SECS >= point.timestamp => item.value,
            _ => {
                let value = self.policy.lookup(&point.name);
                self.cache.insert(
                    point.name.clone(),
                    RetentionCacheItem {
                        value,
                        timestamp: point.timestamp,
                    },
                );
                value
            }
        };

        point.retention = retention;
        point.retention_timestamp = round_to_retention(point.timestamp, retention);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"
# comment line and the blank line above are skipped

[simple]
pattern = ^Simple\.
retentions = 60:43200

[suffixed]
pattern = suf$
retentions = 20m:8d,1h:30d

[default]
pattern = .*
retentions = 120:86400
"#;

    fn point(name: &str, timestamp: i64) -> MatchedPoint {
        MatchedPoint {
            name: name.to_string(),
            patterns: vec!["ignored".to_string()],
            value: 1.0,
            timestamp,
            retention_timestamp: timestamp,
            retention: DEFAULT_RETENTION,
        }
    }

    #[test]
    fn test_parses_rules_in_order() {
        let policy = RetentionPolicy::parse(RULES).expect("valid rules");
        assert_eq!(policy.rule_count(), 3);
        assert_eq!(policy.lookup("Simple.matching.pattern"), 60);
        assert_eq!(policy.lookup("Bracket.pronesuf"), 1200);
        assert_eq!(policy.lookup("Star.single.x"), 120);
    }

    #[test]
    fn test_default_without_catchall_rule() {
        let policy =
            RetentionPolicy::parse("pattern = ^Only\\.\nretentions = 10:60\n").expect("valid");
        assert_eq!(policy.lookup("unmatched.metric"), DEFAULT_RETENTION);
    }

    #[test]
    fn test_reversed_paragraph_order() {
        let policy =
            RetentionPolicy::parse("retentions = 30:120\npattern = ^Rev\\.\n").expect("valid");
        assert_eq!(policy.lookup("Rev.metric"), 30);
    }

    #[test]
    fn test_rejects_bad_regex() {
        let err = RetentionPolicy::parse("pattern = [unclosed\nretentions = 60:60\n").unwrap_err();
        assert!(matches!(err, RetentionConfigError::BadRegex { .. }));
    }

    #[test]
    fn test_rejects_missing_history() {
        let err = RetentionPolicy::parse("pattern = .*\nretentions = 60\n").unwrap_err();
        assert!(matches!(err, RetentionConfigError::MissingHistory { .. }));
    }

    #[test]
    fn test_rejects_dangling_pattern() {
        let err = RetentionPolicy::parse("pattern = .*\n").unwrap_err();
        assert!(matches!(err, RetentionConfigError::IncompleteRule));
    }

    #[test]
    fn test_granularity_suffixes() {
        assert_eq!(granularity_seconds("10").expect("plain"), 10);
        assert_eq!(granularity_seconds("10s").expect("seconds"), 10);
        assert_eq!(granularity_seconds("5m").expect("minutes"), 300);
        assert_eq!(granularity_seconds("2h").expect("hours"), 7200);
        assert_eq!(granularity_seconds("1d").expect("days"), 86400);
        assert_eq!(granularity_seconds("1w").expect("weeks"), 604800);
        assert_eq!(granularity_seconds("1y").expect("years"), 31536000);

        assert!(granularity_seconds("").is_err());
        assert!(granularity_seconds("0").is_err());
        assert!(granularity_seconds("-5").is_err());
        assert!(granularity_seconds("5x").is_err());
        assert!(granularity_seconds("m").is_err());
    }

    #[test]
    fn test_rounding_half_up() {
        assert_eq!(round_to_retention(1234567890, 60), 1234567920);
        assert_eq!(round_to_retention(1234567890, 1200), 1234568400);
        assert_eq!(round_to_retention(1234567890, 120), 1234567920);

        // A multiple of the retention is a fixed point.
        assert_eq!(round_to_retention(1234567920, 60), 1234567920);

        // Rounded value lands on the grid within half a step.
        for timestamp in 1000..1120 {
            let rounded = round_to_retention(timestamp, 60);
            assert_eq!(rounded % 60, 0);
            assert!((rounded - timestamp).abs() <= 30);
        }
    }

    #[test]
    fn test_classify_sets_retention_and_rounds() {
        let policy = RetentionPolicy::parse(RULES).expect("valid rules");
        let mut classifier = RetentionClassifier::new(policy);

        let mut simple = point("Simple.matching.pattern", 1234567890);
        classifier.classify(&mut simple);
        assert_eq!(simple.retention, 60);
        assert_eq!(simple.retention_timestamp, 1234567920);

        let mut suffixed = point("Bracket.pronesuf", 1234567890);
        classifier.classify(&mut suffixed);
        assert_eq!(suffixed.retention, 1200);
        assert_eq!(suffixed.retention_timestamp, 1234568400);

        let mut fallback = point("Star.single.x", 1234567890);
        classifier.classify(&mut fallback);
        assert_eq!(fallback.retention, 120);
        assert_eq!(fallback.retention_timestamp, 1234567920);
    }

    #[test]
    fn test_classify_uses_fresh_cache_entry() {
        // Policy is consulted once; the cached value is reused while fresh.
        let policy = RetentionPolicy::parse("pattern = .*\nretentions = 10:60\n").expect("valid");
        let mut classifier = RetentionClassifier::new(policy);

        let mut first = point("cache.me", 1000);
        classifier.classify(&mut first);
        assert_eq!(first.retention, 10);

        // Swap in an empty policy; a fresh cache entry masks the change.
        classifier.policy = RetentionPolicy::parse("").expect("empty");

        let mut second = point("cache.me", 1060);
        classifier.classify(&mut second);
        assert_eq!(second.retention, 10);

        // Past the freshness window the rules are scanned again.
        let mut third = point("cache.me", 1061);
        classifier.classify(&mut third);
        assert_eq!(third.retention, DEFAULT_RETENTION);
    }
}
