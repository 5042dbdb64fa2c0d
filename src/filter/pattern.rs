//! Subscription pattern trie over dotted metric names.
//!
//! Patterns are compiled into a prefix trie keyed by name segment. Plain
//! segments and the single-segment wildcard `*` are compared by 32-bit
//! hash; segments with embedded wildcards or brace alternations carry
//! pre-compiled glob matchers. The live index is replaced wholesale by
//! the refresher and read lock-free on the hot path.

use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};
use globset::{Glob, GlobMatcher};
use thiserror::Error;
use xxhash_rust::xxh32::xxh32;

/// Seed for all segment hashes.
const HASH_SEED: u32 = 0;

/// Sentinel hash for nodes matched through globs instead of hash equality.
const NO_HASH: u32 = 0;

/// Errors that can occur while compiling a pattern set.
#[derive(Error, Debug)]
pub enum PatternError {
    #[error("invalid glob segment {segment:?} in pattern {pattern:?}")]
    BadGlob {
        pattern: String,
        segment: String,
        #[source]
        source: globset::Error,
    },
}

/// One trie node, owning its children.
struct PatternNode {
    /// Literal text of the segment this node was created from.
    part: String,
    /// Hash of `part` when it is literal or exactly `*`; `NO_HASH` otherwise.
    hash: u32,
    /// Full dotted pattern from the root down to this node.
    prefix: String,
    children: Vec<PatternNode>,
    /// Compiled globs for wildcard segments; brace alternations are
    /// expanded into one glob per alternative.
    inner_parts: Vec<GlobMatcher>,
}

impl PatternNode {
    fn root() -> Self {
        Self {
            part: String::new(),
            hash: NO_HASH,
            prefix: String::new(),
            children: Vec::new(),
            inner_parts: Vec::new(),
        }
    }

    fn new(pattern: &str, parent_prefix: &str, part: &str) -> Result<Self, PatternError> {
        let prefix = if parent_prefix.is_empty() {
            part.to_string()
        } else {
            format!("{parent_prefix}.{part}")
        };

        let mut hash = NO_HASH;
        let mut inner_parts = Vec::new();

        if part == "*" || !part.contains(['{', '*', '?']) {
            hash = xxh32(part.as_bytes(), HASH_SEED);
        } else if part.contains('{') && part.contains('}') {
            // Expand `pre{a,b}suf` into one glob per alternative.
            let (glob_prefix, rest) = part.split_once('{').unwrap_or((part, ""));
            let (alternatives, glob_suffix) = rest.split_once('}').unwrap_or((rest, ""));
            for alternative in alternatives.split(',') {
                let glob = format!("{glob_prefix}{alternative}{glob_suffix}");
                inner_parts.push(compile_glob(pattern, &glob)?);
            }
        } else {
            inner_parts.push(compile_glob(pattern, part)?);
        }

        Ok(Self {
            part: part.to_string(),
            hash,
            prefix,
            children: Vec::new(),
            inner_parts,
        })
    }
}

fn compile_glob(pattern: &str, segment: &str) -> Result<GlobMatcher, PatternError> {
    Glob::new(segment)
        .map(|glob| glob.compile_matcher())
        .map_err(|source| PatternError::BadGlob {
            pattern: pattern.to_string(),
            segment: segment.to_string(),
            source,
        })
}

/// Immutable pattern trie answering `matches` on the hot path.
pub struct PatternIndex {
    root: PatternNode,
    star_hash: u32,
    pattern_count: usize,
}

impl Default for PatternIndex {
    fn default() -> Self {
        Self {
            root: PatternNode::root(),
            star_hash: xxh32(b"*", HASH_SEED),
            pattern_count: 0,
        }
    }
}

impl PatternIndex {
    /// Compile a pattern set into a trie. Patterns sharing a dotted
    /// prefix share trie nodes up to the point of divergence.
    pub fn build(patterns: &[String]) -> Result<Self, PatternError> {
        let mut index = Self::default();

        for pattern in patterns {
            let mut node = &mut index.root;
            for part in pattern.split('.') {
                let position = match node.children.iter().position(|child| child.part == part) {
                    Some(existing) => existing,
                    None => {
                        let child = PatternNode::new(pattern, &node.prefix, part)?;
                        node.children.push(child);
                        node.children.len() - 1
                    }
                };
                node = &mut node.children[position];
            }
        }

        index.pattern_count = patterns.len();
        Ok(index)
    }

    /// Number of patterns the index was built from.
    pub fn pattern_count(&self) -> usize {
        self.pattern_count
    }

    /// Return the prefixes of all patterns matching `name`, in traversal
    /// order. An empty segment in `name` yields no match, as does an
    /// empty index.
    pub fn matches<'a>(&'a self, name: &str) -> Vec<&'a str> {
        if self.root.children.is_empty() {
            return Vec::new();
        }

        let mut current: Vec<&PatternNode> = vec![&self.root];
        let mut next: Vec<&PatternNode> = Vec::with_capacity(64);

        for segment in name.split('.') {
            if segment.is_empty() {
                return Vec::new();
            }

            let hash = xxh32(segment.as_bytes(), HASH_SEED);
            next.clear();

            for node in &current {
                for child in &node.children {
                    let matched = child.hash == self.star_hash
                        || child.hash == hash
                        || child
                            .inner_parts
                            .iter()
                            .any(|glob| glob.is_match(segment));
                    if matched {
                        next.push(child);
                    }
                }
            }

            if next.is_empty() {
                return Vec::new();
            }
            std::mem::swap(&mut current, &mut next);
        }

        current
            .iter()
            .filter(|node| node.children.is_empty())
            .map(|node| node.prefix.as_str())
            .collect()
    }
}

/// Holder of the live [`PatternIndex`], replaced atomically on refresh.
///
/// Readers load a guard and keep matching against a consistent tree even
/// while a replacement is installed; the superseded tree is reclaimed
/// once the last in-flight match drops its guard.
pub struct PatternStorage {
    index: ArcSwap<PatternIndex>,
}

impl Default for PatternStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternStorage {
    /// Create storage holding an empty index; every match misses until
    /// the first refresh installs a real tree.
    pub fn new() -> Self {
        Self {
            index: ArcSwap::from_pointee(PatternIndex::default()),
        }
    }

    /// Atomically install a freshly built index.
    pub fn install(&self, index: PatternIndex) {
        self.index.store(Arc::new(index));
    }

    /// Load the current index for matching.
    pub fn current(&self) -> Guard<Arc<PatternIndex>> {
        self.index.load()
    }
}
