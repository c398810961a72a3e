use std::sync::Arc;

use blake3::Hash;
use chrono::{DateTime, TimeDelta, Utc};
use moka::sync::Cache;
use serde::Serialize;

use super::bucket::{BucketSeries, RankedEntry, Summary};
use super::granularity::Granularity;
use super::range::TimeRange;
use super::sample::Dimensions;
use crate::error::{Error, ErrorDetails};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn get_long_key(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<Hash> for CacheKey {
    fn from(hash: Hash) -> Self {
        Self(hash.into())
    }
}

/// Everything that determines a query's answer.
/// Filters are a `BTreeMap`, so the serialized form is independent of the order callers built them in.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryDescriptor<'a> {
    Series {
        metric_id: &'a str,
        range: &'a TimeRange,
        granularity: Granularity,
        filters: &'a Dimensions,
    },
    TopN {
        metric_id: &'a str,
        range: &'a TimeRange,
        dimension: &'a str,
        n: usize,
    },
    Summary {
        metric_id: &'a str,
        range: &'a TimeRange,
        filters: &'a Dimensions,
    },
}

impl QueryDescriptor<'_> {
    pub fn metric_id(&self) -> &str {
        match self {
            QueryDescriptor::Series { metric_id, .. }
            | QueryDescriptor::TopN { metric_id, .. }
            | QueryDescriptor::Summary { metric_id, .. } => metric_id,
        }
    }

    pub fn range(&self) -> &TimeRange {
        match self {
            QueryDescriptor::Series { range, .. }
            | QueryDescriptor::TopN { range, .. }
            | QueryDescriptor::Summary { range, .. } => range,
        }
    }

    pub fn get_cache_key(&self) -> Result<CacheKey, Error> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.metric_id().as_bytes());
        hasher.update(&[0]); // null byte after metric id to ensure data is prefix-free
        let descriptor_json = serde_json::to_string(self).map_err(|e| {
            Error::new(ErrorDetails::Serialization {
                message: format!("Failed to serialize query descriptor: {e}"),
            })
        })?;
        hasher.update(descriptor_json.as_bytes());
        Ok(hasher.finalize().into())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CachedPayload {
    Series(BucketSeries),
    TopN(Vec<RankedEntry>),
    Summary(Summary),
}

#[derive(Debug)]
pub struct CacheEntry {
    pub metric_id: String,
    pub range: TimeRange,
    pub payload: CachedPayload,
    pub stored_at: DateTime<Utc>,
    pub ttl: TimeDelta,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.stored_at + self.ttl
    }
}

/// Bounded cache of computed query results.
///
/// Expiry is checked against the injected clock on every read rather than left to
/// moka's own timers, so tests can drive TTLs deterministically.
// This can be `Clone` since cloning a moka `Cache` just creates a reference to the same cache
#[derive(Clone)]
pub struct QueryCache {
    entries: Cache<CacheKey, Arc<CacheEntry>>,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("entry_count", &self.entries.entry_count())
            .finish()
    }
}

impl QueryCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: Cache::builder().max_capacity(capacity).build(),
        }
    }

    /// Returns the entry only while `now < stored_at + ttl`; expired entries are evicted.
    pub fn get(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<Arc<CacheEntry>> {
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            self.entries.invalidate(key);
            return None;
        }
        Some(entry)
    }

    /// Concurrent writers for one key compute the same value, so the last one wins.
    pub fn insert(&self, key: CacheKey, entry: CacheEntry) {
        self.entries.insert(key, Arc::new(entry));
    }

    /// Remove every entry for `metric_id` whose range intersects `range`.
    pub fn invalidate(&self, metric_id: &str, range: &TimeRange) -> usize {
        let stale: Vec<Arc<CacheKey>> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.metric_id == metric_id && entry.range.intersects(range))
            .map(|(key, _)| key)
            .collect();
        for key in &stale {
            self.entries.invalidate(key.as_ref());
        }
        stale.len()
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }
}
