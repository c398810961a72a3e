use serde::{Deserialize, Serialize};

use crate::aggregation::{AggregationFunction, Granularity};

/// `[metrics.<id>]`
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MetricConfig {
    pub function: AggregationFunction,
    pub granularities: Vec<Granularity>,
    /// The dimension whose distinct values are counted. Required for, and only valid with, `count_distinct`.
    #[serde(default)]
    pub distinct_dimension: Option<String>,
    /// Falls back to `engine.default_cache_ttl_s`.
    #[serde(default)]
    pub cache_ttl_s: Option<u64>,
    /// How long after a bucket's end it is still considered provisional.
    #[serde(default)]
    pub finalization_grace_s: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
    #[serde(default = "default_cache_ttl_s")]
    pub default_cache_ttl_s: u64,
    /// The quota operation class backfill fetches are charged to. Backfill is
    /// only possible when this is set.
    #[serde(default)]
    pub backfill_operation: Option<String>,
    #[serde(default = "default_backfill_timeout_ms")]
    pub backfill_timeout_ms: u64,
    #[serde(default = "default_backfill_max_attempts")]
    pub backfill_max_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
            default_cache_ttl_s: default_cache_ttl_s(),
            backfill_operation: None,
            backfill_timeout_ms: default_backfill_timeout_ms(),
            backfill_max_attempts: default_backfill_max_attempts(),
        }
    }
}

fn default_cache_capacity() -> u64 {
    10_000
}

fn default_cache_ttl_s() -> u64 {
    300
}

fn default_backfill_timeout_ms() -> u64 {
    5_000
}

fn default_backfill_max_attempts() -> u32 {
    3
}
