use chrono::{DateTime, Utc};
use serde::Serialize;

use super::granularity::Granularity;
use super::range::TimeRange;
use super::sample::Dimensions;

/// One aggregated bucket as returned to callers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Bucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub value: f64,
    pub sample_count: u64,
    /// The bucket may still receive samples; its value can change.
    pub provisional: bool,
}

/// The answer to a series query: non-empty buckets, oldest first.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BucketSeries {
    pub metric_id: String,
    pub granularity: Granularity,
    pub range: TimeRange,
    pub filters: Dimensions,
    pub buckets: Vec<Bucket>,
}

impl BucketSeries {
    pub fn is_provisional(&self) -> bool {
        self.buckets.iter().any(|b| b.provisional)
    }
}

/// A ranked entry in a top-N result.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RankedEntry {
    pub dimension_value: String,
    pub value: f64,
    pub sample_count: u64,
}

/// A whole-range aggregate for one dimension filter.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Summary {
    pub metric_id: String,
    pub range: TimeRange,
    pub filters: Dimensions,
    /// `None` if no samples matched.
    pub value: Option<f64>,
    pub sample_count: u64,
}
