use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Dimension name to value, ordered so that equal sets hash and compare equal.
pub type Dimensions = BTreeMap<String, String>;

/// A single raw event fact.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MetricSample {
    pub metric_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub dimensions: Dimensions,
    #[serde(default = "default_value")]
    pub value: f64,
}

fn default_value() -> f64 {
    1.0
}

impl MetricSample {
    pub fn new(metric_id: impl Into<String>, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            metric_id: metric_id.into(),
            timestamp,
            dimensions: Dimensions::new(),
            value,
        }
    }

    #[must_use]
    pub fn with_dimension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(name.into(), value.into());
        self
    }

    pub fn dimension(&self, name: &str) -> Option<&str> {
        self.dimensions.get(name).map(String::as_str)
    }
}

/// True if every `(name, value)` pair in `filter` is present in `dimensions`.
pub fn matches_filter(dimensions: &Dimensions, filter: &Dimensions) -> bool {
    filter
        .iter()
        .all(|(name, value)| dimensions.get(name) == Some(value))
}
