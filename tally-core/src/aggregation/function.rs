use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// The closed set of aggregation functions a metric can be configured with.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AggregationFunction {
    Sum,
    Count,
    CountDistinct,
    Average,
    Min,
    Max,
}

impl AggregationFunction {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregationFunction::Sum => "sum",
            AggregationFunction::Count => "count",
            AggregationFunction::CountDistinct => "count_distinct",
            AggregationFunction::Average => "average",
            AggregationFunction::Min => "min",
            AggregationFunction::Max => "max",
        }
    }

    pub fn requires_distinct_dimension(self) -> bool {
        matches!(self, AggregationFunction::CountDistinct)
    }
}

impl std::fmt::Display for AggregationFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running state for one cell.
///
/// Every variant folds and merges associatively, so a late sample never forces a
/// recompute. `Average` keeps `(sum, samples)` and only divides in [`AggregateState::value`],
/// which makes roll-ups across buckets sample-count-weighted.
#[derive(Clone, Debug, PartialEq)]
pub enum AggregateState {
    Sum { sum: f64, samples: u64 },
    Count { samples: u64 },
    CountDistinct { seen: HashSet<String>, samples: u64 },
    Average { sum: f64, samples: u64 },
    Min { min: f64, samples: u64 },
    Max { max: f64, samples: u64 },
}

impl AggregateState {
    pub fn empty(function: AggregationFunction) -> Self {
        match function {
            AggregationFunction::Sum => AggregateState::Sum {
                sum: 0.0,
                samples: 0,
            },
            AggregationFunction::Count => AggregateState::Count { samples: 0 },
            AggregationFunction::CountDistinct => AggregateState::CountDistinct {
                seen: HashSet::new(),
                samples: 0,
            },
            AggregationFunction::Average => AggregateState::Average {
                sum: 0.0,
                samples: 0,
            },
            AggregationFunction::Min => AggregateState::Min {
                min: f64::INFINITY,
                samples: 0,
            },
            AggregationFunction::Max => AggregateState::Max {
                max: f64::NEG_INFINITY,
                samples: 0,
            },
        }
    }

    pub fn function(&self) -> AggregationFunction {
        match self {
            AggregateState::Sum { .. } => AggregationFunction::Sum,
            AggregateState::Count { .. } => AggregationFunction::Count,
            AggregateState::CountDistinct { .. } => AggregationFunction::CountDistinct,
            AggregateState::Average { .. } => AggregationFunction::Average,
            AggregateState::Min { .. } => AggregationFunction::Min,
            AggregateState::Max { .. } => AggregationFunction::Max,
        }
    }

    /// Fold one sample into the state.
    /// `distinct_value` is the sample's value for the metric's distinct dimension, if any.
    pub fn fold(&mut self, value: f64, distinct_value: Option<&str>) {
        match self {
            AggregateState::Sum { sum, samples } | AggregateState::Average { sum, samples } => {
                *sum += value;
                *samples += 1;
            }
            AggregateState::Count { samples } => *samples += 1,
            AggregateState::CountDistinct { seen, samples } => {
                if let Some(distinct_value) = distinct_value
                    && !seen.contains(distinct_value)
                {
                    seen.insert(distinct_value.to_string());
                }
                *samples += 1;
            }
            AggregateState::Min { min, samples } => {
                *min = min.min(value);
                *samples += 1;
            }
            AggregateState::Max { max, samples } => {
                *max = max.max(value);
                *samples += 1;
            }
        }
    }

    /// Merge another state of the same function into this one.
    pub fn merge(&mut self, other: &AggregateState) {
        match (self, other) {
            (
                AggregateState::Sum { sum, samples },
                AggregateState::Sum {
                    sum: other_sum,
                    samples: other_samples,
                },
            )
            | (
                AggregateState::Average { sum, samples },
                AggregateState::Average {
                    sum: other_sum,
                    samples: other_samples,
                },
            ) => {
                *sum += other_sum;
                *samples += other_samples;
            }
            (
                AggregateState::Count { samples },
                AggregateState::Count {
                    samples: other_samples,
                },
            ) => *samples += other_samples,
            (
                AggregateState::CountDistinct { seen, samples },
                AggregateState::CountDistinct {
                    seen: other_seen,
                    samples: other_samples,
                },
            ) => {
                seen.extend(other_seen.iter().cloned());
                *samples += other_samples;
            }
            (
                AggregateState::Min { min, samples },
                AggregateState::Min {
                    min: other_min,
                    samples: other_samples,
                },
            ) => {
                *min = min.min(*other_min);
                *samples += other_samples;
            }
            (
                AggregateState::Max { max, samples },
                AggregateState::Max {
                    max: other_max,
                    samples: other_samples,
                },
            ) => {
                *max = max.max(*other_max);
                *samples += other_samples;
            }
            (this, other) => {
                tracing::error!(
                    "Refusing to merge `{}` state into `{}` state",
                    other.function(),
                    this.function()
                );
            }
        }
    }

    pub fn sample_count(&self) -> u64 {
        match self {
            AggregateState::Sum { samples, .. }
            | AggregateState::Count { samples }
            | AggregateState::CountDistinct { samples, .. }
            | AggregateState::Average { samples, .. }
            | AggregateState::Min { samples, .. }
            | AggregateState::Max { samples, .. } => *samples,
        }
    }

    /// The aggregate value, or `None` if nothing has been folded in yet.
    pub fn value(&self) -> Option<f64> {
        if self.sample_count() == 0 {
            return None;
        }
        Some(match self {
            AggregateState::Sum { sum, .. } => *sum,
            AggregateState::Count { samples } => *samples as f64,
            AggregateState::CountDistinct { seen, .. } => seen.len() as f64,
            AggregateState::Average { sum, samples } => *sum / *samples as f64,
            AggregateState::Min { min, .. } => *min,
            AggregateState::Max { max, .. } => *max,
        })
    }
}
