use chrono::{DateTime, Utc};
use serde::Serialize;

use super::granularity::Granularity;
use crate::error::{Error, ErrorDetails};

/// A half-open time range `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct TimeRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, Error> {
        if start >= end {
            return Err(Error::new(ErrorDetails::InvalidQuery {
                message: format!("time range start `{start}` must be before end `{end}`"),
            }));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.start <= timestamp && timestamp < self.end
    }

    pub fn intersects(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The range widened back to the start of the bucket holding `start`,
    /// i.e. the span of buckets a query over this range reads.
    #[must_use]
    pub fn aligned_to(&self, granularity: Granularity) -> TimeRange {
        TimeRange {
            start: granularity.bucket_start(self.start),
            end: self.end,
        }
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}
