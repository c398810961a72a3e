use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::MAX_SPAN_S;
use crate::error::{Error, ErrorDetails};

/// Width of one aggregation bucket, in whole seconds.
///
/// Written in config and on the command line as `<n><unit>` with unit one of
/// `s`, `m`, `h`, `d` (e.g. `60s`, `5m`, `1h`, `1d`). Buckets are aligned to the Unix epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct Granularity {
    seconds: i64,
}

const UNITS: [(char, i64); 4] = [('d', 86_400), ('h', 3_600), ('m', 60), ('s', 1)];

impl Granularity {
    pub fn from_seconds(seconds: i64) -> Result<Self, Error> {
        if seconds <= 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: format!("granularity must be positive, got {seconds}s"),
            }));
        }
        if seconds > MAX_SPAN_S {
            return Err(Error::new(ErrorDetails::Config {
                message: format!("granularity must be at most {MAX_SPAN_S}s, got {seconds}s"),
            }));
        }
        Ok(Self { seconds })
    }

    pub fn seconds(self) -> i64 {
        self.seconds
    }

    pub fn as_time_delta(self) -> TimeDelta {
        TimeDelta::seconds(self.seconds)
    }

    /// `floor(t / granularity) * granularity`, also for timestamps before the epoch.
    pub fn bucket_start(self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let width_ms = self.seconds * 1_000;
        let start_ms = timestamp.timestamp_millis().div_euclid(width_ms) * width_ms;
        DateTime::from_timestamp_millis(start_ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Saturates at `DateTime::MAX_UTC`.
    pub fn bucket_end(self, bucket_start: DateTime<Utc>) -> DateTime<Utc> {
        bucket_start
            .checked_add_signed(self.as_time_delta())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl FromStr for Granularity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            Error::new(ErrorDetails::Config {
                message: format!(
                    "Invalid granularity `{s}`. Expected a number followed by one of `s`, `m`, `h`, `d` (e.g. `5m`)"
                ),
            })
        };
        let unit = s.chars().last().ok_or_else(invalid)?;
        let multiplier = UNITS
            .iter()
            .find(|(suffix, _)| *suffix == unit)
            .map(|(_, multiplier)| *multiplier)
            .ok_or_else(invalid)?;
        let amount: i64 = s[..s.len() - unit.len_utf8()]
            .parse()
            .map_err(|_| invalid())?;
        let seconds = amount.checked_mul(multiplier).ok_or_else(invalid)?;
        Self::from_seconds(seconds)
    }
}

impl TryFrom<String> for Granularity {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Granularity> for String {
    fn from(granularity: Granularity) -> Self {
        granularity.to_string()
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Largest unit that divides evenly, so `3600s` prints as `1h`
        for (suffix, multiplier) in UNITS {
            if self.seconds % multiplier == 0 {
                return write!(f, "{}{suffix}", self.seconds / multiplier);
            }
        }
        write!(f, "{}s", self.seconds)
    }
}
