//! Quota limiting for outbound calls to remote platform APIs.
//!
//! Every call is checked against two fixed-window counters: one global budget
//! shared by all operation classes, and one per `(operation class, resource)`.
//! A call is granted only if both have budget, and then both are incremented.
//!
//! Fixed windows allow up to `2 * max_requests` calls across a window
//! boundary. Callers that need a stricter bound can swap in a different
//! `QuotaStore` without changing the `try_acquire` contract.

use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::clock::{MAX_SPAN_S, max_span};
use crate::error::{Error, ErrorDetails};

pub mod fixed_window;
pub mod quota_limiter;
pub mod server_hint;

pub use quota_limiter::QuotaLimiter;
pub use server_hint::ServerHint;

/// Budget for one operation class (or for the global counter).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QuotaRule {
    pub max_requests: u64,
    #[serde(serialize_with = "serialize_time_delta_ms")]
    pub window: TimeDelta,
}

impl QuotaRule {
    pub fn new(max_requests: u64, window: TimeDelta) -> Result<Self, Error> {
        if max_requests == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "quota rules must allow at least one request per window".to_string(),
            }));
        }
        if window > max_span() {
            return Err(Error::new(ErrorDetails::Config {
                message: format!("quota windows must be at most {MAX_SPAN_S}s"),
            }));
        }
        if window <= TimeDelta::zero() {
            return Err(Error::new(ErrorDetails::Config {
                message: "quota windows must be positive".to_string(),
            }));
        }
        Ok(Self {
            max_requests,
            window,
        })
    }
}

fn serialize_time_delta_ms<S>(delta: &TimeDelta, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_i64(delta.num_milliseconds())
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuotaInterval {
    Second,
    Minute,
    Hour,
    Day,
}

impl QuotaInterval {
    pub fn to_duration(self) -> TimeDelta {
        match self {
            QuotaInterval::Second => TimeDelta::seconds(1),
            QuotaInterval::Minute => TimeDelta::minutes(1),
            QuotaInterval::Hour => TimeDelta::hours(1),
            QuotaInterval::Day => TimeDelta::days(1),
        }
    }
}

/// Type that lists the different counters a key can refer to.
/// The serialized form is the storage key, so it must stay stable across releases.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
enum QuotaScope<'a> {
    Global,
    Operation {
        operation: &'a str,
        resource: &'a str,
    },
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Serialize)]
pub struct QuotaKey(pub String);

impl QuotaKey {
    pub fn new(key: String) -> Self {
        QuotaKey(key)
    }

    pub fn global() -> Result<Self, Error> {
        Self::from_scope(&QuotaScope::Global)
    }

    pub fn for_resource(operation: &str, resource: &str) -> Result<Self, Error> {
        Self::from_scope(&QuotaScope::Operation {
            operation,
            resource,
        })
    }

    fn from_scope(scope: &QuotaScope<'_>) -> Result<Self, Error> {
        Ok(QuotaKey(format!(
            "tally:quota:{}",
            serde_json::to_string(scope)?
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of asking the limiter for permission to make one call.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted,
    Denied { retry_after: Duration },
}

impl AcquireOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AcquireOutcome::Granted)
    }

    fn as_label(&self) -> &'static str {
        match self {
            AcquireOutcome::Granted => "granted",
            AcquireOutcome::Denied { .. } => "denied",
        }
    }
}

/// Converts a (possibly negative) chrono delta into a std duration, clamping at zero.
pub(crate) fn to_std_duration(delta: TimeDelta) -> Duration {
    delta.to_std().unwrap_or(Duration::ZERO)
}
