//! Remote rate-limit feedback.
//!
//! Platforms report their own view of the caller's quota in response headers.
//! We read the common variants into a `ServerHint` so the limiter can follow
//! the server's authoritative view instead of drifting on local accounting alone.

use std::time::Duration;

use chrono::{DateTime, Utc};
use http::{HeaderMap, StatusCode};

const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_AFTER_HEADER: &str = "x-ratelimit-reset-after";
const RESET_HEADER: &str = "x-ratelimit-reset";
const RETRY_AFTER_HEADER: &str = "retry-after";

/// Longest reset a server may ask us to honor.
pub const MAX_RESET_AFTER: Duration = Duration::from_secs(24 * 3_600);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServerHint {
    pub remaining: u64,
    pub reset_after: Duration,
}

impl ServerHint {
    pub fn new(remaining: u64, reset_after: Duration) -> Self {
        Self {
            remaining,
            reset_after,
        }
    }

    /// Derive a hint from a response's status code and headers.
    ///
    /// A `429 Too Many Requests` always means no budget is left. Otherwise
    /// `x-ratelimit-remaining` must be present. The reset is read from
    /// `x-ratelimit-reset-after` (seconds, may be fractional), then
    /// `retry-after` (seconds), then `x-ratelimit-reset` (Unix seconds,
    /// relative to `now`). A missing reset is treated as "the current local
    /// window", i.e. zero. Resets are capped at [`MAX_RESET_AFTER`].
    pub fn from_headers(
        status: StatusCode,
        headers: &HeaderMap,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let remaining = if status == StatusCode::TOO_MANY_REQUESTS {
            0
        } else {
            header_f64(headers, REMAINING_HEADER).map(|v| v.max(0.0).floor() as u64)?
        };

        let reset_after = header_f64(headers, RESET_AFTER_HEADER)
            .or_else(|| header_f64(headers, RETRY_AFTER_HEADER))
            .map(seconds_to_duration)
            .or_else(|| {
                header_f64(headers, RESET_HEADER).map(|reset_epoch_s| {
                    let now_s = now.timestamp_millis() as f64 / 1000.0;
                    seconds_to_duration(reset_epoch_s - now_s)
                })
            })
            .unwrap_or(Duration::ZERO);

        Some(Self {
            remaining,
            reset_after,
        })
    }
}

fn header_f64(headers: &HeaderMap, name: &str) -> Option<f64> {
    let value = headers.get(name)?.to_str().ok()?.trim();
    let parsed = value.parse::<f64>().ok()?;
    parsed.is_finite().then_some(parsed)
}

fn seconds_to_duration(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.max(0.0))
        .map_or(MAX_RESET_AFTER, |duration| duration.min(MAX_RESET_AFTER))
}
