use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

#[cfg(test)]
use mockall::automock;

use crate::error::Error;
use crate::rate_limiting::{QuotaKey, QuotaRule};

/// Backing store for quota counters.
///
/// Implementations must make `try_acquire` all-or-nothing across both counters:
/// either both are incremented, or neither is touched.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn try_acquire(&self, request: &AcquireRequest) -> Result<StoreDecision, Error>;

    /// Overwrite the counter's state with the server's view, only if that view is tighter.
    /// Returns `true` if local state changed.
    async fn apply_hint(&self, request: &HintRequest) -> Result<bool, Error>;

    /// Drop counters that have not been touched since `idle_since`.
    /// Returns the number of counters removed.
    async fn evict_idle(&self, idle_since: DateTime<Utc>) -> Result<usize, Error>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct CounterSpec {
    pub key: QuotaKey,
    pub max_requests: u64,
    pub window: TimeDelta,
}

impl CounterSpec {
    pub fn new(key: QuotaKey, rule: &QuotaRule) -> Self {
        Self {
            key,
            max_requests: rule.max_requests,
            window: rule.window,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AcquireRequest {
    pub global: CounterSpec,
    pub resource: CounterSpec,
    pub now: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreDecision {
    Granted,
    Denied { retry_after: TimeDelta },
}

#[derive(Clone, Debug, PartialEq)]
pub struct HintRequest {
    pub counter: CounterSpec,
    pub remaining: u64,
    pub resets_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
}
