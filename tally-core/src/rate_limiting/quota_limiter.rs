//! The quota limiter is the primary interface for rate limiting operations.
//!
//! # Failure behavior
//!
//! This implementation uses **fail-closed** semantics: if the counter store is
//! unavailable, `try_acquire` reports `Denied` with the configured store retry
//! hint rather than letting traffic through to the remote API. The only error
//! it returns is for an operation class that was never configured.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use metrics::counter;

use super::{AcquireOutcome, QuotaKey, QuotaRule, ServerHint, to_std_duration};
use crate::clock::Clock;
use crate::config::{QuotaConfig, seconds_setting};
use crate::db::quota::{AcquireRequest, CounterSpec, HintRequest, QuotaStore, StoreDecision};
use crate::error::{Error, ErrorDetails};

pub struct QuotaLimiter {
    global: QuotaRule,
    operations: HashMap<String, QuotaRule>,
    store: Arc<dyn QuotaStore>,
    clock: Arc<dyn Clock>,
    store_failure_retry: Duration,
    idle_eviction: TimeDelta,
}

impl std::fmt::Debug for QuotaLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLimiter")
            .field("global", &self.global)
            .field("operations", &self.operations)
            .field("store", &"<dyn QuotaStore>")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl QuotaLimiter {
    pub fn new(
        global: QuotaRule,
        operations: HashMap<String, QuotaRule>,
        store: Arc<dyn QuotaStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            global,
            operations,
            store,
            clock,
            store_failure_retry: Duration::from_secs(1),
            idle_eviction: TimeDelta::hours(1),
        }
    }

    pub fn from_config(
        config: &QuotaConfig,
        store: Arc<dyn QuotaStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, Error> {
        let global = config.global.to_rule()?;
        let operations = config
            .operations
            .iter()
            .map(|(name, rule)| Ok((name.clone(), rule.to_rule()?)))
            .collect::<Result<HashMap<_, _>, Error>>()?;
        Ok(Self {
            global,
            operations,
            store,
            clock,
            store_failure_retry: Duration::from_millis(config.max_request_ms),
            idle_eviction: seconds_setting("quota.idle_eviction_s", config.idle_eviction_s)?,
        })
    }

    pub fn has_operation(&self, operation: &str) -> bool {
        self.operations.contains_key(operation)
    }

    fn rule_for(&self, operation: &str) -> Result<&QuotaRule, Error> {
        self.operations.get(operation).ok_or_else(|| {
            Error::new(ErrorDetails::UnknownOperation {
                operation: operation.to_string(),
            })
        })
    }

    /// Check the global budget and the `(operation, resource_id)` budget.
    /// Both counters are incremented on `Granted`; neither is touched on `Denied`.
    #[tracing::instrument(skip(self), fields(otel.name = "quota_try_acquire"))]
    pub async fn try_acquire(
        &self,
        operation: &str,
        resource_id: &str,
    ) -> Result<AcquireOutcome, Error> {
        let rule = self.rule_for(operation)?;
        let request = AcquireRequest {
            global: CounterSpec::new(QuotaKey::global()?, &self.global),
            resource: CounterSpec::new(QuotaKey::for_resource(operation, resource_id)?, rule),
            now: self.clock.now(),
        };

        let outcome = match self.store.try_acquire(&request).await {
            Ok(StoreDecision::Granted) => AcquireOutcome::Granted,
            Ok(StoreDecision::Denied { retry_after }) => AcquireOutcome::Denied {
                retry_after: to_std_duration(retry_after),
            },
            Err(e) => {
                tracing::warn!(
                    "Quota store unavailable, denying `{operation}` for `{resource_id}`: {e}"
                );
                AcquireOutcome::Denied {
                    retry_after: self.store_failure_retry,
                }
            }
        };

        counter!(
            "tally_quota_decisions_total",
            "operation" => operation.to_string(),
            "outcome" => outcome.as_label(),
        )
        .increment(1);
        if let AcquireOutcome::Denied { retry_after } = outcome {
            tracing::debug!(
                retry_after_ms = retry_after.as_millis() as u64,
                "Quota denied"
            );
        }
        Ok(outcome)
    }

    /// Keep calling `try_acquire`, sleeping for the suggested `retry_after`,
    /// until granted or until the next wait would exceed `max_wait`.
    pub async fn acquire_with_wait(
        &self,
        operation: &str,
        resource_id: &str,
        max_wait: Duration,
    ) -> Result<AcquireOutcome, Error> {
        let mut waited = Duration::ZERO;
        loop {
            let outcome = self.try_acquire(operation, resource_id).await?;
            let AcquireOutcome::Denied { retry_after } = outcome else {
                return Ok(outcome);
            };
            if retry_after.is_zero() || waited + retry_after > max_wait {
                return Ok(outcome);
            }
            tokio::time::sleep(retry_after).await;
            waited += retry_after;
        }
    }

    /// Adopt the remote system's view of the global budget.
    /// Only ever tightens the local view, and applying the same hint twice is a no-op.
    #[tracing::instrument(skip(self), fields(otel.name = "quota_update_from_server_hint"))]
    pub async fn update_from_server_hint(
        &self,
        remaining: u64,
        reset_after: Duration,
    ) -> Result<(), Error> {
        let now = self.clock.now();
        let reset_after = TimeDelta::from_std(reset_after).map_err(|e| {
            Error::new(ErrorDetails::InternalError {
                message: format!("server reset hint out of range: {e}"),
            })
        })?;
        let request = HintRequest {
            counter: CounterSpec::new(QuotaKey::global()?, &self.global),
            remaining,
            resets_at: now.checked_add_signed(reset_after).ok_or_else(|| {
                Error::new(ErrorDetails::InternalError {
                    message: format!("server reset hint of {reset_after} overflows the clock"),
                })
            })?,
            now,
        };
        if self.store.apply_hint(&request).await? {
            tracing::debug!("Tightened global quota from server hint");
        }
        Ok(())
    }

    pub async fn apply_server_hint(&self, hint: &ServerHint) -> Result<(), Error> {
        self.update_from_server_hint(hint.remaining, hint.reset_after)
            .await
    }

    /// Housekeeping: drop per-resource counters that have been idle for the configured period.
    pub async fn evict_idle(&self) -> Result<usize, Error> {
        let removed = self
            .store
            .evict_idle(self.clock.now() - self.idle_eviction)
            .await?;
        if removed > 0 {
            tracing::debug!("Evicted {removed} idle quota counters");
        }
        Ok(removed)
    }
}
