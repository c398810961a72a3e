//! Process-local quota counters.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::db::quota::{AcquireRequest, CounterSpec, HintRequest, QuotaStore, StoreDecision};
use crate::error::{Error, ErrorDetails};
use crate::rate_limiting::QuotaKey;
use crate::rate_limiting::fixed_window::FixedWindowCounter;

/// Counters live in a `DashMap`, each behind its own mutex.
///
/// Acquisition locks the global counter first and the per-resource counter
/// second. Every caller uses that order, so two acquisitions can never
/// deadlock, and the check-then-increment on both counters is one critical section.
#[derive(Debug, Default)]
pub struct InMemoryQuotaStore {
    counters: DashMap<QuotaKey, Arc<Mutex<FixedWindowCounter>>>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, spec: &CounterSpec, now: DateTime<Utc>) -> Arc<Mutex<FixedWindowCounter>> {
        // Clone the Arc out so the shard lock is released before we lock the counter
        self.counters
            .entry(spec.key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(FixedWindowCounter::new(now, spec.window))))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn count_for(&self, key: &QuotaKey) -> Option<u64> {
        let counter = self.counters.get(key)?.clone();
        lock(&counter).ok().map(|c| c.count())
    }
}

fn lock(counter: &Mutex<FixedWindowCounter>) -> Result<MutexGuard<'_, FixedWindowCounter>, Error> {
    counter.lock().map_err(|e| {
        Error::new(ErrorDetails::QuotaStore {
            message: format!("quota counter lock poisoned: {e}"),
        })
    })
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn try_acquire(&self, request: &AcquireRequest) -> Result<StoreDecision, Error> {
        let AcquireRequest {
            global,
            resource,
            now,
        } = request;
        let global_counter = self.counter(global, *now);
        let resource_counter = self.counter(resource, *now);

        let mut global_state = lock(&global_counter)?;
        let mut resource_state = lock(&resource_counter)?;
        global_state.roll(*now, global.window);
        resource_state.roll(*now, resource.window);

        let global_ok = global_state.has_budget(global.max_requests);
        let resource_ok = resource_state.has_budget(resource.max_requests);
        if global_ok && resource_ok {
            global_state.increment();
            resource_state.increment();
            return Ok(StoreDecision::Granted);
        }

        // Wait for every exhausted window, not just the first one to reset
        let mut retry_after = chrono::TimeDelta::zero();
        if !global_ok {
            retry_after = retry_after.max(global_state.retry_after(*now));
        }
        if !resource_ok {
            retry_after = retry_after.max(resource_state.retry_after(*now));
        }
        Ok(StoreDecision::Denied { retry_after })
    }

    async fn apply_hint(&self, request: &HintRequest) -> Result<bool, Error> {
        let counter = self.counter(&request.counter, request.now);
        let mut state = lock(&counter)?;
        state.roll(request.now, request.counter.window);
        Ok(state.tighten(
            request.counter.max_requests,
            request.remaining,
            request.resets_at,
        ))
    }

    async fn evict_idle(&self, idle_since: DateTime<Utc>) -> Result<usize, Error> {
        let before = self.counters.len();
        self.counters.retain(|_, counter| match counter.lock() {
            Ok(state) => state.last_access() >= idle_since,
            // Poisoned counters are useless; drop them
            Err(_) => false,
        });
        Ok(before.saturating_sub(self.counters.len()))
    }
}
