//! Valkey-backed quota counters, shared across processes.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use redis::aio::ConnectionLike;
use serde::Deserialize;

use super::ValkeyConnectionInfo;
use crate::db::quota::{AcquireRequest, HintRequest, QuotaStore, StoreDecision};
use crate::error::{Error, ErrorDetails};

// Important: these types must match the response types for the Lua functions in tally-core/src/db/valkey/lua/tally_quota.lua.

/// Response from tally_try_acquire_v1 Lua function
#[derive(Debug, Deserialize)]
struct TryAcquireResponse {
    granted: bool,
    retry_after_ms: i64,
}

/// Response from tally_apply_hint_v1 Lua function
#[derive(Debug, Deserialize)]
struct ApplyHintResponse {
    changed: bool,
}

/// Execute try_acquire against any async Redis-compatible connection.
async fn execute_try_acquire<C: ConnectionLike>(
    conn: &mut C,
    request: &AcquireRequest,
) -> Result<StoreDecision, Error> {
    let AcquireRequest {
        global,
        resource,
        now,
    } = request;

    // Global key first, matching the lock order of the in-memory store
    let result: String = redis::cmd("FCALL")
        .arg("tally_try_acquire_v1")
        .arg(2) // numkeys
        .arg(global.key.as_str())
        .arg(resource.key.as_str())
        .arg(now.timestamp_millis())
        .arg(global.max_requests as i64)
        .arg(global.window.num_milliseconds())
        .arg(resource.max_requests as i64)
        .arg(resource.window.num_milliseconds())
        .query_async(conn)
        .await?;

    let response: TryAcquireResponse = serde_json::from_str(&result).map_err(|e| {
        Error::new(ErrorDetails::ValkeyQuery {
            message: format!("Failed to parse try_acquire response: {e}"),
        })
    })?;

    if response.granted {
        Ok(StoreDecision::Granted)
    } else {
        Ok(StoreDecision::Denied {
            retry_after: TimeDelta::milliseconds(response.retry_after_ms.max(0)),
        })
    }
}

/// Execute apply_hint against any async Redis-compatible connection.
async fn execute_apply_hint<C: ConnectionLike>(
    conn: &mut C,
    request: &HintRequest,
) -> Result<bool, Error> {
    let result: String = redis::cmd("FCALL")
        .arg("tally_apply_hint_v1")
        .arg(1) // numkeys
        .arg(request.counter.key.as_str())
        .arg(request.now.timestamp_millis())
        .arg(request.counter.max_requests as i64)
        .arg(request.counter.window.num_milliseconds())
        .arg(request.remaining as i64)
        .arg(request.resets_at.timestamp_millis())
        .query_async(conn)
        .await?;

    let response: ApplyHintResponse = serde_json::from_str(&result).map_err(|e| {
        Error::new(ErrorDetails::ValkeyQuery {
            message: format!("Failed to parse apply_hint response: {e}"),
        })
    })?;
    Ok(response.changed)
}

#[async_trait]
impl QuotaStore for ValkeyConnectionInfo {
    async fn try_acquire(&self, request: &AcquireRequest) -> Result<StoreDecision, Error> {
        let mut conn = self.require_connection()?;
        execute_try_acquire(&mut conn, request).await
    }

    async fn apply_hint(&self, request: &HintRequest) -> Result<bool, Error> {
        let mut conn = self.require_connection()?;
        execute_apply_hint(&mut conn, request).await
    }

    /// Valkey counters carry a `PEXPIRE` matching their window, so there is nothing to sweep.
    async fn evict_idle(&self, _idle_since: DateTime<Utc>) -> Result<usize, Error> {
        Ok(0)
    }
}
