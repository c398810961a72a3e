//! Reconstructing missing history from a remote system.
//!
//! Every page fetch first goes through the quota limiter under the configured
//! backfill operation class (resource = metric id), and is bounded by a timeout.
//! Failures are retried up to `max_attempts` times per page before the whole
//! range is reported as unavailable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use super::range::TimeRange;
use super::sample::MetricSample;
use crate::error::{Error, ErrorDetails};
use crate::rate_limiting::{AcquireOutcome, QuotaLimiter, ServerHint};

/// One page of raw history, already translated into samples by the caller.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BackfillPage {
    pub samples: Vec<MetricSample>,
    /// `None` on the last page.
    pub next_cursor: Option<String>,
    /// The remote API's own rate-limit feedback for this page, if it sent any.
    pub server_hint: Option<ServerHint>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackfillSource: Send + Sync {
    async fn fetch_page(
        &self,
        metric_id: &str,
        range: &TimeRange,
        cursor: Option<String>,
    ) -> Result<BackfillPage, Error>;
}

/// What happened to missing history while answering a query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackfillStatus {
    /// Local buckets already cover the range, or no backfill source is attached.
    NotNeeded,
    Completed { pages: u32 },
    /// The result holds only locally available buckets.
    Unavailable { reason: String },
}

impl BackfillStatus {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, BackfillStatus::Unavailable { .. })
    }

    /// Combine the outcome of backfilling several gaps for one query.
    #[must_use]
    pub fn combine(self, other: BackfillStatus) -> BackfillStatus {
        match (self, other) {
            (unavailable @ BackfillStatus::Unavailable { .. }, _)
            | (_, unavailable @ BackfillStatus::Unavailable { .. }) => unavailable,
            (BackfillStatus::Completed { pages: a }, BackfillStatus::Completed { pages: b }) => {
                BackfillStatus::Completed { pages: a + b }
            }
            (completed @ BackfillStatus::Completed { .. }, BackfillStatus::NotNeeded)
            | (BackfillStatus::NotNeeded, completed @ BackfillStatus::Completed { .. }) => completed,
            (BackfillStatus::NotNeeded, BackfillStatus::NotNeeded) => BackfillStatus::NotNeeded,
        }
    }

    pub(crate) fn as_label(&self) -> &'static str {
        match self {
            BackfillStatus::NotNeeded => "not_needed",
            BackfillStatus::Completed { .. } => "completed",
            BackfillStatus::Unavailable { .. } => "unavailable",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackfillSettings {
    pub operation: String,
    pub page_timeout: Duration,
    pub max_attempts: u32,
}

pub struct Backfiller {
    source: Arc<dyn BackfillSource>,
    limiter: Arc<QuotaLimiter>,
    settings: BackfillSettings,
    // One backfill per metric at a time, so two queries never ingest the same gap twice
    in_flight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl std::fmt::Debug for Backfiller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backfiller")
            .field("source", &"<dyn BackfillSource>")
            .field("limiter", &self.limiter)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Samples fetched for one range.
#[derive(Debug, Default)]
pub struct FetchedRange {
    pub samples: Vec<MetricSample>,
    pub pages: u32,
}

impl Backfiller {
    pub fn new(
        source: Arc<dyn BackfillSource>,
        limiter: Arc<QuotaLimiter>,
        settings: BackfillSettings,
    ) -> Result<Self, Error> {
        if !limiter.has_operation(&settings.operation) {
            return Err(Error::new(ErrorDetails::Config {
                message: format!(
                    "backfill operation `{}` is not a configured quota operation",
                    settings.operation
                ),
            }));
        }
        if settings.max_attempts == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "backfill_max_attempts must be at least 1".to_string(),
            }));
        }
        Ok(Self {
            source,
            limiter,
            settings,
            in_flight: DashMap::new(),
        })
    }

    pub fn lock_for(&self, metric_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.in_flight
            .entry(metric_id.to_string())
            .or_default()
            .clone()
    }

    /// Fetch every page for `range`. Samples for other metrics or outside the range are dropped.
    #[tracing::instrument(skip(self, range), fields(otel.name = "backfill_fetch_range", range = %range))]
    pub async fn fetch_range(
        &self,
        metric_id: &str,
        range: &TimeRange,
    ) -> Result<FetchedRange, Error> {
        let mut fetched = FetchedRange::default();
        let mut cursor = None;
        loop {
            let page = self.fetch_page(metric_id, range, cursor).await?;
            fetched.pages += 1;
            if let Some(hint) = &page.server_hint {
                // The page itself succeeded; a store hiccup here must not discard it
                if let Err(e) = self.limiter.apply_server_hint(hint).await {
                    tracing::warn!("Failed to apply server rate-limit hint: {e}");
                }
            }
            fetched.samples.extend(
                page.samples
                    .into_iter()
                    .filter(|s| s.metric_id == metric_id && range.contains(s.timestamp)),
            );
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(fetched),
            }
        }
    }

    async fn fetch_page(
        &self,
        metric_id: &str,
        range: &TimeRange,
        cursor: Option<String>,
    ) -> Result<BackfillPage, Error> {
        let timeout = self.settings.page_timeout;
        let mut last_error = None;
        for attempt in 1..=self.settings.max_attempts {
            let outcome = self
                .limiter
                .acquire_with_wait(&self.settings.operation, metric_id, timeout)
                .await?;
            if let AcquireOutcome::Denied { retry_after } = outcome {
                return Err(Error::new(ErrorDetails::BackfillUnavailable {
                    metric_id: metric_id.to_string(),
                    message: format!(
                        "quota for `{}` exhausted, next slot in {}ms",
                        self.settings.operation,
                        retry_after.as_millis()
                    ),
                }));
            }

            match tokio::time::timeout(
                timeout,
                self.source.fetch_page(metric_id, range, cursor.clone()),
            )
            .await
            {
                Ok(Ok(page)) => return Ok(page),
                Ok(Err(e)) => {
                    tracing::warn!(attempt, "Backfill page for `{metric_id}` failed: {e}");
                    last_error = Some(Error::new_without_logging(
                        ErrorDetails::BackfillUnavailable {
                            metric_id: metric_id.to_string(),
                            message: e.to_string(),
                        },
                    ));
                }
                Err(_) => {
                    tracing::warn!(attempt, "Backfill page for `{metric_id}` timed out");
                    last_error = Some(Error::new_without_logging(ErrorDetails::BackfillTimeout {
                        metric_id: metric_id.to_string(),
                        timeout,
                    }));
                }
            }
        }
        let error = last_error.unwrap_or_else(|| {
            Error::new_without_logging(ErrorDetails::BackfillUnavailable {
                metric_id: metric_id.to_string(),
                message: "no attempts were made".to_string(),
            })
        });
        error.log();
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{DateTime, TimeDelta, Utc};

    use super::*;
    use crate::clock::MockClock;
    use crate::db::InMemoryQuotaStore;
    use crate::rate_limiting::QuotaRule;

    fn at_s(seconds: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(seconds)
    }

    fn limiter(per_second: u64) -> Arc<QuotaLimiter> {
        let mut operations = HashMap::new();
        operations.insert(
            "list_records".to_string(),
            QuotaRule::new(per_second, TimeDelta::seconds(1)).unwrap(),
        );
        Arc::new(QuotaLimiter::new(
            QuotaRule::new(100, TimeDelta::seconds(1)).unwrap(),
            operations,
            Arc::new(InMemoryQuotaStore::new()),
            Arc::new(MockClock::at_epoch()),
        ))
    }

    fn settings(max_attempts: u32) -> BackfillSettings {
        BackfillSettings {
            operation: "list_records".to_string(),
            page_timeout: Duration::from_millis(200),
            max_attempts,
        }
    }

    #[test]
    fn test_status_combination() {
        let done = BackfillStatus::Completed { pages: 2 };
        let unavailable = BackfillStatus::Unavailable {
            reason: "down".to_string(),
        };
        assert_eq!(
            BackfillStatus::NotNeeded.combine(done.clone()),
            done.clone()
        );
        assert_eq!(
            done.clone().combine(BackfillStatus::Completed { pages: 3 }),
            BackfillStatus::Completed { pages: 5 }
        );
        assert_eq!(done.combine(unavailable.clone()), unavailable);
        assert_eq!(
            BackfillStatus::NotNeeded.combine(BackfillStatus::NotNeeded),
            BackfillStatus::NotNeeded
        );
    }

    #[test]
    fn test_unknown_operation_rejected() {
        let mut bad = settings(1);
        bad.operation = "delete_everything".to_string();
        let err = Backfiller::new(Arc::new(MockBackfillSource::new()), limiter(5), bad).unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::Config { .. }));
    }

    #[tokio::test]
    async fn test_follows_cursors_and_filters_samples() {
        let range = TimeRange::new(at_s(0), at_s(60)).unwrap();
        let mut source = MockBackfillSource::new();
        source
            .expect_fetch_page()
            .withf(|_, _, cursor| cursor.is_none())
            .times(1)
            .returning(|_, _, _| {
                Ok(BackfillPage {
                    samples: vec![
                        MetricSample::new("messages_sent", at_s(10), 1.0),
                        // Outside the requested range
                        MetricSample::new("messages_sent", at_s(90), 1.0),
                    ],
                    next_cursor: Some("page-2".to_string()),
                    server_hint: None,
                })
            });
        source
            .expect_fetch_page()
            .withf(|_, _, cursor| cursor.as_deref() == Some("page-2"))
            .times(1)
            .returning(|_, _, _| {
                Ok(BackfillPage {
                    samples: vec![
                        MetricSample::new("messages_sent", at_s(20), 1.0),
                        MetricSample::new("reactions", at_s(20), 1.0),
                    ],
                    next_cursor: None,
                    server_hint: Some(ServerHint::new(50, Duration::from_secs(1))),
                })
            });

        let backfiller = Backfiller::new(Arc::new(source), limiter(5), settings(1)).unwrap();
        let fetched = backfiller
            .fetch_range("messages_sent", &range)
            .await
            .unwrap();
        assert_eq!(fetched.pages, 2);
        let timestamps: Vec<_> = fetched.samples.iter().map(|s| s.timestamp).collect();
        assert_eq!(timestamps, vec![at_s(10), at_s(20)]);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let range = TimeRange::new(at_s(0), at_s(60)).unwrap();
        let mut source = MockBackfillSource::new();
        let mut calls = 0;
        source.expect_fetch_page().times(2).returning(move |_, _, _| {
            calls += 1;
            if calls == 1 {
                Err(Error::new_without_logging(ErrorDetails::InternalError {
                    message: "502 from upstream".to_string(),
                }))
            } else {
                Ok(BackfillPage::default())
            }
        });
        let backfiller = Backfiller::new(Arc::new(source), limiter(5), settings(3)).unwrap();
        let fetched = backfiller.fetch_range("m", &range).await.unwrap();
        assert_eq!(fetched.pages, 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let range = TimeRange::new(at_s(0), at_s(60)).unwrap();
        let mut source = MockBackfillSource::new();
        source.expect_fetch_page().times(2).returning(|_, _, _| {
            Err(Error::new_without_logging(ErrorDetails::InternalError {
                message: "connection refused".to_string(),
            }))
        });
        let backfiller = Backfiller::new(Arc::new(source), limiter(5), settings(2)).unwrap();
        let err = backfiller.fetch_range("m", &range).await.unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::BackfillUnavailable { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_page_times_out() {
        struct SlowSource;

        #[async_trait]
        impl BackfillSource for SlowSource {
            async fn fetch_page(
                &self,
                _metric_id: &str,
                _range: &TimeRange,
                _cursor: Option<String>,
            ) -> Result<BackfillPage, Error> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(BackfillPage::default())
            }
        }

        let range = TimeRange::new(at_s(0), at_s(60)).unwrap();
        let backfiller = Backfiller::new(Arc::new(SlowSource), limiter(5), settings(1)).unwrap();
        let err = backfiller.fetch_range("m", &range).await.unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::BackfillTimeout { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_quota_is_unavailable() {
        let range = TimeRange::new(at_s(0), at_s(60)).unwrap();
        let mut source = MockBackfillSource::new();
        source.expect_fetch_page().times(1).returning(|_, _, _| {
            Ok(BackfillPage {
                samples: Vec::new(),
                next_cursor: Some("more".to_string()),
                server_hint: None,
            })
        });
        // One request per second and the mock clock never moves, so the second page can't be fetched
        let backfiller = Backfiller::new(Arc::new(source), limiter(1), settings(3)).unwrap();
        let err = backfiller.fetch_range("m", &range).await.unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::BackfillUnavailable { .. }
        ));
    }
}
