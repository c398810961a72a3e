use std::sync::Arc;
use std::time::Duration;

use crate::aggregation::{AggregationEngine, BackfillSettings, BackfillSource, Backfiller};
use crate::clock::Clock;
use crate::config::{Config, QuotaBackend, VALKEY_URL_ENV_VAR};
use crate::db::{InMemoryQuotaStore, QuotaStore, ValkeyConnectionInfo};
use crate::error::{Error, ErrorDetails};
use crate::rate_limiting::QuotaLimiter;

/// The process-wide limiter and engine, built once at startup and handed to callers.
#[derive(Clone, Debug)]
pub struct TallyContext {
    pub limiter: Arc<QuotaLimiter>,
    pub engine: Arc<AggregationEngine>,
}

impl TallyContext {
    /// Build the context from a validated config.
    ///
    /// A `backfill_source` is only used when `engine.backfill_operation` is set;
    /// otherwise queries answer from local buckets alone.
    pub async fn from_config(
        config: &Config,
        clock: Arc<dyn Clock>,
        backfill_source: Option<Arc<dyn BackfillSource>>,
    ) -> Result<Self, Error> {
        let store = build_quota_store(config).await?;
        let limiter = Arc::new(QuotaLimiter::from_config(
            &config.quota,
            store,
            clock.clone(),
        )?);
        let mut engine = AggregationEngine::from_config(config, clock)?;

        match (backfill_source, &config.engine.backfill_operation) {
            (Some(source), Some(operation)) => {
                let settings = BackfillSettings {
                    operation: operation.clone(),
                    page_timeout: Duration::from_millis(config.engine.backfill_timeout_ms),
                    max_attempts: config.engine.backfill_max_attempts,
                };
                engine = engine.with_backfill(Backfiller::new(source, limiter.clone(), settings)?);
            }
            (Some(_), None) => {
                tracing::warn!(
                    "A backfill source was provided but `engine.backfill_operation` is not set; backfill is disabled"
                );
            }
            (None, _) => {}
        }

        Ok(Self {
            limiter,
            engine: Arc::new(engine),
        })
    }
}

async fn build_quota_store(config: &Config) -> Result<Arc<dyn QuotaStore>, Error> {
    match config.quota.backend {
        QuotaBackend::Memory => Ok(Arc::new(InMemoryQuotaStore::new())),
        QuotaBackend::Valkey => {
            let url = std::env::var(VALKEY_URL_ENV_VAR).map_err(|_| {
                Error::new(ErrorDetails::Config {
                    message: format!(
                        "`quota.backend = \"valkey\"` requires the `{VALKEY_URL_ENV_VAR}` environment variable"
                    ),
                })
            })?;
            Ok(Arc::new(ValkeyConnectionInfo::new(&url).await?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{Dimensions, MetricSample, TimeRange};
    use crate::aggregation::backfill::MockBackfillSource;
    use crate::clock::MockClock;
    use chrono::{DateTime, TimeDelta, Utc};

    const CONFIG: &str = r#"
        [quota.global]
        requests_per_second = 10

        [quota.operations.list_records]
        requests_per_second = 2

        [metrics.messages_sent]
        function = "count"
        granularities = ["1m"]

        [engine]
        backfill_operation = "list_records"
    "#;

    #[tokio::test]
    async fn test_context_shares_one_limiter() {
        let config = Config::from_toml_str(CONFIG).unwrap();
        let clock = Arc::new(MockClock::at_epoch());
        let mut source = MockBackfillSource::new();
        source.expect_fetch_page().returning(|_, _, _| Ok(Default::default()));
        let context = TallyContext::from_config(&config, clock, Some(Arc::new(source)))
            .await
            .unwrap();

        assert!(context.limiter.has_operation("list_records"));
        assert_eq!(context.engine.registry().len(), 1);

        // Both budget units of `list_records` go to the backfill of two separate gaps
        let now = DateTime::<Utc>::UNIX_EPOCH;
        context
            .engine
            .ingest(&MetricSample::new("messages_sent", now + TimeDelta::seconds(90), 1.0))
            .unwrap();
        let range = TimeRange::new(now, now + TimeDelta::seconds(180)).unwrap();
        let outcome = context
            .engine
            .query(
                "messages_sent",
                &range,
                "1m".parse().unwrap(),
                &Dimensions::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome.backfill,
            crate::aggregation::BackfillStatus::Completed { pages: 2 }
        );
        assert!(
            !context
                .limiter
                .try_acquire("list_records", "messages_sent")
                .await
                .unwrap()
                .is_granted()
        );
    }

    #[tokio::test]
    async fn test_without_source_backfill_is_not_needed() {
        let config = Config::from_toml_str(CONFIG).unwrap();
        let context = TallyContext::from_config(&config, Arc::new(MockClock::at_epoch()), None)
            .await
            .unwrap();
        let now = DateTime::<Utc>::UNIX_EPOCH;
        let range = TimeRange::new(now, now + TimeDelta::seconds(60)).unwrap();
        let outcome = context
            .engine
            .query(
                "messages_sent",
                &range,
                "1m".parse().unwrap(),
                &Dimensions::new(),
            )
            .await
            .unwrap();
        assert!(outcome.value.buckets.is_empty());
        assert_eq!(
            outcome.backfill,
            crate::aggregation::BackfillStatus::NotNeeded
        );
    }
}
