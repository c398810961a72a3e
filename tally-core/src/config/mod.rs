use std::collections::BTreeMap;
use std::path::Path;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::clock::MAX_SPAN_S;
use crate::error::{Error, ErrorDetails};

mod metrics;
mod quota;

pub use metrics::{EngineConfig, MetricConfig};
pub use quota::{QuotaBackend, QuotaConfig, QuotaRuleConfig};

/// Environment variable holding the Valkey URL for `quota.backend = "valkey"`.
pub const VALKEY_URL_ENV_VAR: &str = "TALLY_VALKEY_URL";

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricConfig>,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Config {
    pub fn load_from_path(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::FileRead {
                message: e.to_string(),
                file_path: path.to_string_lossy().to_string(),
            })
        })?;
        let config = Self::from_toml_str(&contents)?;
        tracing::info!(
            "Loaded config from `{}` with {} metric(s) and {} quota operation(s)",
            path.to_string_lossy(),
            config.metrics.len(),
            config.quota.operations.len()
        );
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.quota.validate()?;

        let engine = &self.engine;
        if engine.default_cache_ttl_s == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`engine.default_cache_ttl_s` must be positive".to_string(),
            }));
        }
        let default_ttl =
            seconds_setting("engine.default_cache_ttl_s", engine.default_cache_ttl_s)?;
        if let Some(operation) = &engine.backfill_operation {
            if !self.quota.operations.contains_key(operation) {
                return Err(Error::new(ErrorDetails::Config {
                    message: format!(
                        "`engine.backfill_operation` names `{operation}`, which has no `[quota.operations.{operation}]` rule"
                    ),
                }));
            }
            if engine.backfill_max_attempts == 0 || engine.backfill_timeout_ms == 0 {
                return Err(Error::new(ErrorDetails::Config {
                    message: "`engine.backfill_max_attempts` and `engine.backfill_timeout_ms` must be positive"
                        .to_string(),
                }));
            }
            millis_setting("engine.backfill_timeout_ms", engine.backfill_timeout_ms)?;
        }

        for (metric_id, metric) in &self.metrics {
            crate::aggregation::MetricDefinition::from_config(metric_id, metric, default_ttl)?;
        }
        Ok(())
    }
}

/// Convert a `*_s` setting, rejecting values past [`MAX_SPAN_S`].
pub(crate) fn seconds_setting(field: &str, seconds: u64) -> Result<TimeDelta, Error> {
    millis_setting(field, seconds.saturating_mul(1_000))
}

/// Convert a `*_ms` setting, rejecting values past [`MAX_SPAN_S`].
pub(crate) fn millis_setting(field: &str, millis: u64) -> Result<TimeDelta, Error> {
    i64::try_from(millis)
        .ok()
        .filter(|ms| *ms <= MAX_SPAN_S * 1_000)
        .and_then(TimeDelta::try_milliseconds)
        .ok_or_else(|| {
            Error::new(ErrorDetails::Config {
                message: format!("`{field}` must be at most {MAX_SPAN_S} seconds"),
            })
        })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::aggregation::{AggregationFunction, Granularity};

    const FULL_CONFIG: &str = r#"
        [quota]
        backend = "memory"
        idle_eviction_s = 600
        max_request_ms = 250

        [quota.global]
        requests_per_second = 50

        [quota.operations.send_message]
        requests_per_minute = 20

        [quota.operations.list_records]
        max_requests = 5
        window_ms = 1000

        [metrics.messages_sent]
        function = "count"
        granularities = ["1m", "1h", "1d"]
        cache_ttl_s = 60
        finalization_grace_s = 30

        [metrics.active_users]
        function = "count_distinct"
        granularities = ["1h"]
        distinct_dimension = "user_id"

        [engine]
        cache_capacity = 100
        backfill_operation = "list_records"
        backfill_timeout_ms = 2000
    "#;

    #[test]
    fn test_full_config() {
        let config = Config::from_toml_str(FULL_CONFIG).unwrap();
        assert_eq!(config.quota.max_request_ms, 250);
        assert_eq!(config.quota.global.max_requests, 50);
        assert_eq!(config.quota.operations["send_message"].window_ms, 60_000);
        assert_eq!(config.quota.operations["list_records"].max_requests, 5);

        let messages = &config.metrics["messages_sent"];
        assert_eq!(messages.function, AggregationFunction::Count);
        assert_eq!(
            messages.granularities,
            vec![
                "1m".parse::<Granularity>().unwrap(),
                "1h".parse().unwrap(),
                "1d".parse().unwrap()
            ]
        );
        assert_eq!(messages.cache_ttl_s, Some(60));
        assert_eq!(
            config.metrics["active_users"].distinct_dimension.as_deref(),
            Some("user_id")
        );
        assert_eq!(config.engine.cache_capacity, 100);
        assert_eq!(config.engine.backfill_max_attempts, 3);
        assert_eq!(config.engine.default_cache_ttl_s, 300);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert!(config.metrics.is_empty());
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = Config::from_toml_str("[engine]\ncache_size = 10").unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::Config { .. }));
        let err = Config::from_toml_str("[reporting]\nenabled = true").unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::Config { .. }));
    }

    #[test]
    fn test_backfill_operation_must_exist() {
        let err = Config::from_toml_str(
            r#"
            [engine]
            backfill_operation = "list_records"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("list_records"));
    }

    #[test]
    fn test_metric_validation() {
        let cases = [
            // count_distinct without a dimension
            "[metrics.m]\nfunction = \"count_distinct\"\ngranularities = [\"1m\"]",
            // dimension without count_distinct
            "[metrics.m]\nfunction = \"sum\"\ngranularities = [\"1m\"]\ndistinct_dimension = \"user\"",
            // no granularities
            "[metrics.m]\nfunction = \"count\"\ngranularities = []",
            // bad granularity
            "[metrics.m]\nfunction = \"count\"\ngranularities = [\"5w\"]",
            // unknown function
            "[metrics.m]\nfunction = \"median\"\ngranularities = [\"1m\"]",
            // zero TTL
            "[metrics.m]\nfunction = \"count\"\ngranularities = [\"1m\"]\ncache_ttl_s = 0",
            // TTL past any representable expiry
            "[metrics.m]\nfunction = \"count\"\ngranularities = [\"1m\"]\ncache_ttl_s = 9300000000000000",
            "[metrics.m]\nfunction = \"count\"\ngranularities = [\"1m\"]\nfinalization_grace_s = 9300000000000000",
            // bucket width past any representable timestamp
            "[metrics.m]\nfunction = \"count\"\ngranularities = [\"9000000000000000s\"]",
        ];
        for case in cases {
            let err = Config::from_toml_str(case).unwrap_err();
            assert!(err.is_caller_bug(), "`{case}` should be a config error");
        }
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let cases = [
            "[engine]\ndefault_cache_ttl_s = 9300000000000000",
            "[quota]\nidle_eviction_s = 9300000000000000",
            "[quota.global]\nmax_requests = 5\nwindow_ms = 9000000000000000000",
            "[quota.operations.send_message]\nmax_requests = 5\nwindow_ms = 9000000000000000000",
        ];
        for case in cases {
            let err = Config::from_toml_str(case).unwrap_err();
            assert!(
                matches!(err.get_details(), ErrorDetails::Config { .. }),
                "`{case}` should be a config error"
            );
        }
        assert_eq!(
            seconds_setting("x", MAX_SPAN_S as u64).unwrap(),
            crate::clock::max_span()
        );
    }

    #[test]
    fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL_CONFIG.as_bytes()).unwrap();
        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.metrics.len(), 2);
    }

    #[test]
    fn test_load_from_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from_path(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::FileRead { .. }));
    }
}
