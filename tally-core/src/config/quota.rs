//! Quota configuration.
//!
//! A rule is written either with the shorthand
//!
//! ```toml
//! [quota.operations.send_message]
//! requests_per_minute = 20
//! ```
//!
//! where the interval is one of `second`, `minute`, `hour`, `day`, or explicitly:
//!
//! ```toml
//! [quota.operations.send_message]
//! max_requests = 20
//! window_ms = 60000
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use super::{millis_setting, seconds_setting};
use crate::error::Error;
use crate::rate_limiting::{QuotaInterval, QuotaRule};

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuotaBackend {
    #[default]
    Memory,
    /// Shared counters in Valkey; the URL comes from `TALLY_VALKEY_URL`.
    Valkey,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaConfig {
    #[serde(default)]
    pub backend: QuotaBackend,
    #[serde(default = "default_idle_eviction_s")]
    pub idle_eviction_s: u64,
    /// Retry hint returned when the counter store cannot be reached.
    #[serde(default = "default_max_request_ms")]
    pub max_request_ms: u64,
    #[serde(default)]
    pub global: QuotaRuleConfig,
    #[serde(default)]
    pub operations: BTreeMap<String, QuotaRuleConfig>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            backend: QuotaBackend::default(),
            idle_eviction_s: default_idle_eviction_s(),
            max_request_ms: default_max_request_ms(),
            global: QuotaRuleConfig::default(),
            operations: BTreeMap::new(),
        }
    }
}

fn default_idle_eviction_s() -> u64 {
    3600
}

fn default_max_request_ms() -> u64 {
    1000
}

impl QuotaConfig {
    pub fn validate(&self) -> Result<(), Error> {
        seconds_setting("quota.idle_eviction_s", self.idle_eviction_s)?;
        millis_setting("quota.max_request_ms", self.max_request_ms)?;
        self.global.to_rule()?;
        for rule in self.operations.values() {
            rule.to_rule()?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QuotaRuleConfig {
    pub max_requests: u64,
    pub window_ms: u64,
}

impl Default for QuotaRuleConfig {
    fn default() -> Self {
        Self {
            max_requests: 50,
            window_ms: 1000,
        }
    }
}

impl QuotaRuleConfig {
    pub fn to_rule(&self) -> Result<QuotaRule, Error> {
        QuotaRule::new(
            self.max_requests,
            millis_setting("window_ms", self.window_ms)?,
        )
    }
}

impl<'de> Deserialize<'de> for QuotaRuleConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // First deserialize to a TOML table
        let mut table = toml::map::Map::deserialize(deserializer)?;

        let mut shorthand = None;
        let mut shorthand_keys = Vec::new();
        for (key, value) in &table {
            let Some(interval) = key.strip_prefix("requests_per_") else {
                continue;
            };
            if shorthand.is_some() {
                return Err(serde::de::Error::custom(format!(
                    "Only one `requests_per_<interval>` key is allowed per rule, found another: `{key}`"
                )));
            }
            let amount = value
                .as_integer()
                .filter(|amount| *amount > 0)
                .ok_or_else(|| {
                    serde::de::Error::custom(format!(
                        "Quota value for '{key}' must be a positive integer",
                    ))
                })? as u64;
            let interval =
                QuotaInterval::deserialize(serde::de::value::StrDeserializer::new(interval))?;
            shorthand = Some((amount, interval));
            shorthand_keys.push(key.clone());
        }

        for key in shorthand_keys {
            table.remove(&key);
        }

        // Now deserialize the remaining fields into a helper struct
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct ExplicitFields {
            max_requests: Option<u64>,
            window_ms: Option<u64>,
        }

        let explicit = ExplicitFields::deserialize(toml::Value::Table(table)).map_err(|e| {
            serde::de::Error::custom(format!("Error parsing quota rule: {e}"))
        })?;

        match (shorthand, explicit.max_requests, explicit.window_ms) {
            (Some((amount, interval)), None, None) => Ok(QuotaRuleConfig {
                max_requests: amount,
                window_ms: interval.to_duration().num_milliseconds() as u64,
            }),
            (None, Some(max_requests), Some(window_ms)) => Ok(QuotaRuleConfig {
                max_requests,
                window_ms,
            }),
            (Some(_), _, _) => Err(serde::de::Error::custom(
                "Use either `requests_per_<interval>` or `max_requests` + `window_ms`, not both",
            )),
            (None, _, _) => Err(serde::de::Error::custom(
                "A quota rule needs `requests_per_<interval>` or both `max_requests` and `window_ms`",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn parse_rule(toml_str: &str) -> Result<QuotaRuleConfig, toml::de::Error> {
        toml::from_str(toml_str)
    }

    #[test]
    fn test_shorthand_intervals() {
        for (key, window_ms) in [
            ("requests_per_second", 1_000),
            ("requests_per_minute", 60_000),
            ("requests_per_hour", 3_600_000),
            ("requests_per_day", 86_400_000),
        ] {
            let rule = parse_rule(&format!("{key} = 7")).unwrap();
            assert_eq!(
                rule,
                QuotaRuleConfig {
                    max_requests: 7,
                    window_ms
                }
            );
        }
    }

    #[test]
    fn test_explicit_rule() {
        let rule = parse_rule("max_requests = 5\nwindow_ms = 1500").unwrap();
        assert_eq!(rule.to_rule().unwrap().window, TimeDelta::milliseconds(1500));
    }

    #[test]
    fn test_invalid_rules() {
        let cases = [
            "requests_per_week = 5",
            "requests_per_second = 0",
            "requests_per_second = -3",
            "requests_per_second = \"ten\"",
            "requests_per_second = 5\nrequests_per_minute = 100",
            "requests_per_second = 5\nmax_requests = 5",
            "max_requests = 5",
            "burst = 10",
        ];
        for case in cases {
            assert!(parse_rule(case).is_err(), "`{case}` should be rejected");
        }
    }

    #[test]
    fn test_zero_window_fails_validation() {
        let rule = parse_rule("max_requests = 5\nwindow_ms = 0").unwrap();
        assert!(rule.to_rule().is_err());
    }

    #[test]
    fn test_oversized_window_fails_validation() {
        let rule = parse_rule("max_requests = 5\nwindow_ms = 9000000000000000000").unwrap();
        assert!(rule.to_rule().is_err());
        let config = QuotaConfig {
            idle_eviction_s: 9_300_000_000_000_000,
            ..QuotaConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_quota_config_defaults() {
        let config: QuotaConfig = toml::from_str("").unwrap();
        assert_eq!(config.backend, QuotaBackend::Memory);
        assert_eq!(config.max_request_ms, 1000);
        assert_eq!(config.idle_eviction_s, 3600);
        assert_eq!(config.global.max_requests, 50);
        assert!(config.operations.is_empty());
    }
}
