use std::collections::HashMap;
use std::sync::Arc;

use chrono::TimeDelta;

use super::function::AggregationFunction;
use super::granularity::Granularity;
use crate::clock::{MAX_SPAN_S, max_span};
use crate::config::{MetricConfig, seconds_setting};
use crate::error::{Error, ErrorDetails};

pub const DEFAULT_CACHE_TTL: TimeDelta = TimeDelta::minutes(5);

/// How one metric is aggregated and cached.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricDefinition {
    pub id: String,
    pub function: AggregationFunction,
    granularities: Vec<Granularity>,
    pub distinct_dimension: Option<String>,
    pub cache_ttl: TimeDelta,
    pub finalization_grace: TimeDelta,
}

impl MetricDefinition {
    pub fn new(
        id: impl Into<String>,
        function: AggregationFunction,
        granularities: impl IntoIterator<Item = Granularity>,
    ) -> Self {
        let mut granularities: Vec<Granularity> = granularities.into_iter().collect();
        granularities.sort();
        granularities.dedup();
        Self {
            id: id.into(),
            function,
            granularities,
            distinct_dimension: None,
            cache_ttl: DEFAULT_CACHE_TTL,
            finalization_grace: TimeDelta::zero(),
        }
    }

    #[must_use]
    pub fn with_distinct_dimension(mut self, dimension: impl Into<String>) -> Self {
        self.distinct_dimension = Some(dimension.into());
        self
    }

    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: TimeDelta) -> Self {
        self.cache_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_finalization_grace(mut self, grace: TimeDelta) -> Self {
        self.finalization_grace = grace;
        self
    }

    pub fn from_config(
        id: &str,
        config: &MetricConfig,
        default_cache_ttl: TimeDelta,
    ) -> Result<Self, Error> {
        let cache_ttl = match config.cache_ttl_s {
            Some(seconds) => seconds_setting(&format!("metrics.{id}.cache_ttl_s"), seconds)?,
            None => default_cache_ttl,
        };
        let finalization_grace = seconds_setting(
            &format!("metrics.{id}.finalization_grace_s"),
            config.finalization_grace_s,
        )?;
        let mut definition = Self::new(id, config.function, config.granularities.iter().copied())
            .with_cache_ttl(cache_ttl)
            .with_finalization_grace(finalization_grace);
        definition.distinct_dimension = config.distinct_dimension.clone();
        definition.validate()?;
        Ok(definition)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let config_error = |message: String| {
            Err(Error::new(ErrorDetails::Config {
                message: format!("metric `{}`: {message}", self.id),
            }))
        };
        if self.id.is_empty() {
            return config_error("metric id must not be empty".to_string());
        }
        if self.granularities.is_empty() {
            return config_error("at least one granularity is required".to_string());
        }
        match (
            self.function.requires_distinct_dimension(),
            &self.distinct_dimension,
        ) {
            (true, None) => {
                return config_error("`count_distinct` requires `distinct_dimension`".to_string());
            }
            (false, Some(_)) => {
                return config_error(format!(
                    "`distinct_dimension` is only valid with `count_distinct`, not `{}`",
                    self.function
                ));
            }
            _ => {}
        }
        if self.cache_ttl <= TimeDelta::zero() {
            return config_error("cache TTL must be positive".to_string());
        }
        if self.finalization_grace < TimeDelta::zero() {
            return config_error("finalization grace must not be negative".to_string());
        }
        if self.cache_ttl > max_span() || self.finalization_grace > max_span() {
            return config_error(format!(
                "cache TTL and finalization grace must be at most {MAX_SPAN_S}s"
            ));
        }
        Ok(())
    }

    /// Registered granularities, finest first.
    pub fn granularities(&self) -> &[Granularity] {
        &self.granularities
    }

    pub fn has_granularity(&self, granularity: Granularity) -> bool {
        self.granularities.contains(&granularity)
    }

    /// Roll-ups (top-N, summaries) read the finest granularity so that range edges are tight.
    pub fn finest_granularity(&self) -> Result<Granularity, Error> {
        self.granularities.first().copied().ok_or_else(|| {
            Error::new(ErrorDetails::Config {
                message: format!("metric `{}` has no granularities", self.id),
            })
        })
    }
}

#[derive(Debug, Default)]
pub struct MetricRegistry {
    metrics: HashMap<String, Arc<MetricDefinition>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: MetricDefinition) -> Result<(), Error> {
        definition.validate()?;
        if self.metrics.contains_key(&definition.id) {
            return Err(Error::new(ErrorDetails::Config {
                message: format!("metric `{}` is registered twice", definition.id),
            }));
        }
        self.metrics
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, metric_id: &str) -> Result<&Arc<MetricDefinition>, Error> {
        self.metrics.get(metric_id).ok_or_else(|| {
            Error::new(ErrorDetails::UnknownMetric {
                metric_id: metric_id.to_string(),
            })
        })
    }

    pub fn require_granularity(
        &self,
        metric_id: &str,
        granularity: Granularity,
    ) -> Result<&Arc<MetricDefinition>, Error> {
        let definition = self.get(metric_id)?;
        if !definition.has_granularity(granularity) {
            return Err(Error::new(ErrorDetails::UnknownGranularity {
                metric_id: metric_id.to_string(),
                granularity: granularity.to_string(),
            }));
        }
        Ok(definition)
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}
