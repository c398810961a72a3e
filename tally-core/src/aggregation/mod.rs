//! The aggregation engine turns raw samples into cached, queryable time series.
//!
//! Samples are folded into cells keyed by `(metric, granularity, bucket start,
//! full dimension set)` at ingest time. A query merges the cells that match its
//! dimension filter, so any filter can be answered without re-reading samples.
//!
//! Results are cached under a hash of every query parameter. Entries expire
//! after the metric's TTL or when `invalidate` is called for an intersecting
//! range; ingestion never invalidates implicitly, so a cached answer may lag
//! recent samples by at most one TTL.
//!
//! When a [`Backfiller`] is attached, buckets that have no local data and lie
//! outside any range already known to be complete are fetched from the remote
//! system before the query is answered. If that fails, the query still answers
//! from local buckets, reports [`BackfillStatus::Unavailable`], and the partial
//! answer is not cached.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;

pub mod backfill;
pub mod bucket;
pub mod cache;
pub mod coverage;
pub mod function;
pub mod granularity;
pub mod metric;
pub mod range;
pub mod ranking;
pub mod sample;
pub mod store;

pub use backfill::{BackfillPage, BackfillSettings, BackfillSource, BackfillStatus, Backfiller};
pub use bucket::{Bucket, BucketSeries, RankedEntry, Summary};
pub use function::{AggregateState, AggregationFunction};
pub use granularity::Granularity;
pub use metric::{MetricDefinition, MetricRegistry};
pub use range::TimeRange;
pub use sample::{Dimensions, MetricSample};

use cache::{CacheEntry, CacheKey, CachedPayload, QueryCache, QueryDescriptor};
use coverage::DisjointIntervals;
use sample::matches_filter;
use store::BucketStore;

use crate::clock::Clock;
use crate::config::{Config, seconds_setting};
use crate::error::{Error, ErrorDetails};

/// A query answer plus how it was produced.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryOutcome<T> {
    pub value: T,
    pub backfill: BackfillStatus,
    pub from_cache: bool,
}

impl<T> QueryOutcome<T> {
    fn cached(value: T) -> Self {
        Self {
            value,
            backfill: BackfillStatus::NotNeeded,
            from_cache: true,
        }
    }
}

pub struct AggregationEngine {
    registry: MetricRegistry,
    store: BucketStore,
    cache: QueryCache,
    /// Ranges known to be locally complete, per metric.
    coverage: DashMap<String, Mutex<DisjointIntervals<DateTime<Utc>>>>,
    backfiller: Option<Backfiller>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AggregationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationEngine")
            .field("registry", &self.registry)
            .field("cache", &self.cache)
            .field("backfiller", &self.backfiller)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl AggregationEngine {
    pub fn new(registry: MetricRegistry, cache_capacity: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            store: BucketStore::new(),
            cache: QueryCache::new(cache_capacity),
            coverage: DashMap::new(),
            backfiller: None,
            clock,
        }
    }

    pub fn from_config(config: &Config, clock: Arc<dyn Clock>) -> Result<Self, Error> {
        let default_ttl =
            seconds_setting("engine.default_cache_ttl_s", config.engine.default_cache_ttl_s)?;
        let mut registry = MetricRegistry::new();
        for (metric_id, metric) in &config.metrics {
            registry.register(MetricDefinition::from_config(metric_id, metric, default_ttl)?)?;
        }
        Ok(Self::new(registry, config.engine.cache_capacity, clock))
    }

    #[must_use]
    pub fn with_backfill(mut self, backfiller: Backfiller) -> Self {
        self.backfiller = Some(backfiller);
        self
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    fn fold(&self, definition: &MetricDefinition, sample: &MetricSample) -> Result<(), Error> {
        self.store.fold(definition, sample)?;
        counter!("tally_samples_ingested_total", "metric" => definition.id.clone()).increment(1);
        Ok(())
    }

    /// Fold one sample into every registered granularity of its metric.
    pub fn ingest(&self, sample: &MetricSample) -> Result<(), Error> {
        let definition = self.registry.get(&sample.metric_id)?;
        self.fold(definition, sample)
    }

    /// Ingest many samples. Every sample's metric is checked before any is folded in.
    #[tracing::instrument(skip_all, fields(otel.name = "aggregation_ingest_batch", samples = samples.len()))]
    pub fn ingest_batch(&self, samples: &[MetricSample]) -> Result<usize, Error> {
        let definitions = samples
            .iter()
            .map(|sample| self.registry.get(&sample.metric_id))
            .collect::<Result<Vec<_>, Error>>()?;
        for (definition, sample) in definitions.into_iter().zip(samples) {
            self.fold(definition, sample)?;
        }
        Ok(samples.len())
    }

    /// Ingest the complete set of samples for `range` and record that range as
    /// locally complete, so it is never backfilled.
    #[tracing::instrument(skip(self, range, samples), fields(otel.name = "aggregation_ingest_covered", range = %range))]
    pub fn ingest_covered(
        &self,
        metric_id: &str,
        range: &TimeRange,
        samples: &[MetricSample],
    ) -> Result<usize, Error> {
        let definition = self.registry.get(metric_id)?;
        if let Some(stray) = samples
            .iter()
            .find(|s| s.metric_id != metric_id || !range.contains(s.timestamp))
        {
            return Err(Error::new(ErrorDetails::InvalidQuery {
                message: format!(
                    "sample for `{}` at {} does not belong to `{metric_id}` over {range}",
                    stray.metric_id, stray.timestamp
                ),
            }));
        }
        for sample in samples {
            self.fold(definition, sample)?;
        }
        self.mark_covered(metric_id, range)?;
        Ok(samples.len())
    }

    fn mark_covered(&self, metric_id: &str, range: &TimeRange) -> Result<(), Error> {
        let entry = self
            .coverage
            .entry(metric_id.to_string())
            .or_insert_with(|| Mutex::new(DisjointIntervals::new()));
        let mut intervals = entry.lock().map_err(|_| {
            Error::new(ErrorDetails::InternalError {
                message: "coverage lock poisoned".to_string(),
            })
        })?;
        intervals.add_interval(range.start()..range.end());
        Ok(())
    }

    /// Non-empty buckets for `metric_id` at `granularity` whose start lies in
    /// `[bucket_start(range.start), range.end)`, oldest first.
    #[tracing::instrument(skip(self, range, filters), fields(otel.name = "aggregation_query", range = %range))]
    pub async fn query(
        &self,
        metric_id: &str,
        range: &TimeRange,
        granularity: Granularity,
        filters: &Dimensions,
    ) -> Result<QueryOutcome<BucketSeries>, Error> {
        let definition = self.registry.require_granularity(metric_id, granularity)?;
        let key = QueryDescriptor::Series {
            metric_id,
            range,
            granularity,
            filters,
        }
        .get_cache_key()?;
        if let Some(CachedPayload::Series(series)) = self.lookup(&key) {
            return Ok(QueryOutcome::cached(series));
        }

        let backfill = self.backfill_missing(definition, granularity, range).await;
        let series = self.compute_series(definition, granularity, range, filters)?;
        self.remember(
            key,
            definition,
            range.aligned_to(granularity),
            CachedPayload::Series(series.clone()),
            &backfill,
        );
        Ok(QueryOutcome {
            value: series,
            backfill,
            from_cache: false,
        })
    }

    /// The `n` values of `dimension` with the largest aggregate over the buckets
    /// of the metric's finest granularity whose start lies in
    /// `[bucket_start(range.start), range.end)`, descending, ties broken by
    /// dimension value ascending. Samples without the dimension are not ranked.
    /// A range starting mid-bucket therefore includes that whole bucket.
    #[tracing::instrument(skip(self, range), fields(otel.name = "aggregation_top_n", range = %range))]
    pub async fn top_n(
        &self,
        metric_id: &str,
        range: &TimeRange,
        dimension: &str,
        n: usize,
    ) -> Result<QueryOutcome<Vec<RankedEntry>>, Error> {
        if n == 0 {
            return Err(Error::new(ErrorDetails::InvalidQuery {
                message: "top-N queries need n > 0".to_string(),
            }));
        }
        let definition = self.registry.get(metric_id)?;
        let granularity = definition.finest_granularity()?;
        let key = QueryDescriptor::TopN {
            metric_id,
            range,
            dimension,
            n,
        }
        .get_cache_key()?;
        if let Some(CachedPayload::TopN(ranked)) = self.lookup(&key) {
            return Ok(QueryOutcome::cached(ranked));
        }

        let backfill = self.backfill_missing(definition, granularity, range).await;
        let mut groups: HashMap<String, AggregateState> = HashMap::new();
        self.store
            .visit_cells(&definition.id, granularity, range, |_, dimensions, state| {
                if let Some(value) = dimensions.get(dimension) {
                    groups
                        .entry(value.clone())
                        .or_insert_with(|| AggregateState::empty(definition.function))
                        .merge(state);
                }
            })?;
        let ranked = ranking::top_n(groups, n);
        self.remember(
            key,
            definition,
            range.aligned_to(granularity),
            CachedPayload::TopN(ranked.clone()),
            &backfill,
        );
        Ok(QueryOutcome {
            value: ranked,
            backfill,
            from_cache: false,
        })
    }

    /// One aggregate for the samples matching `filters`, over the same buckets
    /// `top_n` reads: finest granularity, starts in
    /// `[bucket_start(range.start), range.end)`.
    #[tracing::instrument(skip(self, range, filters), fields(otel.name = "aggregation_summary", range = %range))]
    pub async fn summary(
        &self,
        metric_id: &str,
        range: &TimeRange,
        filters: &Dimensions,
    ) -> Result<QueryOutcome<Summary>, Error> {
        let definition = self.registry.get(metric_id)?;
        let granularity = definition.finest_granularity()?;
        let key = QueryDescriptor::Summary {
            metric_id,
            range,
            filters,
        }
        .get_cache_key()?;
        if let Some(CachedPayload::Summary(summary)) = self.lookup(&key) {
            return Ok(QueryOutcome::cached(summary));
        }

        let backfill = self.backfill_missing(definition, granularity, range).await;
        let mut total = AggregateState::empty(definition.function);
        self.store
            .visit_cells(&definition.id, granularity, range, |_, dimensions, state| {
                if matches_filter(dimensions, filters) {
                    total.merge(state);
                }
            })?;
        let summary = Summary {
            metric_id: metric_id.to_string(),
            range: *range,
            filters: filters.clone(),
            value: total.value(),
            sample_count: total.sample_count(),
        };
        self.remember(
            key,
            definition,
            range.aligned_to(granularity),
            CachedPayload::Summary(summary.clone()),
            &backfill,
        );
        Ok(QueryOutcome {
            value: summary,
            backfill,
            from_cache: false,
        })
    }

    /// Drop every cached result for `metric_id` whose range intersects `range`.
    /// Call this after late or corrective ingestion.
    pub fn invalidate(&self, metric_id: &str, range: &TimeRange) -> Result<usize, Error> {
        self.registry.get(metric_id)?;
        let removed = self.cache.invalidate(metric_id, range);
        tracing::debug!("Invalidated {removed} cached result(s) for `{metric_id}` over {range}");
        Ok(removed)
    }

    fn compute_series(
        &self,
        definition: &MetricDefinition,
        granularity: Granularity,
        range: &TimeRange,
        filters: &Dimensions,
    ) -> Result<BucketSeries, Error> {
        let mut merged: BTreeMap<DateTime<Utc>, AggregateState> = BTreeMap::new();
        self.store
            .visit_cells(&definition.id, granularity, range, |start, dimensions, state| {
                if matches_filter(dimensions, filters) {
                    merged
                        .entry(start)
                        .or_insert_with(|| AggregateState::empty(definition.function))
                        .merge(state);
                }
            })?;
        let now = self.clock.now();
        let buckets = merged
            .into_iter()
            .filter_map(|(start, state)| {
                let end = granularity.bucket_end(start);
                Some(Bucket {
                    start,
                    end,
                    value: state.value()?,
                    sample_count: state.sample_count(),
                    provisional: end
                        .checked_add_signed(definition.finalization_grace)
                        .is_none_or(|finalized_at| now < finalized_at),
                })
            })
            .collect();
        Ok(BucketSeries {
            metric_id: definition.id.clone(),
            granularity,
            range: *range,
            filters: filters.clone(),
            buckets,
        })
    }

    fn lookup(&self, key: &CacheKey) -> Option<CachedPayload> {
        let entry = self.cache.get(key, self.clock.now());
        let result = if entry.is_some() { "hit" } else { "miss" };
        counter!("tally_query_cache_total", "result" => result).increment(1);
        entry.map(|e| e.payload.clone())
    }

    fn remember(
        &self,
        key: CacheKey,
        definition: &MetricDefinition,
        covered: TimeRange,
        payload: CachedPayload,
        backfill: &BackfillStatus,
    ) {
        if backfill.is_unavailable() {
            tracing::debug!(
                "Not caching partial result for `{}` over {covered}",
                definition.id
            );
            return;
        }
        self.cache.insert(
            key,
            CacheEntry {
                metric_id: definition.id.clone(),
                range: covered,
                payload,
                stored_at: self.clock.now(),
                ttl: definition.cache_ttl,
            },
        );
    }

    /// Spans of buckets in the query range that hold no local data and are not
    /// known to be complete, clipped to the uncovered parts of the range.
    fn missing_spans(
        &self,
        definition: &MetricDefinition,
        granularity: Granularity,
        range: &TimeRange,
    ) -> Result<Vec<TimeRange>, Error> {
        let aligned = granularity.bucket_start(range.start())..range.end();
        let uncovered = if let Some(intervals) = self.coverage.get(&definition.id) {
            let intervals = intervals.lock().map_err(|_| {
                Error::new(ErrorDetails::InternalError {
                    message: "coverage lock poisoned".to_string(),
                })
            })?;
            intervals.gaps(aligned)
        } else {
            vec![aligned]
        };
        if uncovered.is_empty() {
            return Ok(Vec::new());
        }

        let present = self.store.present_buckets(&definition.id, granularity, range)?;
        let step = granularity.as_time_delta();
        let mut spans = Vec::new();
        for gap in uncovered {
            let mut bucket = granularity.bucket_start(gap.start);
            let mut open: Option<DateTime<Utc>> = None;
            while bucket < gap.end {
                let missing = !present.contains(&bucket);
                match (missing, open) {
                    (true, None) => open = Some(bucket.max(gap.start)),
                    (false, Some(span_start)) => {
                        spans.push(TimeRange::new(span_start, bucket)?);
                        open = None;
                    }
                    _ => {}
                }
                bucket += step;
            }
            if let Some(span_start) = open {
                spans.push(TimeRange::new(span_start, gap.end)?);
            }
        }
        Ok(spans)
    }

    async fn backfill_missing(
        &self,
        definition: &MetricDefinition,
        granularity: Granularity,
        range: &TimeRange,
    ) -> BackfillStatus {
        let Some(backfiller) = &self.backfiller else {
            return BackfillStatus::NotNeeded;
        };
        match self.missing_spans(definition, granularity, range) {
            Ok(spans) if spans.is_empty() => return BackfillStatus::NotNeeded,
            Ok(_) => {}
            Err(e) => {
                return BackfillStatus::Unavailable {
                    reason: e.to_string(),
                };
            }
        }

        let lock = backfiller.lock_for(&definition.id);
        let _guard = lock.lock().await;
        // Another query may have filled some of the gaps while we waited
        let spans = match self.missing_spans(definition, granularity, range) {
            Ok(spans) => spans,
            Err(e) => {
                return BackfillStatus::Unavailable {
                    reason: e.to_string(),
                };
            }
        };

        let mut status = BackfillStatus::NotNeeded;
        for span in spans {
            let span_status = match self.backfill_span(backfiller, definition, &span).await {
                Ok(pages) => BackfillStatus::Completed { pages },
                Err(e) => BackfillStatus::Unavailable {
                    reason: e.to_string(),
                },
            };
            counter!(
                "tally_backfill_total",
                "metric" => definition.id.clone(),
                "status" => span_status.as_label(),
            )
            .increment(1);
            status = status.combine(span_status);
            if status.is_unavailable() {
                break;
            }
        }
        status
    }

    async fn backfill_span(
        &self,
        backfiller: &Backfiller,
        definition: &MetricDefinition,
        span: &TimeRange,
    ) -> Result<u32, Error> {
        let fetched = backfiller.fetch_range(&definition.id, span).await?;
        for sample in &fetched.samples {
            self.fold(definition, sample)?;
        }
        self.mark_covered(&definition.id, span)?;
        // Anything cached over this span was computed without the history we just added
        self.cache.invalidate(&definition.id, span);
        tracing::info!(
            "Backfilled {} sample(s) in {} page(s) for `{}` over {span}",
            fetched.samples.len(),
            fetched.pages,
            definition.id
        );
        Ok(fetched.pages)
    }
}
