//! Bucket storage.
//!
//! Cells are keyed by `(metric, granularity, bucket start, full dimension set)`.
//! Each series keeps an ordered map of bucket start to cells behind an `RwLock`,
//! and each bucket's cells sit behind their own `Mutex`. Folding into one bucket
//! is serialized; folds into different buckets only share the series read lock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::function::AggregateState;
use super::granularity::Granularity;
use super::metric::MetricDefinition;
use super::range::TimeRange;
use super::sample::{Dimensions, MetricSample};
use crate::error::{Error, ErrorDetails};

type BucketCells = BTreeMap<Dimensions, AggregateState>;

#[derive(Debug, Default)]
struct Series {
    buckets: RwLock<BTreeMap<DateTime<Utc>, Arc<Mutex<BucketCells>>>>,
}

#[derive(Debug, Eq, Hash, PartialEq)]
struct SeriesKey {
    metric_id: String,
    granularity: Granularity,
}

#[derive(Debug, Default)]
pub struct BucketStore {
    series: DashMap<SeriesKey, Arc<Series>>,
}

fn poisoned(what: &str) -> Error {
    Error::new(ErrorDetails::InternalError {
        message: format!("{what} lock poisoned"),
    })
}

fn lock_cells(cells: &Mutex<BucketCells>) -> Result<MutexGuard<'_, BucketCells>, Error> {
    cells.lock().map_err(|_| poisoned("bucket"))
}

impl BucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn series(&self, metric_id: &str, granularity: Granularity) -> Option<Arc<Series>> {
        self.series
            .get(&SeriesKey {
                metric_id: metric_id.to_string(),
                granularity,
            })
            .map(|s| s.value().clone())
    }

    fn series_or_insert(&self, metric_id: &str, granularity: Granularity) -> Arc<Series> {
        self.series
            .entry(SeriesKey {
                metric_id: metric_id.to_string(),
                granularity,
            })
            .or_default()
            .clone()
    }

    fn bucket(
        series: &Series,
        bucket_start: DateTime<Utc>,
    ) -> Result<Arc<Mutex<BucketCells>>, Error> {
        {
            let buckets = series.buckets.read().map_err(|_| poisoned("series"))?;
            if let Some(cells) = buckets.get(&bucket_start) {
                return Ok(cells.clone());
            }
        }
        let mut buckets = series.buckets.write().map_err(|_| poisoned("series"))?;
        Ok(buckets.entry(bucket_start).or_default().clone())
    }

    /// Fold a sample into its bucket at every granularity registered for its metric.
    pub fn fold(&self, definition: &MetricDefinition, sample: &MetricSample) -> Result<(), Error> {
        let distinct_value = definition
            .distinct_dimension
            .as_deref()
            .and_then(|d| sample.dimension(d));
        for granularity in definition.granularities() {
            let series = self.series_or_insert(&definition.id, *granularity);
            let cells = Self::bucket(&series, granularity.bucket_start(sample.timestamp))?;
            let mut cells = lock_cells(&cells)?;
            match cells.get_mut(&sample.dimensions) {
                Some(state) => state.fold(sample.value, distinct_value),
                None => {
                    let mut state = AggregateState::empty(definition.function);
                    state.fold(sample.value, distinct_value);
                    cells.insert(sample.dimensions.clone(), state);
                }
            }
        }
        Ok(())
    }

    /// Visit every cell whose bucket start lies in `[bucket_start(range.start), range.end)`,
    /// in bucket order.
    pub fn visit_cells(
        &self,
        metric_id: &str,
        granularity: Granularity,
        range: &TimeRange,
        mut visit: impl FnMut(DateTime<Utc>, &Dimensions, &AggregateState),
    ) -> Result<(), Error> {
        let Some(series) = self.series(metric_id, granularity) else {
            return Ok(());
        };
        let buckets = series.buckets.read().map_err(|_| poisoned("series"))?;
        for (start, cells) in buckets.range(granularity.bucket_start(range.start())..range.end()) {
            let cells = lock_cells(cells)?;
            for (dimensions, state) in cells.iter() {
                visit(*start, dimensions, state);
            }
        }
        Ok(())
    }

    /// Bucket starts in the range that hold at least one cell.
    pub fn present_buckets(
        &self,
        metric_id: &str,
        granularity: Granularity,
        range: &TimeRange,
    ) -> Result<BTreeSet<DateTime<Utc>>, Error> {
        let Some(series) = self.series(metric_id, granularity) else {
            return Ok(BTreeSet::new());
        };
        let buckets = series.buckets.read().map_err(|_| poisoned("series"))?;
        let mut present = BTreeSet::new();
        for (start, cells) in buckets.range(granularity.bucket_start(range.start())..range.end()) {
            if !lock_cells(cells)?.is_empty() {
                present.insert(*start);
            }
        }
        Ok(present)
    }

    pub fn bucket_count(&self, metric_id: &str, granularity: Granularity) -> usize {
        self.series(metric_id, granularity)
            .and_then(|series| series.buckets.read().ok().map(|b| b.len()))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::function::AggregationFunction;
    use chrono::TimeDelta;

    fn at_s(seconds: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(seconds)
    }

    fn minute() -> Granularity {
        Granularity::from_seconds(60).unwrap()
    }

    fn hour() -> Granularity {
        Granularity::from_seconds(3_600).unwrap()
    }

    #[test]
    fn test_fold_into_every_granularity() {
        let store = BucketStore::new();
        let definition =
            MetricDefinition::new("messages_sent", AggregationFunction::Count, [minute(), hour()]);
        for t in [0, 3, 61, 62] {
            store
                .fold(&definition, &MetricSample::new("messages_sent", at_s(t), 1.0))
                .unwrap();
        }
        assert_eq!(store.bucket_count("messages_sent", minute()), 2);
        assert_eq!(store.bucket_count("messages_sent", hour()), 1);

        let range = TimeRange::new(at_s(0), at_s(120)).unwrap();
        let mut counts = Vec::new();
        store
            .visit_cells("messages_sent", minute(), &range, |start, _, state| {
                counts.push((start, state.value()));
            })
            .unwrap();
        assert_eq!(counts, vec![(at_s(0), Some(2.0)), (at_s(60), Some(2.0))]);
    }

    #[test]
    fn test_cells_split_by_dimension_set() {
        let store = BucketStore::new();
        let definition = MetricDefinition::new("messages_sent", AggregationFunction::Sum, [minute()]);
        for (channel, value) in [("C1", 1.0), ("C2", 5.0), ("C1", 2.0)] {
            let sample =
                MetricSample::new("messages_sent", at_s(10), value).with_dimension("channel", channel);
            store.fold(&definition, &sample).unwrap();
        }
        let range = TimeRange::new(at_s(0), at_s(60)).unwrap();
        let mut cells = Vec::new();
        store
            .visit_cells("messages_sent", minute(), &range, |_, dimensions, state| {
                cells.push((dimensions["channel"].clone(), state.value()));
            })
            .unwrap();
        assert_eq!(
            cells,
            vec![
                ("C1".to_string(), Some(3.0)),
                ("C2".to_string(), Some(5.0))
            ]
        );
    }

    #[test]
    fn test_range_includes_bucket_containing_start() {
        let store = BucketStore::new();
        let definition = MetricDefinition::new("m", AggregationFunction::Count, [minute()]);
        store
            .fold(&definition, &MetricSample::new("m", at_s(10), 1.0))
            .unwrap();
        store
            .fold(&definition, &MetricSample::new("m", at_s(130), 1.0))
            .unwrap();
        let range = TimeRange::new(at_s(30), at_s(120)).unwrap();
        let present = store.present_buckets("m", minute(), &range).unwrap();
        assert_eq!(present.into_iter().collect::<Vec<_>>(), vec![at_s(0)]);
    }

    #[test]
    fn test_unknown_series_is_empty() {
        let store = BucketStore::new();
        let range = TimeRange::new(at_s(0), at_s(60)).unwrap();
        let mut visited = 0;
        store
            .visit_cells("nothing", minute(), &range, |_, _, _| visited += 1)
            .unwrap();
        assert_eq!(visited, 0);
        assert!(store.present_buckets("nothing", minute(), &range).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_folds_lose_nothing() {
        let store = Arc::new(BucketStore::new());
        let definition = Arc::new(MetricDefinition::new(
            "messages_sent",
            AggregationFunction::Count,
            [minute()],
        ));
        let mut handles = Vec::new();
        for task in 0..8 {
            let store = store.clone();
            let definition = definition.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..250 {
                    // Half the tasks share one bucket, the rest spread over several
                    let t = if task % 2 == 0 { 5 } else { i % 180 };
                    store
                        .fold(&definition, &MetricSample::new("messages_sent", at_s(t), 1.0))
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let range = TimeRange::new(at_s(0), at_s(180)).unwrap();
        let mut total = 0;
        store
            .visit_cells("messages_sent", minute(), &range, |_, _, state| {
                total += state.sample_count();
            })
            .unwrap();
        assert_eq!(total, 8 * 250);
    }
}
