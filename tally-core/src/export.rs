//! Serializing bucket series for reports.
//!
//! CSV rows are `timestamp,value,sample_count` followed by one column per
//! requested dimension. A series is already restricted to its filter, so each
//! dimension column holds the filter value (or is empty when that dimension was
//! not filtered on).

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::aggregation::BucketSeries;
use crate::error::{Error, ErrorDetails};

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

pub fn export(
    series: &BucketSeries,
    format: ExportFormat,
    dimension_columns: &[&str],
) -> Result<String, Error> {
    match format {
        ExportFormat::Csv => to_csv(series, dimension_columns),
        ExportFormat::Json => to_json(series),
    }
}

pub fn to_csv(series: &BucketSeries, dimension_columns: &[&str]) -> Result<String, Error> {
    let mut out = String::new();
    let header = ["timestamp", "value", "sample_count"]
        .into_iter()
        .chain(dimension_columns.iter().copied())
        .map(escape_field)
        .collect::<Vec<_>>()
        .join(",");
    out.push_str(&header);
    out.push('\n');

    let dimension_values = dimension_columns
        .iter()
        .map(|name| escape_field(series.filters.get(*name).map_or("", String::as_str)))
        .collect::<Vec<_>>();
    for bucket in &series.buckets {
        write!(
            out,
            "{},{},{}",
            bucket.start.to_rfc3339(),
            bucket.value,
            bucket.sample_count
        )
        .map_err(csv_error)?;
        for value in &dimension_values {
            write!(out, ",{value}").map_err(csv_error)?;
        }
        out.push('\n');
    }
    Ok(out)
}

pub fn to_json(series: &BucketSeries) -> Result<String, Error> {
    serde_json::to_string_pretty(series).map_err(|e| {
        Error::new(ErrorDetails::Export {
            message: format!("Failed to serialize series for `{}`: {e}", series.metric_id),
        })
    })
}

fn csv_error(e: std::fmt::Error) -> Error {
    Error::new(ErrorDetails::Export {
        message: format!("Failed to write CSV row: {e}"),
    })
}

fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeDelta, Utc};

    use super::*;
    use crate::aggregation::{Bucket, Dimensions, Granularity, TimeRange};

    fn series(filters: Dimensions) -> BucketSeries {
        let start = DateTime::<Utc>::UNIX_EPOCH;
        let minute = TimeDelta::seconds(60);
        BucketSeries {
            metric_id: "messages_sent".to_string(),
            granularity: Granularity::from_seconds(60).unwrap(),
            range: TimeRange::new(start, start + minute * 2).unwrap(),
            filters,
            buckets: vec![
                Bucket {
                    start,
                    end: start + minute,
                    value: 2.0,
                    sample_count: 2,
                    provisional: false,
                },
                Bucket {
                    start: start + minute,
                    end: start + minute * 2,
                    value: 1.5,
                    sample_count: 4,
                    provisional: true,
                },
            ],
        }
    }

    #[test]
    fn test_csv_layout() {
        let mut filters = Dimensions::new();
        filters.insert("channel".to_string(), "general".to_string());
        let csv = to_csv(&series(filters), &["channel", "team"]).unwrap();
        assert_eq!(
            csv,
            "timestamp,value,sample_count,channel,team\n\
             1970-01-01T00:00:00+00:00,2,2,general,\n\
             1970-01-01T00:01:00+00:00,1.5,4,general,\n"
        );
    }

    #[test]
    fn test_csv_quotes_awkward_values() {
        let mut filters = Dimensions::new();
        filters.insert("channel".to_string(), "say \"hi\", all".to_string());
        let csv = to_csv(&series(filters), &["channel"]).unwrap();
        let first_row = csv.lines().nth(1).unwrap();
        assert!(first_row.ends_with(",\"say \"\"hi\"\", all\""), "{first_row}");
    }

    #[test]
    fn test_csv_empty_series_has_header() {
        let mut empty = series(Dimensions::new());
        empty.buckets.clear();
        assert_eq!(
            export(&empty, ExportFormat::Csv, &[]).unwrap(),
            "timestamp,value,sample_count\n"
        );
    }

    #[test]
    fn test_json_export() {
        let json = export(&series(Dimensions::new()), ExportFormat::Json, &[]).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["metric_id"], "messages_sent");
        assert_eq!(parsed["buckets"][1]["provisional"], true);
        assert_eq!(parsed["buckets"][0]["sample_count"], 2);
    }
}
