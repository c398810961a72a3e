use std::fmt::Display;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;

use tally_core::aggregation::{Dimensions, Granularity, MetricSample, TimeRange};
use tally_core::clock::SystemClock;
use tally_core::config::Config;
use tally_core::context::TallyContext;
use tally_core::export::{self, ExportFormat};
use tally_core::observability::{self, LogFormat};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, env = "TALLY_CONFIG")]
    config: PathBuf,

    /// JSON-lines file of samples to ingest before running the command.
    #[arg(long)]
    samples: Option<PathBuf>,

    /// Sets the log format used for all logs.
    #[arg(long)]
    #[arg(value_enum)]
    #[clap(default_value_t = LogFormat::default())]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the bucket series for a metric.
    Query {
        #[command(flatten)]
        range: RangeArgs,
        #[arg(long)]
        granularity: Granularity,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Print the top values of a dimension, read from the same buckets as `summary`.
    Top {
        #[command(flatten)]
        range: RangeArgs,
        #[arg(long)]
        dimension: String,
        #[arg(short, long, default_value_t = 10)]
        n: usize,
    },
    /// Print one aggregate over the finest-granularity buckets starting in
    /// `[bucket_start(start), end)`.
    Summary {
        #[command(flatten)]
        range: RangeArgs,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Write the bucket series as CSV or JSON.
    Export {
        #[command(flatten)]
        range: RangeArgs,
        #[arg(long)]
        granularity: Granularity,
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long, value_enum, default_value_t = ExportFormat::default())]
        format: ExportFormat,
        /// Dimension columns to append to each CSV row.
        #[arg(long, value_delimiter = ',')]
        columns: Vec<String>,
    },
}

#[derive(ClapArgs, Debug)]
struct RangeArgs {
    #[arg(long)]
    metric: String,
    /// Inclusive start, RFC 3339.
    #[arg(long)]
    start: DateTime<Utc>,
    /// Exclusive end, RFC 3339.
    #[arg(long)]
    end: DateTime<Utc>,
}

impl RangeArgs {
    fn time_range(&self) -> Result<TimeRange> {
        Ok(TimeRange::new(self.start, self.end)?)
    }
}

#[derive(ClapArgs, Debug)]
struct FilterArgs {
    /// Dimension filter as `name=value`; may be repeated.
    #[arg(long = "filter", value_parser = parse_filter)]
    filters: Vec<(String, String)>,
}

impl FilterArgs {
    fn dimensions(&self) -> Dimensions {
        self.filters.iter().cloned().collect()
    }
}

fn parse_filter(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected `name=value`, got `{s}`")),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    observability::setup_logging(args.log_format).expect_pretty("Failed to set up logs");
    observability::describe_metrics();

    let config = Config::load_from_path(&args.config).expect_pretty("Failed to load config");
    let context = TallyContext::from_config(&config, Arc::new(SystemClock), None)
        .await
        .expect_pretty("Failed to initialize");

    if let Some(path) = &args.samples {
        let samples = load_samples(path).expect_pretty("Failed to read samples");
        let ingested = context
            .engine
            .ingest_batch(&samples)
            .expect_pretty("Failed to ingest samples");
        tracing::info!("Ingested {ingested} sample(s) from `{}`", path.display());
    }

    let output = run(&context, args.command)
        .await
        .expect_pretty("Command failed");
    println!("{output}");
}

async fn run(context: &TallyContext, command: Command) -> Result<String> {
    let engine = &context.engine;
    match command {
        Command::Query {
            range,
            granularity,
            filters,
        } => {
            let outcome = engine
                .query(
                    &range.metric,
                    &range.time_range()?,
                    granularity,
                    &filters.dimensions(),
                )
                .await?;
            to_pretty_json(&outcome)
        }
        Command::Top {
            range,
            dimension,
            n,
        } => {
            let outcome = engine
                .top_n(&range.metric, &range.time_range()?, &dimension, n)
                .await?;
            to_pretty_json(&outcome)
        }
        Command::Summary { range, filters } => {
            let outcome = engine
                .summary(&range.metric, &range.time_range()?, &filters.dimensions())
                .await?;
            to_pretty_json(&outcome)
        }
        Command::Export {
            range,
            granularity,
            filters,
            format,
            columns,
        } => {
            let outcome = engine
                .query(
                    &range.metric,
                    &range.time_range()?,
                    granularity,
                    &filters.dimensions(),
                )
                .await?;
            if outcome.backfill.is_unavailable() {
                tracing::warn!("Exporting partial data: {:?}", outcome.backfill);
            }
            let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
            Ok(export::export(&outcome.value, format, &columns)?)
        }
    }
}

fn to_pretty_json(value: &impl Serialize) -> Result<String> {
    serde_json::to_string_pretty(value).context("Failed to serialize result")
}

/// Read one `MetricSample` per non-blank line.
fn load_samples(path: &Path) -> Result<Vec<MetricSample>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open `{}`", path.display()))?;
    let mut samples = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read `{}`", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let sample = serde_json::from_str(&line)
            .with_context(|| format!("Invalid sample on line {}", index + 1))?;
        samples.push(sample);
    }
    Ok(samples)
}

/// `expect_pretty` will log an error message and exit with a status code of 1.
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("{msg}: {err:#}");
                std::process::exit(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_args_are_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_filter() {
        assert_eq!(
            parse_filter("channel=general").unwrap(),
            ("channel".to_string(), "general".to_string())
        );
        assert_eq!(
            parse_filter("topic=a=b").unwrap(),
            ("topic".to_string(), "a=b".to_string())
        );
        assert!(parse_filter("=general").is_err());
        assert!(parse_filter("general").is_err());
    }

    #[test]
    fn test_parse_export_command() {
        let args = Args::try_parse_from([
            "tally",
            "--config",
            "tally.toml",
            "export",
            "--metric",
            "messages_sent",
            "--start",
            "2024-05-01T00:00:00Z",
            "--end",
            "2024-05-02T00:00:00Z",
            "--granularity",
            "1h",
            "--filter",
            "channel=general",
            "--columns",
            "channel,team",
            "--format",
            "json",
        ])
        .unwrap();
        let Command::Export {
            range,
            granularity,
            filters,
            format,
            columns,
        } = args.command
        else {
            panic!("expected the export subcommand");
        };
        assert_eq!(range.metric, "messages_sent");
        assert_eq!(granularity.seconds(), 3_600);
        assert_eq!(filters.dimensions().len(), 1);
        assert_eq!(format, ExportFormat::Json);
        assert_eq!(columns, vec!["channel", "team"]);
    }

    #[test]
    fn test_load_samples_skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"metric_id":"messages_sent","timestamp":"2024-05-01T00:00:03Z","dimensions":{{"channel":"C1"}}}}"#
        )
        .unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"metric_id":"messages_sent","timestamp":"2024-05-01T00:01:03Z","value":2.5}}"#
        )
        .unwrap();
        let samples = load_samples(file.path()).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].dimension("channel"), Some("C1"));
        assert_eq!(samples[1].value, 2.5);
    }

    #[test]
    fn test_load_samples_reports_line_number() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{}}").unwrap();
        let err = load_samples(file.path()).unwrap_err();
        assert!(err.to_string().contains("line 1"), "{err}");
    }
}
