use clap::ValueEnum;
use metrics::{Unit, describe_counter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::error::{Error, ErrorDetails};

const DEFAULT_DIRECTIVES: &str = "warn,tally_core=info,tally_cli=info";

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over the built-in directives when it is set.
pub fn setup_logging(log_format: LogFormat) -> Result<(), Error> {
    let env_var_name = "RUST_LOG";
    let filter = if std::env::var(env_var_name).is_ok() {
        EnvFilter::builder()
            .with_env_var(env_var_name)
            .from_env()
            .map_err(|e| {
                Error::new(ErrorDetails::Observability {
                    message: format!("Invalid `{env_var_name}` environment variable: {e}"),
                })
            })?
    } else {
        EnvFilter::builder().parse(DEFAULT_DIRECTIVES).map_err(|e| {
            Error::new(ErrorDetails::InternalError {
                message: format!("Failed to parse default log directives: {e}"),
            })
        })?
    };

    let log_layer = match log_format {
        LogFormat::Pretty => {
            Box::new(tracing_subscriber::fmt::layer()) as Box<dyn Layer<_> + Send + Sync>
        }
        LogFormat::Json => Box::new(tracing_subscriber::fmt::layer().json()),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(log_layer)
        .try_init()
        .map_err(|e| {
            Error::new(ErrorDetails::Observability {
                message: format!("Failed to install tracing subscriber: {e}"),
            })
        })
}

/// Register the counters this crate records, with their units and docstrings.
/// Recording is a no-op until the host process installs a `metrics` recorder.
pub fn describe_metrics() {
    describe_counter!(
        "tally_quota_decisions_total",
        Unit::Count,
        "Quota decisions, labelled by operation and outcome (`granted` or `denied`)",
    );

    describe_counter!(
        "tally_samples_ingested_total",
        Unit::Count,
        "Samples folded into buckets, labelled by metric",
    );

    describe_counter!(
        "tally_query_cache_total",
        Unit::Count,
        "Query cache lookups, labelled by result (`hit` or `miss`)",
    );

    describe_counter!(
        "tally_backfill_total",
        Unit::Count,
        "Backfill attempts, labelled by metric and status",
    );
}
