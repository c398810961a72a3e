use std::fmt::{Debug, Display};
use std::time::Duration;

pub const IMPOSSIBLE_ERROR_MESSAGE: &str =
    "This should never happen, please file a bug report against tally";

#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    #[must_use]
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    #[must_use]
    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    #[must_use]
    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    #[must_use]
    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    /// Configuration errors and invalid queries are caller bugs and should fail fast.
    pub fn is_caller_bug(&self) -> bool {
        matches!(
            *self.0,
            ErrorDetails::Config { .. }
                | ErrorDetails::InvalidQuery { .. }
                | ErrorDetails::UnknownGranularity { .. }
                | ErrorDetails::UnknownMetric { .. }
                | ErrorDetails::UnknownOperation { .. }
        )
    }

    pub fn log(&self) {
        self.0.log();
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    BackfillUnavailable {
        metric_id: String,
        message: String,
    },
    BackfillTimeout {
        metric_id: String,
        timeout: Duration,
    },
    Config {
        message: String,
    },
    Export {
        message: String,
    },
    FileRead {
        message: String,
        file_path: String,
    },
    InternalError {
        message: String,
    },
    InvalidQuery {
        message: String,
    },
    Observability {
        message: String,
    },
    QuotaStore {
        message: String,
    },
    Serialization {
        message: String,
    },
    UnknownGranularity {
        metric_id: String,
        granularity: String,
    },
    UnknownMetric {
        metric_id: String,
    },
    UnknownOperation {
        operation: String,
    },
    ValkeyConnection {
        message: String,
    },
    ValkeyQuery {
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::Config { .. }
            | ErrorDetails::InternalError { .. }
            | ErrorDetails::Observability { .. }
            | ErrorDetails::Serialization { .. }
            | ErrorDetails::UnknownGranularity { .. }
            | ErrorDetails::UnknownMetric { .. }
            | ErrorDetails::UnknownOperation { .. }
            | ErrorDetails::ValkeyConnection { .. } => tracing::Level::ERROR,
            ErrorDetails::BackfillUnavailable { .. }
            | ErrorDetails::BackfillTimeout { .. }
            | ErrorDetails::Export { .. }
            | ErrorDetails::FileRead { .. }
            | ErrorDetails::InvalidQuery { .. }
            | ErrorDetails::QuotaStore { .. }
            | ErrorDetails::ValkeyQuery { .. } => tracing::Level::WARN,
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::BackfillUnavailable { metric_id, message } => {
                write!(f, "Backfill unavailable for metric `{metric_id}`: {message}")
            }
            ErrorDetails::BackfillTimeout { metric_id, timeout } => {
                write!(
                    f,
                    "Backfill for metric `{metric_id}` timed out after {}ms",
                    timeout.as_millis()
                )
            }
            ErrorDetails::Config { message } => {
                write!(f, "Configuration error: {message}")
            }
            ErrorDetails::Export { message } => {
                write!(f, "Failed to export series: {message}")
            }
            ErrorDetails::FileRead { message, file_path } => {
                write!(f, "Error reading file {file_path}: {message}")
            }
            ErrorDetails::InternalError { message } => {
                write!(f, "Internal error: {message}")
            }
            ErrorDetails::InvalidQuery { message } => {
                write!(f, "Invalid query: {message}")
            }
            ErrorDetails::Observability { message } => {
                write!(f, "Error setting up observability: {message}")
            }
            ErrorDetails::QuotaStore { message } => {
                write!(f, "Error in quota counter store: {message}")
            }
            ErrorDetails::Serialization { message } => {
                write!(f, "Serialization error: {message}")
            }
            ErrorDetails::UnknownGranularity {
                metric_id,
                granularity,
            } => {
                write!(
                    f,
                    "Granularity `{granularity}` is not registered for metric `{metric_id}`"
                )
            }
            ErrorDetails::UnknownMetric { metric_id } => {
                write!(f, "Unknown metric: `{metric_id}`")
            }
            ErrorDetails::UnknownOperation { operation } => {
                write!(f, "Unknown operation class: `{operation}`")
            }
            ErrorDetails::ValkeyConnection { message } => {
                write!(f, "Error connecting to Valkey: {message}")
            }
            ErrorDetails::ValkeyQuery { message } => {
                write!(f, "Failed to run Valkey query: {message}")
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorDetails::Serialization {
            message: err.to_string(),
        })
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::new(ErrorDetails::ValkeyQuery {
            message: err.to_string(),
        })
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::new(ErrorDetails::Config {
            message: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_bug_classification() {
        let config = Error::new_without_logging(ErrorDetails::Config {
            message: "missing".to_string(),
        });
        assert!(config.is_caller_bug());

        let query = Error::new_without_logging(ErrorDetails::InvalidQuery {
            message: "start after end".to_string(),
        });
        assert!(query.is_caller_bug());

        let backfill = Error::new_without_logging(ErrorDetails::BackfillUnavailable {
            metric_id: "messages_sent".to_string(),
            message: "connection refused".to_string(),
        });
        assert!(!backfill.is_caller_bug());
    }

    #[test]
    fn test_display_includes_identifiers() {
        let err = Error::new_without_logging(ErrorDetails::UnknownGranularity {
            metric_id: "messages_sent".to_string(),
            granularity: "5m".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "Granularity `5m` is not registered for metric `messages_sent`"
        );
    }
}
