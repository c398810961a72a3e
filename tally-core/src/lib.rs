//! Outbound API quota limiting and time-bucketed metric aggregation.
//!
//! [`rate_limiting::QuotaLimiter`] decides whether a call to a remote platform
//! API may go out now. [`aggregation::AggregationEngine`] folds metric samples
//! into time buckets and answers series, top-N and summary queries with a TTL
//! cache and optional backfill of missing history. [`context::TallyContext`]
//! wires both from a [`config::Config`].

pub mod aggregation;
pub mod clock;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod export;
pub mod observability;
pub mod rate_limiting;
