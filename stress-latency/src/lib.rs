//! Latency bookkeeping for Kubernetes API stress runs.
//!
//! This crate holds the data side of a stress run: raw request
//! [`Durations`], discrete [`HistogramBuckets`] derived from cumulative
//! counters, and per-category [`Summary`] reports that can be rendered as
//! tables, encoded as JSON, and compared against each other.

mod durations;
mod error;
mod histogram;
mod summary;

pub use durations::{DurationWithLabel, Durations, LabeledDurations, Percentile};
pub use error::{LatencyError, Result};
pub use histogram::{
    CumulativeBucket, CumulativeHistogram, HistogramBucket, HistogramBuckets,
    LATENCY_BUCKET_COUNT, LATENCY_BUCKET_FACTOR, LATENCY_BUCKET_START, LATENCY_SCALE,
    exponential_buckets, latency_bucket_bounds,
};
pub use summary::{Summary, SummaryCompare, compare};
