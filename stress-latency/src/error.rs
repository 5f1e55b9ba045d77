use thiserror::Error;

/// Errors raised while building, merging, or exporting latency data.
#[derive(Debug, Error)]
pub enum LatencyError {
    /// Two histograms disagree on the bounds (or scale) of a bucket.
    #[error("histogram bucket [{lower}, {upper}) has no counterpart with matching bounds")]
    BoundsMismatch { lower: f64, upper: f64 },
    /// Two histograms have a different number of buckets.
    #[error("histogram length mismatch ({a} != {b})")]
    HistogramLenMismatch { a: usize, b: usize },
    /// A cumulative source reported counts that decrease, or exceed its total.
    #[error("invalid cumulative histogram: {0}")]
    InvalidCumulative(String),
    /// A summary was requested over durations that were never sorted.
    #[error("durations must be sorted before picking percentiles")]
    UnsortedDurations,
    #[error("failed to write CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for latency operations.
pub type Result<T, E = LatencyError> = std::result::Result<T, E>;
