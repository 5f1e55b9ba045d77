use stress_latency::LatencyError;
use thiserror::Error;

use crate::client::RequestError;

/// Errors that end a stress run or its teardown.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    /// The cluster is not ready for a run, or could not be reached.
    #[error("preflight check failed: {0}")]
    Preflight(String),
    #[error("teardown failed: {0}")]
    Teardown(String),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Latency(#[from] LatencyError),
    #[error("failed to register metrics")]
    Metrics(#[from] prometheus::Error),
    #[error("stopped before completion")]
    Cancelled,
}

/// Result type for stress runs.
pub type Result<T, E = Error> = std::result::Result<T, E>;
