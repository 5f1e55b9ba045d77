use stress_tester::RequestError;
use thiserror::Error;

/// Errors of the in-cluster runner.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("preflight check failed: {0}")]
    Preflight(String),
    #[error("failed to {action} ({source})")]
    Request {
        action: String,
        #[source]
        source: RequestError,
    },
    #[error("failed to render manifest")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The CronJob did not complete enough pods in time.
    #[error("{succeeded} of {target} pods succeeded before the completion timeout")]
    CompletionTimeout { succeeded: usize, target: usize },
    #[error("pods failed: {}", failed.join(", "))]
    PodsFailed { failed: Vec<String> },
    #[error("teardown failed: {0}")]
    Teardown(String),
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn request(action: impl Into<String>) -> impl FnOnce(RequestError) -> Self {
        let action = action.into();
        move |source| Error::Request { action, source }
    }
}

/// Result type for the in-cluster runner.
pub type Result<T, E = Error> = std::result::Result<T, E>;
