use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::client::RequestError;

/// Bounded backoff schedule for retrying conflicting writes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    /// Maximum number of attempts.
    pub steps: u32,
    /// Delay before the second attempt.
    pub duration: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub factor: f64,
    /// Upper bound of random extra delay, as a fraction of the delay.
    pub jitter: f64,
}

impl Backoff {
    /// Five attempts, 10ms apart, with up to 10% jitter.
    pub const DEFAULT_RETRY: Backoff = Backoff {
        steps: 5,
        duration: Duration::from_millis(10),
        factor: 1.0,
        jitter: 0.1,
    };

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = rand::rng().random_range(0.0..self.jitter);
        delay.mul_f64(1.0 + extra)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::DEFAULT_RETRY
    }
}

/// Runs `operation` until it succeeds, fails with anything other than
/// [`RequestError::Conflict`], or the backoff runs out of steps.
///
/// Returns the last error once all attempts have conflicted.
pub async fn retry_on_conflict<T, F, Fut>(
    backoff: Backoff,
    mut operation: F,
) -> Result<T, RequestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
{
    let mut delay = backoff.duration;
    let mut attempt = 1;
    loop {
        match operation().await {
            Err(RequestError::Conflict) if attempt < backoff.steps => {
                tracing::trace!(attempt, "conflict, retrying");
                tokio::time::sleep(backoff.jittered(delay)).await;
                delay = delay.mul_f64(backoff.factor);
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn retries_conflicts_until_success() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let start = Instant::now();

        let result = retry_on_conflict(Backoff::DEFAULT_RETRY, move || async move {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(RequestError::Conflict),
                _ => Ok("updated"),
            }
        })
        .await;

        assert_eq!(result, Ok("updated"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // Two delays of 10ms, each with less than 10% jitter.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed <= Duration::from_millis(24));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_all_steps() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result: Result<(), _> = retry_on_conflict(Backoff::DEFAULT_RETRY, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(RequestError::Conflict)
        })
        .await;

        assert_eq!(result, Err(RequestError::Conflict));
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result: Result<(), _> = retry_on_conflict(Backoff::DEFAULT_RETRY, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(RequestError::Transient("boom".into()))
        })
        .await;

        assert_eq!(result, Err(RequestError::Transient("boom".into())));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
