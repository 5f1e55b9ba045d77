//! Timing and classification of individual API requests.
//!
//! Every request issued by a stress run goes through [`Recorder::timed`],
//! which measures it, increments exactly one of the category's success or
//! failure counters, records the duration in the category's sample store,
//! and observes it in the category's latency histogram.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use stress_latency::Durations;
use tokio::time::Instant;

use crate::client::RequestError;
use crate::metrics::{Category, Registry};

/// Classified outcome of a single request attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Success,
    Failure,
    /// A write lost an optimistic concurrency race. Counted as a failure.
    Conflict,
}

impl Outcome {
    /// Any error is a failure.
    pub fn of_request<T>(result: &Result<T, RequestError>) -> Self {
        match result {
            Ok(_) => Outcome::Success,
            Err(_) => Outcome::Failure,
        }
    }

    /// A missing object is an expected answer to a get.
    pub fn of_get<T>(result: &Result<T, RequestError>) -> Self {
        match result {
            Ok(_) | Err(RequestError::NotFound) => Outcome::Success,
            Err(_) => Outcome::Failure,
        }
    }

    /// Losing a create race to another worker is not a failure.
    pub fn of_create<T>(result: &Result<T, RequestError>) -> Self {
        match result {
            Ok(_) | Err(RequestError::AlreadyExists) => Outcome::Success,
            Err(_) => Outcome::Failure,
        }
    }

    pub fn of_update<T>(result: &Result<T, RequestError>) -> Self {
        match result {
            Ok(_) => Outcome::Success,
            Err(RequestError::Conflict) => Outcome::Conflict,
            Err(_) => Outcome::Failure,
        }
    }
}

/// Append-only durations of one category, shared by concurrent workers.
#[derive(Debug, Default)]
pub struct SampleStore(Mutex<Durations>);

impl SampleStore {
    pub fn append(&self, duration: Duration) {
        self.lock().append(duration);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns all samples recorded so far.
    pub fn take(&self) -> Durations {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Durations> {
        // A panic while appending cannot leave the samples half-written.
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Measures requests into a [`Registry`] and per-category sample stores.
#[derive(Debug)]
pub struct Recorder {
    registry: Registry,
    writes: SampleStore,
    gets: SampleStore,
    range_gets: SampleStore,
}

impl Recorder {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            registry: Registry::new()?,
            writes: SampleStore::default(),
            gets: SampleStore::default(),
            range_gets: SampleStore::default(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn samples(&self, category: Category) -> &SampleStore {
        match category {
            Category::Writes => &self.writes,
            Category::Gets => &self.gets,
            Category::RangeGets => &self.range_gets,
        }
    }

    /// Records one finished request attempt.
    pub fn observe(&self, category: Category, took: Duration, outcome: Outcome) {
        let metrics = self.registry.category(category);
        match outcome {
            Outcome::Success => metrics.record_success(),
            Outcome::Failure => metrics.record_failure(),
            Outcome::Conflict => {
                metrics.record_failure();
                metrics.record_conflict();
            }
        }
        self.samples(category).append(took);
        metrics.observe_millis(took.as_secs_f64() * 1000.0);
    }

    /// Awaits `request`, recording its duration and classified outcome.
    pub async fn timed<T, F>(
        &self,
        category: Category,
        classify: fn(&Result<T, RequestError>) -> Outcome,
        request: F,
    ) -> Result<T, RequestError>
    where
        F: Future<Output = Result<T, RequestError>>,
    {
        let start = Instant::now();
        let result = request.await;
        self.observe(category, start.elapsed(), classify(&result));
        result
    }
}

#[cfg(test)]
mod tests {
    use stress_latency::{HistogramBuckets, LATENCY_SCALE};

    use super::*;

    #[tokio::test]
    async fn every_attempt_is_counted_once() {
        let recorder = Recorder::new().unwrap();

        let ok: Result<(), _> = recorder
            .timed(Category::Writes, Outcome::of_update, async { Ok(()) })
            .await;
        assert!(ok.is_ok());
        let conflict: Result<(), _> = recorder
            .timed(Category::Writes, Outcome::of_update, async {
                Err(RequestError::Conflict)
            })
            .await;
        assert_eq!(conflict, Err(RequestError::Conflict));
        let _: Result<(), _> = recorder
            .timed(Category::Writes, Outcome::of_create, async {
                Err(RequestError::AlreadyExists)
            })
            .await;

        let snapshot = recorder.registry().snapshot(Category::Writes);
        assert_eq!(snapshot.success_total, 2);
        assert_eq!(snapshot.failure_total, 1);
        assert_eq!(snapshot.conflicts_total, 1);
        assert_eq!(recorder.samples(Category::Writes).len(), 3);

        let histogram = HistogramBuckets::parse(LATENCY_SCALE, &snapshot.latency).unwrap();
        assert_eq!(histogram.total_count(), 3);
    }

    #[test]
    fn benign_errors_are_successes() {
        let not_found: Result<(), _> = Err(RequestError::NotFound);
        assert_eq!(Outcome::of_get(&not_found), Outcome::Success);
        assert_eq!(Outcome::of_request(&not_found), Outcome::Failure);

        let exists: Result<(), _> = Err(RequestError::AlreadyExists);
        assert_eq!(Outcome::of_create(&exists), Outcome::Success);
        assert_eq!(Outcome::of_update(&exists), Outcome::Failure);

        let timeout: Result<(), _> = Err(RequestError::Timeout(Duration::from_secs(30)));
        assert_eq!(Outcome::of_get(&timeout), Outcome::Failure);
    }

    #[test]
    fn take_drains_samples() {
        let recorder = Recorder::new().unwrap();
        recorder.observe(Category::Gets, Duration::from_millis(3), Outcome::Success);
        recorder.observe(Category::Gets, Duration::from_millis(1), Outcome::Success);

        let samples = recorder.samples(Category::Gets).take();
        assert_eq!(samples.len(), 2);
        assert!(recorder.samples(Category::Gets).is_empty());
        assert!(recorder.samples(Category::RangeGets).is_empty());
    }
}
