//! The stress run itself.
//!
//! A run drives two loops concurrently against one namespace:
//!
//! - The update loop cycles through [`KEYSPACE`] pod names. Every iteration
//!   starts `update_concurrency` workers on the same pod, each of which reads
//!   it, creates it if missing, or toggles its annotations and replaces it,
//!   retrying on conflicts. The next iteration only starts once all workers of
//!   the current one are finished.
//! - The range loop repeatedly lists the first page of pods.
//!
//! The run ends when the run timeout elapses, the caller's stop token fires,
//! or the [`DoneSignal`] is closed. Each loop then hands its samples back; a
//! loop that does not return within [`RESULT_WAIT_TIMEOUT`] is abandoned and
//! whatever it recorded so far is used instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use stress_latency::{
    Durations, HistogramBuckets, LATENCY_SCALE, LabeledDurations, Summary,
};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::client::{RequestError, StressClient, wait_namespace_deleted};
use crate::config::StressConfig;
use crate::error::{Error, Result};
use crate::instrument::{Outcome, Recorder};
use crate::metrics::Category;
use crate::pod::{DEFAULT_IMAGE, KEYSPACE, object_key, pod_object, random_value, toggle_annotations};
use crate::retry::{Backoff, retry_on_conflict};

/// How long to wait for each loop to hand back its samples once a run ends.
pub const RESULT_WAIT_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Interval between progress log lines of both loops.
const LOG_EVERY: u64 = 20;

/// Interval between checks whether a deleted namespace is gone.
pub const NAMESPACE_DELETE_INTERVAL: Duration = Duration::from_secs(15);

/// Upper bound for a namespace deletion to complete.
pub const NAMESPACE_DELETE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Signal that ends a run. It can be closed any number of times, but only the
/// first close has an effect.
#[derive(Debug, Default)]
pub struct DoneSignal {
    closed: AtomicBool,
    token: CancellationToken,
}

impl DoneSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes the signal. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal is closed.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// Latency summaries of a finished run, plus the raw samples they were built
/// from.
#[derive(Clone, Debug, Serialize)]
pub struct StressResult {
    #[serde(rename = "latency_summary_writes")]
    pub writes: Summary,
    #[serde(rename = "latency_summary_gets")]
    pub gets: Summary,
    #[serde(rename = "latency_summary_range_gets")]
    pub range_gets: Summary,
    /// Whether the run was stopped before its run timeout.
    #[serde(skip)]
    pub stopped: bool,
    #[serde(skip)]
    pub samples: RunSamples,
}

/// Sorted durations of all categories.
#[derive(Clone, Debug, Default)]
pub struct RunSamples {
    pub writes: Durations,
    pub gets: Durations,
    pub range_gets: Durations,
}

impl RunSamples {
    pub fn get(&self, category: Category) -> &Durations {
        match category {
            Category::Writes => &self.writes,
            Category::Gets => &self.gets,
            Category::RangeGets => &self.range_gets,
        }
    }

    /// All samples, labeled with their category and sorted by duration.
    pub fn labeled(&self) -> LabeledDurations {
        let mut labeled = LabeledDurations::new();
        for category in Category::ALL {
            labeled.extend(self.get(category).labeled(category.label()));
        }
        labeled.sort();
        labeled
    }
}

impl StressResult {
    pub fn summary(&self, category: Category) -> &Summary {
        match category {
            Category::Writes => &self.writes,
            Category::Gets => &self.gets,
            Category::RangeGets => &self.range_gets,
        }
    }
}

/// State shared between the driver and its loops.
#[derive(Clone)]
struct RunContext {
    config: Arc<StressConfig>,
    client: Arc<dyn StressClient>,
    recorder: Arc<Recorder>,
    stop: CancellationToken,
    done: Arc<DoneSignal>,
}

impl RunContext {
    fn should_stop(&self) -> bool {
        self.stop.is_cancelled() || self.done.is_closed()
    }

    fn namespace(&self) -> &str {
        &self.config.namespace
    }
}

/// Drives a stress run against a cluster.
pub struct Stresser {
    config: Arc<StressConfig>,
    client: Arc<dyn StressClient>,
    recorder: Arc<Recorder>,
    stop: CancellationToken,
    done: Arc<DoneSignal>,
}

impl std::fmt::Debug for Stresser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stresser")
            .field("config", &self.config)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl Stresser {
    /// Creates a driver, filling defaults and validating `config`.
    pub fn new(mut config: StressConfig, client: Arc<dyn StressClient>) -> Result<Self> {
        config.validate_and_set_defaults()?;
        Ok(Self {
            config: Arc::new(config),
            client,
            recorder: Arc::new(Recorder::new()?),
            stop: CancellationToken::new(),
            done: Arc::new(DoneSignal::new()),
        })
    }

    /// Uses `stop` as the external stop signal of the run.
    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn config(&self) -> &StressConfig {
        &self.config
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// The run's done signal. Closing it ends a running apply early.
    pub fn done(&self) -> &DoneSignal {
        &self.done
    }

    /// Runs preflight checks, drives the load until the run ends, and returns
    /// the latency summaries of all three categories.
    ///
    /// A run ended through the stop token still yields summaries of what was
    /// measured so far.
    pub async fn apply(&self) -> Result<StressResult> {
        self.preflight().await?;

        let image = self
            .config
            .busybox_image
            .clone()
            .unwrap_or_else(|| DEFAULT_IMAGE.to_owned());
        let context = RunContext {
            config: Arc::clone(&self.config),
            client: Arc::clone(&self.client),
            recorder: Arc::clone(&self.recorder),
            stop: self.stop.clone(),
            done: Arc::clone(&self.done),
        };

        let (writes_tx, writes_rx) = oneshot::channel();
        let (gets_tx, gets_rx) = oneshot::channel();
        let (range_tx, range_rx) = oneshot::channel();

        let updates = tokio::spawn({
            let context = context.clone();
            async move {
                update_loop(&context, image).await;
                // Workers are joined per iteration, so nothing appends anymore.
                let _ = writes_tx.send(context.recorder.samples(Category::Writes).take());
                let _ = gets_tx.send(context.recorder.samples(Category::Gets).take());
            }
        });
        let range_gets = tokio::spawn({
            let context = context.clone();
            async move {
                range_loop(&context).await;
                let _ = range_tx.send(context.recorder.samples(Category::RangeGets).take());
            }
        });

        tracing::info!(timeout = ?self.config.run_timeout, "waiting for run to finish");
        let stopped = tokio::select! {
            _ = self.stop.cancelled() => {
                tracing::warn!("stop requested, collecting partial results");
                true
            }
            _ = self.done.closed() => {
                tracing::info!("done signaled, collecting results");
                false
            }
            _ = tokio::time::sleep(self.config.run_timeout) => {
                tracing::info!("run timeout elapsed, collecting results");
                false
            }
        };
        self.done.close();

        let mut samples = RunSamples {
            writes: self.collect(Category::Writes, writes_rx).await,
            gets: self.collect(Category::Gets, gets_rx).await,
            range_gets: self.collect(Category::RangeGets, range_rx).await,
        };
        // Abandoned loops must not outlive the run.
        updates.abort();
        range_gets.abort();

        samples.writes.sort();
        samples.gets.sort();
        samples.range_gets.sort();

        let test_id = humantime::format_rfc3339_nanos(SystemTime::now()).to_string();
        let result = StressResult {
            writes: self.summarize(&test_id, Category::Writes, &samples.writes)?,
            gets: self.summarize(&test_id, Category::Gets, &samples.gets)?,
            range_gets: self.summarize(&test_id, Category::RangeGets, &samples.range_gets)?,
            stopped,
            samples,
        };

        tracing::info!(
            writes = result.samples.writes.len(),
            gets = result.samples.gets.len(),
            range_gets = result.samples.range_gets.len(),
            "run finished"
        );
        Ok(result)
    }

    /// Ends any running apply and deletes the namespace, waiting until it is
    /// gone.
    pub async fn delete(&self) -> Result<()> {
        self.done.close();
        self.delete_namespace(NAMESPACE_DELETE_INTERVAL, NAMESPACE_DELETE_TIMEOUT)
            .await
    }

    /// Deletes the namespace and polls every `interval` until it is gone.
    pub async fn delete_namespace(&self, interval: Duration, timeout: Duration) -> Result<()> {
        let namespace = self.config.namespace.as_str();
        tracing::info!(namespace, "deleting namespace");
        self.client
            .delete_namespace()
            .await
            .map_err(|err| Error::Teardown(format!("failed to delete namespace {namespace} ({err})")))?;

        let deleted = wait_namespace_deleted(namespace, interval, timeout, || {
            self.client.namespace_exists()
        })
        .await;
        if !deleted {
            return Err(Error::Teardown(format!(
                "namespace {namespace} still exists after {timeout:?}"
            )));
        }

        tracing::info!(namespace, "deleted namespace");
        Ok(())
    }

    async fn preflight(&self) -> Result<()> {
        let nodes = self
            .client
            .count_ready_nodes()
            .await
            .map_err(|err| Error::Preflight(format!("failed to list nodes ({err})")))?;
        if nodes < self.config.minimum_nodes {
            return Err(Error::Preflight(format!(
                "found {nodes} ready nodes, need at least {}",
                self.config.minimum_nodes
            )));
        }

        let namespace = self.config.namespace.as_str();
        if self.config.skip_namespace_creation {
            tracing::info!(namespace, "skipping namespace creation");
            return Ok(());
        }
        match self.client.create_namespace().await {
            Ok(()) => tracing::info!(namespace, "created namespace"),
            Err(RequestError::AlreadyExists) => tracing::info!(namespace, "namespace already exists"),
            Err(err) => {
                return Err(Error::Preflight(format!(
                    "failed to create namespace {namespace} ({err})"
                )));
            }
        }
        Ok(())
    }

    async fn collect(&self, category: Category, rx: oneshot::Receiver<Durations>) -> Durations {
        match tokio::time::timeout(RESULT_WAIT_TIMEOUT, rx).await {
            Ok(Ok(durations)) => durations,
            Ok(Err(_)) => {
                tracing::warn!(%category, "loop exited without results, using partial samples");
                self.recorder.samples(category).take()
            }
            Err(_) => {
                tracing::warn!(%category, timeout = ?RESULT_WAIT_TIMEOUT, "loop took too long, using partial samples");
                self.recorder.samples(category).take()
            }
        }
    }

    fn summarize(&self, test_id: &str, category: Category, durations: &Durations) -> Result<Summary> {
        let snapshot = self.recorder.registry().snapshot(category);
        let histogram = HistogramBuckets::parse(LATENCY_SCALE, &snapshot.latency)?;
        if snapshot.conflicts_total > 0 {
            tracing::info!(%category, conflicts = snapshot.conflicts_total, "requests lost update races");
        }
        let summary = Summary::new(
            test_id,
            snapshot.success_total,
            snapshot.failure_total,
            histogram,
            durations,
        )?;
        Ok(summary.with_conflicts(snapshot.conflicts_total))
    }
}

async fn update_loop(context: &RunContext, image: String) {
    let config = &context.config;
    let Some(size) = usize::try_from(config.object_size.as_u64()).ok() else {
        tracing::error!(size = %config.object_size, "object size does not fit into memory");
        return;
    };
    tracing::info!(
        objects = config.objects,
        object_size = %config.object_size,
        concurrency = config.update_concurrency,
        keyspace = KEYSPACE,
        "starting update loop"
    );

    let image: Arc<str> = image.into();
    let value: Arc<str> = random_value(size).into();
    let limit = config.objects_limit();

    let mut iteration: u64 = 0;
    while limit.is_none_or(|limit| iteration < limit) {
        if context.stop.is_cancelled() {
            tracing::warn!(iteration, "update loop stopped");
            return;
        }
        if context.done.is_closed() {
            tracing::info!(iteration, "update loop done");
            return;
        }

        let key: Arc<str> = object_key(&config.object_key_prefix, iteration).into();
        let mut workers = JoinSet::new();
        for _ in 0..config.update_concurrency {
            let context = context.clone();
            let key = Arc::clone(&key);
            let image = Arc::clone(&image);
            let value = Arc::clone(&value);
            workers.spawn(async move {
                let result = retry_on_conflict(Backoff::DEFAULT_RETRY, || {
                    update_object(&context, iteration, &key, &image, &value)
                })
                .await;
                if let Err(err) = result {
                    tracing::warn!(key = &*key, error = %err, "failed to update object");
                }
            });
        }
        while workers.join_next().await.is_some() {}

        iteration += 1;
    }
    tracing::info!(iteration, "update loop reached object limit");
}

/// Reads `key`, creating it if missing, or flips its annotations and writes it
/// back.
async fn update_object(
    context: &RunContext,
    iteration: u64,
    key: &str,
    image: &str,
    value: &str,
) -> Result<(), RequestError> {
    if context.should_stop() {
        return Ok(());
    }
    let recorder = &context.recorder;

    let current = recorder
        .timed(Category::Gets, Outcome::of_get, context.client.get_pod(key))
        .await;
    let mut pod = match current {
        Ok(pod) => pod,
        Err(RequestError::NotFound) => {
            let pod = pod_object(context.namespace(), key, image, value);
            let created = recorder
                .timed(Category::Writes, Outcome::of_create, context.client.create_pod(&pod))
                .await;
            match created {
                Ok(_) if iteration % LOG_EVERY == 0 => {
                    tracing::info!(iteration, key, "created object");
                }
                Ok(_) | Err(RequestError::AlreadyExists) => {}
                Err(err) => tracing::warn!(key, error = %err, "failed to create object"),
            }
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    toggle_annotations(&mut pod);
    recorder
        .timed(Category::Writes, Outcome::of_update, context.client.replace_pod(&pod))
        .await?;
    if iteration % LOG_EVERY == 0 {
        tracing::info!(iteration, key, "updated object");
    }
    Ok(())
}

async fn range_loop(context: &RunContext) {
    let Some(limit) = context.config.list_limit() else {
        tracing::info!("list batch limit is negative, skipping range gets");
        return;
    };
    tracing::info!(limit, "starting range loop");

    let mut iteration: u64 = 0;
    loop {
        // Give the runtime a chance to run timers and other tasks even if the
        // client answers without suspending.
        tokio::task::yield_now().await;
        if context.stop.is_cancelled() {
            tracing::warn!(iteration, "range loop stopped");
            return;
        }
        if context.done.is_closed() {
            tracing::info!(iteration, "range loop done");
            return;
        }

        let listed = context
            .recorder
            .timed(Category::RangeGets, Outcome::of_request, context.client.list_pods(limit))
            .await;
        match listed {
            Ok(items) if iteration % LOG_EVERY == 0 => {
                tracing::info!(iteration, items, "listed objects");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(iteration, error = %err, "failed to list objects"),
        }
        iteration += 1;
    }
}
