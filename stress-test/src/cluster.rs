//! An in-memory stand-in for the Kubernetes API server.
//!
//! [`FakeCluster`] implements [`StressClient`] for a single namespace. Pods
//! carry resource versions, so concurrent read-modify-write cycles conflict
//! the same way they do against a real API server. Every request suspends for
//! a configurable latency, and failures can be injected per request kind. With
//! a client timeout, pod requests are bounded the same way the production
//! client bounds them.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use stress_tester::client::bounded;
use stress_tester::{RequestError, StressClient};

/// Number of requests served by a [`FakeCluster`], by kind.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RequestCounts {
    pub gets: usize,
    pub creates: usize,
    pub replaces: usize,
    pub lists: usize,
    /// Replace requests rejected because of a stale resource version.
    pub conflicts: usize,
}

#[derive(Debug, Default)]
struct State {
    namespace_exists: bool,
    /// Number of existence checks that still report a deleted namespace.
    terminating_polls: usize,
    pods: BTreeMap<String, Pod>,
    created: BTreeSet<String>,
    next_version: u64,
    counts: RequestCounts,
}

impl State {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// In-memory cluster with a single namespace.
#[derive(Debug)]
pub struct FakeCluster {
    namespace: String,
    latency: Duration,
    get_latency: Option<Duration>,
    client_timeout: Option<Duration>,
    ready_nodes: usize,
    termination_polls: usize,
    state: Mutex<State>,
    failing_gets: AtomicUsize,
    failing_lists: AtomicUsize,
    stalled_lists: AtomicBool,
}

impl FakeCluster {
    /// Creates a cluster with three ready nodes and no namespace.
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_owned(),
            latency: Duration::from_millis(1),
            get_latency: None,
            client_timeout: None,
            ready_nodes: 3,
            termination_polls: 0,
            state: Mutex::new(State::default()),
            failing_gets: AtomicUsize::new(0),
            failing_lists: AtomicUsize::new(0),
            stalled_lists: AtomicBool::new(false),
        }
    }

    /// Sets how long every request takes. Zero yields to the runtime once.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Sets how long get requests take, overriding the general latency.
    pub fn with_get_latency(mut self, latency: Duration) -> Self {
        self.get_latency = Some(latency);
        self
    }

    /// Fails pod requests that take longer than `timeout` with
    /// [`RequestError::Timeout`].
    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = Some(timeout);
        self
    }

    pub fn with_ready_nodes(mut self, ready_nodes: usize) -> Self {
        self.ready_nodes = ready_nodes;
        self
    }

    /// Starts with the namespace already present.
    pub fn with_namespace(self) -> Self {
        self.lock().namespace_exists = true;
        self
    }

    /// Keeps reporting a deleted namespace for the given number of checks.
    pub fn with_termination_polls(mut self, polls: usize) -> Self {
        self.termination_polls = polls;
        self
    }

    /// Fails the next `count` get requests with a transient error.
    pub fn fail_next_gets(&self, count: usize) {
        self.failing_gets.store(count, Ordering::SeqCst);
    }

    /// Fails the next `count` list requests with a transient error.
    pub fn fail_next_lists(&self, count: usize) {
        self.failing_lists.store(count, Ordering::SeqCst);
    }

    /// Makes all following list requests hang forever.
    pub fn stall_lists(&self) {
        self.stalled_lists.store(true, Ordering::SeqCst);
    }

    pub fn counts(&self) -> RequestCounts {
        self.lock().counts
    }

    /// Names of all pods that were ever created.
    pub fn created_pods(&self) -> BTreeSet<String> {
        self.lock().created.clone()
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.lock().pods.get(name).cloned()
    }

    pub fn has_namespace(&self) -> bool {
        self.lock().namespace_exists
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn delay(&self) {
        Self::sleep(self.latency).await;
    }

    async fn sleep(latency: Duration) {
        if latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }
    }

    async fn bounded<T>(
        &self,
        request: impl Future<Output = Result<T, RequestError>>,
    ) -> Result<T, RequestError> {
        match self.client_timeout {
            Some(timeout) => bounded(timeout, request).await,
            None => request.await,
        }
    }

    async fn serve_list(&self, limit: u32) -> Result<usize, RequestError> {
        if self.stalled_lists.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.delay().await;
        let mut state = self.lock();
        state.counts.lists += 1;
        if Self::take_fault(&self.failing_lists) {
            return Err(RequestError::Transient("injected list failure".into()));
        }
        let items = state.pods.len();
        Ok(match limit {
            0 => items,
            limit => items.min(limit as usize),
        })
    }

    async fn serve_get(&self, name: &str) -> Result<Pod, RequestError> {
        Self::sleep(self.get_latency.unwrap_or(self.latency)).await;
        let mut state = self.lock();
        state.counts.gets += 1;
        if Self::take_fault(&self.failing_gets) {
            return Err(RequestError::Transient("injected get failure".into()));
        }
        state.pods.get(name).cloned().ok_or(RequestError::NotFound)
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl StressClient for FakeCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_pod(&self, name: &str) -> Result<Pod, RequestError> {
        self.bounded(self.serve_get(name)).await
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, RequestError> {
        self.bounded(async {
            self.delay().await;
            Ok(())
        })
        .await?;
        let mut state = self.lock();
        state.counts.creates += 1;
        if !state.namespace_exists {
            return Err(RequestError::NotFound);
        }
        let name = pod.metadata.name.clone().unwrap_or_default();
        if state.pods.contains_key(&name) {
            return Err(RequestError::AlreadyExists);
        }

        let mut stored = pod.clone();
        stored.metadata.resource_version = Some(state.bump_version());
        state.pods.insert(name.clone(), stored.clone());
        state.created.insert(name);
        Ok(stored)
    }

    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, RequestError> {
        self.bounded(async {
            self.delay().await;
            Ok(())
        })
        .await?;
        let mut state = self.lock();
        state.counts.replaces += 1;
        let name = pod.metadata.name.clone().unwrap_or_default();
        let current = state
            .pods
            .get(&name)
            .ok_or(RequestError::NotFound)?
            .metadata
            .resource_version
            .clone();
        if pod.metadata.resource_version != current {
            state.counts.conflicts += 1;
            return Err(RequestError::Conflict);
        }

        let mut stored = pod.clone();
        stored.metadata.resource_version = Some(state.bump_version());
        state.pods.insert(name, stored.clone());
        Ok(stored)
    }

    async fn list_pods(&self, limit: u32) -> Result<usize, RequestError> {
        self.bounded(self.serve_list(limit)).await
    }

    async fn count_ready_nodes(&self) -> Result<usize, RequestError> {
        self.delay().await;
        Ok(self.ready_nodes)
    }

    async fn create_namespace(&self) -> Result<(), RequestError> {
        self.delay().await;
        let mut state = self.lock();
        if state.namespace_exists {
            return Err(RequestError::AlreadyExists);
        }
        state.namespace_exists = true;
        Ok(())
    }

    async fn delete_namespace(&self) -> Result<(), RequestError> {
        self.delay().await;
        let mut state = self.lock();
        if state.namespace_exists {
            state.namespace_exists = false;
            state.terminating_polls = self.termination_polls;
            state.pods.clear();
        }
        Ok(())
    }

    async fn namespace_exists(&self) -> Result<bool, RequestError> {
        self.delay().await;
        let mut state = self.lock();
        if state.terminating_polls > 0 {
            state.terminating_polls -= 1;
            return Ok(true);
        }
        Ok(state.namespace_exists)
    }
}
