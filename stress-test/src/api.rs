//! An in-memory stand-in for the API server as seen by the in-cluster runner.
//!
//! [`FakeApiServer`] implements [`ClusterClient`]. It keeps the created
//! objects by kind and serves whatever pods a test places into the namespace.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use stress_in_cluster::ClusterClient;
use stress_in_cluster::resources::{Resource, ResourceKind};
use stress_tester::RequestError;

#[derive(Debug, Default)]
struct State {
    namespace_exists: bool,
    objects: BTreeMap<ResourceKind, Resource>,
    created: Vec<ResourceKind>,
    deleted: Vec<ResourceKind>,
    pods: Vec<Pod>,
    pod_lists: usize,
    failing_creates: BTreeSet<ResourceKind>,
    failing_deletes: BTreeSet<ResourceKind>,
}

/// In-memory API server for a single namespace.
#[derive(Debug)]
pub struct FakeApiServer {
    namespace: String,
    latency: Duration,
    ready_nodes: usize,
    state: Mutex<State>,
}

impl FakeApiServer {
    /// Creates a server with three ready nodes and no namespace.
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_owned(),
            latency: Duration::from_millis(1),
            ready_nodes: 3,
            state: Mutex::new(State::default()),
        }
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

    /// Replaces the pods returned by all following lists.
    pub fn set_pods(&self, pods: Vec<Pod>) {
        self.lock().pods = pods;
    }

    /// Rejects every create of `kind` with a transient error.
    pub fn fail_creates(&self, kind: ResourceKind) {
        self.lock().failing_creates.insert(kind);
    }

    /// Rejects every delete of `kind` with a transient error.
    pub fn fail_deletes(&self, kind: ResourceKind) {
        self.lock().failing_deletes.insert(kind);
    }

    /// Kinds of all successfully created objects, in request order.
    pub fn created(&self) -> Vec<ResourceKind> {
        self.lock().created.clone()
    }

    /// Kinds of all successfully deleted objects, in request order.
    pub fn deleted(&self) -> Vec<ResourceKind> {
        self.lock().deleted.clone()
    }

    /// The currently stored object of `kind`.
    pub fn object(&self, kind: ResourceKind) -> Option<Resource> {
        self.lock().objects.get(&kind).cloned()
    }

    pub fn has_namespace(&self) -> bool {
        self.lock().namespace_exists
    }

    pub fn pod_lists(&self) -> usize {
        self.lock().pod_lists
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ClusterClient for FakeApiServer {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn count_ready_nodes(&self) -> Result<usize, RequestError> {
        tokio::time::sleep(self.latency).await;
        Ok(self.ready_nodes)
    }

    async fn create_namespace(&self) -> Result<(), RequestError> {
        tokio::time::sleep(self.latency).await;
        let mut state = self.lock();
        if state.namespace_exists {
            return Err(RequestError::AlreadyExists);
        }
        state.namespace_exists = true;
        Ok(())
    }

    async fn create(&self, resource: &Resource) -> Result<(), RequestError> {
        tokio::time::sleep(self.latency).await;
        let kind = resource.kind();
        let mut state = self.lock();
        if state.failing_creates.contains(&kind) {
            return Err(RequestError::Transient(format!("injected {kind} create failure")));
        }
        if state.objects.contains_key(&kind) {
            return Err(RequestError::AlreadyExists);
        }
        state.objects.insert(kind, resource.clone());
        state.created.push(kind);
        Ok(())
    }

    async fn delete(&self, kind: ResourceKind) -> Result<(), RequestError> {
        tokio::time::sleep(self.latency).await;
        let mut state = self.lock();
        if state.failing_deletes.contains(&kind) {
            return Err(RequestError::Transient(format!("injected {kind} delete failure")));
        }
        state.objects.remove(&kind).ok_or(RequestError::NotFound)?;
        state.deleted.push(kind);
        Ok(())
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, RequestError> {
        tokio::time::sleep(self.latency).await;
        let mut state = self.lock();
        state.pod_lists += 1;
        Ok(state.pods.clone())
    }

    async fn delete_namespace(&self) -> Result<(), RequestError> {
        tokio::time::sleep(self.latency).await;
        let mut state = self.lock();
        state.namespace_exists = false;
        state.pods.clear();
        Ok(())
    }

    async fn namespace_exists(&self) -> Result<bool, RequestError> {
        tokio::time::sleep(self.latency).await;
        Ok(self.lock().namespace_exists)
    }
}

/// A pod of job `job` in the given phase.
pub fn job_pod(name: &str, job: &str, phase: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            labels: Some(BTreeMap::from([("job-name".to_owned(), job.to_owned())])),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
