//! Kubernetes API access for stress runs.
//!
//! All requests of a run go through [`StressClient`], scoped to the run's
//! namespace. [`KubeStressClient`] implements it on top of [`kube`], bounding
//! every request by the configured client timeout and classifying failures
//! into [`RequestError`].

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, PostParams, PropagationPolicy};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use thiserror::Error;

use crate::error::Error;

/// Classified failure of a single API request.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum RequestError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    /// The object was modified since it was read.
    #[error("conflict")]
    Conflict,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("request failed: {0}")]
    Transient(String),
}

impl From<kube::Error> for RequestError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) => match (response.code, response.reason.as_str()) {
                (404, _) => RequestError::NotFound,
                (409, "AlreadyExists") => RequestError::AlreadyExists,
                (409, _) => RequestError::Conflict,
                _ => RequestError::Transient(format!("{} ({})", response.message, response.code)),
            },
            other => RequestError::Transient(other.to_string()),
        }
    }
}

/// Namespaced operations issued by a stress run.
#[async_trait]
pub trait StressClient: Send + Sync {
    /// Namespace all operations are scoped to.
    fn namespace(&self) -> &str;

    async fn get_pod(&self, name: &str) -> Result<Pod, RequestError>;

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, RequestError>;

    /// Replaces a pod, failing with [`RequestError::Conflict`] if its
    /// resource version is stale.
    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, RequestError>;

    /// Lists the first page of at most `limit` pods, returning the number of
    /// items received.
    async fn list_pods(&self, limit: u32) -> Result<usize, RequestError>;

    /// Counts the cluster's nodes that report the `Ready` condition.
    async fn count_ready_nodes(&self) -> Result<usize, RequestError>;

    async fn create_namespace(&self) -> Result<(), RequestError>;

    /// Requests deletion of the namespace. A missing namespace is not an
    /// error.
    async fn delete_namespace(&self) -> Result<(), RequestError>;

    async fn namespace_exists(&self) -> Result<bool, RequestError>;
}

/// [`StressClient`] backed by a Kubernetes API server.
#[derive(Clone)]
pub struct KubeStressClient {
    client: Client,
    namespace: String,
    pods: Api<Pod>,
    timeout: Duration,
}

impl std::fmt::Debug for KubeStressClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStressClient")
            .field("namespace", &self.namespace)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl KubeStressClient {
    pub fn new(client: Client, namespace: &str, timeout: Duration) -> Self {
        Self {
            pods: Api::namespaced(client.clone(), namespace),
            client,
            namespace: namespace.to_owned(),
            timeout,
        }
    }

    async fn bounded<T, F>(&self, request: F) -> Result<T, RequestError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        bounded(self.timeout, request).await
    }
}

/// Awaits a request for at most `timeout`, classifying its error.
pub async fn bounded<T, E, F>(timeout: Duration, request: F) -> Result<T, RequestError>
where
    F: Future<Output = Result<T, E>>,
    RequestError: From<E>,
{
    match tokio::time::timeout(timeout, request).await {
        Ok(result) => result.map_err(RequestError::from),
        Err(_) => Err(RequestError::Timeout(timeout)),
    }
}

/// Polls `exists` every `interval` until it reports `namespace` as gone.
///
/// Failed checks are logged and retried. Returns `false` if the namespace
/// still exists after `timeout`.
pub async fn wait_namespace_deleted<F, Fut>(
    namespace: &str,
    interval: Duration,
    timeout: Duration,
    mut exists: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, RequestError>>,
{
    let wait = async {
        loop {
            match exists().await {
                Ok(false) => return,
                Ok(true) => tracing::info!(namespace, "namespace still exists"),
                Err(err) => tracing::warn!(namespace, error = %err, "failed to get namespace"),
            }
            tokio::time::sleep(interval).await;
        }
    };
    tokio::time::timeout(timeout, wait).await.is_ok()
}

#[async_trait]
impl StressClient for KubeStressClient {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_pod(&self, name: &str) -> Result<Pod, RequestError> {
        self.bounded(self.pods.get(name)).await
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, RequestError> {
        self.bounded(self.pods.create(&PostParams::default(), pod))
            .await
    }

    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, RequestError> {
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        self.bounded(self.pods.replace(name, &PostParams::default(), pod))
            .await
    }

    async fn list_pods(&self, limit: u32) -> Result<usize, RequestError> {
        let params = ListParams::default().limit(limit);
        let list = self.bounded(self.pods.list(&params)).await?;
        Ok(list.items.len())
    }

    async fn count_ready_nodes(&self) -> Result<usize, RequestError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = self.bounded(nodes.list(&ListParams::default())).await?;
        Ok(list.items.iter().filter(|node| is_node_ready(node)).count())
    }

    async fn create_namespace(&self) -> Result<(), RequestError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(self.namespace.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        self.bounded(namespaces.create(&PostParams::default(), &namespace))
            .await?;
        Ok(())
    }

    async fn delete_namespace(&self) -> Result<(), RequestError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Foreground),
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        match self
            .bounded(namespaces.delete(&self.namespace, &params))
            .await
        {
            Ok(_) | Err(RequestError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn namespace_exists(&self) -> Result<bool, RequestError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let namespace = self.bounded(namespaces.get_opt(&self.namespace)).await?;
        Ok(namespace.is_some())
    }
}

/// Whether the node reports a `Ready` condition with status `True`.
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
}

/// Connects to the cluster.
///
/// In-cluster service account credentials are preferred. Outside of a pod,
/// the kubeconfig at `kubeconfig` is used if given, otherwise the default
/// kubeconfig resolution applies.
pub async fn connect(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let config = match Config::incluster() {
        Ok(config) => {
            tracing::info!("using in-cluster service account credentials");
            config
        }
        Err(in_cluster) => match kubeconfig {
            Some(path) => {
                tracing::debug!(error = %in_cluster, "not running in a cluster");
                tracing::info!(path = %path.display(), "using kubeconfig");
                let kubeconfig = Kubeconfig::read_from(path).map_err(|err| {
                    Error::Preflight(format!("failed to read {} ({err})", path.display()))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|err| Error::Preflight(format!("invalid kubeconfig ({err})")))?
            }
            None => Config::infer()
                .await
                .map_err(|err| Error::Preflight(format!("no cluster configuration ({err})")))?,
        },
    };

    Client::try_from(config)
        .map_err(|err| Error::Preflight(format!("failed to create client ({err})")))
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use kube::core::ErrorResponse;

    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{reason} happened"),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn classify_api_errors() {
        assert_eq!(
            RequestError::from(api_error(404, "NotFound")),
            RequestError::NotFound
        );
        assert_eq!(
            RequestError::from(api_error(409, "AlreadyExists")),
            RequestError::AlreadyExists
        );
        assert_eq!(
            RequestError::from(api_error(409, "Conflict")),
            RequestError::Conflict
        );
        assert_eq!(
            RequestError::from(api_error(500, "InternalError")),
            RequestError::Transient("InternalError happened (500)".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_requests_time_out() {
        let timeout = Duration::from_secs(30);
        let start = tokio::time::Instant::now();

        let result = bounded(timeout, std::future::pending::<Result<(), kube::Error>>()).await;

        assert_eq!(result, Err(RequestError::Timeout(timeout)));
        assert!(start.elapsed() >= timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_requests_keep_their_result() {
        let timeout = Duration::from_secs(30);

        let ok = bounded(timeout, async { Ok::<_, kube::Error>(7) }).await;
        assert_eq!(ok, Ok(7));

        let conflict = bounded(timeout, async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Err::<(), _>(api_error(409, "Conflict"))
        })
        .await;
        assert_eq!(conflict, Err(RequestError::Conflict));
    }

    #[tokio::test(start_paused = true)]
    async fn namespace_deletion_is_polled() {
        let interval = Duration::from_secs(5);
        let start = tokio::time::Instant::now();
        let mut checks = 0;

        let deleted = wait_namespace_deleted("stress", interval, Duration::from_secs(60), || {
            checks += 1;
            let answer = match checks {
                1 => Err(RequestError::Transient("unavailable".into())),
                2 | 3 => Ok(true),
                _ => Ok(false),
            };
            async move { answer }
        })
        .await;

        assert!(deleted);
        assert_eq!(checks, 4);
        assert_eq!(start.elapsed(), interval * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn namespace_deletion_times_out() {
        let timeout = Duration::from_secs(60);
        let start = tokio::time::Instant::now();

        let deleted =
            wait_namespace_deleted("stress", Duration::from_secs(5), timeout, || async { Ok(true) })
                .await;

        assert!(!deleted);
        assert_eq!(start.elapsed(), timeout);
    }

    fn node(ready: Option<&str>) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: ready.map(|status| {
                    vec![NodeCondition {
                        type_: "Ready".into(),
                        status: status.into(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn node_readiness() {
        assert!(is_node_ready(&node(Some("True"))));
        assert!(!is_node_ready(&node(Some("False"))));
        assert!(!is_node_ready(&node(None)));
        assert!(!is_node_ready(&Node::default()));
    }
}
