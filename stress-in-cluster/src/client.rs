//! Kubernetes API access of the in-cluster runner.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Node, Pod, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, PostParams, PropagationPolicy};
use kube::{Api, Client};
use stress_tester::RequestError;
use stress_tester::client::{bounded, is_node_ready};

use crate::resources::{Resource, ResourceKind};

/// Number of pods requested per list when checking completion.
const POD_LIST_LIMIT: u32 = 3000;

/// Operations issued by the runner, scoped to its namespace.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    fn namespace(&self) -> &str;

    async fn count_ready_nodes(&self) -> Result<usize, RequestError>;

    async fn create_namespace(&self) -> Result<(), RequestError>;

    async fn create(&self, resource: &Resource) -> Result<(), RequestError>;

    /// Deletes the runner's object of the given kind, including dependents.
    async fn delete(&self, kind: ResourceKind) -> Result<(), RequestError>;

    async fn list_pods(&self) -> Result<Vec<Pod>, RequestError>;

    async fn delete_namespace(&self) -> Result<(), RequestError>;

    async fn namespace_exists(&self) -> Result<bool, RequestError>;
}

/// [`ClusterClient`] backed by a Kubernetes API server.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    namespace: String,
    timeout: Duration,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient")
            .field("namespace", &self.namespace)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    pub fn new(client: Client, namespace: &str, timeout: Duration) -> Self {
        Self {
            client,
            namespace: namespace.to_owned(),
            timeout,
        }
    }

    fn namespaced<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn cluster<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::ClusterResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }

    async fn delete_in<K>(&self, api: Api<K>, name: &str) -> Result<(), RequestError>
    where
        K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..Default::default()
        };
        bounded(self.timeout, api.delete(name, &params)).await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn count_ready_nodes(&self) -> Result<usize, RequestError> {
        let nodes: Api<Node> = self.cluster();
        let list = bounded(self.timeout, nodes.list(&ListParams::default())).await?;
        Ok(list.items.iter().filter(|node| is_node_ready(node)).count())
    }

    async fn create_namespace(&self) -> Result<(), RequestError> {
        let namespaces: Api<Namespace> = self.cluster();
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(self.namespace.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        bounded(
            self.timeout,
            namespaces.create(&PostParams::default(), &namespace),
        )
        .await?;
        Ok(())
    }

    async fn create(&self, resource: &Resource) -> Result<(), RequestError> {
        let params = PostParams::default();
        match resource {
            Resource::ServiceAccount(object) => {
                let api: Api<ServiceAccount> = self.namespaced();
                bounded(self.timeout, api.create(&params, object)).await?;
            }
            Resource::ClusterRole(object) => {
                let api: Api<ClusterRole> = self.cluster();
                bounded(self.timeout, api.create(&params, object)).await?;
            }
            Resource::ClusterRoleBinding(object) => {
                let api: Api<ClusterRoleBinding> = self.cluster();
                bounded(self.timeout, api.create(&params, object)).await?;
            }
            Resource::ConfigMap(object) => {
                let api: Api<ConfigMap> = self.namespaced();
                bounded(self.timeout, api.create(&params, object)).await?;
            }
            Resource::CronJob(object) => {
                let api: Api<CronJob> = self.namespaced();
                bounded(self.timeout, api.create(&params, object)).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, kind: ResourceKind) -> Result<(), RequestError> {
        let name = kind.object_name();
        match kind {
            ResourceKind::ServiceAccount => {
                self.delete_in(self.namespaced::<ServiceAccount>(), name).await
            }
            ResourceKind::ClusterRole => self.delete_in(self.cluster::<ClusterRole>(), name).await,
            ResourceKind::ClusterRoleBinding => {
                self.delete_in(self.cluster::<ClusterRoleBinding>(), name)
                    .await
            }
            ResourceKind::ConfigMap => self.delete_in(self.namespaced::<ConfigMap>(), name).await,
            ResourceKind::CronJob => self.delete_in(self.namespaced::<CronJob>(), name).await,
        }
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, RequestError> {
        let pods: Api<Pod> = self.namespaced();
        let params = ListParams::default().limit(POD_LIST_LIMIT);
        let list = bounded(self.timeout, pods.list(&params)).await?;
        Ok(list.items)
    }

    async fn delete_namespace(&self) -> Result<(), RequestError> {
        let namespaces: Api<Namespace> = self.cluster();
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Foreground),
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        match bounded(self.timeout, namespaces.delete(&self.namespace, &params)).await {
            Ok(_) | Err(RequestError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn namespace_exists(&self) -> Result<bool, RequestError> {
        let namespaces: Api<Namespace> = self.cluster();
        let namespace = bounded(self.timeout, namespaces.get_opt(&self.namespace)).await?;
        Ok(namespace.is_some())
    }
}
