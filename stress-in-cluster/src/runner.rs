//! Installation, completion check, and teardown of the in-cluster CronJob.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use k8s_openapi::api::core::v1::Pod;
use stress_tester::RequestError;
use stress_tester::client::wait_namespace_deleted;
use stress_tester::driver::{NAMESPACE_DELETE_INTERVAL, NAMESPACE_DELETE_TIMEOUT};
use stress_tester::kubectl::{Kubectl, LogTarget};
use tokio_util::sync::CancellationToken;

use crate::client::ClusterClient;
use crate::completion::{
    CompletionTracker, ExecutionState, completion_timeout, owned_by, pod_phase,
};
use crate::config::InClusterConfig;
use crate::error::{Error, Result};
use crate::resources::{self, CRON_JOB_LABEL, CRON_JOB_NAME, Resource, ResourceKind};

/// Final phase of every CronJob pod after a successful check.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompletionReport {
    pub succeeded: usize,
    /// `(name, phase)` of all pods owned by the CronJob.
    pub pods: Vec<(String, String)>,
}

impl CompletionReport {
    /// Renders one line per pod.
    pub fn table(&self) -> String {
        let mut out = String::new();
        for (name, phase) in &self.pods {
            // Writing to a String cannot fail.
            let _ = writeln!(out, "CronJob Pod {name:?}: {phase:?}");
        }
        out
    }
}

/// Installs and removes the stress CronJob.
pub struct Runner {
    config: Arc<InClusterConfig>,
    client: Arc<dyn ClusterClient>,
    kubectl: Option<Kubectl>,
    stop: CancellationToken,
    progress: bool,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .field("kubectl", &self.kubectl)
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Creates a runner, filling defaults and validating `config`.
    pub fn new(mut config: InClusterConfig, client: Arc<dyn ClusterClient>) -> Result<Self> {
        config.validate_and_set_defaults()?;
        Ok(Self {
            config: Arc::new(config),
            client,
            kubectl: None,
            stop: CancellationToken::new(),
            progress: false,
        })
    }

    /// Collects diagnostics of failing pods through `kubectl`.
    pub fn with_kubectl(mut self, kubectl: Option<Kubectl>) -> Self {
        self.kubectl = kubectl;
        self
    }

    /// Aborts waits once `stop` is cancelled.
    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    /// Shows a spinner on stderr while waiting for the CronJob.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &InClusterConfig {
        &self.config
    }

    /// Creates all resources and waits until the CronJob completed the
    /// configured number of pods.
    ///
    /// `kubeconfig` is stored in the ConfigMap mounted into every pod.
    pub async fn apply(&self, kubeconfig: &str) -> Result<CompletionReport> {
        self.preflight().await?;

        for resource in resources::resources(&self.config, kubeconfig) {
            self.create(&resource).await?;
        }

        self.check_completion().await
    }

    /// Deletes all resources and the namespace, continuing past failures.
    pub async fn delete(&self) -> Result<()> {
        let mut errors = Vec::new();
        for kind in ResourceKind::TEARDOWN {
            match self.client.delete(kind).await {
                Ok(()) => tracing::info!(%kind, "deleted"),
                Err(RequestError::NotFound) => tracing::info!(%kind, "already deleted"),
                Err(err) => {
                    tracing::warn!(%kind, error = %err, "failed to delete");
                    errors.push(format!("failed to delete {kind} ({err})"));
                }
            }
        }

        if let Err(err) = self
            .delete_namespace(NAMESPACE_DELETE_INTERVAL, NAMESPACE_DELETE_TIMEOUT)
            .await
        {
            errors.push(err.to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(errors.join(", ")))
        }
    }

    /// Deletes the namespace and polls every `interval` until it is gone.
    pub async fn delete_namespace(&self, interval: Duration, timeout: Duration) -> Result<()> {
        let namespace = self.config.namespace.as_str();
        tracing::info!(namespace, "deleting namespace");
        self.client
            .delete_namespace()
            .await
            .map_err(Error::request(format!("delete namespace {namespace}")))?;

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
            .map_err(Error::request("list nodes"))?;
        if nodes < self.config.minimum_nodes {
            return Err(Error::Preflight(format!(
                "found {nodes} ready nodes, need at least {}",
                self.config.minimum_nodes
            )));
        }

        let namespace = self.config.namespace.as_str();
        match self.client.create_namespace().await {
            Ok(()) => tracing::info!(namespace, "created namespace"),
            Err(RequestError::AlreadyExists) => tracing::info!(namespace, "namespace already exists"),
            Err(err) => return Err(Error::request(format!("create namespace {namespace}"))(err)),
        }
        Ok(())
    }

    async fn create(&self, resource: &Resource) -> Result<()> {
        let kind = resource.kind();
        let name = resource.name();
        if let Resource::CronJob(cron_job) = resource {
            tracing::info!(
                name,
                completes = self.config.completes,
                parallels = self.config.parallels,
                schedule = self.config.schedule.as_str(),
                successful_jobs_history_limit = self.config.successful_jobs_history_limit,
                failed_jobs_history_limit = self.config.failed_jobs_history_limit,
                "creating CronJob"
            );
            tracing::info!("CronJob manifest:\n{}", resources::to_yaml(cron_job)?);
        }

        match self.client.create(resource).await {
            Ok(()) => tracing::info!(%kind, name, "created"),
            Err(RequestError::AlreadyExists) => tracing::info!(%kind, name, "already exists"),
            Err(err) => return Err(Error::request(format!("create {kind} {name}"))(err)),
        }
        Ok(())
    }

    fn spinner(&self) -> ProgressBar {
        let bar = ProgressBar::new_spinner().with_message(format!("Waiting for {CRON_JOB_NAME}"));
        if let Ok(style) = ProgressStyle::with_template("{spinner} {msg} {elapsed}") {
            bar.set_style(style);
        }
        if self.progress {
            bar.enable_steady_tick(Duration::from_millis(100));
        } else {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        bar
    }

    /// Polls pods until the CronJob completed the configured number of them,
    /// bounded by [`completion_timeout`].
    async fn check_completion(&self) -> Result<CompletionReport> {
        let config = &self.config;
        let completes = u32::try_from(config.completes).unwrap_or_default();
        let timeout = completion_timeout(config.stress.run_timeout, completes);
        let mut tracker = CompletionTracker::new(CRON_JOB_NAME, config.target_completes());
        tracing::info!(
            ?timeout,
            initial_wait = ?config.initial_wait,
            poll_interval = ?config.poll_interval,
            target = tracker.target(),
            "checking CronJob completion"
        );

        let bar = self.spinner();
        let result = tokio::time::timeout(timeout, self.poll(&mut tracker)).await;
        bar.finish_and_clear();

        match result {
            Ok(result) => result,
            Err(_) => match tracker.expire() {
                ExecutionState::Failed => Err(Error::PodsFailed {
                    failed: tracker.failed().map(str::to_owned).collect(),
                }),
                _ => Err(Error::CompletionTimeout {
                    succeeded: tracker.succeeded(),
                    target: tracker.target(),
                }),
            },
        }
    }

    async fn poll(&self, tracker: &mut CompletionTracker) -> Result<CompletionReport> {
        tokio::select! {
            _ = self.stop.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(self.config.initial_wait) => {}
        }

        let mut state = tracker.state();
        loop {
            if self.stop.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match self.client.list_pods().await {
                Ok(pods) => {
                    let progress = tracker.observe(&pods);
                    if tracker.state() != state {
                        state = tracker.state();
                        tracing::info!(?state, "CronJob execution changed state");
                    }
                    tracing::info!(
                        pods = pods.len(),
                        owned = progress.owned,
                        succeeded = progress.succeeded,
                        target = tracker.target(),
                        "polled CronJob pods"
                    );

                    for name in &progress.newly_failed {
                        tracing::warn!(pod = name.as_str(), "pod failed");
                        self.describe_pod(name).await;
                    }
                    if progress.owned == 0 {
                        self.describe_cron_job().await;
                    }
                    if state == ExecutionState::Succeeded {
                        return Ok(report(tracker, &pods));
                    }
                }
                Err(err) => tracing::warn!(error = %err, "failed to list pods"),
            }

            tokio::select! {
                _ = self.stop.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn describe_pod(&self, name: &str) {
        let Some(kubectl) = &self.kubectl else {
            return;
        };
        let describe = kubectl.describe(&["pod", name]).await;
        let logs = kubectl.logs(LogTarget::Pod(name)).await;
        tracing::warn!("{describe}\n{logs}");
    }

    async fn describe_cron_job(&self) {
        let Some(kubectl) = &self.kubectl else {
            return;
        };
        let cron_job = format!("cronjob.batch/{CRON_JOB_NAME}");
        let selector = format!("{CRON_JOB_LABEL}={CRON_JOB_NAME}");
        let describe = kubectl.describe(&[&cron_job]).await;
        let logs = kubectl.logs(LogTarget::Selector(&selector)).await;
        tracing::info!("{describe}\n{logs}");
    }
}

fn report(tracker: &CompletionTracker, pods: &[Pod]) -> CompletionReport {
    let pods = pods
        .iter()
        .filter(|pod| owned_by(pod, CRON_JOB_NAME))
        .map(|pod| {
            let name = pod.metadata.name.clone().unwrap_or_default();
            (name, pod_phase(pod).to_owned())
        })
        .collect();
    CompletionReport {
        succeeded: tracker.succeeded(),
        pods,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_table() {
        let report = CompletionReport {
            succeeded: 1,
            pods: vec![
                ("cron-1-a".into(), "Succeeded".into()),
                ("cron-1-b".into(), "Failed".into()),
            ],
        };
        assert_eq!(
            report.table(),
            "CronJob Pod \"cron-1-a\": \"Succeeded\"\nCronJob Pod \"cron-1-b\": \"Failed\"\n"
        );
    }
}
