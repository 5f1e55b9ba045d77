//! Best-effort cluster diagnostics through `kubectl`.
//!
//! Diagnostics are only collected for logging. A missing binary, a failing
//! command, or a timeout is reported in the returned text and never fails
//! the caller.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

/// Upper bound for `kubectl describe` calls.
pub const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound for `kubectl logs` calls.
pub const LOGS_TIMEOUT: Duration = Duration::from_secs(60);

/// Number of log lines collected per container.
pub const LOG_TAIL_LINES: u32 = 30;

/// Output of one diagnostic command.
#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostic {
    pub command: String,
    pub output: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' output:\n\n{}\n", self.command, self.output.trim_end())
    }
}

/// Runs `kubectl` against one namespace.
#[derive(Clone, Debug)]
pub struct Kubectl {
    path: PathBuf,
    kubeconfig: Option<PathBuf>,
    namespace: String,
}

impl Kubectl {
    pub fn new(path: impl Into<PathBuf>, namespace: &str) -> Self {
        Self {
            path: path.into(),
            kubeconfig: None,
            namespace: namespace.to_owned(),
        }
    }

    pub fn with_kubeconfig(mut self, kubeconfig: Option<&Path>) -> Self {
        self.kubeconfig = kubeconfig.map(Path::to_path_buf);
        self
    }

    /// Arguments of `kubectl describe <resource...>`.
    pub fn describe_args(&self, resource: &[&str]) -> Vec<OsString> {
        let mut args = self.base_args();
        args.push("describe".into());
        args.extend(resource.iter().map(OsString::from));
        args
    }

    /// Arguments of `kubectl logs` for a pod or a label selector.
    pub fn logs_args(&self, target: LogTarget<'_>) -> Vec<OsString> {
        let mut args = self.base_args();
        args.push("logs".into());
        match target {
            LogTarget::Pod(name) => args.push(name.into()),
            LogTarget::Selector(selector) => {
                args.push(format!("--selector={selector}").into());
                args.push("--all-containers=true".into());
                args.push("--prefix=true".into());
            }
        }
        args.push("--timestamps".into());
        args.push(format!("--tail={LOG_TAIL_LINES}").into());
        args
    }

    pub async fn describe(&self, resource: &[&str]) -> Diagnostic {
        self.run(self.describe_args(resource), DESCRIBE_TIMEOUT).await
    }

    pub async fn logs(&self, target: LogTarget<'_>) -> Diagnostic {
        self.run(self.logs_args(target), LOGS_TIMEOUT).await
    }

    fn base_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(kubeconfig) = &self.kubeconfig {
            args.push(OsString::from("--kubeconfig"));
            args.push(kubeconfig.as_os_str().to_owned());
        }
        args.push("--namespace".into());
        args.push(self.namespace.clone().into());
        args
    }

    async fn run(&self, args: Vec<OsString>, timeout: Duration) -> Diagnostic {
        let command = std::iter::once(self.path.as_os_str())
            .chain(args.iter().map(OsString::as_os_str))
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");

        let mut child = Command::new(&self.path);
        child.args(&args).stdin(Stdio::null()).kill_on_drop(true);

        let output = match tokio::time::timeout(timeout, child.output()).await {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                if !output.status.success() {
                    tracing::warn!(%command, status = %output.status, "kubectl failed");
                }
                text
            }
            Ok(Err(err)) => {
                tracing::warn!(%command, error = %err, "failed to run kubectl");
                format!("failed to run kubectl ({err})")
            }
            Err(_) => {
                tracing::warn!(%command, ?timeout, "kubectl timed out");
                format!("timed out after {timeout:?}")
            }
        };

        Diagnostic { command, output }
    }
}

/// What to collect logs from.
#[derive(Clone, Copy, Debug)]
pub enum LogTarget<'a> {
    Pod(&'a str),
    Selector(&'a str),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|arg| arg.into_string().unwrap())
            .collect()
    }

    #[test]
    fn describe_arguments() {
        let kubectl = Kubectl::new("/kubectl", "stress")
            .with_kubeconfig(Some(Path::new("/opt/kubeconfig.yaml")));
        assert_eq!(
            strings(kubectl.describe_args(&["pod", "pod0"])),
            [
                "--kubeconfig",
                "/opt/kubeconfig.yaml",
                "--namespace",
                "stress",
                "describe",
                "pod",
                "pod0"
            ]
        );
    }

    #[test]
    fn logs_arguments() {
        let kubectl = Kubectl::new("/kubectl", "stress");
        assert_eq!(
            strings(kubectl.logs_args(LogTarget::Pod("runner-abc"))),
            [
                "--namespace",
                "stress",
                "logs",
                "runner-abc",
                "--timestamps",
                "--tail=30"
            ]
        );
        assert_eq!(
            strings(kubectl.logs_args(LogTarget::Selector("job-name=runner"))),
            [
                "--namespace",
                "stress",
                "logs",
                "--selector=job-name=runner",
                "--all-containers=true",
                "--prefix=true",
                "--timestamps",
                "--tail=30"
            ]
        );
    }

    #[tokio::test]
    async fn missing_binary_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let kubectl = Kubectl::new(dir.path().join("kubectl"), "stress");

        let diagnostic = kubectl.describe(&["pods"]).await;
        assert!(diagnostic.command.ends_with("kubectl --namespace stress describe pods"));
        assert!(diagnostic.output.starts_with("failed to run kubectl"));
        assert!(diagnostic.to_string().contains("' output:\n\n"));
    }
}
