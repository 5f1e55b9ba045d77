use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use bytesize::ByteSize;
use stress_tester::cli::{confirm, stop_on_ctrl_c};
use stress_tester::client::connect;
use stress_tester::kubectl::Kubectl;
use stress_tester::observability;
use tracing::Level;

use crate::client::KubeClusterClient;
use crate::config::InClusterConfig;
use crate::error::Error;
use crate::runner::Runner;

/// Runs the Kubernetes API server stress tester as a CronJob in the cluster.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// ask for confirmation before applying or deleting (default: true)
    #[argh(option, default = "true")]
    prompt: bool,

    /// log level, overriding RUST_LOG (e.g. info, debug)
    #[argh(option)]
    log_level: Option<Level>,

    /// namespace of the CronJob and its resources
    #[argh(option)]
    namespace: Option<String>,

    /// minimum number of ready nodes required to start
    #[argh(option)]
    minimum_nodes: Option<usize>,

    /// path to kubectl, used to collect diagnostics of failed pods
    #[argh(option)]
    kubectl_path: Option<PathBuf>,

    /// path to the kubeconfig used locally and mounted into the pods
    #[argh(option)]
    kubeconfig_path: Option<PathBuf>,

    #[argh(subcommand)]
    command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Apply(ApplyCommand),
    Delete(DeleteCommand),
    Version(VersionCommand),
}

/// install the CronJob and wait for its pods to complete
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "apply")]
struct ApplyCommand {
    /// image containing the k8s-tester-stress binary
    #[argh(option)]
    stress_image: Option<String>,

    /// number of pods that must succeed per job
    #[argh(option)]
    completes: Option<i32>,

    /// number of pods a job runs in parallel
    #[argh(option)]
    parallels: Option<i32>,

    /// cron schedule of the stress CronJob
    #[argh(option)]
    schedule: Option<String>,

    /// how long to wait before polling pods (e.g. 3m)
    #[argh(option, from_str_fn(parse_duration))]
    initial_wait: Option<Duration>,

    /// how long every pod runs its update and list loops
    #[argh(option, from_str_fn(parse_duration))]
    run_timeout: Option<Duration>,

    /// prefix of the pod names created by the driver
    #[argh(option)]
    object_key_prefix: Option<String>,

    /// number of update iterations, negative to run until the timeout
    #[argh(option)]
    objects: Option<i64>,

    /// size of the value written into every object, in bytes
    #[argh(option)]
    object_size: Option<u64>,

    /// number of concurrent writers per object
    #[argh(option)]
    update_concurrency: Option<usize>,

    /// page size of list requests, negative to disable listing
    #[argh(option)]
    list_batch_limit: Option<i64>,

    /// container image of the pods created by the driver
    #[argh(option)]
    ecr_busybox_image: Option<String>,
}

/// delete the CronJob, its resources, and the namespace
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "delete")]
struct DeleteCommand {}

/// print the runner version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|err| err.to_string())
}

impl Args {
    fn apply_overrides(&self, config: &mut InClusterConfig) {
        if let Some(namespace) = &self.namespace {
            config.namespace = namespace.clone();
        }
        if let Some(minimum_nodes) = self.minimum_nodes {
            config.minimum_nodes = minimum_nodes;
        }
    }
}

impl ApplyCommand {
    fn apply_overrides(&self, config: &mut InClusterConfig) {
        if let Some(image) = &self.stress_image {
            config.stress_image = image.clone();
        }
        if let Some(completes) = self.completes {
            config.completes = completes;
        }
        if let Some(parallels) = self.parallels {
            config.parallels = parallels;
        }
        if let Some(schedule) = &self.schedule {
            config.schedule = schedule.clone();
        }
        if let Some(initial_wait) = self.initial_wait {
            config.initial_wait = initial_wait;
        }

        let stress = &mut config.stress;
        if let Some(run_timeout) = self.run_timeout {
            stress.run_timeout = run_timeout;
        }
        if let Some(prefix) = &self.object_key_prefix {
            stress.object_key_prefix = prefix.clone();
        }
        if let Some(objects) = self.objects {
            stress.objects = objects;
        }
        if let Some(object_size) = self.object_size {
            stress.object_size = ByteSize::b(object_size);
        }
        if let Some(update_concurrency) = self.update_concurrency {
            stress.update_concurrency = update_concurrency;
        }
        if let Some(limit) = self.list_batch_limit {
            stress.list_batch_limit = limit;
        }
        if let Some(image) = &self.ecr_busybox_image {
            stress.busybox_image = Some(image.clone());
        }
    }
}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    if let Command::Version(_) = args.command {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut config = InClusterConfig::load(args.config.as_deref())?;
    args.apply_overrides(&mut config);
    if let Command::Apply(apply) = &args.command {
        apply.apply_overrides(&mut config);
    }

    observability::initialize_tracing(args.log_level);
    tracing::debug!(?config, "loaded configuration");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("stress-in-cluster-rt")
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match &args.command {
            Command::Apply(_) => run_apply(&args, config).await,
            Command::Delete(_) => run_delete(&args, config).await,
            Command::Version(_) => Ok(()),
        }
    })
}

async fn run_apply(args: &Args, config: InClusterConfig) -> Result<()> {
    if args.prompt && !confirm(&format!("apply CronJob in namespace {:?}", config.namespace))? {
        return Err(Error::Cancelled).context("apply declined");
    }

    let kubeconfig = read_kubeconfig(args.kubeconfig_path.as_deref())?;
    let runner = build_runner(args, config)
        .await?
        .with_stop(stop_on_ctrl_c())
        .with_progress(true);

    let report = runner.apply(&kubeconfig).await.context("CronJob run failed")?;
    print!("\n{}", report.table());

    println!("\n'k8s-tester-stress-in-cluster apply' success");
    Ok(())
}

async fn run_delete(args: &Args, config: InClusterConfig) -> Result<()> {
    if args.prompt && !confirm(&format!("delete CronJob in namespace {:?}", config.namespace))? {
        return Err(Error::Cancelled).context("delete declined");
    }

    let runner = build_runner(args, config).await?;
    runner.delete().await.context("failed to delete")?;

    println!("\n'k8s-tester-stress-in-cluster delete' success");
    Ok(())
}

async fn build_runner(args: &Args, config: InClusterConfig) -> Result<Runner> {
    let client = connect(args.kubeconfig_path.as_deref()).await?;
    let client = KubeClusterClient::new(client, &config.namespace, config.client_timeout);
    let kubectl = args.kubectl_path.as_deref().map(|path| {
        Kubectl::new(path, &config.namespace).with_kubeconfig(args.kubeconfig_path.as_deref())
    });
    Ok(Runner::new(config, Arc::new(client))?.with_kubectl(kubectl))
}

/// Contents of the kubeconfig mounted into the CronJob pods.
///
/// Falls back to the default kubeconfig locations. Pods that find no usable
/// kubeconfig still authenticate with their service account.
fn read_kubeconfig(path: Option<&Path>) -> Result<String, Error> {
    if let Some(path) = path {
        return Ok(std::fs::read_to_string(path)?);
    }
    match kube::config::Kubeconfig::read() {
        Ok(kubeconfig) => Ok(serde_yaml::to_string(&kubeconfig)?),
        Err(err) => {
            tracing::warn!(error = %err, "no kubeconfig found, pods use in-cluster credentials");
            Ok(String::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use argh::FromArgs;

    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::from_args(&["k8s-tester-stress-in-cluster"], args).unwrap()
    }

    #[test]
    fn flags_override_config() {
        let args = parse(&[
            "--prompt",
            "false",
            "--namespace",
            "in-cluster",
            "--minimum-nodes",
            "2",
            "apply",
            "--stress-image",
            "registry.local/k8s-tester-stress:v1",
            "--completes",
            "3",
            "--parallels",
            "1",
            "--schedule",
            "*/5 * * * *",
            "--initial-wait",
            "30s",
            "--run-timeout",
            "2m",
            "--objects",
            "-1",
            "--object-size",
            "1024",
            "--list-batch-limit",
            "-1",
        ]);
        assert!(!args.prompt);

        let mut config = InClusterConfig::default();
        args.apply_overrides(&mut config);
        let Command::Apply(apply) = &args.command else {
            panic!("expected apply command");
        };
        apply.apply_overrides(&mut config);

        assert_eq!(config.namespace, "in-cluster");
        assert_eq!(config.minimum_nodes, 2);
        assert_eq!(config.stress_image, "registry.local/k8s-tester-stress:v1");
        assert_eq!(config.completes, 3);
        assert_eq!(config.parallels, 1);
        assert_eq!(config.schedule, "*/5 * * * *");
        assert_eq!(config.initial_wait, Duration::from_secs(30));
        assert_eq!(config.stress.run_timeout, Duration::from_secs(120));
        assert_eq!(config.stress.objects, -1);
        assert_eq!(config.stress.object_size, ByteSize::b(1024));
        assert_eq!(config.stress.list_batch_limit, -1);
        assert_eq!(config.stress.busybox_image, None);
    }

    #[test]
    fn delete_keeps_config() {
        let args = parse(&["delete"]);
        assert!(args.prompt);

        let config = InClusterConfig {
            namespace: "from-file".into(),
            ..Default::default()
        };
        let mut overridden = config.clone();
        args.apply_overrides(&mut overridden);
        assert_eq!(overridden, config);
    }

    #[test]
    fn kubeconfig_read_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"apiVersion: v1\nkind: Config\n").unwrap();

        let kubeconfig = read_kubeconfig(Some(file.path())).unwrap();
        assert_eq!(kubeconfig, "apiVersion: v1\nkind: Config\n");
        assert!(read_kubeconfig(Some(Path::new("/nonexistent/kubeconfig"))).is_err());
    }
}
