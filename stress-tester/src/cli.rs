use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use bytesize::ByteSize;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::client::{KubeStressClient, connect};
use crate::config::StressConfig;
use crate::driver::Stresser;
use crate::error::Error;
use crate::kubectl::{Kubectl, LogTarget};
use crate::{observability, report};

/// Kubernetes API server stress tester.
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

    /// namespace holding the test objects
    #[argh(option)]
    namespace: Option<String>,

    /// minimum number of ready nodes required to start
    #[argh(option)]
    minimum_nodes: Option<usize>,

    /// use an existing namespace instead of creating one
    #[argh(switch)]
    skip_namespace_creation: bool,

    /// path to kubectl, used to collect diagnostics
    #[argh(option)]
    kubectl_path: Option<PathBuf>,

    /// path to a kubeconfig; in-cluster credentials take precedence
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

/// run the stress test and print latency summaries
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "apply")]
struct ApplyCommand {
    /// how long to run the update and list loops (e.g. 1m, 30s)
    #[argh(option, from_str_fn(parse_duration))]
    run_timeout: Option<Duration>,

    /// upper bound for a single API request
    #[argh(option, from_str_fn(parse_duration))]
    client_timeout: Option<Duration>,

    /// prefix of the pod names
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

    /// container image of the created pods (default: busybox)
    #[argh(option)]
    ecr_busybox_image: Option<String>,

    /// write the latency summaries as JSON to this path
    #[argh(option)]
    summary_json: Option<PathBuf>,

    /// write all request durations as CSV to this path
    #[argh(option)]
    latency_csv: Option<PathBuf>,

    /// write request metrics in the Prometheus text format to this path
    #[argh(option)]
    metrics_output: Option<PathBuf>,
}

/// delete the namespace of a previous run
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "delete")]
struct DeleteCommand {}

/// print the stress tester version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|err| err.to_string())
}

impl Args {
    /// Applies explicit flags on top of the loaded configuration.
    fn apply_overrides(&self, config: &mut StressConfig) {
        if let Some(namespace) = &self.namespace {
            config.namespace = namespace.clone();
        }
        if let Some(minimum_nodes) = self.minimum_nodes {
            config.minimum_nodes = minimum_nodes;
        }
        if self.skip_namespace_creation {
            config.skip_namespace_creation = true;
        }
    }
}

impl ApplyCommand {
    fn apply_overrides(&self, config: &mut StressConfig) {
        if let Some(run_timeout) = self.run_timeout {
            config.run_timeout = run_timeout;
        }
        if let Some(client_timeout) = self.client_timeout {
            config.client_timeout = client_timeout;
        }
        if let Some(prefix) = &self.object_key_prefix {
            config.object_key_prefix = prefix.clone();
        }
        if let Some(objects) = self.objects {
            config.objects = objects;
        }
        if let Some(object_size) = self.object_size {
            config.object_size = ByteSize::b(object_size);
        }
        if let Some(update_concurrency) = self.update_concurrency {
            config.update_concurrency = update_concurrency;
        }
        if let Some(limit) = self.list_batch_limit {
            config.list_batch_limit = limit;
        }
        if let Some(image) = &self.ecr_busybox_image {
            config.busybox_image = Some(image.clone());
        }
    }
}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    // Special switch to just print the version and exit.
    if let Command::Version(_) = args.command {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut config = StressConfig::load(args.config.as_deref())?;
    args.apply_overrides(&mut config);
    if let Command::Apply(apply) = &args.command {
        apply.apply_overrides(&mut config);
    }

    observability::initialize_tracing(args.log_level);
    tracing::debug!(?config, "loaded configuration");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("stress-rt")
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match &args.command {
            Command::Apply(apply) => run_apply(&args, apply, config).await,
            Command::Delete(_) => run_delete(&args, config).await,
            Command::Version(_) => Ok(()),
        }
    })
}

async fn run_apply(args: &Args, command: &ApplyCommand, config: StressConfig) -> Result<()> {
    if args.prompt && !confirm(&format!("apply stress test in namespace {:?}", config.namespace))? {
        return Err(Error::Cancelled).context("apply declined");
    }

    let stresser = build_stresser(args, config).await?;
    let stop = stop_on_ctrl_c();
    let stresser = stresser.with_stop(stop);

    let bar = ProgressBar::new_spinner()
        .with_style(ProgressStyle::with_template("{spinner} {msg} {elapsed}")?)
        .with_message("Running stress test:");
    bar.enable_steady_tick(Duration::from_millis(100));
    let result = stresser.apply().await;
    bar.finish_and_clear();

    let result = match result {
        Ok(result) => result,
        Err(err) => {
            if let Some(kubectl) = kubectl(args, &stresser.config().namespace) {
                dump_diagnostics(&kubectl).await;
            }
            return Err(err).context("stress run failed");
        }
    };

    report::print_summaries(&result, &mut io::stdout().lock())?;
    if let Some(path) = &command.summary_json {
        report::write_summary_json(&result, path).context("failed to write summary JSON")?;
    }
    if let Some(path) = &command.latency_csv {
        report::write_latency_csv(&result, path).context("failed to write latency CSV")?;
    }
    if let Some(path) = &command.metrics_output {
        report::write_metrics(stresser.recorder().registry(), path)
            .context("failed to write metrics")?;
    }

    println!("\n'k8s-tester-stress apply' success");
    Ok(())
}

async fn run_delete(args: &Args, config: StressConfig) -> Result<()> {
    if args.prompt && !confirm(&format!("delete namespace {:?}", config.namespace))? {
        return Err(Error::Cancelled).context("delete declined");
    }

    let stresser = build_stresser(args, config).await?;
    stresser.delete().await.context("failed to delete")?;

    println!("\n'k8s-tester-stress delete' success");
    Ok(())
}

async fn build_stresser(args: &Args, config: StressConfig) -> Result<Stresser> {
    let client = connect(args.kubeconfig_path.as_deref()).await?;
    let client = KubeStressClient::new(client, &config.namespace, config.client_timeout);
    Ok(Stresser::new(config, Arc::new(client))?)
}

/// Returns a token that is cancelled on the first interrupt signal.
pub fn stop_on_ctrl_c() -> CancellationToken {
    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("received interrupt, stopping");
                stop.cancel();
            }
        }
    });
    stop
}

fn kubectl(args: &Args, namespace: &str) -> Option<Kubectl> {
    let path = args.kubectl_path.as_deref()?;
    Some(Kubectl::new(path, namespace).with_kubeconfig(args.kubeconfig_path.as_deref()))
}

async fn dump_diagnostics(kubectl: &Kubectl) {
    let describe = kubectl.describe(&["pods"]).await;
    let logs = kubectl.logs(LogTarget::Selector("name")).await;
    let mut stderr = io::stderr().lock();
    let _ = writeln!(stderr, "{describe}\n{logs}");
}

/// Asks on stdin whether to go ahead with `action`.
pub fn confirm(action: &str) -> Result<bool> {
    ask(&mut io::stdin().lock(), &mut io::stdout(), action)
}

fn ask(input: &mut impl BufRead, output: &mut impl Write, action: &str) -> Result<bool> {
    write!(output, "Ready to {action}? ([y]es/[n]o): ")?;
    output.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "yes"))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use argh::FromArgs;

    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::from_args(&["k8s-tester-stress"], args).unwrap()
    }

    #[test]
    fn flags_override_config() {
        let args = parse(&[
            "--prompt",
            "false",
            "--namespace",
            "stress",
            "--kubectl-path",
            "/kubectl",
            "apply",
            "--run-timeout",
            "5m",
            "--objects",
            "-1",
            "--object-size",
            "2048",
            "--list-batch-limit",
            "-1",
            "--ecr-busybox-image",
            "registry.local/busybox",
        ]);
        assert!(!args.prompt);
        assert_eq!(args.kubectl_path.as_deref(), Some(Path::new("/kubectl")));

        let mut config = StressConfig::default();
        args.apply_overrides(&mut config);
        let Command::Apply(apply) = &args.command else {
            panic!("expected apply command");
        };
        apply.apply_overrides(&mut config);

        assert_eq!(config.namespace, "stress");
        assert_eq!(config.run_timeout, Duration::from_secs(300));
        assert_eq!(config.objects, -1);
        assert_eq!(config.object_size, ByteSize::b(2048));
        assert_eq!(config.list_limit(), None);
        assert_eq!(config.busybox_image.as_deref(), Some("registry.local/busybox"));
    }

    #[test]
    fn unset_flags_keep_config() {
        let args = parse(&["delete"]);
        assert!(args.prompt);

        let config = StressConfig {
            namespace: "from-file".into(),
            minimum_nodes: 3,
            ..Default::default()
        };
        let mut overridden = config.clone();
        args.apply_overrides(&mut overridden);
        assert_eq!(overridden, config);
    }

    #[test]
    fn rejects_invalid_duration() {
        let result = Args::from_args(&["k8s-tester-stress"], &["apply", "--run-timeout", "soon"]);
        assert!(result.is_err());
    }

    #[test]
    fn confirmation_answers() {
        let answer = |input: &str| {
            let mut output = Vec::new();
            let confirmed = ask(&mut input.as_bytes(), &mut output, "delete namespace").unwrap();
            assert_eq!(output, b"Ready to delete namespace? ([y]es/[n]o): ");
            confirmed
        };
        assert!(answer("y\n"));
        assert!(answer("  yes\n"));
        assert!(!answer("n\n"));
        assert!(!answer("Yes please\n"));
        assert!(!answer(""));
    }
}
