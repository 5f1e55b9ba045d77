//! Configuration of the in-cluster runner.
//!
//! Layered like the stress driver's configuration: built-in defaults, an
//! optional YAML file, and environment variables prefixed with
//! `STRESS_IN_CLUSTER__`. Nested values use `__` as separator, for example
//! `STRESS_IN_CLUSTER__STRESS__RUN_TIMEOUT=5m`.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use bytesize::ByteSize;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use stress_tester::config as driver;

use crate::error::Error;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "STRESS_IN_CLUSTER__";

pub const DEFAULT_STRESS_IMAGE: &str = "k8s-tester-stress:latest";
pub const DEFAULT_COMPLETES: i32 = 10;
pub const DEFAULT_PARALLELS: i32 = 10;
/// Every ten minutes.
pub const DEFAULT_SCHEDULE: &str = "*/10 * * * *";
pub const DEFAULT_SUCCESSFUL_JOBS_HISTORY_LIMIT: i32 = 10;
pub const DEFAULT_FAILED_JOBS_HISTORY_LIMIT: i32 = 10;
pub const DEFAULT_INITIAL_WAIT: Duration = Duration::from_secs(3 * 60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Parameters of the CronJob that runs the stress driver inside the cluster.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct InClusterConfig {
    /// Namespace of all runner resources.
    pub namespace: String,
    /// Minimum number of ready nodes required before applying.
    pub minimum_nodes: usize,
    /// Image containing the `k8s-tester-stress` binary at its root.
    pub stress_image: String,

    /// Number of pods that must succeed per scheduled job.
    pub completes: i32,
    /// Maximum number of pods a job runs at the same time.
    pub parallels: i32,
    /// CronJob schedule in cron syntax.
    pub schedule: String,
    pub successful_jobs_history_limit: i32,
    pub failed_jobs_history_limit: i32,

    /// How long to wait before polling for completed pods.
    #[serde(with = "humantime_serde")]
    pub initial_wait: Duration,
    /// Interval between completion polls.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Upper bound for every individual API request.
    #[serde(with = "humantime_serde")]
    pub client_timeout: Duration,

    /// Arguments passed to the stress driver in every pod.
    pub stress: StressArgs,
}

/// Flags of `k8s-tester-stress apply` as run by the CronJob.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct StressArgs {
    /// Container image of the pods created by the driver.
    pub busybox_image: Option<String>,
    #[serde(with = "humantime_serde")]
    pub run_timeout: Duration,
    pub object_key_prefix: String,
    pub objects: i64,
    pub object_size: ByteSize,
    pub update_concurrency: usize,
    pub list_batch_limit: i64,
}

impl Default for InClusterConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            minimum_nodes: driver::DEFAULT_MINIMUM_NODES,
            stress_image: DEFAULT_STRESS_IMAGE.to_owned(),

            completes: DEFAULT_COMPLETES,
            parallels: DEFAULT_PARALLELS,
            schedule: DEFAULT_SCHEDULE.to_owned(),
            successful_jobs_history_limit: DEFAULT_SUCCESSFUL_JOBS_HISTORY_LIMIT,
            failed_jobs_history_limit: DEFAULT_FAILED_JOBS_HISTORY_LIMIT,

            initial_wait: DEFAULT_INITIAL_WAIT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            client_timeout: DEFAULT_CLIENT_TIMEOUT,

            stress: StressArgs::default(),
        }
    }
}

impl Default for StressArgs {
    fn default() -> Self {
        Self {
            busybox_image: None,
            run_timeout: driver::DEFAULT_RUN_TIMEOUT,
            object_key_prefix: driver::default_object_key_prefix(),
            objects: driver::DEFAULT_OBJECTS,
            object_size: driver::DEFAULT_OBJECT_SIZE,
            update_concurrency: driver::DEFAULT_UPDATE_CONCURRENCY,
            list_batch_limit: driver::DEFAULT_LIST_BATCH_LIMIT,
        }
    }
}

impl InClusterConfig {
    /// Loads configuration from defaults, an optional YAML file, and the
    /// environment, in increasing order of precedence.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(InClusterConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }

    /// Fills zero values with defaults and rejects values the CronJob cannot
    /// run with.
    pub fn validate_and_set_defaults(&mut self) -> Result<(), Error> {
        if self.namespace.is_empty() {
            return Err(Error::ConfigInvalid("empty namespace".into()));
        }
        if self.stress_image.is_empty() {
            return Err(Error::ConfigInvalid("empty stress image".into()));
        }
        if self.minimum_nodes == 0 {
            self.minimum_nodes = driver::DEFAULT_MINIMUM_NODES;
        }
        if self.completes < 0 || self.parallels < 0 {
            return Err(Error::ConfigInvalid(format!(
                "negative completes {} or parallels {}",
                self.completes, self.parallels
            )));
        }
        if self.completes == 0 {
            self.completes = DEFAULT_COMPLETES;
        }
        if self.parallels == 0 {
            self.parallels = DEFAULT_PARALLELS;
        }
        if self.schedule.is_empty() {
            self.schedule = DEFAULT_SCHEDULE.to_owned();
        }
        if self.successful_jobs_history_limit == 0 {
            self.successful_jobs_history_limit = DEFAULT_SUCCESSFUL_JOBS_HISTORY_LIMIT;
        }
        if self.failed_jobs_history_limit == 0 {
            self.failed_jobs_history_limit = DEFAULT_FAILED_JOBS_HISTORY_LIMIT;
        }
        if self.poll_interval.is_zero() {
            self.poll_interval = DEFAULT_POLL_INTERVAL;
        }
        if self.client_timeout.is_zero() {
            self.client_timeout = DEFAULT_CLIENT_TIMEOUT;
        }

        let stress = &mut self.stress;
        if stress.run_timeout.is_zero() {
            stress.run_timeout = driver::DEFAULT_RUN_TIMEOUT;
        }
        if stress.object_key_prefix.is_empty() {
            stress.object_key_prefix = driver::default_object_key_prefix();
        }
        if stress.object_size.as_u64() == 0 {
            return Err(Error::ConfigInvalid("zero object size".into()));
        }
        if stress.update_concurrency == 0 {
            stress.update_concurrency = driver::DEFAULT_UPDATE_CONCURRENCY;
        }
        Ok(())
    }

    /// Number of pods that must succeed, as a count.
    pub fn target_completes(&self) -> usize {
        usize::try_from(self.completes).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn valid() -> InClusterConfig {
        InClusterConfig {
            namespace: "stress-in-cluster".into(),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_are_filled() {
        let mut config = InClusterConfig {
            completes: 0,
            parallels: 0,
            schedule: String::new(),
            successful_jobs_history_limit: 0,
            poll_interval: Duration::ZERO,
            stress: StressArgs {
                run_timeout: Duration::ZERO,
                object_key_prefix: String::new(),
                ..Default::default()
            },
            ..valid()
        };
        config.validate_and_set_defaults().unwrap();

        assert_eq!(config.completes, DEFAULT_COMPLETES);
        assert_eq!(config.parallels, DEFAULT_PARALLELS);
        assert_eq!(config.schedule, DEFAULT_SCHEDULE);
        assert_eq!(
            config.successful_jobs_history_limit,
            DEFAULT_SUCCESSFUL_JOBS_HISTORY_LIMIT
        );
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.stress.run_timeout, driver::DEFAULT_RUN_TIMEOUT);
        assert!(config.stress.object_key_prefix.starts_with("pod"));
        assert_eq!(config.target_completes(), 10);
    }

    #[test]
    fn rejects_invalid() {
        let mut config = InClusterConfig::default();
        assert!(matches!(
            config.validate_and_set_defaults(),
            Err(Error::ConfigInvalid(_))
        ));

        let mut config = InClusterConfig {
            completes: -1,
            ..valid()
        };
        assert!(matches!(
            config.validate_and_set_defaults(),
            Err(Error::ConfigInvalid(_))
        ));

        let mut config = InClusterConfig {
            stress: StressArgs {
                object_size: ByteSize::b(0),
                ..Default::default()
            },
            ..valid()
        };
        assert!(matches!(
            config.validate_and_set_defaults(),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn configured_with_env_and_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            namespace: from-yaml
            completes: 3
            schedule: "*/5 * * * *"
            stress:
              run_timeout: 2m
              objects: 100
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("STRESS_IN_CLUSTER__PARALLELS", "2");
            jail.set_env("STRESS_IN_CLUSTER__STRESS__OBJECTS", "-1");
            jail.set_env("STRESS_IN_CLUSTER__STRESS__OBJECT_SIZE", "4096");

            let config = InClusterConfig::load(Some(tempfile.path())).unwrap();
            assert_eq!(config.namespace, "from-yaml");
            assert_eq!(config.completes, 3);
            assert_eq!(config.parallels, 2);
            assert_eq!(config.schedule, "*/5 * * * *");
            assert_eq!(config.stress.run_timeout, Duration::from_secs(120));
            // Env should overwrite the yaml config
            assert_eq!(config.stress.objects, -1);
            assert_eq!(config.stress.object_size, ByteSize::b(4096));

            Ok(())
        });
    }
}
