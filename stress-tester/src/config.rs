//! Configuration of a stress run.
//!
//! Values are layered from built-in defaults, an optional YAML file, and
//! environment variables prefixed with `STRESS__`. Command line flags are
//! applied on top by the CLI.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use bytesize::ByteSize;
use figment::providers::{Env, Format, Serialized, Yaml};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "STRESS__";

pub const DEFAULT_MINIMUM_NODES: usize = 1;
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_OBJECTS: i64 = -1;
pub const DEFAULT_OBJECT_SIZE: ByteSize = ByteSize::kib(10);
pub const DEFAULT_UPDATE_CONCURRENCY: usize = 10;
pub const DEFAULT_LIST_BATCH_LIMIT: i64 = 1000;
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

const OBJECT_KEY_PREFIX_BASE: &str = "pod";
const OBJECT_KEY_SUFFIX_LEN: usize = 7;
const NAME_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Parameters of a single stress run.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct StressConfig {
    /// Namespace that holds all objects of the run.
    pub namespace: String,
    /// Minimum number of ready nodes required before starting.
    pub minimum_nodes: usize,
    /// Assume the namespace already exists.
    pub skip_namespace_creation: bool,

    /// How long the update and list loops run.
    #[serde(with = "humantime_serde")]
    pub run_timeout: Duration,
    /// Upper bound for every individual API request.
    #[serde(with = "humantime_serde")]
    pub client_timeout: Duration,

    /// Prefix of the pod names. Keys cycle through ten suffixes.
    pub object_key_prefix: String,
    /// Number of update iterations. Negative means until the run ends.
    pub objects: i64,
    /// Size of the random value embedded into every pod's command.
    pub object_size: ByteSize,
    /// Number of concurrent update workers per iteration.
    pub update_concurrency: usize,
    /// Page size of the list loop. Negative disables listing.
    pub list_batch_limit: i64,
    /// Container image of the created pods. Defaults to `busybox`.
    pub busybox_image: Option<String>,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            minimum_nodes: DEFAULT_MINIMUM_NODES,
            skip_namespace_creation: false,

            run_timeout: DEFAULT_RUN_TIMEOUT,
            client_timeout: DEFAULT_CLIENT_TIMEOUT,

            object_key_prefix: default_object_key_prefix(),
            objects: DEFAULT_OBJECTS,
            object_size: DEFAULT_OBJECT_SIZE,
            update_concurrency: DEFAULT_UPDATE_CONCURRENCY,
            list_batch_limit: DEFAULT_LIST_BATCH_LIMIT,
            busybox_image: None,
        }
    }
}

impl StressConfig {
    /// Loads configuration from defaults, an optional YAML file, and the
    /// environment, in increasing order of precedence.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a value
    /// has the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(StressConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }

    /// Fills zero values with defaults and rejects values a run cannot use.
    pub fn validate_and_set_defaults(&mut self) -> Result<(), Error> {
        if self.namespace.is_empty() {
            return Err(Error::ConfigInvalid("empty namespace".into()));
        }
        if self.minimum_nodes == 0 {
            self.minimum_nodes = DEFAULT_MINIMUM_NODES;
        }
        if self.run_timeout.is_zero() {
            self.run_timeout = DEFAULT_RUN_TIMEOUT;
        }
        if self.client_timeout.is_zero() {
            self.client_timeout = DEFAULT_CLIENT_TIMEOUT;
        }
        if self.object_key_prefix.is_empty() {
            self.object_key_prefix = default_object_key_prefix();
        }
        if self.object_size.as_u64() == 0 {
            return Err(Error::ConfigInvalid("zero object size".into()));
        }
        if self.update_concurrency == 0 {
            self.update_concurrency = DEFAULT_UPDATE_CONCURRENCY;
        }
        if self.list_batch_limit > i64::from(u32::MAX) {
            return Err(Error::ConfigInvalid(format!(
                "list batch limit {} exceeds {}",
                self.list_batch_limit,
                u32::MAX
            )));
        }
        Ok(())
    }

    /// Number of update iterations, or `None` to run until the run ends.
    pub fn objects_limit(&self) -> Option<u64> {
        u64::try_from(self.objects).ok()
    }

    /// Page size of the list loop, or `None` if listing is disabled.
    pub fn list_limit(&self) -> Option<u32> {
        u32::try_from(self.list_batch_limit).ok()
    }
}

/// Returns `pod` followed by a random lowercase alphanumeric suffix.
pub fn default_object_key_prefix() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..OBJECT_KEY_SUFFIX_LEN)
        .map(|_| NAME_CHARSET[rng.random_range(0..NAME_CHARSET.len())] as char)
        .collect();
    format!("{OBJECT_KEY_PREFIX_BASE}{suffix}")
}
