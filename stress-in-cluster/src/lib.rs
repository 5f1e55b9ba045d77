//! Runs the stress driver as a CronJob inside the cluster under test.
//!
//! The [`Runner`] installs a service account with broad permissions, a
//! ConfigMap holding the kubeconfig, and a CronJob whose pods run
//! `k8s-tester-stress apply`. It then polls the namespace until the CronJob
//! completed the configured number of pods.
#![warn(missing_debug_implementations)]

pub mod cli;
pub mod client;
pub mod completion;
pub mod config;
pub mod resources;
pub mod runner;

mod error;

pub use client::{ClusterClient, KubeClusterClient};
pub use config::InClusterConfig;
pub use error::{Error, Result};
pub use runner::{CompletionReport, Runner};
