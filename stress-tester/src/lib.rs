//! Stress driver for the Kubernetes API server.
//!
//! A [`Stresser`] drives concurrent read-modify-write cycles over a small set
//! of pods together with a continuous list loop, measuring every request.
//! When the run ends, it reports a [`stress_latency::Summary`] for writes,
//! gets, and range gets.
#![warn(missing_debug_implementations)]

pub mod cli;
pub mod client;
pub mod config;
pub mod driver;
pub mod instrument;
pub mod kubectl;
pub mod metrics;
pub mod observability;
pub mod pod;
pub mod report;
pub mod retry;

mod error;

pub use client::{KubeStressClient, RequestError, StressClient};
pub use config::StressConfig;
pub use driver::{DoneSignal, RunSamples, StressResult, Stresser};
pub use error::{Error, Result};
