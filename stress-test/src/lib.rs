//! Test utilities for the stress tester.
//!
//! This crate provides in-memory stand-ins for the Kubernetes API server:
//! [`cluster::FakeCluster`] for the stress driver and [`api::FakeApiServer`]
//! for the in-cluster runner. It also provides a tracing initializer for
//! tests.

pub mod api;
pub mod cluster;
pub mod tracing;

pub use api::FakeApiServer;
pub use cluster::FakeCluster;
