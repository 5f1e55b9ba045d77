use std::env;

use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, prelude::*};

/// Installs the global subscriber, logging to stderr.
///
/// `level` overrides the level taken from `RUST_LOG`.
pub fn initialize_tracing(level: Option<Level>) {
    let (default_level, env_filter) = parse_rust_log();
    let level = level.unwrap_or(default_level);
    let format = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    tracing_subscriber::registry()
        .with(format.with_filter(LevelFilter::from(level)))
        .with(env_filter)
        .init();
}

pub fn parse_rust_log() -> (Level, EnvFilter) {
    // Try to parse RUST_LOG as a simple level filter and apply default levels internally.
    // Otherwise, use it literally if the user knows which overrides they want to run.
    let level = match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) => match value.parse::<Level>() {
            Ok(level) => level,
            Err(_) => return (Level::TRACE, EnvFilter::new(value)),
        },
        Err(_) => Level::INFO,
    };

    // This is the maximum verbosity that will be logged, we filter this down to `level`.
    let env_filter = EnvFilter::new(
        "INFO,\
        kube_client=WARN,\
        hyper_util=WARN,\
        stress_tester=TRACE,\
        stress_in_cluster=TRACE,\
        stress_latency=TRACE,\
        ",
    );

    (level, env_filter)
}
