use tracing_subscriber::EnvFilter;

const CRATE_NAMES: &[&str] = &["stress_tester", "stress_in_cluster", "stress_latency"];

/// Initialize the logger for testing.
///
/// This logs to the stdout registered by the Rust test runner. Only logs of
/// the stress crates are captured, together with errors of all others.
///
/// # Example
///
/// ```
/// stress_test::tracing::init();
/// ```
pub fn init() {
    let directives = CRATE_NAMES
        .iter()
        .map(|name| format!("{name}=TRACE"))
        .collect::<Vec<_>>()
        .join(",");

    tracing_subscriber::fmt::fmt()
        .with_env_filter(EnvFilter::new(format!("ERROR,{directives}")))
        .with_target(true)
        .with_test_writer()
        .compact()
        .try_init()
        .ok();
}
