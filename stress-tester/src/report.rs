//! Output of finished runs: tables, JSON, CSV and metrics.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use stress_latency::LatencyError;
use yansi::Paint;

use crate::driver::StressResult;
use crate::metrics::{Category, Registry};

fn title(category: Category) -> &'static str {
    match category {
        Category::Writes => "LatencySummaryWrites",
        Category::Gets => "LatencySummaryGets",
        Category::RangeGets => "LatencySummaryRangeGets",
    }
}

/// Prints the summary table of every category.
pub fn print_summaries(result: &StressResult, out: &mut impl Write) -> io::Result<()> {
    for category in Category::ALL {
        writeln!(out)?;
        writeln!(out, "{}", format!("## {}", title(category)).bold())?;
        writeln!(out, "{}", result.summary(category).table())?;
    }
    if result.stopped {
        writeln!(out, "{}", "run was stopped early, results are partial".yellow())?;
    }
    Ok(())
}

/// Writes all three summaries as a single JSON document.
pub fn write_summary_json(result: &StressResult, path: &Path) -> Result<(), LatencyError> {
    let json = serde_json::to_vec_pretty(result)?;
    fs::write(path, json)?;
    tracing::info!(path = %path.display(), "wrote latency summaries");
    Ok(())
}

/// Writes every sample of the run as `label,duration-ms` CSV.
pub fn write_latency_csv(result: &StressResult, path: &Path) -> Result<(), LatencyError> {
    let labeled = result.samples.labeled();
    labeled.to_csv_file(path)?;
    tracing::info!(path = %path.display(), samples = labeled.len(), "wrote latency samples");
    Ok(())
}

/// Writes the run's metrics in the Prometheus text format.
pub fn write_metrics(registry: &Registry, path: &Path) -> prometheus::Result<()> {
    fs::write(path, registry.render_prometheus()?)?;
    tracing::info!(path = %path.display(), "wrote metrics");
    Ok(())
}
