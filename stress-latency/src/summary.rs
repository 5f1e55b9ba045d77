use std::fmt::Write as _;
use std::time::Duration;

use prettytable::format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR;
use prettytable::{Table, row};
use serde::{Deserialize, Serialize};

use crate::durations::{Durations, Percentile};
use crate::error::{LatencyError, Result};
use crate::histogram::HistogramBuckets;

/// Latency summary of one request category within a run.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Summary {
    pub test_id: String,
    pub success_total: u64,
    pub failure_total: u64,
    /// Update attempts that lost a write race and were retried. They are
    /// part of `failure_total`.
    #[serde(default)]
    pub conflicts_total: u64,
    pub histogram: HistogramBuckets,

    #[serde(with = "duration_nanos")]
    pub p50: Duration,
    #[serde(with = "duration_nanos")]
    pub p90: Duration,
    #[serde(with = "duration_nanos")]
    pub p99: Duration,
    #[serde(rename = "p99.9", with = "duration_nanos")]
    pub p999: Duration,
    #[serde(rename = "p99.99", with = "duration_nanos")]
    pub p9999: Duration,
}

impl Summary {
    /// Builds a summary, picking percentiles from sorted `durations`.
    pub fn new(
        test_id: impl Into<String>,
        success_total: u64,
        failure_total: u64,
        histogram: HistogramBuckets,
        durations: &Durations,
    ) -> Result<Self> {
        if !durations.is_sorted() {
            return Err(LatencyError::UnsortedDurations);
        }

        Ok(Self {
            test_id: test_id.into(),
            success_total,
            failure_total,
            conflicts_total: 0,
            histogram,
            p50: durations.pick_p50(),
            p90: durations.pick_p90(),
            p99: durations.pick_p99(),
            p999: durations.pick_p999(),
            p9999: durations.pick_p9999(),
        })
    }

    /// Sets how many of the failures were retried write conflicts.
    pub fn with_conflicts(mut self, conflicts_total: u64) -> Self {
        self.conflicts_total = conflicts_total;
        self
    }

    pub fn total(&self) -> u64 {
        self.success_total + self.failure_total
    }

    /// Returns the summary's value for the given percentile.
    pub fn percentile(&self, percentile: Percentile) -> Duration {
        match percentile {
            Percentile::P50 => self.p50,
            Percentile::P90 => self.p90,
            Percentile::P99 => self.p99,
            Percentile::P999 => self.p999,
            Percentile::P9999 => self.p9999,
        }
    }

    /// Whether the counters agree with the histogram's observations.
    pub fn is_consistent(&self) -> bool {
        self.total() == self.histogram.total_count()
    }

    pub fn json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Renders totals, the histogram table, and percentiles as text.
    pub fn table(&self) -> String {
        let mut out = String::new();
        // Writing to a String cannot fail.
        let _ = writeln!(out, "TEST ID: {:?}\n", self.test_id);
        let _ = writeln!(out, "        TOTAL: {}", self.total());
        let _ = writeln!(out, "SUCCESS TOTAL: {}", self.success_total);
        let _ = writeln!(out, "FAILURE TOTAL: {}", self.failure_total);
        let _ = writeln!(
            out,
            "   CONFLICTS: {} (retried, included in failures)\n",
            self.conflicts_total
        );
        out.push_str(&self.histogram.table());
        out.push('\n');
        for percentile in Percentile::ALL {
            let _ = writeln!(
                out,
                "{:>8}-percentile Latency: {:?}",
                percentile.label(),
                self.percentile(percentile)
            );
        }
        out
    }
}

/// Percentage deltas between two summaries, from `a` to `b`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SummaryCompare {
    pub a: Summary,
    pub b: Summary,

    #[serde(rename = "latency-p50-delta-percent")]
    pub p50_delta_percent: f64,
    #[serde(rename = "latency-p90-delta-percent")]
    pub p90_delta_percent: f64,
    #[serde(rename = "latency-p99-delta-percent")]
    pub p99_delta_percent: f64,
    #[serde(rename = "latency-p99.9-delta-percent")]
    pub p999_delta_percent: f64,
    #[serde(rename = "latency-p99.99-delta-percent")]
    pub p9999_delta_percent: f64,
}

impl SummaryCompare {
    /// Returns the delta for the given percentile.
    pub fn delta(&self, percentile: Percentile) -> f64 {
        match percentile {
            Percentile::P50 => self.p50_delta_percent,
            Percentile::P90 => self.p90_delta_percent,
            Percentile::P99 => self.p99_delta_percent,
            Percentile::P999 => self.p999_delta_percent,
            Percentile::P9999 => self.p9999_delta_percent,
        }
    }

    pub fn json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Renders a table with one row per percentile.
    pub fn table(&self) -> String {
        let mut table = Table::new();
        table.set_format(*FORMAT_NO_BORDER_LINE_SEPARATOR);
        table.set_titles(row![
            "Percentile",
            format!("A {:?}", self.a.test_id),
            format!("B {:?}", self.b.test_id),
            "Delta"
        ]);
        for percentile in Percentile::ALL {
            table.add_row(row![
                format!("{}-pct Latency", percentile.label()),
                format!("{:?}", self.a.percentile(percentile)),
                format!("{:?}", self.b.percentile(percentile)),
                format_percent(self.delta(percentile))
            ]);
        }
        format!("{table}\t(% delta from 'A' to 'B')\n")
    }
}

/// Compares two summaries, computing `(b - a) / a * 100` per percentile.
///
/// Both summaries must have histograms with the same buckets. Deltas that are
/// not finite are replaced: NaN by zero and infinities by `±f64::MAX`.
pub fn compare(a: &Summary, b: &Summary) -> Result<SummaryCompare> {
    a.histogram.ensure_compatible(&b.histogram)?;

    let delta = |percentile| delta_percent(a.percentile(percentile), b.percentile(percentile));
    Ok(SummaryCompare {
        a: a.clone(),
        b: b.clone(),
        p50_delta_percent: delta(Percentile::P50),
        p90_delta_percent: delta(Percentile::P90),
        p99_delta_percent: delta(Percentile::P99),
        p999_delta_percent: delta(Percentile::P999),
        p9999_delta_percent: delta(Percentile::P9999),
    })
}

fn delta_percent(a: Duration, b: Duration) -> f64 {
    let a = a.as_nanos() as f64;
    let b = b.as_nanos() as f64;
    sanitize((b - a) / a * 100.0)
}

fn sanitize(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else if value == f64::INFINITY {
        f64::MAX
    } else if value == f64::NEG_INFINITY {
        -f64::MAX
    } else {
        value
    }
}

fn format_percent(value: f64) -> String {
    if value >= 0.0 {
        format!("+{value:.3} %")
    } else {
        format!("{value:.3} %")
    }
}

/// Serializes a [`Duration`] as an integer number of nanoseconds.
mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        serializer.serialize_u64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_nanos)
    }
}
