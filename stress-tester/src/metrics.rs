//! Request counters and latency histograms of a stress run.
//!
//! Each [`Category`] has success, failure, and conflict gauges plus a latency
//! histogram in milliseconds with bucket bounds `0.5 * 2^i` for `i` in
//! `0..14`. They live in a [`prometheus::Registry`] owned by a single run, so
//! gathered values always describe exactly that run.

use std::fmt;

use prometheus::proto::MetricFamily;
use prometheus::{Histogram, HistogramOpts, IntGauge, Opts, TextEncoder};
use stress_latency::{CumulativeBucket, CumulativeHistogram, latency_bucket_bounds};

/// The request categories measured by a stress run.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Category {
    /// Create and update requests.
    Writes,
    /// Single-object get requests.
    Gets,
    /// Paginated list requests.
    RangeGets,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Writes, Category::Gets, Category::RangeGets];

    /// Label of the category in exported samples.
    pub const fn label(self) -> &'static str {
        match self {
            Category::Writes => "writes",
            Category::Gets => "gets",
            Category::RangeGets => "range-gets",
        }
    }

    const fn metric_name(self) -> &'static str {
        match self {
            Category::Writes => "write",
            Category::Gets => "get",
            Category::RangeGets => "range_get",
        }
    }

    pub fn success_metric(self) -> String {
        format!("stress_client_{}_requests_success_total", self.metric_name())
    }

    pub fn failure_metric(self) -> String {
        format!("stress_client_{}_requests_failure_total", self.metric_name())
    }

    pub fn conflict_metric(self) -> String {
        format!("stress_client_{}_requests_conflicts_total", self.metric_name())
    }

    pub fn latency_metric(self) -> String {
        format!(
            "stress_client_{}_request_latency_milliseconds",
            self.metric_name()
        )
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Collectors of one request category.
pub struct CategoryMetrics {
    success: IntGauge,
    failure: IntGauge,
    conflicts: IntGauge,
    latency: Histogram,
}

impl fmt::Debug for CategoryMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CategoryMetrics")
            .field("success", &self.success.get())
            .field("failure", &self.failure.get())
            .field("conflicts", &self.conflicts.get())
            .finish_non_exhaustive()
    }
}

impl CategoryMetrics {
    fn register(category: Category, registry: &prometheus::Registry) -> prometheus::Result<Self> {
        let gauge = |name: String, kind: &str| {
            let help = format!("Total number of {kind} {category} requests.");
            let gauge = IntGauge::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(gauge.clone()))?;
            Ok::<_, prometheus::Error>(gauge)
        };
        let success = gauge(category.success_metric(), "successful")?;
        let failure = gauge(category.failure_metric(), "failed")?;
        let conflicts = gauge(category.conflict_metric(), "conflicting")?;

        let opts = HistogramOpts::new(
            category.latency_metric(),
            format!("Bucketed histogram of {category} request latency."),
        )
        .buckets(latency_bucket_bounds());
        let latency = Histogram::with_opts(opts)?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            success,
            failure,
            conflicts,
            latency,
        })
    }

    pub fn record_success(&self) {
        self.success.inc();
    }

    pub fn record_failure(&self) {
        self.failure.inc();
    }

    pub fn record_conflict(&self) {
        self.conflicts.inc();
    }

    /// Records a value into the first bucket whose upper bound is `>= millis`.
    pub fn observe_millis(&self, millis: f64) {
        self.latency.observe(millis);
    }
}

/// Gathered values of one [`Category`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CategorySnapshot {
    pub success_total: u64,
    pub failure_total: u64,
    pub conflicts_total: u64,
    pub latency: CumulativeHistogram,
}

/// All metrics of a stress run, keyed by [`Category`].
pub struct Registry {
    registry: prometheus::Registry,
    writes: CategoryMetrics,
    gets: CategoryMetrics,
    range_gets: CategoryMetrics,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("writes", &self.writes)
            .field("gets", &self.gets)
            .field("range_gets", &self.range_gets)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Creates an empty registry with the collectors of all categories.
    pub fn new() -> prometheus::Result<Self> {
        let registry = prometheus::Registry::new();
        Ok(Self {
            writes: CategoryMetrics::register(Category::Writes, &registry)?,
            gets: CategoryMetrics::register(Category::Gets, &registry)?,
            range_gets: CategoryMetrics::register(Category::RangeGets, &registry)?,
            registry,
        })
    }

    pub fn category(&self, category: Category) -> &CategoryMetrics {
        match category {
            Category::Writes => &self.writes,
            Category::Gets => &self.gets,
            Category::RangeGets => &self.range_gets,
        }
    }

    /// Gathers the registry and extracts the values of `category`.
    pub fn snapshot(&self, category: Category) -> CategorySnapshot {
        let families = self.registry.gather();
        CategorySnapshot {
            success_total: gauge_value(&families, &category.success_metric()),
            failure_total: gauge_value(&families, &category.failure_metric()),
            conflicts_total: gauge_value(&families, &category.conflict_metric()),
            latency: histogram_value(&families, &category.latency_metric()),
        }
    }

    /// Renders all metrics in the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> prometheus::Result<String> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

fn find<'a>(families: &'a [MetricFamily], name: &str) -> Option<&'a prometheus::proto::Metric> {
    families
        .iter()
        .find(|family| family.get_name() == name)
        .and_then(|family| family.get_metric().first())
}

fn gauge_value(families: &[MetricFamily], name: &str) -> u64 {
    find(families, name).map_or(0, |metric| metric.get_gauge().get_value() as u64)
}

fn histogram_value(families: &[MetricFamily], name: &str) -> CumulativeHistogram {
    let Some(metric) = find(families, name) else {
        return CumulativeHistogram::default();
    };
    let histogram = metric.get_histogram();
    CumulativeHistogram {
        sample_count: histogram.get_sample_count(),
        sample_sum: histogram.get_sample_sum(),
        buckets: histogram
            .get_bucket()
            .iter()
            .map(|bucket| CumulativeBucket {
                upper_bound: bucket.get_upper_bound(),
                cumulative_count: bucket.get_cumulative_count(),
            })
            .collect(),
    }
}
