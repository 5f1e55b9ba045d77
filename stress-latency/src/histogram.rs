//! Discrete latency histograms derived from cumulative counters.
//!
//! The instrumentation layer exposes Prometheus-style cumulative histograms,
//! where every bucket counts the observations at or below its upper bound.
//! [`HistogramBuckets::parse`] turns such a snapshot into disjoint buckets
//! with explicit lower and upper bounds, terminated by an open-ended bucket
//! whose upper bound is [`f64::MAX`].

use std::collections::HashMap;

use prettytable::format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR;
use prettytable::{Table, row};
use serde::{Deserialize, Serialize};

use crate::error::{LatencyError, Result};

/// Scale of all request latency histograms.
pub const LATENCY_SCALE: &str = "milliseconds";

/// Upper bound of the first latency bucket, in milliseconds.
pub const LATENCY_BUCKET_START: f64 = 0.5;

/// Growth factor between consecutive latency bucket bounds.
pub const LATENCY_BUCKET_FACTOR: f64 = 2.0;

/// Number of finite latency buckets, covering up to 4096ms.
pub const LATENCY_BUCKET_COUNT: usize = 14;

/// Rendering of the terminal bucket's upper bound in tables.
const MAX_BOUND_LABEL: &str = "math.MaxFloat64";

/// Returns `count` upper bounds, starting at `start` and each `factor` times
/// larger than the previous one.
pub fn exponential_buckets(start: f64, factor: f64, count: usize) -> Vec<f64> {
    std::iter::successors(Some(start), |bound| Some(bound * factor))
        .take(count)
        .collect()
}

/// Upper bounds of the request latency histograms.
pub fn latency_bucket_bounds() -> Vec<f64> {
    exponential_buckets(
        LATENCY_BUCKET_START,
        LATENCY_BUCKET_FACTOR,
        LATENCY_BUCKET_COUNT,
    )
}

/// A cumulative bucket: the number of observations `<= upper_bound`.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct CumulativeBucket {
    pub upper_bound: f64,
    pub cumulative_count: u64,
}

/// A point-in-time snapshot of a cumulative histogram.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct CumulativeHistogram {
    /// Total number of observations, including those above the last bound.
    pub sample_count: u64,
    /// Sum of all observed values.
    pub sample_sum: f64,
    /// Buckets in ascending order of upper bound.
    pub buckets: Vec<CumulativeBucket>,
}

/// A single histogram bucket covering `[lower_bound, upper_bound)`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct HistogramBucket {
    pub scale: String,
    #[serde(rename = "lower-bound")]
    pub lower_bound: f64,
    #[serde(rename = "upper-bound")]
    pub upper_bound: f64,
    pub count: u64,
}

impl HistogramBucket {
    fn same_bounds(&self, other: &Self) -> bool {
        self.scale == other.scale
            && self.lower_bound == other.lower_bound
            && self.upper_bound == other.upper_bound
    }

    fn mismatch(&self) -> LatencyError {
        LatencyError::BoundsMismatch {
            lower: self.lower_bound,
            upper: self.upper_bound,
        }
    }
}

/// Disjoint, contiguous histogram buckets ordered by lower bound.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(transparent)]
pub struct HistogramBuckets(Vec<HistogramBucket>);

impl HistogramBuckets {
    /// Wraps the given buckets, ordering them by lower bound.
    pub fn new(mut buckets: Vec<HistogramBucket>) -> Self {
        buckets.sort_by(|a, b| a.lower_bound.total_cmp(&b.lower_bound));
        Self(buckets)
    }

    /// Converts a cumulative snapshot into disjoint buckets.
    ///
    /// With `n` cumulative buckets the result has `n + 1` entries. The first
    /// starts at zero, every following bucket starts at the previous upper
    /// bound, and the last one spans from the highest bound to [`f64::MAX`]
    /// with the observations above all finite bounds.
    pub fn parse(scale: &str, source: &CumulativeHistogram) -> Result<Self> {
        let mut buckets = Vec::with_capacity(source.buckets.len() + 1);
        let mut lower_bound = 0.0;
        let mut previous_count = 0;

        for bucket in &source.buckets {
            if bucket.upper_bound <= lower_bound && !buckets.is_empty() {
                return Err(LatencyError::InvalidCumulative(format!(
                    "upper bound {} does not exceed {lower_bound}",
                    bucket.upper_bound
                )));
            }
            let count = bucket
                .cumulative_count
                .checked_sub(previous_count)
                .ok_or_else(|| {
                    LatencyError::InvalidCumulative(format!(
                        "count decreases at upper bound {}",
                        bucket.upper_bound
                    ))
                })?;

            buckets.push(HistogramBucket {
                scale: scale.to_owned(),
                lower_bound,
                upper_bound: bucket.upper_bound,
                count,
            });
            lower_bound = bucket.upper_bound;
            previous_count = bucket.cumulative_count;
        }

        let overflow = source.sample_count.checked_sub(previous_count).ok_or_else(|| {
            LatencyError::InvalidCumulative(format!(
                "sample count {} is below the cumulative count {previous_count}",
                source.sample_count
            ))
        })?;
        buckets.push(HistogramBucket {
            scale: scale.to_owned(),
            lower_bound,
            upper_bound: f64::MAX,
            count: overflow,
        });

        Ok(Self(buckets))
    }

    /// Adds the counts of `other` to the counts of `self`, bucket by bucket.
    ///
    /// Both histograms must have identical buckets in scale and bounds.
    pub fn merge(&self, other: &Self) -> Result<Self> {
        self.ensure_compatible(other)?;

        // Buckets are matched by their bounds, not by position.
        let mut counts: HashMap<(&str, u64, u64), u64> = self
            .0
            .iter()
            .map(|bucket| (bucket_key(bucket), bucket.count))
            .collect();
        for bucket in &other.0 {
            let count = counts
                .get_mut(&bucket_key(bucket))
                .ok_or_else(|| bucket.mismatch())?;
            *count += bucket.count;
        }

        let merged = self
            .0
            .iter()
            .map(|bucket| HistogramBucket {
                count: counts[&bucket_key(bucket)],
                ..bucket.clone()
            })
            .collect();
        Ok(Self::new(merged))
    }

    /// Verifies that `other` has the same number of buckets with the same
    /// bounds and scale.
    pub fn ensure_compatible(&self, other: &Self) -> Result<()> {
        if self.0.len() != other.0.len() {
            return Err(LatencyError::HistogramLenMismatch {
                a: self.0.len(),
                b: other.0.len(),
            });
        }
        for (a, b) in self.0.iter().zip(&other.0) {
            if !a.same_bounds(b) {
                return Err(b.mismatch());
            }
        }
        Ok(())
    }

    /// Sum of the counts of all buckets.
    pub fn total_count(&self) -> u64 {
        self.0.iter().map(|bucket| bucket.count).sum()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistogramBucket> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[HistogramBucket] {
        &self.0
    }

    /// Renders the buckets as a text table, followed by a scale caption.
    ///
    /// Returns an empty string if there are no buckets.
    pub fn table(&self) -> String {
        let Some(first) = self.0.first() else {
            return String::new();
        };

        let mut table = Table::new();
        table.set_format(*FORMAT_NO_BORDER_LINE_SEPARATOR);
        table.set_titles(row!["lower bound", "upper bound", "count"]);
        for bucket in &self.0 {
            table.add_row(row![
                format_bound(&bucket.scale, bucket.lower_bound),
                format_bound(&bucket.scale, bucket.upper_bound),
                bucket.count
            ]);
        }

        format!("{table}\t({:?} scale)\n", first.scale)
    }
}

impl FromIterator<HistogramBucket> for HistogramBuckets {
    fn from_iter<T: IntoIterator<Item = HistogramBucket>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

fn bucket_key(bucket: &HistogramBucket) -> (&str, u64, u64) {
    (
        bucket.scale.as_str(),
        bucket.lower_bound.to_bits(),
        bucket.upper_bound.to_bits(),
    )
}

fn format_bound(scale: &str, bound: f64) -> String {
    if bound == f64::MAX {
        MAX_BOUND_LABEL.to_owned()
    } else if scale == LATENCY_SCALE {
        format!("{bound:.3}")
    } else {
        format!("{bound:.6}")
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn cumulative(counts: &[u64], sample_count: u64) -> CumulativeHistogram {
        CumulativeHistogram {
            sample_count,
            sample_sum: 0.0,
            buckets: latency_bucket_bounds()
                .into_iter()
                .zip(counts.iter().copied())
                .map(|(upper_bound, cumulative_count)| CumulativeBucket {
                    upper_bound,
                    cumulative_count,
                })
                .collect(),
        }
    }

    fn buckets_with_counts(counts: &[u64]) -> HistogramBuckets {
        let mut running = 0;
        let cumulative_counts: Vec<_> = counts[..LATENCY_BUCKET_COUNT]
            .iter()
            .map(|count| {
                running += count;
                running
            })
            .collect();
        let total = running + counts[LATENCY_BUCKET_COUNT];
        HistogramBuckets::parse(LATENCY_SCALE, &cumulative(&cumulative_counts, total)).unwrap()
    }

    #[test]
    fn exponential_bounds() {
        let bounds = latency_bucket_bounds();
        assert_eq!(bounds.len(), 14);
        assert_eq!(bounds[0], 0.5);
        assert_eq!(bounds[1], 1.0);
        assert_eq!(bounds[13], 4096.0);
    }

    #[test]
    fn parse_one_fast_two_slow() {
        // One observation of 1ms and two of ten minutes.
        let mut counts = [1; 14];
        counts[0] = 0;
        let parsed = HistogramBuckets::parse(LATENCY_SCALE, &cumulative(&counts, 3)).unwrap();

        assert_eq!(parsed.len(), 15);
        assert_eq!(parsed.total_count(), 3);

        let expected_bounds = [
            (0.0, 0.5),
            (0.5, 1.0),
            (1.0, 2.0),
            (2.0, 4.0),
            (4.0, 8.0),
            (8.0, 16.0),
            (16.0, 32.0),
            (32.0, 64.0),
            (64.0, 128.0),
            (128.0, 256.0),
            (256.0, 512.0),
            (512.0, 1024.0),
            (1024.0, 2048.0),
            (2048.0, 4096.0),
            (4096.0, f64::MAX),
        ];
        for (bucket, (lower, upper)) in parsed.iter().zip(expected_bounds) {
            assert_eq!(bucket.scale, LATENCY_SCALE);
            assert_eq!((bucket.lower_bound, bucket.upper_bound), (lower, upper));
        }

        let counts: Vec<_> = parsed.iter().map(|bucket| bucket.count).collect();
        assert_eq!(counts, [0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]);
    }

    #[test]
    fn parse_rejects_decreasing_counts() {
        let mut counts = [2; 14];
        counts[5] = 1;
        let result = HistogramBuckets::parse(LATENCY_SCALE, &cumulative(&counts, 2));
        assert!(matches!(result, Err(LatencyError::InvalidCumulative(_))));

        let result = HistogramBuckets::parse(LATENCY_SCALE, &cumulative(&[2; 14], 1));
        assert!(matches!(result, Err(LatencyError::InvalidCumulative(_))));
    }

    #[test]
    fn parse_empty_source() {
        let parsed =
            HistogramBuckets::parse(LATENCY_SCALE, &CumulativeHistogram::default()).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.as_slice()[0].lower_bound, 0.0);
        assert_eq!(parsed.as_slice()[0].upper_bound, f64::MAX);
        assert_eq!(parsed.total_count(), 0);
    }

    #[test]
    fn merge_adds_counts() {
        let a = buckets_with_counts(&[0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]);
        let b = buckets_with_counts(&[0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 5]);

        let merged = a.merge(&b).unwrap();
        let counts: Vec<_> = merged.iter().map(|bucket| bucket.count).collect();
        assert_eq!(counts, [0, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 7]);
        assert_eq!(merged.total_count(), a.total_count() + b.total_count());
    }

    #[test]
    fn merge_rejects_length_mismatch() {
        let a = buckets_with_counts(&[0; 15]);
        let b = HistogramBuckets::new(a.as_slice()[..14].to_vec());

        let result = a.merge(&b);
        assert!(matches!(
            result,
            Err(LatencyError::HistogramLenMismatch { a: 15, b: 14 })
        ));
    }

    #[test]
    fn merge_rejects_foreign_bounds() {
        let a = buckets_with_counts(&[0; 15]);
        let mut buckets = a.as_slice().to_vec();
        buckets[3].upper_bound = 5.0;
        let b = HistogramBuckets::new(buckets);

        let result = a.merge(&b);
        assert!(matches!(result, Err(LatencyError::BoundsMismatch { .. })));
    }

    #[test]
    fn render_table() {
        let buckets = buckets_with_counts(&[0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]);
        let table = buckets.table();

        assert!(table.contains("lower bound"));
        assert!(table.contains("upper bound"));
        assert!(table.contains("0.500"));
        assert!(table.contains("4096.000"));
        assert!(table.contains("math.MaxFloat64"));
        assert!(table.ends_with("\t(\"milliseconds\" scale)\n"));

        assert_eq!(HistogramBuckets::default().table(), "");
    }

    #[test]
    fn json_field_names() {
        let buckets = buckets_with_counts(&[0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let json = serde_json::to_value(&buckets).unwrap();

        let second = &json[1];
        assert_eq!(second["scale"], "milliseconds");
        assert_eq!(second["lower-bound"], 0.5);
        assert_eq!(second["upper-bound"], 1.0);
        assert_eq!(second["count"], 1);
    }

    fn counts_strategy() -> impl Strategy<Value = Vec<u64>> {
        prop::collection::vec(0u64..1_000, LATENCY_BUCKET_COUNT + 1)
    }

    proptest! {
        #[test]
        fn parse_is_contiguous(counts in counts_strategy()) {
            let parsed = buckets_with_counts(&counts);

            prop_assert_eq!(parsed.len(), LATENCY_BUCKET_COUNT + 1);
            prop_assert_eq!(parsed.total_count(), counts.iter().sum::<u64>());
            prop_assert_eq!(parsed.as_slice()[0].lower_bound, 0.0);
            prop_assert_eq!(parsed.as_slice()[LATENCY_BUCKET_COUNT].upper_bound, f64::MAX);
            for pair in parsed.as_slice().windows(2) {
                prop_assert_eq!(pair[0].upper_bound, pair[1].lower_bound);
            }
        }

        #[test]
        fn merge_is_commutative_and_associative(
            a in counts_strategy(),
            b in counts_strategy(),
            c in counts_strategy(),
        ) {
            let (a, b, c) = (buckets_with_counts(&a), buckets_with_counts(&b), buckets_with_counts(&c));

            prop_assert_eq!(a.merge(&b).unwrap(), b.merge(&a).unwrap());
            prop_assert_eq!(
                a.merge(&b).unwrap().merge(&c).unwrap(),
                a.merge(&b.merge(&c).unwrap()).unwrap()
            );
            prop_assert_eq!(
                a.merge(&b).unwrap().total_count(),
                a.total_count() + b.total_count()
            );
        }
    }
}
