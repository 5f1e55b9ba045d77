//! Client-side request durations and percentile selection.
//!
//! Percentiles are picked by nearest rank over a sorted sample set: the index
//! for quantile `q` over `n` samples is `floor(n * q)`, computed in integer
//! arithmetic and clamped to the last sample. An empty set yields a zero
//! duration and a single sample is returned for every percentile.

use std::fs::File;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A percentile that can be picked from sorted durations.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Percentile {
    P50,
    P90,
    P99,
    P999,
    P9999,
}

impl Percentile {
    /// All reported percentiles, in ascending order.
    pub const ALL: [Percentile; 5] = [
        Percentile::P50,
        Percentile::P90,
        Percentile::P99,
        Percentile::P999,
        Percentile::P9999,
    ];

    const fn ratio(self) -> (usize, usize) {
        match self {
            Percentile::P50 => (50, 100),
            Percentile::P90 => (90, 100),
            Percentile::P99 => (99, 100),
            Percentile::P999 => (999, 1000),
            Percentile::P9999 => (9999, 10000),
        }
    }

    /// Human readable percentile, such as `99.9`.
    pub const fn label(self) -> &'static str {
        match self {
            Percentile::P50 => "50",
            Percentile::P90 => "90",
            Percentile::P99 => "99",
            Percentile::P999 => "99.9",
            Percentile::P9999 => "99.99",
        }
    }

    /// Returns the index of this percentile within `len` sorted samples.
    ///
    /// Returns `None` for an empty sample set.
    pub fn index(self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let (numerator, denominator) = self.ratio();
        Some((len.saturating_mul(numerator) / denominator).min(len - 1))
    }
}

/// An append-only collection of request durations.
///
/// Durations are collected unsorted while a run is in progress, then sorted
/// once before any percentile is picked. Picking from an unsorted collection
/// returns an arbitrary sample; callers that need a guarantee should check
/// [`is_sorted`](Self::is_sorted) first.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Durations(Vec<Duration>);

impl Durations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, duration: Duration) {
        self.0.push(duration);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn sort(&mut self) {
        self.0.sort_unstable();
    }

    pub fn is_sorted(&self) -> bool {
        self.0.is_sorted()
    }

    pub fn as_slice(&self) -> &[Duration] {
        &self.0
    }

    /// Picks the given percentile, or a zero duration if there are no samples.
    pub fn pick(&self, percentile: Percentile) -> Duration {
        percentile
            .index(self.0.len())
            .map(|index| self.0[index])
            .unwrap_or_default()
    }

    pub fn pick_p50(&self) -> Duration {
        self.pick(Percentile::P50)
    }

    pub fn pick_p90(&self) -> Duration {
        self.pick(Percentile::P90)
    }

    pub fn pick_p99(&self) -> Duration {
        self.pick(Percentile::P99)
    }

    pub fn pick_p999(&self) -> Duration {
        self.pick(Percentile::P999)
    }

    pub fn pick_p9999(&self) -> Duration {
        self.pick(Percentile::P9999)
    }

    /// Attaches `label` to every sample, keeping the current order.
    pub fn labeled(&self, label: &str) -> LabeledDurations {
        self.0
            .iter()
            .map(|&duration| DurationWithLabel {
                duration,
                label: label.to_owned(),
            })
            .collect()
    }
}

impl From<Vec<Duration>> for Durations {
    fn from(samples: Vec<Duration>) -> Self {
        Self(samples)
    }
}

impl FromIterator<Duration> for Durations {
    fn from_iter<T: IntoIterator<Item = Duration>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<Duration> for Durations {
    fn extend<T: IntoIterator<Item = Duration>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

impl IntoIterator for Durations {
    type Item = Duration;
    type IntoIter = std::vec::IntoIter<Duration>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// A single duration tagged with the request category it was measured for.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct DurationWithLabel {
    pub duration: Duration,
    pub label: String,
}

/// Durations from several categories, kept together for export.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LabeledDurations(Vec<DurationWithLabel>);

#[derive(Serialize)]
struct CsvRecord<'a> {
    label: &'a str,
    #[serde(rename = "duration-ms")]
    duration_ms: u128,
}

impl LabeledDurations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, duration: DurationWithLabel) {
        self.0.push(duration);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sorts by duration. Labels of equal durations keep their relative order.
    pub fn sort(&mut self) {
        self.0.sort_by_key(|sample| sample.duration);
    }

    pub fn is_sorted(&self) -> bool {
        self.0.is_sorted_by_key(|sample| sample.duration)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DurationWithLabel> {
        self.0.iter()
    }

    /// Picks the given percentile, or an empty zero sample if there are none.
    pub fn pick(&self, percentile: Percentile) -> DurationWithLabel {
        percentile
            .index(self.0.len())
            .map(|index| self.0[index].clone())
            .unwrap_or_default()
    }

    /// Writes all samples as CSV with a `label,duration-ms` header.
    ///
    /// Durations are truncated to whole milliseconds.
    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<()> {
        let mut writer = csv::Writer::from_writer(writer);
        // Serializing a struct only emits the header once a record exists.
        if self.0.is_empty() {
            writer.write_record(["label", "duration-ms"])?;
        }
        for sample in &self.0 {
            writer.serialize(CsvRecord {
                label: &sample.label,
                duration_ms: sample.duration.as_millis(),
            })?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Creates (or truncates) the file at `path` and writes all samples as CSV.
    pub fn to_csv_file(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        self.write_csv(io::BufWriter::new(file))
    }
}

impl FromIterator<DurationWithLabel> for LabeledDurations {
    fn from_iter<T: IntoIterator<Item = DurationWithLabel>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<DurationWithLabel> for LabeledDurations {
    fn extend<T: IntoIterator<Item = DurationWithLabel>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

impl IntoIterator for LabeledDurations {
    type Item = DurationWithLabel;
    type IntoIter = std::vec::IntoIter<DurationWithLabel>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand::seq::SliceRandom;
    use rand::{SeedableRng, rngs::SmallRng};

    use super::*;

    fn millis(values: impl IntoIterator<Item = u64>) -> Durations {
        values.into_iter().map(Duration::from_millis).collect()
    }

    #[test]
    fn empty_picks_zero() {
        let durations = Durations::new();
        for percentile in Percentile::ALL {
            assert_eq!(durations.pick(percentile), Duration::ZERO);
        }

        let labeled = LabeledDurations::new();
        assert_eq!(labeled.pick(Percentile::P99), DurationWithLabel::default());
    }

    #[test]
    fn single_sample_is_every_percentile() {
        let durations = millis([42]);
        for percentile in Percentile::ALL {
            assert_eq!(durations.pick(percentile), Duration::from_millis(42));
        }
    }

    #[test]
    fn nearest_rank_indices() {
        assert_eq!(Percentile::P50.index(20_000), Some(10_000));
        assert_eq!(Percentile::P90.index(20_000), Some(18_000));
        assert_eq!(Percentile::P99.index(20_000), Some(19_800));
        assert_eq!(Percentile::P999.index(20_000), Some(19_980));
        assert_eq!(Percentile::P9999.index(20_000), Some(19_998));

        // floor(n * q) lands past the end only when q rounds to 1; clamp it.
        assert_eq!(Percentile::P9999.index(3), Some(2));
        assert_eq!(Percentile::P50.index(1), Some(0));
        assert_eq!(Percentile::P50.index(0), None);
    }

    #[test]
    fn shuffled_samples_after_sort() {
        let mut samples: Vec<_> = (0..20_000).map(Duration::from_millis).collect();
        samples.shuffle(&mut SmallRng::seed_from_u64(7));

        let mut durations = Durations::from(samples);
        assert!(!durations.is_sorted());
        durations.sort();
        assert!(durations.is_sorted());

        assert_eq!(durations.pick_p50(), Duration::from_millis(10_000));
        assert_eq!(durations.pick_p90(), Duration::from_millis(18_000));
        assert_eq!(durations.pick_p99(), Duration::from_millis(19_800));
        assert_eq!(durations.pick_p999(), Duration::from_millis(19_980));
        assert_eq!(durations.pick_p9999(), Duration::from_millis(19_998));
    }

    #[test]
    fn labeled_pick_keeps_label() {
        let mut labeled = millis([30, 10]).labeled("writes");
        labeled.extend(millis([20]).labeled("gets"));
        labeled.sort();

        let picked = labeled.pick(Percentile::P50);
        assert_eq!(picked.duration, Duration::from_millis(20));
        assert_eq!(picked.label, "gets");
    }

    #[test]
    fn csv_export() {
        let mut labeled = millis([1]).labeled("gets");
        labeled.append(DurationWithLabel {
            duration: Duration::from_micros(2_999),
            label: "writes".into(),
        });

        let mut out = Vec::new();
        labeled.write_csv(&mut out).unwrap();
        similar_asserts::assert_eq!(
            String::from_utf8(out).unwrap(),
            "label,duration-ms\ngets,1\nwrites,2\n"
        );
    }

    #[test]
    fn csv_export_empty_has_header() {
        let mut out = Vec::new();
        LabeledDurations::new().write_csv(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "label,duration-ms\n");
    }

    #[test]
    fn csv_file_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latency.csv");
        std::fs::write(&path, "stale contents that are longer than the export\n").unwrap();

        millis([5]).labeled("range-gets").to_csv_file(&path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "label,duration-ms\nrange-gets,5\n");
    }

    proptest! {
        #[test]
        fn percentiles_are_monotone(mut samples in prop::collection::vec(0u64..1_000_000, 1..500)) {
            samples.sort_unstable();
            let durations = millis(samples);

            let picked: Vec<_> = Percentile::ALL.iter().map(|&p| durations.pick(p)).collect();
            prop_assert!(picked.is_sorted());
            prop_assert!(durations.as_slice().contains(&picked[0]));
        }
    }
}
