use std::sync::atomic::{AtomicI64, Ordering};

use thiserror::Error;

use super::{BucketLayout, Histogram, Snapshot};

/// Number of offsets used by the input histograms of the database.
pub const INPUT_BUCKET_COUNT: usize = 90;

/// Number of offsets used by decaying reservoirs.
pub const DECAYING_BUCKET_COUNT: usize = 165;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistogramError {
    #[error("histogram overflowed")]
    Overflowed,
}

/// Bucket upper bounds growing by a factor of 1.2, starting at 1.
pub fn bucket_offsets(size: usize) -> Vec<i64> {
    let mut offsets = Vec::with_capacity(size);
    let mut last = 1i64;
    if size > 0 {
        offsets.push(last);
    }
    for _ in 1..size {
        let mut next = (last as f64 * 1.2).round() as i64;
        if next == last {
            next += 1;
        }
        offsets.push(next);
        last = next;
    }
    offsets
}

/// Histogram with exponentially growing buckets.
///
/// `buckets` holds one more slot than `offsets`: bucket `i` counts values up to
/// `offsets[i]`, the last bucket counts values above the largest offset.
#[derive(Debug)]
pub struct EstimatedHistogram {
    offsets: Vec<i64>,
    buckets: Vec<AtomicI64>,
}

impl EstimatedHistogram {
    pub fn new(offset_count: usize) -> Self {
        let offsets = bucket_offsets(offset_count);
        let buckets = (0..=offsets.len()).map(|_| AtomicI64::new(0)).collect();
        Self { offsets, buckets }
    }

    /// Rebuilds a histogram from raw bucket counts, the last one being the overflow
    /// bucket.
    pub fn from_buckets(counts: &[i64]) -> Self {
        let offsets = bucket_offsets(counts.len().saturating_sub(1));
        let buckets = counts.iter().map(|count| AtomicI64::new(*count)).collect();
        Self { offsets, buckets }
    }

    pub fn offsets(&self) -> &[i64] {
        &self.offsets
    }

    pub fn add(&self, value: i64) {
        let index = self.offsets.partition_point(|offset| *offset < value);
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
    }

    fn counts(&self) -> Vec<i64> {
        self.buckets
            .iter()
            .map(|bucket| bucket.load(Ordering::Relaxed))
            .collect()
    }

    pub fn count(&self) -> i64 {
        self.counts().iter().sum()
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflow_count() > 0
    }

    fn overflow_count(&self) -> i64 {
        self.buckets
            .last()
            .map(|bucket| bucket.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Smallest recorded value, estimated as the lower bound of the first non empty
    /// bucket.
    pub fn min(&self) -> i64 {
        self.counts()
            .iter()
            .position(|count| *count > 0)
            .map(|index| if index == 0 { 0 } else { self.offsets[index - 1] + 1 })
            .unwrap_or(0)
    }

    /// Largest recorded value, `i64::MAX` once the overflow bucket is used.
    pub fn max(&self) -> i64 {
        if self.is_overflowed() {
            return i64::MAX;
        }
        let counts = self.counts();
        counts[..self.offsets.len()]
            .iter()
            .rposition(|count| *count > 0)
            .map(|index| self.offsets[index])
            .unwrap_or(0)
    }

    pub fn percentile(&self, percentile: f64) -> Result<i64, HistogramError> {
        if self.is_overflowed() {
            return Err(HistogramError::Overflowed);
        }
        let counts = self.counts();
        let total: i64 = counts.iter().sum();
        let pcount = (total as f64 * percentile).ceil() as i64;
        if pcount == 0 {
            return Ok(0);
        }

        let mut elements = 0;
        for (index, count) in counts[..self.offsets.len()].iter().enumerate() {
            elements += count;
            if elements >= pcount {
                return Ok(self.offsets[index]);
            }
        }
        Ok(0)
    }

    /// Ceiling of the mean, using bucket upper bounds as values.
    pub fn mean(&self) -> Result<i64, HistogramError> {
        if self.is_overflowed() {
            return Err(HistogramError::Overflowed);
        }
        let counts = self.counts();
        let mut elements = 0i128;
        let mut sum = 0i128;
        for (count, offset) in counts.iter().zip(&self.offsets) {
            elements += i128::from(*count);
            sum += i128::from(*count) * i128::from(*offset);
        }
        if elements == 0 {
            return Ok(0);
        }
        Ok((sum as f64 / elements as f64).ceil() as i64)
    }

    pub fn snapshot(&self) -> EstimatedSnapshot {
        let counts = self.counts();
        EstimatedSnapshot {
            histogram: EstimatedHistogram::from_parts(self.offsets.clone(), &counts),
        }
    }

    fn from_parts(offsets: Vec<i64>, counts: &[i64]) -> Self {
        let buckets = counts.iter().map(|count| AtomicI64::new(*count)).collect();
        Self { offsets, buckets }
    }
}

impl Histogram for EstimatedHistogram {
    fn count(&self) -> u64 {
        EstimatedHistogram::count(self).max(0) as u64
    }

    fn snapshot(&self) -> Box<dyn Snapshot> {
        Box::new(EstimatedHistogram::snapshot(self))
    }
}

/// Frozen copy of an [`EstimatedHistogram`].
#[derive(Debug)]
pub struct EstimatedSnapshot {
    histogram: EstimatedHistogram,
}

impl Snapshot for EstimatedSnapshot {
    fn value(&self, quantile: f64) -> f64 {
        self.histogram
            .percentile(quantile)
            .unwrap_or(i64::MAX) as f64
    }

    fn values(&self) -> Vec<i64> {
        let mut counts = self.histogram.counts();
        counts.truncate(self.histogram.offsets.len());
        counts
    }

    fn min(&self) -> i64 {
        self.histogram.min()
    }

    fn max(&self) -> i64 {
        self.histogram.max()
    }

    fn mean(&self) -> f64 {
        self.histogram.mean().unwrap_or(i64::MAX) as f64
    }

    fn std_dev(&self) -> f64 {
        -1.0
    }

    fn bucket_layout(&self) -> BucketLayout {
        BucketLayout::Offsets(self.histogram.offsets.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_grow_by_twenty_percent() {
        assert_eq!(
            bucket_offsets(10),
            vec![1, 2, 3, 4, 5, 6, 7, 8, 10, 12]
        );
        assert_eq!(bucket_offsets(INPUT_BUCKET_COUNT).len(), 90);
        let decaying = bucket_offsets(DECAYING_BUCKET_COUNT);
        assert!(decaying.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn statistics_from_buckets() {
        // offsets [1, 2, 3, 4], overflow bucket empty
        let histogram = EstimatedHistogram::from_buckets(&[0, 2, 0, 2, 0]);
        assert_eq!(histogram.count(), 4);
        assert_eq!(histogram.min(), 2);
        assert_eq!(histogram.max(), 4);
        assert_eq!(histogram.mean(), Ok(3));
        assert_eq!(histogram.percentile(0.5), Ok(2));
        assert_eq!(histogram.percentile(0.99), Ok(4));
    }

    #[test]
    fn empty_histogram() {
        let histogram = EstimatedHistogram::new(INPUT_BUCKET_COUNT);
        assert_eq!(histogram.count(), 0);
        assert_eq!(histogram.min(), 0);
        assert_eq!(histogram.max(), 0);
        assert_eq!(histogram.mean(), Ok(0));
        assert_eq!(histogram.percentile(0.5), Ok(0));
    }

    #[test]
    fn overflow_is_reported() {
        let histogram = EstimatedHistogram::new(4);
        histogram.add(1_000);
        assert!(histogram.is_overflowed());
        assert_eq!(histogram.max(), i64::MAX);
        assert_eq!(histogram.percentile(0.5), Err(HistogramError::Overflowed));
        assert_eq!(histogram.mean(), Err(HistogramError::Overflowed));
    }

    #[test]
    fn mean_of_large_counts_in_high_buckets() {
        let mut counts = vec![0; INPUT_BUCKET_COUNT + 1];
        counts[INPUT_BUCKET_COUNT - 1] = 1 << 50;
        let histogram = EstimatedHistogram::from_buckets(&counts);
        let largest = histogram.offsets()[INPUT_BUCKET_COUNT - 1];
        assert_eq!(histogram.mean(), Ok(largest));
    }

    #[test]
    fn add_places_values_in_upper_bound_bucket() {
        let histogram = EstimatedHistogram::new(10);
        histogram.add(9);
        histogram.add(10);
        histogram.add(1);
        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.values(), vec![1, 0, 0, 0, 0, 0, 0, 0, 2, 0]);
        assert_eq!(snapshot.max(), 10);
        assert_eq!(snapshot.min(), 0);
        assert!(matches!(snapshot.bucket_layout(), BucketLayout::Offsets(offsets) if offsets.len() == 10));
    }
}
