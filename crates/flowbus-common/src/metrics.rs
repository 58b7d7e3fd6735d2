//! Inter-poll interval metrics.
//!
//! Ring buffer of the time between consecutive successful polls of one
//! address. Used for fairness diagnostics: a well-behaved scheduler keeps
//! the mean interval at the configured period.

use std::time::Duration;

/// Poll interval statistics for one address.
#[derive(Debug)]
pub struct IntervalMetrics {
    /// Ring buffer of intervals in nanoseconds.
    samples: Box<[u64]>,
    /// Current write position in the ring buffer.
    write_pos: usize,
    /// Number of samples collected (saturates at buffer size).
    sample_count: usize,
    /// Total intervals recorded.
    total: u64,
    min_ns: u64,
    max_ns: u64,
    sum_ns: u64,
    /// Intervals exceeding period + tolerance.
    late_count: u64,
    /// Configured period plus allowed jitter, in nanoseconds.
    late_threshold_ns: u64,
}

impl IntervalMetrics {
    /// Create a collector.
    ///
    /// # Arguments
    ///
    /// * `histogram_size` - Number of samples to retain in the ring buffer.
    /// * `period` - Configured poll period.
    /// * `tolerance` - Jitter allowed on top of the period before an interval counts as late.
    #[must_use]
    pub fn new(histogram_size: usize, period: Duration, tolerance: Duration) -> Self {
        let size = histogram_size.max(1);
        Self {
            samples: vec![0u64; size].into_boxed_slice(),
            write_pos: 0,
            sample_count: 0,
            total: 0,
            min_ns: u64::MAX,
            max_ns: 0,
            sum_ns: 0,
            late_count: 0,
            late_threshold_ns: duration_ns(period + tolerance),
        }
    }

    /// Record one interval.
    pub fn record(&mut self, interval: Duration) {
        let ns = duration_ns(interval);

        self.samples[self.write_pos] = ns;
        self.write_pos = (self.write_pos + 1) % self.samples.len();
        self.sample_count = self.sample_count.saturating_add(1).min(self.samples.len());

        self.total += 1;
        self.min_ns = self.min_ns.min(ns);
        self.max_ns = self.max_ns.max(ns);
        self.sum_ns = self.sum_ns.saturating_add(ns);

        if ns > self.late_threshold_ns {
            self.late_count += 1;
        }
    }

    /// Total intervals recorded.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Intervals that exceeded period + tolerance.
    #[must_use]
    pub fn late_count(&self) -> u64 {
        self.late_count
    }

    /// Shortest interval observed.
    #[must_use]
    pub fn min(&self) -> Option<Duration> {
        (self.total > 0).then(|| Duration::from_nanos(self.min_ns))
    }

    /// Longest interval observed.
    #[must_use]
    pub fn max(&self) -> Option<Duration> {
        (self.total > 0).then(|| Duration::from_nanos(self.max_ns))
    }

    /// Mean interval over the lifetime of the collector.
    #[must_use]
    pub fn mean(&self) -> Option<Duration> {
        (self.total > 0).then(|| Duration::from_nanos(self.sum_ns / self.total))
    }

    /// Mean over the samples still held in the ring buffer.
    #[must_use]
    pub fn recent_mean(&self) -> Option<Duration> {
        if self.sample_count == 0 {
            return None;
        }
        let sum: u64 = self.samples[..self.sample_count].iter().sum();
        Some(Duration::from_nanos(sum / self.sample_count as u64))
    }

    /// Compute a percentile (0.0 to 100.0) from the ring buffer.
    #[must_use]
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        if self.sample_count == 0 || !(0.0..=100.0).contains(&percentile) {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples[..self.sample_count].to_vec();
        sorted.sort_unstable();

        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let idx = ((percentile / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(Duration::from_nanos(sorted[idx.min(sorted.len() - 1)]))
    }

    /// Get a snapshot of current metrics.
    #[must_use]
    pub fn snapshot(&self) -> IntervalSnapshot {
        IntervalSnapshot {
            total: self.total,
            min: self.min(),
            max: self.max(),
            mean: self.mean(),
            late_count: self.late_count,
        }
    }
}

/// Immutable snapshot of interval metrics for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct IntervalSnapshot {
    /// Intervals recorded.
    pub total: u64,
    /// Shortest interval.
    pub min: Option<Duration>,
    /// Longest interval.
    pub max: Option<Duration>,
    /// Mean interval.
    pub mean: Option<Duration>,
    /// Intervals exceeding period + tolerance.
    pub late_count: u64,
}

fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
