//! Observable download progress.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::tier::throughput;

/// Snapshot delivered after every chunk write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    /// Bytes written to the destination so far.
    pub bytes_written: u64,
    /// Total size of the resource.
    pub total_bytes: u64,
    /// Throughput of the most recent chunk, in bytes per second.
    pub instant_bytes_per_sec: f64,
    /// Throughput since the first chunk request, in bytes per second.
    pub average_bytes_per_sec: f64,
}

impl TransferProgress {
    /// Completed fraction in `[0.0, 1.0]`; an empty resource is complete.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            1.0
        } else {
            self.bytes_written as f64 / self.total_bytes as f64
        }
    }
}

/// Callback invoked with each progress snapshot.
pub type ProgressCallback = Arc<dyn Fn(&TransferProgress) + Send + Sync>;

/// Tracks timings needed to compute throughput figures.
#[derive(Debug)]
pub(crate) struct ProgressMeter {
    started: Instant,
    last: Instant,
    last_bytes: u64,
}

impl ProgressMeter {
    pub(crate) fn start() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last: now,
            last_bytes: 0,
        }
    }

    /// Records that the total written count has reached `bytes_written`.
    pub(crate) fn sample(&mut self, bytes_written: u64, total_bytes: u64) -> TransferProgress {
        let now = Instant::now();
        let delta = bytes_written.saturating_sub(self.last_bytes);
        let instant = throughput(delta, now.duration_since(self.last));
        let average = throughput(bytes_written, now.duration_since(self.started));
        self.last = now;
        self.last_bytes = bytes_written;
        TransferProgress {
            bytes_written,
            total_bytes,
            instant_bytes_per_sec: finite(instant),
            average_bytes_per_sec: finite(average),
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

fn finite(rate: f64) -> f64 {
    if rate.is_finite() { rate } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fraction() {
        let progress = TransferProgress {
            bytes_written: 25,
            total_bytes: 100,
            instant_bytes_per_sec: 0.0,
            average_bytes_per_sec: 0.0,
        };
        assert!((progress.fraction() - 0.25).abs() < f64::EPSILON);

        let empty = TransferProgress {
            total_bytes: 0,
            bytes_written: 0,
            ..progress
        };
        assert!((empty.fraction() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_meter_reports_monotonic_counts() {
        let mut meter = ProgressMeter::start();
        let first = meter.sample(10, 30);
        let second = meter.sample(30, 30);
        assert_eq!(first.bytes_written, 10);
        assert_eq!(second.bytes_written, 30);
        assert!(second.average_bytes_per_sec >= 0.0);
        assert!(second.instant_bytes_per_sec.is_finite());
    }
}
