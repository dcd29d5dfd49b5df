//! Throughput tiers: (chunk size, parallelism) pairs picked from a probe.

use std::fmt;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Effective throughput above which the high tier is used (50 MB/s).
const HIGH_TIER_BYTES_PER_SEC: f64 = 50_000_000.0;

/// Effective throughput above which the medium tier is used (20 MB/s).
const MEDIUM_TIER_BYTES_PER_SEC: f64 = 20_000_000.0;

/// Chunk size and parallelism selected from measured throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// More than 50 MB/s: 50 MiB chunks, 10 in flight.
    High,
    /// 20–50 MB/s: 25 MiB chunks, 6 in flight.
    Medium,
    /// Below 20 MB/s: 10 MiB chunks, 3 in flight.
    Low,
}

impl Tier {
    /// Picks a tier for a measured throughput in bytes per second.
    #[must_use]
    pub fn from_throughput(bytes_per_sec: f64) -> Self {
        if bytes_per_sec > HIGH_TIER_BYTES_PER_SEC {
            Self::High
        } else if bytes_per_sec >= MEDIUM_TIER_BYTES_PER_SEC {
            Self::Medium
        } else {
            Self::Low
        }
    }

    /// Chunk size in bytes.
    #[must_use]
    pub fn chunk_size(self) -> u64 {
        match self {
            Self::High => 50 * MIB,
            Self::Medium => 25 * MIB,
            Self::Low => 10 * MIB,
        }
    }

    /// Maximum chunks in flight.
    #[must_use]
    pub fn parallelism(self) -> usize {
        match self {
            Self::High => 10,
            Self::Medium => 6,
            Self::Low => 3,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        write!(f, "{label}")
    }
}

/// Bytes per second for `bytes` moved in `elapsed`.
///
/// A zero elapsed time counts as infinitely fast.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn throughput(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        f64::INFINITY
    } else {
        bytes as f64 / secs
    }
}
