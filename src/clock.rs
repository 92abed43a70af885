//! Clock offset estimation from `SYNC_TIME` round trips
//!
//! The controller stamps the outbound request (`t0`), the capture node stamps
//! its receipt and reply (`t1`), and the controller stamps the inbound reply
//! (`t2`). Assuming symmetric transit delay:
//!
//! ```text
//! offset  = ((t1 - t0) + (t1 - t2)) / 2     node clock minus controller clock
//! latency = t2 - t0                          round trip
//! ```
//!
//! Samples whose round trip exceeds the latency ceiling are discarded and the
//! previous estimate is kept. Valid samples replace the estimate outright.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

/// Default round-trip ceiling for accepting a sample
pub const DEFAULT_LATENCY_CEILING: Duration = Duration::from_millis(500);

/// Current wall clock as floating-point seconds since the Unix epoch
#[must_use]
pub fn now_seconds() -> f64 {
    let now = chrono::Utc::now();
    #[allow(clippy::cast_precision_loss)]
    let micros = now.timestamp_micros() as f64;
    micros / 1_000_000.0
}

/// Reasons a `SYNC_TIME` sample is discarded
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClockSyncError {
    /// Round trip slower than the configured ceiling
    #[error("round-trip latency {latency_ms:.1} ms exceeds ceiling {ceiling_ms:.1} ms")]
    LatencyCeiling { latency_ms: f64, ceiling_ms: f64 },

    /// Reply observed before the request was sent
    #[error("negative round trip: t2 ({t2}) precedes t0 ({t0})")]
    NegativeRoundTrip { t0: f64, t2: f64 },

    /// One of the timestamps is NaN or infinite
    #[error("non-finite timestamp in exchange")]
    NonFinite,
}

/// One accepted round-trip measurement
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClockSample {
    pub t0: f64,
    pub t1: f64,
    pub t2: f64,
    /// Node clock minus controller clock, seconds
    pub offset: f64,
    /// Round-trip time, seconds
    pub latency: f64,
}

impl ClockSample {
    /// Compute offset and latency for an exchange without applying a ceiling
    ///
    /// # Errors
    ///
    /// Returns error for non-finite inputs or a negative round trip
    pub fn compute(t0: f64, t1: f64, t2: f64) -> Result<Self, ClockSyncError> {
        if !(t0.is_finite() && t1.is_finite() && t2.is_finite()) {
            return Err(ClockSyncError::NonFinite);
        }
        if t2 < t0 {
            return Err(ClockSyncError::NegativeRoundTrip { t0, t2 });
        }

        Ok(Self {
            t0,
            t1,
            t2,
            offset: ((t1 - t0) + (t1 - t2)) / 2.0,
            latency: t2 - t0,
        })
    }

    /// Half the round trip: the worst-case error of the midpoint assumption
    #[must_use]
    pub fn accuracy(&self) -> f64 {
        self.latency / 2.0
    }
}

/// Reportable synchronization quality for a node
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncQuality {
    /// No valid exchange has completed yet
    Unsynchronized,
    /// Most recent valid sample
    Synchronized {
        offset: f64,
        latency: f64,
        samples: u64,
    },
}

impl SyncQuality {
    #[must_use]
    pub const fn is_synchronized(&self) -> bool {
        matches!(self, Self::Synchronized { .. })
    }
}

impl fmt::Display for SyncQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsynchronized => f.write_str("unsynchronized"),
            Self::Synchronized { latency, .. } => {
                write!(f, "sync accuracy: \u{b1}{:.0} ms", latency / 2.0 * 1000.0)
            }
        }
    }
}

/// Per-connection offset estimator (last valid sample wins)
#[derive(Debug, Clone)]
pub struct ClockOffsetEstimator {
    ceiling: Duration,
    latest: Option<ClockSample>,
    accepted: u64,
    rejected: u64,
    last_synced: Option<Instant>,
}

impl Default for ClockOffsetEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_CEILING)
    }
}

impl ClockOffsetEstimator {
    #[must_use]
    pub const fn new(ceiling: Duration) -> Self {
        Self {
            ceiling,
            latest: None,
            accepted: 0,
            rejected: 0,
            last_synced: None,
        }
    }

    /// Feed one exchange into the estimator
    ///
    /// A rejected sample leaves the stored estimate untouched.
    ///
    /// # Errors
    ///
    /// Returns the reason the sample was discarded
    pub fn observe(&mut self, t0: f64, t1: f64, t2: f64) -> Result<ClockSample, ClockSyncError> {
        let sample = match ClockSample::compute(t0, t1, t2) {
            Ok(sample) => sample,
            Err(e) => {
                self.rejected += 1;
                return Err(e);
            }
        };

        let ceiling = self.ceiling.as_secs_f64();
        if sample.latency >= ceiling {
            self.rejected += 1;
            return Err(ClockSyncError::LatencyCeiling {
                latency_ms: sample.latency * 1000.0,
                ceiling_ms: ceiling * 1000.0,
            });
        }

        self.latest = Some(sample);
        self.accepted += 1;
        self.last_synced = Some(Instant::now());
        Ok(sample)
    }

    /// Current offset (node minus controller), `None` until a valid exchange
    #[must_use]
    pub fn offset(&self) -> Option<f64> {
        self.latest.map(|s| s.offset)
    }

    /// Round-trip latency of the sample backing the current offset
    #[must_use]
    pub fn latency(&self) -> Option<f64> {
        self.latest.map(|s| s.latency)
    }

    #[must_use]
    pub const fn latest(&self) -> Option<&ClockSample> {
        self.latest.as_ref()
    }

    #[must_use]
    pub const fn accepted_count(&self) -> u64 {
        self.accepted
    }

    #[must_use]
    pub const fn rejected_count(&self) -> u64 {
        self.rejected
    }

    #[must_use]
    pub fn quality(&self) -> SyncQuality {
        self.latest
            .map_or(SyncQuality::Unsynchronized, |s| SyncQuality::Synchronized {
                offset: s.offset,
                latency: s.latency,
                samples: self.accepted,
            })
    }

    /// Map a node-local timestamp into the controller's clock
    #[must_use]
    pub fn to_controller_time(&self, local: f64) -> Option<f64> {
        self.offset().map(|o| local - o)
    }

    /// Map a controller timestamp into the node's clock
    #[must_use]
    pub fn to_local_time(&self, controller: f64) -> Option<f64> {
        self.offset().map(|o| controller + o)
    }

    /// Whether a fresh exchange should be run
    #[must_use]
    pub fn is_resync_due(&self, now: Instant, interval: Duration) -> bool {
        self.last_synced
            .is_none_or(|at| now.saturating_duration_since(at) >= interval)
    }
}
