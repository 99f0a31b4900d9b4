//! Adaptive retransmission timing.
//!
//! A smoothed RTT (EWMA, α = 1/8) is fed from first-transmission
//! acknowledgments only, so retransmitted frames never skew the estimate.
//! The smoothed value tunes the effective base timeout downward from the
//! configured `timeout_base_ms`, never below the floor; per-slot backoff
//! doubling toward `timeout_max_ms` happens at the call site.

use portlink_core::config::RTO_FLOOR_MS;
use std::time::Duration;

const ALPHA: f64 = 0.125;
/// The effective base is this many smoothed round trips.
const SRTT_MULTIPLIER: f64 = 2.0;

#[derive(Debug)]
pub struct RttEstimator {
    srtt_ms: Option<f64>,
    base: Duration,
    max: Duration,
}

impl RttEstimator {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            srtt_ms: None,
            base,
            max,
        }
    }

    /// Fold in one round-trip sample from a first-transmission slot.
    pub fn on_sample(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;
        self.srtt_ms = Some(match self.srtt_ms {
            None => sample_ms,
            Some(srtt) => srtt + ALPHA * (sample_ms - srtt),
        });
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt_ms.map(|ms| Duration::from_secs_f64(ms / 1000.0))
    }

    pub fn srtt_ms(&self) -> f64 {
        self.srtt_ms.unwrap_or(0.0)
    }

    /// Timeout assigned to a freshly sent frame: the configured base until
    /// samples arrive, then `2 × srtt` clamped to `[floor, base]`.
    pub fn initial_rto(&self) -> Duration {
        match self.srtt_ms {
            None => self.base,
            Some(srtt) => {
                let tuned = Duration::from_secs_f64(srtt * SRTT_MULTIPLIER / 1000.0);
                // max-then-min rather than clamp: a configured base below
                // the floor must win, not panic.
                tuned.max(Duration::from_millis(RTO_FLOOR_MS)).min(self.base)
            }
        }
    }

    /// Next effective timeout for a slot that just retransmitted.
    pub fn backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}
