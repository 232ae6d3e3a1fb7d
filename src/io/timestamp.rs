// src/io/timestamp.rs
//
// Clock-domain crossing for adapter hardware timestamps.
//
// The adapter stamps frames with a millisecond counter that wraps every
// 60 seconds. Each received frame gives one sample pair (hardware time,
// host time at read). The host sample is the hardware event time plus the
// transfer delay, which varies but has a lower bound. Tracking the minimum
// observed phase (host - hardware) recovers the clock offset; the estimate
// is then hardware time + offset.

use serde::{Deserialize, Serialize};

/// SLCAN hardware timestamps wrap every 60 s
pub const TIMESTAMP_OVERFLOW_PERIOD: f64 = 60.0;

/// Estimator configuration
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimatorParams {
    /// Maximum relative rate error between adapter and host clocks (200 ppm = 200e-6)
    pub max_rate_error: f64,
    /// Period after which the hardware counter wraps to zero, in seconds
    pub source_clock_overflow_period: f64,
    /// Known minimum transfer delay from adapter to host, in seconds
    pub fixed_delay: f64,
    /// Phase error beyond which the estimator resynchronises instead of smoothing
    pub max_phase_error_to_resync: f64,
}

impl Default for EstimatorParams {
    fn default() -> Self {
        Self {
            max_rate_error: 200e-6,
            source_clock_overflow_period: TIMESTAMP_OVERFLOW_PERIOD,
            fixed_delay: 0.0002,
            max_phase_error_to_resync: 0.1,
        }
    }
}

/// Unwraps an overflowing source counter into a continuously growing time.
#[derive(Clone, Debug)]
pub struct SourceTimeResolver {
    overflow_period: f64,
    resolved: Option<f64>,
    prev_source: f64,
    prev_target: f64,
}

impl SourceTimeResolver {
    pub fn new(overflow_period: f64) -> Self {
        Self {
            overflow_period,
            resolved: None,
            prev_source: 0.0,
            prev_target: 0.0,
        }
    }

    /// Feed a (source, target) pair and get the unwrapped source time.
    pub fn update(&mut self, source: f64, target: f64) -> f64 {
        let resolved = match self.resolved {
            None => source,
            Some(resolved) => {
                let target_delta = (target - self.prev_target).max(0.0);
                let source_delta = source - self.prev_source;
                // Host elapsed time tells how many wraps happened in between
                let full_cycles = if self.overflow_period > 0.0 {
                    ((target_delta - source_delta) / self.overflow_period).round()
                } else {
                    0.0
                };
                resolved + full_cycles * self.overflow_period + source_delta
            }
        };
        self.resolved = Some(resolved);
        self.prev_source = source;
        self.prev_target = target;
        resolved
    }
}

/// Maps hardware timestamps onto one host clock.
#[derive(Clone, Debug)]
pub struct TimestampEstimator {
    params: EstimatorParams,
    resolver: SourceTimeResolver,
    min_phase: Option<f64>,
    prev_target: f64,
}

impl TimestampEstimator {
    pub fn new(params: EstimatorParams) -> Self {
        Self {
            params,
            resolver: SourceTimeResolver::new(params.source_clock_overflow_period),
            min_phase: None,
            prev_target: 0.0,
        }
    }

    /// Estimate when the event stamped `source` (adapter clock, seconds)
    /// happened on the host clock that read `target` when the frame arrived.
    pub fn update(&mut self, source: f64, target: f64) -> f64 {
        let source = self.resolver.update(source, target);
        let phase = target - source;

        let min_phase = match self.min_phase {
            None => phase,
            Some(min_phase) => {
                // Clocks drift apart by at most max_rate_error per second elapsed
                let elapsed = (target - self.prev_target).max(0.0);
                let drifted = min_phase + elapsed * self.params.max_rate_error;
                drifted.min(phase)
            }
        };
        self.prev_target = target;

        let estimate = source + min_phase - self.params.fixed_delay;
        let phase_error = target - estimate;
        if phase_error > self.params.max_phase_error_to_resync || estimate > target {
            self.min_phase = Some(phase);
            return source + phase - self.params.fixed_delay;
        }

        self.min_phase = Some(min_phase);
        estimate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn params() -> EstimatorParams {
        EstimatorParams {
            max_rate_error: 0.0,
            source_clock_overflow_period: 60.0,
            fixed_delay: 0.0,
            max_phase_error_to_resync: 0.1,
        }
    }

    #[test]
    fn test_resolver_unwraps_overflow() {
        let mut resolver = SourceTimeResolver::new(60.0);
        assert!((resolver.update(59.0, 100.0) - 59.0).abs() < EPS);
        // Counter wrapped from 59 s to 1 s while the host advanced 2 s
        assert!((resolver.update(1.0, 102.0) - 61.0).abs() < EPS);
        assert!((resolver.update(2.5, 103.5) - 62.5).abs() < EPS);
    }

    #[test]
    fn test_resolver_counts_skipped_periods() {
        let mut resolver = SourceTimeResolver::new(60.0);
        resolver.update(10.0, 0.0);
        // 130 s of host time passed: two full wraps plus 10 s
        assert!((resolver.update(20.0, 130.0) - 140.0).abs() < EPS);
    }

    #[test]
    fn test_estimator_tracks_minimum_delay() {
        let mut est = TimestampEstimator::new(params());
        // Offset is 1000 s; delays 5 ms, 2 ms, 9 ms
        let first = est.update(1.000, 1001.005);
        assert!((first - 1001.005).abs() < EPS);
        let second = est.update(2.000, 1002.002);
        assert!((second - 1002.002).abs() < EPS);
        // Larger delay is smoothed out using the 2 ms minimum
        let third = est.update(3.000, 1003.009);
        assert!((third - 1003.002).abs() < EPS);
    }

    #[test]
    fn test_estimator_subtracts_fixed_delay() {
        let mut est = TimestampEstimator::new(EstimatorParams {
            fixed_delay: 0.001,
            ..params()
        });
        let ts = est.update(5.0, 105.003);
        assert!((ts - 105.002).abs() < EPS);
    }

    #[test]
    fn test_estimator_resyncs_on_large_phase_error() {
        let mut est = TimestampEstimator::new(params());
        est.update(1.0, 101.0);
        // The host clock jumped by 5 s: beyond max_phase_error_to_resync
        let ts = est.update(2.0, 107.0);
        assert!((ts - 107.0).abs() < EPS);
        // Later samples follow the new offset
        let ts = est.update(3.0, 108.0);
        assert!((ts - 108.0).abs() < EPS);
    }

    #[test]
    fn test_estimator_instances_are_independent() {
        let mut mono = TimestampEstimator::new(EstimatorParams::default());
        let mut real = mono.clone();
        let a = mono.update(1.0, 10.0);
        let b = real.update(1.0, 1_700_000_000.0);
        assert!(a < 11.0);
        assert!(b > 1_699_999_999.0);
    }
}
