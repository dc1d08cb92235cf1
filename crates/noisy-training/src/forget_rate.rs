//! Forget-rate schedule for co-teaching.

use noisy_core::NoiseMitigationConfig;
use serde::{Deserialize, Serialize};

/// Fraction of each batch's highest-loss samples excluded from an update,
/// as a function of the epoch.
///
/// Zero during warmup, then a linear ramp over `num_gradual` epochs, then
/// constant at `forget_rate`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForgetRateSchedule {
    pub forget_rate: f64,
    pub num_gradual: usize,
    pub num_warmup: usize,
}

impl ForgetRateSchedule {
    pub fn new(forget_rate: f64, num_gradual: usize, num_warmup: usize) -> Self {
        Self {
            forget_rate: forget_rate.clamp(0.0, 1.0),
            num_gradual,
            num_warmup,
        }
    }

    /// Schedule that never forgets anything
    pub fn disabled() -> Self {
        Self::new(0.0, 0, 0)
    }

    pub fn from_config(config: &NoiseMitigationConfig) -> Self {
        Self::new(
            config.co_teaching_forget_rate,
            config.num_gradual(),
            config.num_warmup(),
        )
    }

    pub fn rate(&self, epoch: usize) -> f64 {
        if epoch < self.num_warmup {
            return 0.0;
        }
        let ramp_epoch = epoch - self.num_warmup;
        if ramp_epoch >= self.num_gradual {
            return self.forget_rate;
        }
        self.forget_rate * ramp_epoch as f64 / self.num_gradual as f64
    }

    /// Samples kept from a batch of `batch_len`: `max(1, floor(N * (1 - rate)))`.
    pub fn keep_count(&self, batch_len: usize, epoch: usize) -> usize {
        keep_count(batch_len, self.rate(epoch))
    }
}

pub fn keep_count(batch_len: usize, rate: f64) -> usize {
    let kept = (batch_len as f64 * (1.0 - rate.clamp(0.0, 1.0))).floor() as usize;
    kept.clamp(1, batch_len.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_during_warmup() {
        let schedule = ForgetRateSchedule::new(0.4, 5, 3);
        for epoch in 0..3 {
            assert_eq!(schedule.rate(epoch), 0.0);
        }
    }

    #[test]
    fn test_linear_ramp_then_constant() {
        let schedule = ForgetRateSchedule::new(0.4, 4, 2);
        assert_eq!(schedule.rate(2), 0.0);
        assert!((schedule.rate(3) - 0.1).abs() < 1e-12);
        assert!((schedule.rate(5) - 0.3).abs() < 1e-12);
        assert_eq!(schedule.rate(6), 0.4);
        assert_eq!(schedule.rate(600), 0.4);
    }

    #[test]
    fn test_no_gradual_jumps_after_warmup() {
        let schedule = ForgetRateSchedule::new(0.5, 0, 2);
        assert_eq!(schedule.rate(1), 0.0);
        assert_eq!(schedule.rate(2), 0.5);
    }

    #[test]
    fn test_monotone_and_bounded() {
        for &(rate, gradual, warmup) in &[(0.2, 10, 0), (0.8, 3, 7), (1.0, 1, 1), (0.0, 5, 5)] {
            let schedule = ForgetRateSchedule::new(rate, gradual, warmup);
            let mut previous = 0.0;
            for epoch in 0..40 {
                let r = schedule.rate(epoch);
                assert!(r >= previous, "rate decreased at epoch {epoch}");
                assert!((0.0..=rate).contains(&r));
                previous = r;
            }
        }
    }

    #[test]
    fn test_keep_count_floor_and_minimum() {
        assert_eq!(keep_count(4, 0.5), 2);
        assert_eq!(keep_count(10, 0.25), 7);
        assert_eq!(keep_count(3, 0.9), 1);
        assert_eq!(keep_count(5, 1.0), 1);
        assert_eq!(keep_count(8, 0.0), 8);
        for n in 1..50 {
            for rate in [0.0, 0.1, 0.33, 0.5, 0.99] {
                let expected = ((n as f64 * (1.0 - rate)).floor() as usize).max(1);
                assert_eq!(keep_count(n, rate), expected);
            }
        }
    }
}
