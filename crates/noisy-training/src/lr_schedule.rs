//! Learning rate schedules, applied at epoch boundaries.
//!
//! Supported schedules:
//! - Constant
//! - Step decay
//! - Exponential decay
//! - Cosine annealing
//! - Linear warmup followed by cosine decay
//!
//! The rate is a pure function of the epoch, so a resumed run picks up the
//! exact rate it stopped at.

use std::f64::consts::PI;

use noisy_core::{LrScheduleConfig, LrScheduleType};

/// Learning rate scheduler
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    schedule: LrScheduleConfig,
    base_lr: f64,
    total_epochs: usize,
    current_epoch: usize,
}

impl LearningRateScheduler {
    pub fn new(schedule: LrScheduleConfig, base_lr: f64, total_epochs: usize) -> Self {
        Self {
            schedule,
            base_lr,
            total_epochs,
            current_epoch: 0,
        }
    }

    /// Learning rate for `epoch`
    pub fn lr_at(&self, epoch: usize) -> f64 {
        let base = self.base_lr;
        let min_lr = self.schedule.min_lr.min(base);

        match self.schedule.schedule_type {
            LrScheduleType::Constant => base,

            LrScheduleType::Step => {
                let step_size = self.schedule.step_size.max(1);
                base * self.schedule.gamma.powi((epoch / step_size) as i32)
            }

            LrScheduleType::Exponential => base * self.schedule.gamma.powi(epoch as i32),

            LrScheduleType::Cosine => cosine(base, min_lr, epoch, self.total_epochs),

            LrScheduleType::WarmupCosine => {
                let warmup = self.schedule.warmup_epochs;
                if epoch < warmup {
                    base * (epoch + 1) as f64 / warmup as f64
                } else {
                    let decay_epochs = self.total_epochs.saturating_sub(warmup);
                    cosine(base, min_lr, epoch - warmup, decay_epochs)
                }
            }
        }
    }

    /// Current learning rate
    pub fn get_lr(&self) -> f64 {
        self.lr_at(self.current_epoch)
    }

    /// Advances one epoch (call at the end of each epoch)
    pub fn step(&mut self) {
        self.current_epoch += 1;
    }

    /// Jumps to `epoch`, e.g. after resuming from a checkpoint
    pub fn set_epoch(&mut self, epoch: usize) {
        self.current_epoch = epoch;
    }

    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }
}

fn cosine(base: f64, min_lr: f64, epoch: usize, span: usize) -> f64 {
    if span == 0 {
        return min_lr;
    }
    let progress = (epoch as f64 / span as f64).min(1.0);
    min_lr + (base - min_lr) * (1.0 + (progress * PI).cos()) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(schedule_type: LrScheduleType, total_epochs: usize) -> LearningRateScheduler {
        let schedule = LrScheduleConfig {
            schedule_type,
            step_size: 2,
            gamma: 0.5,
            min_lr: 0.0001,
            warmup_epochs: 4,
        };
        LearningRateScheduler::new(schedule, 0.001, total_epochs)
    }

    #[test]
    fn test_constant_scheduler() {
        let mut scheduler = scheduler(LrScheduleType::Constant, 10);
        assert_eq!(scheduler.get_lr(), 0.001);
        scheduler.step();
        scheduler.step();
        assert_eq!(scheduler.get_lr(), 0.001);
    }

    #[test]
    fn test_step_decay() {
        let scheduler = scheduler(LrScheduleType::Step, 10);
        assert_eq!(scheduler.lr_at(0), 0.001);
        assert_eq!(scheduler.lr_at(1), 0.001);
        assert!((scheduler.lr_at(2) - 0.0005).abs() < 1e-12);
        assert!((scheduler.lr_at(5) - 0.00025).abs() < 1e-12);
    }

    #[test]
    fn test_exponential_decay() {
        let scheduler = scheduler(LrScheduleType::Exponential, 10);
        assert!((scheduler.lr_at(1) - 0.0005).abs() < 1e-12);
        assert!((scheduler.lr_at(3) - 0.000125).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_annealing() {
        let scheduler = scheduler(LrScheduleType::Cosine, 10);
        assert_eq!(scheduler.lr_at(0), 0.001);

        let halfway = scheduler.lr_at(5);
        assert!((halfway - 0.00055).abs() < 1e-9);

        assert!((scheduler.lr_at(10) - 0.0001).abs() < 1e-12);
        assert!((scheduler.lr_at(50) - 0.0001).abs() < 1e-12);
    }

    #[test]
    fn test_warmup_then_cosine() {
        let scheduler = scheduler(LrScheduleType::WarmupCosine, 20);
        let warmup: Vec<f64> = (0..4).map(|e| scheduler.lr_at(e)).collect();
        assert!(warmup.windows(2).all(|w| w[1] > w[0]));
        assert!((warmup[3] - 0.001).abs() < 1e-12);

        assert!((scheduler.lr_at(4) - 0.001).abs() < 1e-12);
        assert!(scheduler.lr_at(10) < scheduler.lr_at(5));
        assert!((scheduler.lr_at(20) - 0.0001).abs() < 1e-12);
    }

    #[test]
    fn test_resume_matches_stepping() {
        let mut stepped = scheduler(LrScheduleType::WarmupCosine, 20);
        for _ in 0..7 {
            stepped.step();
        }
        let mut resumed = scheduler(LrScheduleType::WarmupCosine, 20);
        resumed.set_epoch(7);
        assert_eq!(stepped.get_lr(), resumed.get_lr());
        assert_eq!(resumed.current_epoch(), 7);
    }
}
