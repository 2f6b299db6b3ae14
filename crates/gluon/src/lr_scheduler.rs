// LR schedulers — Learning rate as a function of the update count
//
// The optimizer counts the updates applied to each parameter index and
// hands the largest count, `num_update`, to its scheduler before every
// update:
//
//   FactorScheduler(step, factor)
//     lr *= factor once per `step` updates, never below stop_factor_lr
//
//   MultiFactorScheduler([s0, s1, ...], factor)
//     lr *= factor once num_update passes each s_i
//
// Schedulers only lower the rate and only move forward: asking again for an
// earlier num_update returns the current rate.

use std::fmt;

use tracing::debug;

use gluon_core::{Error, Result};

/// A learning-rate schedule driven by the optimizer's update count.
pub trait LrScheduler: Send + fmt::Debug {
    /// The rate to use once some parameter has been updated `num_update`
    /// times.
    fn lr(&mut self, num_update: usize) -> f64;

    /// The current rate, without advancing the schedule.
    fn base_lr(&self) -> f64;

    /// Restart the schedule from `base_lr`. Optimizers call this with their
    /// configured learning rate when the scheduler is attached.
    fn set_base_lr(&mut self, base_lr: f64);
}

fn check_factor(factor: f64) -> Result<()> {
    if !(factor > 0.0 && factor <= 1.0) {
        return Err(Error::InvalidArgument(format!(
            "schedule factor must be in (0, 1] so the rate decreases, got {factor}"
        )));
    }
    Ok(())
}

/// Multiply the rate by `factor` every `step` updates.
#[derive(Debug, Clone, PartialEq)]
pub struct FactorScheduler {
    base_lr: f64,
    step: usize,
    factor: f64,
    stop_factor_lr: f64,
    count: usize,
}

impl FactorScheduler {
    pub fn new(step: usize, factor: f64) -> Result<Self> {
        if step < 1 {
            return Err(Error::InvalidArgument(
                "schedule step must be at least 1 update".to_string(),
            ));
        }
        check_factor(factor)?;
        Ok(FactorScheduler {
            base_lr: 0.01,
            step,
            factor,
            stop_factor_lr: 1e-8,
            count: 0,
        })
    }

    /// The rate never drops below this floor. Defaults to 1e-8.
    pub fn with_stop_factor_lr(mut self, stop_factor_lr: f64) -> Self {
        self.stop_factor_lr = stop_factor_lr;
        self
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Update count at which the rate last changed.
    pub fn count(&self) -> usize {
        self.count
    }
}

impl LrScheduler for FactorScheduler {
    fn lr(&mut self, num_update: usize) -> f64 {
        while num_update > self.count + self.step {
            self.count += self.step;
            self.base_lr *= self.factor;
            if self.base_lr < self.stop_factor_lr {
                self.base_lr = self.stop_factor_lr;
                debug!(num_update, lr = self.base_lr, "learning rate reached its floor");
            } else {
                debug!(num_update, lr = self.base_lr, "learning rate reduced");
            }
        }
        self.base_lr
    }

    fn base_lr(&self) -> f64 {
        self.base_lr
    }

    fn set_base_lr(&mut self, base_lr: f64) {
        self.base_lr = base_lr;
        self.count = 0;
    }
}

/// Multiply the rate by `factor` at each of an increasing list of update
/// counts.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiFactorScheduler {
    base_lr: f64,
    steps: Vec<usize>,
    factor: f64,
    cur_step: usize,
    count: usize,
}

impl MultiFactorScheduler {
    pub fn new(steps: Vec<usize>, factor: f64) -> Result<Self> {
        if steps.is_empty() {
            return Err(Error::InvalidArgument(
                "schedule steps must not be empty".to_string(),
            ));
        }
        if steps.iter().any(|&s| s < 1) {
            return Err(Error::InvalidArgument(format!(
                "schedule steps must be at least 1 update, got {steps:?}"
            )));
        }
        if steps.windows(2).any(|w| w[1] <= w[0]) {
            return Err(Error::InvalidArgument(format!(
                "schedule steps must be strictly increasing, got {steps:?}"
            )));
        }
        check_factor(factor)?;
        Ok(MultiFactorScheduler {
            base_lr: 0.01,
            steps,
            factor,
            cur_step: 0,
            count: 0,
        })
    }

    pub fn steps(&self) -> &[usize] {
        &self.steps
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// How many of the steps have been passed.
    pub fn passed(&self) -> usize {
        self.cur_step
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl LrScheduler for MultiFactorScheduler {
    fn lr(&mut self, num_update: usize) -> f64 {
        while let Some(&step) = self.steps.get(self.cur_step) {
            if num_update <= step {
                break;
            }
            self.count = step;
            self.cur_step += 1;
            self.base_lr *= self.factor;
            debug!(num_update, lr = self.base_lr, "learning rate reduced");
        }
        self.base_lr
    }

    fn base_lr(&self) -> f64 {
        self.base_lr
    }

    fn set_base_lr(&mut self, base_lr: f64) {
        self.base_lr = base_lr;
        self.cur_step = 0;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_factor_schedule() {
        let mut sched = FactorScheduler::new(2, 0.5).unwrap();
        sched.set_base_lr(1.0);
        assert_relative_eq!(sched.lr(1), 1.0);
        assert_relative_eq!(sched.lr(2), 1.0);
        assert_relative_eq!(sched.lr(3), 0.5);
        assert_relative_eq!(sched.lr(4), 0.5);
        assert_eq!(sched.count(), 2);
        // Several steps at once.
        assert_relative_eq!(sched.lr(9), 0.0625);
        assert_eq!(sched.count(), 8);
        // Never backwards.
        assert_relative_eq!(sched.lr(1), 0.0625);
    }

    #[test]
    fn test_factor_floor() {
        let mut sched = FactorScheduler::new(1, 0.1).unwrap().with_stop_factor_lr(0.05);
        sched.set_base_lr(1.0);
        assert_relative_eq!(sched.lr(5), 0.05);
    }

    #[test]
    fn test_multi_factor_schedule() {
        let mut sched = MultiFactorScheduler::new(vec![2, 5], 0.1).unwrap();
        sched.set_base_lr(1.0);
        assert_relative_eq!(sched.lr(2), 1.0);
        assert_relative_eq!(sched.lr(3), 0.1, epsilon = 1e-12);
        assert_relative_eq!(sched.lr(5), 0.1, epsilon = 1e-12);
        assert_relative_eq!(sched.lr(100), 0.01, epsilon = 1e-12);
        assert_eq!(sched.passed(), 2);
        assert_eq!(sched.count(), 5);
    }

    #[test]
    fn test_invalid_schedules_rejected() {
        assert!(FactorScheduler::new(0, 0.5).is_err());
        assert!(FactorScheduler::new(1, 1.5).is_err());
        assert!(MultiFactorScheduler::new(vec![], 0.5).is_err());
        assert!(MultiFactorScheduler::new(vec![3, 3], 0.5).is_err());
        assert!(MultiFactorScheduler::new(vec![0, 3], 0.5).is_err());
        assert!(matches!(
            MultiFactorScheduler::new(vec![1, 2], 2.0),
            Err(Error::InvalidArgument(_))
        ));
    }
}
