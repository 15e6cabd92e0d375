//! Learning-rate schedules: linear warmup, per-stage decay, cosine annealing
//!
//! Three sub-policies compose over a run. Warmup and cosine annealing apply
//! only to the LARS pretraining path; stage decay applies between supervised
//! fine-tuning stages. The orchestrator pushes the computed rate onto the
//! optimizer — schedules themselves never touch parameters.

use crate::config::RunConfig;
use crate::error::Result;

/// Rate schedule stepped once per epoch
pub trait Scheduler: Send {
    /// Scheduler name
    fn name(&self) -> &str;

    /// Advance one epoch
    fn step(&mut self);

    /// Current learning rate
    fn get_lr(&self) -> f64;

    /// Reset to the initial state
    fn reset(&mut self);
}

/// Linear warmup over the first `warmup_epochs` epochs.
///
/// `lr(epoch) = (epoch + 1) * initial_lr / warmup_epochs` for epochs inside
/// the warmup window, snapping exactly to `initial_lr` at
/// `epoch == warmup_epochs`. With `warmup_epochs == 0` the policy is a no-op.
#[derive(Debug, Clone, Copy)]
pub struct WarmupPolicy {
    initial_lr: f64,
    warmup_epochs: usize,
}

impl WarmupPolicy {
    /// Create a warmup policy toward `initial_lr`
    pub fn new(initial_lr: f64, warmup_epochs: usize) -> Self {
        Self {
            initial_lr,
            warmup_epochs,
        }
    }

    /// Rate override for `epoch`, or `None` once warmup no longer applies
    pub fn lr_for_epoch(&self, epoch: usize) -> Option<f64> {
        if self.warmup_epochs == 0 {
            return None;
        }
        if epoch < self.warmup_epochs {
            Some((epoch + 1) as f64 * self.initial_lr / self.warmup_epochs as f64)
        } else if epoch == self.warmup_epochs {
            Some(self.initial_lr)
        } else {
            None
        }
    }

    /// Whether warmup has completed by `epoch`
    pub fn is_done(&self, epoch: usize) -> bool {
        epoch >= self.warmup_epochs
    }
}

/// Learning rate for fine-tuning stage `i`: `base_lr * decay_factor^i`
pub fn stage_lr(base_lr: f64, decay_factor: f64, stage: usize) -> f64 {
    base_lr * decay_factor.powi(stage as i32)
}

/// Cosine decay toward (but never reaching) `eta_min` over the epoch budget
pub struct CosineAnnealingScheduler {
    base_lr: f64,
    eta_min: f64,
    total_epochs: usize,
    current_epoch: usize,
    current_lr: f64,
}

impl CosineAnnealingScheduler {
    /// Create a cosine schedule over `total_epochs` epochs
    pub fn new(base_lr: f64, eta_min: f64, total_epochs: usize) -> Self {
        Self {
            base_lr,
            eta_min,
            total_epochs: total_epochs.max(1),
            current_epoch: 0,
            current_lr: base_lr,
        }
    }

    fn calculate_lr(&self) -> f64 {
        let progress = (self.current_epoch as f64 / self.total_epochs as f64).min(1.0);
        let cosine = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
        self.eta_min + (self.base_lr - self.eta_min) * cosine
    }
}

impl Scheduler for CosineAnnealingScheduler {
    fn name(&self) -> &str {
        "cosine_annealing"
    }

    fn step(&mut self) {
        self.current_epoch += 1;
        self.current_lr = self.calculate_lr();
    }

    fn get_lr(&self) -> f64 {
        self.current_lr
    }

    fn reset(&mut self) {
        self.current_epoch = 0;
        self.current_lr = self.base_lr;
    }
}

/// Annealing schedule for the configured optimizer; only the LARS path decays
pub fn build_scheduler(config: &RunConfig, initial_lr: f64) -> Result<Option<Box<dyn Scheduler>>> {
    match config.optimizer.as_str() {
        "lars" => Ok(Some(Box::new(CosineAnnealingScheduler::new(
            initial_lr,
            0.0,
            config.epochs,
        )))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_warmup_is_strictly_increasing_and_exact() {
        let warmup = WarmupPolicy::new(0.3, 10);
        let mut previous = 0.0;
        for epoch in 0..10 {
            let lr = warmup.lr_for_epoch(epoch).unwrap();
            assert_abs_diff_eq!(lr, (epoch + 1) as f64 * 0.3 / 10.0, epsilon = 1e-12);
            assert!(lr > previous);
            previous = lr;
        }
        assert_abs_diff_eq!(warmup.lr_for_epoch(10).unwrap(), 0.3, epsilon = 0.0);
        assert!(warmup.lr_for_epoch(11).is_none());
    }

    #[test]
    fn test_zero_warmup_is_noop() {
        let warmup = WarmupPolicy::new(0.3, 0);
        assert!(warmup.lr_for_epoch(0).is_none());
        assert!(warmup.is_done(0));
    }

    #[test]
    fn test_stage_decay_powers() {
        assert_abs_diff_eq!(stage_lr(0.1, 0.5, 0), 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(stage_lr(0.1, 0.5, 1), 0.05, epsilon = 1e-12);
        assert_abs_diff_eq!(stage_lr(0.1, 0.5, 2), 0.025, epsilon = 1e-12);
    }

    #[test]
    fn test_cosine_decays_toward_minimum_without_reaching_it_early() {
        let mut scheduler = CosineAnnealingScheduler::new(1.0, 0.0, 100);
        assert_abs_diff_eq!(scheduler.get_lr(), 1.0, epsilon = 0.0);

        let mut previous = scheduler.get_lr();
        for _ in 0..99 {
            scheduler.step();
            let lr = scheduler.get_lr();
            assert!(lr < previous);
            assert!(lr > 0.0);
            previous = lr;
        }
        scheduler.step();
        assert_abs_diff_eq!(scheduler.get_lr(), 0.0, epsilon = 1e-12);

        scheduler.reset();
        assert_abs_diff_eq!(scheduler.get_lr(), 1.0, epsilon = 0.0);
    }

    #[test]
    fn test_scheduler_only_built_for_lars() {
        let mut config = RunConfig::default();
        assert!(build_scheduler(&config, 0.1).unwrap().is_none());
        config.optimizer = "lars".to_string();
        assert!(build_scheduler(&config, 0.1).unwrap().is_some());
    }
}
