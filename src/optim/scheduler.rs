//! Learning-rate schedule: linear warmup plus reduce-on-plateau.

use crate::config::ScheduleSettings;

/// Linear ramp from `start_proportion` of the nominal rate at epoch 1 to the
/// full rate at epoch `epochs`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Warmup {
    pub epochs: usize,
    pub start_proportion: f32,
}

impl Warmup {
    /// Multiplier for a 1-based epoch. `None` once warmup is over.
    pub fn factor(&self, epoch: usize) -> Option<f32> {
        if epoch == 0 || epoch > self.epochs {
            return None;
        }
        if self.epochs == 1 {
            return Some(1.0);
        }
        let progress = (epoch - 1) as f32 / (self.epochs - 1) as f32;
        Some(self.start_proportion + (1.0 - self.start_proportion) * progress)
    }
}

/// Halve (by `factor`) every rate when the monitored loss stops improving.
///
/// Improvement means `loss < best · (1 − threshold)`. After `patience`
/// consecutive non-improving calls the rates drop, floored at `min_lr`.
#[derive(Clone, Debug, PartialEq)]
pub struct ReduceOnPlateau {
    pub factor: f32,
    pub patience: usize,
    pub threshold: f32,
    pub min_lr: f32,
    /// Reductions smaller than this are ignored.
    pub eps: f32,
    best: f32,
    bad_epochs: usize,
}

impl ReduceOnPlateau {
    pub fn new(factor: f32, patience: usize, threshold: f32, min_lr: f32) -> Self {
        Self {
            factor,
            patience,
            threshold,
            min_lr,
            eps: 1e-8,
            best: f32::INFINITY,
            bad_epochs: 0,
        }
    }

    /// Observe one loss value. Returns true if `lrs` were reduced.
    pub fn step(&mut self, loss: f32, lrs: &mut [f32]) -> bool {
        if loss < self.best * (1.0 - self.threshold) {
            self.best = loss;
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }

        if self.bad_epochs < self.patience {
            return false;
        }
        self.bad_epochs = 0;

        let mut reduced = false;
        for lr in lrs.iter_mut() {
            let new_lr = (*lr * self.factor).max(self.min_lr);
            if *lr - new_lr > self.eps {
                *lr = new_lr;
                reduced = true;
            }
        }
        reduced
    }
}

/// Nominal per-group rates, adjusted by the plateau policy and scaled by the
/// warmup ramp.
#[derive(Clone, Debug)]
pub struct LearningRateSchedule {
    warmup: Warmup,
    plateau: ReduceOnPlateau,
    base: Vec<f32>,
}

impl LearningRateSchedule {
    pub fn new(settings: &ScheduleSettings, initial: Vec<f32>) -> Self {
        Self {
            warmup: Warmup {
                epochs: settings.warmup_epochs,
                start_proportion: settings.warmup_start_proportion,
            },
            plateau: ReduceOnPlateau::new(
                settings.plateau_factor,
                settings.plateau_patience,
                settings.plateau_threshold,
                settings.min_lr,
            ),
            base: initial,
        }
    }

    /// Rates to use for the update of a 1-based epoch.
    pub fn rates_for(&self, epoch: usize) -> Vec<f32> {
        let scale = self.warmup.factor(epoch).unwrap_or(1.0);
        self.base.iter().map(|lr| lr * scale).collect()
    }

    /// Feed the epoch's total loss to the plateau policy.
    pub fn observe(&mut self, epoch: usize, loss: f32) -> bool {
        let reduced = self.plateau.step(loss, &mut self.base);
        if reduced {
            tracing::info!(epoch, rates = ?self.base, "learning rates reduced on plateau");
        }
        reduced
    }

    pub fn base_rates(&self) -> &[f32] {
        &self.base
    }
}
