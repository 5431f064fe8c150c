//! First-order update rules with per-group state.
//!
//! Each `ParamGroup` owns one learning rate, one pair of moment decay rates
//! and the per-element state of its rule. Groups are stepped independently,
//! so optic axes and birefringence can move at different speeds.

use crate::error::ConfigError;
use nalgebra::SVector;
use std::str::FromStr;

/// Names accepted in the `optimizer` option.
pub const SUPPORTED_OPTIMIZERS: &[&str] = &[
    "Adam", "SGD", "Adagrad", "ASGD", "Nadam", "Adamax", "AdamW", "RMSprop",
];

const NADAM_MOMENTUM_DECAY: f32 = 4e-3;
const ADAMW_WEIGHT_DECAY: f32 = 1e-2;
const RMSPROP_ALPHA: f32 = 0.99;
const SGD_MOMENTUM: f32 = 0.7;
const ADAGRAD_EPS: f32 = 1e-10;
const ASGD_LAMBDA: f32 = 1e-4;
const ASGD_ALPHA: f32 = 0.75;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateRule {
    Adam,
    AdamW,
    NAdam,
    Adamax,
    Adagrad,
    RmsProp,
    /// Nesterov momentum gradient descent.
    Sgd,
    /// Averaged SGD with decaying step size.
    Asgd,
}

impl FromStr for UpdateRule {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Adam" => UpdateRule::Adam,
            "AdamW" => UpdateRule::AdamW,
            "Nadam" | "NAdam" => UpdateRule::NAdam,
            "Adamax" => UpdateRule::Adamax,
            "Adagrad" => UpdateRule::Adagrad,
            "RMSprop" => UpdateRule::RmsProp,
            "SGD" => UpdateRule::Sgd,
            "ASGD" => UpdateRule::Asgd,
            "LBFGS" => return Err(ConfigError::LbfgsRequiresClosure),
            other => {
                return Err(ConfigError::UnsupportedOptimizer {
                    name: other.to_string(),
                    supported: SUPPORTED_OPTIMIZERS,
                })
            }
        })
    }
}

impl UpdateRule {
    /// Rules that use bias-corrected moment estimates.
    fn is_adam_family(self) -> bool {
        matches!(
            self,
            UpdateRule::Adam | UpdateRule::AdamW | UpdateRule::NAdam | UpdateRule::Adamax
        )
    }
}

/// Step-wide constants shared by every element of one update.
struct StepCoeffs {
    bias1: f32,
    bias2: f32,
    /// NAdam: weights of the gradient and momentum terms.
    nadam_grad: f32,
    nadam_momentum: f32,
    /// ASGD step size at this step.
    asgd_eta: f32,
}

#[derive(Clone, Debug)]
pub struct ParamGroup {
    pub name: String,
    pub lr: f32,
    pub betas: (f32, f32),
    pub eps: f32,
    rule: UpdateRule,
    t: u32,
    m: Vec<f32>,
    v: Vec<f32>,
    /// NAdam running product of momentum coefficients.
    mu_product: f32,
}

impl ParamGroup {
    pub fn new(name: impl Into<String>, rule: UpdateRule, lr: f32, betas: (f32, f32)) -> Self {
        Self {
            name: name.into(),
            lr,
            betas,
            eps: 1e-8,
            rule,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
            mu_product: 1.0,
        }
    }

    fn ensure_len(&mut self, len: usize) {
        if self.m.len() != len {
            self.m.resize(len, 0.0);
            self.v.resize(len, 0.0);
        }
    }

    /// Effective step size after bias correction, as reported per epoch.
    pub fn adjusted_lr(&self) -> f32 {
        if !self.rule.is_adam_family() || self.t == 0 {
            return self.lr;
        }
        let t = self.t as f32;
        let (b1, b2) = self.betas;
        let bias1 = 1.0 - b1.powf(t);
        match self.rule {
            UpdateRule::Adamax => self.lr / bias1,
            _ => self.lr * (1.0 - b2.powf(t)).sqrt() / bias1,
        }
    }

    fn begin_step(&mut self, len: usize) -> StepCoeffs {
        self.ensure_len(len);
        self.t += 1;
        let t = self.t as f32;
        let (b1, b2) = self.betas;

        let mut coeffs = StepCoeffs {
            bias1: 1.0 - b1.powf(t),
            bias2: 1.0 - b2.powf(t),
            nadam_grad: 0.0,
            nadam_momentum: 0.0,
            asgd_eta: self.lr,
        };
        match self.rule {
            UpdateRule::NAdam => {
                let mu = b1 * (1.0 - 0.5 * 0.96f32.powf(t * NADAM_MOMENTUM_DECAY));
                let mu_next = b1 * (1.0 - 0.5 * 0.96f32.powf((t + 1.0) * NADAM_MOMENTUM_DECAY));
                self.mu_product *= mu;
                coeffs.nadam_grad = (1.0 - mu) / (1.0 - self.mu_product);
                coeffs.nadam_momentum = mu_next / (1.0 - self.mu_product * mu_next);
            }
            UpdateRule::Asgd => {
                coeffs.asgd_eta =
                    self.lr / (1.0 + ASGD_LAMBDA * self.lr * (t - 1.0)).powf(ASGD_ALPHA);
            }
            _ => {}
        }
        coeffs
    }

    #[inline]
    fn update(&mut self, c: &StepCoeffs, i: usize, p: &mut f32, g: f32) {
        let (b1, b2) = self.betas;
        let lr = self.lr;
        let eps = self.eps;
        let m = &mut self.m[i];
        let v = &mut self.v[i];
        match self.rule {
            UpdateRule::Adam | UpdateRule::AdamW => {
                if self.rule == UpdateRule::AdamW {
                    *p *= 1.0 - lr * ADAMW_WEIGHT_DECAY;
                }
                *m = *m * b1 + g * (1.0 - b1);
                *v = *v * b2 + g * g * (1.0 - b2);
                let m_hat = *m / c.bias1;
                let v_hat = *v / c.bias2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            }
            UpdateRule::NAdam => {
                *m = *m * b1 + g * (1.0 - b1);
                *v = *v * b2 + g * g * (1.0 - b2);
                let denom = (*v / c.bias2).sqrt() + eps;
                *p -= lr * (c.nadam_grad * g + c.nadam_momentum * *m) / denom;
            }
            UpdateRule::Adamax => {
                *m = *m * b1 + g * (1.0 - b1);
                *v = (*v * b2).max(g.abs() + eps);
                *p -= lr / c.bias1 * *m / *v;
            }
            UpdateRule::Adagrad => {
                *v += g * g;
                *p -= lr * g / (v.sqrt() + ADAGRAD_EPS);
            }
            UpdateRule::RmsProp => {
                *v = RMSPROP_ALPHA * *v + (1.0 - RMSPROP_ALPHA) * g * g;
                *p -= lr * g / (v.sqrt() + eps);
            }
            UpdateRule::Sgd => {
                *m = if self.t == 1 { g } else { SGD_MOMENTUM * *m + g };
                *p -= lr * (g + SGD_MOMENTUM * *m);
            }
            UpdateRule::Asgd => {
                *p *= 1.0 - ASGD_LAMBDA * c.asgd_eta;
                *p -= c.asgd_eta * g;
            }
        }
    }

    fn step_pairs<'a, I>(&mut self, len: usize, pairs: I)
    where
        I: Iterator<Item = (&'a mut f32, f32)>,
    {
        let coeffs = self.begin_step(len);
        for (i, (p, g)) in pairs.enumerate() {
            self.update(&coeffs, i, p, g);
        }
    }

    pub fn step(&mut self, params: &mut [f32], grads: &[f32]) {
        assert_eq!(params.len(), grads.len());
        let len = params.len();
        self.step_pairs(len, params.iter_mut().zip(grads.iter().copied()));
    }

    pub fn step_vectors<const D: usize>(
        &mut self,
        params: &mut [SVector<f32, D>],
        grads: &[SVector<f32, D>],
    ) {
        assert_eq!(params.len(), grads.len());
        let len = params.len() * D;
        self.step_pairs(
            len,
            params
                .iter_mut()
                .zip(grads)
                .flat_map(|(p, g)| p.iter_mut().zip(g.iter().copied())),
        );
    }

    /// One step over several tensors that share this group's state.
    pub fn step_segments(&mut self, segments: Vec<(&mut [f32], &[f32])>) {
        for (p, g) in &segments {
            assert_eq!(p.len(), g.len());
        }
        let len = segments.iter().map(|(p, _)| p.len()).sum();
        self.step_pairs(
            len,
            segments
                .into_iter()
                .flat_map(|(p, g)| p.iter_mut().zip(g.iter().copied())),
        );
    }
}
