//! Regularizers over the active parameters.
//!
//! Every regularizer returns a scalar and, on request, adds its gradient
//! (scaled by the caller's weight) into a `VolumeGrads` indexed by active
//! position.

use crate::core::ActiveParameterSet;
use crate::diff::VolumeGrads;
use crate::error::ConfigError;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Regularizer {
    /// Mean |Δn|.
    L1Birefringence,
    /// Mean Δn².
    L2Birefringence,
    /// Mean max(−Δn, 0).
    NegativePenalty,
    /// Mean max(Δn, 0).
    PositivePenalty,
    /// Mean |Δn_i − Δn_j| over adjacent active voxels.
    TotalVariation,
    /// Mean 1 − (a_i · a_j)² over adjacent active voxels.
    CosineSimilarityNeighbors,
}

impl FromStr for Regularizer {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "l1_bir_active" => Regularizer::L1Birefringence,
            "l2_bir_active" => Regularizer::L2Birefringence,
            "neg_penalty_bir_active" => Regularizer::NegativePenalty,
            "pos_penalty_bir_active" => Regularizer::PositivePenalty,
            "total_variation_bir_active" => Regularizer::TotalVariation,
            "cosine_similarity_neighbors" => Regularizer::CosineSimilarityNeighbors,
            other => return Err(ConfigError::UnknownRegularizer(other.to_string())),
        })
    }
}

/// Pairs of active positions whose voxels are adjacent along z, y or x.
pub fn adjacent_active_pairs(params: &ActiveParameterSet) -> Vec<(usize, usize)> {
    let shape = params.shape();
    let mut pairs = Vec::new();
    for (pos, &voxel) in params.indices().iter().enumerate() {
        for neighbor in shape.forward_neighbors(voxel) {
            if let Some(other) = params.active_position(neighbor) {
                pairs.push((pos, other));
            }
        }
    }
    pairs
}

impl Regularizer {
    pub fn name(&self) -> &'static str {
        match self {
            Regularizer::L1Birefringence => "l1_bir_active",
            Regularizer::L2Birefringence => "l2_bir_active",
            Regularizer::NegativePenalty => "neg_penalty_bir_active",
            Regularizer::PositivePenalty => "pos_penalty_bir_active",
            Regularizer::TotalVariation => "total_variation_bir_active",
            Regularizer::CosineSimilarityNeighbors => "cosine_similarity_neighbors",
        }
    }

    pub fn value(&self, params: &ActiveParameterSet) -> f32 {
        self.evaluate(params, None)
    }

    /// Value, plus `scale · ∂value/∂params` added into `grads`.
    pub fn value_and_grad(&self, params: &ActiveParameterSet, scale: f32, grads: &mut VolumeGrads) -> f32 {
        self.evaluate(params, Some((grads, scale)))
    }

    fn evaluate(&self, params: &ActiveParameterSet, mut grad: Option<(&mut VolumeGrads, f32)>) -> f32 {
        let dn = &params.birefringence;
        let n = dn.len();
        if n == 0 {
            return 0.0;
        }
        let inv_n = 1.0 / n as f32;

        match self {
            Regularizer::L1Birefringence
            | Regularizer::L2Birefringence
            | Regularizer::NegativePenalty
            | Regularizer::PositivePenalty => {
                let mut total = 0.0;
                for (i, &x) in dn.iter().enumerate() {
                    let (f, df) = match self {
                        Regularizer::L1Birefringence => (x.abs(), signum0(x)),
                        Regularizer::L2Birefringence => (x * x, 2.0 * x),
                        Regularizer::NegativePenalty if x < 0.0 => (-x, -1.0),
                        Regularizer::PositivePenalty if x > 0.0 => (x, 1.0),
                        _ => (0.0, 0.0),
                    };
                    total += f;
                    if let Some((g, s)) = grad.as_mut() {
                        g.birefringence[i] += *s * df * inv_n;
                    }
                }
                total * inv_n
            }
            Regularizer::TotalVariation => {
                let pairs = adjacent_active_pairs(params);
                if pairs.is_empty() {
                    return 0.0;
                }
                let inv_p = 1.0 / pairs.len() as f32;
                let mut total = 0.0;
                for &(i, j) in &pairs {
                    let d = dn[i] - dn[j];
                    total += d.abs();
                    if let Some((g, s)) = grad.as_mut() {
                        let gd = *s * signum0(d) * inv_p;
                        g.birefringence[i] += gd;
                        g.birefringence[j] -= gd;
                    }
                }
                total * inv_p
            }
            Regularizer::CosineSimilarityNeighbors => {
                let axes = &params.optic_axis;
                let pairs = adjacent_active_pairs(params);
                if pairs.is_empty() {
                    return 0.0;
                }
                let inv_p = 1.0 / pairs.len() as f32;
                let mut total = 0.0;
                for &(i, j) in &pairs {
                    let c = axes[i].dot(&axes[j]);
                    total += 1.0 - c * c;
                    if let Some((g, s)) = grad.as_mut() {
                        let k = -2.0 * c * *s * inv_p;
                        g.optic_axis[i] += axes[j] * k;
                        g.optic_axis[j] += axes[i] * k;
                    }
                }
                total * inv_p
            }
        }
    }
}

#[inline]
fn signum0(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}
