//! Data fidelity and the composite reconstruction loss.

use crate::config::ReconstructionSettings;
use crate::core::ActiveParameterSet;
use crate::diff::retardance_grad::{vector_components, vector_components_grad};
use crate::diff::VolumeGrads;
use crate::error::{ConfigError, ReconstructionError, Result};
use crate::optim::regularization::Regularizer;
use crate::render::{ImageSet, OutputMode};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataFidelity {
    /// MSE on `(ret·cos 2θ, ret·sin 2θ)`.
    Vector,
    /// MSE on analyzer intensity frames.
    Intensity,
}

impl FromStr for DataFidelity {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == "vector" {
            Ok(DataFidelity::Vector)
        } else if s.starts_with("intensity") {
            Ok(DataFidelity::Intensity)
        } else {
            Err(ConfigError::UnknownDataFidelity(s.to_string()))
        }
    }
}

impl DataFidelity {
    pub fn output_mode(self) -> OutputMode {
        match self {
            DataFidelity::Vector => OutputMode::RetardanceAzimuth,
            DataFidelity::Intensity => OutputMode::IntensityStack,
        }
    }
}

/// Measured images in flat row-major order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasuredImages {
    /// `(height, width)`.
    pub image_shape: (usize, usize),
    pub retardance: Vec<f32>,
    /// Radians in `[0, π)`.
    pub azimuth: Vec<f32>,
    /// One frame per analyzer angle, when intensities were measured.
    pub intensity: Option<Vec<Vec<f32>>>,
}

impl MeasuredImages {
    pub fn max_retardance(&self) -> f32 {
        self.retardance.iter().copied().fold(0.0, f32::max)
    }

    pub fn from_images(images: ImageSet, image_shape: (usize, usize)) -> Self {
        let n = image_shape.0 * image_shape.1;
        match images {
            ImageSet::RetardanceAzimuth { retardance, azimuth } => Self {
                image_shape,
                retardance,
                azimuth,
                intensity: None,
            },
            ImageSet::Intensity(frames) => Self {
                image_shape,
                retardance: vec![0.0; n],
                azimuth: vec![0.0; n],
                intensity: Some(frames),
            },
        }
    }
}

/// One evaluation of the loss.
#[derive(Clone, Debug, PartialEq)]
pub struct LossBreakdown {
    pub total: f32,
    pub data_term: f32,
    /// Unweighted `Σ wᵢ·fᵢ`; the total adds it times the regularization weight.
    pub reg_term: f32,
    /// `fᵢ` per configured regularizer, in configuration order.
    pub reg_values: Vec<f32>,
}

/// Vector-form MSE, returning (loss, d_ret_pred, d_azim_pred).
///
/// Both retardance images are multiplied by `scale` first.
pub fn vector_loss_and_grad(
    pred_ret: &[f32],
    pred_azim: &[f32],
    meas_ret: &[f32],
    meas_azim: &[f32],
    scale: f32,
) -> (f32, Vec<f32>, Vec<f32>) {
    assert_eq!(pred_ret.len(), meas_ret.len());
    assert_eq!(pred_azim.len(), meas_azim.len());
    let n = pred_ret.len().max(1) as f32;
    let mut loss_cos = 0.0f32;
    let mut loss_sin = 0.0f32;
    let mut d_ret = vec![0.0f32; pred_ret.len()];
    let mut d_azim = vec![0.0f32; pred_azim.len()];

    for i in 0..pred_ret.len() {
        let (cp, sp) = vector_components(scale * pred_ret[i], pred_azim[i]);
        let (cm, sm) = vector_components(scale * meas_ret[i], meas_azim[i]);
        let (dc, ds) = (cp - cm, sp - sm);
        loss_cos += dc * dc;
        loss_sin += ds * ds;

        let (gr, ga) =
            vector_components_grad(scale * pred_ret[i], pred_azim[i], 2.0 * dc / n, 2.0 * ds / n);
        d_ret[i] = gr * scale;
        d_azim[i] = ga;
    }

    ((loss_cos + loss_sin) / n, d_ret, d_azim)
}

/// Sum over frames of per-frame MSE, returning (loss, d_frames).
pub fn intensity_loss_and_grad(pred: &[Vec<f32>], meas: &[Vec<f32>]) -> (f32, Vec<Vec<f32>>) {
    assert_eq!(pred.len(), meas.len());
    let mut loss = 0.0f32;
    let mut grads = Vec::with_capacity(pred.len());
    for (p, m) in pred.iter().zip(meas) {
        assert_eq!(p.len(), m.len());
        let n = p.len().max(1) as f32;
        let mut frame_loss = 0.0f32;
        let mut g = vec![0.0f32; p.len()];
        for i in 0..p.len() {
            let d = p[i] - m[i];
            frame_loss += d * d;
            g[i] = 2.0 * d / n;
        }
        loss += frame_loss / n;
        grads.push(g);
    }
    (loss, grads)
}

/// Composite loss: data fidelity plus weighted regularization.
#[derive(Clone, Debug)]
pub struct LossEngine {
    fidelity: DataFidelity,
    regularization_weight: f32,
    regularizers: Vec<(Regularizer, f32)>,
    normalize_retardance: bool,
    measured: MeasuredImages,
}

impl LossEngine {
    pub fn new(
        fidelity: DataFidelity,
        regularization_weight: f32,
        regularizers: Vec<(Regularizer, f32)>,
        normalize_retardance: bool,
        measured: MeasuredImages,
    ) -> std::result::Result<Self, ConfigError> {
        if fidelity == DataFidelity::Intensity && measured.intensity.is_none() {
            return Err(ConfigError::MissingIntensityTargets);
        }
        Ok(Self {
            fidelity,
            regularization_weight,
            regularizers,
            normalize_retardance,
            measured,
        })
    }

    pub fn from_settings(
        settings: &ReconstructionSettings,
        measured: MeasuredImages,
    ) -> std::result::Result<Self, ConfigError> {
        Self::new(
            settings.data_fidelity,
            settings.regularization_weight,
            settings.regularizers.clone(),
            settings.normalize_retardance,
            measured,
        )
    }

    pub fn output_mode(&self) -> OutputMode {
        self.fidelity.output_mode()
    }

    pub fn measured(&self) -> &MeasuredImages {
        &self.measured
    }

    pub fn regularizer_names(&self) -> Vec<&'static str> {
        self.regularizers.iter().map(|(r, _)| r.name()).collect()
    }

    /// Retardance scale for the vector form. A zero maximum disables it.
    fn retardance_scale(&self) -> f32 {
        if !self.normalize_retardance {
            return 1.0;
        }
        let max = self.measured.max_retardance();
        if max > 0.0 {
            1.0 / max
        } else {
            1.0
        }
    }

    /// Data term and its gradient w.r.t. the predicted images.
    pub fn data_term_and_grad(&self, predicted: &ImageSet) -> Result<(f32, ImageSet)> {
        match (self.fidelity, predicted) {
            (DataFidelity::Vector, ImageSet::RetardanceAzimuth { retardance, azimuth }) => {
                let n = self.measured.retardance.len();
                if retardance.len() != n || azimuth.len() != n {
                    return Err(ReconstructionError::SizeMismatch {
                        what: "predicted retardance image",
                        expected: n,
                        actual: retardance.len(),
                    });
                }
                let (loss, d_ret, d_azim) = vector_loss_and_grad(
                    retardance,
                    azimuth,
                    &self.measured.retardance,
                    &self.measured.azimuth,
                    self.retardance_scale(),
                );
                Ok((
                    loss,
                    ImageSet::RetardanceAzimuth {
                        retardance: d_ret,
                        azimuth: d_azim,
                    },
                ))
            }
            (DataFidelity::Intensity, ImageSet::Intensity(frames)) => {
                let targets = self
                    .measured
                    .intensity
                    .as_ref()
                    .ok_or(ConfigError::MissingIntensityTargets)?;
                if frames.len() != targets.len() || frames.iter().zip(targets).any(|(p, m)| p.len() != m.len()) {
                    return Err(ReconstructionError::SizeMismatch {
                        what: "predicted intensity frames",
                        expected: targets.len(),
                        actual: frames.len(),
                    });
                }
                let (loss, grads) = intensity_loss_and_grad(frames, targets);
                Ok((loss, ImageSet::Intensity(grads)))
            }
            (fidelity, other) => Err(ReconstructionError::OutputMismatch {
                produced: other.kind(),
                expected: match fidelity {
                    DataFidelity::Vector => "retardance/azimuth",
                    DataFidelity::Intensity => "intensity",
                },
            }),
        }
    }

    fn breakdown(&self, data_term: f32, reg_values: Vec<f32>) -> LossBreakdown {
        let reg_term: f32 = self
            .regularizers
            .iter()
            .zip(&reg_values)
            .map(|((_, w), f)| w * f)
            .sum();
        LossBreakdown {
            total: data_term + self.regularization_weight * reg_term,
            data_term,
            reg_term,
            reg_values,
        }
    }

    pub fn compute(&self, predicted: &ImageSet, params: &ActiveParameterSet) -> Result<LossBreakdown> {
        let (data_term, _) = self.data_term_and_grad(predicted)?;
        let reg_values = self.regularizers.iter().map(|(r, _)| r.value(params)).collect();
        Ok(self.breakdown(data_term, reg_values))
    }

    /// Loss, gradient w.r.t. the predicted images, and regularizer
    /// gradients added into `grads`.
    pub fn compute_with_grads(
        &self,
        predicted: &ImageSet,
        params: &ActiveParameterSet,
        grads: &mut VolumeGrads,
    ) -> Result<(LossBreakdown, ImageSet)> {
        let (data_term, d_images) = self.data_term_and_grad(predicted)?;
        let reg_values = self
            .regularizers
            .iter()
            .map(|(r, w)| r.value_and_grad(params, self.regularization_weight * w, grads))
            .collect();
        Ok((self.breakdown(data_term, reg_values), d_images))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AxisParametrization, BirefringentVolume, VolumeShape, VoxelMask};
    use approx::assert_relative_eq;
    use std::f32::consts::PI;

    fn measured(ret: Vec<f32>, azim: Vec<f32>) -> MeasuredImages {
        MeasuredImages {
            image_shape: (1, ret.len()),
            retardance: ret,
            azimuth: azim,
            intensity: None,
        }
    }

    fn params() -> ActiveParameterSet {
        let mut vol = BirefringentVolume::zeros(VolumeShape::new(1, 1, 2), [1.0; 3]);
        vol.birefringence = vec![0.3, -0.1];
        ActiveParameterSet::derive(&vol, &VoxelMask::all(2), AxisParametrization::Full).unwrap()
    }

    #[test]
    fn test_all_zero_images_give_exact_zero() {
        let engine = LossEngine::new(DataFidelity::Vector, 1.0, vec![], true, measured(vec![0.0; 4], vec![0.0; 4])).unwrap();
        let pred = ImageSet::RetardanceAzimuth {
            retardance: vec![0.0; 4],
            azimuth: vec![0.0; 4],
        };
        let out = engine.compute(&pred, &params()).unwrap();
        assert_eq!(out.data_term, 0.0);
        assert_eq!(out.total, 0.0);
    }

    #[test]
    fn test_vector_term_is_azimuth_periodic() {
        let meas_ret = vec![0.2, 0.5, 0.1];
        let meas_azim = vec![0.3, 1.2, 2.9];
        let ret = vec![0.25, 0.4, 0.0];
        let azim = vec![0.1, 2.0, 1.0];
        let shifted: Vec<f32> = azim.iter().map(|a| a + PI).collect();
        let (a, _, _) = vector_loss_and_grad(&ret, &azim, &meas_ret, &meas_azim, 1.0);
        let (b, _, _) = vector_loss_and_grad(&ret, &shifted, &meas_ret, &meas_azim, 1.0);
        assert_relative_eq!(a, b, epsilon = 1e-6);
    }

    #[test]
    fn test_total_is_data_plus_weighted_reg() {
        let regs = vec![(Regularizer::L1Birefringence, 0.5), (Regularizer::L2Birefringence, 2.0)];
        let engine = LossEngine::new(DataFidelity::Vector, 0.1, regs, false, measured(vec![0.1, 0.2], vec![0.0, 1.0])).unwrap();
        let pred = ImageSet::RetardanceAzimuth {
            retardance: vec![0.3, 0.0],
            azimuth: vec![0.5, 0.0],
        };
        let p = params();
        let mut grads = VolumeGrads::zeros(p.len());
        let (out, _) = engine.compute_with_grads(&pred, &p, &mut grads).unwrap();
        assert_eq!(out.reg_values.len(), 2);
        assert_relative_eq!(out.reg_values[0], 0.2, epsilon = 1e-6);
        assert_relative_eq!(out.reg_values[1], 0.05, epsilon = 1e-6);
        assert_relative_eq!(out.reg_term, 0.5 * 0.2 + 2.0 * 0.05, epsilon = 1e-6);
        assert_relative_eq!(out.total, out.data_term + 0.1 * out.reg_term, epsilon = 1e-6);
        // d/dΔn of 0.1·(0.5·mean|x| + 2·mean x²) at x = 0.3.
        assert_relative_eq!(grads.birefringence[0], 0.1 * (0.5 * 0.5 + 2.0 * 0.3), epsilon = 1e-6);
    }

    #[test]
    fn test_output_kind_mismatch_is_an_error() {
        let engine = LossEngine::new(DataFidelity::Vector, 1.0, vec![], false, measured(vec![0.0], vec![0.0])).unwrap();
        let pred = ImageSet::Intensity(vec![vec![0.5]]);
        assert!(matches!(
            engine.compute(&pred, &params()),
            Err(ReconstructionError::OutputMismatch { .. })
        ));
    }

    #[test]
    fn test_intensity_requires_targets() {
        assert!(matches!(
            LossEngine::new(DataFidelity::Intensity, 1.0, vec![], false, measured(vec![0.0], vec![0.0])),
            Err(ConfigError::MissingIntensityTargets)
        ));
    }

    #[test]
    fn test_parse_fidelity() {
        assert_eq!("vector".parse::<DataFidelity>().unwrap(), DataFidelity::Vector);
        assert_eq!("intensity mse".parse::<DataFidelity>().unwrap(), DataFidelity::Intensity);
        assert!("euler".parse::<DataFidelity>().is_err());
    }
}
