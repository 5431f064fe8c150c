//! Implicit neural field: a coordinate MLP that predicts voxel properties.
//!
//! Architecture: Fourier-feature encoding of the normalized `(z, y, x)`
//! position, two ReLU hidden layers and a linear head with four outputs:
//! Δn and a raw optic axis that is normalized onto the unit sphere.

use crate::core::{optic_axis::project_to_sphere, ActiveParameterSet, VolumeShape};
use crate::diff::axis_grad::normalize_grad;
use crate::diff::{clip_scale, VolumeGrads};
use crate::error::Result;
use nalgebra::Vector3;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use std::path::Path;

/// Δn output is this times the raw head value.
const BIREFRINGENCE_SCALE: f32 = 0.01;
const OUTPUTS: usize = 4;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    pub inputs: usize,
    pub outputs: usize,
    /// Row-major `outputs × inputs`.
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

impl DenseLayer {
    fn random<R: Rng + ?Sized>(inputs: usize, outputs: usize, rng: &mut R) -> Self {
        let limit = (6.0 / (inputs + outputs) as f32).sqrt();
        Self {
            inputs,
            outputs,
            weights: (0..inputs * outputs).map(|_| rng.gen_range(-limit..limit)).collect(),
            bias: vec![0.0; outputs],
        }
    }

    fn zeros_like(&self) -> Self {
        Self {
            inputs: self.inputs,
            outputs: self.outputs,
            weights: vec![0.0; self.weights.len()],
            bias: vec![0.0; self.bias.len()],
        }
    }

    fn forward(&self, x: &[f32]) -> Vec<f32> {
        (0..self.outputs)
            .map(|o| {
                let row = &self.weights[o * self.inputs..(o + 1) * self.inputs];
                row.iter().zip(x).map(|(w, xi)| w * xi).sum::<f32>() + self.bias[o]
            })
            .collect()
    }

    /// Accumulate parameter gradients into `grad`; returns d_x.
    fn backward(&self, x: &[f32], d_y: &[f32], grad: &mut DenseLayer) -> Vec<f32> {
        let mut d_x = vec![0.0f32; self.inputs];
        for o in 0..self.outputs {
            let g = d_y[o];
            if g == 0.0 {
                continue;
            }
            grad.bias[o] += g;
            let base = o * self.inputs;
            for i in 0..self.inputs {
                grad.weights[base + i] += g * x[i];
                d_x[i] += g * self.weights[base + i];
            }
        }
        d_x
    }

    fn accumulate(&mut self, other: &DenseLayer) {
        for (a, b) in self.weights.iter_mut().zip(&other.weights) {
            *a += b;
        }
        for (a, b) in self.bias.iter_mut().zip(&other.bias) {
            *a += b;
        }
    }
}

/// Intermediate values of one evaluation, kept for the backward pass.
struct Activations {
    encoded: Vec<f32>,
    hidden1: Vec<f32>,
    hidden2: Vec<f32>,
    raw_axis: Vector3<f32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImplicitField {
    pub fourier_octaves: usize,
    /// Hidden, hidden, head.
    pub layers: Vec<DenseLayer>,
}

fn relu(v: &mut [f32]) {
    v.iter_mut().for_each(|x| *x = x.max(0.0));
}

/// Voxel center in `[-1, 1]³`.
fn normalized_coords(shape: VolumeShape, voxel: usize) -> [f32; 3] {
    let c = shape.coords(voxel);
    let dims = [shape.z, shape.y, shape.x];
    let mut out = [0.0f32; 3];
    for k in 0..3 {
        out[k] = 2.0 * (c[k] as f32 + 0.5) / dims[k] as f32 - 1.0;
    }
    out
}

impl ImplicitField {
    pub fn new<R: Rng + ?Sized>(hidden_width: usize, fourier_octaves: usize, rng: &mut R) -> Self {
        let input = 3 * (1 + 2 * fourier_octaves);
        let mut head = DenseLayer::random(hidden_width, OUTPUTS, rng);
        // Start near a small positive Δn.
        head.bias[0] = 0.1;
        Self {
            fourier_octaves,
            layers: vec![
                DenseLayer::random(input, hidden_width, rng),
                DenseLayer::random(hidden_width, hidden_width, rng),
                head,
            ],
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            fourier_octaves: self.fourier_octaves,
            layers: self.layers.iter().map(DenseLayer::zeros_like).collect(),
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(|l| l.weights.len() + l.bias.len()).sum()
    }

    pub fn encode(&self, coords: [f32; 3]) -> Vec<f32> {
        let mut out = Vec::with_capacity(3 * (1 + 2 * self.fourier_octaves));
        out.extend_from_slice(&coords);
        for k in 0..self.fourier_octaves {
            let freq = (1u32 << k) as f32 * PI;
            for &c in &coords {
                out.push((freq * c).sin());
                out.push((freq * c).cos());
            }
        }
        out
    }

    fn evaluate(&self, coords: [f32; 3]) -> (f32, Vector3<f32>, Activations) {
        let encoded = self.encode(coords);
        let mut hidden1 = self.layers[0].forward(&encoded);
        relu(&mut hidden1);
        let mut hidden2 = self.layers[1].forward(&hidden1);
        relu(&mut hidden2);
        let out = self.layers[2].forward(&hidden2);
        let raw_axis = Vector3::new(out[1], out[2], out[3]);
        (
            BIREFRINGENCE_SCALE * out[0],
            project_to_sphere(&raw_axis),
            Activations {
                encoded,
                hidden1,
                hidden2,
                raw_axis,
            },
        )
    }

    /// Δn and unit axis at a voxel.
    pub fn predict(&self, shape: VolumeShape, voxel: usize) -> (f32, Vector3<f32>) {
        let (dn, axis, _) = self.evaluate(normalized_coords(shape, voxel));
        (dn, axis)
    }

    /// Overwrite the active parameters with the field's prediction.
    pub fn predict_into(&self, params: &mut ActiveParameterSet) {
        let shape = params.shape();
        let predictions: Vec<(f32, Vector3<f32>)> = params
            .indices()
            .par_iter()
            .map(|&voxel| self.predict(shape, voxel))
            .collect();
        for (pos, (dn, axis)) in predictions.into_iter().enumerate() {
            params.birefringence[pos] = dn;
            params.optic_axis[pos] = axis;
        }
    }

    /// Gradient of the field weights given gradients w.r.t. the predicted
    /// active parameters.
    pub fn backward(&self, params: &ActiveParameterSet, volume_grads: &VolumeGrads) -> ImplicitField {
        let shape = params.shape();
        params
            .indices()
            .par_iter()
            .enumerate()
            .fold(
                || self.zeros_like(),
                |mut acc, (pos, &voxel)| {
                    let (_, _, act) = self.evaluate(normalized_coords(shape, voxel));
                    let d_axis = normalize_grad(&act.raw_axis, &volume_grads.optic_axis[pos]);
                    let d_out = [
                        BIREFRINGENCE_SCALE * volume_grads.birefringence[pos],
                        d_axis.x,
                        d_axis.y,
                        d_axis.z,
                    ];
                    let mut d_h2 = self.layers[2].backward(&act.hidden2, &d_out, &mut acc.layers[2]);
                    for (d, &h) in d_h2.iter_mut().zip(&act.hidden2) {
                        if h <= 0.0 {
                            *d = 0.0;
                        }
                    }
                    let mut d_h1 = self.layers[1].backward(&act.hidden1, &d_h2, &mut acc.layers[1]);
                    for (d, &h) in d_h1.iter_mut().zip(&act.hidden1) {
                        if h <= 0.0 {
                            *d = 0.0;
                        }
                    }
                    self.layers[0].backward(&act.encoded, &d_h1, &mut acc.layers[0]);
                    acc
                },
            )
            .reduce(
                || self.zeros_like(),
                |mut a, b| {
                    for (la, lb) in a.layers.iter_mut().zip(&b.layers) {
                        la.accumulate(lb);
                    }
                    a
                },
            )
    }

    /// `(parameter, gradient)` slices for every tensor, in a fixed order.
    pub fn segments<'a>(&'a mut self, grads: &'a ImplicitField) -> Vec<(&'a mut [f32], &'a [f32])> {
        let mut out = Vec::with_capacity(self.layers.len() * 2);
        for (layer, grad) in self.layers.iter_mut().zip(&grads.layers) {
            out.push((layer.weights.as_mut_slice(), grad.weights.as_slice()));
            out.push((layer.bias.as_mut_slice(), grad.bias.as_slice()));
        }
        out
    }

    /// Rescale these weight gradients so their joint L2 norm is at most
    /// `max_norm`. Returns the norm before clipping when it was reduced.
    pub fn clip_norm(&mut self, max_norm: f32) -> Option<f32> {
        let sq: f32 = self
            .layers
            .iter()
            .flat_map(|l| l.weights.iter().chain(&l.bias))
            .map(|g| g * g)
            .sum();
        let norm = sq.sqrt();
        let s = clip_scale(norm, max_norm)?;
        for layer in &mut self.layers {
            layer.weights.iter_mut().chain(layer.bias.iter_mut()).for_each(|g| *g *= s);
        }
        Some(norm)
    }

    pub fn has_non_finite(&self) -> bool {
        self.layers
            .iter()
            .any(|l| l.weights.iter().chain(&l.bias).any(|v| !v.is_finite()))
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        let file = std::io::BufWriter::new(std::fs::File::create(path)?);
        serde_json::to_writer(file, self)?;
        Ok(())
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let file = std::io::BufReader::new(std::fs::File::open(path)?);
        Ok(serde_json::from_reader(file)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AxisParametrization, BirefringentVolume, VoxelMask};
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_encoding_width() {
        let mut rng = StdRng::seed_from_u64(0);
        let field = ImplicitField::new(8, 3, &mut rng);
        assert_eq!(field.encode([0.1, -0.2, 0.3]).len(), 21);
        assert_eq!(field.layers[0].inputs, 21);
        assert_eq!(field.layers[2].outputs, 4);
    }

    #[test]
    fn test_predict_into_writes_unit_axes() {
        let mut rng = StdRng::seed_from_u64(5);
        let field = ImplicitField::new(8, 2, &mut rng);
        let vol = BirefringentVolume::zeros(VolumeShape::new(2, 3, 3), [1.0; 3]);
        let mut params =
            ActiveParameterSet::derive(&vol, &VoxelMask::from_indices(18, &[0, 5, 17]), AxisParametrization::Full)
                .unwrap();
        field.predict_into(&mut params);
        for a in &params.optic_axis {
            assert_relative_eq!(a.norm(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_clip_norm_bounds_weight_gradients() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut grads = ImplicitField::new(4, 1, &mut rng);
        let before = grads.clone();
        assert!(grads.clip_norm(1e-3).is_some());
        let norm: f32 = grads
            .layers
            .iter()
            .flat_map(|l| l.weights.iter().chain(&l.bias))
            .map(|g| g * g)
            .sum::<f32>()
            .sqrt();
        assert_relative_eq!(norm, 1e-3, epsilon = 1e-6);
        assert!(grads.clip_norm(1.0).is_none());
        assert_ne!(grads, before);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut rng = StdRng::seed_from_u64(9);
        let field = ImplicitField::new(4, 1, &mut rng);
        let file = tempfile::NamedTempFile::new().unwrap();
        field.save_json(file.path()).unwrap();
        assert_eq!(ImplicitField::load_json(file.path()).unwrap(), field);
    }
}
