//! Differentiable operations (backward passes).
//!
//! Each submodule pairs a forward function with its hand-written
//! vector-Jacobian product. `VolumeGrads` is the gradient buffer the forward
//! model, the loss and the regularizers accumulate into.

pub mod axis_grad;
pub mod retardance_grad;

use nalgebra::Vector3;

/// Scale that brings a gradient of L2 norm `norm` down to `max_norm`, or
/// `None` when it is already within bounds.
pub fn clip_scale(norm: f32, max_norm: f32) -> Option<f32> {
    (norm > max_norm).then(|| max_norm / (norm + 1e-6))
}

/// Gradients w.r.t. per-slot birefringence and optic axes.
///
/// Slots are voxel indices for a full volume and active positions for an
/// active parameter set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VolumeGrads {
    pub birefringence: Vec<f32>,
    pub optic_axis: Vec<Vector3<f32>>,
}

impl VolumeGrads {
    pub fn zeros(len: usize) -> Self {
        Self {
            birefringence: vec![0.0; len],
            optic_axis: vec![Vector3::zeros(); len],
        }
    }

    pub fn len(&self) -> usize {
        self.birefringence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.birefringence.is_empty()
    }

    /// Clear for a new step. With `release` the old buffers are freed
    /// instead of being zeroed in place.
    pub fn reset(&mut self, len: usize, release: bool) {
        if release {
            *self = Self::zeros(len);
            return;
        }
        self.birefringence.clear();
        self.birefringence.resize(len, 0.0);
        self.optic_axis.clear();
        self.optic_axis.resize(len, Vector3::zeros());
    }

    pub fn accumulate(&mut self, other: &VolumeGrads) {
        for (a, b) in self.birefringence.iter_mut().zip(&other.birefringence) {
            *a += b;
        }
        for (a, b) in self.optic_axis.iter_mut().zip(&other.optic_axis) {
            *a += b;
        }
    }

    pub fn scale(&mut self, s: f32) {
        self.birefringence.iter_mut().for_each(|g| *g *= s);
        self.optic_axis.iter_mut().for_each(|g| *g *= s);
    }

    /// Joint L2 norm over both buffers.
    pub fn norm(&self) -> f32 {
        let sq: f32 = self.birefringence.iter().map(|g| g * g).sum::<f32>()
            + self.optic_axis.iter().map(|g| g.norm_squared()).sum::<f32>();
        sq.sqrt()
    }

    /// Rescale so the joint norm is at most `max_norm`. Returns the norm
    /// before clipping when it had to be reduced.
    pub fn clip_norm(&mut self, max_norm: f32) -> Option<f32> {
        let norm = self.norm();
        let s = clip_scale(norm, max_norm)?;
        self.scale(s);
        Some(norm)
    }

    pub fn zero_slots(&mut self, slots: &[usize]) {
        for &i in slots {
            if let Some(g) = self.birefringence.get_mut(i) {
                *g = 0.0;
            }
            if let Some(g) = self.optic_axis.get_mut(i) {
                *g = Vector3::zeros();
            }
        }
    }

    /// Name of the first buffer holding a non-finite value, if any.
    pub fn first_non_finite(&self) -> Option<&'static str> {
        if self.birefringence.iter().any(|g| !g.is_finite()) {
            return Some("birefringence");
        }
        if self.optic_axis.iter().any(|g| g.iter().any(|c| !c.is_finite())) {
            return Some("optic axis");
        }
        None
    }
}
