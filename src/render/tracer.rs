//! Differentiable forward model: volume → polarization images.

use crate::core::VolumeView;
use crate::diff::retardance_grad::{
    analyzer_intensity, analyzer_intensity_grad, ret_azim_from_vector, ret_azim_from_vector_grad,
    voxel_retardance_vector, voxel_retardance_vector_grad,
};
use crate::diff::VolumeGrads;
use crate::error::{ReconstructionError, Result};
use crate::render::geometry::RayGeometry;
use nalgebra::Vector2;
use rayon::prelude::*;
use std::f32::consts::PI;

/// What the forward model emits. Fixed for a whole run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    RetardanceAzimuth,
    IntensityStack,
}

/// Images in flat row-major pixel order.
#[derive(Clone, Debug, PartialEq)]
pub enum ImageSet {
    RetardanceAzimuth {
        retardance: Vec<f32>,
        azimuth: Vec<f32>,
    },
    /// One frame per analyzer angle.
    Intensity(Vec<Vec<f32>>),
}

impl ImageSet {
    pub fn kind(&self) -> &'static str {
        match self {
            ImageSet::RetardanceAzimuth { .. } => "retardance/azimuth",
            ImageSet::Intensity(_) => "intensity",
        }
    }

    pub fn zeros_like(&self) -> ImageSet {
        match self {
            ImageSet::RetardanceAzimuth { retardance, azimuth } => ImageSet::RetardanceAzimuth {
                retardance: vec![0.0; retardance.len()],
                azimuth: vec![0.0; azimuth.len()],
            },
            ImageSet::Intensity(frames) => {
                ImageSet::Intensity(frames.iter().map(|f| vec![0.0; f.len()]).collect())
            }
        }
    }
}

/// A differentiable renderer of birefringent volumes.
///
/// `backward` adds `(∂images/∂volume)ᵀ · d_images` into `grads`, indexed by
/// the view's slots.
pub trait ForwardModel: Sync {
    fn image_shape(&self) -> (usize, usize);

    fn forward(&self, volume: VolumeView<'_>, mode: OutputMode) -> Result<ImageSet>;

    fn backward(
        &self,
        volume: VolumeView<'_>,
        d_images: &ImageSet,
        grads: &mut VolumeGrads,
    ) -> Result<()>;
}

/// First-order (weak retardance) Jones tracer over a fixed ray geometry.
#[derive(Clone, Debug)]
pub struct WeakBirefringenceTracer {
    pub geometry: RayGeometry,
    /// Wavelength in micrometers.
    pub wavelength: f32,
    /// Analyzer angles in radians.
    pub analyzer_angles: Vec<f32>,
}

impl WeakBirefringenceTracer {
    pub fn new(geometry: RayGeometry, wavelength: f32, analyzer_angles_deg: &[f32]) -> Self {
        Self {
            geometry,
            wavelength,
            analyzer_angles: analyzer_angles_deg.iter().map(|d| d.to_radians()).collect(),
        }
    }

    fn wavenumber(&self) -> f32 {
        2.0 * PI / self.wavelength
    }

    /// Retardance vector per pixel. Pixels without rays stay zero.
    pub fn retardance_vectors(&self, volume: VolumeView<'_>) -> Vec<Vector2<f32>> {
        let k = self.wavenumber();
        let per_ray: Vec<(usize, Vector2<f32>)> = self
            .geometry
            .lenslets
            .par_iter()
            .flat_map_iter(|l| l.rays.iter())
            .map(|ray| {
                let mut r = Vector2::zeros();
                for (&voxel, &len) in ray.voxels.iter().zip(&ray.lengths) {
                    if let Some((_, dn, axis)) = volume.lookup(voxel) {
                        r += voxel_retardance_vector(k * len, dn, &axis);
                    }
                }
                (ray.pixel, r)
            })
            .collect();

        let mut out = vec![Vector2::zeros(); self.geometry.pixel_count()];
        for (pixel, r) in per_ray {
            if let Some(slot) = out.get_mut(pixel) {
                *slot += r;
            }
        }
        out
    }

    fn check_shape(&self, volume: VolumeView<'_>) -> Result<()> {
        let expected = self.geometry.volume_shape.voxel_count();
        let actual = volume.shape().voxel_count();
        if expected != actual {
            return Err(ReconstructionError::SizeMismatch {
                what: "traced volume",
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Upstream gradient w.r.t. the per-pixel retardance vectors.
    fn pixel_vector_grads(&self, r: &[Vector2<f32>], d_images: &ImageSet) -> Result<Vec<Vector2<f32>>> {
        let n = r.len();
        match d_images {
            ImageSet::RetardanceAzimuth { retardance, azimuth } => {
                if retardance.len() != n || azimuth.len() != n {
                    return Err(ReconstructionError::SizeMismatch {
                        what: "retardance/azimuth gradient",
                        expected: n,
                        actual: retardance.len().min(azimuth.len()),
                    });
                }
                Ok(r.iter()
                    .zip(retardance.iter().zip(azimuth))
                    .map(|(rv, (&d_ret, &d_azim))| ret_azim_from_vector_grad(rv, d_ret, d_azim))
                    .collect())
            }
            ImageSet::Intensity(frames) => {
                if frames.len() != self.analyzer_angles.len() {
                    return Err(ReconstructionError::SizeMismatch {
                        what: "intensity gradient frames",
                        expected: self.analyzer_angles.len(),
                        actual: frames.len(),
                    });
                }
                let mut d_r = vec![Vector2::zeros(); n];
                for (frame, &phi) in frames.iter().zip(&self.analyzer_angles) {
                    if frame.len() != n {
                        return Err(ReconstructionError::SizeMismatch {
                            what: "intensity gradient frame",
                            expected: n,
                            actual: frame.len(),
                        });
                    }
                    for (g, &d_i) in d_r.iter_mut().zip(frame) {
                        *g += analyzer_intensity_grad(phi, d_i);
                    }
                }
                Ok(d_r)
            }
        }
    }
}

impl ForwardModel for WeakBirefringenceTracer {
    fn image_shape(&self) -> (usize, usize) {
        self.geometry.image_shape
    }

    fn forward(&self, volume: VolumeView<'_>, mode: OutputMode) -> Result<ImageSet> {
        self.check_shape(volume)?;
        let r = self.retardance_vectors(volume);
        Ok(match mode {
            OutputMode::RetardanceAzimuth => {
                let (retardance, azimuth) = r.iter().map(ret_azim_from_vector).unzip();
                ImageSet::RetardanceAzimuth { retardance, azimuth }
            }
            OutputMode::IntensityStack => ImageSet::Intensity(
                self.analyzer_angles
                    .iter()
                    .map(|&phi| r.iter().map(|rv| analyzer_intensity(rv, phi)).collect())
                    .collect(),
            ),
        })
    }

    fn backward(
        &self,
        volume: VolumeView<'_>,
        d_images: &ImageSet,
        grads: &mut VolumeGrads,
    ) -> Result<()> {
        self.check_shape(volume)?;
        let slots = volume.slot_count();
        if grads.len() != slots {
            return Err(ReconstructionError::SizeMismatch {
                what: "volume gradient buffer",
                expected: slots,
                actual: grads.len(),
            });
        }

        let r = self.retardance_vectors(volume);
        let d_r = self.pixel_vector_grads(&r, d_images)?;
        let k = self.wavenumber();

        // Thread-local accumulation, reduced once at the end.
        let local = self
            .geometry
            .lenslets
            .par_iter()
            .flat_map_iter(|l| l.rays.iter())
            .fold(
                || VolumeGrads::zeros(slots),
                |mut acc, ray| {
                    let upstream = d_r[ray.pixel];
                    if upstream == Vector2::zeros() {
                        return acc;
                    }
                    for (&voxel, &len) in ray.voxels.iter().zip(&ray.lengths) {
                        if let Some((slot, dn, axis)) = volume.lookup(voxel) {
                            let (d_dn, d_axis) =
                                voxel_retardance_vector_grad(k * len, dn, &axis, &upstream);
                            acc.birefringence[slot] += d_dn;
                            acc.optic_axis[slot] += d_axis;
                        }
                    }
                    acc
                },
            )
            .reduce(
                || VolumeGrads::zeros(slots),
                |mut a, b| {
                    a.accumulate(&b);
                    a
                },
            );
        grads.accumulate(&local);
        Ok(())
    }
}
