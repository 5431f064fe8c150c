//! Voxel grid of birefringence magnitude and optic-axis orientation.
//!
//! Voxels are stored flat in `z`-major order (`index = (z * ny + y) * nx + x`).
//! Optic axes are 3-vectors with components ordered `(axial, y, x)`: index 0
//! points along the optical axis of the microscope, indices 1 and 2 span the
//! image plane.

use crate::core::active::ActiveParameterSet;
use crate::core::mask::VoxelMask;
use crate::core::optic_axis::{normalize_axes, random_unit_vector};
use nalgebra::Vector3;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Grid dimensions `[z, y, x]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeShape {
    pub z: usize,
    pub y: usize,
    pub x: usize,
}

impl VolumeShape {
    pub fn new(z: usize, y: usize, x: usize) -> Self {
        Self { z, y, x }
    }

    pub fn from_array(shape: [usize; 3]) -> Self {
        Self::new(shape[0], shape[1], shape[2])
    }

    pub fn voxel_count(&self) -> usize {
        self.z * self.y * self.x
    }

    #[inline]
    pub fn index(&self, z: usize, y: usize, x: usize) -> usize {
        (z * self.y + y) * self.x + x
    }

    #[inline]
    pub fn coords(&self, index: usize) -> [usize; 3] {
        let x = index % self.x;
        let y = (index / self.x) % self.y;
        let z = index / (self.x * self.y);
        [z, y, x]
    }

    /// Neighbors one step further along z, y and x (when inside the grid).
    pub fn forward_neighbors(&self, index: usize) -> impl Iterator<Item = usize> {
        let [z, y, x] = self.coords(index);
        let shape = *self;
        [
            (z + 1 < shape.z).then(|| shape.index(z + 1, y, x)),
            (y + 1 < shape.y).then(|| shape.index(z, y + 1, x)),
            (x + 1 < shape.x).then(|| shape.index(z, y, x + 1)),
        ]
        .into_iter()
        .flatten()
    }
}

/// Full-grid birefringent volume.
#[derive(Clone, Debug, PartialEq)]
pub struct BirefringentVolume {
    pub shape: VolumeShape,
    /// Voxel edge lengths in micrometers `[z, y, x]`.
    pub voxel_size_um: [f32; 3],
    /// Birefringence Δn per voxel.
    pub birefringence: Vec<f32>,
    /// Unit optic axis per voxel, `(axial, y, x)`.
    pub optic_axis: Vec<Vector3<f32>>,
}

impl BirefringentVolume {
    /// All voxels share one birefringence value and one (normalized) axis.
    pub fn uniform(
        shape: VolumeShape,
        voxel_size_um: [f32; 3],
        delta_n: f32,
        axis: Vector3<f32>,
    ) -> Self {
        let n = shape.voxel_count();
        let axis = axis.try_normalize(0.0).unwrap_or_else(Vector3::x);
        Self {
            shape,
            voxel_size_um,
            birefringence: vec![delta_n; n],
            optic_axis: vec![axis; n],
        }
    }

    /// Volume with zero birefringence and axial optic axes.
    pub fn zeros(shape: VolumeShape, voxel_size_um: [f32; 3]) -> Self {
        Self::uniform(shape, voxel_size_um, 0.0, Vector3::x())
    }

    /// Uniformly random Δn in `delta_n_range` and isotropic random axes.
    pub fn random<R: Rng>(
        shape: VolumeShape,
        voxel_size_um: [f32; 3],
        delta_n_range: (f32, f32),
        rng: &mut R,
    ) -> Self {
        let n = shape.voxel_count();
        let (lo, hi) = delta_n_range;
        let birefringence = (0..n)
            .map(|_| if hi > lo { rng.gen_range(lo..hi) } else { lo })
            .collect();
        let optic_axis = (0..n).map(|_| random_unit_vector(rng)).collect();
        Self {
            shape,
            voxel_size_um,
            birefringence,
            optic_axis,
        }
    }

    /// Ellipsoidal shell centered in the grid whose axes point radially.
    ///
    /// `radii` are in voxels `[z, y, x]`; voxels whose normalized radius lies
    /// within `thickness` of 1 get `delta_n`, everything else is zero.
    pub fn ellipsoid_shell(
        shape: VolumeShape,
        voxel_size_um: [f32; 3],
        radii: [f32; 3],
        thickness: f32,
        delta_n: f32,
    ) -> Self {
        let mut volume = Self::zeros(shape, voxel_size_um);
        let center = [
            (shape.z as f32 - 1.0) / 2.0,
            (shape.y as f32 - 1.0) / 2.0,
            (shape.x as f32 - 1.0) / 2.0,
        ];
        for index in 0..shape.voxel_count() {
            let [z, y, x] = shape.coords(index);
            let offset = Vector3::new(
                (z as f32 - center[0]) / radii[0].max(f32::EPSILON),
                (y as f32 - center[1]) / radii[1].max(f32::EPSILON),
                (x as f32 - center[2]) / radii[2].max(f32::EPSILON),
            );
            let r = offset.norm();
            if (r - 1.0).abs() <= thickness {
                volume.birefringence[index] = delta_n;
                if let Some(radial) = offset.try_normalize(1e-6) {
                    volume.optic_axis[index] = radial;
                }
            }
        }
        volume
    }

    pub fn voxel_count(&self) -> usize {
        self.birefringence.len()
    }

    /// Zero the birefringence of every voxel outside `mask`.
    ///
    /// Optic axes are left alone: zero-length axes break the unit-sphere
    /// invariant the forward model relies on.
    pub fn apply_mask(&mut self, mask: &VoxelMask) {
        for (dn, active) in self.birefringence.iter_mut().zip(mask.iter()) {
            if !active {
                *dn = 0.0;
            }
        }
    }

    pub fn normalize_optic_axes(&mut self) {
        normalize_axes(&mut self.optic_axis);
    }

    /// Maximum intensity projection of |Δn| along z, row-major `[y, x]`.
    pub fn birefringence_mip(&self) -> Vec<f32> {
        let s = self.shape;
        let mut mip = vec![0.0f32; s.y * s.x];
        for z in 0..s.z {
            for y in 0..s.y {
                for x in 0..s.x {
                    let v = self.birefringence[s.index(z, y, x)].abs();
                    let slot = &mut mip[y * s.x + x];
                    if v > *slot {
                        *slot = v;
                    }
                }
            }
        }
        mip
    }
}

/// Read access to voxel properties for the forward model.
///
/// Gradients are indexed by *slot*: the voxel index for a full volume, the
/// active position for an active parameter set.
#[derive(Clone, Copy, Debug)]
pub enum VolumeView<'a> {
    Full(&'a BirefringentVolume),
    Active(&'a ActiveParameterSet),
}

impl<'a> VolumeView<'a> {
    pub fn shape(&self) -> VolumeShape {
        match self {
            VolumeView::Full(v) => v.shape,
            VolumeView::Active(p) => p.shape(),
        }
    }

    pub fn slot_count(&self) -> usize {
        match self {
            VolumeView::Full(v) => v.voxel_count(),
            VolumeView::Active(p) => p.len(),
        }
    }

    /// `(slot, Δn, axis)` for a voxel, or `None` if it is not represented.
    #[inline]
    pub fn lookup(&self, voxel: usize) -> Option<(usize, f32, Vector3<f32>)> {
        match self {
            VolumeView::Full(v) => v
                .birefringence
                .get(voxel)
                .map(|&dn| (voxel, dn, v.optic_axis[voxel])),
            VolumeView::Active(p) => p
                .active_position(voxel)
                .map(|slot| (slot, p.birefringence[slot], p.optic_axis[slot])),
        }
    }
}
