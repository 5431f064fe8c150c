//! Reduced, trainable parametrization of a volume restricted to a voxel mask.

use crate::core::mask::VoxelMask;
use crate::core::optic_axis::{fill_axes_from_planar, normalize_axes, replace_non_finite_axes};
use crate::core::volume::{BirefringentVolume, VolumeShape};
use crate::error::{ReconstructionError, Result};
use nalgebra::{Vector2, Vector3};
use rand::Rng;

/// Sentinel in the voxel → active-position lookup for inactive voxels.
pub const INACTIVE: i64 = -1;

/// How the optic axis is exposed to the optimizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AxisParametrization {
    /// All three components are trainable.
    Full,
    /// Only the planar `(y, x)` components are trainable; the axial one is
    /// rebuilt as the non-negative root of the unit-norm constraint.
    TwoComponent,
}

/// Active birefringence and optic axes plus the mapping to full-grid voxels.
#[derive(Clone, Debug)]
pub struct ActiveParameterSet {
    shape: VolumeShape,
    voxel_size_um: [f32; 3],
    /// Active position → voxel index, ascending.
    indices: Vec<usize>,
    /// Voxel index → active position, [`INACTIVE`] elsewhere. Length is
    /// `voxel_count + 1`.
    positions: Vec<i64>,
    parametrization: AxisParametrization,
    pub birefringence: Vec<f32>,
    pub optic_axis: Vec<Vector3<f32>>,
    /// Trainable `(y, x)` components in [`AxisParametrization::TwoComponent`] mode.
    pub planar: Option<Vec<Vector2<f32>>>,
}

impl ActiveParameterSet {
    /// Gather the masked voxels of `volume` into dense trainable buffers.
    pub fn derive(
        volume: &BirefringentVolume,
        mask: &VoxelMask,
        parametrization: AxisParametrization,
    ) -> Result<Self> {
        let n = volume.voxel_count();
        if mask.len() != n {
            return Err(ReconstructionError::SizeMismatch {
                what: "voxel mask",
                expected: n,
                actual: mask.len(),
            });
        }

        let indices = mask.active_indices();
        let mut positions = vec![INACTIVE; n + 1];
        for (pos, &voxel) in indices.iter().enumerate() {
            positions[voxel] = pos as i64;
        }

        let birefringence = indices.iter().map(|&v| volume.birefringence[v]).collect();
        let optic_axis: Vec<Vector3<f32>> = indices.iter().map(|&v| volume.optic_axis[v]).collect();
        let planar = match parametrization {
            AxisParametrization::Full => None,
            AxisParametrization::TwoComponent => {
                Some(optic_axis.iter().map(|a| Vector2::new(a.y, a.z)).collect())
            }
        };

        Ok(Self {
            shape: volume.shape,
            voxel_size_um: volume.voxel_size_um,
            indices,
            positions,
            parametrization,
            birefringence,
            optic_axis,
            planar,
        })
    }

    pub fn shape(&self) -> VolumeShape {
        self.shape
    }

    pub fn voxel_size_um(&self) -> [f32; 3] {
        self.voxel_size_um
    }

    pub fn parametrization(&self) -> AxisParametrization {
        self.parametrization
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Active position → voxel index.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Voxel index → active position lookup table (with the trailing sentinel slot).
    pub fn position_table(&self) -> &[i64] {
        &self.positions
    }

    #[inline]
    pub fn active_position(&self, voxel: usize) -> Option<usize> {
        match self.positions.get(voxel) {
            Some(&p) if p >= 0 => Some(p as usize),
            _ => None,
        }
    }

    /// Checks that the trainable buffers still match the index mapping.
    pub fn validate(&self) -> Result<()> {
        let n = self.indices.len();
        let check = |what, actual| {
            if actual == n {
                Ok(())
            } else {
                Err(ReconstructionError::SizeMismatch {
                    what,
                    expected: n,
                    actual,
                })
            }
        };
        check("active birefringence", self.birefringence.len())?;
        check("active optic axis", self.optic_axis.len())?;
        if let Some(planar) = &self.planar {
            check("planar optic axis", planar.len())?;
        }
        Ok(())
    }

    /// Hard unit-norm constraint on every active optic axis.
    pub fn project_onto_sphere(&mut self) {
        match self.planar.as_mut() {
            Some(planar) => fill_axes_from_planar(planar, &mut self.optic_axis),
            None => normalize_axes(&mut self.optic_axis),
        }
    }

    /// Replace non-finite optic axes by random unit vectors.
    ///
    /// Returns the active positions that were replaced.
    pub fn recover_non_finite_axes<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Vec<usize> {
        let replaced = replace_non_finite_axes(&mut self.optic_axis, rng);
        if let Some(planar) = self.planar.as_mut() {
            for &i in &replaced {
                let a = self.optic_axis[i];
                planar[i] = Vector2::new(a.y, a.z);
            }
        }
        replaced
    }

    /// Write active values into `volume` at their voxel positions.
    pub fn scatter_into(&self, volume: &mut BirefringentVolume) -> Result<()> {
        self.validate()?;
        if volume.voxel_count() != self.shape.voxel_count() {
            return Err(ReconstructionError::SizeMismatch {
                what: "scatter target volume",
                expected: self.shape.voxel_count(),
                actual: volume.voxel_count(),
            });
        }
        for (pos, &voxel) in self.indices.iter().enumerate() {
            volume.birefringence[voxel] = self.birefringence[pos];
            volume.optic_axis[voxel] = self.optic_axis[pos];
        }
        Ok(())
    }

    /// Full-grid volume holding the active values; all other voxels are zero.
    pub fn scatter(&self) -> Result<BirefringentVolume> {
        let n = self.shape.voxel_count();
        let mut volume = BirefringentVolume {
            shape: self.shape,
            voxel_size_um: self.voxel_size_um,
            birefringence: vec![0.0; n],
            optic_axis: vec![Vector3::zeros(); n],
        };
        self.scatter_into(&mut volume)?;
        Ok(volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn line_volume(n: usize) -> BirefringentVolume {
        let shape = VolumeShape::new(1, 1, n);
        let mut vol = BirefringentVolume::zeros(shape, [1.0; 3]);
        for i in 0..n {
            vol.birefringence[i] = i as f32 * 0.01;
            vol.optic_axis[i] = Vector3::new(0.6, 0.8, 0.0);
        }
        vol
    }

    #[test]
    fn test_three_of_ten_mapping() {
        let vol = line_volume(10);
        let mask = VoxelMask::from_indices(10, &[1, 4, 7]);
        let params = ActiveParameterSet::derive(&vol, &mask, AxisParametrization::Full).unwrap();

        assert_eq!(params.len(), 3);
        assert_eq!(params.birefringence.len(), 3);
        assert_eq!(params.optic_axis.len(), 3);
        assert_eq!(params.position_table().len(), 11);
        for (voxel, &p) in params.position_table().iter().enumerate() {
            match voxel {
                1 => assert_eq!(p, 0),
                4 => assert_eq!(p, 1),
                7 => assert_eq!(p, 2),
                _ => assert_eq!(p, INACTIVE),
            }
        }
    }

    #[test]
    fn test_mask_size_mismatch_is_rejected() {
        let vol = line_volume(4);
        let mask = VoxelMask::all(5);
        assert!(matches!(
            ActiveParameterSet::derive(&vol, &mask, AxisParametrization::Full),
            Err(ReconstructionError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_scatter_reproduces_active_values_and_zeroes_rest() {
        let vol = line_volume(6);
        let mask = VoxelMask::from_indices(6, &[0, 2, 5]);
        let mut params = ActiveParameterSet::derive(&vol, &mask, AxisParametrization::Full).unwrap();
        params.birefringence = vec![0.11, -0.22, 0.33];
        params.optic_axis[1] = Vector3::new(0.0, 0.0, 1.0);

        let out = params.scatter().unwrap();
        for (pos, &voxel) in params.indices().iter().enumerate() {
            assert_eq!(out.birefringence[voxel], params.birefringence[pos]);
            assert_eq!(out.optic_axis[voxel], params.optic_axis[pos]);
        }
        assert_eq!(out.birefringence[1], 0.0);
        assert_eq!(out.optic_axis[3], Vector3::zeros());
    }

    #[test]
    fn test_two_component_projection_is_unit() {
        let vol = line_volume(3);
        let mask = VoxelMask::all(3);
        let mut params =
            ActiveParameterSet::derive(&vol, &mask, AxisParametrization::TwoComponent).unwrap();
        let planar = params.planar.as_mut().unwrap();
        planar[0] = Vector2::new(0.3, 0.4);
        planar[1] = Vector2::new(2.0, 0.0);
        params.project_onto_sphere();

        for a in &params.optic_axis {
            assert_relative_eq!(a.norm(), 1.0, epsilon = 1e-5);
            assert!(a.x >= 0.0);
        }
        assert_relative_eq!(params.optic_axis[0].x, 0.75f32.sqrt(), epsilon = 1e-5);
        assert_relative_eq!(params.optic_axis[1], Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-6);
    }

    #[test]
    fn test_validate_catches_resized_buffers() {
        let vol = line_volume(3);
        let mut params =
            ActiveParameterSet::derive(&vol, &VoxelMask::all(3), AxisParametrization::Full).unwrap();
        params.birefringence.push(0.0);
        assert!(params.validate().is_err());
    }
}
