//! Owned lifecycle of the working volume during a reconstruction run.
//!
//! ```text
//! Full ──activate──▶ ActiveOnly ──scatter──▶ Scattered
//! ```
//!
//! Each operation states the stage it requires and fails with
//! [`ReconstructionError::StageMismatch`] otherwise.

use crate::core::active::{ActiveParameterSet, AxisParametrization};
use crate::core::mask::VoxelMask;
use crate::core::volume::BirefringentVolume;
use crate::error::{ReconstructionError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeStage {
    Full,
    ActiveOnly,
    Scattered,
}

#[derive(Debug)]
pub enum VolumeArena {
    /// Full-grid volume, not yet reduced to active parameters.
    Full(BirefringentVolume),
    /// Trainable active parameters. The full grid is kept as a read-only
    /// snapshot unless it was released to save memory.
    ActiveOnly {
        snapshot: Option<BirefringentVolume>,
        params: ActiveParameterSet,
    },
    /// Final full-grid volume after scattering the active parameters back.
    Scattered(BirefringentVolume),
}

impl VolumeArena {
    pub fn new(volume: BirefringentVolume) -> Self {
        VolumeArena::Full(volume)
    }

    pub fn stage(&self) -> VolumeStage {
        match self {
            VolumeArena::Full(_) => VolumeStage::Full,
            VolumeArena::ActiveOnly { .. } => VolumeStage::ActiveOnly,
            VolumeArena::Scattered(_) => VolumeStage::Scattered,
        }
    }

    fn mismatch(&self, operation: &'static str, required: VolumeStage) -> ReconstructionError {
        ReconstructionError::StageMismatch {
            operation,
            required,
            actual: self.stage(),
        }
    }

    /// Derive the active parameter set. With `release_full_grid` the
    /// full-grid buffers are dropped and cannot be recovered before scatter.
    pub fn activate(
        self,
        mask: &VoxelMask,
        parametrization: AxisParametrization,
        release_full_grid: bool,
    ) -> Result<Self> {
        match self {
            VolumeArena::Full(volume) => {
                let mut params = ActiveParameterSet::derive(&volume, mask, parametrization)?;
                params.project_onto_sphere();
                let snapshot = (!release_full_grid).then_some(volume);
                Ok(VolumeArena::ActiveOnly { snapshot, params })
            }
            other => Err(other.mismatch("activate", VolumeStage::Full)),
        }
    }

    /// Scatter active values into a zero volume; inactive voxels end up zero.
    pub fn scatter(self) -> Result<Self> {
        match self {
            VolumeArena::ActiveOnly { params, .. } => Ok(VolumeArena::Scattered(params.scatter()?)),
            other => Err(other.mismatch("scatter", VolumeStage::ActiveOnly)),
        }
    }

    pub fn params(&self) -> Result<&ActiveParameterSet> {
        match self {
            VolumeArena::ActiveOnly { params, .. } => Ok(params),
            other => Err(other.mismatch("read active parameters", VolumeStage::ActiveOnly)),
        }
    }

    pub fn params_mut(&mut self) -> Result<&mut ActiveParameterSet> {
        if let VolumeArena::ActiveOnly { params, .. } = self {
            return Ok(params);
        }
        Err(self.mismatch("update active parameters", VolumeStage::ActiveOnly))
    }

    pub fn snapshot(&self) -> Option<&BirefringentVolume> {
        match self {
            VolumeArena::ActiveOnly { snapshot, .. } => snapshot.as_ref(),
            _ => None,
        }
    }

    /// Full-grid view of the current state, used for checkpoints.
    ///
    /// In the active stage the active values are written over the snapshot
    /// when one is kept, or over zeros when the full grid was released.
    pub fn materialize(&self) -> Result<BirefringentVolume> {
        match self {
            VolumeArena::Full(volume) | VolumeArena::Scattered(volume) => Ok(volume.clone()),
            VolumeArena::ActiveOnly { snapshot: Some(base), params } => {
                let mut volume = base.clone();
                params.scatter_into(&mut volume)?;
                Ok(volume)
            }
            VolumeArena::ActiveOnly { snapshot: None, params } => params.scatter(),
        }
    }

    pub fn into_volume(self) -> Result<BirefringentVolume> {
        match self {
            VolumeArena::Scattered(volume) => Ok(volume),
            other => Err(other.mismatch("take final volume", VolumeStage::Scattered)),
        }
    }
}
