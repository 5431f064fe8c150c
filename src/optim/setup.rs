//! Forward-model and mask preparation before the first iteration.
//!
//! Mask sources, in order of preference:
//! 1. a mask cached on a saved ray geometry,
//! 2. all rays at once: voxels on rays with nonzero measured retardance,
//! 3. per lenslet: the cached (or recomputed) voxel index mapping minus the
//!    voxels excluded by the zero-retardance policy.
//!
//! The gradient mask is read from a mask file when one is configured, or
//! otherwise taken from the voxels on nonzero-retardance rays. It matters
//! when the activation mask is wider than that, as with a stored mask or the
//! reachability fallback.

use crate::config::{OpticalConfig, ReconstructionSettings};
use crate::core::VoxelMask;
use crate::error::{ReconstructionError, Result};
use crate::io::voxel_index_cache::load_or_compute;
use crate::io::CONFIG_DIR;
use crate::optim::MeasuredImages;
use crate::render::{RayGeometry, WeakBirefringenceTracer};
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const RAYS_FILE_NAME: &str = "rays.json";

/// Tracer plus the masks derived from its geometry.
pub struct PreparedModel {
    pub tracer: WeakBirefringenceTracer,
    /// Voxels that take part in the optimization.
    pub mask: VoxelMask,
    /// Voxels allowed to receive gradient updates, when requested.
    pub gradient_mask: Option<VoxelMask>,
}

/// Single-channel radiometry image as `f32` values.
pub fn load_radiometry(path: &Path, pixel_count: usize) -> Result<Vec<f32>> {
    let values = image::open(path)?.to_luma32f().into_raw();
    if values.len() != pixel_count {
        return Err(ReconstructionError::SizeMismatch {
            what: "radiometry image",
            expected: pixel_count,
            actual: values.len(),
        });
    }
    Ok(values)
}

/// Voxel mask stored as JSON.
pub fn load_mask(path: &Path, voxel_count: usize) -> Result<VoxelMask> {
    let file = std::io::BufReader::new(std::fs::File::open(path)?);
    let mask: VoxelMask = serde_json::from_reader(file)?;
    if mask.len() != voxel_count {
        return Err(ReconstructionError::SizeMismatch {
            what: "gradient mask file",
            expected: voxel_count,
            actual: mask.len(),
        });
    }
    Ok(mask)
}

fn build_gradient_mask(
    geometry: &RayGeometry,
    settings: &ReconstructionSettings,
    measured: &MeasuredImages,
    mask: &VoxelMask,
) -> Result<Option<VoxelMask>> {
    if !settings.gradient_mask {
        return Ok(None);
    }
    let gradient_mask = match &settings.rays.gradient_mask_path {
        Some(path) => load_mask(path, mask.len())?,
        None if measured.max_retardance() == 0.0 => {
            tracing::warn!("measured retardance is zero everywhere, gradient mask disabled");
            return Ok(None);
        }
        None => VoxelMask::from_nonzero_retardance(geometry, &measured.retardance),
    };
    let frozen = mask
        .iter()
        .zip(gradient_mask.iter())
        .filter(|&(active, allowed)| active && !allowed)
        .count();
    tracing::info!(
        allowed = gradient_mask.count_active(),
        frozen_active = frozen,
        "gradient mask built"
    );
    Ok(Some(gradient_mask))
}

fn load_or_compute_geometry(optics: &OpticalConfig, saved: Option<&PathBuf>) -> Result<RayGeometry> {
    match saved {
        Some(path) => {
            let geometry = RayGeometry::load_json(path)?;
            tracing::info!(path = %path.display(), rays = geometry.ray_count(), "loaded saved rays");
            Ok(geometry)
        }
        None => RayGeometry::compute(optics),
    }
}

fn build_mask(
    geometry: &mut RayGeometry,
    settings: &ReconstructionSettings,
    measured: &MeasuredImages,
    run_dir: &Path,
) -> Result<VoxelMask> {
    let voxel_count = geometry.volume_shape.voxel_count();
    if let Some(mask) = geometry.mask.take() {
        if mask.len() == voxel_count {
            tracing::info!(active = mask.count_active(), "using mask stored with the rays");
            return Ok(mask);
        }
        tracing::warn!(
            stored = mask.len(),
            expected = voxel_count,
            "stored mask does not match the volume, rebuilding"
        );
    }

    if measured.max_retardance() == 0.0 {
        tracing::warn!("measured retardance is zero everywhere, masking by ray reachability");
        return Ok(VoxelMask::reachable(geometry));
    }

    let rays = &settings.rays;
    let start = Instant::now();
    let mask = if rays.all_rays_at_once {
        geometry.prepare_all_rays_at_once();
        if let (Some(path), false) = (&rays.radiometry_path, rays.from_simulation) {
            let radiometry = load_radiometry(path, geometry.pixel_count())?;
            geometry.filter_from_radiometry(&radiometry);
        }
        VoxelMask::from_nonzero_retardance(geometry, &measured.retardance)
    } else {
        let index = load_or_compute(rays.vox_indices_path.as_deref(), geometry, run_dir)?;
        VoxelMask::from_lenslet_voxels(voxel_count, &index, &measured.retardance, rays.exclusion)
    };
    tracing::info!(
        active = mask.count_active(),
        total = voxel_count,
        all_rays_at_once = rays.all_rays_at_once,
        elapsed_s = start.elapsed().as_secs_f32(),
        "voxel mask built"
    );
    Ok(mask)
}

/// Build the tracer and masks for a run whose outputs go to `run_dir`.
pub fn prepare_model(
    optics: &OpticalConfig,
    settings: &ReconstructionSettings,
    measured: &MeasuredImages,
    run_dir: &Path,
) -> Result<PreparedModel> {
    let rays = &settings.rays;
    let mut geometry = load_or_compute_geometry(optics, rays.saved_ray_path.as_ref())?;
    if geometry.image_shape != measured.image_shape {
        return Err(ReconstructionError::SizeMismatch {
            what: "measured image pixels",
            expected: geometry.pixel_count(),
            actual: measured.image_shape.0 * measured.image_shape.1,
        });
    }

    if rays.omit_rays_based_on_pixels {
        geometry.retain_rays_with_nonzero(&measured.retardance);
    }

    let mask = build_mask(&mut geometry, settings, measured, run_dir)?;
    let gradient_mask = build_gradient_mask(&geometry, settings, measured, &mask)?;
    geometry.mask = Some(mask.clone());

    if rays.save_rays {
        let path = run_dir.join(CONFIG_DIR).join(RAYS_FILE_NAME);
        geometry.save_json(&path)?;
        tracing::info!(path = %path.display(), "rays saved");
    }

    Ok(PreparedModel {
        tracer: WeakBirefringenceTracer::new(geometry, optics.wavelength, &optics.analyzer_angles_deg),
        mask,
        gradient_mask,
    })
}
