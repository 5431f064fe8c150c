//! Cached per-lenslet voxel index mapping.
//!
//! Computing the mapping walks every ray, so it is stored as JSON and reused.
//! A missing or unreadable cache is not fatal: the mapping is recomputed from
//! the ray geometry and written next to the run's other config files.

use crate::error::Result;
use crate::render::{RayGeometry, VoxelIndexByLenslet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const CACHE_FILE_NAME: &str = "vox_indices_by_mla_idx.json";

/// Where a recomputed mapping is written for `run_dir`.
pub fn default_cache_path(run_dir: &Path) -> PathBuf {
    run_dir.join("config_parameters").join(CACHE_FILE_NAME)
}

pub fn save_voxel_index(path: &Path, index: &VoxelIndexByLenslet) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let w = BufWriter::new(File::create(path)?);
    serde_json::to_writer(w, index)?;
    Ok(())
}

pub fn load_voxel_index(path: &Path) -> Result<VoxelIndexByLenslet> {
    let r = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(r)?)
}

/// Load the mapping from `cache`, recomputing it from `geometry` on failure.
///
/// The recomputed mapping is saved to [`default_cache_path`] under `run_dir`.
/// Only a failure to save it is returned as an error.
pub fn load_or_compute(
    cache: Option<&Path>,
    geometry: &RayGeometry,
    run_dir: &Path,
) -> Result<VoxelIndexByLenslet> {
    if let Some(path) = cache {
        match load_voxel_index(path) {
            Ok(index) => {
                tracing::info!(path = %path.display(), rays = index.ray_count(), "loaded voxel indices by lenslet");
                return Ok(index);
            }
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "voxel index cache unavailable, recomputing from ray geometry"
                );
            }
        }
    } else {
        tracing::warn!("no voxel index cache given, recomputing from ray geometry");
    }

    let start = Instant::now();
    let index = geometry.voxel_indices_by_lenslet();
    let out = default_cache_path(run_dir);
    save_voxel_index(&out, &index)?;
    tracing::info!(
        path = %out.display(),
        rays = index.ray_count(),
        elapsed_s = start.elapsed().as_secs_f32(),
        "voxel indices by lenslet recomputed and saved"
    );
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OpticalConfig;
    use tempfile::tempdir;

    fn geometry() -> RayGeometry {
        RayGeometry::compute(&OpticalConfig {
            volume_shape: [2, 5, 5],
            voxel_size_um: [1.0; 3],
            pixels_per_ml: 3,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_missing_cache_is_recomputed_and_saved() {
        let dir = tempdir().unwrap();
        let geo = geometry();
        let missing = dir.path().join("nope.json");
        let index = load_or_compute(Some(&missing), &geo, dir.path()).unwrap();

        assert_eq!(index, geo.voxel_indices_by_lenslet());
        let saved = load_voxel_index(&default_cache_path(dir.path())).unwrap();
        assert_eq!(saved, index);
    }

    #[test]
    fn test_malformed_cache_falls_back() {
        let dir = tempdir().unwrap();
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        let geo = geometry();
        let index = load_or_compute(Some(&bad), &geo, dir.path()).unwrap();
        assert_eq!(index.ray_count(), geo.ray_count());
    }

    #[test]
    fn test_valid_cache_is_used_as_is() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CACHE_FILE_NAME);
        let mut index = geometry().voxel_indices_by_lenslet();
        index.lenslets.retain(|_, rays| !rays.is_empty());
        index.lenslets.values_mut().for_each(|rays| rays.truncate(1));
        save_voxel_index(&path, &index).unwrap();

        let loaded = load_or_compute(Some(&path), &geometry(), dir.path()).unwrap();
        assert_eq!(loaded, index);
        assert!(!default_cache_path(dir.path()).exists());
    }
}
