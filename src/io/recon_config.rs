//! Everything needed to restart a reconstruction, stored in one directory.
//!
//! ```text
//! <dir>/config_parameters/
//!   optical_info.json
//!   iteration_params.json
//!   measured_images.json
//!   initial_volume.bvol
//!   gt_volume.bvol          (only when a ground truth exists)
//! ```

use crate::config::{IterationConfig, OpticalConfig};
use crate::core::BirefringentVolume;
use crate::error::Result;
use crate::io::volume_file::{load_volume, save_volume};
use crate::optim::MeasuredImages;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

pub const CONFIG_DIR: &str = "config_parameters";

#[derive(Clone, Debug)]
pub struct ReconstructionConfig {
    pub optical: OpticalConfig,
    pub iteration: IterationConfig,
    pub measured: MeasuredImages,
    pub initial_volume: BirefringentVolume,
    /// Only used for diagnostics.
    pub gt_volume: Option<BirefringentVolume>,
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let w = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(w, value)?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let r = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(r)?)
}

impl ReconstructionConfig {
    pub fn config_dir(dir: &Path) -> PathBuf {
        dir.join(CONFIG_DIR)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let cfg = Self::config_dir(dir);
        std::fs::create_dir_all(&cfg)?;
        write_json(&cfg.join("optical_info.json"), &self.optical)?;
        write_json(&cfg.join("iteration_params.json"), &self.iteration)?;
        write_json(&cfg.join("measured_images.json"), &self.measured)?;
        save_volume(cfg.join("initial_volume.bvol"), &self.initial_volume, "initial guess")?;
        if let Some(gt) = &self.gt_volume {
            save_volume(cfg.join("gt_volume.bvol"), gt, "ground truth")?;
        }
        tracing::info!(dir = %cfg.display(), "reconstruction config saved");
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let cfg = Self::config_dir(dir);
        let gt_path = cfg.join("gt_volume.bvol");
        let gt_volume = if gt_path.exists() {
            Some(load_volume(&gt_path)?.0)
        } else {
            None
        };
        Ok(Self {
            optical: read_json(&cfg.join("optical_info.json"))?,
            iteration: read_json(&cfg.join("iteration_params.json"))?,
            measured: read_json(&cfg.join("measured_images.json"))?,
            initial_volume: load_volume(cfg.join("initial_volume.bvol"))?.0,
            gt_volume,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::VolumeShape;
    use nalgebra::Vector3;
    use tempfile::tempdir;

    fn config(with_gt: bool) -> ReconstructionConfig {
        let shape = VolumeShape::new(1, 2, 2);
        ReconstructionConfig {
            optical: OpticalConfig::default(),
            iteration: IterationConfig {
                n_epochs: 3,
                ..Default::default()
            },
            measured: MeasuredImages {
                image_shape: (1, 2),
                retardance: vec![0.1, 0.0],
                azimuth: vec![0.5, 0.0],
                intensity: None,
            },
            initial_volume: BirefringentVolume::uniform(shape, [1.0; 3], 0.01, Vector3::new(0.0, 1.0, 0.0)),
            gt_volume: with_gt.then(|| BirefringentVolume::zeros(shape, [1.0; 3])),
        }
    }

    #[test]
    fn test_save_then_load_restores_everything() {
        let dir = tempdir().unwrap();
        let original = config(true);
        original.save(dir.path()).unwrap();

        let loaded = ReconstructionConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.optical, original.optical);
        assert_eq!(loaded.iteration, original.iteration);
        assert_eq!(loaded.measured, original.measured);
        assert_eq!(loaded.initial_volume, original.initial_volume);
        assert_eq!(loaded.gt_volume, original.gt_volume);
    }

    #[test]
    fn test_ground_truth_is_optional() {
        let dir = tempdir().unwrap();
        config(false).save(dir.path()).unwrap();
        assert!(!ReconstructionConfig::config_dir(dir.path()).join("gt_volume.bvol").exists());
        assert!(ReconstructionConfig::load(dir.path()).unwrap().gt_volume.is_none());
    }
}
