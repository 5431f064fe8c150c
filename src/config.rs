//! Run configuration.
//!
//! `OpticalConfig` and `IterationConfig` are the user-facing, serde-loadable
//! dictionaries. `ReconstructionSettings` is the validated, immutable form
//! handed to every component: strings are parsed into tagged enums once, and
//! contradictory combinations are rejected before any iteration runs.

use crate::core::{AxisParametrization, ZeroRetardanceExclusion};
use crate::error::ConfigError;
use crate::optim::{DataFidelity, Regularizer, UpdateRule};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Microscope and volume geometry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpticalConfig {
    /// Wavelength in micrometers.
    pub wavelength: f32,
    /// Voxel grid `[z, y, x]`.
    pub volume_shape: [usize; 3],
    /// Voxel edge lengths in micrometers `[z, y, x]`.
    pub voxel_size_um: [f32; 3],
    /// Pixels along each side of one micro-lens image.
    pub pixels_per_ml: usize,
    /// Micro-lenses along each side of the array.
    pub n_micro_lenses: usize,
    pub na_obj: f32,
    pub n_medium: f32,
    /// Polarization analyzer angles used in intensity mode.
    pub analyzer_angles_deg: Vec<f32>,
}

impl Default for OpticalConfig {
    fn default() -> Self {
        Self {
            wavelength: 0.55,
            volume_shape: [5, 11, 11],
            voxel_size_um: [1.15, 1.15, 1.15],
            pixels_per_ml: 17,
            n_micro_lenses: 1,
            na_obj: 1.2,
            n_medium: 1.35,
            analyzer_angles_deg: vec![0.0, 45.0, 90.0, 135.0],
        }
    }
}

impl OpticalConfig {
    /// Measured image size `(height, width)` in pixels.
    pub fn image_shape(&self) -> (usize, usize) {
        let side = self.pixels_per_ml * self.n_micro_lenses;
        (side, side)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.wavelength > 0.0) {
            return Err(invalid("wavelength", "must be positive"));
        }
        if self.volume_shape.iter().any(|&d| d == 0) {
            return Err(invalid("volume_shape", "every dimension must be at least 1"));
        }
        if self.voxel_size_um.iter().any(|&s| !(s > 0.0)) {
            return Err(invalid("voxel_size_um", "must be positive"));
        }
        if self.pixels_per_ml == 0 || self.n_micro_lenses == 0 {
            return Err(invalid("pixels_per_ml", "lenslet grid must not be empty"));
        }
        if !(self.na_obj > 0.0) || self.na_obj >= self.n_medium {
            return Err(invalid("na_obj", "must be positive and below n_medium"));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Either one weight or a list of which the first entry is used.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegularizationWeight {
    Scalar(f32),
    List(Vec<f32>),
}

impl RegularizationWeight {
    pub fn value(&self) -> Option<f32> {
        match self {
            RegularizationWeight::Scalar(w) => Some(*w),
            RegularizationWeight::List(ws) => ws.first().copied(),
        }
    }
}

/// Optimization options, as written in an iteration-parameter file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationConfig {
    pub optimizer: String,
    pub lr_optic_axis: f32,
    pub lr_birefringence: f32,
    pub optax_betas: (f32, f32),
    pub bir_betas: (f32, f32),
    pub n_epochs: usize,
    pub regularization_weight: RegularizationWeight,
    /// `(name, weight)` pairs.
    pub regularization_fcns: Vec<(String, f32)>,
    pub datafidelity: String,
    pub normalize_retardance: bool,
    pub save_freq: usize,
    pub nerf_mode: bool,
    pub lr_nerf: f32,
    pub nerf_hidden_width: usize,
    pub nerf_fourier_octaves: usize,
    pub two_optic_axis_components: bool,
    pub free_memory_by_del_large_arrays: bool,
    pub apply_volume_mask: bool,
    pub omit_rays_based_on_pixels: bool,
    pub mla_rays_at_once: bool,
    pub from_simulation: bool,
    pub save_rays: bool,
    pub saved_ray_path: Option<PathBuf>,
    pub vox_indices_by_mla_idx_path: Option<PathBuf>,
    pub radiometry_path: Option<PathBuf>,
    /// JSON voxel mask restricting gradient updates (with `apply_volume_mask`).
    pub gradient_mask_path: Option<PathBuf>,
    /// Rescale all gradients so their joint L2 norm does not exceed this.
    pub clip_grad_norm: Option<f32>,
    pub warmup_epochs: usize,
    pub warmup_start_proportion: f32,
    pub plateau_patience: usize,
    pub plateau_threshold: f32,
    pub plateau_factor: f32,
    pub min_lr: f32,
    pub diagnostic_montage: bool,
    pub seed: Option<u64>,
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            optimizer: "Nadam".to_string(),
            lr_optic_axis: 1e-3,
            lr_birefringence: 1e-4,
            optax_betas: (0.9, 0.999),
            bir_betas: (0.9, 0.999),
            n_epochs: 100,
            regularization_weight: RegularizationWeight::Scalar(1.0),
            regularization_fcns: Vec::new(),
            datafidelity: "vector".to_string(),
            normalize_retardance: false,
            save_freq: 5,
            nerf_mode: false,
            lr_nerf: 1e-3,
            nerf_hidden_width: 32,
            nerf_fourier_octaves: 3,
            two_optic_axis_components: false,
            free_memory_by_del_large_arrays: false,
            apply_volume_mask: false,
            omit_rays_based_on_pixels: false,
            mla_rays_at_once: false,
            from_simulation: false,
            save_rays: false,
            saved_ray_path: None,
            vox_indices_by_mla_idx_path: None,
            radiometry_path: None,
            gradient_mask_path: None,
            clip_grad_norm: None,
            warmup_epochs: 10,
            warmup_start_proportion: 0.1,
            plateau_patience: 10,
            plateau_threshold: 1e-4,
            plateau_factor: 0.5,
            min_lr: 1e-6,
            diagnostic_montage: true,
            seed: None,
        }
    }
}

impl IterationConfig {
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// What happens to the full-grid buffers once the active set exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryPolicy {
    /// Keep the full grid as a read-only snapshot.
    Retain,
    /// Drop the full grid; it is rebuilt from zeros at scatter time.
    ReleaseFullGrid,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LearningRates {
    pub optic_axis: f32,
    pub birefringence: f32,
    pub optic_axis_betas: (f32, f32),
    pub birefringence_betas: (f32, f32),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScheduleSettings {
    pub warmup_epochs: usize,
    pub warmup_start_proportion: f32,
    pub plateau_patience: usize,
    pub plateau_threshold: f32,
    pub plateau_factor: f32,
    pub min_lr: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FieldSettings {
    pub lr: f32,
    pub hidden_width: usize,
    pub fourier_octaves: usize,
}

/// Ray and mask preparation options.
#[derive(Clone, Debug, PartialEq)]
pub struct RaySettings {
    pub omit_rays_based_on_pixels: bool,
    pub all_rays_at_once: bool,
    pub exclusion: ZeroRetardanceExclusion,
    pub from_simulation: bool,
    pub save_rays: bool,
    pub saved_ray_path: Option<PathBuf>,
    pub vox_indices_path: Option<PathBuf>,
    pub radiometry_path: Option<PathBuf>,
    pub gradient_mask_path: Option<PathBuf>,
}

/// Validated, immutable run configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconstructionSettings {
    pub rule: UpdateRule,
    pub learning_rates: LearningRates,
    pub n_epochs: usize,
    pub regularization_weight: f32,
    pub regularizers: Vec<(Regularizer, f32)>,
    pub data_fidelity: DataFidelity,
    pub normalize_retardance: bool,
    pub save_freq: usize,
    /// `Some` selects implicit-field mode.
    pub field: Option<FieldSettings>,
    pub parametrization: AxisParametrization,
    pub memory: MemoryPolicy,
    /// Zero volume gradients outside the mask before each update.
    pub gradient_mask: bool,
    pub clip_grad_norm: Option<f32>,
    pub rays: RaySettings,
    pub schedule: ScheduleSettings,
    pub diagnostic_montage: bool,
    pub seed: Option<u64>,
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

fn check_lr(field: &'static str, lr: f32) -> Result<(), ConfigError> {
    if lr.is_finite() && lr > 0.0 {
        Ok(())
    } else {
        Err(invalid(field, format!("learning rate must be positive, got {lr}")))
    }
}

fn check_betas(field: &'static str, (b1, b2): (f32, f32)) -> Result<(), ConfigError> {
    if (0.0..1.0).contains(&b1) && (0.0..1.0).contains(&b2) {
        Ok(())
    } else {
        Err(invalid(field, format!("betas must lie in [0, 1), got ({b1}, {b2})")))
    }
}

impl ReconstructionSettings {
    pub fn from_config(config: &IterationConfig) -> Result<Self, ConfigError> {
        let rule: UpdateRule = config.optimizer.parse()?;

        if config.free_memory_by_del_large_arrays && config.apply_volume_mask {
            return Err(ConfigError::MemoryFreeWithGradientMask);
        }

        check_lr("lr_optic_axis", config.lr_optic_axis)?;
        check_lr("lr_birefringence", config.lr_birefringence)?;
        check_betas("optax_betas", config.optax_betas)?;
        check_betas("bir_betas", config.bir_betas)?;

        let regularization_weight = config
            .regularization_weight
            .value()
            .ok_or_else(|| invalid("regularization_weight", "list is empty"))?;
        if !regularization_weight.is_finite() {
            return Err(invalid("regularization_weight", "must be finite"));
        }

        let regularizers = config
            .regularization_fcns
            .iter()
            .map(|(name, weight)| Ok((name.parse::<Regularizer>()?, *weight)))
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let data_fidelity: DataFidelity = config.datafidelity.parse()?;

        if config.save_freq == 0 {
            return Err(invalid("save_freq", "must be at least 1"));
        }
        if !(config.warmup_start_proportion > 0.0 && config.warmup_start_proportion <= 1.0) {
            return Err(invalid("warmup_start_proportion", "must lie in (0, 1]"));
        }
        if !(config.plateau_factor > 0.0 && config.plateau_factor < 1.0) {
            return Err(invalid("plateau_factor", "must lie in (0, 1)"));
        }
        if !(config.min_lr >= 0.0) {
            return Err(invalid("min_lr", "must be non-negative"));
        }
        if let Some(max_norm) = config.clip_grad_norm {
            if !(max_norm.is_finite() && max_norm > 0.0) {
                return Err(invalid("clip_grad_norm", format!("must be positive, got {max_norm}")));
            }
        }

        let field = if config.nerf_mode {
            check_lr("lr_nerf", config.lr_nerf)?;
            if config.nerf_hidden_width == 0 {
                return Err(invalid("nerf_hidden_width", "must be at least 1"));
            }
            Some(FieldSettings {
                lr: config.lr_nerf,
                hidden_width: config.nerf_hidden_width,
                fourier_octaves: config.nerf_fourier_octaves,
            })
        } else {
            None
        };

        Ok(Self {
            rule,
            learning_rates: LearningRates {
                optic_axis: config.lr_optic_axis,
                birefringence: config.lr_birefringence,
                optic_axis_betas: config.optax_betas,
                birefringence_betas: config.bir_betas,
            },
            n_epochs: config.n_epochs,
            regularization_weight,
            regularizers,
            data_fidelity,
            normalize_retardance: config.normalize_retardance,
            save_freq: config.save_freq,
            field,
            parametrization: if config.two_optic_axis_components {
                AxisParametrization::TwoComponent
            } else {
                AxisParametrization::Full
            },
            memory: if config.free_memory_by_del_large_arrays {
                MemoryPolicy::ReleaseFullGrid
            } else {
                MemoryPolicy::Retain
            },
            gradient_mask: config.apply_volume_mask,
            clip_grad_norm: config.clip_grad_norm,
            rays: RaySettings {
                omit_rays_based_on_pixels: config.omit_rays_based_on_pixels,
                all_rays_at_once: config.mla_rays_at_once,
                exclusion: ZeroRetardanceExclusion::for_data(config.from_simulation),
                from_simulation: config.from_simulation,
                save_rays: config.save_rays,
                saved_ray_path: config.saved_ray_path.clone(),
                vox_indices_path: config.vox_indices_by_mla_idx_path.clone(),
                radiometry_path: config.radiometry_path.clone(),
                gradient_mask_path: config.gradient_mask_path.clone(),
            },
            schedule: ScheduleSettings {
                warmup_epochs: config.warmup_epochs,
                warmup_start_proportion: config.warmup_start_proportion,
                plateau_patience: config.plateau_patience,
                plateau_threshold: config.plateau_threshold,
                plateau_factor: config.plateau_factor,
                min_lr: config.min_lr,
            },
            diagnostic_montage: config.diagnostic_montage,
            seed: config.seed,
        })
    }
}
