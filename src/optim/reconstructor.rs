//! The reconstruction loop.
//!
//! Owns the validated settings, the forward model, the loss and the masks.
//! `run` takes the initial guess by reference and never modifies it; all
//! optimization happens on a masked working copy held in a [`VolumeArena`].

use crate::config::{MemoryPolicy, ReconstructionSettings};
use crate::core::{BirefringentVolume, VolumeArena, VolumeView, VoxelMask};
use crate::diff::VolumeGrads;
use crate::error::{ConfigError, ReconstructionError, Result};
use crate::io::diagnostics::{render_montage, save_montage};
use crate::io::{save_volume, ResultStore};
use crate::optim::field::ImplicitField;
use crate::optim::loss::{LossEngine, MeasuredImages};
use crate::optim::scheduler::LearningRateSchedule;
use crate::optim::setup::PreparedModel;
use crate::optim::step::{LossState, OptimizationMode, OptimizationStep};
use crate::render::{ForwardModel, ImageSet, OutputMode, WeakBirefringenceTracer};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const FINAL_VOLUME_FILE: &str = "volume_final.bvol";

pub struct ReconstructionOutput {
    /// Active values scattered into a zero grid.
    pub volume: BirefringentVolume,
    pub history: Vec<LossState>,
    pub run_dir: PathBuf,
}

pub struct Reconstructor<M: ForwardModel> {
    settings: ReconstructionSettings,
    model: M,
    loss: LossEngine,
    mask: VoxelMask,
    gradient_mask: Option<VoxelMask>,
    run_dir: PathBuf,
}

impl Reconstructor<WeakBirefringenceTracer> {
    pub fn from_prepared(
        settings: ReconstructionSettings,
        prepared: PreparedModel,
        measured: MeasuredImages,
        run_dir: &Path,
    ) -> Result<Self> {
        Self::new(
            settings,
            prepared.tracer,
            measured,
            prepared.mask,
            prepared.gradient_mask,
            run_dir,
        )
    }
}

impl<M: ForwardModel> Reconstructor<M> {
    pub fn new(
        settings: ReconstructionSettings,
        model: M,
        measured: MeasuredImages,
        mask: VoxelMask,
        gradient_mask: Option<VoxelMask>,
        run_dir: &Path,
    ) -> Result<Self> {
        let (h, w) = model.image_shape();
        if measured.image_shape != (h, w) || measured.retardance.len() != h * w {
            return Err(ReconstructionError::SizeMismatch {
                what: "measured images",
                expected: h * w,
                actual: measured.retardance.len(),
            });
        }
        if measured.azimuth.len() != h * w {
            return Err(ReconstructionError::SizeMismatch {
                what: "measured azimuth image",
                expected: h * w,
                actual: measured.azimuth.len(),
            });
        }
        if let Some(gm) = &gradient_mask {
            if settings.memory == MemoryPolicy::ReleaseFullGrid {
                return Err(ConfigError::MemoryFreeWithGradientMask.into());
            }
            if gm.len() != mask.len() {
                return Err(ReconstructionError::SizeMismatch {
                    what: "gradient mask",
                    expected: mask.len(),
                    actual: gm.len(),
                });
            }
        }
        let loss = LossEngine::from_settings(&settings, measured)?;
        Ok(Self {
            settings,
            model,
            loss,
            mask,
            gradient_mask,
            run_dir: run_dir.to_path_buf(),
        })
    }

    pub fn settings(&self) -> &ReconstructionSettings {
        &self.settings
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn loss(&self) -> &LossEngine {
        &self.loss
    }

    pub fn mask(&self) -> &VoxelMask {
        &self.mask
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn build_mode(&self, arena: &mut VolumeArena, rng: &mut StdRng) -> Result<OptimizationMode> {
        Ok(match self.settings.field {
            Some(field) => {
                let net = ImplicitField::new(field.hidden_width, field.fourier_octaves, rng);
                tracing::info!(parameters = net.parameter_count(), "implicit field mode");
                let mode = OptimizationMode::implicit_field(&self.settings, net, field.lr);
                mode.project(arena.params_mut()?);
                mode
            }
            None => OptimizationMode::standard(&self.settings),
        })
    }

    /// Optimize starting from `initial` for the configured number of epochs.
    pub fn run(&self, initial: &BirefringentVolume) -> Result<ReconstructionOutput> {
        let settings = &self.settings;
        let release = settings.memory == MemoryPolicy::ReleaseFullGrid;

        let mut working = initial.clone();
        working.apply_mask(&self.mask);
        let mut arena = VolumeArena::new(working).activate(&self.mask, settings.parametrization, release)?;

        let mut rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut mode = self.build_mode(&mut arena, &mut rng)?;
        let mut schedule = LearningRateSchedule::new(&settings.schedule, mode.rates());
        let mut results = ResultStore::new(&self.run_dir, mode.has_dual_groups(), &self.loss.regularizer_names())?;
        let mut grads = VolumeGrads::zeros(arena.params()?.len());

        let step = OptimizationStep {
            model: &self.model,
            loss: &self.loss,
            gradient_mask: self.gradient_mask.as_ref(),
            release_buffers: release,
            clip_grad_norm: settings.clip_grad_norm,
        };

        tracing::info!(
            active = arena.params()?.len(),
            voxels = self.mask.len(),
            epochs = settings.n_epochs,
            rule = ?settings.rule,
            dual_groups = mode.has_dual_groups(),
            run_dir = %self.run_dir.display(),
            "starting reconstruction"
        );

        let start = Instant::now();
        for epoch in 1..=settings.n_epochs {
            let state = step.run(
                epoch,
                arena.params_mut()?,
                &mut mode,
                &mut schedule,
                &mut grads,
                &mut results,
                &mut rng,
            )?;

            if epoch % settings.save_freq == 0 {
                self.checkpoint(epoch, &arena, &mode, &mut results)?;
                tracing::info!(
                    epoch,
                    total = state.total,
                    data = state.data_term,
                    reg = state.reg_term,
                    lr = ?state.learning_rates,
                    elapsed_s = start.elapsed().as_secs_f32(),
                    "checkpoint"
                );
            }
        }

        let volume = arena.scatter()?.into_volume()?;
        save_volume(
            self.run_dir.join(FINAL_VOLUME_FILE),
            &volume,
            &format!("Final volume after {} iterations", settings.n_epochs),
        )?;
        results.flush_losses()?;
        tracing::info!(
            epochs = settings.n_epochs,
            final_loss = results.last().map(|s| s.total),
            elapsed_s = start.elapsed().as_secs_f32(),
            "reconstruction finished"
        );

        Ok(ReconstructionOutput {
            volume,
            history: results.into_history(),
            run_dir: self.run_dir.clone(),
        })
    }

    fn checkpoint(
        &self,
        epoch: usize,
        arena: &VolumeArena,
        mode: &OptimizationMode,
        results: &mut ResultStore,
    ) -> Result<()> {
        let volume = arena.materialize()?;
        results.save_volume_checkpoint(epoch, &volume)?;
        results.flush_losses()?;
        results.write_regularization_row(epoch)?;

        if self.settings.diagnostic_montage {
            let predicted = self
                .model
                .forward(VolumeView::Active(arena.params()?), OutputMode::RetardanceAzimuth)?;
            if let ImageSet::RetardanceAzimuth { retardance, azimuth } = predicted {
                let mip_shape = (volume.shape.y, volume.shape.x);
                let montage = render_montage(
                    self.loss.measured(),
                    &retardance,
                    &azimuth,
                    &volume.birefringence_mip(),
                    mip_shape,
                );
                save_montage(&self.run_dir, epoch, &montage)?;
            }
        }

        if let Some(field) = mode.field() {
            field.save_json(&self.run_dir.join(format!("field_ep_{epoch:04}.json")))?;
        }
        Ok(())
    }
}
