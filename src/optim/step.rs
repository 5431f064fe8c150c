//! One optimization iteration.
//!
//! ```text
//! ZeroGrad → Forward → LossCompute → Backward → GradientMask
//!          → ParamUpdate → SchedulerStep → ConstraintProject → ResultAppend
//! ```
//!
//! Nothing but the parameters, optimizer state, schedule and result history
//! carries over between iterations.

use crate::config::ReconstructionSettings;
use crate::core::{ActiveParameterSet, VolumeView, VoxelMask};
use crate::diff::axis_grad::planar_grad;
use crate::diff::VolumeGrads;
use crate::error::{ReconstructionError, Result};
use crate::io::ResultStore;
use crate::optim::field::ImplicitField;
use crate::optim::loss::LossEngine;
use crate::optim::optimizer::ParamGroup;
use crate::optim::scheduler::LearningRateSchedule;
use crate::render::ForwardModel;
use nalgebra::Vector2;
use rand::Rng;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepPhase {
    ZeroGrad,
    Forward,
    LossCompute,
    Backward,
    GradientMask,
    ParamUpdate,
    SchedulerStep,
    ConstraintProject,
    ResultAppend,
}

/// How the active parameters are produced and which groups are optimized.
#[derive(Clone, Debug)]
pub enum OptimizationMode {
    /// Optic axes and birefringence trained directly, each with its own group.
    Standard {
        axis_group: ParamGroup,
        birefringence_group: ParamGroup,
    },
    /// A coordinate network predicts the active parameters; its weights form
    /// the only group.
    ImplicitField {
        field: ImplicitField,
        group: ParamGroup,
    },
}

impl OptimizationMode {
    pub fn standard(settings: &ReconstructionSettings) -> Self {
        let lr = &settings.learning_rates;
        OptimizationMode::Standard {
            axis_group: ParamGroup::new("optic_axis", settings.rule, lr.optic_axis, lr.optic_axis_betas),
            birefringence_group: ParamGroup::new(
                "birefringence",
                settings.rule,
                lr.birefringence,
                lr.birefringence_betas,
            ),
        }
    }

    pub fn implicit_field(settings: &ReconstructionSettings, field: ImplicitField, lr: f32) -> Self {
        OptimizationMode::ImplicitField {
            field,
            group: ParamGroup::new("field", settings.rule, lr, settings.learning_rates.optic_axis_betas),
        }
    }

    /// Two parameter groups (optic axis, birefringence) rather than one.
    pub fn has_dual_groups(&self) -> bool {
        matches!(self, OptimizationMode::Standard { .. })
    }

    pub fn rates(&self) -> Vec<f32> {
        match self {
            OptimizationMode::Standard {
                axis_group,
                birefringence_group,
            } => vec![axis_group.lr, birefringence_group.lr],
            OptimizationMode::ImplicitField { group, .. } => vec![group.lr],
        }
    }

    pub fn set_rates(&mut self, rates: &[f32]) {
        match self {
            OptimizationMode::Standard {
                axis_group,
                birefringence_group,
            } => {
                if let [axis, bir, ..] = rates {
                    axis_group.lr = *axis;
                    birefringence_group.lr = *bir;
                }
            }
            OptimizationMode::ImplicitField { group, .. } => {
                if let Some(&lr) = rates.first() {
                    group.lr = lr;
                }
            }
        }
    }

    pub fn adjusted_rates(&self) -> Vec<f32> {
        match self {
            OptimizationMode::Standard {
                axis_group,
                birefringence_group,
            } => vec![axis_group.adjusted_lr(), birefringence_group.adjusted_lr()],
            OptimizationMode::ImplicitField { group, .. } => vec![group.adjusted_lr()],
        }
    }

    pub fn field(&self) -> Option<&ImplicitField> {
        match self {
            OptimizationMode::ImplicitField { field, .. } => Some(field),
            OptimizationMode::Standard { .. } => None,
        }
    }

    /// Bring the active parameters in line with the mode's constraints.
    pub fn project(&self, params: &mut ActiveParameterSet) {
        match self {
            OptimizationMode::Standard { .. } => params.project_onto_sphere(),
            OptimizationMode::ImplicitField { field, .. } => field.predict_into(params),
        }
    }
}

/// Scalar record of one completed iteration.
#[derive(Clone, Debug, PartialEq)]
pub struct LossState {
    pub epoch: usize,
    pub total: f32,
    pub data_term: f32,
    pub reg_term: f32,
    pub reg_values: Vec<f32>,
    /// Per-group adjusted learning rates.
    pub learning_rates: Vec<f32>,
}

/// Borrowed collaborators of an iteration.
pub struct OptimizationStep<'a> {
    pub model: &'a dyn ForwardModel,
    pub loss: &'a LossEngine,
    /// Voxel-level gradient mask, distinct from the activation mask.
    pub gradient_mask: Option<&'a VoxelMask>,
    /// Free gradient buffers instead of zeroing them in place.
    pub release_buffers: bool,
    /// Upper bound on the joint L2 norm of the gradients fed to the update.
    pub clip_grad_norm: Option<f32>,
}

fn recover_axes<R: Rng + ?Sized>(
    params: &mut ActiveParameterSet,
    rng: &mut R,
    epoch: usize,
    phase: StepPhase,
) -> Vec<usize> {
    let replaced = params.recover_non_finite_axes(rng);
    if !replaced.is_empty() {
        tracing::warn!(
            epoch,
            ?phase,
            count = replaced.len(),
            "replaced non-finite optic axes with random unit vectors"
        );
    }
    replaced
}

impl OptimizationStep<'_> {
    #[allow(clippy::too_many_arguments)]
    pub fn run<R: Rng + ?Sized>(
        &self,
        epoch: usize,
        params: &mut ActiveParameterSet,
        mode: &mut OptimizationMode,
        schedule: &mut LearningRateSchedule,
        grads: &mut VolumeGrads,
        results: &mut ResultStore,
        rng: &mut R,
    ) -> Result<LossState> {
        // ZeroGrad
        grads.reset(params.len(), self.release_buffers);
        mode.set_rates(&schedule.rates_for(epoch));

        // Forward. Axes that went non-finite since the last step are replaced
        // first so they cannot poison the whole image.
        recover_axes(params, rng, epoch, StepPhase::Forward);
        let images = self
            .model
            .forward(VolumeView::Active(params), self.loss.output_mode())?;

        // LossCompute
        let (breakdown, d_images) = self.loss.compute_with_grads(&images, params, grads)?;

        // Backward
        self.model
            .backward(VolumeView::Active(params), &d_images, grads)?;
        if let Some(what) = grads.first_non_finite() {
            return Err(ReconstructionError::NonFiniteGradient {
                what,
                phase: StepPhase::Backward,
                epoch,
            });
        }

        // GradientMask
        if let Some(mask) = self.gradient_mask {
            let outside: Vec<usize> = params
                .indices()
                .iter()
                .enumerate()
                .filter_map(|(pos, &voxel)| (!mask.is_active(voxel)).then_some(pos))
                .collect();
            grads.zero_slots(&outside);
        }

        // Clipping acts on what the update rule sees: the volume gradients in
        // standard mode, the network weight gradients in field mode.
        let log_clip = |norm: Option<f32>| {
            if let Some(norm) = norm {
                tracing::debug!(epoch, norm, "gradients clipped");
            }
        };
        if let (Some(max_norm), OptimizationMode::Standard { .. }) = (self.clip_grad_norm, &*mode) {
            log_clip(grads.clip_norm(max_norm));
        }

        // ParamUpdate
        match mode {
            OptimizationMode::Standard {
                axis_group,
                birefringence_group,
            } => {
                match params.planar.as_mut() {
                    Some(planar) => {
                        let planar_grads: Vec<Vector2<f32>> = planar
                            .iter()
                            .zip(&grads.optic_axis)
                            .map(|(p, g)| planar_grad(p, g))
                            .collect();
                        axis_group.step_vectors(planar, &planar_grads);
                    }
                    None => axis_group.step_vectors(&mut params.optic_axis, &grads.optic_axis),
                }
                birefringence_group.step(&mut params.birefringence, &grads.birefringence);
            }
            OptimizationMode::ImplicitField { field, group } => {
                let mut field_grads = field.backward(params, grads);
                if let Some(max_norm) = self.clip_grad_norm {
                    log_clip(field_grads.clip_norm(max_norm));
                }
                if field_grads.has_non_finite() {
                    return Err(ReconstructionError::NonFiniteGradient {
                        what: "implicit field",
                        phase: StepPhase::ParamUpdate,
                        epoch,
                    });
                }
                group.step_segments(field.segments(&field_grads));
            }
        }

        // SchedulerStep
        schedule.observe(epoch, breakdown.total);

        // ConstraintProject
        mode.project(params);
        recover_axes(params, rng, epoch, StepPhase::ConstraintProject);

        // ResultAppend
        let state = LossState {
            epoch,
            total: breakdown.total,
            data_term: breakdown.data_term,
            reg_term: breakdown.reg_term,
            reg_values: breakdown.reg_values,
            learning_rates: mode.adjusted_rates(),
        };
        tracing::debug!(
            epoch,
            total = state.total,
            data = state.data_term,
            reg = state.reg_term,
            "iteration complete"
        );
        results.append(state.clone());
        Ok(state)
    }
}
