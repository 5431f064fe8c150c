//! Optimization: update rules, schedule, loss, and the reconstruction loop.
//!
//! - `optimizer`: Adam-family and plain gradient update rules
//! - `scheduler`: linear warmup plus reduce-on-plateau
//! - `loss` / `regularization`: data fidelity and the regularizer registry
//! - `field`: coordinate network for implicit-field mode
//! - `step`: one iteration
//! - `setup` / `reconstructor`: model preparation and the epoch loop

pub mod field;
pub mod loss;
pub mod optimizer;
pub mod reconstructor;
pub mod regularization;
pub mod scheduler;
pub mod setup;
pub mod step;

pub use field::ImplicitField;
pub use loss::{DataFidelity, LossBreakdown, LossEngine, MeasuredImages};
pub use optimizer::{ParamGroup, UpdateRule, SUPPORTED_OPTIMIZERS};
pub use reconstructor::{ReconstructionOutput, Reconstructor};
pub use regularization::Regularizer;
pub use scheduler::{LearningRateSchedule, ReduceOnPlateau, Warmup};
pub use setup::{prepare_model, PreparedModel};
pub use step::{LossState, OptimizationMode, OptimizationStep, StepPhase};
