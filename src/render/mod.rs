//! Forward model: ray geometry and the differentiable polarization tracer.
//!
//! Gradients of the per-voxel terms live in `diff`; this module wires them
//! along the rays.

pub mod geometry;
pub mod tracer;

pub use geometry::{Lenslet, Ray, RayGeometry, RayVoxels, VoxelIndexByLenslet};
pub use tracer::{ForwardModel, ImageSet, OutputMode, WeakBirefringenceTracer};
