//! Core data structures for birefringent volumes.
//!
//! This module contains the types every other layer builds on:
//! - `BirefringentVolume` / `VolumeShape`: full-grid voxel data
//! - `VoxelMask`: which voxels take part in the optimization
//! - `ActiveParameterSet`: the reduced trainable parametrization
//! - `VolumeArena`: lifecycle stages of the working volume
//!
//! All types here are "pure data" - no I/O, no rendering logic.

pub mod active;
mod arena;
pub mod mask;
pub mod optic_axis;
mod volume;

pub use active::{ActiveParameterSet, AxisParametrization, INACTIVE};
pub use arena::{VolumeArena, VolumeStage};
pub use mask::{VoxelMask, ZeroRetardanceExclusion};
pub use volume::{BirefringentVolume, VolumeShape, VolumeView};
