//! File I/O for reconstruction runs.
//!
//! - `.bvol` volume container
//! - voxel-index-by-lenslet cache with recompute fallback
//! - loss/regularization CSVs and volume checkpoints
//! - diagnostic montages
//! - the saved reconstruction config directory

pub mod diagnostics;
mod recon_config;
mod results;
pub mod voxel_index_cache;
mod volume_file;

pub use recon_config::{ReconstructionConfig, CONFIG_DIR};
pub use results::{ResultStore, LOSS_CSV, REGULARIZATION_CSV};
pub use volume_file::{load_volume, read_volume, save_volume, write_volume, VolumeFileError};
