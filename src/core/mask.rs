//! Voxel masks selecting which voxels take part in the optimization.
//!
//! Three construction strategies exist:
//! - geometric reachability: every voxel crossed by at least one ray,
//! - all-rays-at-once: voxels crossed by a ray whose measured pixel has
//!   nonzero retardance,
//! - per-lenslet: the nonzero-retardance voxels minus the voxels tied to
//!   zero-retardance rays under a [`ZeroRetardanceExclusion`] policy.

use crate::render::{RayGeometry, VoxelIndexByLenslet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Boolean membership flag per voxel, aligned with the volume's voxel order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoxelMask {
    flags: Vec<bool>,
}

/// Which voxels on zero-retardance rays are removed from the mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZeroRetardanceExclusion {
    /// Voxels crossed by two or more zero-retardance rays. Used for simulated data.
    RepeatedZero,
    /// Voxels crossed by any ray of a lenslet whose rays all measure zero
    /// retardance. Used for measured data.
    ZeroRetLenslet,
}

impl ZeroRetardanceExclusion {
    pub fn for_data(from_simulation: bool) -> Self {
        if from_simulation {
            ZeroRetardanceExclusion::RepeatedZero
        } else {
            ZeroRetardanceExclusion::ZeroRetLenslet
        }
    }
}

impl VoxelMask {
    pub fn all(voxel_count: usize) -> Self {
        Self {
            flags: vec![true; voxel_count],
        }
    }

    /// Mask with exactly `indices` set. Out-of-range indices are ignored.
    pub fn from_indices(voxel_count: usize, indices: &[usize]) -> Self {
        let mut flags = vec![false; voxel_count];
        for &i in indices {
            if let Some(f) = flags.get_mut(i) {
                *f = true;
            }
        }
        Self { flags }
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn count_active(&self) -> usize {
        self.flags.iter().filter(|&&f| f).count()
    }

    #[inline]
    pub fn is_active(&self, voxel: usize) -> bool {
        self.flags.get(voxel).copied().unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        self.flags.iter().copied()
    }

    /// Active voxel indices in ascending order.
    pub fn active_indices(&self) -> Vec<usize> {
        self.flags
            .iter()
            .enumerate()
            .filter_map(|(i, &f)| f.then_some(i))
            .collect()
    }

    /// Voxels crossed by at least one ray.
    pub fn reachable(geometry: &RayGeometry) -> Self {
        let mut flags = vec![false; geometry.volume_shape.voxel_count()];
        for ray in geometry.rays() {
            for &v in &ray.voxels {
                flags[v] = true;
            }
        }
        Self { flags }
    }

    /// Voxels crossed by at least one ray whose measured pixel has nonzero retardance.
    pub fn from_nonzero_retardance(geometry: &RayGeometry, retardance: &[f32]) -> Self {
        let mut flags = vec![false; geometry.volume_shape.voxel_count()];
        for ray in geometry.rays() {
            if pixel_is_nonzero(retardance, ray.pixel) {
                for &v in &ray.voxels {
                    flags[v] = true;
                }
            }
        }
        Self { flags }
    }

    /// Per-lenslet construction: nonzero-retardance voxels minus the excluded set.
    pub fn from_lenslet_voxels(
        voxel_count: usize,
        index: &VoxelIndexByLenslet,
        retardance: &[f32],
        policy: ZeroRetardanceExclusion,
    ) -> Self {
        let included = nonzero_retardance_voxels(index, retardance);
        let excluded: BTreeSet<usize> = match policy {
            ZeroRetardanceExclusion::RepeatedZero => repeated_zero_voxels(index, retardance),
            ZeroRetardanceExclusion::ZeroRetLenslet => zero_lenslet_voxels(index, retardance),
        };
        let kept: Vec<usize> = included.difference(&excluded).copied().collect();
        Self::from_indices(voxel_count, &kept)
    }
}

#[inline]
fn pixel_is_nonzero(retardance: &[f32], pixel: usize) -> bool {
    retardance.get(pixel).is_some_and(|&r| r != 0.0)
}

/// Voxels with at least one nonzero-retardance ray, sorted ascending.
pub fn nonzero_retardance_voxels(index: &VoxelIndexByLenslet, retardance: &[f32]) -> BTreeSet<usize> {
    let mut set = BTreeSet::new();
    for rays in index.lenslets.values() {
        for ray in rays {
            if pixel_is_nonzero(retardance, ray.pixel) {
                set.extend(ray.voxels.iter().copied());
            }
        }
    }
    set
}

/// Voxels shared by two or more zero-retardance rays.
pub fn repeated_zero_voxels(index: &VoxelIndexByLenslet, retardance: &[f32]) -> BTreeSet<usize> {
    let mut counts: HashMap<usize, u32> = HashMap::new();
    for rays in index.lenslets.values() {
        for ray in rays {
            if !pixel_is_nonzero(retardance, ray.pixel) {
                // A ray counts once per voxel even if listed twice.
                let unique: BTreeSet<usize> = ray.voxels.iter().copied().collect();
                for v in unique {
                    *counts.entry(v).or_insert(0) += 1;
                }
            }
        }
    }
    counts
        .into_iter()
        .filter_map(|(v, c)| (c >= 2).then_some(v))
        .collect()
}

/// Voxels crossed by any ray of a lenslet in which every ray measures zero retardance.
pub fn zero_lenslet_voxels(index: &VoxelIndexByLenslet, retardance: &[f32]) -> BTreeSet<usize> {
    let mut set = BTreeSet::new();
    for rays in index.lenslets.values() {
        if !rays.is_empty() && rays.iter().all(|r| !pixel_is_nonzero(retardance, r.pixel)) {
            for ray in rays {
                set.extend(ray.voxels.iter().copied());
            }
        }
    }
    set
}
