//! Ray geometry through the voxel grid.
//!
//! Each micro-lens images the volume through a fan of rays, one per sensor
//! pixel inside the numerical-aperture circle. Rays are marched through the
//! grid once; every ray stores the voxels it crosses (in traversal order) and
//! the path length inside each.

use crate::config::OpticalConfig;
use crate::core::{VolumeShape, VoxelMask};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

/// Integration steps per smallest voxel edge while marching.
const STEPS_PER_VOXEL: f32 = 8.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ray {
    /// Flat pixel index into the `(height, width)` image.
    pub pixel: usize,
    pub voxels: Vec<usize>,
    /// Path length in micrometers, aligned with `voxels`.
    pub lengths: Vec<f32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lenslet {
    /// `(row, col)` in the micro-lens array.
    pub index: (usize, usize),
    pub rays: Vec<Ray>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RayGeometry {
    pub volume_shape: VolumeShape,
    /// `(height, width)` of the sensor image.
    pub image_shape: (usize, usize),
    pub lenslets: Vec<Lenslet>,
    /// Mask cached for reuse when the geometry is saved.
    pub mask: Option<VoxelMask>,
    /// Set once every lenslet's rays are prepared for a single joint pass.
    pub all_rays_ready: bool,
}

/// Voxels crossed by one ray.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RayVoxels {
    pub pixel: usize,
    pub voxels: Vec<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct LensletVoxels {
    index: (usize, usize),
    rays: Vec<RayVoxels>,
}

/// Micro-lens index → rays and the voxels each crosses.
///
/// Serialized as a list of entries since JSON keys must be strings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<LensletVoxels>", into = "Vec<LensletVoxels>")]
pub struct VoxelIndexByLenslet {
    pub lenslets: BTreeMap<(usize, usize), Vec<RayVoxels>>,
}

impl From<Vec<LensletVoxels>> for VoxelIndexByLenslet {
    fn from(entries: Vec<LensletVoxels>) -> Self {
        Self {
            lenslets: entries.into_iter().map(|e| (e.index, e.rays)).collect(),
        }
    }
}

impl From<VoxelIndexByLenslet> for Vec<LensletVoxels> {
    fn from(index: VoxelIndexByLenslet) -> Self {
        index
            .lenslets
            .into_iter()
            .map(|(index, rays)| LensletVoxels { index, rays })
            .collect()
    }
}

impl VoxelIndexByLenslet {
    pub fn ray_count(&self) -> usize {
        self.lenslets.values().map(Vec::len).sum()
    }
}

/// Voxels and segment lengths along a straight line through the grid.
///
/// The line passes through `(y0, x0)` at mid-depth with lateral slopes
/// `(ty, tx)` per unit depth. Consecutive samples in the same voxel merge.
fn march(
    shape: VolumeShape,
    voxel_size: [f32; 3],
    (y0, x0): (f32, f32),
    (ty, tx): (f32, f32),
) -> (Vec<usize>, Vec<f32>) {
    let [dz, dy, dx] = voxel_size;
    let depth = shape.z as f32 * dz;
    let extent_y = shape.y as f32 * dy;
    let extent_x = shape.x as f32 * dx;
    let step = dz.min(dy).min(dx) / STEPS_PER_VOXEL;
    let n_steps = (depth / step).ceil() as usize;
    let seg = step * (1.0 + ty * ty + tx * tx).sqrt();
    let z_mid = depth / 2.0;

    let mut voxels: Vec<usize> = Vec::new();
    let mut lengths: Vec<f32> = Vec::new();
    for s in 0..n_steps {
        let z = (s as f32 + 0.5) * step;
        if z >= depth {
            break;
        }
        let y = y0 + ty * (z - z_mid);
        let x = x0 + tx * (z - z_mid);
        if y < 0.0 || x < 0.0 || y >= extent_y || x >= extent_x {
            continue;
        }
        let iz = ((z / dz) as usize).min(shape.z - 1);
        let iy = ((y / dy) as usize).min(shape.y - 1);
        let ix = ((x / dx) as usize).min(shape.x - 1);
        let v = shape.index(iz, iy, ix);
        match voxels.last() {
            Some(&last) if last == v => {
                if let Some(l) = lengths.last_mut() {
                    *l += seg;
                }
            }
            _ => {
                voxels.push(v);
                lengths.push(seg);
            }
        }
    }
    (voxels, lengths)
}

impl RayGeometry {
    /// Trace every lenslet's ray fan through the volume described by `optics`.
    pub fn compute(optics: &OpticalConfig) -> Result<Self> {
        optics.validate()?;
        let start = Instant::now();

        let shape = VolumeShape::from_array(optics.volume_shape);
        let [_, dy, dx] = optics.voxel_size_um;
        let ppm = optics.pixels_per_ml;
        let n_ml = optics.n_micro_lenses;
        let (height, width) = optics.image_shape();
        let max_slope = (optics.na_obj / optics.n_medium).asin().tan();
        let pitch_y = shape.y as f32 * dy / n_ml as f32;
        let pitch_x = shape.x as f32 * dx / n_ml as f32;

        let mut lenslets = Vec::with_capacity(n_ml * n_ml);
        for li in 0..n_ml {
            for lj in 0..n_ml {
                let center = ((li as f32 + 0.5) * pitch_y, (lj as f32 + 0.5) * pitch_x);
                let mut rays = Vec::new();
                for u in 0..ppm {
                    for v in 0..ppm {
                        let pu = ((u as f32 + 0.5) / ppm as f32 - 0.5) * 2.0;
                        let pv = ((v as f32 + 0.5) / ppm as f32 - 0.5) * 2.0;
                        if pu * pu + pv * pv > 1.0 {
                            continue;
                        }
                        let slopes = (pu * max_slope, pv * max_slope);
                        let (voxels, lengths) = march(shape, optics.voxel_size_um, center, slopes);
                        if voxels.is_empty() {
                            continue;
                        }
                        let pixel = (li * ppm + u) * width + (lj * ppm + v);
                        rays.push(Ray {
                            pixel,
                            voxels,
                            lengths,
                        });
                    }
                }
                lenslets.push(Lenslet {
                    index: (li, lj),
                    rays,
                });
            }
        }

        let geometry = Self {
            volume_shape: shape,
            image_shape: (height, width),
            lenslets,
            mask: None,
            all_rays_ready: false,
        };
        tracing::info!(
            lenslets = geometry.lenslets.len(),
            rays = geometry.ray_count(),
            elapsed_s = start.elapsed().as_secs_f32(),
            "ray geometry computed"
        );
        Ok(geometry)
    }

    pub fn pixel_count(&self) -> usize {
        self.image_shape.0 * self.image_shape.1
    }

    pub fn rays(&self) -> impl Iterator<Item = &Ray> + '_ {
        self.lenslets.iter().flat_map(|l| l.rays.iter())
    }

    pub fn ray_count(&self) -> usize {
        self.lenslets.iter().map(|l| l.rays.len()).sum()
    }

    /// Keep rays whose pixel satisfies `keep`. Returns the number removed.
    pub fn retain_rays<F: Fn(usize) -> bool>(&mut self, keep: F) -> usize {
        let before = self.ray_count();
        for lenslet in &mut self.lenslets {
            lenslet.rays.retain(|r| keep(r.pixel));
        }
        before - self.ray_count()
    }

    /// Drop rays landing on pixels where `image` is zero.
    pub fn retain_rays_with_nonzero(&mut self, image: &[f32]) -> usize {
        let removed = self.retain_rays(|p| image.get(p).is_some_and(|&v| v != 0.0));
        tracing::info!(removed, remaining = self.ray_count(), "omitted rays on zero-retardance pixels");
        removed
    }

    /// Drop rays whose radiometry pixel is not positive.
    pub fn filter_from_radiometry(&mut self, radiometry: &[f32]) -> usize {
        let removed = self.retain_rays(|p| radiometry.get(p).is_some_and(|&v| v > 0.0));
        tracing::info!(removed, remaining = self.ray_count(), "filtered rays by radiometry");
        removed
    }

    /// Prepare every lenslet's rays for one joint pass.
    ///
    /// Rays are ordered by pixel so the traversal is deterministic across
    /// runs, and the geometry is marked ready for reachability masking.
    pub fn prepare_all_rays_at_once(&mut self) {
        for lenslet in &mut self.lenslets {
            lenslet.rays.sort_by_key(|r| r.pixel);
        }
        self.lenslets.sort_by_key(|l| l.index);
        self.all_rays_ready = true;
    }

    /// Per-lenslet ray → voxel mapping.
    pub fn voxel_indices_by_lenslet(&self) -> VoxelIndexByLenslet {
        let lenslets = self
            .lenslets
            .iter()
            .map(|l| {
                let rays = l
                    .rays
                    .iter()
                    .map(|r| RayVoxels {
                        pixel: r.pixel,
                        voxels: r.voxels.clone(),
                    })
                    .collect();
                (l.index, rays)
            })
            .collect();
        VoxelIndexByLenslet { lenslets }
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::io::BufWriter::new(std::fs::File::create(path)?);
        serde_json::to_writer(file, self)?;
        Ok(())
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let file = std::io::BufReader::new(std::fs::File::open(path)?);
        Ok(serde_json::from_reader(file)?)
    }
}
