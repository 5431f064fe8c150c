//! Weak-birefringence retardance model and its gradients.
//!
//! Forward chain for one pixel:
//! 1. every voxel on the ray adds `s·Δn·(a_x² − a_y², 2·a_x·a_y)` to the
//!    retardance vector `R`, with `s = k·ℓ` (wavenumber times path length)
//! 2. `retardance = |R|`, `azimuth = ½·atan2(R_y, R_x)` wrapped to `[0, π)`
//! 3. the loss sees either `(ret·cos 2θ, ret·sin 2θ)` or analyzer intensities
//!
//! Axis components are `(axial, y, x)`; the axial one does not enter the
//! first-order model.

use nalgebra::{Vector2, Vector3};
use std::f32::consts::PI;

/// Below this |R| the azimuth is undefined and its gradient is skipped.
pub const AZIMUTH_EPS: f32 = 1e-12;

/// Retardance vector contributed by one voxel segment.
#[inline]
pub fn voxel_retardance_vector(scale: f32, delta_n: f32, axis: &Vector3<f32>) -> Vector2<f32> {
    let (ay, ax) = (axis.y, axis.z);
    scale * delta_n * Vector2::new(ax * ax - ay * ay, 2.0 * ax * ay)
}

/// Gradient of [`voxel_retardance_vector`] w.r.t. `(Δn, axis)`.
pub fn voxel_retardance_vector_grad(
    scale: f32,
    delta_n: f32,
    axis: &Vector3<f32>,
    d_r: &Vector2<f32>,
) -> (f32, Vector3<f32>) {
    let (ay, ax) = (axis.y, axis.z);
    let d_dn = scale * (d_r.x * (ax * ax - ay * ay) + d_r.y * 2.0 * ax * ay);
    let s = scale * delta_n;
    let d_ay = s * (-2.0 * ay * d_r.x + 2.0 * ax * d_r.y);
    let d_ax = s * (2.0 * ax * d_r.x + 2.0 * ay * d_r.y);
    (d_dn, Vector3::new(0.0, d_ay, d_ax))
}

/// Wrap an angle into `[0, π)`.
#[inline]
pub fn wrap_azimuth(a: f32) -> f32 {
    let w = a.rem_euclid(PI);
    if w >= PI {
        0.0
    } else {
        w
    }
}

/// `(retardance, azimuth)` of a retardance vector.
#[inline]
pub fn ret_azim_from_vector(r: &Vector2<f32>) -> (f32, f32) {
    let ret = r.norm();
    let azim = if ret > AZIMUTH_EPS {
        wrap_azimuth(0.5 * r.y.atan2(r.x))
    } else {
        0.0
    };
    (ret, azim)
}

/// Gradient of [`ret_azim_from_vector`] w.r.t. `R`.
pub fn ret_azim_from_vector_grad(r: &Vector2<f32>, d_ret: f32, d_azim: f32) -> Vector2<f32> {
    let n2 = r.norm_squared();
    let n = n2.sqrt();
    if n <= AZIMUTH_EPS {
        // Subgradient of |R| at the origin along +x.
        return Vector2::new(d_ret, 0.0);
    }
    Vector2::new(
        d_ret * r.x / n - d_azim * r.y / (2.0 * n2),
        d_ret * r.y / n + d_azim * r.x / (2.0 * n2),
    )
}

/// Double-angle vector form `(ret·cos 2θ, ret·sin 2θ)`.
#[inline]
pub fn vector_components(ret: f32, azim: f32) -> (f32, f32) {
    let (s, c) = (2.0 * azim).sin_cos();
    (ret * c, ret * s)
}

/// Gradient of [`vector_components`] w.r.t. `(ret, azim)`.
pub fn vector_components_grad(ret: f32, azim: f32, d_cos: f32, d_sin: f32) -> (f32, f32) {
    let (s, c) = (2.0 * azim).sin_cos();
    let d_ret = d_cos * c + d_sin * s;
    let d_azim = 2.0 * ret * (-d_cos * s + d_sin * c);
    (d_ret, d_azim)
}

/// Analyzer intensity for angle `phi` (radians).
#[inline]
pub fn analyzer_intensity(r: &Vector2<f32>, phi: f32) -> f32 {
    let (s, c) = (2.0 * phi).sin_cos();
    0.5 * (1.0 + r.x * c + r.y * s)
}

/// Gradient of [`analyzer_intensity`] w.r.t. `R`.
#[inline]
pub fn analyzer_intensity_grad(phi: f32, d_i: f32) -> Vector2<f32> {
    let (s, c) = (2.0 * phi).sin_cos();
    Vector2::new(0.5 * c * d_i, 0.5 * s * d_i)
}
