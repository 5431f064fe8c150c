//! Optic-axis utilities: unit-sphere projection and planar parametrization.

use nalgebra::{Vector2, Vector3};
use rand::Rng;

/// Axis used when a vector has no direction to normalize.
pub const FALLBACK_AXIS: Vector3<f32> = Vector3::new(1.0, 0.0, 0.0);

/// Isotropic random unit vector (rejection sampling in the unit ball).
pub fn random_unit_vector<R: Rng + ?Sized>(rng: &mut R) -> Vector3<f32> {
    loop {
        let v = Vector3::new(
            rng.gen_range(-1.0f32..1.0),
            rng.gen_range(-1.0f32..1.0),
            rng.gen_range(-1.0f32..1.0),
        );
        let n2 = v.norm_squared();
        if n2 > 1e-4 && n2 <= 1.0 {
            return v / n2.sqrt();
        }
    }
}

/// Project an axis onto the unit sphere. Zero-length axes become [`FALLBACK_AXIS`].
#[inline]
pub fn project_to_sphere(v: &Vector3<f32>) -> Vector3<f32> {
    v.try_normalize(1e-12).unwrap_or(FALLBACK_AXIS)
}

pub fn normalize_axes(axes: &mut [Vector3<f32>]) {
    for a in axes.iter_mut() {
        *a = project_to_sphere(a);
    }
}

/// Axial component implied by the planar components `(y, x)` of a unit vector.
///
/// Always the non-negative root; planar vectors longer than one give zero.
#[inline]
pub fn axial_from_planar(planar: &Vector2<f32>) -> f32 {
    (1.0 - planar.norm_squared()).max(0.0).sqrt()
}

/// Rebuild full axes from planar components, then normalize both in place.
pub fn fill_axes_from_planar(planar: &mut [Vector2<f32>], axes: &mut [Vector3<f32>]) {
    assert_eq!(planar.len(), axes.len());
    for (p, a) in planar.iter_mut().zip(axes.iter_mut()) {
        let full = project_to_sphere(&Vector3::new(axial_from_planar(p), p.x, p.y));
        *a = full;
        *p = Vector2::new(full.y, full.z);
    }
}

pub fn is_finite_axis(v: &Vector3<f32>) -> bool {
    v.iter().all(|c| c.is_finite())
}

/// Replace every non-finite axis with a fresh random unit vector.
///
/// Returns the indices that were replaced.
pub fn replace_non_finite_axes<R: Rng + ?Sized>(
    axes: &mut [Vector3<f32>],
    rng: &mut R,
) -> Vec<usize> {
    let mut replaced = Vec::new();
    for (i, a) in axes.iter_mut().enumerate() {
        if !is_finite_axis(a) {
            *a = random_unit_vector(rng);
            replaced.push(i);
        }
    }
    replaced
}
