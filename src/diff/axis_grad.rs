//! Chain rules for optic-axis parametrizations.

use crate::core::optic_axis::axial_from_planar;
use nalgebra::{Vector2, Vector3};

/// Gradient through `u = v / |v|` w.r.t. the raw vector `v`.
pub fn normalize_grad(raw: &Vector3<f32>, d_unit: &Vector3<f32>) -> Vector3<f32> {
    let n = raw.norm();
    if n <= 1e-12 {
        return Vector3::zeros();
    }
    let u = raw / n;
    (d_unit - u * u.dot(d_unit)) / n
}

/// Gradient w.r.t. planar components `(y, x)` of the axis
/// `(sqrt(1 − y² − x²), y, x)`.
///
/// Near the equator the axial derivative blows up, so it is dropped there.
pub fn planar_grad(planar: &Vector2<f32>, d_axis: &Vector3<f32>) -> Vector2<f32> {
    let axial = axial_from_planar(planar);
    let mut g = Vector2::new(d_axis.y, d_axis.z);
    if axial > 1e-6 {
        g.x -= d_axis.x * planar.x / axial;
        g.y -= d_axis.x * planar.y / axial;
    }
    g
}
