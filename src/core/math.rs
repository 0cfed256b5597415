//! Mathematical utilities (activations, quaternion helpers).

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Smallest in-plane scale assigned to a mesh-bound Gaussian.
///
/// Keeps bound Gaussians non-degenerate even on very small triangles.
pub const MIN_BIND_SCALE: f32 = 1e-7;

/// Sigmoid activation function: σ(x) = 1 / (1 + e^(-x))
///
/// Maps R → (0, 1)
/// Used for opacity (converts unbounded optimization to valid probability)
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Inverse sigmoid (logit): logit(p) = log(p / (1-p))
///
/// Maps (0, 1) → R
/// Used to convert initial opacity values to optimization space
pub fn inverse_sigmoid(p: f32) -> f32 {
    // Clamp to avoid log(0) or division by zero
    let p_clamped = p.clamp(1e-6, 1.0 - 1e-6);
    (p_clamped / (1.0 - p_clamped)).ln()
}

/// Rotate a vector into a Gaussian's local frame (apply the inverse rotation).
pub fn rotate_by_inverse(rotation: &UnitQuaternion<f32>, v: &Vector3<f32>) -> Vector3<f32> {
    rotation.inverse_transform_vector(v)
}

/// Build a unit quaternion from three orthonormal column vectors.
///
/// The columns must form a right-handed orthonormal basis; this is used to
/// turn the per-triangle frame (normal, in-plane axes) of a mesh-bound
/// Gaussian into its quaternion.
pub fn quaternion_from_columns(
    c0: &Vector3<f32>,
    c1: &Vector3<f32>,
    c2: &Vector3<f32>,
) -> UnitQuaternion<f32> {
    let m = Matrix3::from_columns(&[*c0, *c1, *c2]);
    UnitQuaternion::from_matrix(&m)
}
