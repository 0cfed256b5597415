//! Spherical harmonics evaluation for view-dependent color.
//!
//! Gaussians store color as spherical harmonics coefficients rather than
//! a single RGB value. This allows view-dependent effects (specular
//! highlights, etc.)
//!
//! We use up to degree-3 SH, which requires 16 coefficients per channel.
//! The geometric extraction only needs SH to sample point-cloud colors.

use nalgebra::Vector3;

/// The degree-0 SH basis constant Y_0^0.
pub const SH_C0: f32 = 0.282_094_8;

const SH_C1: f32 = 0.488_602_5;
const SH_C2: [f32; 5] = [1.092_548_4, -1.092_548_4, 0.315_391_6, -1.092_548_4, 0.546_274_2];
const SH_C3: [f32; 7] = [
    -0.590_043_6,
    2.890_611_4,
    -0.457_045_8,
    0.373_176_3,
    -0.457_045_8,
    1.445_305_7,
    -0.590_043_6,
];

/// Evaluate the real SH basis functions up to degree 3.
///
/// Given a normalized direction vector, returns the 16 basis values in the
/// conventional (degree-major) ordering used by 3DGS checkpoints.
pub fn sh_basis(direction: &Vector3<f32>) -> [f32; 16] {
    let (x, y, z) = (direction.x, direction.y, direction.z);
    let (xx, yy, zz) = (x * x, y * y, z * z);
    let (xy, yz, xz) = (x * y, y * z, x * z);

    let mut basis = [0.0f32; 16];
    basis[0] = SH_C0;

    basis[1] = -SH_C1 * y;
    basis[2] = SH_C1 * z;
    basis[3] = -SH_C1 * x;

    basis[4] = SH_C2[0] * xy;
    basis[5] = SH_C2[1] * yz;
    basis[6] = SH_C2[2] * (2.0 * zz - xx - yy);
    basis[7] = SH_C2[3] * xz;
    basis[8] = SH_C2[4] * (xx - yy);

    basis[9] = SH_C3[0] * y * (3.0 * xx - yy);
    basis[10] = SH_C3[1] * xy * z;
    basis[11] = SH_C3[2] * y * (4.0 * zz - xx - yy);
    basis[12] = SH_C3[3] * z * (2.0 * zz - 3.0 * xx - 3.0 * yy);
    basis[13] = SH_C3[4] * x * (4.0 * zz - xx - yy);
    basis[14] = SH_C3[5] * z * (xx - yy);
    basis[15] = SH_C3[6] * x * (xx - 3.0 * yy);

    basis
}

/// Evaluate view-dependent RGB from SH coefficients up to `degree`.
///
/// The +0.5 shift and clamp follow the 3DGS color convention: the DC
/// coefficient stores `(rgb - 0.5) / SH_C0`.
pub fn evaluate_sh(
    sh_coeffs: &[[f32; 3]; 16],
    direction: &Vector3<f32>,
    degree: u32,
) -> Vector3<f32> {
    let dir = direction.normalize();
    let basis = sh_basis(&dir);
    let n_coeffs = ((degree + 1) * (degree + 1)) as usize;

    let mut color = Vector3::<f32>::zeros();
    for (b, c) in basis.iter().zip(sh_coeffs.iter()).take(n_coeffs) {
        color.x += b * c[0];
        color.y += b * c[1];
        color.z += b * c[2];
    }

    (color + Vector3::repeat(0.5)).sup(&Vector3::zeros())
}

/// Convert an RGB color to the SH DC coefficient.
pub fn rgb_to_sh_dc(rgb: &Vector3<f32>) -> Vector3<f32> {
    (rgb - Vector3::repeat(0.5)) / SH_C0
}

/// Convert an SH DC coefficient back to RGB.
pub fn sh_dc_to_rgb(dc: &Vector3<f32>) -> Vector3<f32> {
    dc * SH_C0 + Vector3::repeat(0.5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_dc_only_color_is_view_independent() {
        let mut coeffs = [[0.0f32; 3]; 16];
        coeffs[0] = [0.7 / SH_C0, 0.0, 0.0];

        let a = evaluate_sh(&coeffs, &Vector3::new(0.0, 0.0, 1.0), 3);
        let b = evaluate_sh(&coeffs, &Vector3::new(1.0, 0.0, 0.0).normalize(), 3);
        assert_relative_eq!(a.x, b.x, epsilon = 1e-6);
        assert_relative_eq!(a.x, 0.7 + 0.5, epsilon = 1e-5);
    }

    #[test]
    fn test_rgb_sh_dc_roundtrip() {
        let rgb = Vector3::new(0.2, 0.5, 0.9);
        let dc = rgb_to_sh_dc(&rgb);
        let back = sh_dc_to_rgb(&dc);
        assert_relative_eq!(back, rgb, epsilon = 1e-6);
    }

    #[test]
    fn test_degree_truncation_drops_directional_terms() {
        let mut coeffs = [[0.0f32; 3]; 16];
        coeffs[0] = [1.0, 1.0, 1.0];
        coeffs[2] = [5.0, 5.0, 5.0]; // degree-1 term

        let dir = Vector3::new(0.0, 0.0, 1.0);
        let deg0 = evaluate_sh(&coeffs, &dir, 0);
        let deg1 = evaluate_sh(&coeffs, &dir, 1);
        assert_relative_eq!(deg0.x, SH_C0 + 0.5, epsilon = 1e-5);
        assert!(deg1.x > deg0.x);
    }
}
