//! Gaussian representation and field data structure.
//!
//! A Gaussian is parameterized by:
//! - Position (mean μ)
//! - Scale (log-space: exp(scale) gives actual scale)
//! - Rotation (quaternion)
//! - Opacity (logit-space: sigmoid(opacity) gives actual opacity)
//! - Spherical harmonics coefficients (view-dependent color)

use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::core::{evaluate_sh, rotate_by_inverse, sigmoid};
use crate::field::BetaMode;

/// Number of SH coefficients stored per color channel (degree ≤ 3).
pub const SH_COEFF_COUNT: usize = 16;

/// Spherical harmonics coefficients: RGB × 16 basis functions.
/// Index 0 is the DC component (view-independent color).
pub type ShCoefficients = [[f32; 3]; SH_COEFF_COUNT];

/// A 3D Gaussian primitive.
///
/// Covariance is stored factorized as scale + rotation for numerical
/// stability: Σ = R · S · S^T · R^T where S = diag(exp(scale))
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Gaussian {
    /// Position (mean μ)
    pub position: Vector3<f32>,

    /// Log-space scale (actual scale = exp(scale))
    /// Stored in log-space for unbounded optimization
    pub log_scale: Vector3<f32>,

    /// Rotation as unit quaternion
    pub rotation: UnitQuaternion<f32>,

    /// Opacity in logit-space (actual opacity = sigmoid(opacity_logit))
    pub opacity_logit: f32,

    /// Spherical harmonics coefficients for view-dependent color
    pub sh_coeffs: ShCoefficients,
}

impl Gaussian {
    /// Create a new Gaussian with given parameters.
    pub fn new(
        position: Vector3<f32>,
        log_scale: Vector3<f32>,
        rotation: UnitQuaternion<f32>,
        opacity_logit: f32,
        sh_coeffs: ShCoefficients,
    ) -> Self {
        Self {
            position,
            log_scale,
            rotation,
            opacity_logit,
            sh_coeffs,
        }
    }

    /// Get the actual opacity value (sigmoid of stored logit value)
    pub fn opacity(&self) -> f32 {
        sigmoid(self.opacity_logit)
    }

    /// Get the actual scale values (exp of stored log values)
    pub fn scale(&self) -> Vector3<f32> {
        self.log_scale.map(f32::exp)
    }

    /// Compute R · diag(scale), the matrix square root of the covariance.
    ///
    /// With `inverse_scales` the diagonal holds `1/scale` instead; this is
    /// the matrix used by density evaluation: transforming a world-space
    /// shift by its transpose yields the Mahalanobis-normalized shift.
    pub fn scaled_rotation(&self, inverse_scales: bool) -> Matrix3<f32> {
        let scale = self.scale();
        let diag = if inverse_scales {
            scale.map(|s| 1.0 / s.max(1e-8))
        } else {
            scale
        };
        self.rotation.to_rotation_matrix().into_inner() * Matrix3::from_diagonal(&diag)
    }

    /// The Gaussian's shortest principal axis (unit vector).
    ///
    /// For surface-aligned Gaussians this is the best notion of a normal.
    pub fn smallest_axis(&self) -> Vector3<f32> {
        let scale = self.scale();
        let axis_idx = scale.imin();
        self.rotation
            .to_rotation_matrix()
            .into_inner()
            .column(axis_idx)
            .into_owned()
    }

    /// The view-facing standard deviation: the extent of the Gaussian
    /// projected onto the direction from its center toward `eye`.
    pub fn view_std(&self, eye: &Vector3<f32>) -> f32 {
        let dir = (eye - self.position).normalize();
        let local = rotate_by_inverse(&self.rotation, &dir);
        self.scale().component_mul(&local).norm()
    }
}

/// The full set of anisotropic Gaussians making up a radiance field.
///
/// Array-of-Structs layout, matching the checkpoint record layout. Bulk
/// evaluation snapshots the derived per-Gaussian arrays once per pass
/// (see `field::DensityEvaluator`) instead of caching them here, so the
/// field stays trivially mutable between passes.
#[derive(Clone, Debug)]
pub struct GaussianField {
    pub gaussians: Vec<Gaussian>,

    /// Active SH degree in [0, 3].
    pub sh_degree: u32,

    /// How the local SDF length scale beta is derived.
    pub beta_mode: BetaMode,
}

impl GaussianField {
    /// Create a field from a vector of Gaussians.
    pub fn new(gaussians: Vec<Gaussian>, sh_degree: u32, beta_mode: BetaMode) -> Self {
        Self {
            gaussians,
            sh_degree,
            beta_mode,
        }
    }

    /// Number of Gaussians in the field.
    pub fn len(&self) -> usize {
        self.gaussians.len()
    }

    /// Check if the field is empty.
    pub fn is_empty(&self) -> bool {
        self.gaussians.is_empty()
    }

    /// Collect all Gaussian centers (used to rebuild the neighbor index).
    pub fn centers(&self) -> Vec<Vector3<f32>> {
        self.gaussians.iter().map(|g| g.position).collect()
    }

    /// Drop every Gaussian whose opacity is at or below `threshold`.
    ///
    /// Called before mesh extraction: low-opacity Gaussians contribute
    /// noise to the density field but no reliable surface. Returns the
    /// number of Gaussians removed. Any neighbor index built before this
    /// call is stale and must be rebuilt.
    pub fn retain_above_opacity(&mut self, threshold: f32) -> usize {
        let before = self.gaussians.len();
        self.gaussians.retain(|g| g.opacity() > threshold);
        before - self.gaussians.len()
    }

    /// Largest minimum-axis scale over all Gaussians.
    ///
    /// Used as the beta fallback for query points where every neighbor
    /// has zero opacity.
    pub fn max_min_axis_scale(&self) -> f32 {
        self.gaussians
            .iter()
            .map(|g| {
                let s = g.scale();
                s.x.min(s.y).min(s.z)
            })
            .fold(0.0f32, f32::max)
    }

    /// RGB color of Gaussian `idx` seen along `direction`.
    pub fn point_rgb(&self, idx: usize, direction: &Vector3<f32>) -> Vector3<f32> {
        evaluate_sh(&self.gaussians[idx].sh_coeffs, direction, self.sh_degree)
    }

    /// Draw `n` random points inside the Gaussians, choosing Gaussians with
    /// probability proportional to their volume and sampling within each
    /// according to its anisotropic covariance scaled by `scale_factor`.
    ///
    /// Returns the sampled points and the index of the Gaussian each point
    /// was drawn from.
    pub fn sample_points_in_gaussians<R: Rng>(
        &self,
        n: usize,
        scale_factor: f32,
        rng: &mut R,
    ) -> (Vec<Vector3<f32>>, Vec<u32>) {
        let volumes: Vec<f32> = self
            .gaussians
            .iter()
            .map(|g| {
                let s = g.scale();
                (s.x * s.y * s.z).abs()
            })
            .collect();
        let total: f32 = volumes.iter().sum();

        let mut points = Vec::with_capacity(n);
        let mut indices = Vec::with_capacity(n);
        for _ in 0..n {
            // Inverse-CDF draw over the volume distribution.
            let mut u = rng.gen::<f32>() * total;
            let mut chosen = self.gaussians.len() - 1;
            for (i, v) in volumes.iter().enumerate() {
                if u < *v {
                    chosen = i;
                    break;
                }
                u -= v;
            }

            let g = &self.gaussians[chosen];
            let local = Vector3::new(
                rng.sample::<f32, _>(StandardNormal),
                rng.sample::<f32, _>(StandardNormal),
                rng.sample::<f32, _>(StandardNormal),
            );
            let offset = g
                .rotation
                .transform_vector(&(g.scale().component_mul(&local) * scale_factor));
            points.push(g.position + offset);
            indices.push(chosen as u32);
        }
        (points, indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn isotropic(position: Vector3<f32>, scale: f32, opacity: f32) -> Gaussian {
        Gaussian::new(
            position,
            Vector3::repeat(scale.ln()),
            UnitQuaternion::identity(),
            crate::core::inverse_sigmoid(opacity),
            [[0.0; 3]; SH_COEFF_COUNT],
        )
    }

    #[test]
    fn test_scale_activation_is_exp() {
        let g = isotropic(Vector3::zeros(), 0.1, 0.5);
        assert_relative_eq!(g.scale().x, 0.1, epsilon = 1e-6);
        assert!(g.scale().min() > 0.0);
    }

    #[test]
    fn test_smallest_axis_of_flat_gaussian() {
        let g = Gaussian::new(
            Vector3::zeros(),
            Vector3::new(0.001f32.ln(), 0.1f32.ln(), 0.1f32.ln()),
            UnitQuaternion::identity(),
            0.0,
            [[0.0; 3]; SH_COEFF_COUNT],
        );
        let axis = g.smallest_axis();
        assert_relative_eq!(axis.x.abs(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_view_std_isotropic() {
        let g = isotropic(Vector3::zeros(), 0.2, 1.0);
        let std = g.view_std(&Vector3::new(0.0, 0.0, 5.0));
        assert_relative_eq!(std, 0.2, epsilon = 1e-5);
    }

    #[test]
    fn test_retain_above_opacity() {
        let mut field = GaussianField::new(
            vec![
                isotropic(Vector3::zeros(), 0.1, 0.9),
                isotropic(Vector3::x(), 0.1, 0.1),
            ],
            0,
            BetaMode::Average,
        );
        let dropped = field.retain_above_opacity(0.5);
        assert_eq!(dropped, 1);
        assert_eq!(field.len(), 1);
    }

    #[test]
    fn test_sampled_points_stay_near_their_gaussian() {
        let field = GaussianField::new(
            vec![isotropic(Vector3::new(3.0, 0.0, 0.0), 0.01, 1.0)],
            0,
            BetaMode::Average,
        );
        let mut rng = StdRng::seed_from_u64(7);
        let (points, indices) = field.sample_points_in_gaussians(64, 1.0, &mut rng);
        assert_eq!(points.len(), 64);
        assert!(indices.iter().all(|&i| i == 0));
        for p in points {
            assert!((p - Vector3::new(3.0, 0.0, 0.0)).norm() < 0.1);
        }
    }
}
