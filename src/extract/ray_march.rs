//! Per-camera level-surface extraction by ray marching.
//!
//! For every depth-map pixel, the marcher walks a short 1D range along
//! the camera ray, centered on the backprojected depth point and scaled
//! by the governing Gaussian's view-facing standard deviation, evaluates
//! the density field at each sample and finds the first crossing of each
//! requested surface level. Only the first (camera-nearest) crossing is
//! kept; a noisy ray crossing the level several times contributes the
//! visible surface, not internal structure.

use log::{debug, warn};
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::core::{Camera, GaussianField};
use crate::extract::{
    build_splat_mesh, DepthFragments, DepthSource, ExtractError, TRIANGLES_PER_GAUSSIAN,
};
use crate::field::DensityEvaluator;
use crate::neighbors::{NeighborIndex, DEFAULT_KNN};

/// How surface normals are derived at intersection points.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NormalMode {
    /// No normals.
    None,
    /// Analytic density gradient at the intersection (default). Points
    /// density-uphill, toward the governing Gaussian's center.
    DensityGradient,
    /// The governing Gaussian's shortest principal axis, sign-aligned
    /// along the viewing ray. Faster, less accurate near Gaussian
    /// borders.
    FlatGaussian,
}

#[derive(Clone, Copy, Debug)]
pub struct RayMarchConfig {
    /// Samples per ray (default 21).
    pub n_points_in_range: usize,

    /// Half-width of the sample range in view-facing standard deviations
    /// of the governing Gaussian (default 3).
    pub range_size: f32,

    /// Maximum density-field samples evaluated per pass. A memory bound
    /// only; results are identical for any value.
    pub n_points_per_pass: usize,

    /// Multiplier on every Gaussian's density contribution.
    pub density_factor: f32,

    /// Neighbors per ray for density evaluation.
    pub knn: usize,

    pub normal_mode: NormalMode,

    /// `Some(n)`: march only `n` randomly chosen valid pixels (the fast
    /// variant). `None`: march every valid pixel.
    pub pixel_subsample: Option<usize>,

    /// Seed for the pixel subsample.
    pub seed: u64,
}

impl Default for RayMarchConfig {
    fn default() -> Self {
        Self {
            n_points_in_range: 21,
            range_size: 3.0,
            n_points_per_pass: 2_000_000,
            density_factor: 1.0,
            knn: DEFAULT_KNN,
            normal_mode: NormalMode::DensityGradient,
            pixel_subsample: None,
            seed: 0,
        }
    }
}

/// Intersection points of one camera with one surface level.
///
/// `pixel_idx` holds `v * width + u` of the originating pixel, so the
/// aggregator can look up the rendered color; `gaussian_idx` is the
/// governing Gaussian of the ray.
#[derive(Clone, Debug)]
pub struct LevelSurfacePoints {
    pub level: f32,
    pub points: Vec<Vector3<f32>>,
    /// Unit normals oriented into the surface (density-uphill).
    pub normals: Option<Vec<Vector3<f32>>>,
    pub gaussian_idx: Vec<u32>,
    pub pixel_idx: Vec<u32>,
}

impl LevelSurfacePoints {
    fn empty(level: f32, with_normals: bool) -> Self {
        Self {
            level,
            points: Vec::new(),
            normals: with_normals.then(Vec::new),
            gaussian_idx: Vec::new(),
            pixel_idx: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// One crossing for one pixel at one level.
struct Crossing {
    point: Vector3<f32>,
    normal: Option<Vector3<f32>>,
    gaussian_idx: u32,
    pixel_idx: u32,
}

/// Extract level-surface points for `camera` at each requested level.
///
/// Outputs are parallel to `levels`. A camera with zero valid depth
/// pixels yields empty outputs, not an error, so a bad frame cannot
/// abort a multi-camera aggregation.
pub fn extract_levels(
    camera: &Camera,
    field: &GaussianField,
    evaluator: &DensityEvaluator,
    knn: &NeighborIndex,
    depth_source: &DepthSource,
    levels: &[f32],
    config: &RayMarchConfig,
) -> Result<Vec<LevelSurfacePoints>, ExtractError> {
    let with_normals = config.normal_mode != NormalMode::None;
    let fragments = render_depth(camera, field, depth_source)?;

    let mut valid: Vec<u32> = (0..fragments.pixel_count() as u32)
        .filter(|&i| fragments.depth[i as usize] > 0.0)
        .collect();
    if let Some(face_idx) = &fragments.face_idx {
        valid.retain(|&i| face_idx[i as usize] != DepthFragments::NO_FACE);
        // A face index outside the proxy mesh cannot be mapped back to a
        // Gaussian; treat the pixel as uncovered.
        let covered = valid.len();
        valid.retain(|&i| {
            (face_idx[i as usize] / TRIANGLES_PER_GAUSSIAN) < field.len() as u32
        });
        if valid.len() < covered {
            warn!(
                "rasterizer reported {} pixels with out-of-range face indices; skipped",
                covered - valid.len()
            );
        }
    }

    if valid.is_empty() {
        warn!("camera has no valid depth pixels; skipping frame");
        return Ok(levels
            .iter()
            .map(|&l| LevelSurfacePoints::empty(l, with_normals))
            .collect());
    }

    if let Some(n) = config.pixel_subsample {
        if n < valid.len() {
            let mut rng = StdRng::seed_from_u64(config.seed);
            valid.shuffle(&mut rng);
            valid.truncate(n);
            valid.sort_unstable();
        }
    }
    debug!("marching {} rays at {} levels", valid.len(), levels.len());

    let camera_center = camera.camera_center();
    let mut outputs: Vec<LevelSurfacePoints> = levels
        .iter()
        .map(|&l| LevelSurfacePoints::empty(l, with_normals))
        .collect();

    // Pixels per pass so that pixels * samples stays within the budget.
    let chunk = (config.n_points_per_pass / config.n_points_in_range.max(1)).max(1);
    for pixel_chunk in valid.chunks(chunk) {
        let per_pixel: Vec<Vec<Option<Crossing>>> = pixel_chunk
            .par_iter()
            .map(|&pix| {
                march_pixel(
                    pix,
                    &fragments,
                    camera,
                    &camera_center,
                    field,
                    evaluator,
                    knn,
                    levels,
                    config,
                )
            })
            .collect();

        for crossings in per_pixel {
            for (out, crossing) in outputs.iter_mut().zip(crossings) {
                if let Some(c) = crossing {
                    out.points.push(c.point);
                    out.gaussian_idx.push(c.gaussian_idx);
                    out.pixel_idx.push(c.pixel_idx);
                    if let (Some(normals), Some(n)) = (out.normals.as_mut(), c.normal) {
                        normals.push(n);
                    }
                }
            }
        }
    }

    Ok(outputs)
}

fn render_depth(
    camera: &Camera,
    field: &GaussianField,
    depth_source: &DepthSource,
) -> Result<DepthFragments, ExtractError> {
    match depth_source {
        DepthSource::ProxyMesh {
            rasterizer,
            shape,
            triangle_scale,
        } => {
            let proxy = build_splat_mesh(field, camera, *shape, *triangle_scale);
            rasterizer
                .rasterize_depth(&proxy, camera)
                .map_err(ExtractError::Depth)
        }
        DepthSource::GaussianSplatting { rasterizer } => rasterizer
            .render_depth(field, camera)
            .map_err(ExtractError::Depth),
    }
}

#[allow(clippy::too_many_arguments)]
fn march_pixel(
    pix: u32,
    fragments: &DepthFragments,
    camera: &Camera,
    camera_center: &Vector3<f32>,
    field: &GaussianField,
    evaluator: &DensityEvaluator,
    knn: &NeighborIndex,
    levels: &[f32],
    config: &RayMarchConfig,
) -> Vec<Option<Crossing>> {
    let u = (pix % fragments.width) as f32;
    let v = (pix / fragments.width) as f32;
    let depth = fragments.depth[pix as usize];
    let origin = camera.unproject_pixel(u, v, depth);

    let gaussian_idx = match &fragments.face_idx {
        Some(faces) => faces[pix as usize] / TRIANGLES_PER_GAUSSIAN,
        None => knn.nearest(&origin),
    };

    let std = field.gaussians[gaussian_idx as usize].view_std(camera_center);
    let dir = (origin - camera_center).normalize();
    let half_range = config.range_size * std;
    let n = config.n_points_in_range;
    let step = if n > 1 {
        2.0 * half_range / (n - 1) as f32
    } else {
        0.0
    };

    // One neighbor list per ray, shared by every sample on it.
    let neighbors = knn.query(&origin, config.knn);

    let mut ts = Vec::with_capacity(n);
    let mut densities = Vec::with_capacity(n);
    for i in 0..n {
        let t = -half_range + step * i as f32;
        let sample = origin + dir * t;
        ts.push(t);
        densities.push(evaluator.density_at(&sample, &neighbors, config.density_factor));
    }

    levels
        .iter()
        .map(|&level| {
            let first_above = densities.iter().position(|&d| d > level)?;
            // A ray already above the level at its camera-side end never
            // crossed the surface from outside; skip it.
            if first_above == 0 || densities[0] >= level {
                return None;
            }

            let (d0, d1) = (densities[first_above - 1], densities[first_above]);
            let (t0, t1) = (ts[first_above - 1], ts[first_above]);
            let t = if (d1 - d0).abs() > 1e-12 {
                t0 + (level - d0) * (t1 - t0) / (d1 - d0)
            } else {
                t1
            };
            let point = origin + dir * t;

            let normal = match config.normal_mode {
                NormalMode::None => None,
                NormalMode::DensityGradient => {
                    let grad = evaluator.density_gradient_at(
                        &point,
                        &neighbors,
                        config.density_factor,
                    );
                    let len = grad.norm();
                    if len > 1e-12 {
                        Some(grad / len)
                    } else {
                        Some(flat_normal(field, gaussian_idx, &dir))
                    }
                }
                NormalMode::FlatGaussian => Some(flat_normal(field, gaussian_idx, &dir)),
            };

            Some(Crossing {
                point,
                normal,
                gaussian_idx,
                pixel_idx: pix,
            })
        })
        .collect()
}

/// The governing Gaussian's shortest axis, sign-aligned with the ray so
/// it agrees with the density-gradient convention on the camera-side
/// shell: into the surface, toward the center.
fn flat_normal(field: &GaussianField, gaussian_idx: u32, ray_dir: &Vector3<f32>) -> Vector3<f32> {
    let axis = field.gaussians[gaussian_idx as usize].smallest_axis();
    if axis.dot(ray_dir) < 0.0 {
        -axis
    } else {
        axis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // Crossing detection and interpolation on a synthetic density array,
    // mirroring the per-pixel logic in march_pixel.
    fn first_crossing(densities: &[f32], ts: &[f32], level: f32) -> Option<f32> {
        let first_above = densities.iter().position(|&d| d > level)?;
        if first_above == 0 || densities[0] >= level {
            return None;
        }
        let (d0, d1) = (densities[first_above - 1], densities[first_above]);
        let (t0, t1) = (ts[first_above - 1], ts[first_above]);
        Some(t0 + (level - d0) * (t1 - t0) / (d1 - d0))
    }

    #[test]
    fn test_linear_interpolation_recovers_exact_root() {
        // density(t) = 0.2 + 0.3 * t, crossing level 0.5 at t = 1.
        let ts = [0.0, 0.5, 1.5, 2.0];
        let densities: Vec<f32> = ts.iter().map(|t| 0.2 + 0.3 * t).collect();
        let t = first_crossing(&densities, &ts, 0.5).unwrap();
        assert_relative_eq!(t, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_first_crossing_wins_on_noisy_density() {
        let ts = [0.0, 1.0, 2.0, 3.0, 4.0];
        // Crosses 0.5 between t=1 and t=2, dips, then crosses again.
        let densities = [0.1, 0.4, 0.6, 0.2, 0.9];
        let t = first_crossing(&densities, &ts, 0.5).unwrap();
        assert!(t > 1.0 && t < 2.0);
    }

    #[test]
    fn test_no_crossing_and_first_sample_above_are_empty() {
        let ts = [0.0, 1.0, 2.0];
        assert!(first_crossing(&[0.1, 0.2, 0.3], &ts, 0.5).is_none());
        assert!(first_crossing(&[0.9, 0.95, 1.0], &ts, 0.5).is_none());
    }

    #[test]
    fn test_flat_normal_aligns_with_the_ray() {
        use crate::core::{inverse_sigmoid, Gaussian};
        use crate::field::BetaMode;
        use nalgebra::UnitQuaternion;

        // Disc-shaped Gaussian, thin along z: the flat normal is +-z,
        // with the sign following the viewing ray.
        let gaussian = Gaussian::new(
            Vector3::zeros(),
            Vector3::new(0.0, 0.0, (0.1f32).ln()),
            UnitQuaternion::identity(),
            inverse_sigmoid(0.9),
            [[0.0; 3]; 16],
        );
        let field = GaussianField::new(vec![gaussian], 0, BetaMode::Average);

        let down = Vector3::new(0.0, 0.0, -1.0);
        assert_relative_eq!(flat_normal(&field, 0, &down), down, epsilon = 1e-6);
        assert_relative_eq!(
            flat_normal(&field, 0, &Vector3::z()),
            Vector3::z(),
            epsilon = 1e-6
        );
    }
}
