//! Density and SDF evaluation of the Gaussian mixture field.
//!
//! A trained Gaussian set induces a scalar density field: each Gaussian
//! contributes `opacity * exp(-0.5 * mahalanobis²)` and the field value at
//! a query point is the sum over its K nearest Gaussians. The truncation
//! to K neighbors is a deliberate tradeoff; contributions decay
//! exponentially with distance, so the error is bounded.
//!
//! From density we derive a signed-distance-like field
//! `sdf = beta * (sqrt(-2 ln density) - sqrt(-2 ln threshold))`, zero where
//! density equals the threshold and growing as density falls off. `beta`
//! is a local length scale, see [`BetaMode`].

use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::GaussianField;

/// Exponent clamp applied before `exp(-0.5 * e)`; keeps far-away
/// neighbors from producing NaN through inf * 0 arithmetic.
const EXPONENT_MAX: f32 = 1e8;

/// SDF value reported for a query with no neighbors. Large but finite so
/// downstream arithmetic stays finite.
pub const SDF_SATURATION: f32 = 1e10;

/// How the local SDF length scale `beta` is derived at a query point.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum BetaMode {
    /// A single global learned value, shared by every query point.
    Learnable(f32),

    /// Mean of the K neighbors' minimum-axis scales.
    Average,

    /// Density-contribution-weighted average of the K neighbors'
    /// minimum-axis scales. When every neighbor contribution underflows
    /// to zero the weighted average is undefined; the fallback is the
    /// global maximum minimum-axis scale so beta never collapses to zero.
    WeightedAverage,
}

/// Evaluation options and numerical guards.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FieldEvalConfig {
    /// Multiplier applied to every Gaussian's contribution.
    pub density_factor: f32,

    /// Density value mapped to sdf = 0. Values above 1 are treated as 1.
    pub density_threshold: f32,

    /// Lower clamp for densities (and gradient denominators) before
    /// logarithms and divisions.
    pub opacity_min_clamp: f32,

    /// Elementwise magnitude clamp on the SDF gradient.
    pub sdf_grad_max: f32,

    /// Maximum number of query points processed per pass. Purely a
    /// memory bound; results are identical for any chunk size.
    pub n_points_per_pass: usize,

    /// Compute the SDF alongside density.
    pub with_sdf: bool,

    /// Compute the analytic SDF gradient (implies computing the SDF).
    pub with_sdf_grad: bool,

    /// Report the per-point beta used for the SDF.
    pub with_beta: bool,

    /// Report each query's per-neighbor density contributions.
    pub with_neighbor_contributions: bool,
}

impl Default for FieldEvalConfig {
    fn default() -> Self {
        Self {
            density_factor: 1.0,
            density_threshold: 1.0,
            opacity_min_clamp: 1e-16,
            sdf_grad_max: 10.0,
            n_points_per_pass: 2_000_000,
            with_sdf: false,
            with_sdf_grad: false,
            with_beta: false,
            with_neighbor_contributions: false,
        }
    }
}

/// Field values for a batch of query points. `density` is always
/// populated; the rest follow the flags in [`FieldEvalConfig`].
#[derive(Clone, Debug, Default)]
pub struct FieldValues {
    pub density: Vec<f32>,
    pub sdf: Option<Vec<f32>>,
    pub sdf_grad: Option<Vec<Vector3<f32>>>,
    pub beta: Option<Vec<f32>>,
    /// Per-query per-neighbor density contributions, parallel to each
    /// query's neighbor list.
    pub neighbor_contributions: Option<Vec<Vec<f32>>>,
}

/// Field values at a single query point.
#[derive(Clone, Copy, Debug)]
pub struct FieldSample {
    pub density: f32,
    pub sdf: f32,
    pub sdf_grad: Vector3<f32>,
    pub beta: f32,
}

/// Read-only snapshot of the per-Gaussian quantities density evaluation
/// needs: centers, opacity strengths, inverse-scaled rotations and
/// minimum-axis scales.
///
/// The snapshot does not track the field. Any mutation of the Gaussians
/// (pruning, rebinding, optimization steps) invalidates it; callers
/// create a fresh evaluator per pass, together with a fresh
/// [`NeighborIndex`](crate::neighbors::NeighborIndex).
pub struct DensityEvaluator {
    centers: Vec<Vector3<f32>>,
    strengths: Vec<f32>,
    inv_scaled_rotations: Vec<Matrix3<f32>>,
    min_axis_scales: Vec<f32>,
    max_min_axis_scale: f32,
    pub beta_mode: BetaMode,
}

impl DensityEvaluator {
    pub fn new(field: &GaussianField) -> Self {
        let centers = field.centers();
        let strengths = field.gaussians.iter().map(|g| g.opacity()).collect();
        let inv_scaled_rotations = field
            .gaussians
            .iter()
            .map(|g| g.scaled_rotation(true))
            .collect();
        let min_axis_scales: Vec<f32> = field
            .gaussians
            .iter()
            .map(|g| {
                let s = g.scale();
                s.x.min(s.y).min(s.z)
            })
            .collect();
        let max_min_axis_scale = min_axis_scales.iter().copied().fold(0.0f32, f32::max);

        Self {
            centers,
            strengths,
            inv_scaled_rotations,
            min_axis_scales,
            max_min_axis_scale,
            beta_mode: field.beta_mode,
        }
    }

    /// Number of Gaussians in the snapshot.
    pub fn len(&self) -> usize {
        self.centers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centers.is_empty()
    }

    /// Density at `point` from the given neighbor set, renormalized so the
    /// result never reaches 1 (raw values >= 1 map to `raw / (raw + eps)`,
    /// keeping the SDF logarithm finite).
    pub fn density_at(&self, point: &Vector3<f32>, neighbors: &[u32], density_factor: f32) -> f32 {
        renormalize_density(self.raw_density_at(point, neighbors, density_factor))
    }

    /// Unclamped mixture density at `point`.
    pub fn raw_density_at(
        &self,
        point: &Vector3<f32>,
        neighbors: &[u32],
        density_factor: f32,
    ) -> f32 {
        let mut density = 0.0f32;
        for &j in neighbors {
            let j = j as usize;
            let warped = self.inv_scaled_rotations[j].transpose() * (point - self.centers[j]);
            let exponent = warped.norm_squared().clamp(0.0, EXPONENT_MAX);
            density += density_factor * self.strengths[j] * (-0.5 * exponent).exp();
        }
        density
    }

    /// Per-neighbor density contributions at `point`, parallel to
    /// `neighbors`. Their sum is [`raw_density_at`](Self::raw_density_at).
    pub fn contributions_at(
        &self,
        point: &Vector3<f32>,
        neighbors: &[u32],
        density_factor: f32,
    ) -> Vec<f32> {
        neighbors
            .iter()
            .map(|&j| {
                let j = j as usize;
                let warped = self.inv_scaled_rotations[j].transpose() * (point - self.centers[j]);
                let exponent = warped.norm_squared().clamp(0.0, EXPONENT_MAX);
                density_factor * self.strengths[j] * (-0.5 * exponent).exp()
            })
            .collect()
    }

    /// Gradient of the (raw) density at `point`.
    ///
    /// Points density-uphill, toward the nearby Gaussian centers; the
    /// extraction stage uses `gradient.normalize()` directly as the
    /// (into-the-surface) normal at a level crossing.
    pub fn density_gradient_at(
        &self,
        point: &Vector3<f32>,
        neighbors: &[u32],
        density_factor: f32,
    ) -> Vector3<f32> {
        let mut grad = Vector3::zeros();
        for &j in neighbors {
            let j = j as usize;
            let m = &self.inv_scaled_rotations[j];
            let warped = m.transpose() * (point - self.centers[j]);
            let exponent = warped.norm_squared().clamp(0.0, EXPONENT_MAX);
            let contribution = density_factor * self.strengths[j] * (-0.5 * exponent).exp();
            grad -= contribution * (m * warped);
        }
        grad
    }

    /// Local SDF length scale at a query point, per the snapshot's mode.
    ///
    /// `contributions` are the per-neighbor density contributions; only
    /// the weighted-average mode reads them.
    pub fn beta_at(&self, neighbors: &[u32], contributions: &[f32]) -> f32 {
        match self.beta_mode {
            BetaMode::Learnable(beta) => beta,
            BetaMode::Average => {
                if neighbors.is_empty() {
                    return self.max_min_axis_scale;
                }
                let sum: f32 = neighbors
                    .iter()
                    .map(|&j| self.min_axis_scales[j as usize])
                    .sum();
                sum / neighbors.len() as f32
            }
            BetaMode::WeightedAverage => {
                let total: f32 = contributions.iter().sum();
                if total <= 0.0 || neighbors.is_empty() {
                    return self.max_min_axis_scale;
                }
                neighbors
                    .iter()
                    .zip(contributions)
                    .map(|(&j, w)| w * self.min_axis_scales[j as usize])
                    .sum::<f32>()
                    / total
            }
        }
    }

    /// Full field evaluation at a single point: density, SDF, SDF
    /// gradient and beta.
    pub fn field_values_at(
        &self,
        point: &Vector3<f32>,
        neighbors: &[u32],
        config: &FieldEvalConfig,
    ) -> FieldSample {
        if neighbors.is_empty() {
            return FieldSample {
                density: 0.0,
                sdf: SDF_SATURATION,
                sdf_grad: Vector3::zeros(),
                beta: self.beta_at(neighbors, &[]),
            };
        }

        let mut raw = 0.0f32;
        let mut grad = Vector3::zeros();
        let mut contributions = Vec::with_capacity(neighbors.len());
        for &j in neighbors {
            let j = j as usize;
            let m = &self.inv_scaled_rotations[j];
            let warped = m.transpose() * (point - self.centers[j]);
            let exponent = warped.norm_squared().clamp(0.0, EXPONENT_MAX);
            let contribution =
                config.density_factor * self.strengths[j] * (-0.5 * exponent).exp();
            raw += contribution;
            grad -= contribution * (m * warped);
            contributions.push(contribution);
        }

        let density = renormalize_density(raw);
        let beta = self.beta_at(neighbors, &contributions);

        let clamped = density.max(config.opacity_min_clamp);
        let log_term = (-2.0 * clamped.ln()).max(0.0).sqrt();
        let threshold_term = (-2.0 * config.density_threshold.min(1.0).ln()).max(0.0).sqrt();
        let sdf = beta * (log_term - threshold_term);

        // d(sdf)/d(density) = -beta / (density * sqrt(-2 ln density))
        let denom = (clamped * log_term).max(config.opacity_min_clamp);
        let sdf_grad = (-(beta / denom) * grad)
            .map(|c| c.clamp(-config.sdf_grad_max, config.sdf_grad_max));

        FieldSample {
            density,
            sdf,
            sdf_grad,
            beta,
        }
    }

    /// Batch evaluation over query points with one neighbor list each.
    ///
    /// Points are processed in passes of `n_points_per_pass`; chunking
    /// changes peak memory only, never the results.
    pub fn evaluate(
        &self,
        points: &[Vector3<f32>],
        neighbor_lists: &[Vec<u32>],
        config: &FieldEvalConfig,
    ) -> FieldValues {
        debug_assert_eq!(points.len(), neighbor_lists.len());
        let chunk = config.n_points_per_pass.max(1);

        let samples: Vec<FieldSample> = points
            .par_chunks(chunk)
            .zip(neighbor_lists.par_chunks(chunk))
            .flat_map_iter(|(pts, lists)| {
                pts.iter()
                    .zip(lists.iter())
                    .map(|(p, list)| self.field_values_at(p, list, config))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut values = FieldValues {
            density: samples.iter().map(|s| s.density).collect(),
            ..FieldValues::default()
        };
        if config.with_sdf || config.with_sdf_grad {
            values.sdf = Some(samples.iter().map(|s| s.sdf).collect());
        }
        if config.with_sdf_grad {
            values.sdf_grad = Some(samples.iter().map(|s| s.sdf_grad).collect());
        }
        if config.with_beta {
            values.beta = Some(samples.iter().map(|s| s.beta).collect());
        }
        if config.with_neighbor_contributions {
            values.neighbor_contributions = Some(
                points
                    .par_iter()
                    .zip(neighbor_lists.par_iter())
                    .map(|(p, list)| self.contributions_at(p, list, config.density_factor))
                    .collect(),
            );
        }
        values
    }
}

/// Forward renormalization of densities >= 1, keeping `ln(density)`
/// strictly negative for the SDF.
fn renormalize_density(raw: f32) -> f32 {
    if raw >= 1.0 {
        raw / (raw + 1e-12)
    } else {
        raw
    }
}
