//! Regular-grid density sampling, the input to a marching-cubes style
//! reconstruction (the algorithm itself stays behind the external
//! reconstruction boundary).

use log::info;
use nalgebra::Vector3;
use rayon::prelude::*;

use crate::field::{DensityEvaluator, FieldEvalConfig};
use crate::neighbors::NeighborIndex;

/// Density values sampled over a regular grid inside an axis-aligned box.
///
/// Grid points include the box corners; values are stored x-fastest:
/// `values[ix + rx * (iy + ry * iz)]`.
#[derive(Clone, Debug)]
pub struct DensityGrid {
    pub min: Vector3<f32>,
    pub max: Vector3<f32>,
    pub resolution: [usize; 3],
    pub values: Vec<f32>,
}

impl DensityGrid {
    pub fn index(&self, ix: usize, iy: usize, iz: usize) -> usize {
        ix + self.resolution[0] * (iy + self.resolution[1] * iz)
    }

    /// World position of grid point `(ix, iy, iz)`.
    pub fn position(&self, ix: usize, iy: usize, iz: usize) -> Vector3<f32> {
        let t = |i: usize, r: usize, lo: f32, hi: f32| {
            if r > 1 {
                lo + (hi - lo) * i as f32 / (r - 1) as f32
            } else {
                0.5 * (lo + hi)
            }
        };
        Vector3::new(
            t(ix, self.resolution[0], self.min.x, self.max.x),
            t(iy, self.resolution[1], self.min.y, self.max.y),
            t(iz, self.resolution[2], self.min.z, self.max.z),
        )
    }
}

/// Sample the density field over a regular grid.
///
/// Each grid point uses its own k-nearest-neighbor set; points are
/// processed in passes of `config.n_points_per_pass`.
pub fn sample_density_grid(
    evaluator: &DensityEvaluator,
    knn: &NeighborIndex,
    min: Vector3<f32>,
    max: Vector3<f32>,
    resolution: [usize; 3],
    k: usize,
    config: &FieldEvalConfig,
) -> DensityGrid {
    let mut grid = DensityGrid {
        min,
        max,
        resolution,
        values: Vec::new(),
    };

    let total = resolution[0] * resolution[1] * resolution[2];
    info!("sampling density over a {resolution:?} grid ({total} points)");

    let positions: Vec<Vector3<f32>> = (0..total)
        .map(|i| {
            let ix = i % resolution[0];
            let iy = (i / resolution[0]) % resolution[1];
            let iz = i / (resolution[0] * resolution[1]);
            grid.position(ix, iy, iz)
        })
        .collect();

    grid.values = positions
        .par_chunks(config.n_points_per_pass.max(1))
        .flat_map_iter(|chunk| {
            chunk
                .iter()
                .map(|p| {
                    let neighbors = knn.query(p, k);
                    evaluator.density_at(p, &neighbors, config.density_factor)
                })
                .collect::<Vec<_>>()
        })
        .collect();

    grid
}

/// Zero out every grid value inside `[box_min, box_max]`.
///
/// Applied to a background grid so the foreground region, reconstructed
/// separately at higher resolution, is not duplicated.
pub fn carve_box(grid: &mut DensityGrid, box_min: Vector3<f32>, box_max: Vector3<f32>) {
    for iz in 0..grid.resolution[2] {
        for iy in 0..grid.resolution[1] {
            for ix in 0..grid.resolution[0] {
                let p = grid.position(ix, iy, iz);
                let inside =
                    (0..3).all(|a| p[a] >= box_min[a] && p[a] <= box_max[a]);
                if inside {
                    let i = grid.index(ix, iy, iz);
                    grid.values[i] = 0.0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{inverse_sigmoid, Gaussian, GaussianField, SH_COEFF_COUNT};
    use crate::field::BetaMode;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn field_at_origin() -> GaussianField {
        GaussianField::new(
            vec![Gaussian::new(
                Vector3::zeros(),
                Vector3::repeat(0.2f32.ln()),
                UnitQuaternion::identity(),
                inverse_sigmoid(1.0),
                [[0.0; 3]; SH_COEFF_COUNT],
            )],
            0,
            BetaMode::Average,
        )
    }

    #[test]
    fn test_grid_peaks_at_gaussian_center() {
        let field = field_at_origin();
        let eval = DensityEvaluator::new(&field);
        let knn = NeighborIndex::build(&field.centers(), 1).unwrap();
        let grid = sample_density_grid(
            &eval,
            &knn,
            Vector3::repeat(-1.0),
            Vector3::repeat(1.0),
            [5, 5, 5],
            1,
            &FieldEvalConfig::default(),
        );

        let center = grid.values[grid.index(2, 2, 2)];
        assert_relative_eq!(center, 1.0, epsilon = 1e-3);
        assert!(grid.values[grid.index(0, 0, 0)] < center);
        assert_eq!(grid.values.len(), 125);
    }

    #[test]
    fn test_carve_box_zeroes_interior() {
        let field = field_at_origin();
        let eval = DensityEvaluator::new(&field);
        let knn = NeighborIndex::build(&field.centers(), 1).unwrap();
        let mut grid = sample_density_grid(
            &eval,
            &knn,
            Vector3::repeat(-1.0),
            Vector3::repeat(1.0),
            [5, 5, 5],
            1,
            &FieldEvalConfig::default(),
        );
        carve_box(&mut grid, Vector3::repeat(-0.25), Vector3::repeat(0.25));
        assert_eq!(grid.values[grid.index(2, 2, 2)], 0.0);
        assert!(grid.values[grid.index(1, 2, 2)] > 0.0); // at x = -0.5
    }
}
