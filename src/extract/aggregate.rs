//! Cross-camera aggregation of level-surface points and the hand-off to
//! the external Poisson reconstruction service.
//!
//! Each camera contributes at most `points_per_frame` points per level so
//! frames weigh roughly equally regardless of how many pixels crossed the
//! surface. The aggregated cloud is split into a foreground box and a
//! background shell before reconstruction; Poisson handles the two scales
//! poorly when mixed.

use image::Rgb32FImage;
use log::info;
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::core::{cameras_spatial_extent, Camera};
use crate::extract::{ExternalError, ExtractError, LevelSurfacePoints};
use crate::mesh::{PointCloud, TriangleMesh};

/// Default foreground box half-width, in camera spatial extents.
pub const DEFAULT_FG_FACTOR: f32 = 1.0;

/// Default background shell half-width, in camera spatial extents.
pub const DEFAULT_BG_FACTOR: f32 = 4.0;

/// Color recorded for points when no rendered frame is available.
const FALLBACK_COLOR: Vector3<f32> = Vector3::new(0.5, 0.5, 0.5);

/// Where the foreground/background boxes come from.
#[derive(Clone, Copy, Debug)]
pub enum BoundingBoxPolicy {
    /// A user-supplied foreground box. The background shell still
    /// derives from the cameras' spatial extent.
    Custom {
        min: Vector3<f32>,
        max: Vector3<f32>,
    },

    /// Both boxes derived from the cameras' spatial extent, optionally
    /// re-centered on the cameras' centroid (instead of the world
    /// origin).
    CameraExtent {
        fg_factor: f32,
        bg_factor: f32,
        center_on_cameras: bool,
    },
}

impl Default for BoundingBoxPolicy {
    fn default() -> Self {
        Self::CameraExtent {
            fg_factor: DEFAULT_FG_FACTOR,
            bg_factor: DEFAULT_BG_FACTOR,
            center_on_cameras: false,
        }
    }
}

impl BoundingBoxPolicy {
    /// Build a policy from optional CLI-style min/max corners. Giving
    /// only one corner is a configuration error, caught here rather than
    /// deep inside the reconstruction.
    pub fn from_options(
        min: Option<Vector3<f32>>,
        max: Option<Vector3<f32>>,
        fg_factor: f32,
        bg_factor: f32,
        center_on_cameras: bool,
    ) -> Result<Self, ExtractError> {
        match (min, max) {
            (Some(min), Some(max)) => {
                if (0..3).any(|i| min[i] >= max[i]) {
                    return Err(ExtractError::BoundingBox(format!(
                        "min corner {min:?} must be strictly below max corner {max:?}"
                    )));
                }
                Ok(Self::Custom { min, max })
            }
            (None, None) => Ok(Self::CameraExtent {
                fg_factor,
                bg_factor,
                center_on_cameras,
            }),
            _ => Err(ExtractError::BoundingBox(
                "both min and max corners must be given, or neither".into(),
            )),
        }
    }
}

/// Aggregated point cloud split into object and environment parts.
#[derive(Clone, Debug, Default)]
pub struct SurfacePartition {
    pub foreground: PointCloud,
    pub background: PointCloud,
}

struct LevelAccum {
    points: Vec<Vector3<f32>>,
    normals: Vec<Vector3<f32>>,
    colors: Vec<Vector3<f32>>,
    view_dirs: Vec<Vector3<f32>>,
}

/// Accumulates per-frame extraction outputs into one cloud per level.
///
/// `accumulate` must be called in a fixed frame order for reproducible
/// clouds; the order decides which points survive the per-frame quota.
pub struct SurfaceAggregator {
    levels: Vec<f32>,
    points_per_frame: usize,
    rng: StdRng,
    accum: Vec<LevelAccum>,
}

impl SurfaceAggregator {
    pub fn new(levels: Vec<f32>, points_per_frame: usize, seed: u64) -> Self {
        let accum = levels
            .iter()
            .map(|_| LevelAccum {
                points: Vec::new(),
                normals: Vec::new(),
                colors: Vec::new(),
                view_dirs: Vec::new(),
            })
            .collect();
        Self {
            levels,
            points_per_frame,
            rng: StdRng::seed_from_u64(seed),
            accum,
        }
    }

    pub fn levels(&self) -> &[f32] {
        &self.levels
    }

    /// Points accumulated so far at level index `level_idx`.
    pub fn len(&self, level_idx: usize) -> usize {
        self.accum[level_idx].points.len()
    }

    /// Fold one camera's extraction outputs (parallel to `levels`) into
    /// the aggregate, subsampling down to the per-frame quota.
    ///
    /// Point colors are read from the rendered `frame_rgb` at each
    /// point's originating pixel (decoded with the camera's width); a
    /// missing or undersized frame yields a neutral gray. Points lacking
    /// normals get a view-aligned normal so the cloud stays
    /// Poisson-orientable, matching the into-the-surface orientation of
    /// the gradient normals. The viewing direction of every point is
    /// recorded alongside, for view-dependent color lookups downstream.
    pub fn accumulate(
        &mut self,
        outputs: &[LevelSurfacePoints],
        frame_rgb: Option<&Rgb32FImage>,
        camera: &Camera,
    ) {
        debug_assert_eq!(outputs.len(), self.levels.len());
        let camera_center = camera.camera_center();

        for (accum, out) in self.accum.iter_mut().zip(outputs) {
            let n = out.len();
            if n == 0 {
                continue;
            }

            let chosen: Vec<usize> = if n > self.points_per_frame {
                let mut idx =
                    rand::seq::index::sample(&mut self.rng, n, self.points_per_frame).into_vec();
                idx.sort_unstable();
                idx
            } else {
                (0..n).collect()
            };

            for &i in &chosen {
                let point = out.points[i];
                accum.points.push(point);

                let normal = match &out.normals {
                    Some(normals) => normals[i],
                    None => (point - camera_center).normalize(),
                };
                accum.normals.push(normal);
                accum.view_dirs.push(camera.view_direction(&point));

                let color = match frame_rgb {
                    Some(rgb) => {
                        let u = out.pixel_idx[i] % camera.width;
                        let v = out.pixel_idx[i] / camera.width;
                        if u < rgb.width() && v < rgb.height() {
                            let p = rgb.get_pixel(u, v).0;
                            Vector3::new(p[0], p[1], p[2])
                        } else {
                            FALLBACK_COLOR
                        }
                    }
                    None => FALLBACK_COLOR,
                };
                accum.colors.push(color);
            }
        }
    }

    /// Partition the aggregate at `level_idx` into foreground and
    /// background clouds per the bounding-box policy. Points outside both
    /// boxes are dropped.
    pub fn finalize(
        &self,
        level_idx: usize,
        policy: &BoundingBoxPolicy,
        cameras: &[Camera],
    ) -> Result<SurfacePartition, ExtractError> {
        let accum = &self.accum[level_idx];

        let needs_cameras = !matches!(policy, BoundingBoxPolicy::Custom { .. });
        if cameras.is_empty() && needs_cameras {
            return Err(ExtractError::BoundingBox(
                "cannot derive a bounding box from zero cameras".into(),
            ));
        }
        let (extent, centroid) = cameras_spatial_extent(cameras);

        let (fg_min, fg_max, bg_center, bg_half) = match *policy {
            BoundingBoxPolicy::Custom { min, max } => {
                (min, max, centroid, DEFAULT_BG_FACTOR * extent)
            }
            BoundingBoxPolicy::CameraExtent {
                fg_factor,
                bg_factor,
                center_on_cameras,
            } => {
                let center = if center_on_cameras {
                    centroid
                } else {
                    Vector3::zeros()
                };
                (
                    center - Vector3::repeat(fg_factor * extent),
                    center + Vector3::repeat(fg_factor * extent),
                    center,
                    bg_factor * extent,
                )
            }
        };

        let mut partition = SurfacePartition::default();
        for i in 0..accum.points.len() {
            let p = accum.points[i];
            let in_fg = (0..3).all(|a| p[a] >= fg_min[a] && p[a] <= fg_max[a]);
            let cloud = if in_fg {
                &mut partition.foreground
            } else {
                let shifted = p - bg_center;
                let linf = shifted.x.abs().max(shifted.y.abs()).max(shifted.z.abs());
                if linf >= bg_half {
                    continue;
                }
                &mut partition.background
            };
            cloud.points.push(p);
            cloud.normals.push(accum.normals[i]);
            cloud.colors.push(accum.colors[i]);
            cloud.view_directions.push(accum.view_dirs[i]);
        }

        info!(
            "partitioned level {} into {} foreground / {} background points",
            self.levels[level_idx],
            partition.foreground.len(),
            partition.background.len()
        );
        Ok(partition)
    }
}

/// External Poisson reconstruction, decimation and cleanup service.
///
/// `poisson_reconstruct` returns the mesh together with a per-vertex
/// density estimate (reconstruction confidence), used for quantile
/// pruning before decimation.
pub trait SurfaceReconstructor {
    fn poisson_reconstruct(
        &self,
        cloud: &PointCloud,
        depth: u32,
    ) -> Result<(TriangleMesh, Vec<f32>), ExternalError>;

    fn decimate(
        &self,
        mesh: TriangleMesh,
        target_faces: usize,
    ) -> Result<TriangleMesh, ExternalError>;

    /// Remove degenerate/duplicated triangles and vertices and
    /// non-manifold edges.
    fn cleanup(&self, mesh: TriangleMesh) -> Result<TriangleMesh, ExternalError>;
}

#[derive(Clone, Copy, Debug)]
pub struct ReconstructionParams {
    /// Poisson octree depth.
    pub poisson_depth: u32,

    /// Fraction of lowest-density Poisson vertices pruned before
    /// decimation. Zero disables pruning.
    pub vertex_density_quantile: f32,

    /// Decimation target for the foreground mesh, in triangles.
    pub fg_target_faces: usize,

    /// Decimation target for the background mesh, in triangles.
    pub bg_target_faces: usize,

    /// Run the service's cleanup pass after decimation.
    pub cleanup: bool,
}

impl Default for ReconstructionParams {
    fn default() -> Self {
        Self {
            poisson_depth: 10,
            vertex_density_quantile: 0.1,
            fg_target_faces: 200_000,
            bg_target_faces: 200_000,
            cleanup: true,
        }
    }
}

/// Reconstruct a mesh from a partitioned cloud: Poisson per non-empty
/// part, density-quantile vertex pruning, decimation, cleanup, then a
/// union of the two parts. Errors when both parts are empty.
pub fn reconstruct(
    partition: &SurfacePartition,
    service: &dyn SurfaceReconstructor,
    params: &ReconstructionParams,
) -> Result<TriangleMesh, ExtractError> {
    if partition.foreground.is_empty() && partition.background.is_empty() {
        return Err(ExtractError::EmptyPointCloud);
    }

    let mut merged = TriangleMesh::default();
    let parts = [
        ("foreground", &partition.foreground, params.fg_target_faces),
        ("background", &partition.background, params.bg_target_faces),
    ];
    for (name, cloud, target_faces) in parts {
        if cloud.is_empty() {
            continue;
        }
        info!("poisson reconstruction of {} ({} points)", name, cloud.len());
        let (mut mesh, densities) = service
            .poisson_reconstruct(cloud, params.poisson_depth)
            .map_err(ExtractError::Reconstruction)?;

        if params.vertex_density_quantile > 0.0 && !densities.is_empty() {
            let threshold = quantile(&densities, params.vertex_density_quantile);
            let remove: Vec<bool> = densities.iter().map(|&d| d < threshold).collect();
            let before = mesh.vertex_count();
            mesh.remove_vertices_by_mask(&remove);
            info!(
                "pruned {} low-density vertices from the {} mesh",
                before - mesh.vertex_count(),
                name
            );
        }

        let mut mesh = service
            .decimate(mesh, target_faces)
            .map_err(ExtractError::Reconstruction)?;
        mesh.remove_degenerate_faces(0.0);
        if params.cleanup {
            mesh = service
                .cleanup(mesh)
                .map_err(ExtractError::Reconstruction)?;
        }
        merged.merge(mesh);
    }

    info!(
        "reconstructed mesh: {} vertices, {} faces",
        merged.vertex_count(),
        merged.face_count()
    );
    Ok(merged)
}

/// Linear-interpolation quantile of an unsorted, non-empty sample.
pub fn quantile(values: &[f32], q: f32) -> f32 {
    debug_assert!(!values.is_empty());
    let mut sorted = values.to_vec();
    sorted.sort_by(f32::total_cmp);
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f32;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f32;
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    fn camera_at(center: Vector3<f32>) -> Camera {
        // Identity rotation: translation = -center.
        Camera::new(
            100.0,
            100.0,
            50.0,
            50.0,
            100,
            100,
            Matrix3::identity(),
            -center,
        )
    }

    fn frame_output(level: f32, points: Vec<Vector3<f32>>) -> LevelSurfacePoints {
        let n = points.len();
        LevelSurfacePoints {
            level,
            normals: Some(vec![Vector3::z(); n]),
            gaussian_idx: vec![0; n],
            pixel_idx: (0..n as u32).collect(),
            points,
        }
    }

    #[test]
    fn test_quantile() {
        let values = [4.0, 1.0, 3.0, 2.0];
        assert_relative_eq!(quantile(&values, 0.0), 1.0);
        assert_relative_eq!(quantile(&values, 1.0), 4.0);
        assert_relative_eq!(quantile(&values, 0.5), 2.5, epsilon = 1e-6);
    }

    #[test]
    fn test_from_options_requires_both_corners() {
        let min = Vector3::new(-1.0, -1.0, -1.0);
        let max = Vector3::new(1.0, 1.0, 1.0);
        assert!(BoundingBoxPolicy::from_options(Some(min), Some(max), 1.0, 4.0, false).is_ok());
        assert!(matches!(
            BoundingBoxPolicy::from_options(Some(min), None, 1.0, 4.0, false),
            Err(ExtractError::BoundingBox(_))
        ));
        assert!(matches!(
            BoundingBoxPolicy::from_options(Some(max), Some(min), 1.0, 4.0, false),
            Err(ExtractError::BoundingBox(_))
        ));
    }

    #[test]
    fn test_per_frame_quota() {
        let mut agg = SurfaceAggregator::new(vec![0.3], 10, 42);
        let camera = camera_at(Vector3::new(0.0, 0.0, 5.0));
        let points: Vec<Vector3<f32>> =
            (0..100).map(|i| Vector3::new(i as f32, 0.0, 0.0)).collect();

        agg.accumulate(&[frame_output(0.3, points.clone())], None, &camera);
        assert_eq!(agg.len(0), 10);
        // A second frame adds its own quota.
        agg.accumulate(&[frame_output(0.3, points)], None, &camera);
        assert_eq!(agg.len(0), 20);
    }

    #[test]
    fn test_partition_three_zones() {
        let mut agg = SurfaceAggregator::new(vec![0.3], 100, 0);
        // Cameras around the origin at distance 2: extent = 2.2.
        let cameras = vec![
            camera_at(Vector3::new(2.0, 0.0, 0.0)),
            camera_at(Vector3::new(-2.0, 0.0, 0.0)),
        ];
        let points = vec![
            Vector3::new(0.5, 0.0, 0.0),  // foreground (|x| < 2.2)
            Vector3::new(5.0, 0.0, 0.0),  // background (2.2 < |x| < 8.8)
            Vector3::new(20.0, 0.0, 0.0), // dropped
        ];
        agg.accumulate(&[frame_output(0.3, points)], None, &cameras[0]);

        let policy = BoundingBoxPolicy::default();
        let partition = agg.finalize(0, &policy, &cameras).unwrap();
        assert_eq!(partition.foreground.len(), 1);
        assert_eq!(partition.background.len(), 1);
        assert_relative_eq!(partition.foreground.points[0].x, 0.5);
        assert_relative_eq!(partition.background.points[0].x, 5.0);
    }

    #[test]
    fn test_accumulate_records_view_directions() {
        let mut agg = SurfaceAggregator::new(vec![0.3], 10, 7);
        let cameras = vec![camera_at(Vector3::new(0.0, 0.0, 5.0))];
        let point = Vector3::new(1.0, 0.0, 0.0);
        agg.accumulate(&[frame_output(0.3, vec![point])], None, &cameras[0]);

        let policy = BoundingBoxPolicy::Custom {
            min: Vector3::repeat(-2.0),
            max: Vector3::repeat(2.0),
        };
        let partition = agg.finalize(0, &policy, &cameras).unwrap();
        assert_eq!(partition.foreground.view_directions.len(), 1);
        let expected = (point - Vector3::new(0.0, 0.0, 5.0)).normalize();
        assert_relative_eq!(
            partition.foreground.view_directions[0],
            expected,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_undersized_frame_falls_back_to_gray() {
        let mut agg = SurfaceAggregator::new(vec![0.3], 10, 7);
        let cameras = vec![camera_at(Vector3::new(0.0, 0.0, 5.0))];

        // Two points: one whose pixel fits in the 2x2 frame, one whose
        // pixel (99, 99) lies outside it.
        let mut out = frame_output(0.3, vec![Vector3::zeros(), Vector3::x()]);
        out.pixel_idx = vec![101, 99 * 100 + 99];
        let mut rgb = Rgb32FImage::new(2, 2);
        rgb.put_pixel(1, 1, image::Rgb([1.0, 0.0, 0.0]));
        agg.accumulate(&[out], Some(&rgb), &cameras[0]);

        let policy = BoundingBoxPolicy::Custom {
            min: Vector3::repeat(-2.0),
            max: Vector3::repeat(2.0),
        };
        let partition = agg.finalize(0, &policy, &cameras).unwrap();
        assert_eq!(partition.foreground.len(), 2);
        assert_relative_eq!(
            partition.foreground.colors[0],
            Vector3::new(1.0, 0.0, 0.0)
        );
        assert_relative_eq!(partition.foreground.colors[1], FALLBACK_COLOR);
    }

    struct StubReconstructor;
    impl SurfaceReconstructor for StubReconstructor {
        fn poisson_reconstruct(
            &self,
            cloud: &PointCloud,
            _depth: u32,
        ) -> Result<(TriangleMesh, Vec<f32>), ExternalError> {
            // One triangle near the first point, with one low-density
            // extra vertex that pruning should remove.
            let base = cloud.points[0];
            let mesh = TriangleMesh {
                vertices: vec![
                    base,
                    base + Vector3::x(),
                    base + Vector3::y(),
                    base + Vector3::z(),
                ],
                faces: vec![[0, 1, 2], [1, 2, 3]],
                colors: None,
                normals: None,
            };
            Ok((mesh, vec![1.0, 1.0, 1.0, 0.01]))
        }

        fn decimate(
            &self,
            mesh: TriangleMesh,
            _target_faces: usize,
        ) -> Result<TriangleMesh, ExternalError> {
            Ok(mesh)
        }

        fn cleanup(&self, mesh: TriangleMesh) -> Result<TriangleMesh, ExternalError> {
            Ok(mesh)
        }
    }

    #[test]
    fn test_reconstruct_prunes_and_merges() {
        let cloud = PointCloud {
            points: vec![Vector3::zeros()],
            normals: vec![Vector3::z()],
            colors: vec![Vector3::repeat(0.5)],
            view_directions: vec![-Vector3::z()],
        };
        let partition = SurfacePartition {
            foreground: cloud.clone(),
            background: cloud,
        };
        let params = ReconstructionParams {
            vertex_density_quantile: 0.2,
            ..ReconstructionParams::default()
        };
        let mesh = reconstruct(&partition, &StubReconstructor, &params).unwrap();
        // Per part: the low-density vertex and its face are pruned, one
        // triangle survives; two parts merged.
        assert_eq!(mesh.face_count(), 2);
        assert_eq!(mesh.vertex_count(), 6);
    }

    #[test]
    fn test_reconstruct_errors_on_empty_partition() {
        let err = reconstruct(
            &SurfacePartition::default(),
            &StubReconstructor,
            &ReconstructionParams::default(),
        );
        assert!(matches!(err, Err(ExtractError::EmptyPointCloud)));
    }
}
