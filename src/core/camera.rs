//! Camera model (pinhole camera with intrinsics and extrinsics).
//!
//! Cameras drive the extraction stage:
//! - Project Gaussian centers to pixels for proxy splatting
//! - Backproject depth-map pixels to world-space ray samples
//! - Compute viewing directions for SH color lookup

use nalgebra::{Matrix3, Matrix4, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// A pinhole camera with intrinsic and extrinsic parameters.
///
/// Extrinsics map world to camera space; camera space is right-handed
/// with +z pointing into the scene.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Camera {
    /// Focal length in X (pixels)
    pub fx: f32,

    /// Focal length in Y (pixels)
    pub fy: f32,

    /// Principal point X (pixels)
    pub cx: f32,

    /// Principal point Y (pixels)
    pub cy: f32,

    /// Image width (pixels)
    pub width: u32,

    /// Image height (pixels)
    pub height: u32,

    /// Rotation from world to camera coordinates
    pub rotation: Matrix3<f32>,

    /// Translation from world to camera coordinates
    pub translation: Vector3<f32>,
}

impl Camera {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fx: f32,
        fy: f32,
        cx: f32,
        cy: f32,
        width: u32,
        height: u32,
        rotation: Matrix3<f32>,
        translation: Vector3<f32>,
    ) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
            rotation,
            translation,
        }
    }

    /// Transform a point from world coordinates to camera coordinates.
    ///
    /// p_camera = R * p_world + t
    pub fn world_to_camera(&self, point_world: &Vector3<f32>) -> Vector3<f32> {
        self.rotation * point_world + self.translation
    }

    /// Project a point in camera coordinates to pixel coordinates.
    ///
    /// Returns None if the point is behind the camera (z <= 0).
    ///
    /// Projection: [u, v] = [fx * x/z + cx, fy * y/z + cy]
    pub fn project(&self, point_camera: &Vector3<f32>) -> Option<Vector2<f32>> {
        if point_camera.z <= 0.0 {
            return None;
        }

        let x = point_camera.x / point_camera.z;
        let y = point_camera.y / point_camera.z;

        let u = self.fx * x + self.cx;
        let v = self.fy * y + self.cy;

        Some(Vector2::new(u, v))
    }

    /// Project a point from world coordinates directly to pixel coordinates.
    pub fn world_to_pixel(&self, point_world: &Vector3<f32>) -> Option<Vector2<f32>> {
        let point_camera = self.world_to_camera(point_world);
        self.project(&point_camera)
    }

    /// Backproject pixel `(u, v)` at camera-space depth `depth` to a
    /// world-space point.
    ///
    /// Inverse of [`world_to_pixel`](Self::world_to_pixel): the returned
    /// point projects back to `(u, v)` and sits at z = `depth` in camera
    /// space.
    pub fn unproject_pixel(&self, u: f32, v: f32, depth: f32) -> Vector3<f32> {
        let x = (u - self.cx) / self.fx * depth;
        let y = (v - self.cy) / self.fy * depth;
        let point_camera = Vector3::new(x, y, depth);
        self.rotation.transpose() * (point_camera - self.translation)
    }

    /// The 4x4 world-to-camera matrix `[R | t]`.
    pub fn view_matrix(&self) -> Matrix4<f32> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Get the camera center in world coordinates.
    ///
    /// The camera looks from this point.
    pub fn camera_center(&self) -> Vector3<f32> {
        // Camera center in world: C = -R^T * t
        -self.rotation.transpose() * self.translation
    }

    /// Get the viewing direction for a point in world space.
    ///
    /// Used for spherical harmonics evaluation (view-dependent color).
    pub fn view_direction(&self, point_world: &Vector3<f32>) -> Vector3<f32> {
        let dir = point_world - self.camera_center();
        dir.normalize()
    }
}

/// Spatial extent of a camera rig: 1.1 times the largest distance from any
/// camera center to the centroid of all camera centers, and that centroid.
///
/// This scales the foreground/background partition boxes during surface
/// aggregation, and sets the thickness of mesh-bound Gaussians.
pub fn cameras_spatial_extent(cameras: &[Camera]) -> (f32, Vector3<f32>) {
    if cameras.is_empty() {
        return (0.0, Vector3::zeros());
    }

    let centers: Vec<Vector3<f32>> = cameras.iter().map(|c| c.camera_center()).collect();
    let centroid = centers.iter().sum::<Vector3<f32>>() / centers.len() as f32;
    let max_dist = centers
        .iter()
        .map(|c| (c - centroid).norm())
        .fold(0.0f32, f32::max);

    (1.1 * max_dist, centroid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_camera() -> Camera {
        Camera::new(
            100.0,
            100.0,
            50.0,
            50.0,
            100,
            100,
            Matrix3::identity(),
            Vector3::zeros(),
        )
    }

    #[test]
    fn test_camera_projection() {
        let cam = test_camera();

        // Point at (1, 0, 2) projects to (100*1/2 + 50, 100*0/2 + 50) = (100, 50)
        let world_point = Vector3::new(1.0, 0.0, 2.0);
        let pixel = cam.world_to_pixel(&world_point).unwrap();

        assert_relative_eq!(pixel.x, 100.0, epsilon = 1e-5);
        assert_relative_eq!(pixel.y, 50.0, epsilon = 1e-5);
    }

    #[test]
    fn test_point_behind_camera() {
        let cam = test_camera();
        let world_point = Vector3::new(0.0, 0.0, -1.0);
        assert!(cam.world_to_pixel(&world_point).is_none());
    }

    #[test]
    fn test_unproject_roundtrip() {
        let mut cam = test_camera();
        cam.rotation = nalgebra::Rotation3::from_euler_angles(0.1, -0.2, 0.3).into_inner();
        cam.translation = Vector3::new(0.5, -1.0, 2.0);

        let world_point = Vector3::new(0.3, 0.7, 4.0);
        let camera_point = cam.world_to_camera(&world_point);
        let pixel = cam.project(&camera_point).unwrap();
        let recovered = cam.unproject_pixel(pixel.x, pixel.y, camera_point.z);
        assert_relative_eq!(recovered, world_point, epsilon = 1e-4);
    }

    #[test]
    fn test_view_matrix_matches_world_to_camera() {
        let mut cam = test_camera();
        cam.rotation = nalgebra::Rotation3::from_euler_angles(0.2, 0.4, -0.1).into_inner();
        cam.translation = Vector3::new(1.0, -2.0, 0.5);

        let p = Vector3::new(0.3, 0.7, 4.0);
        let h = cam.view_matrix() * nalgebra::Vector4::new(p.x, p.y, p.z, 1.0);
        assert_relative_eq!(h.xyz(), cam.world_to_camera(&p), epsilon = 1e-5);
    }

    #[test]
    fn test_cameras_spatial_extent() {
        // Two cameras at ±2 on x: centroid at origin, max distance 2.
        let mut a = test_camera();
        a.translation = Vector3::new(-2.0, 0.0, 0.0);
        let mut b = test_camera();
        b.translation = Vector3::new(2.0, 0.0, 0.0);

        let (extent, centroid) = cameras_spatial_extent(&[a, b]);
        assert_relative_eq!(extent, 2.2, epsilon = 1e-5);
        assert_relative_eq!(centroid, Vector3::zeros(), epsilon = 1e-5);
    }
}
