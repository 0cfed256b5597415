//! Level-surface extraction: per-camera ray marching through the density
//! field, point-cloud aggregation across cameras, and the hand-off to the
//! external reconstruction stack.
//!
//! Rasterization is a boundary, not an implementation concern: depth maps
//! come from either a triangle rasterizer fed with a splatted proxy mesh
//! ([`proxy::build_splat_mesh`]) or a Gaussian rasterizer rendering
//! per-Gaussian depth, both behind traits.

mod aggregate;
mod grid;
mod proxy;
mod ray_march;

pub use aggregate::{
    quantile, reconstruct, BoundingBoxPolicy, ReconstructionParams, SurfaceAggregator,
    SurfacePartition, SurfaceReconstructor, DEFAULT_BG_FACTOR, DEFAULT_FG_FACTOR,
};
pub use grid::{carve_box, sample_density_grid, DensityGrid};
pub use proxy::{build_splat_mesh, PrimitiveShape, TRIANGLES_PER_GAUSSIAN};
pub use ray_march::{
    extract_levels, LevelSurfacePoints, NormalMode, RayMarchConfig,
};

use thiserror::Error;

use crate::core::{Camera, GaussianField};
use crate::mesh::TriangleMesh;

/// Boxed error from an external rasterizer or reconstruction service.
pub type ExternalError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid bounding box: {0}")]
    BoundingBox(String),

    #[error("no surface points in either the foreground or the background partition")]
    EmptyPointCloud,

    #[error("surface reconstruction failed")]
    Reconstruction(#[source] ExternalError),

    #[error("depth rasterization failed")]
    Depth(#[source] ExternalError),
}

/// A per-pixel depth map with optional per-pixel face indices.
///
/// Row-major, `depth[v * width + u]`. Pixels with no valid depth hold a
/// non-positive depth; their face index (when present) is `u32::MAX`.
#[derive(Clone, Debug)]
pub struct DepthFragments {
    pub width: u32,
    pub height: u32,
    pub depth: Vec<f32>,
    /// Index of the triangle covering each pixel; `None` for depth maps
    /// produced without face tracking (Gaussian splatting path).
    pub face_idx: Option<Vec<u32>>,
}

impl DepthFragments {
    /// Sentinel face index for uncovered pixels.
    pub const NO_FACE: u32 = u32::MAX;

    pub fn pixel_count(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

/// Standard triangle rasterizer with z-buffer semantics: per-pixel depth
/// of the nearest covering triangle, plus that triangle's index.
pub trait TriangleDepthRasterizer {
    fn rasterize_depth(
        &self,
        mesh: &TriangleMesh,
        camera: &Camera,
    ) -> Result<DepthFragments, ExternalError>;
}

/// Gaussian rasterizer in depth mode: per-Gaussian depth splatted as the
/// rendered "color". Smoother silhouettes than the proxy mesh, at the
/// price of blur near edges.
pub trait GaussianDepthRasterizer {
    fn render_depth(
        &self,
        field: &GaussianField,
        camera: &Camera,
    ) -> Result<DepthFragments, ExternalError>;
}

/// Which depth path the ray marcher uses for step one.
pub enum DepthSource<'a> {
    /// Rasterize the camera-facing splatted proxy mesh (default, sharper
    /// silhouette). The governing Gaussian of a pixel is recovered from
    /// the hit face index.
    ProxyMesh {
        rasterizer: &'a dyn TriangleDepthRasterizer,
        shape: PrimitiveShape,
        triangle_scale: f32,
    },

    /// Render depth through the Gaussian rasterizer. The governing
    /// Gaussian of a pixel is the one with the nearest center.
    GaussianSplatting {
        rasterizer: &'a dyn GaussianDepthRasterizer,
    },
}
