//! Camera-facing proxy mesh built from per-Gaussian footprints.
//!
//! Each Gaussian is replaced by a small planar primitive (a diamond or a
//! square, two triangles) spanning its two largest axes, so the flattest
//! axis faces away from the footprint plane. The primitives are then
//! "splatted": every vertex is pushed along its camera ray onto the
//! sphere through the Gaussian's center, which makes the rasterized depth
//! of the footprint equal the depth of the center it stands in for.

use nalgebra::Vector3;

use crate::core::{sh_dc_to_rgb, Camera, GaussianField};
use crate::mesh::TriangleMesh;

/// Footprint primitive replacing each Gaussian in the proxy mesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimitiveShape {
    /// Four-vertex diamond; the default, sharper silhouette.
    Diamond,
    /// Axis-aligned square, covering more of the footprint's corners.
    Square,
}

/// Canonical vertices in the Gaussian's sorted local frame. The first
/// coordinate (the flattest axis) is always zero.
const DIAMOND_VERTS: [[f32; 3]; 4] = [
    [0.0, -1.0, 0.0],
    [0.0, 0.0, 1.0],
    [0.0, 1.0, 0.0],
    [0.0, 0.0, -1.0],
];
const SQUARE_VERTS: [[f32; 3]; 4] = [
    [0.0, -1.0, 1.0],
    [0.0, 1.0, 1.0],
    [0.0, 1.0, -1.0],
    [0.0, -1.0, -1.0],
];
const PRIMITIVE_TRIANGLES: [[u32; 3]; 2] = [[0, 2, 1], [0, 3, 2]];

/// Triangles per Gaussian in the proxy mesh; a rasterized face index `f`
/// maps back to Gaussian `f / TRIANGLES_PER_GAUSSIAN`.
pub const TRIANGLES_PER_GAUSSIAN: u32 = 2;

/// Build the splatted proxy mesh for `camera`.
///
/// `triangle_scale` stretches the footprints beyond one standard
/// deviation so neighboring footprints overlap and the rasterized
/// silhouette closes (default 2).
pub fn build_splat_mesh(
    field: &GaussianField,
    camera: &Camera,
    shape: PrimitiveShape,
    triangle_scale: f32,
) -> TriangleMesh {
    let template = match shape {
        PrimitiveShape::Diamond => &DIAMOND_VERTS,
        PrimitiveShape::Square => &SQUARE_VERTS,
    };

    let n = field.len();
    let mut vertices = Vec::with_capacity(n * 4);
    let mut colors = Vec::with_capacity(n * 4);
    let mut faces = Vec::with_capacity(n * 2);

    for (i, g) in field.gaussians.iter().enumerate() {
        let scale = g.scale();
        let rot = g.rotation.to_rotation_matrix().into_inner();

        // Cyclic axis permutation putting the flattest axis first, so the
        // zero coordinate of the template lands on it.
        let a0 = scale.imin();
        let perm = [a0, (a0 + 1) % 3, (a0 + 2) % 3];

        let color = sh_dc_to_rgb(&Vector3::new(
            g.sh_coeffs[0][0],
            g.sh_coeffs[0][1],
            g.sh_coeffs[0][2],
        ));

        let center_cs = camera.world_to_camera(&g.position);
        let center_norm = center_cs.norm();
        let proj_dir = if center_norm > 0.0 {
            center_cs / center_norm
        } else {
            Vector3::z()
        };

        for t in template {
            let mut offset = Vector3::zeros();
            for (j, &coord) in t.iter().enumerate() {
                let axis = perm[j];
                offset += rot.column(axis).into_owned() * (coord * triangle_scale * scale[axis]);
            }
            let vert = g.position + offset;

            // Perspective squash: slide the vertex along its own camera
            // ray onto the sphere through the Gaussian center.
            let vert_cs = camera.world_to_camera(&vert);
            let vert_proj = vert_cs.dot(&proj_dir);
            let squashed_cs = if vert_proj.abs() > 1e-12 {
                (center_norm / vert_proj) * vert_cs
            } else {
                vert_cs
            };
            let squashed = camera.rotation.transpose() * (squashed_cs - camera.translation);

            vertices.push(squashed);
            colors.push(color);
        }

        let base = (i * 4) as u32;
        for tri in &PRIMITIVE_TRIANGLES {
            faces.push([base + tri[0], base + tri[1], base + tri[2]]);
        }
    }

    TriangleMesh {
        vertices,
        faces,
        colors: Some(colors),
        normals: None,
    }
}
