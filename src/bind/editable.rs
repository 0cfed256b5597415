//! Deformation-aware re-derivation of bound Gaussian rotations and
//! scales.
//!
//! When the mesh is deformed after binding, the learned in-plane
//! parameters were fitted to the reference shape, not the deformed one.
//! The edited path compensates per triangle: the change in each vertex's
//! opening angle rotates the in-plane complex number, and the change in
//! edge lengths projected onto the (rotated) in-plane axes rescales the
//! footprint, so the Gaussians stretch and shear with their triangle.
//!
//! This path is optional and experimental; the default derivation in the
//! parent module ignores the reference entirely.

use nalgebra::{UnitQuaternion, Vector3};

use crate::bind::MeshBoundGaussians;
use crate::core::quaternion_from_columns;
use crate::mesh::TriangleMesh;

/// Reference vertex configuration captured by
/// [`make_editable`](MeshBoundGaussians::make_editable).
#[derive(Clone, Debug)]
pub struct EditableReference {
    vertices: Vec<Vector3<f32>>,
}

impl EditableReference {
    pub(super) fn capture(mesh: &TriangleMesh) -> Self {
        Self {
            vertices: mesh.vertices.clone(),
        }
    }
}

fn normalize_or_x(v: Vector3<f32>) -> Vector3<f32> {
    let len = v.norm();
    if len > 1e-12 {
        v / len
    } else {
        Vector3::x()
    }
}

/// Opening angle of each vertex axis against the first-edge base
/// direction. The third axis is negated, matching the convention of the
/// reference fit: without the flip the arccos collapses the third
/// vertex's angle onto the first's.
fn opening_angles(verts: &[Vector3<f32>; 3]) -> [f32; 3] {
    let base = normalize_or_x(verts[0] - verts[1]);
    let centroid = (verts[0] + verts[1] + verts[2]) / 3.0;
    let mut angles = [0.0f32; 3];
    for k in 0..3 {
        let mut axis = normalize_or_x(verts[k] - centroid);
        if k == 2 {
            axis = -axis;
        }
        angles[k] = axis.dot(&base).clamp(-1.0, 1.0).acos();
    }
    angles
}

pub(super) fn edited_rotations_and_scalings(
    bound: &MeshBoundGaussians,
    reference: &EditableReference,
) -> (Vec<UnitQuaternion<f32>>, Vec<Vector3<f32>>) {
    let mesh = bound.mesh();
    let n_per_triangle = bound.n_per_triangle();
    let mut quaternions = Vec::with_capacity(bound.len());
    let mut scalings = Vec::with_capacity(bound.len());

    for f in 0..mesh.face_count() {
        let [a, b, c] = mesh.faces[f];
        let verts = mesh.face_vertices(f);
        let ref_verts = [
            reference.vertices[a as usize],
            reference.vertices[b as usize],
            reference.vertices[c as usize],
        ];

        let normal = mesh.face_normal(f).unwrap_or_else(Vector3::z);
        let base_r1 = normalize_or_x(verts[0] - verts[1]);
        let base_r2 = normalize_or_x(normal.cross(&base_r1));

        // Per-vertex opening-angle change since the reference.
        let cur_angles = opening_angles(&verts);
        let ref_angles = opening_angles(&ref_verts);
        let deltas = [
            cur_angles[0] - ref_angles[0],
            cur_angles[1] - ref_angles[1],
            cur_angles[2] - ref_angles[2],
        ];

        // Per-vertex in-plane axes toward the centroid, with lengths
        // against the reference lengths, plus their in-plane orthogonals.
        let centroid = (verts[0] + verts[1] + verts[2]) / 3.0;
        let ref_centroid = (ref_verts[0] + ref_verts[1] + ref_verts[2]) / 3.0;
        let mut axes = [Vector3::zeros(); 3];
        let mut orthos = [Vector3::zeros(); 3];
        let mut len_ratios = [1.0f32; 3];
        for k in 0..3 {
            let axis = centroid - verts[k];
            let ref_len = (ref_centroid - ref_verts[k]).norm().max(1e-12);
            len_ratios[k] = axis.norm() / ref_len;
            axes[k] = normalize_or_x(axis);
            orthos[k] = axes[k].cross(&normal);
        }

        for g in 0..n_per_triangle {
            let i = f * n_per_triangle + g;
            let bary = bound.bary_coords[g];

            let angle: f32 = (0..3).map(|k| bary[k] * deltas[k]).sum();
            let (sin_a, cos_a) = angle.sin_cos();

            // Rotate the learned complex number by the angle adjustment.
            let [x, y] = {
                let [x, y] = bound.complex[i];
                let norm = (x * x + y * y).sqrt().max(1e-12);
                [x / norm, y / norm]
            };
            let cx = x * cos_a - y * sin_a;
            let cy = x * sin_a + y * cos_a;

            let r1 = cx * base_r1 + cy * base_r2;
            let r2 = -cy * base_r1 + cx * base_r2;
            quaternions.push(quaternion_from_columns(&normal, &r1, &r2));

            // Each in-plane axis decomposes onto (vertex axis, ortho);
            // the axis component stretches by the edge-length ratio.
            let mut scale_1 = 0.0f32;
            let mut scale_2 = 0.0f32;
            for k in 0..3 {
                let s1 = ((r1.dot(&axes[k]) * len_ratios[k]).powi(2)
                    + r1.dot(&orthos[k]).powi(2))
                .sqrt();
                let s2 = ((r2.dot(&axes[k]) * len_ratios[k]).powi(2)
                    + r2.dot(&orthos[k]).powi(2))
                .sqrt();
                scale_1 += bary[k] * s1;
                scale_2 += bary[k] * s2;
            }

            let [s0, s1] = bound.log_scales[i];
            scalings.push(Vector3::new(
                bound.thickness(),
                s0.exp() * scale_1,
                s1.exp() * scale_2,
            ));
        }
    }

    (quaternions, scalings)
}
