//! Triangle mesh and oriented point cloud boundary types.
//!
//! These are the currency exchanged with the external reconstruction
//! stack: the aggregator produces an oriented `PointCloud`, the Poisson
//! service returns a `TriangleMesh`, and the binder consumes the mesh.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// An indexed triangle mesh with optional per-vertex color and normal.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TriangleMesh {
    pub vertices: Vec<Vector3<f32>>,
    pub faces: Vec<[u32; 3]>,
    /// Per-vertex RGB in [0, 1].
    pub colors: Option<Vec<Vector3<f32>>>,
    pub normals: Option<Vec<Vector3<f32>>>,
}

impl TriangleMesh {
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// The three vertex positions of face `i`.
    pub fn face_vertices(&self, i: usize) -> [Vector3<f32>; 3] {
        let [a, b, c] = self.faces[i];
        [
            self.vertices[a as usize],
            self.vertices[b as usize],
            self.vertices[c as usize],
        ]
    }

    /// Unnormalized face normal `(v1 - v0) × (v2 - v0)`.
    ///
    /// Its length is twice the face area; zero for degenerate faces.
    pub fn face_normal_raw(&self, i: usize) -> Vector3<f32> {
        let [v0, v1, v2] = self.face_vertices(i);
        (v1 - v0).cross(&(v2 - v0))
    }

    /// Unit face normal, or `None` for a degenerate face.
    pub fn face_normal(&self, i: usize) -> Option<Vector3<f32>> {
        let n = self.face_normal_raw(i);
        let len = n.norm();
        if len > 0.0 {
            Some(n / len)
        } else {
            None
        }
    }

    pub fn face_area(&self, i: usize) -> f32 {
        0.5 * self.face_normal_raw(i).norm()
    }

    pub fn face_centroid(&self, i: usize) -> Vector3<f32> {
        let [v0, v1, v2] = self.face_vertices(i);
        (v0 + v1 + v2) / 3.0
    }

    /// Shortest edge length of face `i`.
    pub fn face_min_edge(&self, i: usize) -> f32 {
        let [v0, v1, v2] = self.face_vertices(i);
        (v0 - v1)
            .norm()
            .min((v1 - v2).norm())
            .min((v2 - v0).norm())
    }

    /// Remove every vertex whose mask entry is true, along with all faces
    /// touching a removed vertex. Surviving face indices are remapped.
    ///
    /// Used to prune low-confidence Poisson vertices by density quantile.
    pub fn remove_vertices_by_mask(&mut self, remove: &[bool]) {
        debug_assert_eq!(remove.len(), self.vertices.len());

        let mut remap = vec![u32::MAX; self.vertices.len()];
        let mut kept = 0u32;
        for (i, &gone) in remove.iter().enumerate() {
            if !gone {
                remap[i] = kept;
                kept += 1;
            }
        }

        let keep_vertex = |i: usize| remap[i] != u32::MAX;
        let mut next = 0usize;
        for i in 0..self.vertices.len() {
            if keep_vertex(i) {
                self.vertices.swap(next, i);
                next += 1;
            }
        }
        self.vertices.truncate(next);

        for attr in [&mut self.colors, &mut self.normals] {
            if let Some(values) = attr {
                let mut next = 0usize;
                for i in 0..remove.len() {
                    if keep_vertex(i) {
                        values.swap(next, i);
                        next += 1;
                    }
                }
                values.truncate(next);
            }
        }

        self.faces.retain_mut(|face| {
            for v in face.iter_mut() {
                let mapped = remap[*v as usize];
                if mapped == u32::MAX {
                    return false;
                }
                *v = mapped;
            }
            true
        });
    }

    /// Drop faces with repeated vertex indices or near-zero area.
    /// Returns the number of faces removed.
    pub fn remove_degenerate_faces(&mut self, min_area: f32) -> usize {
        let before = self.faces.len();
        let vertices = &self.vertices;
        self.faces.retain(|&[a, b, c]| {
            if a == b || b == c || a == c {
                return false;
            }
            let v0 = vertices[a as usize];
            let v1 = vertices[b as usize];
            let v2 = vertices[c as usize];
            0.5 * (v1 - v0).cross(&(v2 - v0)).norm() > min_area
        });
        before - self.faces.len()
    }

    /// Append `other` to this mesh, offsetting its face indices.
    ///
    /// Optional attributes survive only when both inputs carry them.
    pub fn merge(&mut self, other: TriangleMesh) {
        let offset = self.vertices.len() as u32;
        self.vertices.extend(other.vertices);
        self.faces
            .extend(other.faces.into_iter().map(|[a, b, c]| {
                [a + offset, b + offset, c + offset]
            }));

        self.colors = match (self.colors.take(), other.colors) {
            (Some(mut a), Some(b)) => {
                a.extend(b);
                Some(a)
            }
            _ => None,
        };
        self.normals = match (self.normals.take(), other.normals) {
            (Some(mut a), Some(b)) => {
                a.extend(b);
                Some(a)
            }
            _ => None,
        };
    }
}

/// An oriented point cloud: positions with per-point normals, colors and
/// viewing directions.
///
/// Poisson reconstruction requires orientation, so `normals` is not
/// optional here.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PointCloud {
    pub points: Vec<Vector3<f32>>,
    pub normals: Vec<Vector3<f32>>,
    /// Per-point RGB in [0, 1].
    pub colors: Vec<Vector3<f32>>,
    /// Unit direction from the observing camera to each point, kept for
    /// view-dependent color lookups after reconstruction.
    pub view_directions: Vec<Vector3<f32>>,
}

impl PointCloud {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
