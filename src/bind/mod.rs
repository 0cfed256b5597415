//! Binding Gaussians to mesh triangles for surface-aligned refinement.
//!
//! Each triangle carries a fixed number of Gaussians at precomputed
//! barycentric coordinates. A bound Gaussian has no independent 3D pose:
//! its position, rotation and scale are derived on demand from the
//! current vertex positions plus a small set of learned in-plane
//! parameters (a unit complex number for the 2D rotation, two log-scales,
//! opacity and color). The out-of-plane axis is locked to the face
//! normal, so the Gaussians behave like a surface texture as the mesh
//! deforms.

mod editable;

pub use editable::EditableReference;

use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use thiserror::Error;

use crate::core::{
    inverse_sigmoid, quaternion_from_columns, rgb_to_sh_dc, sigmoid, Gaussian, GaussianField,
    ShCoefficients, MIN_BIND_SCALE, SH_COEFF_COUNT,
};
use crate::field::BetaMode;
use crate::mesh::TriangleMesh;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("unsupported number of gaussians per triangle: {0} (must be 1, 3, 4 or 6)")]
    InvalidGaussiansPerTriangle(usize),

    #[error("triangle {0} is degenerate")]
    DegenerateTriangle(usize),

    #[error("no editable reference captured; call make_editable first")]
    NotEditable,
}

/// Barycentric placement table and footprint circumradius for a
/// supported per-triangle count.
///
/// The circumradius scales the initial in-plane extent so the placed
/// circles tile the face without overlapping.
pub fn barycentric_table(n: usize) -> Result<(Vec<[f32; 3]>, f32), BindError> {
    let sqrt3 = 3.0f32.sqrt();
    let third = 1.0 / 3.0;
    let sixth = 1.0 / 6.0;
    match n {
        1 => Ok((vec![[third, third, third]], 1.0 / (2.0 * sqrt3))),
        3 => Ok((
            vec![
                [0.5, 0.25, 0.25],
                [0.25, 0.5, 0.25],
                [0.25, 0.25, 0.5],
            ],
            1.0 / (2.0 * (sqrt3 + 1.0)),
        )),
        4 => Ok((
            vec![
                [third, third, third],
                [2.0 * third, sixth, sixth],
                [sixth, 2.0 * third, sixth],
                [sixth, sixth, 2.0 * third],
            ],
            1.0 / (4.0 * sqrt3),
        )),
        6 => Ok((
            vec![
                [2.0 * third, sixth, sixth],
                [sixth, 2.0 * third, sixth],
                [sixth, sixth, 2.0 * third],
                [sixth, 5.0 / 12.0, 5.0 / 12.0],
                [5.0 / 12.0, sixth, 5.0 / 12.0],
                [5.0 / 12.0, 5.0 / 12.0, sixth],
            ],
            1.0 / (4.0 + 2.0 * sqrt3),
        )),
        other => Err(BindError::InvalidGaussiansPerTriangle(other)),
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BindConfig {
    /// Scene spatial extent, used to derive the default thickness.
    pub scene_extent: f32,

    /// Out-of-plane scale shared by every bound Gaussian. Defaults to
    /// `scene_extent / 1_000_000`, effectively flat.
    pub thickness: Option<f32>,

    /// When true, opacity starts at a small learnable logit (0.1);
    /// otherwise it is pinned near one.
    pub learnable_opacity: bool,

    /// Active SH degree carried over to the bound color coefficients.
    pub sh_degree: u32,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            scene_extent: 1.0,
            thickness: None,
            learnable_opacity: false,
            sh_degree: 3,
        }
    }
}

/// A mesh with `n_per_triangle` Gaussians bound to each face.
///
/// Invariant: the number of bound Gaussians is always
/// `face_count * n_per_triangle`; face edits go through
/// [`set_vertices`](Self::set_vertices) which cannot change face count.
pub struct MeshBoundGaussians {
    mesh: TriangleMesh,
    n_per_triangle: usize,
    bary_coords: Vec<[f32; 3]>,
    thickness: f32,
    sh_degree: u32,
    reference: Option<EditableReference>,

    /// Learned unit complex number per bound Gaussian: the in-plane 2D
    /// rotation.
    pub complex: Vec<[f32; 2]>,

    /// Learned in-plane log-scales per bound Gaussian.
    pub log_scales: Vec<[f32; 2]>,

    /// Learned opacity logits per bound Gaussian.
    pub opacity_logits: Vec<f32>,

    /// Learned SH color coefficients per bound Gaussian.
    pub sh_coeffs: Vec<ShCoefficients>,
}

impl MeshBoundGaussians {
    /// Bind `n_per_triangle` Gaussians to every face of `mesh`.
    ///
    /// Fails on unsupported counts and on degenerate faces; callers
    /// clean the mesh first (see
    /// [`remove_degenerate_faces`](TriangleMesh::remove_degenerate_faces)).
    pub fn bind(
        mesh: TriangleMesh,
        n_per_triangle: usize,
        config: &BindConfig,
    ) -> Result<Self, BindError> {
        let (bary_coords, circle_radius) = barycentric_table(n_per_triangle)?;
        let n_faces = mesh.face_count();
        let n_bound = n_faces * n_per_triangle;

        let opacity_logit = if config.learnable_opacity {
            0.1
        } else {
            inverse_sigmoid(0.9999)
        };

        let mut log_scales = Vec::with_capacity(n_bound);
        let mut sh_coeffs = Vec::with_capacity(n_bound);
        for f in 0..n_faces {
            if mesh.face_normal(f).is_none() {
                return Err(BindError::DegenerateTriangle(f));
            }
            let scale = (mesh.face_min_edge(f) * circle_radius).max(MIN_BIND_SCALE);
            let log_scale = scale.ln();

            for bary in &bary_coords {
                log_scales.push([log_scale, log_scale]);

                let mut coeffs = [[0.0f32; 3]; SH_COEFF_COUNT];
                if let Some(colors) = &mesh.colors {
                    let [a, b, c] = mesh.faces[f];
                    let rgb = bary[0] * colors[a as usize]
                        + bary[1] * colors[b as usize]
                        + bary[2] * colors[c as usize];
                    let dc = rgb_to_sh_dc(&rgb);
                    coeffs[0] = [dc.x, dc.y, dc.z];
                }
                sh_coeffs.push(coeffs);
            }
        }

        Ok(Self {
            mesh,
            n_per_triangle,
            bary_coords,
            thickness: config
                .thickness
                .unwrap_or(config.scene_extent / 1_000_000.0),
            sh_degree: config.sh_degree,
            reference: None,
            complex: vec![[1.0, 0.0]; n_bound],
            log_scales,
            opacity_logits: vec![opacity_logit; n_bound],
            sh_coeffs,
        })
    }

    /// Number of bound Gaussians (`face_count * n_per_triangle`).
    pub fn len(&self) -> usize {
        self.mesh.face_count() * self.n_per_triangle
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn n_per_triangle(&self) -> usize {
        self.n_per_triangle
    }

    pub fn mesh(&self) -> &TriangleMesh {
        &self.mesh
    }

    pub fn thickness(&self) -> f32 {
        self.thickness
    }

    pub fn sh_degree(&self) -> u32 {
        self.sh_degree
    }

    /// Replace vertex positions (mesh deformation). The face list is
    /// fixed so the bound-Gaussian count cannot drift.
    pub fn set_vertices(&mut self, vertices: Vec<Vector3<f32>>) {
        debug_assert_eq!(vertices.len(), self.mesh.vertex_count());
        self.mesh.vertices = vertices;
    }

    /// Current 3D positions, derived from the vertices. Never cached.
    pub fn positions(&self) -> Vec<Vector3<f32>> {
        let mut positions = Vec::with_capacity(self.len());
        for f in 0..self.mesh.face_count() {
            let [v0, v1, v2] = self.mesh.face_vertices(f);
            for bary in &self.bary_coords {
                positions.push(bary[0] * v0 + bary[1] * v1 + bary[2] * v2);
            }
        }
        positions
    }

    /// The per-face rotation basis: face normal and two in-plane axes
    /// built from the first edge.
    fn face_frame(&self, f: usize) -> (Vector3<f32>, Vector3<f32>, Vector3<f32>) {
        let [v0, v1, _] = self.mesh.face_vertices(f);
        let normal = self
            .mesh
            .face_normal(f)
            .unwrap_or_else(Vector3::z);
        let base_r1 = safe_normalize(v0 - v1);
        let base_r2 = safe_normalize(normal.cross(&base_r1));
        (normal, base_r1, base_r2)
    }

    /// Current 3x3 rotations: column 0 is the face normal, columns 1 and
    /// 2 are the learned in-plane rotation applied to the edge basis.
    pub fn rotations(&self) -> Vec<Matrix3<f32>> {
        let mut rotations = Vec::with_capacity(self.len());
        for f in 0..self.mesh.face_count() {
            let (normal, base_r1, base_r2) = self.face_frame(f);
            for g in 0..self.n_per_triangle {
                let [x, y] = self.unit_complex(f * self.n_per_triangle + g);
                let r1 = x * base_r1 + y * base_r2;
                let r2 = -y * base_r1 + x * base_r2;
                rotations.push(Matrix3::from_columns(&[normal, r1, r2]));
            }
        }
        rotations
    }

    pub fn quaternions(&self) -> Vec<UnitQuaternion<f32>> {
        self.rotations()
            .iter()
            .map(|m| {
                quaternion_from_columns(
                    &m.column(0).into_owned(),
                    &m.column(1).into_owned(),
                    &m.column(2).into_owned(),
                )
            })
            .collect()
    }

    /// Current 3-axis scales: `[thickness, in-plane, in-plane]`.
    pub fn scalings(&self) -> Vec<Vector3<f32>> {
        self.log_scales
            .iter()
            .map(|&[s0, s1]| Vector3::new(self.thickness, s0.exp(), s1.exp()))
            .collect()
    }

    pub fn opacities(&self) -> Vec<f32> {
        self.opacity_logits.iter().map(|&l| sigmoid(l)).collect()
    }

    fn unit_complex(&self, i: usize) -> [f32; 2] {
        let [x, y] = self.complex[i];
        let norm = (x * x + y * y).sqrt().max(1e-12);
        [x / norm, y / norm]
    }

    /// Snapshot the current vertices as the reference configuration for
    /// edited re-derivation.
    pub fn make_editable(&mut self) {
        if self.reference.is_none() {
            self.reference = Some(EditableReference::capture(&self.mesh));
        }
    }

    pub fn is_editable(&self) -> bool {
        self.reference.is_some()
    }

    /// Rotations and scales adjusted for the deformation since
    /// [`make_editable`](Self::make_editable): the in-plane complex
    /// numbers are corrected by the change in per-vertex opening angles,
    /// and the in-plane scales by the change in projected edge lengths.
    pub fn edited_rotations_and_scalings(
        &self,
    ) -> Result<(Vec<UnitQuaternion<f32>>, Vec<Vector3<f32>>), BindError> {
        let reference = self.reference.as_ref().ok_or(BindError::NotEditable)?;
        Ok(editable::edited_rotations_and_scalings(self, reference))
    }

    /// Freeze the current derived state into ordinary free Gaussians.
    /// One-way: the result no longer tracks the mesh.
    pub fn unbind(&self) -> GaussianField {
        let positions = self.positions();
        let quaternions = self.quaternions();
        let scalings = self.scalings();

        let gaussians = (0..self.len())
            .map(|i| {
                Gaussian::new(
                    positions[i],
                    scalings[i].map(f32::ln),
                    quaternions[i],
                    self.opacity_logits[i],
                    self.sh_coeffs[i],
                )
            })
            .collect();
        GaussianField::new(gaussians, self.sh_degree, BetaMode::Average)
    }
}

/// A Gaussian set in either representation, chosen at construction.
pub enum GaussianSet {
    Free(GaussianField),
    MeshBound(MeshBoundGaussians),
}

impl GaussianSet {
    pub fn len(&self) -> usize {
        match self {
            Self::Free(field) => field.len(),
            Self::MeshBound(bound) => bound.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn positions(&self) -> Vec<Vector3<f32>> {
        match self {
            Self::Free(field) => field.centers(),
            Self::MeshBound(bound) => bound.positions(),
        }
    }

    pub fn quaternions(&self) -> Vec<UnitQuaternion<f32>> {
        match self {
            Self::Free(field) => field.gaussians.iter().map(|g| g.rotation).collect(),
            Self::MeshBound(bound) => bound.quaternions(),
        }
    }

    pub fn scalings(&self) -> Vec<Vector3<f32>> {
        match self {
            Self::Free(field) => field.gaussians.iter().map(|g| g.scale()).collect(),
            Self::MeshBound(bound) => bound.scalings(),
        }
    }

    pub fn opacities(&self) -> Vec<f32> {
        match self {
            Self::Free(field) => field.gaussians.iter().map(|g| g.opacity()).collect(),
            Self::MeshBound(bound) => bound.opacities(),
        }
    }
}

fn safe_normalize(v: Vector3<f32>) -> Vector3<f32> {
    let len = v.norm();
    if len > 1e-12 {
        v / len
    } else {
        Vector3::x()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    fn single_triangle() -> TriangleMesh {
        TriangleMesh {
            vertices: vec![
                Vector3::zeros(),
                Vector3::new(1.0, 0.0, 0.0),
                Vector3::new(0.0, 1.0, 0.0),
            ],
            faces: vec![[0, 1, 2]],
            colors: Some(vec![
                Vector3::new(1.0, 0.0, 0.0),
                Vector3::new(0.0, 1.0, 0.0),
                Vector3::new(0.0, 0.0, 1.0),
            ]),
            normals: None,
        }
    }

    #[test]
    fn test_invalid_count_rejected() {
        for n in [0, 2, 5, 7] {
            assert!(matches!(
                MeshBoundGaussians::bind(single_triangle(), n, &BindConfig::default()),
                Err(BindError::InvalidGaussiansPerTriangle(_))
            ));
        }
    }

    #[test]
    fn test_degenerate_triangle_rejected() {
        let mut mesh = single_triangle();
        mesh.vertices[2] = Vector3::new(0.5, 0.0, 0.0); // collinear
        assert!(matches!(
            MeshBoundGaussians::bind(mesh, 1, &BindConfig::default()),
            Err(BindError::DegenerateTriangle(0))
        ));
    }

    #[test]
    fn test_single_gaussian_sits_at_centroid() {
        let bound =
            MeshBoundGaussians::bind(single_triangle(), 1, &BindConfig::default()).unwrap();
        let positions = bound.positions();
        assert_eq!(positions.len(), 1);
        assert_relative_eq!(
            positions[0],
            Vector3::new(1.0 / 3.0, 1.0 / 3.0, 0.0),
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_six_gaussians_stay_inside_face() {
        let bound =
            MeshBoundGaussians::bind(single_triangle(), 6, &BindConfig::default()).unwrap();
        assert_eq!(bound.len(), 6);
        for p in bound.positions() {
            // Inside the triangle x >= 0, y >= 0, x + y <= 1, on z = 0.
            assert!(p.x > 0.0 && p.y > 0.0 && p.x + p.y < 1.0);
            assert_relative_eq!(p.z, 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_positions_invariant_under_cyclic_relabeling() {
        let mesh = single_triangle();
        let mut cycled = mesh.clone();
        cycled.faces = vec![[1, 2, 0]];

        let a = MeshBoundGaussians::bind(mesh, 6, &BindConfig::default()).unwrap();
        let b = MeshBoundGaussians::bind(cycled, 6, &BindConfig::default()).unwrap();

        // The placement tables are symmetric under cyclic vertex
        // permutation, so both bindings cover the same point set.
        let sort_key = |p: &Vector3<f32>, q: &Vector3<f32>| {
            let kx = |v: f32| (v * 1e4).round() as i64;
            kx(p.x).cmp(&kx(q.x)).then(kx(p.y).cmp(&kx(q.y)))
        };
        let mut pa = a.positions();
        let mut pb = b.positions();
        pa.sort_by(sort_key);
        pb.sort_by(sort_key);
        for (p, q) in pa.iter().zip(&pb) {
            assert_relative_eq!(p, q, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_barycentric_rows_sum_to_one() {
        for n in [1usize, 3, 4, 6] {
            let (table, radius) = barycentric_table(n).unwrap();
            assert_eq!(table.len(), n);
            assert!(radius > 0.0 && radius < 0.5);
            for row in table {
                assert_relative_eq!(row.iter().sum::<f32>(), 1.0, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_rotation_first_axis_is_face_normal() {
        let bound =
            MeshBoundGaussians::bind(single_triangle(), 3, &BindConfig::default()).unwrap();
        for r in bound.rotations() {
            assert_relative_eq!(
                r.column(0).into_owned(),
                Vector3::new(0.0, 0.0, 1.0),
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn test_normal_axis_tracks_rigid_transform() {
        let mut bound =
            MeshBoundGaussians::bind(single_triangle(), 1, &BindConfig::default()).unwrap();
        let rot = Rotation3::from_euler_angles(0.3, -0.7, 1.1);
        let shift = Vector3::new(2.0, -1.0, 0.5);
        let new_verts = bound
            .mesh()
            .vertices
            .iter()
            .map(|v| rot * v + shift)
            .collect();
        bound.set_vertices(new_verts);

        let expected_normal = rot * Vector3::z();
        let r = &bound.rotations()[0];
        assert_relative_eq!(r.column(0).into_owned(), expected_normal, epsilon = 1e-5);
    }

    #[test]
    fn test_initial_scale_from_min_edge() {
        let config = BindConfig {
            scene_extent: 10.0,
            ..BindConfig::default()
        };
        let bound = MeshBoundGaussians::bind(single_triangle(), 1, &config).unwrap();
        let (_, radius) = barycentric_table(1).unwrap();
        let scalings = bound.scalings();
        // min edge of the unit right triangle is 1.
        assert_relative_eq!(scalings[0].y, radius, epsilon = 1e-5);
        assert_relative_eq!(scalings[0].z, radius, epsilon = 1e-5);
        assert_relative_eq!(scalings[0].x, 10.0 / 1_000_000.0, epsilon = 1e-9);
    }

    #[test]
    fn test_fixed_opacity_is_near_one() {
        let bound =
            MeshBoundGaussians::bind(single_triangle(), 1, &BindConfig::default()).unwrap();
        assert!(bound.opacities()[0] > 0.999);

        let config = BindConfig {
            learnable_opacity: true,
            ..BindConfig::default()
        };
        let learnable =
            MeshBoundGaussians::bind(single_triangle(), 1, &config).unwrap();
        assert_relative_eq!(learnable.opacity_logits[0], 0.1, epsilon = 1e-6);
    }

    #[test]
    fn test_unbind_freezes_derived_state() {
        let bound =
            MeshBoundGaussians::bind(single_triangle(), 4, &BindConfig::default()).unwrap();
        let field = bound.unbind();
        assert_eq!(field.len(), 4);

        let positions = bound.positions();
        let scalings = bound.scalings();
        for (i, g) in field.gaussians.iter().enumerate() {
            assert_relative_eq!(g.position, positions[i], epsilon = 1e-6);
            assert_relative_eq!(g.scale(), scalings[i], epsilon = 1e-5);
        }
        // Unbinding twice yields the same frozen state.
        let again = bound.unbind();
        assert_relative_eq!(
            again.gaussians[0].position,
            field.gaussians[0].position,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_gaussian_set_dispatch() {
        let bound =
            MeshBoundGaussians::bind(single_triangle(), 3, &BindConfig::default()).unwrap();
        let positions = bound.positions();
        let set = GaussianSet::MeshBound(bound);
        assert_eq!(set.len(), 3);
        assert_relative_eq!(set.positions()[0], positions[0], epsilon = 1e-6);

        let free = GaussianSet::Free(set_free_fixture());
        assert_eq!(free.len(), 1);
        assert_relative_eq!(free.opacities()[0], 0.5, epsilon = 1e-5);
    }

    fn set_free_fixture() -> GaussianField {
        GaussianField::new(
            vec![Gaussian::new(
                Vector3::zeros(),
                Vector3::repeat(0.1f32.ln()),
                UnitQuaternion::identity(),
                0.0,
                [[0.0; 3]; SH_COEFF_COUNT],
            )],
            0,
            BetaMode::Average,
        )
    }
}
