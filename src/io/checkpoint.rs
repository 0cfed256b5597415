//! Binary checkpoint format for Gaussian sets.
//!
//! Layout (little-endian):
//! - magic `SPLATSRF`, format version u32, kind u32 (0 = free, 1 = mesh-bound)
//! - iteration u64, loss f32, sh_degree u32, beta mode tag u32 + f32
//! - kind-specific payload
//!
//! Free Gaussians are one fixed-size record each: position, log-scale,
//! quaternion (w x y z), opacity logit, 48 SH coefficients. Mesh-bound
//! sets store the mesh (vertices, optional colors, faces) followed by
//! the learned per-Gaussian parameters; the derived pose is not stored,
//! it is recomputed from the mesh on load.

use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::info;
use nalgebra::{Quaternion, UnitQuaternion, Vector3};

use crate::bind::{BindConfig, GaussianSet, MeshBoundGaussians};
use crate::core::{Gaussian, GaussianField, SH_COEFF_COUNT};
use crate::field::BetaMode;
use crate::io::IoError;
use crate::mesh::TriangleMesh;

const MAGIC: &[u8; 8] = b"SPLATSRF";
const FORMAT_VERSION: u32 = 1;

const KIND_FREE: u32 = 0;
const KIND_MESH_BOUND: u32 = 1;

/// A Gaussian set together with its training metadata.
pub struct Checkpoint {
    pub iteration: u64,
    pub loss: f32,
    pub set: GaussianSet,
}

pub fn save_checkpoint<P: AsRef<Path>>(path: P, checkpoint: &Checkpoint) -> Result<(), IoError> {
    let file = std::fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    write_checkpoint(&mut writer, checkpoint)
}

pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Checkpoint, IoError> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    read_checkpoint(&mut reader)
}

pub fn write_checkpoint<W: Write>(
    writer: &mut W,
    checkpoint: &Checkpoint,
) -> Result<(), IoError> {
    writer.write_all(MAGIC)?;
    writer.write_u32::<LittleEndian>(FORMAT_VERSION)?;

    match &checkpoint.set {
        GaussianSet::Free(field) => {
            writer.write_u32::<LittleEndian>(KIND_FREE)?;
            write_metadata(writer, checkpoint, field.sh_degree, field.beta_mode)?;
            writer.write_u64::<LittleEndian>(field.len() as u64)?;
            for g in &field.gaussians {
                write_vector3(writer, &g.position)?;
                write_vector3(writer, &g.log_scale)?;
                let q = g.rotation.quaternion();
                writer.write_f32::<LittleEndian>(q.w)?;
                writer.write_f32::<LittleEndian>(q.i)?;
                writer.write_f32::<LittleEndian>(q.j)?;
                writer.write_f32::<LittleEndian>(q.k)?;
                writer.write_f32::<LittleEndian>(g.opacity_logit)?;
                for channel in &g.sh_coeffs {
                    for &c in channel {
                        writer.write_f32::<LittleEndian>(c)?;
                    }
                }
            }
            info!("wrote checkpoint with {} free gaussians", field.len());
        }
        GaussianSet::MeshBound(bound) => {
            writer.write_u32::<LittleEndian>(KIND_MESH_BOUND)?;
            write_metadata(writer, checkpoint, bound.sh_degree(), BetaMode::Average)?;

            let mesh = bound.mesh();
            writer.write_u64::<LittleEndian>(mesh.vertex_count() as u64)?;
            writer.write_u64::<LittleEndian>(mesh.face_count() as u64)?;
            writer.write_u32::<LittleEndian>(bound.n_per_triangle() as u32)?;
            writer.write_f32::<LittleEndian>(bound.thickness())?;

            for v in &mesh.vertices {
                write_vector3(writer, v)?;
            }
            match &mesh.colors {
                Some(colors) => {
                    writer.write_u8(1)?;
                    for c in colors {
                        write_vector3(writer, c)?;
                    }
                }
                None => writer.write_u8(0)?,
            }
            for [a, b, c] in &mesh.faces {
                writer.write_u32::<LittleEndian>(*a)?;
                writer.write_u32::<LittleEndian>(*b)?;
                writer.write_u32::<LittleEndian>(*c)?;
            }

            for i in 0..bound.len() {
                writer.write_f32::<LittleEndian>(bound.complex[i][0])?;
                writer.write_f32::<LittleEndian>(bound.complex[i][1])?;
                writer.write_f32::<LittleEndian>(bound.log_scales[i][0])?;
                writer.write_f32::<LittleEndian>(bound.log_scales[i][1])?;
                writer.write_f32::<LittleEndian>(bound.opacity_logits[i])?;
                for channel in &bound.sh_coeffs[i] {
                    for &c in channel {
                        writer.write_f32::<LittleEndian>(c)?;
                    }
                }
            }
            info!(
                "wrote checkpoint with {} gaussians bound to {} faces",
                bound.len(),
                mesh.face_count()
            );
        }
    }
    Ok(())
}

pub fn read_checkpoint<R: Read>(reader: &mut R) -> Result<Checkpoint, IoError> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(IoError::InvalidFormat("bad magic bytes".into()));
    }
    let version = reader.read_u32::<LittleEndian>()?;
    if version != FORMAT_VERSION {
        return Err(IoError::UnsupportedVersion(version));
    }
    let kind = reader.read_u32::<LittleEndian>()?;

    let iteration = reader.read_u64::<LittleEndian>()?;
    let loss = reader.read_f32::<LittleEndian>()?;
    let sh_degree = reader.read_u32::<LittleEndian>()?;
    let beta_mode = read_beta_mode(reader)?;

    let set = match kind {
        KIND_FREE => {
            let count = reader.read_u64::<LittleEndian>()? as usize;
            let mut gaussians = Vec::with_capacity(count);
            for _ in 0..count {
                let position = read_vector3(reader)?;
                let log_scale = read_vector3(reader)?;
                let w = reader.read_f32::<LittleEndian>()?;
                let i = reader.read_f32::<LittleEndian>()?;
                let j = reader.read_f32::<LittleEndian>()?;
                let k = reader.read_f32::<LittleEndian>()?;
                let rotation = UnitQuaternion::from_quaternion(Quaternion::new(w, i, j, k));
                let opacity_logit = reader.read_f32::<LittleEndian>()?;
                let mut sh_coeffs = [[0.0f32; 3]; SH_COEFF_COUNT];
                for channel in &mut sh_coeffs {
                    for c in channel {
                        *c = reader.read_f32::<LittleEndian>()?;
                    }
                }
                gaussians.push(Gaussian::new(
                    position,
                    log_scale,
                    rotation,
                    opacity_logit,
                    sh_coeffs,
                ));
            }
            GaussianSet::Free(GaussianField::new(gaussians, sh_degree, beta_mode))
        }
        KIND_MESH_BOUND => {
            let n_vertices = reader.read_u64::<LittleEndian>()? as usize;
            let n_faces = reader.read_u64::<LittleEndian>()? as usize;
            let n_per_triangle = reader.read_u32::<LittleEndian>()? as usize;
            let thickness = reader.read_f32::<LittleEndian>()?;

            let mut vertices = Vec::with_capacity(n_vertices);
            for _ in 0..n_vertices {
                vertices.push(read_vector3(reader)?);
            }
            let colors = match reader.read_u8()? {
                0 => None,
                1 => {
                    let mut colors = Vec::with_capacity(n_vertices);
                    for _ in 0..n_vertices {
                        colors.push(read_vector3(reader)?);
                    }
                    Some(colors)
                }
                other => {
                    return Err(IoError::InvalidFormat(format!(
                        "bad color flag: {other}"
                    )))
                }
            };
            let mut faces = Vec::with_capacity(n_faces);
            for _ in 0..n_faces {
                let a = reader.read_u32::<LittleEndian>()?;
                let b = reader.read_u32::<LittleEndian>()?;
                let c = reader.read_u32::<LittleEndian>()?;
                faces.push([a, b, c]);
            }
            let mesh = TriangleMesh {
                vertices,
                faces,
                colors,
                normals: None,
            };

            let config = BindConfig {
                thickness: Some(thickness),
                sh_degree,
                ..BindConfig::default()
            };
            let mut bound = MeshBoundGaussians::bind(mesh, n_per_triangle, &config)
                .map_err(|e| IoError::InvalidFormat(e.to_string()))?;

            for i in 0..bound.len() {
                bound.complex[i][0] = reader.read_f32::<LittleEndian>()?;
                bound.complex[i][1] = reader.read_f32::<LittleEndian>()?;
                bound.log_scales[i][0] = reader.read_f32::<LittleEndian>()?;
                bound.log_scales[i][1] = reader.read_f32::<LittleEndian>()?;
                bound.opacity_logits[i] = reader.read_f32::<LittleEndian>()?;
                for channel in &mut bound.sh_coeffs[i] {
                    for c in channel {
                        *c = reader.read_f32::<LittleEndian>()?;
                    }
                }
            }
            GaussianSet::MeshBound(bound)
        }
        other => {
            return Err(IoError::InvalidFormat(format!(
                "unknown gaussian set kind: {other}"
            )))
        }
    };

    Ok(Checkpoint {
        iteration,
        loss,
        set,
    })
}

fn write_metadata<W: Write>(
    writer: &mut W,
    checkpoint: &Checkpoint,
    sh_degree: u32,
    beta_mode: BetaMode,
) -> Result<(), IoError> {
    writer.write_u64::<LittleEndian>(checkpoint.iteration)?;
    writer.write_f32::<LittleEndian>(checkpoint.loss)?;
    writer.write_u32::<LittleEndian>(sh_degree)?;
    let (tag, value) = match beta_mode {
        BetaMode::Learnable(beta) => (0u32, beta),
        BetaMode::Average => (1, 0.0),
        BetaMode::WeightedAverage => (2, 0.0),
    };
    writer.write_u32::<LittleEndian>(tag)?;
    writer.write_f32::<LittleEndian>(value)?;
    Ok(())
}

fn read_beta_mode<R: Read>(reader: &mut R) -> Result<BetaMode, IoError> {
    let tag = reader.read_u32::<LittleEndian>()?;
    let value = reader.read_f32::<LittleEndian>()?;
    match tag {
        0 => Ok(BetaMode::Learnable(value)),
        1 => Ok(BetaMode::Average),
        2 => Ok(BetaMode::WeightedAverage),
        other => Err(IoError::InvalidFormat(format!(
            "unknown beta mode tag: {other}"
        ))),
    }
}

fn write_vector3<W: Write>(writer: &mut W, v: &Vector3<f32>) -> Result<(), IoError> {
    writer.write_f32::<LittleEndian>(v.x)?;
    writer.write_f32::<LittleEndian>(v.y)?;
    writer.write_f32::<LittleEndian>(v.z)?;
    Ok(())
}

fn read_vector3<R: Read>(reader: &mut R) -> Result<Vector3<f32>, IoError> {
    let x = reader.read_f32::<LittleEndian>()?;
    let y = reader.read_f32::<LittleEndian>()?;
    let z = reader.read_f32::<LittleEndian>()?;
    Ok(Vector3::new(x, y, z))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Cursor;

    fn free_fixture() -> GaussianField {
        let mut sh = [[0.0f32; 3]; SH_COEFF_COUNT];
        sh[0] = [0.3, -0.1, 0.7];
        GaussianField::new(
            vec![
                Gaussian::new(
                    Vector3::new(1.0, 2.0, 3.0),
                    Vector3::new(-2.0, -2.3, -3.0),
                    UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3),
                    0.25,
                    sh,
                ),
                Gaussian::new(
                    Vector3::new(-1.0, 0.5, 0.0),
                    Vector3::repeat(-1.0),
                    UnitQuaternion::identity(),
                    -3.0,
                    [[0.0; 3]; SH_COEFF_COUNT],
                ),
            ],
            2,
            BetaMode::Learnable(0.05),
        )
    }

    fn bound_fixture() -> MeshBoundGaussians {
        let mesh = TriangleMesh {
            vertices: vec![
                Vector3::zeros(),
                Vector3::new(1.0, 0.0, 0.0),
                Vector3::new(0.0, 1.0, 0.0),
                Vector3::new(1.0, 1.0, 0.0),
            ],
            faces: vec![[0, 1, 2], [1, 3, 2]],
            colors: Some(vec![Vector3::repeat(0.5); 4]),
            normals: None,
        };
        let mut bound = MeshBoundGaussians::bind(mesh, 3, &BindConfig::default()).unwrap();
        bound.complex[2] = [0.6, 0.8];
        bound.log_scales[4] = [-3.0, -2.5];
        bound.opacity_logits[5] = 1.5;
        bound
    }

    #[test]
    fn test_free_round_trip() {
        let checkpoint = Checkpoint {
            iteration: 7000,
            loss: 0.042,
            set: GaussianSet::Free(free_fixture()),
        };
        let mut buffer = Vec::new();
        write_checkpoint(&mut buffer, &checkpoint).unwrap();

        let loaded = read_checkpoint(&mut Cursor::new(buffer)).unwrap();
        assert_eq!(loaded.iteration, 7000);
        assert_relative_eq!(loaded.loss, 0.042, epsilon = 1e-7);

        let GaussianSet::Free(field) = loaded.set else {
            panic!("expected a free gaussian set");
        };
        let original = free_fixture();
        assert_eq!(field.len(), 2);
        assert_eq!(field.sh_degree, 2);
        assert!(matches!(field.beta_mode, BetaMode::Learnable(b) if (b - 0.05).abs() < 1e-7));
        for (g, o) in field.gaussians.iter().zip(&original.gaussians) {
            assert_relative_eq!(g.position, o.position, epsilon = 1e-6);
            assert_relative_eq!(g.log_scale, o.log_scale, epsilon = 1e-6);
            assert_relative_eq!(g.opacity_logit, o.opacity_logit, epsilon = 1e-6);
            let dot = g.rotation.coords.dot(&o.rotation.coords).abs();
            assert!(dot > 1.0 - 1e-6);
            assert_eq!(g.sh_coeffs, o.sh_coeffs);
        }
    }

    #[test]
    fn test_mesh_bound_round_trip() {
        let checkpoint = Checkpoint {
            iteration: 15000,
            loss: 0.013,
            set: GaussianSet::MeshBound(bound_fixture()),
        };
        let mut buffer = Vec::new();
        write_checkpoint(&mut buffer, &checkpoint).unwrap();

        let loaded = read_checkpoint(&mut Cursor::new(buffer)).unwrap();
        let GaussianSet::MeshBound(bound) = loaded.set else {
            panic!("expected a mesh-bound gaussian set");
        };
        let original = bound_fixture();

        assert_eq!(bound.len(), original.len());
        assert_eq!(bound.n_per_triangle(), 3);
        assert_relative_eq!(bound.thickness(), original.thickness(), epsilon = 1e-9);
        assert_eq!(bound.mesh().faces, original.mesh().faces);
        assert_eq!(bound.complex, original.complex);
        assert_eq!(bound.log_scales, original.log_scales);
        assert_eq!(bound.opacity_logits, original.opacity_logits);

        // Derived poses agree once the learned parameters are restored.
        let p = bound.positions();
        let q = original.positions();
        for (a, b) in p.iter().zip(&q) {
            assert_relative_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut buffer = Vec::new();
        write_checkpoint(
            &mut buffer,
            &Checkpoint {
                iteration: 0,
                loss: 0.0,
                set: GaussianSet::Free(free_fixture()),
            },
        )
        .unwrap();
        buffer[0] = b'X';
        assert!(matches!(
            read_checkpoint(&mut Cursor::new(buffer)),
            Err(IoError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_rejects_future_version() {
        let mut buffer = Vec::new();
        write_checkpoint(
            &mut buffer,
            &Checkpoint {
                iteration: 0,
                loss: 0.0,
                set: GaussianSet::Free(free_fixture()),
            },
        )
        .unwrap();
        buffer[8] = 99;
        assert!(matches!(
            read_checkpoint(&mut Cursor::new(buffer)),
            Err(IoError::UnsupportedVersion(99))
        ));
    }
}
