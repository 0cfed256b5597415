//! ASCII PLY export and import.
//!
//! Writes meshes (with per-vertex color and normal when present) and
//! oriented point clouds in the format the external reconstruction tools
//! exchange. The reader handles the subset those tools emit: float
//! vertex properties `x y z`, optional `nx ny nz`, optional uchar or
//! float `red green blue`, and `vertex_indices` face lists.

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use nalgebra::Vector3;

use crate::io::IoError;
use crate::mesh::{PointCloud, TriangleMesh};

pub fn save_mesh_ply<P: AsRef<Path>>(path: P, mesh: &TriangleMesh) -> Result<(), IoError> {
    let file = std::fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    write_mesh_ply(&mut writer, mesh)
}

pub fn write_mesh_ply<W: Write>(writer: &mut W, mesh: &TriangleMesh) -> Result<(), IoError> {
    writeln!(writer, "ply")?;
    writeln!(writer, "format ascii 1.0")?;
    writeln!(writer, "comment produced by splatsurf {}", crate::VERSION)?;
    writeln!(writer, "element vertex {}", mesh.vertex_count())?;
    writeln!(writer, "property float x")?;
    writeln!(writer, "property float y")?;
    writeln!(writer, "property float z")?;
    if mesh.normals.is_some() {
        writeln!(writer, "property float nx")?;
        writeln!(writer, "property float ny")?;
        writeln!(writer, "property float nz")?;
    }
    if mesh.colors.is_some() {
        writeln!(writer, "property uchar red")?;
        writeln!(writer, "property uchar green")?;
        writeln!(writer, "property uchar blue")?;
    }
    writeln!(writer, "element face {}", mesh.face_count())?;
    writeln!(writer, "property list uchar int vertex_indices")?;
    writeln!(writer, "end_header")?;

    for (i, v) in mesh.vertices.iter().enumerate() {
        write!(writer, "{} {} {}", v.x, v.y, v.z)?;
        if let Some(normals) = &mesh.normals {
            let n = normals[i];
            write!(writer, " {} {} {}", n.x, n.y, n.z)?;
        }
        if let Some(colors) = &mesh.colors {
            let [r, g, b] = color_to_u8(&colors[i]);
            write!(writer, " {r} {g} {b}")?;
        }
        writeln!(writer)?;
    }
    for [a, b, c] in &mesh.faces {
        writeln!(writer, "3 {a} {b} {c}")?;
    }
    Ok(())
}

pub fn save_point_cloud_ply<P: AsRef<Path>>(path: P, cloud: &PointCloud) -> Result<(), IoError> {
    let file = std::fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    write_point_cloud_ply(&mut writer, cloud)
}

pub fn write_point_cloud_ply<W: Write>(
    writer: &mut W,
    cloud: &PointCloud,
) -> Result<(), IoError> {
    writeln!(writer, "ply")?;
    writeln!(writer, "format ascii 1.0")?;
    writeln!(writer, "comment produced by splatsurf {}", crate::VERSION)?;
    writeln!(writer, "element vertex {}", cloud.len())?;
    writeln!(writer, "property float x")?;
    writeln!(writer, "property float y")?;
    writeln!(writer, "property float z")?;
    writeln!(writer, "property float nx")?;
    writeln!(writer, "property float ny")?;
    writeln!(writer, "property float nz")?;
    writeln!(writer, "property uchar red")?;
    writeln!(writer, "property uchar green")?;
    writeln!(writer, "property uchar blue")?;
    writeln!(writer, "end_header")?;

    for i in 0..cloud.len() {
        let p = cloud.points[i];
        let n = cloud.normals[i];
        let [r, g, b] = color_to_u8(&cloud.colors[i]);
        writeln!(
            writer,
            "{} {} {} {} {} {} {r} {g} {b}",
            p.x, p.y, p.z, n.x, n.y, n.z
        )?;
    }
    Ok(())
}

pub fn load_mesh_ply<P: AsRef<Path>>(path: P) -> Result<TriangleMesh, IoError> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    read_mesh_ply(&mut reader)
}

pub fn read_mesh_ply<R: BufRead>(reader: &mut R) -> Result<TriangleMesh, IoError> {
    let mut lines = reader.lines();

    let magic = next_line(&mut lines)?;
    if magic.trim() != "ply" {
        return Err(IoError::InvalidFormat("missing ply magic".into()));
    }

    let mut n_vertices = 0usize;
    let mut n_faces = 0usize;
    let mut vertex_props: Vec<String> = Vec::new();
    let mut in_vertex_element = false;

    loop {
        let line = next_line(&mut lines)?;
        let line = line.trim();
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["end_header"] => break,
            ["format", "ascii", _] | ["comment", ..] | [] => {}
            ["element", "vertex", count] => {
                n_vertices = parse(count)?;
                in_vertex_element = true;
            }
            ["element", "face", count] => {
                n_faces = parse(count)?;
                in_vertex_element = false;
            }
            ["element", ..] => in_vertex_element = false,
            ["property", "list", ..] => {}
            ["property", _ty, name] => {
                if in_vertex_element {
                    vertex_props.push((*name).to_string());
                }
            }
            _ => {
                return Err(IoError::InvalidFormat(format!(
                    "unrecognized header line: {line}"
                )))
            }
        }
    }

    let find = |name: &str| vertex_props.iter().position(|p| p == name);
    let (ix, iy, iz) = match (find("x"), find("y"), find("z")) {
        (Some(x), Some(y), Some(z)) => (x, y, z),
        _ => {
            return Err(IoError::InvalidFormat(
                "vertex element lacks x/y/z properties".into(),
            ))
        }
    };
    let normal_idx = match (find("nx"), find("ny"), find("nz")) {
        (Some(a), Some(b), Some(c)) => Some((a, b, c)),
        _ => None,
    };
    let color_idx = match (find("red"), find("green"), find("blue")) {
        (Some(a), Some(b), Some(c)) => Some((a, b, c)),
        _ => None,
    };

    let mut mesh = TriangleMesh {
        vertices: Vec::with_capacity(n_vertices),
        faces: Vec::with_capacity(n_faces),
        colors: color_idx.map(|_| Vec::with_capacity(n_vertices)),
        normals: normal_idx.map(|_| Vec::with_capacity(n_vertices)),
    };

    for _ in 0..n_vertices {
        let line = next_line(&mut lines)?;
        let values: Vec<f32> = line
            .split_whitespace()
            .map(parse::<f32>)
            .collect::<Result<_, _>>()?;
        if values.len() < vertex_props.len() {
            return Err(IoError::InvalidFormat("truncated vertex line".into()));
        }
        mesh.vertices
            .push(Vector3::new(values[ix], values[iy], values[iz]));
        if let (Some(normals), Some((a, b, c))) = (mesh.normals.as_mut(), normal_idx) {
            normals.push(Vector3::new(values[a], values[b], values[c]));
        }
        if let (Some(colors), Some((a, b, c))) = (mesh.colors.as_mut(), color_idx) {
            // Colors above 1 are uchar-scaled.
            let raw = Vector3::new(values[a], values[b], values[c]);
            let rgb = if raw.max() > 1.0 { raw / 255.0 } else { raw };
            colors.push(rgb);
        }
    }

    for _ in 0..n_faces {
        let line = next_line(&mut lines)?;
        let values: Vec<u32> = line
            .split_whitespace()
            .map(parse::<u32>)
            .collect::<Result<_, _>>()?;
        match values.as_slice() {
            [3, a, b, c] => mesh.faces.push([*a, *b, *c]),
            _ => {
                return Err(IoError::InvalidFormat(
                    "only triangular faces are supported".into(),
                ))
            }
        }
    }

    Ok(mesh)
}

fn next_line<R: BufRead>(
    lines: &mut std::io::Lines<&mut R>,
) -> Result<String, IoError> {
    match lines.next() {
        Some(line) => Ok(line?),
        None => Err(IoError::InvalidFormat("unexpected end of file".into())),
    }
}

fn parse<T: std::str::FromStr>(token: &str) -> Result<T, IoError> {
    token
        .parse()
        .map_err(|_| IoError::InvalidFormat(format!("cannot parse value: {token}")))
}

fn color_to_u8(rgb: &Vector3<f32>) -> [u8; 3] {
    [
        (rgb.x.clamp(0.0, 1.0) * 255.0).round() as u8,
        (rgb.y.clamp(0.0, 1.0) * 255.0).round() as u8,
        (rgb.z.clamp(0.0, 1.0) * 255.0).round() as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Cursor;

    fn colored_triangle() -> TriangleMesh {
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
            normals: Some(vec![Vector3::z(); 3]),
        }
    }

    #[test]
    fn test_mesh_write_read() {
        let mesh = colored_triangle();
        let mut buffer = Vec::new();
        write_mesh_ply(&mut buffer, &mesh).unwrap();

        let mut cursor = Cursor::new(buffer);
        let loaded = read_mesh_ply(&mut cursor).unwrap();

        assert_eq!(loaded.vertex_count(), 3);
        assert_eq!(loaded.faces, mesh.faces);
        assert_relative_eq!(loaded.vertices[1], mesh.vertices[1], epsilon = 1e-6);
        let colors = loaded.colors.unwrap();
        assert_relative_eq!(colors[0].x, 1.0, epsilon = 1e-2);
        assert_relative_eq!(colors[0].y, 0.0, epsilon = 1e-2);
        let normals = loaded.normals.unwrap();
        assert_relative_eq!(normals[2], Vector3::z(), epsilon = 1e-6);
    }

    #[test]
    fn test_point_cloud_header() {
        let cloud = PointCloud {
            points: vec![Vector3::new(1.0, 2.0, 3.0)],
            normals: vec![Vector3::z()],
            colors: vec![Vector3::new(0.5, 0.5, 0.5)],
            view_directions: vec![-Vector3::z()],
        };
        let mut buffer = Vec::new();
        write_point_cloud_ply(&mut buffer, &cloud).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.starts_with("ply\nformat ascii 1.0\n"));
        assert!(text.contains("element vertex 1"));
        assert!(text.contains("property float nx"));
        assert!(text.contains("1 2 3 0 0 1 128 128 128"));
    }

    #[test]
    fn test_rejects_non_ply_input() {
        let mut cursor = Cursor::new(b"obj nonsense".to_vec());
        assert!(matches!(
            read_mesh_ply(&mut cursor),
            Err(IoError::InvalidFormat(_))
        ));
    }
}
