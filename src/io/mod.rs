//! I/O: PLY meshes and point clouds, binary checkpoints.

pub mod checkpoint;
pub mod ply;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("unsupported checkpoint version: {0}")]
    UnsupportedVersion(u32),
}
