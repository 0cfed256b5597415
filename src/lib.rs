//! # splatsurf: surface mesh extraction for 3D Gaussian Splatting
//!
//! This crate turns a trained 3D Gaussian Splatting radiance field into a
//! textured triangle mesh, and binds Gaussians back onto that mesh for a
//! surface-aligned refinement stage.
//!
//! ## Architecture
//!
//! The crate is organized into several modules:
//!
//! - `core`: Fundamental data structures (Gaussians, cameras, math, SH)
//! - `neighbors`: k-nearest-neighbor index over Gaussian centers
//! - `field`: Density / SDF evaluation of the Gaussian mixture field
//! - `extract`: Per-camera level-surface ray marching and point-cloud
//!   aggregation, up to the Poisson-reconstruction boundary
//! - `bind`: Deterministic binding of Gaussians to mesh triangles
//! - `mesh`: Triangle mesh and oriented point cloud boundary types
//! - `io`: PLY export/import and binary checkpoints
//!
//! ## Pipeline
//!
//! 1. Load a trained field (`io::checkpoint`), rebuild a `NeighborIndex`.
//! 2. For every training camera, run `extract::extract_levels` to collect
//!    level-surface points; feed them into `extract::SurfaceAggregator`.
//! 3. Hand the partitioned point clouds to an external Poisson
//!    reconstruction service (`extract::SurfaceReconstructor`), decimate.
//! 4. Bind Gaussians to the decimated mesh with `bind::MeshBoundGaussians`
//!    and hand the bound set back to the refinement trainer.

// Core data structures and math
pub mod core;

// k-NN index over Gaussian centers
pub mod neighbors;

// Density / SDF field induced by the Gaussians
pub mod field;

// Triangle mesh and point cloud boundary types
pub mod mesh;

// Level-surface extraction (ray marching + aggregation)
pub mod extract;

// Gaussian-to-mesh binding
pub mod bind;

// I/O operations (PLY, checkpoints)
pub mod io;

// Re-export commonly used types at crate root for convenience
pub use crate::core::{Camera, Gaussian, GaussianField};
pub use crate::field::DensityEvaluator;
pub use crate::neighbors::NeighborIndex;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
