//! Core data structures and mathematical operations.
//!
//! This module contains the fundamental types used throughout the system:
//! - `Gaussian` / `GaussianField`: the anisotropic 3D Gaussian set
//! - `Camera`: camera intrinsics and extrinsics
//! - Math utilities: activations, quaternions, spherical harmonics
//!
//! All types here are "pure data" - no I/O, no rendering logic.

mod camera;
mod gaussian;
mod math;
mod sh;

// Re-export public types
pub use camera::{cameras_spatial_extent, Camera};
pub use gaussian::{Gaussian, GaussianField, ShCoefficients, SH_COEFF_COUNT};
pub use math::{
    inverse_sigmoid, quaternion_from_columns, rotate_by_inverse, sigmoid, MIN_BIND_SCALE,
};
pub use sh::{evaluate_sh, rgb_to_sh_dc, sh_basis, sh_dc_to_rgb, SH_C0};
