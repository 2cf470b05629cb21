//! vrshim SDK - Shared Type Definitions
//!
//! This crate contains the plain data types exchanged between the hooking
//! core, the GPU backends and out-of-core collaborators (controller mapping,
//! UI projection). It has no dependencies and compiles quickly, allowing
//! parallel compilation of dependent crates.
//!
//! # Modules
//!
//! - [`camera`] - Camera matrix snapshot and per-title matrix mappings
//! - [`math`] - Raw 4x4 matrix representation as it sits in GPU memory
//! - [`pipeline`] - Shader stages, eyes, viewports and interception points

pub mod camera;
pub mod math;
pub mod pipeline;

pub use camera::*;
pub use math::*;
pub use pipeline::*;
