//! vrshim Core - Stereo Injection Pipeline
//!
//! This crate turns a flat game frame into a stereo pair:
//! - [`memory`]: checks before touching foreign memory
//! - [`hooks`]: detour installation with conflict detection and rollback
//! - [`cbuffer`]: staging readback of bound constant buffers
//! - [`matrix`]: locating and validating camera matrices
//! - [`stereo`]: per-eye view and projection
//! - [`compositor`]: eye targets and back-buffer composition
//! - [`adapter`]: the per-frame pipeline and VR enable/disable lifecycle
//!
//! # Re-exports
//!
//! - [`sdk`] - shared matrix and pipeline types
//! - [`gpu`] - the render device seam and its backends

use tracing::info;

pub use vrshim_gpu as gpu;
pub use vrshim_sdk as sdk;

pub mod adapter;
pub mod cbuffer;
pub mod compositor;
pub mod config;
pub mod error;
pub mod hooks;
pub mod matrix;
pub mod memory;
pub mod metrics;
pub mod stereo;

pub use adapter::{AdapterContext, AdapterState, EngineAdapter, FrameOutcome, HookPlan, HookTarget};
pub use cbuffer::{ConstantBufferInfo, ConstantBufferReader, ProbeRecord};
pub use compositor::{CameraUpload, CompositorState, StereoCompositor, StereoLayout, StereoResources};
pub use config::{ConfigError, ConfigResult, CoreConfig, Profile, ProfileError};
pub use error::{VrError, VrResult};
pub use hooks::{DetourBackend, HookGate, HookInfo, HookSafetyManager, HookStatus, InlineBackend};
pub use matrix::{HeuristicThresholds, MatrixLayout, MatrixLocator, ProjectionInfo};
pub use memory::{Access, MemoryRegion, MemorySafetyManager, SafetyConfig};
pub use metrics::PerformanceMetrics;
pub use stereo::{LateralAxis, StereoConfig, StereoTransformEngine};

/// Shutdown hook for the host
///
/// Called from the FFI layer when the module is unloaded.
pub fn shutdown() {
    info!("vrshim shutting down...");
}
