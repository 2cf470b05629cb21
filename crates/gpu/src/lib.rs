//! vrshim GPU - Render Device Seam
//!
//! This crate handles:
//! - The [`RenderDevice`] trait every backend implements, covering the narrow
//!   set of operations the stereo core needs (constant buffer staging, eye
//!   targets, state save/restore, back-buffer composition)
//! - A CPU-side [`headless::HeadlessDevice`] that records every call, used by
//!   tests and for dry runs without a GPU
//! - The Direct3D 11 backend and swapchain vtable resolution (Windows only)
//!
//! # Threading
//!
//! Devices are driven from the game's render thread only. Backends are not
//! required to be `Sync`.

pub mod device;
pub mod error;
pub mod headless;

#[cfg(windows)]
pub mod d3d11;
#[cfg(windows)]
pub mod swapchain;

pub use device::{BufferDesc, MappedMemory, RenderDevice, CLEAR_COLOR};
pub use error::GpuError;
pub use headless::{DeviceCall, FailPoint, HeadlessDevice};
