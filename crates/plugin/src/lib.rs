//! vrshim Plugin - FFI Layer
//!
//! This crate is the module injected into the game. It compiles to a cdylib
//! and provides:
//! - C exports to load, unload and toggle VR
//! - logging bootstrap from `configs/core.toml`
//! - the `Present`/`ResizeBuffers` detours that drive the engine adapter
//!   (Windows only)

pub mod ffi;
mod logging;
#[cfg(windows)]
mod runtime;

pub use vrshim_core::shutdown;
