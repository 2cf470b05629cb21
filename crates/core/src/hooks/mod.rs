//! Hook system
//!
//! - [`manager`]: hook records, lifecycle state and rollback
//! - [`gate`]: lock-free status shared with running detours
//! - [`detour`]: the x86-64 inline patching backend
//! - [`trampoline`]: executable memory near hook targets
//! - [`recording`]: a backend that records instead of patching

pub mod detour;
pub mod gate;
pub mod manager;
pub mod recording;
pub mod trampoline;

pub use detour::{DetourBackend, HookError, InlineBackend};
pub use gate::{HookGate, InFlight};
pub use manager::{HookConfig, HookInfo, HookKey, HookSafetyManager, HookStatus};
pub use recording::{BackendCall, RecordingBackend};
pub use trampoline::Trampoline;
