//! Error types for device operations

use vrshim_sdk::ShaderStage;

/// Error type for render device operations
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    /// Nothing bound at the requested stage/slot
    #[error("No constant buffer bound at {stage} slot {slot}")]
    NotBound { stage: ShaderStage, slot: u32 },

    /// Resource creation returned an error or a null resource
    #[error("Failed to create {resource}: {reason}")]
    CreateFailed {
        resource: &'static str,
        reason: String,
    },

    /// Map returned an error or a null pointer
    #[error("Failed to map buffer: {0}")]
    MapFailed(String),

    /// Swapchain back buffer could not be obtained
    #[error("Back buffer unavailable: {0}")]
    BackBuffer(String),

    /// Any other device call failure
    #[error("Device call failed: {0}")]
    Device(String),
}

#[cfg(windows)]
impl From<windows::core::Error> for GpuError {
    fn from(e: windows::core::Error) -> Self {
        GpuError::Device(e.to_string())
    }
}
