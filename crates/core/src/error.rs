//! Error taxonomy for the stereo pipeline

use vrshim_gpu::GpuError;

use crate::config::{ConfigError, ProfileError};

/// Errors surfaced by the adapter and its components
#[derive(Debug, thiserror::Error)]
pub enum VrError {
    /// A detour could not be placed; the attempt is rolled back
    #[error("Failed to install hook '{name}': {reason}")]
    HookInstallationFailed { name: String, reason: String },

    /// The target already has an active hook
    #[error("Hook conflict: '{name}' at {original:x} is already hooked")]
    HookConflict { name: String, original: usize },

    /// A pointer failed the memory safety checks
    #[error("Memory validation failed: {0}")]
    MemoryValidationFailed(String),

    /// No constant buffer data this frame
    #[error("Failed to map constant buffer: {0}")]
    BufferMapFailed(String),

    /// No valid matrix at the expected location
    #[error("Matrix extraction failed: {0}")]
    MatrixExtractionFailed(String),

    /// Eye targets could not be created or are stale
    #[error("Resource allocation failed: {0}")]
    ResourceAllocationFailed(String),

    /// An operation was called in a state that does not allow it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Any other device failure during the frame
    #[error("Device error: {0}")]
    Device(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Profile(#[from] ProfileError),
}

impl From<GpuError> for VrError {
    fn from(e: GpuError) -> Self {
        match e {
            GpuError::NotBound { .. } | GpuError::MapFailed(_) => {
                VrError::BufferMapFailed(e.to_string())
            }
            GpuError::CreateFailed { .. } | GpuError::BackBuffer(_) => {
                VrError::ResourceAllocationFailed(e.to_string())
            }
            GpuError::Device(_) => VrError::Device(e.to_string()),
        }
    }
}

/// Result type for pipeline operations
pub type VrResult<T> = Result<T, VrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_errors_map_into_taxonomy() {
        let e: VrError = GpuError::MapFailed("busy".into()).into();
        assert!(matches!(e, VrError::BufferMapFailed(_)));

        let e: VrError = GpuError::CreateFailed {
            resource: "render target",
            reason: "out of memory".into(),
        }
        .into();
        assert!(matches!(e, VrError::ResourceAllocationFailed(_)));
        assert!(e.to_string().contains("render target"));
    }
}
