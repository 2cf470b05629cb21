//! Per-title adapter profiles
//!
//! ```json
//! {
//!   "camera_system": {
//!     "hook_points": {
//!       "view_matrix":       { "cb_slot": 0, "offset_bytes": 0 },
//!       "projection_matrix": { "cb_slot": 0, "offset_bytes": 64 }
//!     },
//!     "matrix_layout": { "transpose": false },
//!     "fov_scale": 1.0
//!   },
//!   "artifacts": { "probe_logs_dir": "probe" }
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vrshim_sdk::MatrixMapping;

use super::loader::{base_dir, profile_path_in};
use crate::matrix::MatrixLayout;

/// Errors loading a profile
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Profile not found at {0:?}")]
    NotFound(PathBuf),

    #[error("IO error reading profile: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse profile JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Profile directory not available: {0}")]
    NoBaseDirectory(String),
}

/// Slot and byte offset of one matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub cb_slot: u32,
    pub offset_bytes: usize,
}

impl From<MappingEntry> for MatrixMapping {
    fn from(entry: MappingEntry) -> Self {
        MatrixMapping::new(entry.cb_slot, entry.offset_bytes)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookPoints {
    pub view_matrix: Option<MappingEntry>,
    pub projection_matrix: Option<MappingEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSystem {
    pub hook_points: HookPoints,
    pub matrix_layout: MatrixLayout,
    pub fov_scale: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Artifacts {
    /// Where constant buffer probe output is appended
    pub probe_logs_dir: Option<String>,
}

/// A title's adapter profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub camera_system: CameraSystem,
    pub artifacts: Artifacts,
}

impl Profile {
    /// Load `profiles/<title>/adapter.json` under the base directory
    pub fn load(title: &str) -> Result<Self, ProfileError> {
        let base = base_dir().map_err(|e| ProfileError::NoBaseDirectory(e.to_string()))?;
        Self::load_from(&profile_path_in(&base, title))
    }

    pub fn load_from(path: &Path) -> Result<Self, ProfileError> {
        if !path.exists() {
            return Err(ProfileError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let profile: Self = serde_json::from_str(&content)?;
        tracing::info!(
            target: "vrshim::config",
            "Loaded profile from {:?} (view={:?}, projection={:?})",
            path,
            profile.camera_system.hook_points.view_matrix,
            profile.camera_system.hook_points.projection_matrix
        );
        Ok(profile)
    }

    /// Location of the view matrix, when the profile names it
    pub fn view_mapping(&self) -> Option<MatrixMapping> {
        self.camera_system.hook_points.view_matrix.map(Into::into)
    }

    /// Location of the projection matrix, when the profile names it
    pub fn projection_mapping(&self) -> Option<MatrixMapping> {
        self.camera_system.hook_points.projection_matrix.map(Into::into)
    }

    pub fn matrix_layout(&self) -> MatrixLayout {
        self.camera_system.matrix_layout
    }

    /// Probe output directory, resolved against `base` when relative
    pub fn probe_logs_dir(&self, base: &Path) -> Option<PathBuf> {
        self.artifacts.probe_logs_dir.as_ref().map(|dir| {
            let dir = PathBuf::from(dir);
            if dir.is_absolute() {
                dir
            } else {
                base.join(dir)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        "camera_system": {
            "hook_points": {
                "view_matrix": { "cb_slot": 1, "offset_bytes": 0 },
                "projection_matrix": { "cb_slot": 1, "offset_bytes": 64 }
            },
            "matrix_layout": { "transpose": true }
        },
        "artifacts": { "probe_logs_dir": "probe" }
    }"#;

    #[test]
    fn test_parse_full_profile() {
        let profile: Profile = serde_json::from_str(FULL).unwrap();
        assert_eq!(profile.view_mapping(), Some(MatrixMapping::new(1, 0)));
        assert_eq!(profile.projection_mapping(), Some(MatrixMapping::new(1, 64)));
        assert!(profile.matrix_layout().transpose);
        assert_eq!(
            profile.probe_logs_dir(Path::new("/base")),
            Some(PathBuf::from("/base/probe"))
        );
    }

    #[test]
    fn test_missing_fields_fall_back_per_matrix() {
        let profile: Profile = serde_json::from_str(
            r#"{"camera_system": {"hook_points": {"view_matrix": {"cb_slot": 0, "offset_bytes": 0}}}}"#,
        )
        .unwrap();
        assert_eq!(profile.view_mapping(), Some(MatrixMapping::new(0, 0)));
        assert!(profile.projection_mapping().is_none());

        let empty: Profile = serde_json::from_str("{}").unwrap();
        assert!(empty.view_mapping().is_none());
        assert!(!empty.matrix_layout().transpose);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Profile::load_from(Path::new("/nonexistent/vrshim/adapter.json"));
        assert!(matches!(result, Err(ProfileError::NotFound(_))));
    }
}
