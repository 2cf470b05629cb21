//! Configuration system for vrshim
//!
//! Two files drive the runtime:
//! - `configs/core.toml` ([`CoreConfig`]): stereo parameters, safety limits,
//!   logging and heuristic thresholds. Created with defaults when missing.
//! - `profiles/<title>/adapter.json` ([`Profile`]): where a title keeps its
//!   camera matrices. Optional; without it the camera is located
//!   heuristically.
//!
//! # Example
//!
//! ```ignore
//! use vrshim_core::config::{CoreConfig, Profile};
//!
//! let config = CoreConfig::load().unwrap_or_default();
//! let profile = config.profile.as_deref().and_then(|t| Profile::load(t).ok());
//! ```

mod loader;
mod profile;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use loader::{base_dir, configs_dir, core_config_path, profile_path, HOME_ENV};
pub use profile::{Artifacts, CameraSystem, HookPoints, MappingEntry, Profile, ProfileError};

use crate::compositor::StereoLayout;
use crate::hooks::HookConfig;
use crate::matrix::HeuristicThresholds;
use crate::memory::{SafetyConfig, DEFAULT_MAX_BUFFER_SIZE};
use crate::stereo::{LateralAxis, StereoConfig};

/// Configuration system errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read or write config file
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML content
    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to serialize config to TOML
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Could not determine the base directory from the module location
    #[error("Config directory not available - could not resolve module base path")]
    NoConfigDirectory,

    /// A value is outside its accepted range
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Core runtime configuration.
///
/// Loaded from `configs/core.toml`. Every field has a default so partial
/// files are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Config version for future migration support
    pub version: u32,

    /// Enable debug logging
    pub debug: bool,

    /// Log file name, relative to the base directory. Console only when unset.
    pub log_file: Option<String>,

    /// Title profile to load from `profiles/<profile>/adapter.json`
    pub profile: Option<String>,

    /// Interpupillary distance in meters
    pub ipd: f32,

    /// Game units per meter
    pub world_scale: f32,

    /// View-space axis the eyes are separated along
    pub lateral_axis: LateralAxis,

    /// Focal length divisor applied to both eyes. Unset keeps the game's FOV.
    pub fov_scale: Option<f32>,

    /// How eye images are placed in the back buffer
    pub layout: StereoLayout,

    /// Largest read or write the memory checks will approve
    pub max_buffer_size: usize,

    /// Query page protection before touching foreign memory
    pub enable_memory_validation: bool,

    /// Frames to run the constant buffer probe for after VR is enabled
    pub probe_frames: u32,

    /// Frame time above which a warning is logged
    pub frame_budget_ms: f32,

    pub hooks: HookConfig,

    pub heuristics: HeuristicThresholds,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            version: 1,
            debug: false,
            log_file: None,
            profile: None,
            ipd: 0.064,
            world_scale: 1.0,
            lateral_axis: LateralAxis::X,
            fov_scale: None,
            layout: StereoLayout::SideBySide,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            enable_memory_validation: true,
            probe_frames: 0,
            frame_budget_ms: 11.1,
            hooks: HookConfig::default(),
            heuristics: HeuristicThresholds::default(),
        }
    }
}

impl CoreConfig {
    /// Load core config from file, creating default if missing.
    pub fn load() -> ConfigResult<Self> {
        Self::load_from(&core_config_path()?)
    }

    /// Load from an explicit path, creating default if missing.
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            tracing::debug!("Loaded core config from {:?}", path);
            Ok(config)
        } else {
            let default = Self::default();
            default.save_to(path)?;
            tracing::info!("Created default core config at {:?}", path);
            Ok(default)
        }
    }

    /// Save core config to file.
    pub fn save(&self) -> ConfigResult<()> {
        self.save_to(&core_config_path()?)
    }

    /// Save to an explicit path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::debug!("Saved core config to {:?}", path);
        Ok(())
    }

    /// Reload core config from file.
    pub fn reload(&mut self) -> ConfigResult<()> {
        let path = core_config_path()?;
        let content = std::fs::read_to_string(&path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        *self = config;
        tracing::debug!("Reloaded core config from {:?}", path);
        Ok(())
    }

    /// Reject values the pipeline cannot work with
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.ipd.is_finite() || self.ipd < 0.0 {
            return Err(ConfigError::Invalid(format!("ipd must be >= 0, got {}", self.ipd)));
        }
        if !self.world_scale.is_finite() || self.world_scale <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "world_scale must be > 0, got {}",
                self.world_scale
            )));
        }
        if let Some(scale) = self.fov_scale {
            if !scale.is_finite() || scale <= 0.0 {
                return Err(ConfigError::Invalid(format!("fov_scale must be > 0, got {scale}")));
            }
        }
        if self.max_buffer_size == 0 {
            return Err(ConfigError::Invalid("max_buffer_size must be > 0".to_string()));
        }
        if !self.frame_budget_ms.is_finite() || self.frame_budget_ms <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "frame_budget_ms must be > 0, got {}",
                self.frame_budget_ms
            )));
        }
        Ok(())
    }

    pub fn safety(&self) -> SafetyConfig {
        SafetyConfig {
            enable_memory_validation: self.enable_memory_validation,
            max_buffer_size: self.max_buffer_size,
        }
    }

    /// Stereo parameters, with a profile FOV override taking precedence
    pub fn stereo(&self, profile: Option<&Profile>) -> StereoConfig {
        StereoConfig {
            ipd: self.ipd,
            world_scale: self.world_scale,
            axis: self.lateral_axis,
            fov_scale: profile
                .and_then(|p| p.camera_system.fov_scale)
                .or(self.fov_scale),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_config_default() {
        let config = CoreConfig::default();
        assert_eq!(config.version, 1);
        assert!(!config.debug);
        assert_eq!(config.max_buffer_size, 1024 * 1024);
        assert_eq!(config.layout, StereoLayout::SideBySide);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_core_config_round_trip() {
        let config = CoreConfig {
            version: 2,
            debug: true,
            ipd: 0.07,
            world_scale: 100.0,
            lateral_axis: LateralAxis::Z,
            layout: StereoLayout::FullFrame,
            ..Default::default()
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("version = 2"));
        assert!(toml_str.contains("debug = true"));
        assert!(toml_str.contains("lateral_axis = \"z\""));

        let parsed: CoreConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: CoreConfig = toml::from_str("world_scale = 100.0\n").unwrap();
        assert_eq!(parsed.world_scale, 100.0);
        assert_eq!(parsed.ipd, 0.064);
        assert!(parsed.hooks.enable_hook_rollback);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = CoreConfig {
            world_scale: 0.0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = CoreConfig {
            fov_scale: Some(-1.0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_creates_default() {
        let dir = std::env::temp_dir().join(format!("vrshim-config-{}", std::process::id()));
        let path = dir.join("configs").join("core.toml");
        let _ = std::fs::remove_dir_all(&dir);

        let config = CoreConfig::load_from(&path).unwrap();
        assert_eq!(config, CoreConfig::default());
        assert!(path.exists());

        let again = CoreConfig::load_from(&path).unwrap();
        assert_eq!(again, config);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_profile_fov_overrides_config() {
        let config = CoreConfig {
            fov_scale: Some(1.2),
            ..Default::default()
        };
        assert_eq!(config.stereo(None).fov_scale, Some(1.2));

        let profile: Profile =
            serde_json::from_str(r#"{"camera_system": {"fov_scale": 0.9}}"#).unwrap();
        assert_eq!(config.stereo(Some(&profile)).fov_scale, Some(0.9));
    }
}
