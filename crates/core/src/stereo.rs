//! Per-eye view and projection derivation
//!
//! Each eye's view is the game view followed by a lateral translation in
//! view space of half the interpupillary distance, scaled into world units.

use glam::{Mat4 as GlamMat4, Vec3};
use serde::{Deserialize, Serialize};
use vrshim_sdk::{idx, CameraMatrices, Eye, Mat4};

/// View-space axis the eyes are separated along
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LateralAxis {
    #[default]
    X,
    Y,
    Z,
}

impl LateralAxis {
    fn unit(self) -> Vec3 {
        match self {
            Self::X => Vec3::X,
            Self::Y => Vec3::Y,
            Self::Z => Vec3::Z,
        }
    }
}

/// Stereo parameters resolved from config and profile
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoConfig {
    /// Interpupillary distance in meters
    pub ipd: f32,
    /// Game units per meter
    pub world_scale: f32,
    pub axis: LateralAxis,
    /// Widens (> 1) or narrows (< 1) the projection shared by both eyes
    pub fov_scale: Option<f32>,
}

impl Default for StereoConfig {
    fn default() -> Self {
        Self {
            ipd: 0.064,
            world_scale: 1.0,
            axis: LateralAxis::X,
            fov_scale: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StereoTransformEngine {
    config: StereoConfig,
}

impl StereoTransformEngine {
    pub fn new(config: StereoConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StereoConfig {
        &self.config
    }

    /// Signed lateral offset for `eye`; left and right are exact negatives
    pub fn eye_offset(&self, eye: Eye) -> f32 {
        let half = self.config.ipd * 0.5 * self.config.world_scale;
        match eye {
            Eye::Left => half,
            Eye::Right => -half,
        }
    }

    /// `view` followed by the eye's lateral translation
    pub fn eye_view(&self, view: &Mat4, eye: Eye) -> Mat4 {
        let offset = self.config.axis.unit() * self.eye_offset(eye);
        // Row-major row-vector arrays read as column-vector glam matrices,
        // so `view * T` becomes `T * view` here.
        (GlamMat4::from_translation(offset) * GlamMat4::from_cols_array(view)).to_cols_array()
    }

    /// The projection both eyes share
    pub fn adjusted_projection(&self, projection: &Mat4) -> Mat4 {
        let mut out = *projection;
        if let Some(scale) = self.config.fov_scale.filter(|s| *s > 0.0) {
            out[idx(0, 0)] /= scale;
            out[idx(1, 1)] /= scale;
        }
        out
    }

    /// Fill the per-eye fields of `camera` from its view and projection
    pub fn apply(&self, camera: &mut CameraMatrices) {
        camera.left_view = self.eye_view(&camera.view, Eye::Left);
        camera.right_view = self.eye_view(&camera.view, Eye::Right);
        let projection = self.adjusted_projection(&camera.projection);
        camera.left_projection = projection;
        camera.right_projection = projection;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vrshim_sdk::IDENTITY;

    fn engine(ipd: f32, world_scale: f32, axis: LateralAxis) -> StereoTransformEngine {
        StereoTransformEngine::new(StereoConfig {
            ipd,
            world_scale,
            axis,
            fov_scale: None,
        })
    }

    #[test]
    fn test_identity_view_symmetry() {
        let engine = engine(0.064, 100.0, LateralAxis::X);
        let left = engine.eye_view(&IDENTITY, Eye::Left);
        let right = engine.eye_view(&IDENTITY, Eye::Right);

        assert!((left[idx(3, 0)] - 3.2).abs() < 1e-5);
        assert!((right[idx(3, 0)] + 3.2).abs() < 1e-5);
        assert_eq!(left[idx(3, 0)], -right[idx(3, 0)]);
        assert_eq!(left[idx(3, 1)], 0.0);
        assert_eq!(left[idx(3, 2)], 0.0);
    }

    #[test]
    fn test_offset_applies_in_view_space() {
        let view = GlamMat4::look_at_lh(Vec3::new(5.0, 1.0, -3.0), Vec3::ZERO, Vec3::Y).to_cols_array();
        let engine = engine(0.064, 100.0, LateralAxis::X);
        let left = engine.eye_view(&view, Eye::Left);
        let right = engine.eye_view(&view, Eye::Right);

        // Rotation is untouched
        for r in 0..3 {
            for c in 0..3 {
                assert_eq!(left[idx(r, c)], view[idx(r, c)]);
            }
        }
        // Translations differ by exactly the full IPD along view-space X
        assert!((left[idx(3, 0)] - right[idx(3, 0)] - 6.4).abs() < 1e-4);
        assert!((left[idx(3, 1)] - right[idx(3, 1)]).abs() < 1e-5);
        assert!((left[idx(3, 2)] - right[idx(3, 2)]).abs() < 1e-5);
    }

    #[test]
    fn test_lateral_axis_selection() {
        let engine = engine(0.064, 1.0, LateralAxis::Z);
        let left = engine.eye_view(&IDENTITY, Eye::Left);
        assert_eq!(left[idx(3, 0)], 0.0);
        assert!((left[idx(3, 2)] - 0.032).abs() < 1e-7);
    }

    #[test]
    fn test_apply_shares_projection() {
        let engine = engine(0.064, 1.0, LateralAxis::X);
        let mut camera = CameraMatrices {
            projection: GlamMat4::perspective_lh(1.2, 1.5, 0.1, 100.0).to_cols_array(),
            ..Default::default()
        };
        engine.apply(&mut camera);
        assert_eq!(camera.left_projection, camera.projection);
        assert_eq!(camera.right_projection, camera.projection);
        assert_eq!(camera.eye_view(Eye::Left)[idx(3, 0)], 0.032);
    }

    #[test]
    fn test_fov_scale_adjusts_focal_terms() {
        let engine = StereoTransformEngine::new(StereoConfig {
            fov_scale: Some(2.0),
            ..Default::default()
        });
        let projection = GlamMat4::perspective_lh(1.0, 1.0, 0.1, 100.0).to_cols_array();
        let adjusted = engine.adjusted_projection(&projection);

        assert!((adjusted[idx(0, 0)] - projection[idx(0, 0)] / 2.0).abs() < 1e-6);
        assert!((adjusted[idx(1, 1)] - projection[idx(1, 1)] / 2.0).abs() < 1e-6);
        assert_eq!(adjusted[idx(2, 2)], projection[idx(2, 2)]);
        assert_eq!(adjusted[idx(3, 2)], projection[idx(3, 2)]);
    }
}
