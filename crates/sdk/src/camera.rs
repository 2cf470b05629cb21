//! Camera state types
//!
//! [`CameraMatrices`] is the snapshot consumed by stereo rendering and by
//! collaborators outside the core (controller mapping, UI projection).

use crate::math::{Mat4, IDENTITY};

/// Where a matrix lives inside the bound constant buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatrixMapping {
    /// Constant buffer slot (0..=13 on D3D11)
    pub cb_slot: u32,
    /// Byte offset of the first float inside the buffer
    pub offset_bytes: usize,
}

impl MatrixMapping {
    pub const fn new(cb_slot: u32, offset_bytes: usize) -> Self {
        Self {
            cb_slot,
            offset_bytes,
        }
    }
}

/// Snapshot of the game camera and the derived per-eye views
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraMatrices {
    pub view: Mat4,
    pub projection: Mat4,
    pub left_view: Mat4,
    pub right_view: Mat4,
    pub left_projection: Mat4,
    pub right_projection: Mat4,
    /// True once a view or projection has been extracted and validated
    pub valid: bool,
    /// Frame index of the last successful update
    pub frame: u64,
}

impl Default for CameraMatrices {
    fn default() -> Self {
        Self {
            view: IDENTITY,
            projection: IDENTITY,
            left_view: IDENTITY,
            right_view: IDENTITY,
            left_projection: IDENTITY,
            right_projection: IDENTITY,
            valid: false,
            frame: 0,
        }
    }
}

impl CameraMatrices {
    /// View matrix for one eye
    pub fn eye_view(&self, eye: crate::pipeline::Eye) -> &Mat4 {
        match eye {
            crate::pipeline::Eye::Left => &self.left_view,
            crate::pipeline::Eye::Right => &self.right_view,
        }
    }

    /// Projection matrix for one eye
    pub fn eye_projection(&self, eye: crate::pipeline::Eye) -> &Mat4 {
        match eye {
            crate::pipeline::Eye::Left => &self.left_projection,
            crate::pipeline::Eye::Right => &self.right_projection,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Eye;

    #[test]
    fn test_default_is_invalid_identity() {
        let cam = CameraMatrices::default();
        assert!(!cam.valid);
        assert_eq!(cam.view, IDENTITY);
        assert_eq!(cam.eye_view(Eye::Right), &IDENTITY);
    }
}
