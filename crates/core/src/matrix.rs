//! Camera matrix location and validation
//!
//! Matrices are read from raw constant buffer bytes, either at the slot and
//! offset a profile names or by scanning every 4-byte aligned 64-byte window
//! for something that looks like a view or projection matrix.
//!
//! All matrices here are row-major with the row-vector convention
//! (`_41 _42 _43` hold the translation). Engines that store column-major
//! set `matrix_layout.transpose` in their profile.

use glam::Mat4 as GlamMat4;
use serde::{Deserialize, Serialize};
use vrshim_sdk::{idx, mat4_from_le_bytes, transpose, Mat4, MatrixMapping, MAT4_SIZE};

/// Tunable acceptance thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicThresholds {
    /// Allowed |det - 1| for a view matrix
    pub view_det_tolerance: f32,
    /// Allowed deviation of the structural 0/±1 entries of a projection
    pub projection_tolerance: f32,
    /// Tolerance for [`is_identity`] when skipping identity windows in a scan
    pub identity_tolerance: f32,
    /// Elements beyond this magnitude reject a matrix outright
    pub max_abs_element: f32,
}

impl Default for HeuristicThresholds {
    fn default() -> Self {
        Self {
            view_det_tolerance: 0.1,
            projection_tolerance: 1e-3,
            identity_tolerance: 1e-6,
            max_abs_element: 1.0e7,
        }
    }
}

/// How a title stores its matrices
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixLayout {
    /// Column-major storage; transpose after reading
    pub transpose: bool,
}

/// Parameters recovered from a perspective projection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionInfo {
    pub fov_y_radians: f32,
    pub aspect: f32,
    pub near: f32,
    /// Infinite for infinite-far projections
    pub far: f32,
    pub reversed_z: bool,
}

pub fn is_finite(m: &Mat4) -> bool {
    m.iter().all(|v| v.is_finite())
}

pub fn determinant(m: &Mat4) -> f32 {
    GlamMat4::from_cols_array(m).determinant()
}

pub fn is_identity(m: &Mat4, tolerance: f32) -> bool {
    m.iter().enumerate().all(|(i, v)| {
        let expected = if i % 5 == 0 { 1.0 } else { 0.0 };
        (v - expected).abs() <= tolerance
    })
}

/// Where a matrix was found
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocatedMatrix {
    pub offset_bytes: usize,
    pub matrix: Mat4,
}

/// Extracts and validates matrices from constant buffer bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct MatrixLocator {
    thresholds: HeuristicThresholds,
    layout: MatrixLayout,
}

impl MatrixLocator {
    pub fn new(thresholds: HeuristicThresholds, layout: MatrixLayout) -> Self {
        Self { thresholds, layout }
    }

    pub fn thresholds(&self) -> &HeuristicThresholds {
        &self.thresholds
    }

    pub fn layout(&self) -> MatrixLayout {
        self.layout
    }

    /// Matrix at `offset_bytes`, in row-major order, if finite and in bounds
    pub fn extract(&self, bytes: &[u8], cb_slot: u32, offset_bytes: usize) -> Option<Mat4> {
        let window = bytes.get(offset_bytes..offset_bytes.checked_add(MAT4_SIZE)?)?;
        let mut raw = [0u8; MAT4_SIZE];
        raw.copy_from_slice(window);
        let m = self.to_row_major(mat4_from_le_bytes(&raw));
        if !self.is_sane(&m) {
            tracing::trace!(
                target: "vrshim::matrix",
                "Non-finite matrix in cb{} at offset {}",
                cb_slot,
                offset_bytes
            );
            return None;
        }
        Some(m)
    }

    /// Validated view matrix at a profile mapping
    pub fn extract_view(&self, bytes: &[u8], mapping: MatrixMapping) -> Option<Mat4> {
        self.extract(bytes, mapping.cb_slot, mapping.offset_bytes)
            .filter(|m| self.is_valid_view_matrix(m))
    }

    /// Validated projection matrix at a profile mapping
    pub fn extract_projection(&self, bytes: &[u8], mapping: MatrixMapping) -> Option<Mat4> {
        self.extract(bytes, mapping.cb_slot, mapping.offset_bytes)
            .filter(|m| self.is_valid_projection_matrix(m))
    }

    /// Undo [`MatrixLayout`] for writing a matrix back into a buffer
    pub fn to_buffer_layout(&self, m: &Mat4) -> Mat4 {
        if self.layout.transpose {
            transpose(m)
        } else {
            *m
        }
    }

    fn to_row_major(&self, m: Mat4) -> Mat4 {
        if self.layout.transpose {
            transpose(&m)
        } else {
            m
        }
    }

    fn is_sane(&self, m: &Mat4) -> bool {
        is_finite(m) && m.iter().all(|v| v.abs() <= self.thresholds.max_abs_element)
    }

    /// Rigid view transform: finite with unit determinant
    pub fn is_valid_view_matrix(&self, m: &Mat4) -> bool {
        if !self.is_sane(m) {
            return false;
        }
        // Affine: last column is (0, 0, 0, 1)
        let tol = self.thresholds.projection_tolerance;
        if m[idx(0, 3)].abs() > tol
            || m[idx(1, 3)].abs() > tol
            || m[idx(2, 3)].abs() > tol
            || (m[idx(3, 3)] - 1.0).abs() > tol
        {
            return false;
        }
        (determinant(m) - 1.0).abs() <= self.thresholds.view_det_tolerance
    }

    /// Perspective projection with positive near and far planes
    ///
    /// Accepts left- and right-handed, standard and reversed depth, and
    /// infinite far planes. Orthographic matrices are rejected.
    pub fn is_valid_projection_matrix(&self, m: &Mat4) -> bool {
        self.is_sane(m) && self.projection_info(m).is_some()
    }

    /// Recover FOV, aspect and clip planes from a perspective projection
    pub fn projection_info(&self, m: &Mat4) -> Option<ProjectionInfo> {
        let tol = self.thresholds.projection_tolerance;

        // Structural zeros of a perspective matrix
        let zeros = [
            idx(0, 1),
            idx(0, 2),
            idx(0, 3),
            idx(1, 0),
            idx(1, 2),
            idx(1, 3),
            idx(3, 0),
            idx(3, 1),
            idx(3, 3),
        ];
        if zeros.iter().any(|&i| m[i].abs() > tol) {
            return None;
        }

        // _34 is +1 (left-handed) or -1 (right-handed)
        let w = m[idx(2, 3)];
        if (w.abs() - 1.0).abs() > tol {
            return None;
        }
        let sx = m[idx(0, 0)];
        let sy = m[idx(1, 1)];
        if sx <= 0.0 || sy <= 0.0 {
            return None;
        }

        // Depth at view distance d is a + b / d
        let a = w.signum() * m[idx(2, 2)];
        let b = m[idx(3, 2)];

        let (near, far, reversed_z) = if b < 0.0 && a >= 1.0 {
            let near = -b / a;
            let far = if a - 1.0 <= f32::EPSILON {
                f32::INFINITY
            } else {
                b / (1.0 - a)
            };
            (near, far, false)
        } else if b > 0.0 && a <= 0.0 {
            let near = b / (1.0 - a);
            let far = if a.abs() <= f32::EPSILON {
                f32::INFINITY
            } else {
                -b / a
            };
            (near, far, true)
        } else {
            return None;
        };

        if !(near > 0.0 && far > near) {
            return None;
        }

        Some(ProjectionInfo {
            fov_y_radians: 2.0 * (1.0 / sy).atan(),
            aspect: sy / sx,
            near,
            far,
            reversed_z,
        })
    }

    fn scan(&self, bytes: &[u8], accept: impl Fn(&Mat4) -> bool) -> Option<LocatedMatrix> {
        if bytes.len() < MAT4_SIZE {
            return None;
        }
        (0..=bytes.len() - MAT4_SIZE).step_by(4).find_map(|offset| {
            let m = self.extract(bytes, 0, offset)?;
            if is_identity(&m, self.thresholds.identity_tolerance) || !accept(&m) {
                return None;
            }
            Some(LocatedMatrix {
                offset_bytes: offset,
                matrix: m,
            })
        })
    }

    /// First window that passes the view checks
    ///
    /// Identity windows are skipped; they are far more often an unused
    /// world matrix than a camera.
    pub fn scan_for_view(&self, bytes: &[u8]) -> Option<LocatedMatrix> {
        self.scan(bytes, |m| self.is_valid_view_matrix(m))
    }

    /// First window that passes the projection checks
    pub fn scan_for_projection(&self, bytes: &[u8]) -> Option<LocatedMatrix> {
        self.scan(bytes, |m| self.is_valid_projection_matrix(m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use vrshim_sdk::{mat4_to_le_bytes, IDENTITY};

    fn view() -> Mat4 {
        GlamMat4::look_at_lh(Vec3::new(3.0, 2.0, -10.0), Vec3::ZERO, Vec3::Y).to_cols_array()
    }

    fn projection_lh() -> Mat4 {
        GlamMat4::perspective_lh(90f32.to_radians(), 16.0 / 9.0, 0.1, 1000.0).to_cols_array()
    }

    fn buffer_with(at: usize, m: &Mat4, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        bytes[at..at + MAT4_SIZE].copy_from_slice(&mat4_to_le_bytes(m));
        bytes
    }

    #[test]
    fn test_extract_round_trip() {
        let locator = MatrixLocator::default();
        let m = view();
        let bytes = buffer_with(48, &m, 256);

        let out = locator.extract(&bytes, 2, 48).unwrap();
        for i in 0..16 {
            assert!((out[i] - m[i]).abs() < 1e-5);
        }
        assert!(locator.extract(&bytes, 2, 250).is_none());
    }

    #[test]
    fn test_extract_transposed_layout() {
        let locator = MatrixLocator::new(
            HeuristicThresholds::default(),
            MatrixLayout { transpose: true },
        );
        let m = view();
        let bytes = buffer_with(0, &transpose(&m), 64);
        assert_eq!(locator.extract(&bytes, 0, 0), Some(m));
        assert_eq!(locator.to_buffer_layout(&m), transpose(&m));
    }

    #[test]
    fn test_view_validation() {
        let locator = MatrixLocator::default();
        assert!(locator.is_valid_view_matrix(&view()));
        assert!(locator.is_valid_view_matrix(&IDENTITY));

        let mut nan = view();
        nan[5] = f32::NAN;
        assert!(!locator.is_valid_view_matrix(&nan));

        // det = 5
        let mut scaled = IDENTITY;
        scaled[0] = 5.0;
        assert!((determinant(&scaled) - 5.0).abs() < 1e-6);
        assert!(!locator.is_valid_view_matrix(&scaled));

        assert!(!locator.is_valid_view_matrix(&projection_lh()));
    }

    #[test]
    fn test_projection_validation() {
        let locator = MatrixLocator::default();

        let info = locator.projection_info(&projection_lh()).unwrap();
        assert!((info.near - 0.1).abs() < 1e-4);
        assert!((info.far - 1000.0).abs() < 1.0);
        assert!((info.fov_y_radians - 90f32.to_radians()).abs() < 1e-4);
        assert!((info.aspect - 16.0 / 9.0).abs() < 1e-4);
        assert!(!info.reversed_z);

        let rh = GlamMat4::perspective_rh(1.0, 1.5, 0.5, 500.0).to_cols_array();
        let info = locator.projection_info(&rh).unwrap();
        assert!((info.near - 0.5).abs() < 1e-3);
        assert!((info.far - 500.0).abs() < 1.0);

        let reversed = GlamMat4::perspective_infinite_reverse_lh(1.0, 1.5, 0.1).to_cols_array();
        let info = locator.projection_info(&reversed).unwrap();
        assert!(info.reversed_z);
        assert!(info.far.is_infinite());
        assert!((info.near - 0.1).abs() < 1e-5);

        let ortho = GlamMat4::orthographic_lh(-1.0, 1.0, -1.0, 1.0, 0.1, 100.0).to_cols_array();
        assert!(!locator.is_valid_projection_matrix(&ortho));
        assert!(!locator.is_valid_projection_matrix(&view()));
        assert!(!locator.is_valid_projection_matrix(&IDENTITY));
    }

    #[test]
    fn test_scan_finds_first_valid_window() {
        let locator = MatrixLocator::default();
        let mut bytes = buffer_with(0, &IDENTITY, 320);
        bytes[64..128].copy_from_slice(&mat4_to_le_bytes(&view()));
        bytes[192..256].copy_from_slice(&mat4_to_le_bytes(&projection_lh()));

        let v = locator.scan_for_view(&bytes).unwrap();
        assert_eq!(v.offset_bytes, 64);
        assert_eq!(v.matrix, view());

        let p = locator.scan_for_projection(&bytes).unwrap();
        assert_eq!(p.offset_bytes, 192);

        assert!(locator.scan_for_view(&[0u8; 32]).is_none());
        assert!(locator.scan_for_view(&[0u8; 256]).is_none());
    }

    #[test]
    fn test_mapping_extract_rejects_wrong_kind() {
        let locator = MatrixLocator::default();
        let bytes = buffer_with(0, &projection_lh(), 128);
        let mapping = MatrixMapping::new(0, 0);
        assert!(locator.extract_projection(&bytes, mapping).is_some());
        assert!(locator.extract_view(&bytes, mapping).is_none());
    }
}
