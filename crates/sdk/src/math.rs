//! Raw matrix layout
//!
//! Matrices are kept exactly as they appear in a constant buffer: sixteen
//! little-endian `f32` values, row-major with the row-vector convention used
//! by Direct3D (translation lives in elements 12, 13 and 14).

/// A 4x4 matrix as sixteen consecutive floats
pub type Mat4 = [f32; 16];

/// Size of a matrix in bytes
pub const MAT4_SIZE: usize = std::mem::size_of::<Mat4>();

/// Identity matrix
pub const IDENTITY: Mat4 = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Row-major element index for row `r`, column `c`
#[inline]
pub const fn idx(r: usize, c: usize) -> usize {
    r * 4 + c
}

/// Decode a matrix from exactly 64 little-endian bytes
pub fn mat4_from_le_bytes(bytes: &[u8; MAT4_SIZE]) -> Mat4 {
    let mut out = [0.0f32; 16];
    for (i, chunk) in bytes.chunks_exact(4).enumerate() {
        out[i] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    out
}

/// Encode a matrix into 64 little-endian bytes
pub fn mat4_to_le_bytes(m: &Mat4) -> [u8; MAT4_SIZE] {
    let mut out = [0u8; MAT4_SIZE];
    for (i, v) in m.iter().enumerate() {
        out[i * 4..(i + 1) * 4].copy_from_slice(&v.to_le_bytes());
    }
    out
}

/// Swap rows and columns
pub fn transpose(m: &Mat4) -> Mat4 {
    let mut out = [0.0f32; 16];
    for r in 0..4 {
        for c in 0..4 {
            out[idx(c, r)] = m[idx(r, c)];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_le_bytes_round_trip() {
        let mut m = IDENTITY;
        m[12] = 3.5;
        m[13] = -1.25;
        let bytes = mat4_to_le_bytes(&m);
        assert_eq!(mat4_from_le_bytes(&bytes), m);
    }

    #[test]
    fn test_transpose_moves_translation() {
        let mut m = IDENTITY;
        m[idx(3, 0)] = 7.0;
        let t = transpose(&m);
        assert_eq!(t[idx(0, 3)], 7.0);
        assert_eq!(t[idx(3, 0)], 0.0);
        assert_eq!(transpose(&t), m);
    }
}
