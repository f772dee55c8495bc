use nalgebra::SMatrix;

/// Small enumerations shared by the fitting routines.
pub mod enums;
/// Traits to give additional functionality to [`nalgebra::Vector3`] and [`nalgebra::Vector4`] (in
/// particular, to treat the latter as a four-momentum).
pub mod vectors;

/// A dense 8x8 matrix over the particle parameters `[x, y, z, px, py, pz, E, s]`.
pub type Matrix8 = SMatrix<f64, 8, 8>;

/// Index of element `(i, j)` in a symmetric matrix stored as its packed lower triangle.
///
/// The packing is row-wise, so a 3x3 block is laid out as `[xx, xy, yy, xz, yz, zz]`.
#[inline]
pub const fn ij(i: usize, j: usize) -> usize {
    if j <= i {
        i * (i + 1) / 2 + j
    } else {
        j * (j + 1) / 2 + i
    }
}

/// Invert a packed symmetric 3x3 matrix `[xx, xy, yy, xz, yz, zz]` by cofactor expansion.
///
/// Returns [`None`] when the determinant does not exceed `threshold`. Covariance sums are
/// positive definite, so a small or negative determinant means the system is degenerate.
pub fn invert_sym3(a: &[f64; 6], threshold: f64) -> Option<[f64; 6]> {
    let mut ai = [
        a[2] * a[5] - a[4] * a[4],
        a[3] * a[4] - a[1] * a[5],
        a[0] * a[5] - a[3] * a[3],
        a[1] * a[4] - a[2] * a[3],
        a[1] * a[3] - a[0] * a[4],
        a[0] * a[2] - a[1] * a[1],
    ];
    let det = a[0] * ai[0] + a[1] * ai[1] + a[3] * ai[3];
    if det <= threshold {
        return None;
    }
    let inv = 1.0 / det;
    ai.iter_mut().for_each(|v| *v *= inv);
    Some(ai)
}

/// Multiply a packed symmetric 3x3 matrix by a vector.
#[inline]
pub fn sym3_mul(s: &[f64; 6], v: &[f64; 3]) -> [f64; 3] {
    [
        s[0] * v[0] + s[1] * v[1] + s[3] * v[2],
        s[1] * v[0] + s[2] * v[1] + s[4] * v[2],
        s[3] * v[0] + s[4] * v[1] + s[5] * v[2],
    ]
}

/// The quadratic form `vᵗ S v` for a packed symmetric 3x3 matrix `S`.
#[inline]
pub fn sym3_quadratic(s: &[f64; 6], v: &[f64; 3]) -> f64 {
    let sv = sym3_mul(s, v);
    sv[0] * v[0] + sv[1] * v[1] + sv[2] * v[2]
}

/// Expand a packed 36-entry covariance into a dense symmetric [`Matrix8`].
pub fn unpack_sym8(c: &[f64; 36]) -> Matrix8 {
    Matrix8::from_fn(|i, j| c[ij(i, j)])
}

/// Pack the lower triangle of a dense [`Matrix8`].
pub fn pack_sym8(m: &Matrix8) -> [f64; 36] {
    let mut out = [0.0; 36];
    for i in 0..8 {
        for j in 0..=i {
            out[ij(i, j)] = m[(i, j)];
        }
    }
    out
}

/// Similarity transform `Q S Qᵗ` of a packed symmetric covariance by a dense Jacobian.
pub fn mult_qsqt(q: &Matrix8, s: &[f64; 36]) -> [f64; 36] {
    pack_sym8(&(q * unpack_sym8(s) * q.transpose()))
}
