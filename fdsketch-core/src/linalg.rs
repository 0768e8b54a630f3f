//! Dense helpers on top of smartcore's `DenseMatrix` and a thin SVD wrapper.
//!
//! smartcore's SVD follows the tall-matrix convention (`m >= n`); sketches are
//! frequently wide (`2·ell < d`), so [`thin_svd`] decomposes the transpose in
//! that case and swaps the factors back. Singular triplets are always returned
//! in descending order of singular value.

use std::cmp::Ordering;

use log::trace;
use smartcore::linalg::basic::arrays::{Array, Array2, MutArray};
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::linalg::traits::svd::SVDDecomposable;

use crate::error::{Result, SketchError};

/// Relative floor below which a singular value counts as zero.
pub const RANK_RTOL: f64 = 1e-10;

/// Thin singular value decomposition `A = U·diag(s)·Vᵗ` with `k = min(m, n)`.
#[derive(Clone, Debug)]
pub struct ThinSvd {
    /// Left singular vectors, one `Vec` of length `m` per component.
    pub left: Vec<Vec<f64>>,
    /// Singular values, descending, non-negative.
    pub singular_values: Vec<f64>,
    /// Right singular vectors (rows of `Vᵗ`), one `Vec` of length `n` per component.
    pub right: Vec<Vec<f64>>,
}

impl ThinSvd {
    /// Number of singular values above `s_max · max(RANK_RTOL, max(m, n) · ε)`.
    pub fn numerical_rank(&self, m: usize, n: usize) -> usize {
        let s_max = self.singular_values.first().copied().unwrap_or(0.0);
        if s_max <= 0.0 {
            return 0;
        }
        let tol = s_max * RANK_RTOL.max(m.max(n) as f64 * f64::EPSILON);
        self.singular_values.iter().filter(|&&s| s > tol).count()
    }
}

/// Build an `nrows × ncols` matrix from row slices.
pub fn dense_from_rows(rows: &[Vec<f64>], ncols: usize) -> DenseMatrix<f64> {
    let mut m = DenseMatrix::<f64>::zeros(rows.len(), ncols);
    for (i, row) in rows.iter().enumerate() {
        for (j, v) in row.iter().enumerate().take(ncols) {
            m.set((i, j), *v);
        }
    }
    m
}

/// Copy the rows `[start, end)` of `m` out as owned vectors.
pub fn rows_of(m: &DenseMatrix<f64>, start: usize, end: usize) -> Vec<Vec<f64>> {
    (start..end)
        .map(|i| m.get_row(i).iterator(0).copied().collect())
        .collect()
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn squared_norm(a: &[f64]) -> f64 {
    a.iter().map(|x| x * x).sum()
}

/// Squared Frobenius norm of a row set.
pub fn frobenius_squared(rows: &[Vec<f64>]) -> f64 {
    rows.iter().map(|r| squared_norm(r)).sum()
}

/// Thin SVD of an arbitrary `m × n` matrix.
///
/// # Errors
/// `SketchError::Decomposition` when smartcore fails to converge or loses a
/// nonzero input entirely. Callers must not recover from this: a sketch that
/// skipped a rotation is silently wrong.
pub fn thin_svd(a: &DenseMatrix<f64>) -> Result<ThinSvd> {
    let (m, n) = a.shape();
    let wide = m < n;

    // smartcore's tolerances are absolute, so tiny entries decompose to zero
    // singular values unless the input is brought to unit scale first.
    let mut scale = 0.0_f64;
    for i in 0..m {
        for j in 0..n {
            scale = scale.max(a.get((i, j)).abs());
        }
    }
    if !scale.is_finite() {
        return Err(SketchError::Decomposition(
            "non-finite matrix entry".to_string(),
        ));
    }
    if scale == 0.0 {
        let k = m.min(n);
        let unit = |len: usize, c: usize| -> Vec<f64> {
            (0..len).map(|r| if r == c { 1.0 } else { 0.0 }).collect()
        };
        return Ok(ThinSvd {
            left: (0..k).map(|c| unit(m, c)).collect(),
            singular_values: vec![0.0; k],
            right: (0..k).map(|c| unit(n, c)).collect(),
        });
    }
    let inv = 1.0 / scale;

    let mut work = if wide {
        DenseMatrix::<f64>::zeros(n, m)
    } else {
        DenseMatrix::<f64>::zeros(m, n)
    };
    for i in 0..m {
        for j in 0..n {
            let v = *a.get((i, j)) * inv;
            if wide {
                work.set((j, i), v);
            } else {
                work.set((i, j), v);
            }
        }
    }
    let (p, q) = work.shape();
    trace!("thin_svd: {}x{} (wide={}, scale={:e})", m, n, wide, scale);

    let svd = work
        .svd()
        .map_err(|e| SketchError::Decomposition(e.to_string()))?;

    if svd.s.iter().any(|s| !s.is_finite()) {
        return Err(SketchError::Decomposition(
            "non-finite singular value".to_string(),
        ));
    }
    if svd.s.iter().all(|&s| s <= 0.0) {
        return Err(SketchError::Decomposition(
            "all singular values vanished for a nonzero matrix".to_string(),
        ));
    }

    let mut order: Vec<usize> = (0..q).collect();
    order.sort_by(|&i, &j| svd.s[j].partial_cmp(&svd.s[i]).unwrap_or(Ordering::Equal));

    let column = |mat: &DenseMatrix<f64>, len: usize, c: usize| -> Vec<f64> {
        (0..len).map(|r| *mat.get((r, c))).collect()
    };

    let mut left = Vec::with_capacity(q);
    let mut right = Vec::with_capacity(q);
    let mut singular_values = Vec::with_capacity(q);
    for &c in &order {
        singular_values.push(svd.s[c].max(0.0) * scale);
        if wide {
            // work = Aᵗ, so A's left vectors are work's right vectors and vice versa
            left.push(column(&svd.V, q, c));
            right.push(column(&svd.U, p, c));
        } else {
            left.push(column(&svd.U, p, c));
            right.push(column(&svd.V, q, c));
        }
    }

    Ok(ThinSvd {
        left,
        singular_values,
        right,
    })
}
