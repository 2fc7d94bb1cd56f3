//! Linear-algebra kernel (component A): a thin wrapper over dense matrix
//! primitives used by the orchestrator and the inversion routines. Built on
//! `ndarray` for storage and `ndarray-linalg` for SVD / LU-based solves.

use ndarray::parallel::prelude::*;
use ndarray::{s, Array1, Array2, Axis};
use ndarray_linalg::{Inverse, SVD};

use crate::config::Truncation;
use crate::error::IesError;

/// ==============================================================================================
/// =================================== Linear-Algebra Kernel ====================================
/// ==============================================================================================

/// `C <- alpha * opA * opB + beta * C`, where `opA`/`opB` transpose their
/// operand first if the corresponding flag is set.
pub fn matmul(
    c: &mut Array2<f64>,
    a: &Array2<f64>,
    b: &Array2<f64>,
    trans_a: bool,
    trans_b: bool,
    alpha: f64,
    beta: f64,
) {
    let product = match (trans_a, trans_b) {
        (false, false) => a.dot(b),
        (true, false) => a.t().dot(b),
        (false, true) => a.dot(&b.t()),
        (true, true) => a.t().dot(&b.t()),
    };
    if beta == 0.0 {
        *c = product * alpha;
    } else {
        *c = &*c * beta + product * alpha;
    }
}

/// In-place transpose of a square matrix.
pub fn transpose_inplace(m: &mut Array2<f64>) {
    let (rows, cols) = m.dim();
    debug_assert_eq!(rows, cols, "transpose_inplace requires a square matrix");
    for i in 0..rows {
        for j in (i + 1)..cols {
            let tmp = m[(i, j)];
            m[(i, j)] = m[(j, i)];
            m[(j, i)] = tmp;
        }
    }
}

pub fn alloc_transpose(m: &Array2<f64>) -> Array2<f64> {
    m.t().to_owned()
}

pub fn alloc_copy(m: &Array2<f64>) -> Array2<f64> {
    m.clone()
}

/// Subtract the column-vector of row means from every column: for each row,
/// subtract that row's mean across columns. Equivalent to right-multiplying
/// by `I - 11^T / ncols`.
pub fn subtract_row_mean(m: &mut Array2<f64>) {
    let ncols = m.ncols();
    if ncols == 0 {
        return;
    }
    m.axis_iter_mut(Axis(0)).into_par_iter().for_each(|mut row| {
        let mean = row.sum() / ncols as f64;
        row.iter_mut().for_each(|x| *x -= mean);
    });
}

pub fn scale(m: &mut Array2<f64>, s: f64) {
    m.iter_mut().for_each(|x| *x *= s);
}

pub fn scale_row(m: &mut Array2<f64>, i: usize, s: f64) {
    m.row_mut(i).iter_mut().for_each(|x| *x *= s);
}

/// Overwrite every diagonal entry with `s` (does not touch off-diagonal
/// entries).
pub fn diag_set_scalar(m: &mut Array2<f64>, s: f64) {
    let n = m.nrows().min(m.ncols());
    for i in 0..n {
        m[(i, i)] = s;
    }
}

/// `M[i, j] += s`.
pub fn iadd(m: &mut Array2<f64>, i: usize, j: usize, s: f64) {
    m[(i, j)] += s;
}

/// Add `s` to every diagonal entry, built from repeated [`iadd`] calls
/// (e.g. forming `X <- W*nsc + I`).
pub fn add_scalar_to_diag(m: &mut Array2<f64>, s: f64) {
    let n = m.nrows().min(m.ncols());
    for i in 0..n {
        iadd(m, i, i, s);
    }
}

/// Solve `A * X = B` for `X`, via a dense LU-based inverse of `A`
/// (`ndarray-linalg`'s `Inverse`, which factorizes with partial pivoting).
pub fn solve(a: &Array2<f64>, b: &Array2<f64>) -> Result<Array2<f64>, IesError> {
    let a_inv = a
        .inv()
        .map_err(|e| IesError::numerical(format!("solve: matrix not invertible: {e}")))?;
    Ok(a_inv.dot(b))
}

/// Thin SVD with singular values in non-increasing order:
/// `M = U * diag(sigma) * Vt`.
pub fn svd(m: &Array2<f64>) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>), IesError> {
    let (u, sigma, vt) = m
        .svd(true, true)
        .map_err(|e| IesError::numerical(format!("svd failed to converge: {e}")))?;
    let u = u.ok_or_else(|| IesError::numerical("svd: U not computed"))?;
    let vt = vt.ok_or_else(|| IesError::numerical("svd: Vt not computed"))?;
    if sigma.iter().any(|s| !s.is_finite()) {
        return Err(IesError::numerical("svd: non-finite singular value"));
    }
    Ok((u, sigma, vt))
}

/// Truncated left-singular basis of `s` together with the reciprocal of its
/// retained singular values, i.e. `u[:, :r]` and `1 / sigma[:r]`.
fn truncated_whitening_basis(
    s: &Array2<f64>,
    truncation: &Truncation,
) -> Result<(Array2<f64>, Array1<f64>), IesError> {
    let (u, sigma, _vt) = svd(s)?;
    let rank = truncation.rank(sigma.as_slice().unwrap()).max(1).min(u.ncols());
    let u_r = u.slice(s![.., 0..rank]).to_owned();
    let sigma_inv = sigma.slice(s![0..rank]).mapv(|v| 1.0 / v);
    Ok((u_r, sigma_inv))
}

/// Symmetric eigen-decomposition via SVD (valid because the input here is
/// always symmetric positive (semi-)definite, for which singular values
/// coincide with eigenvalues and `U` with the eigenvector basis).
fn symmetric_eigen(m: &Array2<f64>) -> Result<(Array2<f64>, Array1<f64>), IesError> {
    let (u, sigma, _vt) = svd(m)?;
    Ok((u, sigma))
}

/// `lowrankCinv`: compute `X1`, `eig` such that
/// `X1 * diag(eig) * X1^T ~ (S*S^T + C)^-1`, truncated per `truncation`.
/// `C` is a full `m x m` positive-definite matrix (e.g. scaled `R`, or
/// `E*E^T`); forming it explicitly makes this the `O(N*m^2)` branch.
pub fn lowrank_cinv(
    s: &Array2<f64>,
    c: &Array2<f64>,
    truncation: &Truncation,
) -> Result<(Array2<f64>, Array1<f64>), IesError> {
    let (u_r, sigma_inv) = truncated_whitening_basis(s, truncation)?;
    // M = diag(sigma_inv) * U_r^T  (r x m)
    let mut m_proj = u_r.t().to_owned();
    for (i, row_scale) in sigma_inv.iter().enumerate() {
        m_proj.row_mut(i).iter_mut().for_each(|x| *x *= row_scale);
    }
    let c_hat = m_proj.dot(c).dot(&m_proj.t());
    let (z, lambda) = symmetric_eigen(&c_hat)?;
    let eig = lambda.mapv(|l| 1.0 / (1.0 + l));
    let x1 = {
        let mut u_scaled = u_r.clone();
        for (mut col, &inv) in u_scaled.axis_iter_mut(Axis(1)).zip(sigma_inv.iter()) {
            col.iter_mut().for_each(|x| *x *= inv);
        }
        u_scaled.dot(&z)
    };
    Ok((x1, eig))
}

/// `lowrankE`: same contract as [`lowrank_cinv`], but takes the perturbation
/// ensemble `e` (`m x Ne`) directly instead of the formed `E*E^T`, avoiding
/// the `m x m` intermediate. This is the `O(N^2*m)` branch, preferred when
/// `m >> N`.
pub fn lowrank_e(
    s: &Array2<f64>,
    e: &Array2<f64>,
    truncation: &Truncation,
) -> Result<(Array2<f64>, Array1<f64>), IesError> {
    let (u_r, sigma_inv) = truncated_whitening_basis(s, truncation)?;
    let mut m_proj = u_r.t().to_owned();
    for (i, row_scale) in sigma_inv.iter().enumerate() {
        m_proj.row_mut(i).iter_mut().for_each(|x| *x *= row_scale);
    }
    let ut_e = m_proj.dot(e); // r x Ne, avoids forming the m x m E*E^T
    let c_hat = ut_e.dot(&ut_e.t());
    let (z, lambda) = symmetric_eigen(&c_hat)?;
    let eig = lambda.mapv(|l| 1.0 / (1.0 + l));
    let x1 = {
        let mut u_scaled = u_r.clone();
        for (mut col, &inv) in u_scaled.axis_iter_mut(Axis(1)).zip(sigma_inv.iter()) {
            col.iter_mut().for_each(|x| *x *= inv);
        }
        u_scaled.dot(&z)
    };
    Ok((x1, eig))
}

/// `X3 <- X1 * diag(eig) * X1^T * H`, computed without forming the `m x m`
/// product `X1 * diag(eig) * X1^T` explicitly.
pub fn gen_x3(x1: &Array2<f64>, eig: &Array1<f64>, h: &Array2<f64>) -> Array2<f64> {
    let mut t = x1.t().dot(h); // r x ncols(H)
    for (mut row, &e) in t.axis_iter_mut(Axis(0)).zip(eig.iter()) {
        row.iter_mut().for_each(|x| *x *= e);
    }
    x1.dot(&t)
}
