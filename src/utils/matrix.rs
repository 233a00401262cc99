//! Symmetric-matrix helpers shared by the KFit and tree fitters.
//!
//! All fit-critical inversions go through [`invert_sym`], which tries a
//! Cholesky factorization first (the matrices here are covariance blocks and
//! constraint-space metrics, so positive definiteness is the common case) and
//! falls back to a general LU inverse for the indefinite matrices that appear
//! in Lagrange systems. Singularity and non-finite entries surface as
//! [`FitError::NumericalFailure`] at the call site instead of propagating as
//! NaNs.

use nalgebra::DMatrix;
use tracing::warn;

use crate::{FitError, FitResult, Float};

/// Invert a symmetric matrix, Cholesky first with an LU fallback.
pub fn invert_sym(m: &DMatrix<Float>, context: &str) -> FitResult<DMatrix<Float>> {
    if !all_finite(m) {
        warn!(context, "non-finite entries in matrix inversion");
        return Err(FitError::NumericalFailure(format!(
            "non-finite entries in {context}"
        )));
    }
    if let Some(chol) = m.clone().cholesky() {
        return Ok(chol.inverse());
    }
    m.clone().try_inverse().ok_or_else(|| {
        warn!(context, "singular matrix in inversion");
        FitError::NumericalFailure(format!("singular matrix in {context}"))
    })
}

/// Invert a symmetric matrix, tolerating rank deficiency.
///
/// Collinear track configurations leave the vertex metric `Eᵀ V_D E` without
/// support along the degenerate direction. A Moore-Penrose pseudo-inverse
/// maps that null space to zero, so the fit leaves the vertex at its seed
/// along the unconstrained axis instead of failing outright.
pub fn invert_sym_deficient(m: &DMatrix<Float>, context: &str) -> FitResult<DMatrix<Float>> {
    if !all_finite(m) {
        warn!(context, "non-finite entries in matrix inversion");
        return Err(FitError::NumericalFailure(format!(
            "non-finite entries in {context}"
        )));
    }
    if let Some(chol) = m.clone().cholesky() {
        return Ok(chol.inverse());
    }
    let eps = Float::EPSILON.sqrt() * m.norm().max(1.0);
    m.clone().pseudo_inverse(eps).map_err(|_| {
        warn!(context, "pseudo-inverse failed in matrix inversion");
        FitError::NumericalFailure(format!("pseudo-inverse failed in {context}"))
    })
}

/// Average a matrix with its transpose. Accumulated rounding in the update
/// formulas slowly breaks the symmetry of covariance matrices; this restores
/// it before the next factorization.
pub fn symmetrize(m: &mut DMatrix<Float>) {
    let n = m.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (m[(i, j)] + m[(j, i)]);
            m[(i, j)] = avg;
            m[(j, i)] = avg;
        }
    }
}

pub fn is_positive_definite(m: &DMatrix<Float>) -> bool {
    all_finite(m) && m.clone().cholesky().is_some()
}

pub fn all_finite(m: &DMatrix<Float>) -> bool {
    m.iter().all(|v| v.is_finite())
}

/// Reject a user-supplied covariance block: it must be finite and symmetric
/// to within floating-point noise. (Positive semi-definiteness is not
/// enforced here; rank-deficient measurement covariances are legitimate.)
pub fn check_covariance(m: &DMatrix<Float>, context: &str) -> FitResult<()> {
    if m.nrows() != m.ncols() {
        return Err(FitError::InvalidParameter(format!(
            "{context}: covariance must be square, got {}x{}",
            m.nrows(),
            m.ncols()
        )));
    }
    if !all_finite(m) {
        return Err(FitError::InvalidParameter(format!(
            "{context}: covariance has non-finite entries"
        )));
    }
    let scale = m.iter().fold(0.0 as Float, |acc, v| acc.max(v.abs()));
    let tol = 1e-9 * scale.max(1.0);
    for i in 0..m.nrows() {
        for j in (i + 1)..m.ncols() {
            if (m[(i, j)] - m[(j, i)]).abs() > tol {
                return Err(FitError::InvalidParameter(format!(
                    "{context}: covariance is not symmetric at ({i},{j})"
                )));
            }
        }
    }
    Ok(())
}
