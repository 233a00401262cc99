//! The Kalman update shared by every constraint.

use tracing::debug;

use crate::treefit::constraint::Projection;
use crate::treefit::params::FitParams;
use crate::utils::matrix::{invert_sym, symmetrize};
use crate::{FitResult, Float};

/// Fold one projected constraint into the running state.
///
/// The gain is `K = C H^T R^{-1}` with `R = V + H C H^T`; the residual's
/// chi-square contribution `r^T R^{-1} r` is returned and accumulated on the
/// parameters.
pub(crate) fn filter(params: &mut FitParams, projection: &Projection) -> FitResult<Float> {
    let Projection { r, h, v } = projection;

    let chc = h * &params.cov * h.transpose();
    let mut res_cov = v + chc;
    symmetrize(&mut res_cov);
    let res_cov_inv = invert_sym(&res_cov, "residual covariance")?;

    let chi_square = (r.transpose() * &res_cov_inv * r)[(0, 0)];
    let gain = &params.cov * h.transpose() * &res_cov_inv;

    params.par -= &gain * r;
    let shrink = &gain * (h * &params.cov);
    params.cov -= shrink;
    symmetrize(&mut params.cov);
    params.chi_square += chi_square;
    params.check()?;

    debug!(
        rows = r.len(),
        chi_square, "applied constraint in Kalman filter"
    );
    Ok(chi_square)
}
