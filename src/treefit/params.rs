//! The global state of one decay-tree fit.

use nalgebra::{DMatrix, DVector};

use crate::utils::matrix::all_finite;
use crate::{FitError, FitResult, Float};

/// State vector plus covariance for the whole tree. Nodes never own
/// parameters; they hold offsets into this container, which exists for the
/// duration of one fit.
#[derive(Clone, Debug)]
pub(crate) struct FitParams {
    pub par: DVector<Float>,
    pub cov: DMatrix<Float>,
    pub chi_square: Float,
}

impl FitParams {
    pub fn new(dim: usize) -> Self {
        Self {
            par: DVector::zeros(dim),
            cov: DMatrix::zeros(dim, dim),
            chi_square: 0.0,
        }
    }

    pub fn dim(&self) -> usize {
        self.par.len()
    }

    /// Copy three consecutive parameters as a position/momentum triple.
    pub fn triple(&self, index: usize) -> [Float; 3] {
        [self.par[index], self.par[index + 1], self.par[index + 2]]
    }

    pub fn set_triple(&mut self, index: usize, value: [Float; 3]) {
        self.par[index] = value[0];
        self.par[index + 1] = value[1];
        self.par[index + 2] = value[2];
    }

    /// The state must stay finite with a non-negative covariance diagonal
    /// after every filter step.
    pub fn check(&self) -> FitResult<()> {
        if !self.par.iter().all(|v| v.is_finite()) || !all_finite(&self.cov) {
            return Err(FitError::NumericalFailure(
                "non-finite fit state".to_string(),
            ));
        }
        for i in 0..self.dim() {
            if self.cov[(i, i)] < 0.0 {
                return Err(FitError::NumericalFailure(format!(
                    "negative covariance diagonal at parameter {i}"
                )));
            }
        }
        Ok(())
    }
}
