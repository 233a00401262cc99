//! # kinfit
//!
//! Kinematic and vertex fitting for decay-tree reconstruction.
//!
//! This crate provides two families of constrained least-squares fitters for
//! reconstructed particle decays:
//!
//! * The [`kfit`] module contains direct fitters over a flat list of input
//!   tracks ([`VertexFitKFit`], [`MassFitKFit`], [`MassVertexFitKFit`]). Each
//!   performs a Lagrange-multiplier fit with a small, fixed constraint count
//!   and a handful of Newton iterations.
//! * The [`treefit`] module contains a global fitter ([`TreeFitter`]) which
//!   fits an entire decay chain at once. The decay is described by a
//!   [`DecayTree`] node arena; every vertex, momentum, and decay length in the
//!   chain becomes part of one state vector which is updated by sequential
//!   Kalman filtering of the tree's constraints.
//!
//! Inputs are reconstructed four-momenta, positions, and covariance matrices;
//! outputs are fitted states, fitted covariances, a chi-square, and a number
//! of degrees of freedom. Every fallible operation returns a [`FitResult`],
//! and callers must check the result of a fit before reading any fitted
//! quantity: getters that only make sense after a successful fit return
//! [`FitError::PreconditionViolation`] until the fit has succeeded.
//!
//! A fitter instance performs exactly one fit and holds no state across
//! events. No instance is safe for concurrent mutation; give each worker its
//! own fitter.
#![warn(clippy::perf, clippy::style)]

use thiserror::Error;

/// The direct (flat track list) KFit fitter family.
pub mod kfit;
/// The global decay-tree fitter.
pub mod treefit;
/// Vector and matrix utilities.
pub mod utils;

pub use crate::kfit::{
    FitStage, KFitConfig, KFitTrack, MassFitKFit, MassVertexFitKFit, VertexFitKFit,
};
pub use crate::treefit::{
    BeamspotDim, DecayTree, FitStatus, NodeId, TreeFitConfig, TreeFitter,
};
pub use crate::utils::vectors::{Vec3, Vec4};

/// The floating-point type used throughout the crate.
pub type Float = f64;

/// Conversion factor between momentum, magnetic field, and track curvature
/// (GeV/c per Tesla per cm). A charged track with charge `q` in a field `B`
/// bends with curvature parameter `a = -LIGHT_SPEED * B * q`.
pub const LIGHT_SPEED: Float = 0.00299792458;

pub type FitResult<T> = Result<T, FitError>;

/// The error type returned by all fallible `kinfit` methods.
///
/// Success is represented by `Ok(())`; every failure kind a fit can surface
/// is a variant here. Low-level numerical problems (singular matrices,
/// NaN/Inf appearing in a state or covariance) are detected at the point of
/// computation and converted into [`FitError::NumericalFailure`] immediately
/// rather than being allowed to propagate as silent NaNs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    /// A supplied value is invalid on its own (e.g. a non-positive invariant
    /// mass, or a malformed covariance matrix). Rejected setters leave all
    /// previously-set fit state untouched.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// A method was called out of the expected order, or a fit was invoked
    /// without its minimum required inputs.
    #[error("precondition violation: {0}")]
    PreconditionViolation(String),
    /// A singular or near-singular matrix inversion, or a NaN/Inf appearing
    /// in the state or covariance.
    #[error("numerical failure: {0}")]
    NumericalFailure(String),
    /// The iteration cap was exhausted without satisfying the convergence
    /// tolerance.
    #[error("fit did not converge within {max_iterations} iterations")]
    NonConvergence {
        /// The iteration cap that was exhausted.
        max_iterations: usize,
    },
    /// A beamspot constraint was configured with a dimension other than
    /// 0, 2, or 3.
    #[error("inconsistent beamspot constraint dimension {dimension} (expected 0, 2, or 3)")]
    InconsistentConstraintDimension {
        /// The rejected dimension.
        dimension: usize,
    },
}

impl FitError {
    /// Severity rank used for worst-of reduction when errors from several
    /// tree branches are accumulated into one composite result.
    pub(crate) fn severity(&self) -> u8 {
        match self {
            FitError::InvalidParameter(_) => 1,
            FitError::PreconditionViolation(_) => 2,
            FitError::NonConvergence { .. } => 3,
            FitError::NumericalFailure(_) => 4,
            FitError::InconsistentConstraintDimension { .. } => 5,
        }
    }
}

/// Worst-of accumulator for per-node failures during a tree walk.
///
/// Initialization of a decay tree is best-effort across siblings: a failure
/// in one branch must not stop the walk, but it must be visible at the root.
/// Each branch pushes its outcome here and the single worst error (by
/// [`FitError::severity`]) is reported at the end.
#[derive(Debug, Default)]
pub(crate) struct ErrorAccumulator {
    worst: Option<FitError>,
}

impl ErrorAccumulator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, error: FitError) {
        match &self.worst {
            Some(current) if current.severity() >= error.severity() => {}
            _ => self.worst = Some(error),
        }
    }

    pub(crate) fn record<T>(&mut self, result: FitResult<T>) {
        if let Err(error) = result {
            self.push(error);
        }
    }

    pub(crate) fn into_result(self) -> FitResult<()> {
        match self.worst {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }
}
