//! Global decay-tree fitting.
//!
//! Where the [`kfit`](crate::kfit) fitters handle one vertex or one mass
//! constraint over a flat track list, the [`TreeFitter`] fits a whole decay
//! chain at once. The chain is described by a [`DecayTree`]: an arena of
//! particle nodes (tracks, photons, composites, and an optional interaction
//! point) connected by indices. Every vertex position, decay length, and
//! momentum in the chain occupies a slice of one global state vector, and
//! each physics relation between them becomes a constraint that is filtered
//! into the state with a Kalman gain. Iterating the filter to a fixed point
//! yields the least-squares solution over the entire tree.

use serde::{Deserialize, Serialize};

use crate::Float;

mod constraint;
mod fitter;
mod kalman;
mod node;
mod params;

pub use fitter::{FitStatus, TreeFitter};
pub use node::{BeamspotDim, DecayTree, NodeId};

/// Settings of the decay-tree fit.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct TreeFitConfig {
    /// Cap on filter sweeps over the constraint list.
    pub max_iterations: usize,
    /// Convergence tolerance on the chi-square change, scaled by the number
    /// of degrees of freedom.
    pub tolerance: Float,
    /// Factor applied to the reference covariance scales when the state
    /// covariance is re-seeded at the start of each sweep.
    pub covariance_inflation: Float,
    /// Solenoid field in Tesla, signed.
    pub magnetic_field: Float,
}

impl Default for TreeFitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            tolerance: 0.01,
            covariance_inflation: 1000.0,
            magnetic_field: 1.5,
        }
    }
}

impl TreeFitConfig {
    /// Curvature parameter of a charged track in the configured field.
    pub(crate) fn curvature(&self, charge: Float) -> Float {
        -crate::LIGHT_SPEED * self.magnetic_field * charge
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_tolerance(mut self, tolerance: Float) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_covariance_inflation(mut self, covariance_inflation: Float) -> Self {
        self.covariance_inflation = covariance_inflation;
        self
    }

    pub fn with_magnetic_field(mut self, magnetic_field: Float) -> Self {
        self.magnetic_field = magnetic_field;
        self
    }
}
