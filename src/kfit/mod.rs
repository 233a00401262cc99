//! Direct kinematic fitters over a flat list of input tracks.
//!
//! The fitters here ([`VertexFitKFit`], [`MassFitKFit`], [`MassVertexFitKFit`])
//! perform Lagrange-multiplier least-squares fits: the measured track
//! parameters `alpha_0` are pulled onto the constraint surface `d(alpha, v) = 0`
//! by iterating
//!
//! ```text
//! lambda  = V_D (D (alpha_0 - alpha_1) + E (v - v_a) + d)
//! alpha_1 = alpha_0 - V_alpha0 D^T lambda
//! ```
//!
//! where `D` and `E` are the constraint Jacobians with respect to the track
//! parameters and the vertex, and `V_D` is the inverse of the
//! constraint-space metric. Each track contributes a six-parameter block
//! `(px, py, pz, x, y, z)`, or seven parameters `(px, py, pz, E, x, y, z)`
//! when its mass is left free. Iterations keep the best chi-square seen so
//! far and stop as soon as the chi-square rises.
//!
//! All three fitters share [`KFitTrack`] for input and output states and
//! [`KFitConfig`] for iteration and field settings.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::utils::matrix::check_covariance;
use crate::{FitError, FitResult, Float, Vec3, Vec4, LIGHT_SPEED};

mod mass;
mod mass_vertex;
pub(crate) mod vertex;

pub use mass::MassFitKFit;
pub use mass_vertex::MassVertexFitKFit;
pub use vertex::VertexFitKFit;

/// Chi-square sentinel larger than any value a real fit produces; the first
/// iteration always improves on it.
pub(crate) const INITIAL_CHI_SQUARE: Float = 1.0e30;

/// Selects which parameter slot of a [`KFitTrack`] a getter reads.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FitStage {
    /// The measured input state.
    BeforeFit,
    /// The state written by a successful fit.
    AfterFit,
}

/// Iteration and field settings shared by the direct fitters.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct KFitConfig {
    /// Iteration cap for each Newton loop.
    pub max_iterations: usize,
    /// Solenoid field in Tesla, signed.
    pub magnetic_field: Float,
}

impl Default for KFitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            magnetic_field: 1.5,
        }
    }
}

impl KFitConfig {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_magnetic_field(mut self, magnetic_field: Float) -> Self {
        self.magnetic_field = magnetic_field;
        self
    }

    /// Curvature parameter `a = -c B q` for a track of charge `q`.
    pub(crate) fn curvature(&self, charge: Float) -> Float {
        -LIGHT_SPEED * self.magnetic_field * charge
    }
}

/// One momentum/position/covariance state of a track.
#[derive(Clone, Debug)]
pub(crate) struct TrackState {
    pub momentum: Vec4,
    pub position: Vec3,
    /// 7x7 covariance ordered `(px, py, pz, E, x, y, z)`.
    pub error: DMatrix<Float>,
}

/// An input track for the direct fitters: a measured four-momentum, a
/// measured position, their joint 7x7 covariance (ordered
/// `px, py, pz, E, x, y, z`), and the charge. After a successful fit the
/// track additionally carries an after-fit state, selected through
/// [`FitStage`].
#[derive(Clone, Debug)]
pub struct KFitTrack {
    before: TrackState,
    after: Option<TrackState>,
    charge: Float,
}

impl KFitTrack {
    pub fn new(
        momentum: Vec4,
        position: Vec3,
        error: DMatrix<Float>,
        charge: Float,
    ) -> FitResult<Self> {
        check_covariance(&error, "track error")?;
        if error.nrows() != 7 {
            return Err(FitError::InvalidParameter(format!(
                "track error must be 7x7, got {}x{}",
                error.nrows(),
                error.ncols()
            )));
        }
        if momentum.e() <= 0.0 || !momentum.e().is_finite() {
            return Err(FitError::InvalidParameter(format!(
                "track energy must be positive and finite, got {}",
                momentum.e()
            )));
        }
        if momentum.mag2() < 0.0 {
            return Err(FitError::InvalidParameter(format!(
                "spacelike track momentum (m^2 = {})",
                momentum.mag2()
            )));
        }
        Ok(Self {
            before: TrackState {
                momentum,
                position,
                error,
            },
            after: None,
            charge,
        })
    }

    pub fn charge(&self) -> Float {
        self.charge
    }

    /// Invariant mass of the measured four-momentum.
    pub fn mass(&self) -> Float {
        self.before.momentum.mag()
    }

    pub fn momentum(&self, stage: FitStage) -> FitResult<Vec4> {
        Ok(self.state(stage)?.momentum)
    }

    pub fn position(&self, stage: FitStage) -> FitResult<Vec3> {
        Ok(self.state(stage)?.position)
    }

    /// The 7x7 covariance at the given stage.
    pub fn error(&self, stage: FitStage) -> FitResult<&DMatrix<Float>> {
        Ok(&self.state(stage)?.error)
    }

    pub(crate) fn state(&self, stage: FitStage) -> FitResult<&TrackState> {
        match stage {
            FitStage::BeforeFit => Ok(&self.before),
            FitStage::AfterFit => self.after.as_ref().ok_or_else(|| {
                FitError::PreconditionViolation(
                    "after-fit state requested before a successful fit".to_string(),
                )
            }),
        }
    }

    pub(crate) fn set_after(&mut self, state: TrackState) {
        self.after = Some(state);
    }

    pub(crate) fn clear_after(&mut self) {
        self.after = None;
    }

    /// The six fit parameters `(px, py, pz, x, y, z)` of the measured state.
    pub(crate) fn fit_parameter_6(&self) -> [Float; 6] {
        let p = self.before.momentum;
        let x = self.before.position;
        [p.px(), p.py(), p.pz(), x.x(), x.y(), x.z()]
    }

    /// The seven fit parameters `(px, py, pz, E, x, y, z)` of the measured
    /// state, for mass-free tracks.
    pub(crate) fn fit_parameter_7(&self) -> [Float; 7] {
        let p = self.before.momentum;
        let x = self.before.position;
        [p.px(), p.py(), p.pz(), p.e(), x.x(), x.y(), x.z()]
    }

    /// The 6x6 measured covariance with the energy row and column removed,
    /// for mass-fixed tracks.
    pub(crate) fn fit_error_6(&self) -> DMatrix<Float> {
        let e = &self.before.error;
        let mut out = DMatrix::zeros(6, 6);
        for (i, ei) in SIX_OF_SEVEN.iter().enumerate() {
            for (j, ej) in SIX_OF_SEVEN.iter().enumerate() {
                out[(i, j)] = e[(*ei, *ej)];
            }
        }
        out
    }
}

/// Index map from the 6-parameter space into the 7-wide covariance
/// (skipping the energy slot at index 3).
pub(crate) const SIX_OF_SEVEN: [usize; 6] = [0, 1, 2, 4, 5, 6];

/// Expand a fitted 6x6 covariance `(px, py, pz, x, y, z)` to the 7x7
/// `(px, py, pz, E, x, y, z)` form, propagating momentum errors into the
/// energy row through `dE = (p . dp) / E`.
pub(crate) fn make_error_7(momentum: &Vec4, error6: &DMatrix<Float>) -> DMatrix<Float> {
    let g = energy_jacobian(momentum);
    &g * error6 * g.transpose()
}

/// Expand a 3x6 vertex-track covariance block to 3x7, inserting the energy
/// column through the same `dE = (p . dp) / E` relation.
pub(crate) fn make_error_3x7(momentum: &Vec4, block: &DMatrix<Float>) -> DMatrix<Float> {
    block * energy_jacobian(momentum).transpose()
}

/// Expand a 6x6 cross-covariance block between two tracks to 7x7, restoring
/// the energy row of the first track and the energy column of the second.
pub(crate) fn make_correlation(
    momentum_i: &Vec4,
    momentum_j: &Vec4,
    block6: &DMatrix<Float>,
) -> DMatrix<Float> {
    energy_jacobian(momentum_i) * block6 * energy_jacobian(momentum_j).transpose()
}

fn energy_jacobian(momentum: &Vec4) -> DMatrix<Float> {
    let inv_e = 1.0 / momentum.e();
    let mut g = DMatrix::zeros(7, 6);
    for (i, ei) in SIX_OF_SEVEN.iter().enumerate() {
        g[(*ei, i)] = 1.0;
    }
    g[(3, 0)] = momentum.px() * inv_e;
    g[(3, 1)] = momentum.py() * inv_e;
    g[(3, 2)] = momentum.pz() * inv_e;
    g
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pion_track() -> KFitTrack {
        let momentum = Vec3::new(0.1, 0.2, 0.3).with_mass(0.13957);
        let error = DMatrix::identity(7, 7) * 1e-4;
        KFitTrack::new(momentum, Vec3::new(0.0, 0.0, 0.0), error, 1.0).unwrap()
    }

    #[test]
    fn track_stages() {
        let track = pion_track();
        assert!(track.momentum(FitStage::BeforeFit).is_ok());
        assert!(matches!(
            track.momentum(FitStage::AfterFit),
            Err(FitError::PreconditionViolation(_))
        ));
        assert_relative_eq!(track.mass(), 0.13957, epsilon = 1e-10);
    }

    #[test]
    fn rejects_bad_error_matrix() {
        let momentum = Vec3::new(0.1, 0.2, 0.3).with_mass(0.13957);
        let error = DMatrix::identity(6, 6);
        assert!(matches!(
            KFitTrack::new(momentum, Vec3::default(), error, 1.0),
            Err(FitError::InvalidParameter(_))
        ));
    }

    #[test]
    fn rejects_spacelike_momentum() {
        let momentum = Vec4::new(1.0, 0.0, 0.0, 0.5);
        let error = DMatrix::identity(7, 7);
        assert!(matches!(
            KFitTrack::new(momentum, Vec3::default(), error, 1.0),
            Err(FitError::InvalidParameter(_))
        ));
    }

    #[test]
    fn energy_row_expansion() {
        let momentum = Vec3::new(3.0, 0.0, 4.0).with_mass(0.0);
        let error6 = DMatrix::identity(6, 6);
        let error7 = make_error_7(&momentum, &error6);
        // var(E) = (px/E)^2 + (pz/E)^2 with unit momentum errors
        assert_relative_eq!(error7[(3, 3)], (0.6f64).powi(2) + (0.8f64).powi(2));
        assert_relative_eq!(error7[(0, 0)], 1.0);
        assert_relative_eq!(error7[(3, 0)], 0.6);
    }

    #[test]
    fn curvature_sign() {
        let config = KFitConfig::default();
        assert!(config.curvature(1.0) < 0.0);
        assert_relative_eq!(config.curvature(0.0), 0.0);
        assert_relative_eq!(config.curvature(-1.0), LIGHT_SPEED * 1.5);
    }
}
