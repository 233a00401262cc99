//! Simultaneous vertex and invariant-mass fit.

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::utils::matrix::{invert_sym, invert_sym_deficient};
use crate::{FitError, FitResult, Float, Vec3, Vec4};

use super::vertex::make_core_matrix;
use super::{
    make_error_3x7, make_error_7, FitStage, KFitConfig, KFitTrack, TrackState,
    INITIAL_CHI_SQUARE,
};

struct MassVertexOutputs {
    vertex: Vec3,
    vertex_error: DMatrix<Float>,
    chi_square: Float,
    ndf: usize,
    invariant_mass_after: Float,
    track_vertex_errors: Vec<DMatrix<Float>>,
}

/// A combined fit: the tracks are pulled onto helices through a common
/// vertex while their summed four-momentum, transported through the field to
/// that vertex, is constrained to the requested invariant mass.
///
/// The constraint system stacks the two vertex rows of every track with one
/// mass row; the vertex enters all rows, so vertex and mass information feed
/// back into each other within a single Lagrange iteration.
pub struct MassVertexFitKFit {
    config: KFitConfig,
    tracks: Vec<KFitTrack>,
    fix_mass: Vec<bool>,
    invariant_mass: Option<Float>,
    before_vertex: Vec3,
    outputs: Option<MassVertexOutputs>,
}

impl Default for MassVertexFitKFit {
    fn default() -> Self {
        Self::new(KFitConfig::default())
    }
}

impl MassVertexFitKFit {
    pub fn new(config: KFitConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            fix_mass: Vec::new(),
            invariant_mass: None,
            before_vertex: Vec3::default(),
            outputs: None,
        }
    }

    pub fn add_track(&mut self, track: KFitTrack) {
        self.tracks.push(track);
        self.fix_mass.push(true);
        self.outputs = None;
    }

    /// Release the energy of the most recently added track as a free
    /// parameter.
    pub fn unfix_mass(&mut self) -> FitResult<()> {
        match self.fix_mass.last_mut() {
            Some(flag) => {
                *flag = false;
                self.outputs = None;
                Ok(())
            }
            None => Err(FitError::PreconditionViolation(
                "unfix_mass called before any track was added".to_string(),
            )),
        }
    }

    /// Set the target invariant mass. Rejects non-positive or non-finite
    /// values without touching any other fit state.
    pub fn set_invariant_mass(&mut self, mass: Float) -> FitResult<()> {
        if !(mass > 0.0 && mass.is_finite()) {
            return Err(FitError::InvalidParameter(format!(
                "invariant mass must be positive and finite, got {mass}"
            )));
        }
        self.invariant_mass = Some(mass);
        self.outputs = None;
        Ok(())
    }

    pub fn set_initial_vertex(&mut self, vertex: Vec3) {
        self.before_vertex = vertex;
        self.outputs = None;
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn track(&self, index: usize) -> FitResult<&KFitTrack> {
        self.tracks.get(index).ok_or_else(|| {
            FitError::InvalidParameter(format!("track index {index} out of range"))
        })
    }

    pub fn vertex(&self, stage: FitStage) -> FitResult<Vec3> {
        match stage {
            FitStage::BeforeFit => Ok(self.before_vertex),
            FitStage::AfterFit => Ok(self.fitted()?.vertex),
        }
    }

    pub fn vertex_error(&self) -> FitResult<&DMatrix<Float>> {
        Ok(&self.fitted()?.vertex_error)
    }

    pub fn chi_square(&self) -> FitResult<Float> {
        Ok(self.fitted()?.chi_square)
    }

    pub fn ndf(&self) -> FitResult<usize> {
        Ok(self.fitted()?.ndf)
    }

    pub fn invariant_mass(&self, stage: FitStage) -> FitResult<Float> {
        match stage {
            FitStage::BeforeFit => {
                let sum = self
                    .tracks
                    .iter()
                    .map(|t| t.state(FitStage::BeforeFit).map(|s| s.momentum))
                    .try_fold(Vec4::default(), |acc, p| p.map(|p| acc + p))?;
                Ok(sum.mag())
            }
            FitStage::AfterFit => Ok(self.fitted()?.invariant_mass_after),
        }
    }

    pub fn track_vertex_error(&self, index: usize) -> FitResult<&DMatrix<Float>> {
        self.fitted()?
            .track_vertex_errors
            .get(index)
            .ok_or_else(|| {
                FitError::InvalidParameter(format!("track index {index} out of range"))
            })
    }

    fn fitted(&self) -> FitResult<&MassVertexOutputs> {
        self.outputs.as_ref().ok_or_else(|| {
            FitError::PreconditionViolation(
                "fit result requested before a successful fit".to_string(),
            )
        })
    }

    fn widths(&self) -> Vec<usize> {
        self.fix_mass.iter().map(|f| if *f { 6 } else { 7 }).collect()
    }

    /// Transported momentum sums at the vertex `v_a`.
    fn momentum_sums(
        &self,
        al_1: &DVector<Float>,
        v_a: &DVector<Float>,
        widths: &[usize],
        curvatures: &[Float],
    ) -> (Float, Float, Float, Float) {
        let (mut se, mut spx, mut spy, mut spz) = (0.0, 0.0, 0.0, 0.0);
        let mut offset = 0;
        for (k, w) in widths.iter().enumerate() {
            let px = al_1[offset];
            let py = al_1[offset + 1];
            let pz = al_1[offset + 2];
            let x = al_1[offset + w - 3];
            let y = al_1[offset + w - 2];
            let a = curvatures[k];
            spx += px - a * (v_a[1] - y);
            spy += py + a * (v_a[0] - x);
            spz += pz;
            se += if *w == 6 {
                let mass = self.tracks[k].mass();
                (px * px + py * py + pz * pz + mass * mass).sqrt()
            } else {
                al_1[offset + 3]
            };
            offset += w;
        }
        (se, spx, spy, spz)
    }

    /// The stacked constraint system: two vertex rows per track followed by
    /// one mass row, with Jacobians against the track parameters and the
    /// vertex.
    fn core(
        &self,
        al_1: &DVector<Float>,
        v_a: &DVector<Float>,
        widths: &[usize],
        curvatures: &[Float],
        target: Float,
    ) -> FitResult<(DVector<Float>, DMatrix<Float>, DMatrix<Float>)> {
        let n = widths.len();
        let dim: usize = widths.iter().sum();
        let rows = 2 * n + 1;

        let vertex_core = make_core_matrix(al_1, v_a, curvatures, widths)?;
        let mut d = DVector::zeros(rows);
        let mut dmat = DMatrix::zeros(rows, dim);
        let mut emat = DMatrix::zeros(rows, 3);
        d.rows_mut(0, 2 * n).copy_from(&vertex_core.d);
        dmat.view_mut((0, 0), (2 * n, dim)).copy_from(&vertex_core.dmat);
        emat.view_mut((0, 0), (2 * n, 3)).copy_from(&vertex_core.emat);

        let (se, spx, spy, spz) = self.momentum_sums(al_1, v_a, widths, curvatures);
        d[2 * n] = se * se - spx * spx - spy * spy - spz * spz - target * target;

        let mut offset = 0;
        let mut total_curvature = 0.0;
        for (k, w) in widths.iter().enumerate() {
            let px = al_1[offset];
            let py = al_1[offset + 1];
            let pz = al_1[offset + 2];
            let a = curvatures[k];
            total_curvature += a;
            if *w == 6 {
                let mass = self.tracks[k].mass();
                let energy = (px * px + py * py + pz * pz + mass * mass).sqrt();
                dmat[(2 * n, offset)] = 2.0 * (se * px / energy - spx);
                dmat[(2 * n, offset + 1)] = 2.0 * (se * py / energy - spy);
                dmat[(2 * n, offset + 2)] = 2.0 * (se * pz / energy - spz);
            } else {
                dmat[(2 * n, offset)] = -2.0 * spx;
                dmat[(2 * n, offset + 1)] = -2.0 * spy;
                dmat[(2 * n, offset + 2)] = -2.0 * spz;
                dmat[(2 * n, offset + 3)] = 2.0 * se;
            }
            dmat[(2 * n, offset + w - 3)] = 2.0 * a * spy;
            dmat[(2 * n, offset + w - 2)] = -2.0 * a * spx;
            offset += w;
        }
        emat[(2 * n, 0)] = -2.0 * total_curvature * spy;
        emat[(2 * n, 1)] = 2.0 * total_curvature * spx;

        Ok((d, dmat, emat))
    }

    pub fn do_fit(&mut self) -> FitResult<()> {
        self.outputs = None;
        for track in &mut self.tracks {
            track.clear_after();
        }
        let target = match self.invariant_mass {
            Some(m) => m,
            None => {
                return Err(FitError::PreconditionViolation(
                    "no invariant mass set".to_string(),
                ))
            }
        };
        let n = self.tracks.len();
        if n < 2 {
            return Err(FitError::PreconditionViolation(format!(
                "mass-vertex fit needs at least 2 tracks, got {n}"
            )));
        }

        let widths = self.widths();
        let dim: usize = widths.iter().sum();
        let mut al_0 = DVector::zeros(dim);
        let mut v_al_0 = DMatrix::zeros(dim, dim);
        let mut curvatures = Vec::with_capacity(n);
        let mut offset = 0;
        for (k, track) in self.tracks.iter().enumerate() {
            if widths[k] == 6 {
                let par = track.fit_parameter_6();
                for (j, value) in par.iter().enumerate() {
                    al_0[offset + j] = *value;
                }
                v_al_0
                    .view_mut((offset, offset), (6, 6))
                    .copy_from(&track.fit_error_6());
            } else {
                let par = track.fit_parameter_7();
                for (j, value) in par.iter().enumerate() {
                    al_0[offset + j] = *value;
                }
                v_al_0
                    .view_mut((offset, offset), (7, 7))
                    .copy_from(track.error(FitStage::BeforeFit)?);
            }
            curvatures.push(self.config.curvature(track.charge()));
            offset += widths[k];
        }

        let mut al_1 = al_0.clone();
        let mut v_a = DVector::from_column_slice(&[
            self.before_vertex.x(),
            self.before_vertex.y(),
            self.before_vertex.z(),
        ]);

        let mut best_chi_square = INITIAL_CHI_SQUARE;
        let mut snapshot = None;
        let mut converged = false;

        for iteration in 0..self.config.max_iterations {
            let (d, dmat, emat) = self.core(&al_1, &v_a, &widths, &curvatures, target)?;
            let v_d = invert_sym(
                &(&dmat * &v_al_0 * dmat.transpose()),
                "mass-vertex constraint metric",
            )?;
            // Collinear daughters leave the vertex metric rank-deficient;
            // the deficiency-tolerant inverse keeps the vertex at its seed
            // along the unconstrained direction.
            let v_e = invert_sym_deficient(
                &(emat.transpose() * &v_d * &emat),
                "mass-vertex vertex covariance",
            )?;
            let residual = &dmat * (&al_0 - &al_1) + &d;
            let lam0 = &v_d * &residual;
            let chi_square = lam0.dot(&residual);

            v_a = &v_a - &v_e * emat.transpose() * &lam0;
            let lam = &lam0 - &v_d * &emat * &v_e * emat.transpose() * &lam0;
            al_1 = &al_0 - &v_al_0 * dmat.transpose() * &lam;

            debug!(iteration, chi_square, "mass-vertex fit step");

            if best_chi_square <= chi_square {
                if snapshot.is_none() {
                    return Err(FitError::NumericalFailure(
                        "chi-square diverged on first mass-vertex iteration".to_string(),
                    ));
                }
                converged = true;
                break;
            }
            best_chi_square = chi_square;
            snapshot = Some((lam0, v_d, v_e, emat, dmat, v_a.clone()));
        }
        if !converged {
            return Err(FitError::NonConvergence {
                max_iterations: self.config.max_iterations,
            });
        }
        let (lam0, v_d, v_e, emat, dmat, v_best) = match snapshot {
            Some(s) => s,
            None => {
                return Err(FitError::NumericalFailure(
                    "mass-vertex fit produced no accepted iteration".to_string(),
                ))
            }
        };
        v_a = v_best;

        let lam = &lam0 - &v_d * &emat * &v_e * emat.transpose() * &lam0;
        let al_1 = &al_0 - &v_al_0 * dmat.transpose() * &lam;
        let v_dt = &v_d - &v_d * &emat * &v_e * emat.transpose() * &v_d;
        let v_al_1 = &v_al_0 - &v_al_0 * dmat.transpose() * &v_dt * &dmat * &v_al_0;
        let cov_v_al_1 = -(&v_e) * emat.transpose() * &v_d * &dmat * &v_al_0;

        // Write the after-fit track states and the summed four-momentum
        // transported to the fitted vertex.
        let (se, spx, spy, spz) = self.momentum_sums(&al_1, &v_a, &widths, &curvatures);
        let invariant_mass_after = (se * se - spx * spx - spy * spy - spz * spz).sqrt();

        let mut track_vertex_errors = Vec::with_capacity(n);
        let mut offset = 0;
        for (k, track) in self.tracks.iter_mut().enumerate() {
            let w = widths[k];
            let p3 = Vec3::new(al_1[offset], al_1[offset + 1], al_1[offset + 2]);
            let momentum = if w == 6 {
                p3.with_mass(track.mass())
            } else {
                p3.with_energy(al_1[offset + 3])
            };
            let position = Vec3::new(
                al_1[offset + w - 3],
                al_1[offset + w - 2],
                al_1[offset + w - 1],
            );
            let error = if w == 6 {
                let block6 = v_al_1.view((offset, offset), (6, 6)).into_owned();
                make_error_7(&momentum, &block6)
            } else {
                v_al_1.view((offset, offset), (7, 7)).into_owned()
            };
            let vertex_block = cov_v_al_1.view((0, offset), (3, w)).into_owned();
            track_vertex_errors.push(if w == 6 {
                make_error_3x7(&momentum, &vertex_block)
            } else {
                vertex_block
            });
            track.set_after(TrackState {
                momentum,
                position,
                error,
            });
            offset += w;
        }

        self.outputs = Some(MassVertexOutputs {
            vertex: Vec3::new(v_a[0], v_a[1], v_a[2]),
            vertex_error: v_e,
            chi_square: best_chi_square,
            ndf: 2 * n - 2,
            invariant_mass_after,
            track_vertex_errors,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use nalgebra::DMatrix;

    fn diag7(p: Float, x: Float) -> DMatrix<Float> {
        let mut m = DMatrix::zeros(7, 7);
        for i in 0..4 {
            m[(i, i)] = p;
        }
        for i in 4..7 {
            m[(i, i)] = x;
        }
        m
    }

    /// Two neutral tracks crossing at the origin with total mass 2.
    fn crossing_tracks() -> (KFitTrack, KFitTrack) {
        let error = diag7(1e-4, 1e-4);
        let t1 = KFitTrack::new(
            Vec4::new(1.0, 0.0, 0.0, (2.0f64).sqrt()),
            Vec3::new(0.5, 0.0, 0.0),
            error.clone(),
            0.0,
        )
        .unwrap();
        let t2 = KFitTrack::new(
            Vec4::new(0.0, 1.0, 0.0, (2.0f64).sqrt()),
            Vec3::new(0.0, 0.5, 0.0),
            error,
            0.0,
        )
        .unwrap();
        (t1, t2)
    }

    fn measured_mass() -> Float {
        let p = Vec4::new(1.0, 1.0, 0.0, 2.0 * (2.0f64).sqrt());
        p.mag()
    }

    #[test]
    fn exact_input_gives_zero_chi_square() {
        let (t1, t2) = crossing_tracks();
        let mut fitter = MassVertexFitKFit::default();
        fitter.add_track(t1);
        fitter.add_track(t2);
        fitter.set_invariant_mass(measured_mass()).unwrap();
        fitter.set_initial_vertex(Vec3::new(0.05, -0.05, 0.02));
        fitter.do_fit().unwrap();
        assert_abs_diff_eq!(fitter.chi_square().unwrap(), 0.0, epsilon = 1e-6);
        let vertex = fitter.vertex(FitStage::AfterFit).unwrap();
        assert_abs_diff_eq!(vertex.mag(), 0.0, epsilon = 1e-5);
        assert_relative_eq!(
            fitter.invariant_mass(FitStage::AfterFit).unwrap(),
            measured_mass(),
            epsilon = 1e-6
        );
        assert_eq!(fitter.ndf().unwrap(), 2);
    }

    #[test]
    fn ndf_three_tracks() {
        let error = diag7(1e-4, 1e-4);
        let dirs = [
            Vec3::new(1.0, 0.2, 0.1),
            Vec3::new(-1.0, 0.3, -0.2),
            Vec3::new(0.1, -1.0, 0.3),
        ];
        let mut fitter = MassVertexFitKFit::default();
        let mut sum = Vec4::default();
        for dir in dirs {
            let momentum = dir.with_mass(0.13957);
            sum = sum + momentum;
            fitter.add_track(
                KFitTrack::new(momentum, 0.7 * dir.unit(), error.clone(), 0.0).unwrap(),
            );
        }
        fitter.set_invariant_mass(sum.mag()).unwrap();
        fitter.set_initial_vertex(Vec3::new(0.02, 0.01, -0.01));
        fitter.do_fit().unwrap();
        assert_eq!(fitter.ndf().unwrap(), 4);
        assert_abs_diff_eq!(fitter.chi_square().unwrap(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn ndf_four_tracks() {
        let error = diag7(1e-4, 1e-4);
        let dirs = [
            Vec3::new(1.0, 0.2, 0.1),
            Vec3::new(-1.0, 0.3, -0.2),
            Vec3::new(0.1, -1.0, 0.3),
            Vec3::new(-0.2, 0.9, -1.0),
        ];
        let mut fitter = MassVertexFitKFit::default();
        let mut sum = Vec4::default();
        for dir in dirs {
            let momentum = dir.with_mass(0.13957);
            sum = sum + momentum;
            fitter.add_track(
                KFitTrack::new(momentum, 0.7 * dir.unit(), error.clone(), 0.0).unwrap(),
            );
        }
        fitter.set_invariant_mass(sum.mag()).unwrap();
        fitter.do_fit().unwrap();
        assert_eq!(fitter.ndf().unwrap(), 6);
        assert_abs_diff_eq!(fitter.chi_square().unwrap(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn back_to_back_tracks_fit() {
        // Both momenta lie along x, so the vertex metric has no support in
        // that direction. The fit must still succeed, leaving x at the seed.
        let error = diag7(1e-4, 1e-4);
        let t1 = KFitTrack::new(
            Vec4::new(1.0, 0.0, 0.0, 1.0),
            Vec3::new(0.5, 0.0, 0.0),
            error.clone(),
            0.0,
        )
        .unwrap();
        let t2 = KFitTrack::new(
            Vec4::new(-1.0, 0.0, 0.0, 1.0),
            Vec3::new(-0.5, 0.0, 0.0),
            error,
            0.0,
        )
        .unwrap();
        let mut fitter = MassVertexFitKFit::default();
        fitter.add_track(t1);
        fitter.add_track(t2);
        fitter.set_invariant_mass(2.0).unwrap();
        fitter.do_fit().unwrap();
        assert_abs_diff_eq!(fitter.chi_square().unwrap(), 0.0, epsilon = 1e-6);
        let vertex = fitter.vertex(FitStage::AfterFit).unwrap();
        assert_abs_diff_eq!(vertex.y(), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(vertex.z(), 0.0, epsilon = 1e-6);
        assert_relative_eq!(
            fitter.invariant_mass(FitStage::AfterFit).unwrap(),
            2.0,
            epsilon = 1e-6
        );
        assert_eq!(fitter.ndf().unwrap(), 2);
    }

    #[test]
    fn rejects_nonpositive_mass() {
        let mut fitter = MassVertexFitKFit::default();
        assert!(matches!(
            fitter.set_invariant_mass(0.0),
            Err(FitError::InvalidParameter(_))
        ));
        assert!(fitter.invariant_mass.is_none());
    }

    #[test]
    fn needs_two_tracks() {
        let (t1, _) = crossing_tracks();
        let mut fitter = MassVertexFitKFit::default();
        fitter.add_track(t1);
        fitter.set_invariant_mass(1.0).unwrap();
        assert!(matches!(
            fitter.do_fit(),
            Err(FitError::PreconditionViolation(_))
        ));
    }

    #[test]
    fn getters_before_fit_fail() {
        let fitter = MassVertexFitKFit::default();
        assert!(fitter.vertex(FitStage::AfterFit).is_err());
        assert!(fitter.chi_square().is_err());
        assert!(fitter.invariant_mass(FitStage::AfterFit).is_err());
    }
}
