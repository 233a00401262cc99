//! Invariant-mass fit over a flat track list.

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::utils::matrix::invert_sym;
use crate::{FitError, FitResult, Float, Vec3, Vec4};

use super::{
    make_error_7, FitStage, KFitConfig, KFitTrack, TrackState, INITIAL_CHI_SQUARE,
};

struct MassOutputs {
    chi_square: Float,
    ndf: usize,
    invariant_mass_after: Float,
    v_al_1: DMatrix<Float>,
}

/// Sums entering the mass constraint, evaluated at the running state.
struct ConstraintSums {
    e: Float,
    px: Float,
    py: Float,
    pz: Float,
}

/// A mass-constrained fit: pulls the track momenta so that their summed
/// four-momentum has exactly the requested invariant mass.
///
/// By default each track keeps its measured mass hypothesis and contributes
/// six parameters; [`unfix_mass`](Self::unfix_mass) releases the energy of
/// the most recently added track as a seventh free parameter. When a decay
/// point is supplied with [`set_vertex`](Self::set_vertex), charged-track
/// momenta are transported through the field to that point before the sum is
/// formed.
pub struct MassFitKFit {
    config: KFitConfig,
    tracks: Vec<KFitTrack>,
    fix_mass: Vec<bool>,
    invariant_mass: Option<Float>,
    vertex: Option<Vec3>,
    outputs: Option<MassOutputs>,
}

impl Default for MassFitKFit {
    fn default() -> Self {
        Self::new(KFitConfig::default())
    }
}

impl MassFitKFit {
    pub fn new(config: KFitConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            fix_mass: Vec::new(),
            invariant_mass: None,
            vertex: None,
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

    /// Re-fix the mass of the most recently added track.
    pub fn fix_mass(&mut self) -> FitResult<()> {
        match self.fix_mass.last_mut() {
            Some(flag) => {
                *flag = true;
                self.outputs = None;
                Ok(())
            }
            None => Err(FitError::PreconditionViolation(
                "fix_mass called before any track was added".to_string(),
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

    /// Evaluate the constraint at the assumed decay point: charged-track
    /// momenta are rotated through the field from their measured positions to
    /// this vertex.
    pub fn set_vertex(&mut self, vertex: Vec3) {
        self.vertex = Some(vertex);
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

    pub fn chi_square(&self) -> FitResult<Float> {
        Ok(self.fitted()?.chi_square)
    }

    pub fn ndf(&self) -> FitResult<usize> {
        Ok(self.fitted()?.ndf)
    }

    /// Invariant mass of the summed four-momentum, measured or fitted.
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

    fn fitted(&self) -> FitResult<&MassOutputs> {
        self.outputs.as_ref().ok_or_else(|| {
            FitError::PreconditionViolation(
                "fit result requested before a successful fit".to_string(),
            )
        })
    }

    fn widths(&self) -> Vec<usize> {
        self.fix_mass.iter().map(|f| if *f { 6 } else { 7 }).collect()
    }

    /// Sums and the constraint Jacobian row at the running state `al_1`.
    fn core_row(
        &self,
        al_1: &DVector<Float>,
        widths: &[usize],
        curvatures: &[Float],
    ) -> FitResult<(Float, DMatrix<Float>)> {
        let target = match self.invariant_mass {
            Some(m) => m,
            None => {
                return Err(FitError::PreconditionViolation(
                    "no invariant mass set".to_string(),
                ))
            }
        };
        let dim: usize = widths.iter().sum();
        let n = widths.len();

        let mut sums = ConstraintSums {
            e: 0.0,
            px: 0.0,
            py: 0.0,
            pz: 0.0,
        };
        let mut offset = 0;
        for k in 0..n {
            let w = widths[k];
            let px = al_1[offset];
            let py = al_1[offset + 1];
            let pz = al_1[offset + 2];
            let (mut tpx, mut tpy) = (px, py);
            if let Some(v) = self.vertex {
                let a = curvatures[k];
                let x = al_1[offset + w - 3];
                let y = al_1[offset + w - 2];
                tpx = px - a * (v.y() - y);
                tpy = py + a * (v.x() - x);
            }
            let energy = if w == 6 {
                let mass = self.tracks[k].mass();
                (px * px + py * py + pz * pz + mass * mass).sqrt()
            } else {
                al_1[offset + 3]
            };
            sums.e += energy;
            sums.px += tpx;
            sums.py += tpy;
            sums.pz += pz;
            offset += w;
        }

        let d = sums.e * sums.e
            - sums.px * sums.px
            - sums.py * sums.py
            - sums.pz * sums.pz
            - target * target;

        let mut dmat = DMatrix::zeros(1, dim);
        offset = 0;
        for k in 0..n {
            let w = widths[k];
            let px = al_1[offset];
            let py = al_1[offset + 1];
            let pz = al_1[offset + 2];
            let a = if self.vertex.is_some() {
                curvatures[k]
            } else {
                0.0
            };
            if w == 6 {
                let mass = self.tracks[k].mass();
                let energy = (px * px + py * py + pz * pz + mass * mass).sqrt();
                dmat[(0, offset)] = 2.0 * (sums.e * px / energy - sums.px);
                dmat[(0, offset + 1)] = 2.0 * (sums.e * py / energy - sums.py);
                dmat[(0, offset + 2)] = 2.0 * (sums.e * pz / energy - sums.pz);
            } else {
                dmat[(0, offset)] = -2.0 * sums.px;
                dmat[(0, offset + 1)] = -2.0 * sums.py;
                dmat[(0, offset + 2)] = -2.0 * sums.pz;
                dmat[(0, offset + 3)] = 2.0 * sums.e;
            }
            dmat[(0, offset + w - 3)] = 2.0 * a * sums.py;
            dmat[(0, offset + w - 2)] = -2.0 * a * sums.px;
            offset += w;
        }
        Ok((d, dmat))
    }

    pub fn do_fit(&mut self) -> FitResult<()> {
        self.outputs = None;
        for track in &mut self.tracks {
            track.clear_after();
        }
        if self.invariant_mass.is_none() {
            return Err(FitError::PreconditionViolation(
                "no invariant mass set".to_string(),
            ));
        }
        let n = self.tracks.len();
        if n < 1 {
            return Err(FitError::PreconditionViolation(
                "mass fit needs at least 1 track".to_string(),
            ));
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
        let mut v_al_1 = v_al_0.clone();
        let mut best_chi_square = INITIAL_CHI_SQUARE;
        let mut snapshot = None;
        let mut converged = false;

        for iteration in 0..self.config.max_iterations {
            let (d, dmat) = self.core_row(&al_1, &widths, &curvatures)?;
            let metric = &dmat * &v_al_0 * dmat.transpose();
            let v_d = invert_sym(&metric, "mass constraint metric")?;
            let delta = &al_0 - &al_1;
            let residual = &dmat * delta + DVector::from_element(1, d);
            let lam = &v_d * &residual;
            let chi_square = lam.dot(&residual);

            al_1 = &al_0 - &v_al_0 * dmat.transpose() * &lam;
            v_al_1 = &v_al_0 - &v_al_0 * dmat.transpose() * &v_d * &dmat * &v_al_0;

            debug!(iteration, chi_square, "mass fit step");

            if best_chi_square <= chi_square {
                if let Some((s_al_1, s_v_al_1)) = snapshot.take() {
                    al_1 = s_al_1;
                    v_al_1 = s_v_al_1;
                } else {
                    return Err(FitError::NumericalFailure(
                        "chi-square diverged on first mass iteration".to_string(),
                    ));
                }
                converged = true;
                break;
            }
            best_chi_square = chi_square;
            snapshot = Some((al_1.clone(), v_al_1.clone()));
        }
        if !converged {
            return Err(FitError::NonConvergence {
                max_iterations: self.config.max_iterations,
            });
        }

        // Write the after-fit track states.
        let mut sum = Vec4::default();
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
            sum = sum + momentum;
            track.set_after(TrackState {
                momentum,
                position,
                error,
            });
            offset += w;
        }

        self.outputs = Some(MassOutputs {
            chi_square: best_chi_square,
            ndf: 1,
            invariant_mass_after: sum.mag(),
            v_al_1,
        });
        Ok(())
    }

    /// The fitted covariance block between tracks `i` and `j` in the stacked
    /// parameter space (6- or 7-wide per track depending on mass fixing).
    pub fn correlation(&self, i: usize, j: usize) -> FitResult<DMatrix<Float>> {
        let outputs = self.fitted()?;
        let widths = self.widths();
        if i >= widths.len() || j >= widths.len() {
            return Err(FitError::InvalidParameter(format!(
                "track indices ({i}, {j}) out of range"
            )));
        }
        let offset_of = |idx: usize| widths[..idx].iter().sum::<usize>();
        Ok(outputs
            .v_al_1
            .view((offset_of(i), offset_of(j)), (widths[i], widths[j]))
            .into_owned())
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

    fn back_to_back() -> (KFitTrack, KFitTrack) {
        let error = diag7(1e-4, 1e-4);
        let t1 = KFitTrack::new(
            Vec4::new(1.0, 0.0, 0.0, 1.0),
            Vec3::default(),
            error.clone(),
            0.0,
        )
        .unwrap();
        let t2 = KFitTrack::new(
            Vec4::new(-1.0, 0.0, 0.0, 1.0),
            Vec3::default(),
            error,
            0.0,
        )
        .unwrap();
        (t1, t2)
    }

    #[test]
    fn rejects_nonpositive_mass_without_side_effects() {
        let mut fitter = MassFitKFit::default();
        fitter.set_invariant_mass(1.0).unwrap();
        assert!(matches!(
            fitter.set_invariant_mass(-1.0),
            Err(FitError::InvalidParameter(_))
        ));
        assert_eq!(fitter.invariant_mass, Some(1.0));
    }

    #[test]
    fn exact_mass_gives_zero_chi_square() {
        let mut fitter = MassFitKFit::default();
        let (t1, t2) = back_to_back();
        fitter.add_track(t1);
        fitter.add_track(t2);
        fitter.set_invariant_mass(2.0).unwrap();
        fitter.do_fit().unwrap();
        assert_abs_diff_eq!(fitter.chi_square().unwrap(), 0.0, epsilon = 1e-8);
        assert_relative_eq!(
            fitter.invariant_mass(FitStage::AfterFit).unwrap(),
            2.0,
            epsilon = 1e-8
        );
        assert_eq!(fitter.ndf().unwrap(), 1);
    }

    #[test]
    fn pulls_sum_onto_target_mass() {
        let mut fitter = MassFitKFit::default();
        let error = diag7(1e-3, 1e-3);
        let t1 = KFitTrack::new(
            Vec3::new(0.8, 0.1, 0.0).with_mass(0.13957),
            Vec3::default(),
            error.clone(),
            1.0,
        )
        .unwrap();
        let t2 = KFitTrack::new(
            Vec3::new(-0.75, 0.05, 0.1).with_mass(0.13957),
            Vec3::default(),
            error,
            -1.0,
        )
        .unwrap();
        fitter.add_track(t1);
        fitter.add_track(t2);
        fitter.set_invariant_mass(1.6).unwrap();
        fitter.do_fit().unwrap();
        assert_relative_eq!(
            fitter.invariant_mass(FitStage::AfterFit).unwrap(),
            1.6,
            epsilon = 1e-6
        );
        assert!(fitter.chi_square().unwrap() > 0.0);
    }

    #[test]
    fn free_mass_track_width() {
        let mut fitter = MassFitKFit::default();
        let (t1, t2) = back_to_back();
        fitter.add_track(t1);
        fitter.add_track(t2);
        fitter.unfix_mass().unwrap();
        fitter.set_invariant_mass(2.0).unwrap();
        fitter.do_fit().unwrap();
        assert_eq!(fitter.correlation(0, 1).unwrap().shape(), (6, 7));
    }

    #[test]
    fn unfix_before_add_fails() {
        let mut fitter = MassFitKFit::default();
        assert!(matches!(
            fitter.unfix_mass(),
            Err(FitError::PreconditionViolation(_))
        ));
    }

    #[test]
    fn fit_without_mass_fails() {
        let mut fitter = MassFitKFit::default();
        let (t1, _) = back_to_back();
        fitter.add_track(t1);
        assert!(matches!(
            fitter.do_fit(),
            Err(FitError::PreconditionViolation(_))
        ));
    }
}
