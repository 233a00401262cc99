//! Vertex fit over a flat track list.

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::utils::matrix::{invert_sym, invert_sym_deficient};
use crate::{FitError, FitResult, Float, Vec3};

use super::{
    make_correlation, make_error_3x7, make_error_7, FitStage, KFitConfig, KFitTrack,
    TrackState, INITIAL_CHI_SQUARE,
};

/// Track-parameter rows of the two helix constraint rows for one track,
/// together with the vertex rows: `d` (residuals), `dmat` (Jacobian with
/// respect to the stacked track parameters), `emat` (Jacobian with respect
/// to the vertex).
pub(crate) struct CoreMatrices {
    pub d: DVector<Float>,
    pub dmat: DMatrix<Float>,
    pub emat: DMatrix<Float>,
}

/// Evaluate the two vertex-constraint rows per track at the running state.
///
/// Row one is the transverse distance-of-closest-approach condition, row two
/// ties the longitudinal flight to the helix arc. Charged tracks (`a != 0`)
/// use the exact arc-length term `asin(B)`; neutrals degenerate to straight
/// lines. `widths[k]` gives the parameter width of track `k` (6, or 7 when
/// an energy column is carried; the energy column of a vertex row is zero).
pub(crate) fn make_core_matrix(
    al1: &DVector<Float>,
    v_a: &DVector<Float>,
    curvatures: &[Float],
    widths: &[usize],
) -> FitResult<CoreMatrices> {
    let n = curvatures.len();
    let dim: usize = widths.iter().sum();
    let mut d = DVector::zeros(2 * n);
    let mut dmat = DMatrix::zeros(2 * n, dim);
    let mut emat = DMatrix::zeros(2 * n, 3);

    let mut offset = 0;
    for k in 0..n {
        let w = widths[k];
        // momentum columns 0..3, position columns w-3..w
        let px = al1[offset];
        let py = al1[offset + 1];
        let pz = al1[offset + 2];
        let x = al1[offset + w - 3];
        let y = al1[offset + w - 2];
        let z = al1[offset + w - 1];
        let a = curvatures[k];

        let pt = px.hypot(py);
        if pt == 0.0 {
            return Err(FitError::NumericalFailure(
                "zero transverse momentum in vertex constraint".to_string(),
            ));
        }
        let inv_pt = 1.0 / pt;
        let inv_pt2 = inv_pt * inv_pt;
        let dlx = v_a[0] - x;
        let dly = v_a[1] - y;
        let dlz = v_a[2] - z;
        let a1 = -dlx * py + dly * px;
        let a2 = dlx * px + dly * py;
        let r2d2 = dlx * dlx + dly * dly;
        let rx = dlx - 2.0 * px * a2 * inv_pt2;
        let ry = dly - 2.0 * py * a2 * inv_pt2;

        let (sininv, s, u);
        if a != 0.0 {
            let b = a * a2 * inv_pt2;
            if b.abs() > 1.0 {
                return Err(FitError::NumericalFailure(
                    "vertex too far from helix for arcsin".to_string(),
                ));
            }
            sininv = b.asin();
            let tmp0 = 1.0 - b * b;
            if tmp0 == 0.0 {
                return Err(FitError::NumericalFailure(
                    "tangential vertex constraint".to_string(),
                ));
            }
            s = inv_pt2 / tmp0.sqrt();
            u = dlz - pz * sininv / a;
        } else {
            sininv = 0.0;
            s = inv_pt2;
            u = dlz - pz * a2 * inv_pt2;
        }

        d[2 * k] = a1 - 0.5 * a * r2d2;
        d[2 * k + 1] = u * pt;

        dmat[(2 * k, offset)] = dly;
        dmat[(2 * k, offset + 1)] = -dlx;
        dmat[(2 * k, offset + w - 3)] = py + a * dlx;
        dmat[(2 * k, offset + w - 2)] = -px + a * dly;
        dmat[(2 * k + 1, offset)] = -pz * pt * s * rx + u * px * inv_pt;
        dmat[(2 * k + 1, offset + 1)] = -pz * pt * s * ry + u * py * inv_pt;
        dmat[(2 * k + 1, offset + 2)] = if a != 0.0 {
            -sininv * pt / a
        } else {
            -a2 * inv_pt
        };
        dmat[(2 * k + 1, offset + w - 3)] = px * pz * pt * s;
        dmat[(2 * k + 1, offset + w - 2)] = py * pz * pt * s;
        dmat[(2 * k + 1, offset + w - 1)] = -pt;

        emat[(2 * k, 0)] = -py - a * dlx;
        emat[(2 * k, 1)] = px - a * dly;
        emat[(2 * k + 1, 0)] = -px * pz * pt * s;
        emat[(2 * k + 1, 1)] = -py * pz * pt * s;
        emat[(2 * k + 1, 2)] = pt;

        offset += w;
    }

    Ok(CoreMatrices { d, dmat, emat })
}

struct VertexOutputs {
    vertex: Vec3,
    vertex_error: DMatrix<Float>,
    chi_square: Float,
    vertex_chi_square: Option<Float>,
    each_chi_square: Vec<Float>,
    ndf: usize,
    track_vertex_errors: Vec<DMatrix<Float>>,
    v_al_1: DMatrix<Float>,
    chi_square_history: Vec<Float>,
}

struct FitCore {
    al_1: DVector<Float>,
    v_al_1: DMatrix<Float>,
    vertex: DVector<Float>,
    vertex_error: DMatrix<Float>,
    cov_v_al_1: DMatrix<Float>,
    chi_square: Float,
    each_chi_square: Vec<Float>,
    vertex_chi_square: Option<Float>,
    chi_square_history: Vec<Float>,
}

/// A vertex fit: finds the common origin of two or more tracks.
///
/// Three modes are supported. The plain fit leaves the vertex free and needs
/// at least two tracks. With [`set_ip_profile`](Self::set_ip_profile) the
/// vertex is additionally pulled toward a measured interaction-point profile
/// (one track suffices). With [`set_known_vertex`](Self::set_known_vertex)
/// the vertex is held fixed at the initial value and only the tracks are
/// adjusted. An elongated profile covariance from
/// [`set_ip_tube_profile`](Self::set_ip_tube_profile) adds the beam line as
/// a pseudo-track instead.
pub struct VertexFitKFit {
    config: KFitConfig,
    tracks: Vec<KFitTrack>,
    before_vertex: Vec3,
    ip_profile: Option<(Vec3, DMatrix<Float>)>,
    tube_track: Option<KFitTrack>,
    known_vertex: bool,
    outputs: Option<VertexOutputs>,
}

impl Default for VertexFitKFit {
    fn default() -> Self {
        Self::new(KFitConfig::default())
    }
}

impl VertexFitKFit {
    pub fn new(config: KFitConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            before_vertex: Vec3::default(),
            ip_profile: None,
            tube_track: None,
            known_vertex: false,
            outputs: None,
        }
    }

    pub fn add_track(&mut self, track: KFitTrack) {
        self.tracks.push(track);
        self.outputs = None;
    }

    pub fn set_initial_vertex(&mut self, vertex: Vec3) {
        self.before_vertex = vertex;
        self.outputs = None;
    }

    /// Constrain the vertex toward a measured interaction-point position
    /// with the given 3x3 covariance. Mutually exclusive with the IP tube.
    pub fn set_ip_profile(&mut self, position: Vec3, error: DMatrix<Float>) -> FitResult<()> {
        if self.tube_track.is_some() {
            return Err(FitError::PreconditionViolation(
                "IP profile and IP tube cannot both be set".to_string(),
            ));
        }
        crate::utils::matrix::check_covariance(&error, "IP profile")?;
        if error.nrows() != 3 {
            return Err(FitError::InvalidParameter(format!(
                "IP profile error must be 3x3, got {}x{}",
                error.nrows(),
                error.ncols()
            )));
        }
        self.ip_profile = Some((position, error));
        self.outputs = None;
        Ok(())
    }

    /// Add the beam line as a pseudo-track with an elongated covariance.
    /// Mutually exclusive with the IP profile.
    pub fn set_ip_tube_profile(&mut self, track: KFitTrack) -> FitResult<()> {
        if self.ip_profile.is_some() {
            return Err(FitError::PreconditionViolation(
                "IP profile and IP tube cannot both be set".to_string(),
            ));
        }
        self.tube_track = Some(track);
        self.outputs = None;
        Ok(())
    }

    /// Hold the vertex fixed at the initial value; only the tracks move.
    pub fn set_known_vertex(&mut self) {
        self.known_vertex = true;
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

    /// Chi-square contribution of the interaction-point profile, when one
    /// was used.
    pub fn vertex_chi_square(&self) -> FitResult<Float> {
        self.fitted()?.vertex_chi_square.ok_or_else(|| {
            FitError::PreconditionViolation("no IP profile in this fit".to_string())
        })
    }

    pub fn track_chi_square(&self, index: usize) -> FitResult<Float> {
        self.fitted()?
            .each_chi_square
            .get(index)
            .copied()
            .ok_or_else(|| {
                FitError::InvalidParameter(format!("track index {index} out of range"))
            })
    }

    pub fn ndf(&self) -> FitResult<usize> {
        Ok(self.fitted()?.ndf)
    }

    /// The fitted 3x7 covariance between the vertex and track `index`.
    pub fn track_vertex_error(&self, index: usize) -> FitResult<&DMatrix<Float>> {
        self.fitted()?
            .track_vertex_errors
            .get(index)
            .ok_or_else(|| {
                FitError::InvalidParameter(format!("track index {index} out of range"))
            })
    }

    /// The fitted 7x7 cross-covariance between tracks `i` and `j`.
    pub fn correlation(&self, i: usize, j: usize) -> FitResult<DMatrix<Float>> {
        let outputs = self.fitted()?;
        let n = self.tracks.len();
        if i >= n || j >= n {
            return Err(FitError::InvalidParameter(format!(
                "track indices ({i}, {j}) out of range"
            )));
        }
        let block6 = outputs.v_al_1.view((6 * i, 6 * j), (6, 6)).into_owned();
        let pi = self.tracks[i].momentum(FitStage::AfterFit)?;
        let pj = self.tracks[j].momentum(FitStage::AfterFit)?;
        Ok(make_correlation(&pi, &pj, &block6))
    }

    /// Chi-square of each accepted iteration, in order.
    #[cfg(test)]
    pub(crate) fn chi_square_history(&self) -> FitResult<&[Float]> {
        Ok(&self.fitted()?.chi_square_history)
    }

    fn fitted(&self) -> FitResult<&VertexOutputs> {
        self.outputs.as_ref().ok_or_else(|| {
            FitError::PreconditionViolation(
                "fit result requested before a successful fit".to_string(),
            )
        })
    }

    /// Run the fit. On success the fitted vertex, per-track states, and all
    /// covariance blocks become available through the getters; on error no
    /// partial result is exposed.
    pub fn do_fit(&mut self) -> FitResult<()> {
        self.outputs = None;
        for track in &mut self.tracks {
            track.clear_after();
        }

        let mut work = self.tracks.clone();
        if let Some(tube) = &self.tube_track {
            work.push(tube.clone());
        }
        let n = work.len();
        let required = if self.ip_profile.is_some() || self.known_vertex {
            1
        } else {
            2
        };
        if n < required {
            return Err(FitError::PreconditionViolation(format!(
                "vertex fit needs at least {required} tracks, got {n}"
            )));
        }

        let ndf = if self.ip_profile.is_some() || self.known_vertex {
            2 * n
        } else if self.tube_track.is_some() {
            2 * (n - 1) - 1
        } else {
            2 * n - 3
        };

        let mut al_0 = DVector::zeros(6 * n);
        let mut v_al_0 = DMatrix::zeros(6 * n, 6 * n);
        let mut curvatures = Vec::with_capacity(n);
        for (k, track) in work.iter().enumerate() {
            let par = track.fit_parameter_6();
            for (j, value) in par.iter().enumerate() {
                al_0[6 * k + j] = *value;
            }
            v_al_0
                .view_mut((6 * k, 6 * k), (6, 6))
                .copy_from(&track.fit_error_6());
            curvatures.push(self.config.curvature(track.charge()));
        }

        let core = if let Some((ip, ip_error)) = self.ip_profile.clone() {
            self.fit_beam(&al_0, &v_al_0, &curvatures, &ip, &ip_error)?
        } else if self.known_vertex {
            self.fit_known(&al_0, &v_al_0, &curvatures)?
        } else {
            self.fit_plain(&al_0, &v_al_0, &curvatures)?
        };

        // Write the after-fit track states (the tube pseudo-track, if any,
        // sits at the end of the working list and is not reported).
        let mut track_vertex_errors = Vec::with_capacity(self.tracks.len());
        for (k, track) in self.tracks.iter_mut().enumerate() {
            let px = core.al_1[6 * k];
            let py = core.al_1[6 * k + 1];
            let pz = core.al_1[6 * k + 2];
            let mass = track.mass();
            let momentum = Vec3::new(px, py, pz).with_mass(mass);
            let position = Vec3::new(
                core.al_1[6 * k + 3],
                core.al_1[6 * k + 4],
                core.al_1[6 * k + 5],
            );
            let block6 = core.v_al_1.view((6 * k, 6 * k), (6, 6)).into_owned();
            let error = make_error_7(&momentum, &block6);
            let vertex_block = core.cov_v_al_1.view((0, 6 * k), (3, 6)).into_owned();
            track_vertex_errors.push(make_error_3x7(&momentum, &vertex_block));
            track.set_after(TrackState {
                momentum,
                position,
                error,
            });
        }

        self.outputs = Some(VertexOutputs {
            vertex: Vec3::new(core.vertex[0], core.vertex[1], core.vertex[2]),
            vertex_error: core.vertex_error,
            chi_square: core.chi_square,
            vertex_chi_square: core.vertex_chi_square,
            each_chi_square: core.each_chi_square,
            ndf,
            track_vertex_errors,
            v_al_1: core.v_al_1,
            chi_square_history: core.chi_square_history,
        });
        Ok(())
    }

    /// Free-vertex fit: an inner loop moves the vertex at fixed expansion
    /// point, an outer loop re-expands the track parameters. Both loops keep
    /// the best chi-square seen and back up one step when it rises.
    fn fit_plain(
        &self,
        al_0: &DVector<Float>,
        v_al_0: &DMatrix<Float>,
        curvatures: &[Float],
    ) -> FitResult<FitCore> {
        let n = curvatures.len();
        let rows = 2 * n;
        let widths = vec![6usize; n];

        let mut al_1 = al_0.clone();
        let mut v_a = DVector::from_column_slice(&[
            self.before_vertex.x(),
            self.before_vertex.y(),
            self.before_vertex.z(),
        ]);

        let mut dmat = DMatrix::zeros(rows, 6 * n);
        let mut emat = DMatrix::zeros(rows, 3);
        let mut v_d = DMatrix::zeros(rows, rows);
        let mut v_e = DMatrix::zeros(3, 3);
        let mut lam0 = DVector::zeros(rows);
        let mut chi_square = 0.0;
        let mut each = vec![0.0; n];

        let mut outer_chi_square = INITIAL_CHI_SQUARE;
        let mut outer_snapshot = None;
        let mut history = Vec::new();

        for outer in 0..self.config.max_iterations {
            let mut inner_chi_square = INITIAL_CHI_SQUARE;
            let mut inner_snapshot = None;
            let mut inner_converged = false;

            for _ in 0..self.config.max_iterations {
                let core = make_core_matrix(&al_1, &v_a, curvatures, &widths)?;
                dmat = core.dmat;
                emat = core.emat;
                let d = core.d;

                let mut v_e_in = DMatrix::zeros(3, 3);
                chi_square = 0.0;
                for k in 0..n {
                    let t_d = dmat.view((2 * k, 6 * k), (2, 6));
                    let cov_k = v_al_0.view((6 * k, 6 * k), (6, 6));
                    let t_v_d =
                        invert_sym(&(&t_d * cov_k * t_d.transpose()), "vertex constraint metric")?;
                    v_d.view_mut((2 * k, 2 * k), (2, 2)).copy_from(&t_v_d);
                    let t_e = emat.view((2 * k, 0), (2, 3));
                    v_e_in += t_e.transpose() * &t_v_d * t_e;
                    let delta =
                        al_0.rows(6 * k, 6) - al_1.rows(6 * k, 6);
                    let residual = &t_d * delta + d.rows(2 * k, 2);
                    let t_lam0 = &t_v_d * &residual;
                    lam0.rows_mut(2 * k, 2).copy_from(&t_lam0);
                    each[k] = t_lam0.dot(&residual);
                    chi_square += each[k];
                }
                // Back-to-back tracks leave one vertex direction
                // unconstrained; tolerate the rank deficiency.
                v_e = invert_sym_deficient(&v_e_in, "vertex covariance")?;
                v_a = &v_a - &v_e * emat.transpose() * &lam0;

                if inner_chi_square <= chi_square {
                    match inner_snapshot.take() {
                        None => {
                            return Err(FitError::NumericalFailure(
                                "chi-square diverged on first vertex iteration".to_string(),
                            ))
                        }
                        Some((s_each, s_v_a, s_v_e, s_v_d, s_lam0, s_emat, s_dmat)) => {
                            each = s_each;
                            chi_square = inner_chi_square;
                            v_a = s_v_a;
                            v_e = s_v_e;
                            v_d = s_v_d;
                            lam0 = s_lam0;
                            emat = s_emat;
                            dmat = s_dmat;
                        }
                    }
                    inner_converged = true;
                    break;
                }
                inner_chi_square = chi_square;
                inner_snapshot = Some((
                    each.clone(),
                    v_a.clone(),
                    v_e.clone(),
                    v_d.clone(),
                    lam0.clone(),
                    emat.clone(),
                    dmat.clone(),
                ));
            }
            if !inner_converged {
                return Err(FitError::NonConvergence {
                    max_iterations: self.config.max_iterations,
                });
            }

            let lam = &lam0 - &v_d * &emat * &v_e * emat.transpose() * &lam0;
            al_1 = al_0 - v_al_0 * dmat.transpose() * lam;

            debug!(iteration = outer, chi_square, "vertex fit outer step");

            if outer == 0 {
                outer_chi_square = chi_square;
                history.push(chi_square);
                outer_snapshot = Some((
                    each.clone(),
                    v_a.clone(),
                    v_e.clone(),
                    v_d.clone(),
                    lam0.clone(),
                    emat.clone(),
                    dmat.clone(),
                ));
            } else if outer_chi_square <= chi_square {
                if let Some((s_each, s_v_a, s_v_e, s_v_d, s_lam0, s_emat, s_dmat)) =
                    outer_snapshot.take()
                {
                    each = s_each;
                    chi_square = outer_chi_square;
                    v_a = s_v_a;
                    v_e = s_v_e;
                    v_d = s_v_d;
                    lam0 = s_lam0;
                    emat = s_emat;
                    dmat = s_dmat;
                }
                break;
            } else {
                outer_chi_square = chi_square;
                history.push(chi_square);
                outer_snapshot = Some((
                    each.clone(),
                    v_a.clone(),
                    v_e.clone(),
                    v_d.clone(),
                    lam0.clone(),
                    emat.clone(),
                    dmat.clone(),
                ));
            }
        }
        // Outer-loop exhaustion while still improving keeps the last state.

        let lam = &lam0 - &v_d * &emat * &v_e * emat.transpose() * &lam0;
        let al_1 = al_0 - v_al_0 * dmat.transpose() * &lam;
        let v_dt = &v_d - &v_d * &emat * &v_e * emat.transpose() * &v_d;
        let v_al_1 = v_al_0 - v_al_0 * dmat.transpose() * &v_dt * &dmat * v_al_0;
        let cov_v_al_1 = -(&v_e) * emat.transpose() * &v_d * &dmat * v_al_0;

        Ok(FitCore {
            al_1,
            v_al_1,
            vertex: v_a,
            vertex_error: v_e,
            cov_v_al_1,
            chi_square,
            each_chi_square: each,
            vertex_chi_square: None,
            chi_square_history: history,
        })
    }

    /// Beam-constrained fit: the IP profile covariance enters the constraint
    /// metric directly, so the vertex update follows the profile.
    fn fit_beam(
        &self,
        al_0: &DVector<Float>,
        v_al_0: &DMatrix<Float>,
        curvatures: &[Float],
        ip: &Vec3,
        ip_error: &DMatrix<Float>,
    ) -> FitResult<FitCore> {
        let n = curvatures.len();
        let widths = vec![6usize; n];

        let mut al_1 = al_0.clone();
        let v = DVector::from_column_slice(&[ip.x(), ip.y(), ip.z()]);
        let mut v_a = v.clone();

        let mut best_chi_square = INITIAL_CHI_SQUARE;
        let mut snapshot = None;
        let mut rose_once = false;
        let mut converged = false;
        let mut history = Vec::new();

        for iteration in 0..self.config.max_iterations {
            let core = make_core_matrix(&al_1, &v_a, curvatures, &widths)?;
            let dmat = core.dmat;
            let emat = core.emat;
            let d = core.d;

            let metric =
                &dmat * v_al_0 * dmat.transpose() + &emat * ip_error * emat.transpose();
            let v_dt = invert_sym(&metric, "beam constraint metric")?;
            let shift = &dmat * (al_0 - &al_1) + &emat * (&v - &v_a) + &d;
            let lam = &v_dt * &shift;

            let chi_square = lam.dot(&shift);
            let mut each = vec![0.0; n];
            for k in 0..n {
                let t_d = dmat.view((2 * k, 6 * k), (2, 6));
                let cov_k = v_al_0.view((6 * k, 6 * k), (6, 6));
                let lam_k = lam.rows(2 * k, 2);
                each[k] = (lam_k.transpose() * &t_d * cov_k * t_d.transpose() * lam_k)[(0, 0)];
            }
            let vertex_chi_square =
                (lam.transpose() * &emat * ip_error * emat.transpose() * &lam)[(0, 0)];

            v_a = &v - ip_error * emat.transpose() * &lam;
            al_1 = al_0 - v_al_0 * dmat.transpose() * &lam;

            debug!(iteration, chi_square, vertex_chi_square, "beam vertex fit step");

            // The chi-square may rise once before the fit backs up, which
            // keeps the vertex-z estimate from stopping too early.
            if best_chi_square <= chi_square && rose_once {
                if snapshot.is_none() {
                    return Err(FitError::NumericalFailure(
                        "chi-square diverged on first beam iteration".to_string(),
                    ));
                }
                converged = true;
                break;
            }
            if best_chi_square <= chi_square {
                rose_once = true;
            }
            snapshot = Some((each, vertex_chi_square, chi_square, lam, emat, dmat));
            best_chi_square = chi_square;
            history.push(chi_square);
        }
        if !converged {
            return Err(FitError::NonConvergence {
                max_iterations: self.config.max_iterations,
            });
        }

        // Rebuild the outputs from the best accepted iteration.
        let (each, vertex_chi_square, chi_square, lam, emat, dmat) = match snapshot {
            Some(s) => s,
            None => {
                return Err(FitError::NumericalFailure(
                    "beam vertex fit produced no accepted iteration".to_string(),
                ))
            }
        };

        let al_1 = al_0 - v_al_0 * dmat.transpose() * &lam;
        let v_a = &v - ip_error * emat.transpose() * &lam;
        let metric = &dmat * v_al_0 * dmat.transpose() + &emat * ip_error * emat.transpose();
        let v_dt = invert_sym(&metric, "beam constraint metric")?;
        let v_al_1 = v_al_0 - v_al_0 * dmat.transpose() * &v_dt * &dmat * v_al_0;
        let cov_v_al_1 = -ip_error * emat.transpose() * &v_dt * &dmat * v_al_0;
        let vertex_error = ip_error - ip_error * emat.transpose() * &v_dt * &emat * ip_error;

        Ok(FitCore {
            al_1,
            v_al_1,
            vertex: v_a,
            vertex_error,
            cov_v_al_1,
            chi_square,
            each_chi_square: each,
            vertex_chi_square: Some(vertex_chi_square),
            chi_square_history: history,
        })
    }

    /// Known-vertex fit: the vertex never moves, only the track parameters
    /// are pulled onto helices through it.
    fn fit_known(
        &self,
        al_0: &DVector<Float>,
        v_al_0: &DMatrix<Float>,
        curvatures: &[Float],
    ) -> FitResult<FitCore> {
        let n = curvatures.len();
        let rows = 2 * n;
        let widths = vec![6usize; n];

        let mut al_1 = al_0.clone();
        let v_a = DVector::from_column_slice(&[
            self.before_vertex.x(),
            self.before_vertex.y(),
            self.before_vertex.z(),
        ]);

        let mut v_al_1 = v_al_0.clone();
        let mut v_d = DMatrix::zeros(rows, rows);
        let mut lam = DVector::zeros(rows);
        let mut chi_square;
        let mut each = vec![0.0; n];

        let mut best_chi_square = INITIAL_CHI_SQUARE;
        let mut snapshot = None;
        let mut converged = false;
        let mut history = Vec::new();

        for iteration in 0..self.config.max_iterations {
            let core = make_core_matrix(&al_1, &v_a, curvatures, &widths)?;
            let dmat = core.dmat;
            let d = core.d;

            chi_square = 0.0;
            for k in 0..n {
                let t_d = dmat.view((2 * k, 6 * k), (2, 6));
                let cov_k = v_al_0.view((6 * k, 6 * k), (6, 6));
                let t_v_d =
                    invert_sym(&(&t_d * cov_k * t_d.transpose()), "vertex constraint metric")?;
                v_d.view_mut((2 * k, 2 * k), (2, 2)).copy_from(&t_v_d);
                let delta = al_0.rows(6 * k, 6) - al_1.rows(6 * k, 6);
                let residual = &t_d * delta + d.rows(2 * k, 2);
                let t_lam = &t_v_d * &residual;
                lam.rows_mut(2 * k, 2).copy_from(&t_lam);
                each[k] = t_lam.dot(&residual);
                chi_square += each[k];
            }

            al_1 = al_0 - v_al_0 * dmat.transpose() * &lam;
            v_al_1 = v_al_0 - v_al_0 * dmat.transpose() * &v_d * &dmat * v_al_0;

            debug!(iteration, chi_square, "known-vertex fit step");

            if best_chi_square <= chi_square {
                if let Some((s_each, s_al_1, s_v_al_1)) = snapshot.take() {
                    each = s_each;
                    al_1 = s_al_1;
                    v_al_1 = s_v_al_1;
                } else {
                    return Err(FitError::NumericalFailure(
                        "chi-square diverged on first known-vertex iteration".to_string(),
                    ));
                }
                converged = true;
                break;
            }
            best_chi_square = chi_square;
            history.push(chi_square);
            snapshot = Some((each.clone(), al_1.clone(), v_al_1.clone()));
        }
        if !converged {
            return Err(FitError::NonConvergence {
                max_iterations: self.config.max_iterations,
            });
        }

        Ok(FitCore {
            al_1,
            v_al_1,
            vertex: v_a,
            vertex_error: DMatrix::zeros(3, 3),
            cov_v_al_1: DMatrix::zeros(3, 6 * n),
            chi_square: best_chi_square,
            each_chi_square: each,
            vertex_chi_square: None,
            chi_square_history: history,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Vec4;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

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

    /// Two neutral tracks whose lines cross at the origin.
    fn crossing_tracks() -> (KFitTrack, KFitTrack) {
        let error = diag7(1e-4, 1e-4);
        let t1 = KFitTrack::new(
            Vec4::new(1.0, 0.0, 0.0, 1.0),
            Vec3::new(0.5, 0.0, 0.0),
            error.clone(),
            0.0,
        )
        .unwrap();
        let t2 = KFitTrack::new(
            Vec4::new(0.0, 1.0, 0.0, 1.0),
            Vec3::new(0.0, 0.5, 0.0),
            error,
            0.0,
        )
        .unwrap();
        (t1, t2)
    }

    /// Tracks lying on lines through the origin but displaced start points.
    fn skewed_tracks() -> Vec<KFitTrack> {
        let error = diag7(1e-4, 1e-4);
        let dirs = [
            Vec3::new(1.0, 0.2, 0.1),
            Vec3::new(-1.0, 0.3, -0.2),
            Vec3::new(0.1, -1.0, 0.3),
        ];
        dirs.iter()
            .map(|dir| {
                KFitTrack::new(
                    dir.with_mass(0.13957),
                    0.7 * dir.unit(),
                    error.clone(),
                    0.0,
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn needs_two_tracks() {
        let mut fitter = VertexFitKFit::default();
        let (t1, _) = crossing_tracks();
        fitter.add_track(t1);
        assert!(matches!(
            fitter.do_fit(),
            Err(FitError::PreconditionViolation(_))
        ));
    }

    #[test]
    fn getters_before_fit_fail() {
        let fitter = VertexFitKFit::default();
        assert!(fitter.vertex(FitStage::AfterFit).is_err());
        assert!(fitter.chi_square().is_err());
        assert!(fitter.ndf().is_err());
    }

    #[test]
    fn two_track_vertex_at_origin() {
        let mut fitter = VertexFitKFit::default();
        let (t1, t2) = crossing_tracks();
        fitter.add_track(t1);
        fitter.add_track(t2);
        fitter.set_initial_vertex(Vec3::new(0.1, 0.1, 0.1));
        fitter.do_fit().unwrap();
        let vertex = fitter.vertex(FitStage::AfterFit).unwrap();
        assert_abs_diff_eq!(vertex.x(), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(vertex.y(), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(vertex.z(), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(fitter.chi_square().unwrap(), 0.0, epsilon = 1e-8);
        assert_eq!(fitter.ndf().unwrap(), 1);
    }

    #[test]
    fn back_to_back_tracks_fit() {
        // Collinear tracks fix only the transverse vertex coordinates; the
        // position along the flight axis stays at the seed.
        let error = diag7(1e-4, 1e-4);
        let mut fitter = VertexFitKFit::default();
        fitter.add_track(
            KFitTrack::new(
                Vec4::new(1.0, 0.0, 0.0, 1.0),
                Vec3::new(0.5, 0.0, 0.0),
                error.clone(),
                0.0,
            )
            .unwrap(),
        );
        fitter.add_track(
            KFitTrack::new(
                Vec4::new(-1.0, 0.0, 0.0, 1.0),
                Vec3::new(-0.5, 0.0, 0.0),
                error,
                0.0,
            )
            .unwrap(),
        );
        fitter.do_fit().unwrap();
        let vertex = fitter.vertex(FitStage::AfterFit).unwrap();
        assert_abs_diff_eq!(vertex.y(), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(vertex.z(), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(fitter.chi_square().unwrap(), 0.0, epsilon = 1e-8);
        assert_eq!(fitter.ndf().unwrap(), 1);
    }

    #[test]
    fn three_track_ndf() {
        let mut fitter = VertexFitKFit::default();
        for track in skewed_tracks() {
            fitter.add_track(track);
        }
        fitter.set_initial_vertex(Vec3::new(0.05, -0.05, 0.02));
        fitter.do_fit().unwrap();
        assert_eq!(fitter.ndf().unwrap(), 3);
        let vertex = fitter.vertex(FitStage::AfterFit).unwrap();
        assert_abs_diff_eq!(vertex.mag(), 0.0, epsilon = 1e-5);
    }

    #[test]
    fn after_fit_tracks_are_updated() {
        let mut fitter = VertexFitKFit::default();
        let (t1, t2) = crossing_tracks();
        fitter.add_track(t1);
        fitter.add_track(t2);
        fitter.do_fit().unwrap();
        let track = fitter.track(0).unwrap();
        let momentum = track.momentum(FitStage::AfterFit).unwrap();
        assert_relative_eq!(momentum.e(), 1.0, epsilon = 1e-4);
        assert_eq!(fitter.track_vertex_error(0).unwrap().shape(), (3, 7));
        assert_eq!(fitter.correlation(0, 1).unwrap().shape(), (7, 7));
    }

    #[test]
    fn beam_profile_pulls_vertex() {
        let mut fitter = VertexFitKFit::default();
        let (t1, t2) = crossing_tracks();
        fitter.add_track(t1);
        fitter.add_track(t2);
        fitter
            .set_ip_profile(Vec3::new(0.0, 0.0, 0.0), DMatrix::identity(3, 3) * 1e-4)
            .unwrap();
        fitter.do_fit().unwrap();
        assert_eq!(fitter.ndf().unwrap(), 4);
        let vertex = fitter.vertex(FitStage::AfterFit).unwrap();
        assert_abs_diff_eq!(vertex.mag(), 0.0, epsilon = 1e-5);
        assert!(fitter.vertex_chi_square().unwrap() >= 0.0);
    }

    #[test]
    fn known_vertex_fit() {
        let mut fitter = VertexFitKFit::default();
        let (t1, t2) = crossing_tracks();
        fitter.add_track(t1);
        fitter.add_track(t2);
        fitter.set_initial_vertex(Vec3::new(0.0, 0.0, 0.0));
        fitter.set_known_vertex();
        fitter.do_fit().unwrap();
        assert_eq!(fitter.ndf().unwrap(), 4);
        assert_abs_diff_eq!(fitter.chi_square().unwrap(), 0.0, epsilon = 1e-8);
    }

    #[test]
    fn ip_profile_and_tube_are_exclusive() {
        let mut fitter = VertexFitKFit::default();
        fitter
            .set_ip_profile(Vec3::default(), DMatrix::identity(3, 3))
            .unwrap();
        let (t1, _) = crossing_tracks();
        assert!(matches!(
            fitter.set_ip_tube_profile(t1),
            Err(FitError::PreconditionViolation(_))
        ));
    }

    #[test]
    fn smeared_tracks_recover_the_vertex() {
        let mut rng = fastrand::Rng::with_seed(0);
        let error = diag7(1e-4, 1e-4);
        let dirs = [
            Vec3::new(1.0, 0.2, 0.1),
            Vec3::new(-1.0, 0.3, -0.2),
            Vec3::new(0.1, -1.0, 0.3),
            Vec3::new(-0.2, 0.9, -1.0),
        ];
        let mut fitter = VertexFitKFit::default();
        for dir in &dirs {
            // Displace the reference point along the line, then smear it
            // transversely at the scale of the position errors.
            let smear = Vec3::new(
                (rng.f64() - 0.5) * 0.02,
                (rng.f64() - 0.5) * 0.02,
                (rng.f64() - 0.5) * 0.02,
            );
            let track = KFitTrack::new(
                dir.with_mass(0.13957),
                0.7 * dir.unit() + smear,
                error.clone(),
                0.0,
            )
            .unwrap();
            fitter.add_track(track);
        }
        fitter.do_fit().unwrap();
        assert_eq!(fitter.ndf().unwrap(), 5);
        let vertex = fitter.vertex(FitStage::AfterFit).unwrap();
        assert!(vertex.mag() < 5e-2, "vertex drifted to {vertex:?}");
        let chi2 = fitter.chi_square().unwrap();
        assert!(chi2.is_finite() && chi2 >= 0.0);
        assert!(chi2 < 50.0, "chi-square {chi2} out of scale");
    }

    #[test]
    fn accepted_chi_square_never_rises() {
        // Backtracking only ever keeps improving outer iterations, so the
        // accepted chi-square sequence is decreasing for any input.
        for seed in 0..16u64 {
            let mut rng = fastrand::Rng::with_seed(seed);
            let error = diag7(1e-4, 1e-4);
            let dirs = [
                Vec3::new(1.0, 0.2, 0.1),
                Vec3::new(-1.0, 0.3, -0.2),
                Vec3::new(0.1, -1.0, 0.3),
                Vec3::new(-0.2, 0.9, -1.0),
            ];
            let mut fitter = VertexFitKFit::default();
            for dir in &dirs {
                let smear = Vec3::new(
                    (rng.f64() - 0.5) * 0.02,
                    (rng.f64() - 0.5) * 0.02,
                    (rng.f64() - 0.5) * 0.02,
                );
                let track = KFitTrack::new(
                    dir.with_mass(0.13957),
                    0.7 * dir.unit() + smear,
                    error.clone(),
                    0.0,
                )
                .unwrap();
                fitter.add_track(track);
            }
            fitter.do_fit().unwrap();
            let history = fitter.chi_square_history().unwrap();
            assert!(!history.is_empty(), "seed {seed}: empty history");
            for pair in history.windows(2) {
                assert!(
                    pair[1] < pair[0],
                    "seed {seed}: chi-square rose from {} to {}",
                    pair[0],
                    pair[1]
                );
            }
            let last = history[history.len() - 1];
            assert_eq!(last, fitter.chi_square().unwrap());
        }
    }

    #[test]
    fn determinism() {
        let run = || {
            let mut fitter = VertexFitKFit::default();
            for track in skewed_tracks() {
                fitter.add_track(track);
            }
            fitter.set_initial_vertex(Vec3::new(0.05, -0.05, 0.02));
            fitter.do_fit().unwrap();
            (
                fitter.vertex(FitStage::AfterFit).unwrap(),
                fitter.chi_square().unwrap(),
            )
        };
        let (v1, c1) = run();
        let (v2, c2) = run();
        assert_eq!(v1, v2);
        assert_eq!(c1, c2);
    }
}
