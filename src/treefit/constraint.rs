//! Constraint gathering and projection.
//!
//! Every relation between fit parameters (and between parameters and
//! measurements) is expressed as a residual `r` with Jacobian `H` against the
//! global state and measurement covariance `V`. The Kalman filter consumes
//! them one at a time, deepest particles first so daughter kinematics are
//! settled before they feed their mothers.

use nalgebra::{DMatrix, DVector};

use crate::kfit::vertex::make_core_matrix;
use crate::treefit::node::{BeamspotDim, DecayTree, NodeId, ParticleKind};
use crate::treefit::params::FitParams;
use crate::treefit::TreeFitConfig;
use crate::{FitError, FitResult, Float};

/// One projected constraint, ready for a Kalman update.
pub(crate) struct Projection {
    pub r: DVector<Float>,
    pub h: DMatrix<Float>,
    pub v: DMatrix<Float>,
}

/// Constraint flavours in application order within one depth level.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum ConstraintKind {
    Measurement,
    Beamspot,
    Conversion,
    Kinematic,
    Geometric,
    Mass,
}

#[derive(Clone, Debug)]
pub(crate) struct Constraint {
    pub node: NodeId,
    pub kind: ConstraintKind,
    pub dim: usize,
    pub depth: usize,
}

/// Collect the constraint list for a finalized tree.
pub(crate) fn gather(tree: &DecayTree) -> FitResult<Vec<Constraint>> {
    let mut constraints = Vec::new();
    for (i, node) in tree.nodes.iter().enumerate() {
        let id = NodeId(i);
        let depth = tree.depth(id);
        let mut push = |kind, dim| {
            constraints.push(Constraint {
                node: id,
                kind,
                dim,
                depth,
            })
        };
        match &node.kind {
            ParticleKind::Track { .. } => push(ConstraintKind::Measurement, 5),
            ParticleKind::Photon { .. } => push(ConstraintKind::Measurement, 3),
            ParticleKind::InteractionPoint { beamspot, .. } => {
                if *beamspot != BeamspotDim::None {
                    push(ConstraintKind::Beamspot, beamspot.dimension());
                }
            }
            ParticleKind::Composite { .. } => {
                if node.conversion_constrained {
                    push(ConstraintKind::Conversion, 1);
                }
                push(ConstraintKind::Kinematic, 4);
                if node.tau_index.is_some() {
                    push(ConstraintKind::Geometric, 3);
                }
                if node.mass_constrained {
                    push(ConstraintKind::Mass, 1);
                }
            }
        }
    }
    // Deepest first, then by kind within one level.
    constraints.sort_by(|a, b| b.depth.cmp(&a.depth).then(a.kind.cmp(&b.kind)));
    Ok(constraints)
}

impl Constraint {
    pub fn project(
        &self,
        tree: &DecayTree,
        params: &FitParams,
        config: &TreeFitConfig,
    ) -> FitResult<Projection> {
        match self.kind {
            ConstraintKind::Measurement => project_measurement(tree, self.node, params, config),
            ConstraintKind::Beamspot => project_beamspot(tree, self.node, params),
            ConstraintKind::Kinematic => project_kinematic(tree, self.node, params),
            ConstraintKind::Geometric => project_geometric(tree, self.node, params),
            ConstraintKind::Mass => project_mass(tree, self.node, params),
            ConstraintKind::Conversion => project_conversion(tree, self.node, params),
        }
    }
}

fn mom_index(tree: &DecayTree, id: NodeId) -> FitResult<usize> {
    tree.node(id)?.mom_index.ok_or_else(|| {
        FitError::PreconditionViolation(format!("node {} carries no momentum", id.0))
    })
}

fn pos_index(tree: &DecayTree, id: NodeId) -> FitResult<usize> {
    tree.node(id)?.pos_index.ok_or_else(|| {
        FitError::PreconditionViolation(format!("node {} carries no vertex", id.0))
    })
}

/// Fitted four-momentum of any node, deriving the energy from the mass
/// hypothesis for three-parameter leaves.
pub(crate) fn four_momentum(
    tree: &DecayTree,
    id: NodeId,
    params: &FitParams,
) -> FitResult<(Float, Float, Float, Float)> {
    let node = tree.node(id)?;
    let idx = mom_index(tree, id)?;
    let (px, py, pz) = (params.par[idx], params.par[idx + 1], params.par[idx + 2]);
    let e = if node.mom_dim() == 4 {
        params.par[idx + 3]
    } else {
        let m = node.mass_hypothesis();
        (px * px + py * py + pz * pz + m * m).sqrt()
    };
    Ok((px, py, pz, e))
}

/// Leaf measurement: three momentum residuals, plus for charged tracks the
/// two vertex rows tying the measured trajectory point to the mother vertex.
fn project_measurement(
    tree: &DecayTree,
    id: NodeId,
    params: &FitParams,
    config: &TreeFitConfig,
) -> FitResult<Projection> {
    let node = tree.node(id)?;
    let dim = params.dim();
    let idx = mom_index(tree, id)?;

    let (meas, mom_cov, position, pos_cov, charge) = match &node.kind {
        ParticleKind::Track {
            momentum,
            mom_cov,
            position,
            pos_cov,
            charge,
            ..
        } => (*momentum, mom_cov, Some(*position), Some(pos_cov), *charge),
        ParticleKind::Photon { momentum, mom_cov } => (*momentum, mom_cov, None, None, 0.0),
        _ => {
            return Err(FitError::PreconditionViolation(
                "measurement constraint on a non-leaf".to_string(),
            ))
        }
    };

    let nrows = if position.is_some() { 5 } else { 3 };
    let mut r = DVector::zeros(nrows);
    let mut h = DMatrix::zeros(nrows, dim);
    let mut v = DMatrix::zeros(nrows, nrows);

    let meas = [meas.x(), meas.y(), meas.z()];
    for k in 0..3 {
        r[k] = params.par[idx + k] - meas[k];
        h[(k, idx + k)] = 1.0;
    }
    v.view_mut((0, 0), (3, 3)).copy_from(mom_cov);

    if let (Some(point), Some(pos_cov)) = (position, pos_cov) {
        let mother = node.mother.ok_or_else(|| {
            FitError::PreconditionViolation("track leaf without a mother".to_string())
        })?;
        let vtx_idx = pos_index(tree, mother)?;
        let a = config.curvature(charge);

        // Evaluate the helix rows at the fitted momentum, the measured
        // trajectory point, and the fitted mother vertex.
        let point = [point.x(), point.y(), point.z()];
        let mut al1 = DVector::zeros(6);
        for k in 0..3 {
            al1[k] = params.par[idx + k];
            al1[3 + k] = point[k];
        }
        let v_a = DVector::from_column_slice(&[
            params.par[vtx_idx],
            params.par[vtx_idx + 1],
            params.par[vtx_idx + 2],
        ]);
        let core = make_core_matrix(&al1, &v_a, &[a], &[6])?;

        for row in 0..2 {
            r[3 + row] = core.d[row];
            for k in 0..3 {
                h[(3 + row, idx + k)] = core.dmat[(row, k)];
                h[(3 + row, vtx_idx + k)] = core.emat[(row, k)];
            }
        }
        // Position-measurement noise folded through the position columns.
        let j = core.dmat.view((0, 3), (2, 3)).into_owned();
        let noise = &j * pos_cov * j.transpose();
        v.view_mut((3, 3), (2, 2)).copy_from(&noise);
    }

    Ok(Projection { r, h, v })
}

fn project_beamspot(tree: &DecayTree, id: NodeId, params: &FitParams) -> FitResult<Projection> {
    let node = tree.node(id)?;
    let (position, covariance, beamspot) = match &node.kind {
        ParticleKind::InteractionPoint {
            position,
            covariance,
            beamspot,
        } => (position, covariance, beamspot),
        _ => {
            return Err(FitError::PreconditionViolation(
                "beamspot constraint on a non-interaction-point".to_string(),
            ))
        }
    };
    let n = beamspot.dimension();
    let idx = pos_index(tree, id)?;
    let position = [position.x(), position.y(), position.z()];
    let mut r = DVector::zeros(n);
    let mut h = DMatrix::zeros(n, params.dim());
    for k in 0..n {
        r[k] = params.par[idx + k] - position[k];
        h[(k, idx + k)] = 1.0;
    }
    let v = covariance.view((0, 0), (n, n)).into_owned();
    Ok(Projection { r, h, v })
}

/// Four-momentum conservation at a composite decay vertex.
fn project_kinematic(tree: &DecayTree, id: NodeId, params: &FitParams) -> FitResult<Projection> {
    let node = tree.node(id)?;
    let dim = params.dim();
    let idx = mom_index(tree, id)?;

    let mut r = DVector::zeros(4);
    let mut h = DMatrix::zeros(4, dim);
    for k in 0..4 {
        r[k] = params.par[idx + k];
        h[(k, idx + k)] = 1.0;
    }

    for &daughter in &node.daughters {
        let dau = tree.node(daughter)?;
        let d_idx = mom_index(tree, daughter)?;
        let (px, py, pz, e) = four_momentum(tree, daughter, params)?;
        r[0] -= px;
        r[1] -= py;
        r[2] -= pz;
        r[3] -= e;
        for k in 0..3 {
            h[(k, d_idx + k)] = -1.0;
        }
        if dau.mom_dim() == 4 {
            h[(3, d_idx + 3)] = -1.0;
        } else {
            // E = sqrt(|p|^2 + m^2), so dE/dp_j = p_j / E.
            if e <= 0.0 {
                return Err(FitError::NumericalFailure(format!(
                    "non-positive daughter energy {e} in kinematic constraint"
                )));
            }
            h[(3, d_idx)] = -px / e;
            h[(3, d_idx + 1)] = -py / e;
            h[(3, d_idx + 2)] = -pz / e;
        }
    }

    Ok(Projection {
        r,
        h,
        v: DMatrix::zeros(4, 4),
    })
}

/// Decay vertex lies on the flight line from the production vertex:
/// `x_dau - x_mot - tau * p / |p| = 0`.
fn project_geometric(tree: &DecayTree, id: NodeId, params: &FitParams) -> FitResult<Projection> {
    let node = tree.node(id)?;
    let dim = params.dim();
    let own_idx = pos_index(tree, id)?;
    let mother = node.mother.ok_or_else(|| {
        FitError::PreconditionViolation("geometric constraint on a motherless node".to_string())
    })?;
    let mot_idx = pos_index(tree, mother)?;
    let tau_idx = node.tau_index.ok_or_else(|| {
        FitError::PreconditionViolation("geometric constraint without a decay length".to_string())
    })?;
    let p_idx = mom_index(tree, id)?;

    let tau = params.par[tau_idx];
    let p = [
        params.par[p_idx],
        params.par[p_idx + 1],
        params.par[p_idx + 2],
    ];
    let mag2: Float = p.iter().map(|c| c * c).sum();
    let mag = mag2.sqrt();
    if mag <= 0.0 {
        return Err(FitError::NumericalFailure(
            "vanishing momentum in geometric constraint".to_string(),
        ));
    }

    let mut r = DVector::zeros(3);
    let mut h = DMatrix::zeros(3, dim);
    for k in 0..3 {
        r[k] = params.par[own_idx + k] - params.par[mot_idx + k] - tau * p[k] / mag;
        h[(k, own_idx + k)] = 1.0;
        h[(k, mot_idx + k)] = -1.0;
        h[(k, tau_idx)] = -p[k] / mag;
        for j in 0..3 {
            let delta = if j == k { 1.0 } else { 0.0 };
            h[(k, p_idx + j)] = -tau * (delta / mag - p[k] * p[j] / (mag2 * mag));
        }
    }

    Ok(Projection {
        r,
        h,
        v: DMatrix::zeros(3, 3),
    })
}

/// `E^2 - |p|^2 - m^2 = 0` for a mass-constrained composite.
fn project_mass(tree: &DecayTree, id: NodeId, params: &FitParams) -> FitResult<Projection> {
    let node = tree.node(id)?;
    let idx = mom_index(tree, id)?;
    let m = node.mass_hypothesis();
    let (px, py, pz, e) = (
        params.par[idx],
        params.par[idx + 1],
        params.par[idx + 2],
        params.par[idx + 3],
    );

    let mut r = DVector::zeros(1);
    r[0] = e * e - px * px - py * py - pz * pz - m * m;
    let mut h = DMatrix::zeros(1, params.dim());
    h[(0, idx)] = -2.0 * px;
    h[(0, idx + 1)] = -2.0 * py;
    h[(0, idx + 2)] = -2.0 * pz;
    h[(0, idx + 3)] = 2.0 * e;

    Ok(Projection {
        r,
        h,
        v: DMatrix::zeros(1, 1),
    })
}

/// Collinearity of the two conversion daughters:
/// `p1 . p2 - |p1||p2| = 0` vanishes exactly when the opening angle is zero.
fn project_conversion(tree: &DecayTree, id: NodeId, params: &FitParams) -> FitResult<Projection> {
    let node = tree.node(id)?;
    if node.daughters.len() != 2 {
        return Err(FitError::PreconditionViolation(
            "conversion constraint needs exactly 2 daughters".to_string(),
        ));
    }
    let ia = mom_index(tree, node.daughters[0])?;
    let ib = mom_index(tree, node.daughters[1])?;
    let pa = [params.par[ia], params.par[ia + 1], params.par[ia + 2]];
    let pb = [params.par[ib], params.par[ib + 1], params.par[ib + 2]];
    let ma = pa.iter().map(|c| c * c).sum::<Float>().sqrt();
    let mb = pb.iter().map(|c| c * c).sum::<Float>().sqrt();
    if ma <= 0.0 || mb <= 0.0 {
        return Err(FitError::NumericalFailure(
            "vanishing momentum in conversion constraint".to_string(),
        ));
    }

    let mut r = DVector::zeros(1);
    r[0] = pa[0] * pb[0] + pa[1] * pb[1] + pa[2] * pb[2] - ma * mb;
    let mut h = DMatrix::zeros(1, params.dim());
    for k in 0..3 {
        h[(0, ia + k)] = pb[k] - pa[k] * mb / ma;
        h[(0, ib + k)] = pa[k] - pb[k] * ma / mb;
    }

    Ok(Projection {
        r,
        h,
        v: DMatrix::zeros(1, 1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Vec3;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    fn cov3() -> DMatrix<Float> {
        DMatrix::identity(3, 3) * 1e-4
    }

    fn two_track_tree() -> DecayTree {
        let mut tree = DecayTree::new();
        let root = tree.add_composite(None, 2.0).unwrap();
        tree.add_track(
            root,
            Vec3::new(1.0, 0.0, 0.0),
            cov3(),
            Vec3::new(0.5, 0.0, 0.0),
            cov3(),
            0.0,
            0.0,
        )
        .unwrap();
        tree.add_track(
            root,
            Vec3::new(0.0, 1.0, 0.0),
            cov3(),
            Vec3::new(0.0, 0.5, 0.0),
            cov3(),
            0.0,
            0.0,
        )
        .unwrap();
        tree
    }

    fn seeded_params(tree: &DecayTree) -> FitParams {
        // Layout: root pos 0..3, root p4 3..7, track momenta 7..10 and 10..13.
        let mut params = FitParams::new(tree.dim().unwrap());
        params.par[3] = 1.0; // root px
        params.par[4] = 1.0; // root py
        params.par[6] = 2.0_f64.sqrt(); // root E
        params.par[7] = 1.0; // first track px
        params.par[11] = 1.0; // second track py
        params
    }

    #[test]
    fn ordering_is_deepest_first() {
        let mut tree = two_track_tree();
        let root = tree.root.unwrap();
        let dau = tree.add_composite(Some(root), 1.0).unwrap();
        tree.add_photon(dau, Vec3::new(0.0, 0.0, 1.0), cov3())
            .unwrap();
        tree.add_photon(dau, Vec3::new(0.0, 0.0, -1.0), cov3())
            .unwrap();
        tree.finalize().unwrap();
        let constraints = gather(&tree).unwrap();
        let depths: Vec<usize> = constraints.iter().map(|c| c.depth).collect();
        let mut sorted = depths.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(depths, sorted);
        // Within one level kinematics precede geometrics precede mass.
        let level1: Vec<ConstraintKind> = constraints
            .iter()
            .filter(|c| c.depth == 1 && c.kind != ConstraintKind::Measurement)
            .map(|c| c.kind)
            .collect();
        assert_eq!(
            level1,
            vec![ConstraintKind::Kinematic, ConstraintKind::Geometric]
        );
    }

    #[test]
    fn kinematic_residual_vanishes_for_balanced_state() {
        let mut tree = two_track_tree();
        tree.finalize().unwrap();
        let params = seeded_params(&tree);
        let proj = project_kinematic(&tree, tree.root.unwrap(), &params).unwrap();
        // Sum of two unit-momentum massless daughters: p = (1,1,0), E = 2.
        assert_relative_eq!(proj.r[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(proj.r[1], 0.0, epsilon = 1e-12);
        assert_relative_eq!(proj.r[3], 2.0_f64.sqrt() - 2.0, epsilon = 1e-12);
        // Energy row of a massless daughter is the unit direction.
        assert_relative_eq!(proj.h[(3, 7)], -1.0, epsilon = 1e-12);
    }

    #[test]
    fn mass_projection_matches_dispersion() {
        let mut tree = two_track_tree();
        let root = tree.root.unwrap();
        tree.set_mass_constraint(root).unwrap();
        tree.finalize().unwrap();
        let params = seeded_params(&tree);
        let proj = project_mass(&tree, root, &params).unwrap();
        // E = sqrt(2), |p|^2 = 2, m = 2: r = 2 - 2 - 4.
        assert_relative_eq!(proj.r[0], -4.0, epsilon = 1e-12);
        assert_relative_eq!(proj.h[(0, 6)], 2.0 * 2.0_f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn geometric_residual_for_displaced_vertex() {
        let mut tree = two_track_tree();
        let root = tree.root.unwrap();
        let dau = tree.add_composite(Some(root), 0.5).unwrap();
        tree.add_photon(dau, Vec3::new(0.0, 0.0, 1.0), cov3())
            .unwrap();
        tree.finalize().unwrap();
        let node = tree.node(dau).unwrap();
        let pos = node.pos_index.unwrap();
        let tau = node.tau_index.unwrap();
        let mom = node.mom_index.unwrap();
        let mut params = FitParams::new(tree.dim().unwrap());
        params.par[pos + 2] = 3.0;
        params.par[tau] = 2.0;
        params.par[mom + 2] = 5.0;
        let proj = project_geometric(&tree, dau, &params).unwrap();
        // Flight along +z: r_z = 3 - 0 - 2.
        assert_relative_eq!(proj.r[2], 1.0, epsilon = 1e-12);
        assert_relative_eq!(proj.h[(2, tau)], -1.0, epsilon = 1e-12);
        // Direction derivative vanishes along the momentum itself.
        assert_relative_eq!(proj.h[(2, mom + 2)], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn conversion_residual_is_zero_for_parallel_daughters() {
        let mut tree = DecayTree::new();
        let root = tree.add_composite(None, 0.0).unwrap();
        tree.set_conversion_constraint(root).unwrap();
        tree.add_track(
            root,
            Vec3::new(0.0, 0.0, 1.0),
            cov3(),
            Vec3::new(0.0, 0.0, 0.0),
            cov3(),
            0.000511,
            -1.0,
        )
        .unwrap();
        tree.add_track(
            root,
            Vec3::new(0.0, 0.0, 2.0),
            cov3(),
            Vec3::new(0.0, 0.0, 0.0),
            cov3(),
            0.000511,
            1.0,
        )
        .unwrap();
        tree.finalize().unwrap();
        let node = tree.node(root).unwrap();
        let ia = tree.node(node.daughters[0]).unwrap().mom_index.unwrap();
        let ib = tree.node(node.daughters[1]).unwrap().mom_index.unwrap();
        let mut params = FitParams::new(tree.dim().unwrap());
        params.par[ia + 2] = 1.0;
        params.par[ib + 2] = 2.0;
        let proj = project_conversion(&tree, root, &params).unwrap();
        assert_relative_eq!(proj.r[0], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn measurement_projection_covers_five_rows_for_tracks() {
        let mut tree = two_track_tree();
        tree.finalize().unwrap();
        let root = tree.root.unwrap();
        let leaf = tree.node(root).unwrap().daughters[0];
        let params = seeded_params(&tree);
        let config = TreeFitConfig::default();
        let proj = project_measurement(&tree, leaf, &params, &config).unwrap();
        assert_eq!(proj.r.len(), 5);
        assert_eq!(proj.v.nrows(), 5);
        // Momentum residual vanishes at the seed, momentum noise survives.
        assert_relative_eq!(proj.r[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(proj.v[(0, 0)], 1e-4, epsilon = 1e-15);
    }
}
