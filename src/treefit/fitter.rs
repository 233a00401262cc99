//! The decay-tree fitter driver.
//!
//! [`TreeFitter`] takes a built [`DecayTree`], lays the whole chain out as
//! one global parameter vector, and iterates a Kalman filter over the
//! gathered constraints until the total chi-square settles. Each sweep
//! restarts from an inflated covariance so earlier linearization points do
//! not over-commit the state.

use nalgebra::DMatrix;
use tracing::{debug, warn};

use crate::treefit::constraint::{four_momentum, gather, Constraint};
use crate::treefit::kalman;
use crate::treefit::node::{DecayTree, NodeId, ParticleKind};
use crate::treefit::params::FitParams;
use crate::treefit::TreeFitConfig;
use crate::utils::vectors::{Vec3, Vec4};
use crate::{ErrorAccumulator, FitError, FitResult, Float};

/// Lifecycle of a [`TreeFitter`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FitStatus {
    /// Tree accepted, fit not yet run.
    Built,
    /// The fit converged; results are available.
    Converged,
    /// The fit ran but did not converge, or an update failed.
    Failed,
}

/// Global least-squares fit of a whole decay chain.
pub struct TreeFitter {
    config: TreeFitConfig,
    tree: DecayTree,
    constraints: Vec<Constraint>,
    params: Option<FitParams>,
    status: FitStatus,
    ndf: usize,
    iterations: usize,
    chi_square_history: Vec<Float>,
}

impl TreeFitter {
    pub fn new(tree: DecayTree, config: TreeFitConfig) -> Self {
        Self {
            config,
            tree,
            constraints: Vec::new(),
            params: None,
            status: FitStatus::Built,
            ndf: 0,
            iterations: 0,
            chi_square_history: Vec::new(),
        }
    }

    pub fn status(&self) -> FitStatus {
        self.status
    }

    /// Run the fit. On success the status is [`FitStatus::Converged`] and
    /// the result getters become available.
    pub fn fit(&mut self) -> FitResult<()> {
        self.status = FitStatus::Built;
        self.params = None;
        self.chi_square_history.clear();

        let result = self.run();
        if result.is_err() {
            self.status = FitStatus::Failed;
        }
        result
    }

    fn run(&mut self) -> FitResult<()> {
        let dim = self.tree.finalize()?;
        self.constraints = gather(&self.tree)?;
        let constrained: usize = self.constraints.iter().map(|c| c.dim).sum();
        if constrained <= dim {
            return Err(FitError::PreconditionViolation(format!(
                "underconstrained tree: {constrained} constraint rows for {dim} parameters"
            )));
        }
        self.ndf = constrained - dim;

        let mut params = self.seed_state()?;
        let mut previous = Float::INFINITY;
        let threshold = self.config.tolerance * self.ndf.max(1) as Float;
        let mut converged = false;

        for iteration in 0..self.config.max_iterations {
            seed_covariance(&mut params, &self.tree, &self.config)?;
            params.chi_square = 0.0;

            for constraint in &self.constraints {
                let projection = constraint.project(&self.tree, &params, &self.config)?;
                kalman::filter(&mut params, &projection)?;
            }

            let chi_square = params.chi_square;
            self.chi_square_history.push(chi_square);
            self.iterations = iteration + 1;
            debug!(iteration, chi_square, "tree fit sweep");

            if (previous - chi_square).abs() < threshold {
                converged = true;
                break;
            }
            previous = chi_square;
        }

        self.params = Some(params);
        if !converged {
            warn!(
                max_iterations = self.config.max_iterations,
                "tree fit did not converge"
            );
            return Err(FitError::NonConvergence {
                max_iterations: self.config.max_iterations,
            });
        }
        self.status = FitStatus::Converged;
        Ok(())
    }

    /// First guesses for every parameter. Vertices are filled mother-first
    /// so a daughter can fall back on its mother's seed; momenta are filled
    /// daughter-first so a composite can sum its daughters.
    fn seed_state(&self) -> FitResult<FitParams> {
        let dim = self.tree.dim()?;
        let mut params = FitParams::new(dim);
        let mut errors = ErrorAccumulator::new();

        for i in 0..self.tree.nodes.len() {
            errors.record(self.seed_vertex(NodeId(i), &mut params));
        }
        for i in (0..self.tree.nodes.len()).rev() {
            errors.record(self.seed_momentum(NodeId(i), &mut params));
        }
        errors.into_result()?;
        Ok(params)
    }

    fn seed_vertex(&self, id: NodeId, params: &mut FitParams) -> FitResult<()> {
        let node = self.tree.node(id)?;
        let Some(pos) = node.pos_index else {
            return Ok(());
        };
        if let Some(tau) = node.tau_index {
            params.par[tau] = 0.0;
        }
        match &node.kind {
            ParticleKind::InteractionPoint { position, .. } => {
                params.set_triple(pos, [position.x(), position.y(), position.z()]);
                Ok(())
            }
            ParticleKind::Composite { resonance, .. } => {
                if *resonance {
                    // Shares the mother's slice, already seeded.
                    return Ok(());
                }
                if let Some(seed) = node.vertex_seed {
                    params.set_triple(pos, [seed.x(), seed.y(), seed.z()]);
                    return Ok(());
                }
                let mut sum = [0.0; 3];
                let mut count = 0usize;
                for &daughter in &node.daughters {
                    if let ParticleKind::Track { position, .. } = &self.tree.node(daughter)?.kind {
                        sum[0] += position.x();
                        sum[1] += position.y();
                        sum[2] += position.z();
                        count += 1;
                    }
                }
                if count > 0 {
                    params.set_triple(pos, sum.map(|s| s / count as Float));
                    return Ok(());
                }
                if let Some(mother) = node.mother {
                    let mother_pos = self.tree.node(mother)?.pos_index.ok_or_else(|| {
                        FitError::PreconditionViolation(
                            "mother carries no vertex to seed from".to_string(),
                        )
                    })?;
                    params.set_triple(pos, params.triple(mother_pos));
                    return Ok(());
                }
                Err(FitError::PreconditionViolation(format!(
                    "no vertex seed for node {}: no track daughters, no mother, none supplied",
                    id.0
                )))
            }
            _ => Ok(()),
        }
    }

    fn seed_momentum(&self, id: NodeId, params: &mut FitParams) -> FitResult<()> {
        let node = self.tree.node(id)?;
        let Some(idx) = node.mom_index else {
            return Ok(());
        };
        match &node.kind {
            ParticleKind::Track { momentum, .. } | ParticleKind::Photon { momentum, .. } => {
                params.set_triple(idx, [momentum.x(), momentum.y(), momentum.z()]);
            }
            ParticleKind::Composite { .. } => {
                let mut sum = [0.0; 4];
                for &daughter in &node.daughters {
                    let (px, py, pz, e) = four_momentum(&self.tree, daughter, params)?;
                    sum[0] += px;
                    sum[1] += py;
                    sum[2] += pz;
                    sum[3] += e;
                }
                params.set_triple(idx, [sum[0], sum[1], sum[2]]);
                params.par[idx + 3] = sum[3];
            }
            ParticleKind::InteractionPoint { .. } => {}
        }
        Ok(())
    }

    fn fitted(&self) -> FitResult<&FitParams> {
        if self.status != FitStatus::Converged {
            return Err(FitError::PreconditionViolation(
                "fit has not converged".to_string(),
            ));
        }
        self.params.as_ref().ok_or_else(|| {
            FitError::PreconditionViolation("fit has not been run".to_string())
        })
    }

    pub fn chi_square(&self) -> FitResult<Float> {
        Ok(self.fitted()?.chi_square)
    }

    pub fn ndf(&self) -> FitResult<usize> {
        self.fitted()?;
        Ok(self.ndf)
    }

    /// Number of Kalman sweeps actually run.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Fitted decay vertex of a composite or interaction point.
    pub fn vertex(&self, node: NodeId) -> FitResult<Vec3> {
        let params = self.fitted()?;
        let pos = self.tree.node(node)?.pos_index.ok_or_else(|| {
            FitError::PreconditionViolation(format!("node {} carries no vertex", node.0))
        })?;
        let [x, y, z] = params.triple(pos);
        Ok(Vec3::new(x, y, z))
    }

    /// Fitted four-momentum of any particle in the tree.
    pub fn momentum(&self, node: NodeId) -> FitResult<Vec4> {
        let params = self.fitted()?;
        let (px, py, pz, e) = four_momentum(&self.tree, node, params)?;
        Ok(Vec4::new(px, py, pz, e))
    }

    /// Fitted decay length of a composite below its production vertex.
    pub fn decay_length(&self, node: NodeId) -> FitResult<Float> {
        let params = self.fitted()?;
        let tau = self.tree.node(node)?.tau_index.ok_or_else(|| {
            FitError::PreconditionViolation(format!("node {} carries no decay length", node.0))
        })?;
        Ok(params.par[tau])
    }

    /// 3x3 covariance of a fitted vertex.
    pub fn vertex_covariance(&self, node: NodeId) -> FitResult<DMatrix<Float>> {
        let params = self.fitted()?;
        let pos = self.tree.node(node)?.pos_index.ok_or_else(|| {
            FitError::PreconditionViolation(format!("node {} carries no vertex", node.0))
        })?;
        Ok(params.cov.view((pos, pos), (3, 3)).into_owned())
    }

    /// Covariance of a fitted momentum slice (3x3 for leaves, 4x4 for
    /// composites).
    pub fn momentum_covariance(&self, node: NodeId) -> FitResult<DMatrix<Float>> {
        let params = self.fitted()?;
        let node_ref = self.tree.node(node)?;
        let idx = node_ref.mom_index.ok_or_else(|| {
            FitError::PreconditionViolation(format!("node {} carries no momentum", node.0))
        })?;
        let w = node_ref.mom_dim();
        Ok(params.cov.view((idx, idx), (w, w)).into_owned())
    }

    #[cfg(test)]
    pub(crate) fn chi_square_history(&self) -> &[Float] {
        &self.chi_square_history
    }
}

/// Reset the covariance for a sweep: a broad diagonal everywhere, and the
/// interaction-point block inflated from its measured covariance so the
/// beamspot keeps its shape.
fn seed_covariance(
    params: &mut FitParams,
    tree: &DecayTree,
    config: &TreeFitConfig,
) -> FitResult<()> {
    let dim = params.dim();
    params.cov = DMatrix::identity(dim, dim) * config.covariance_inflation;
    for node in &tree.nodes {
        if let ParticleKind::InteractionPoint { covariance, .. } = &node.kind {
            if let Some(pos) = node.pos_index {
                let block = covariance * config.covariance_inflation;
                params.cov.view_mut((pos, pos), (3, 3)).copy_from(&block);
            }
        }
    }
    Ok(())
}
