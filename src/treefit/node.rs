//! The decay-tree arena.
//!
//! A [`DecayTree`] owns every particle in the decay as a flat `Vec` of
//! nodes; mothers and daughters reference each other purely by [`NodeId`]
//! index. Building the tree is separate from fitting it: the builder methods
//! validate inputs eagerly, and [`finalize`](DecayTree::finalize) assigns
//! each node its slice of the global state vector.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::utils::matrix::check_covariance;
use crate::{FitError, FitResult, Float, Vec3};

/// Index of a node in its [`DecayTree`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub(crate) usize);

/// How strongly the interaction point constrains the production vertex.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum BeamspotDim {
    /// The interaction point is a free parameter.
    None,
    /// Constrain the transverse (x, y) coordinates only.
    Transverse,
    /// Constrain all three coordinates.
    Full,
}

impl BeamspotDim {
    /// Validate a raw dimension. Anything but 0, 2, or 3 is rejected before
    /// any fit machinery runs.
    pub fn from_dimension(dimension: usize) -> FitResult<Self> {
        match dimension {
            0 => Ok(Self::None),
            2 => Ok(Self::Transverse),
            3 => Ok(Self::Full),
            _ => Err(FitError::InconsistentConstraintDimension { dimension }),
        }
    }

    pub fn dimension(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Transverse => 2,
            Self::Full => 3,
        }
    }
}

/// Payload of a node; dispatch throughout the fitter is a `match` on this
/// tag.
#[derive(Clone, Debug)]
pub(crate) enum ParticleKind {
    Track {
        momentum: Vec3,
        mom_cov: DMatrix<Float>,
        position: Vec3,
        pos_cov: DMatrix<Float>,
        mass: Float,
        charge: Float,
    },
    Photon {
        momentum: Vec3,
        mom_cov: DMatrix<Float>,
    },
    Composite {
        mass: Float,
        /// Resonances decay where they are produced and share the mother's
        /// vertex parameters.
        resonance: bool,
    },
    InteractionPoint {
        position: Vec3,
        covariance: DMatrix<Float>,
        beamspot: BeamspotDim,
    },
}

#[derive(Clone, Debug)]
pub(crate) struct ParticleNode {
    pub kind: ParticleKind,
    pub mother: Option<NodeId>,
    pub daughters: Vec<NodeId>,
    pub mass_constrained: bool,
    pub conversion_constrained: bool,
    pub vertex_seed: Option<Vec3>,
    /// Offsets into the global state, assigned by `finalize`.
    pub pos_index: Option<usize>,
    pub tau_index: Option<usize>,
    pub mom_index: Option<usize>,
}

impl ParticleNode {
    fn new(kind: ParticleKind, mother: Option<NodeId>) -> Self {
        Self {
            kind,
            mother,
            daughters: Vec::new(),
            mass_constrained: false,
            conversion_constrained: false,
            vertex_seed: None,
            pos_index: None,
            tau_index: None,
            mom_index: None,
        }
    }

    /// Width of the momentum slice: composites carry the energy as a fourth
    /// parameter, measured leaves derive it from the mass hypothesis.
    pub fn mom_dim(&self) -> usize {
        match self.kind {
            ParticleKind::Composite { .. } => 4,
            _ => 3,
        }
    }

    pub fn mass_hypothesis(&self) -> Float {
        match &self.kind {
            ParticleKind::Track { mass, .. } => *mass,
            ParticleKind::Photon { .. } => 0.0,
            ParticleKind::Composite { mass, .. } => *mass,
            ParticleKind::InteractionPoint { .. } => 0.0,
        }
    }
}

/// A decay chain under construction.
#[derive(Clone, Debug, Default)]
pub struct DecayTree {
    pub(crate) nodes: Vec<ParticleNode>,
    pub(crate) root: Option<NodeId>,
    dim: Option<usize>,
}

impl DecayTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the interaction point as the root of the tree.
    pub fn add_interaction_point(
        &mut self,
        position: Vec3,
        covariance: DMatrix<Float>,
        dimension: usize,
    ) -> FitResult<NodeId> {
        let beamspot = BeamspotDim::from_dimension(dimension)?;
        check_covariance(&covariance, "interaction point")?;
        if covariance.nrows() != 3 {
            return Err(FitError::InvalidParameter(format!(
                "interaction point covariance must be 3x3, got {}x{}",
                covariance.nrows(),
                covariance.ncols()
            )));
        }
        self.attach(
            ParticleKind::InteractionPoint {
                position,
                covariance,
                beamspot,
            },
            None,
        )
    }

    /// Add a decaying composite. With no mother it becomes the root.
    pub fn add_composite(&mut self, mother: Option<NodeId>, mass: Float) -> FitResult<NodeId> {
        if !(mass >= 0.0 && mass.is_finite()) {
            return Err(FitError::InvalidParameter(format!(
                "composite mass must be non-negative and finite, got {mass}"
            )));
        }
        self.attach(
            ParticleKind::Composite {
                mass,
                resonance: false,
            },
            mother,
        )
    }

    /// Add a resonance: a composite that decays where it is produced and
    /// shares its mother's vertex.
    pub fn add_resonance(&mut self, mother: NodeId, mass: Float) -> FitResult<NodeId> {
        if !(mass >= 0.0 && mass.is_finite()) {
            return Err(FitError::InvalidParameter(format!(
                "resonance mass must be non-negative and finite, got {mass}"
            )));
        }
        self.attach(
            ParticleKind::Composite {
                mass,
                resonance: true,
            },
            Some(mother),
        )
    }

    /// Add a charged-track leaf with measured momentum and a measured point
    /// on the trajectory, each with a 3x3 covariance.
    #[allow(clippy::too_many_arguments)]
    pub fn add_track(
        &mut self,
        mother: NodeId,
        momentum: Vec3,
        mom_cov: DMatrix<Float>,
        position: Vec3,
        pos_cov: DMatrix<Float>,
        mass: Float,
        charge: Float,
    ) -> FitResult<NodeId> {
        check_covariance(&mom_cov, "track momentum")?;
        check_covariance(&pos_cov, "track position")?;
        if mom_cov.nrows() != 3 || pos_cov.nrows() != 3 {
            return Err(FitError::InvalidParameter(
                "track covariances must be 3x3".to_string(),
            ));
        }
        if !(mass >= 0.0 && mass.is_finite()) {
            return Err(FitError::InvalidParameter(format!(
                "track mass must be non-negative and finite, got {mass}"
            )));
        }
        self.attach(
            ParticleKind::Track {
                momentum,
                mom_cov,
                position,
                pos_cov,
                mass,
                charge,
            },
            Some(mother),
        )
    }

    /// Add a photon leaf with measured momentum and its 3x3 covariance.
    pub fn add_photon(
        &mut self,
        mother: NodeId,
        momentum: Vec3,
        mom_cov: DMatrix<Float>,
    ) -> FitResult<NodeId> {
        check_covariance(&mom_cov, "photon momentum")?;
        if mom_cov.nrows() != 3 {
            return Err(FitError::InvalidParameter(
                "photon covariance must be 3x3".to_string(),
            ));
        }
        self.attach(ParticleKind::Photon { momentum, mom_cov }, Some(mother))
    }

    /// Constrain a composite to its nominal mass during the fit.
    pub fn set_mass_constraint(&mut self, node: NodeId) -> FitResult<()> {
        let node_ref = self.node_mut(node)?;
        match node_ref.kind {
            ParticleKind::Composite { .. } => {
                node_ref.mass_constrained = true;
                Ok(())
            }
            _ => Err(FitError::InvalidParameter(
                "mass constraints apply to composites only".to_string(),
            )),
        }
    }

    /// Constrain the two daughters of a composite to be collinear (photon
    /// conversion topology).
    pub fn set_conversion_constraint(&mut self, node: NodeId) -> FitResult<()> {
        let node_ref = self.node_mut(node)?;
        match node_ref.kind {
            ParticleKind::Composite { .. } => {
                node_ref.conversion_constrained = true;
                Ok(())
            }
            _ => Err(FitError::InvalidParameter(
                "conversion constraints apply to composites only".to_string(),
            )),
        }
    }

    /// Provide a starting vertex for a composite instead of the built-in
    /// seeding.
    pub fn set_vertex_seed(&mut self, node: NodeId, seed: Vec3) -> FitResult<()> {
        self.node_mut(node)?.vertex_seed = Some(seed);
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn attach(&mut self, kind: ParticleKind, mother: Option<NodeId>) -> FitResult<NodeId> {
        match mother {
            None => {
                if self.root.is_some() {
                    return Err(FitError::PreconditionViolation(
                        "tree already has a root".to_string(),
                    ));
                }
            }
            Some(id) => {
                let mother_node = self.node(id)?;
                if matches!(
                    mother_node.kind,
                    ParticleKind::Track { .. } | ParticleKind::Photon { .. }
                ) {
                    return Err(FitError::InvalidParameter(
                        "measured leaves cannot have daughters".to_string(),
                    ));
                }
            }
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(ParticleNode::new(kind, mother));
        match mother {
            None => self.root = Some(id),
            Some(m) => self.nodes[m.0].daughters.push(id),
        }
        self.dim = None;
        Ok(id)
    }

    pub(crate) fn node(&self, id: NodeId) -> FitResult<&ParticleNode> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| FitError::InvalidParameter(format!("unknown node id {}", id.0)))
    }

    fn node_mut(&mut self, id: NodeId) -> FitResult<&mut ParticleNode> {
        self.nodes
            .get_mut(id.0)
            .ok_or_else(|| FitError::InvalidParameter(format!("unknown node id {}", id.0)))
    }

    /// Depth of a node below the root.
    pub(crate) fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut current = self.nodes[id.0].mother;
        while let Some(m) = current {
            depth += 1;
            current = self.nodes[m.0].mother;
        }
        depth
    }

    /// Assign every node its slice of the state vector and return the total
    /// state dimension. Walks depth-first from the root so a mother's
    /// parameters always precede its daughters'.
    pub(crate) fn finalize(&mut self) -> FitResult<usize> {
        let root = self.root.ok_or_else(|| {
            FitError::PreconditionViolation("decay tree has no root".to_string())
        })?;
        for node in &mut self.nodes {
            node.pos_index = None;
            node.tau_index = None;
            node.mom_index = None;
        }
        let mut next = 0usize;
        self.allocate(root, &mut next)?;
        self.validate()?;
        self.dim = Some(next);
        Ok(next)
    }

    pub(crate) fn dim(&self) -> FitResult<usize> {
        self.dim.ok_or_else(|| {
            FitError::PreconditionViolation("decay tree has not been finalized".to_string())
        })
    }

    fn allocate(&mut self, id: NodeId, next: &mut usize) -> FitResult<()> {
        let (mother, is_resonance, needs_pos, mom_dim) = {
            let node = &self.nodes[id.0];
            let is_resonance = matches!(
                node.kind,
                ParticleKind::Composite { resonance: true, .. }
            );
            let needs_pos = matches!(
                node.kind,
                ParticleKind::Composite { resonance: false, .. }
                    | ParticleKind::InteractionPoint { .. }
            );
            (node.mother, is_resonance, needs_pos, node.mom_dim())
        };

        if needs_pos {
            self.nodes[id.0].pos_index = Some(*next);
            *next += 3;
        } else if is_resonance {
            let mother_id = mother.ok_or_else(|| {
                FitError::PreconditionViolation("resonance without a mother".to_string())
            })?;
            let mother_pos = self.nodes[mother_id.0].pos_index.ok_or_else(|| {
                FitError::PreconditionViolation(
                    "resonance mother carries no vertex".to_string(),
                )
            })?;
            self.nodes[id.0].pos_index = Some(mother_pos);
        }

        let is_composite = matches!(self.nodes[id.0].kind, ParticleKind::Composite { .. });
        if is_composite {
            if mother.is_some() && !is_resonance {
                self.nodes[id.0].tau_index = Some(*next);
                *next += 1;
            }
            self.nodes[id.0].mom_index = Some(*next);
            *next += mom_dim;
        } else if matches!(
            self.nodes[id.0].kind,
            ParticleKind::Track { .. } | ParticleKind::Photon { .. }
        ) {
            self.nodes[id.0].mom_index = Some(*next);
            *next += 3;
        }

        let daughters = self.nodes[id.0].daughters.clone();
        for daughter in daughters {
            self.allocate(daughter, next)?;
        }
        Ok(())
    }

    fn validate(&self) -> FitResult<()> {
        for (i, node) in self.nodes.iter().enumerate() {
            match &node.kind {
                ParticleKind::Composite { .. } => {
                    if node.daughters.is_empty() {
                        return Err(FitError::PreconditionViolation(format!(
                            "composite node {i} has no daughters"
                        )));
                    }
                    if node.conversion_constrained && node.daughters.len() != 2 {
                        return Err(FitError::PreconditionViolation(format!(
                            "conversion constraint on node {i} needs exactly 2 daughters"
                        )));
                    }
                }
                ParticleKind::InteractionPoint { .. } => {
                    if node.mother.is_some() {
                        return Err(FitError::PreconditionViolation(
                            "interaction point must be the root".to_string(),
                        ));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    fn cov3() -> DMatrix<Float> {
        DMatrix::identity(3, 3) * 1e-4
    }

    fn two_track_tree() -> (DecayTree, NodeId) {
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
            Vec3::new(-1.0, 0.0, 0.0),
            cov3(),
            Vec3::new(-0.5, 0.0, 0.0),
            cov3(),
            0.0,
            0.0,
        )
        .unwrap();
        (tree, root)
    }

    #[test]
    fn beamspot_dimension_one_fails_fast() {
        let mut tree = DecayTree::new();
        assert_eq!(
            tree.add_interaction_point(Vec3::default(), cov3(), 1),
            Err(FitError::InconsistentConstraintDimension { dimension: 1 })
        );
        assert_eq!(tree.node_count(), 0);
    }

    #[test]
    fn index_allocation_is_disjoint() {
        let (mut tree, root) = two_track_tree();
        let dim = tree.finalize().unwrap();
        // root: pos(3) + mom(4); two tracks: mom(3) each
        assert_eq!(dim, 13);
        let root_node = tree.node(root).unwrap();
        assert_eq!(root_node.pos_index, Some(0));
        assert_eq!(root_node.tau_index, None);
        assert_eq!(root_node.mom_index, Some(3));
        let d0 = tree.node(root_node.daughters[0]).unwrap();
        let d1 = tree.node(root_node.daughters[1]).unwrap();
        assert_eq!(d0.mom_index, Some(7));
        assert_eq!(d1.mom_index, Some(10));
    }

    #[test]
    fn cascade_gets_tau() {
        let (mut tree, root) = two_track_tree();
        let dau = tree.add_composite(Some(root), 1.0).unwrap();
        tree.add_photon(dau, Vec3::new(0.0, 0.0, 1.0), cov3())
            .unwrap();
        tree.add_photon(dau, Vec3::new(0.0, 0.0, -1.0), cov3())
            .unwrap();
        tree.finalize().unwrap();
        let dau_node = tree.node(dau).unwrap();
        assert!(dau_node.tau_index.is_some());
        assert!(dau_node.pos_index.is_some());
        assert_eq!(tree.depth(dau), 1);
        assert_eq!(tree.depth(dau_node.daughters[0]), 2);
    }

    #[test]
    fn resonance_shares_mother_vertex() {
        let (mut tree, root) = two_track_tree();
        let res = tree.add_resonance(root, 1.0).unwrap();
        tree.add_photon(res, Vec3::new(0.0, 0.0, 1.0), cov3())
            .unwrap();
        tree.finalize().unwrap();
        let root_pos = tree.node(root).unwrap().pos_index;
        let res_node = tree.node(res).unwrap();
        assert_eq!(res_node.pos_index, root_pos);
        assert_eq!(res_node.tau_index, None);
    }

    #[test]
    fn leaves_cannot_have_daughters() {
        let (mut tree, root) = two_track_tree();
        let leaf = tree.node(root).unwrap().daughters[0];
        assert!(matches!(
            tree.add_photon(leaf, Vec3::new(1.0, 0.0, 0.0), cov3()),
            Err(FitError::InvalidParameter(_))
        ));
    }

    #[test]
    fn second_root_is_rejected() {
        let (mut tree, _) = two_track_tree();
        assert!(matches!(
            tree.add_composite(None, 1.0),
            Err(FitError::PreconditionViolation(_))
        ));
    }

    #[test]
    fn childless_composite_fails_validation() {
        let mut tree = DecayTree::new();
        let root = tree.add_composite(None, 1.0).unwrap();
        tree.add_composite(Some(root), 0.5).unwrap();
        assert!(matches!(
            tree.finalize(),
            Err(FitError::PreconditionViolation(_))
        ));
    }

    #[test]
    fn mass_constraint_on_track_is_rejected() {
        let (mut tree, root) = two_track_tree();
        let leaf = tree.node(root).unwrap().daughters[0];
        assert!(tree.set_mass_constraint(leaf).is_err());
        assert!(tree.set_mass_constraint(root).is_ok());
    }
}
