//! Tree branches.
//!
//! A branch is one node of the hashed tree, keyed by a Morton prefix.
//! Leaves hold indices into the tree's entity arena; interior branches
//! hold only aggregates. Mutations record a requested action that the
//! tree executes after the call, so a branch never reshapes the tree on
//! its own.

use crate::geometry::Coord;
use crate::morton::MortonKey;

/// Action a branch requests from the tree after a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do.
    None,
    /// The leaf exceeded its capacity and wants to be split.
    Refine,
    /// The leaf dropped below the coarsening threshold.
    Coarsen,
}

/// One node of the hashed tree.
pub struct Branch {
    key: MortonKey,
    leaf: bool,
    entities: Vec<usize>,
    mass: f64,
    coordinates: Coord,
    bmin: Coord,
    bmax: Coord,
    sub_entities: u64,
    action: Action,
}

impl Branch {
    /// Create an empty leaf at the given key.
    pub fn new(key: MortonKey) -> Self {
        Self {
            key,
            leaf: true,
            entities: Vec::new(),
            mass: 0.0,
            coordinates: [0.0; crate::constants::DIMENSION],
            bmin: [f64::MAX; crate::constants::DIMENSION],
            bmax: [f64::MIN; crate::constants::DIMENSION],
            sub_entities: 0,
            action: Action::None,
        }
    }

    /// The branch key.
    pub fn key(&self) -> MortonKey {
        self.key
    }

    /// Depth of the branch key.
    pub fn depth(&self) -> u32 {
        self.key.depth()
    }

    /// Whether the branch is a leaf.
    pub fn is_leaf(&self) -> bool {
        self.leaf
    }

    /// Entity arena indices attached to this leaf.
    pub fn entities(&self) -> &[usize] {
        &self.entities
    }

    /// Append an entity. Requests a refine once the leaf holds more
    /// than `max_leaf_size` entities.
    pub fn insert(&mut self, entity: usize, max_leaf_size: usize) {
        debug_assert!(self.leaf);
        self.entities.push(entity);
        if self.entities.len() > max_leaf_size {
            self.action = Action::Refine;
        }
    }

    /// Remove an entity. Requests a coarsen once the leaf drops below
    /// `coarsen_threshold` entities.
    pub fn remove(&mut self, entity: usize, coarsen_threshold: usize) {
        debug_assert!(self.leaf);
        let pos = self
            .entities
            .iter()
            .position(|&e| e == entity)
            .expect("entity not attached to this branch");
        self.entities.swap_remove(pos);
        if self.entities.len() < coarsen_threshold {
            self.action = Action::Coarsen;
        }
    }

    /// The action requested by the last mutation.
    pub fn requested_action(&self) -> Action {
        self.action
    }

    /// Clear the requested action.
    pub fn reset(&mut self) {
        self.action = Action::None;
    }

    /// Turn the branch into an interior node, dropping its entity list.
    pub fn into_interior(&mut self) {
        self.leaf = false;
        self.entities.clear();
        self.action = Action::None;
    }

    /// Turn the branch back into a leaf holding `entities`.
    pub fn into_leaf(&mut self, entities: Vec<usize>) {
        self.leaf = true;
        self.entities = entities;
        self.action = Action::None;
    }

    /// Aggregated mass.
    pub fn mass(&self) -> f64 {
        self.mass
    }

    /// Aggregated center of mass.
    pub fn coordinates(&self) -> Coord {
        self.coordinates
    }

    /// Minimum corner of the bounding box (with the ε halo applied by
    /// the post-order update).
    pub fn bmin(&self) -> Coord {
        self.bmin
    }

    /// Maximum corner of the bounding box.
    pub fn bmax(&self) -> Coord {
        self.bmax
    }

    /// Number of entities below this branch, remote summaries included.
    pub fn sub_entities(&self) -> u64 {
        self.sub_entities
    }

    pub(crate) fn set_aggregates(
        &mut self,
        mass: f64,
        coordinates: Coord,
        bmin: Coord,
        bmax: Coord,
        sub_entities: u64,
    ) {
        self.mass = mass;
        self.coordinates = coordinates;
        self.bmin = bmin;
        self.bmax = bmax;
        self.sub_entities = sub_entities;
    }

    pub(crate) fn take_entities(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.entities)
    }
}
