//! The local hashed tree.
//!
//! A hash map from Morton prefix to [`Branch`], owning an arena of tree
//! entities. The tree is rebuilt from the sorted particle set every
//! step: entities are inserted one by one, leaves refine when they
//! overflow the policy capacity and coarsen when removals drain them.
//!
//! Geometric queries come in two flavors, both specified by the search
//! strategies of the original engine: an iterative stack traversal over
//! the stored branch bounding boxes, and a recursive descent that first
//! prunes ancestors via [`Tree::find_start`]. Concurrent variants
//! partition the recursion at a queue depth derived from the worker
//! count and guard the shared result vector with a single mutex.
//!
//! All aggregate-dependent queries (`find_in_*`, the work-splitting
//! evaluator) read the mass, center-of-mass and bounding boxes written
//! by the last [`Tree::update_branches`] call.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;

use rayon::prelude::*;

use crate::body::{Body, Locality};
use crate::branch::{Action, Branch};
use crate::constants::{DEEPEST_LEVEL, DIMENSION, MAX_LEAF_SIZE, NCHILDREN};
use crate::geometry::{self, add_scaled, scale, Coord, DomainRange, ZERO};
use crate::morton::MortonKey;

/// The policy record configuring tree refinement.
#[derive(Clone, Copy, Debug)]
pub struct TreePolicy {
    /// Number of entities a leaf may hold before it is refined.
    pub max_leaf_size: usize,
    /// A parent whose subtree drops to this many entities is coarsened
    /// back into a leaf.
    pub coarsen_threshold: usize,
}

impl Default for TreePolicy {
    fn default() -> Self {
        Self {
            max_leaf_size: MAX_LEAF_SIZE,
            coarsen_threshold: MAX_LEAF_SIZE / 2,
        }
    }
}

/// Where the full state of a tree entity lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodySlot {
    /// Index into the rank's own body vector.
    Local(usize),
    /// Index into the ghost receive buffer.
    Ghost(usize),
    /// No backing state; position and mass only.
    None,
}

/// One entity of the tree: the position/mass record a branch refers to.
///
/// For owned particles this is a shadow of the corresponding [`Body`];
/// for remote summaries it is all the rank knows.
pub struct TreeEntity {
    key: MortonKey,
    global_id: u64,
    coordinates: Coord,
    mass: f64,
    owner: i32,
    locality: Locality,
    slot: BodySlot,
    branch: MortonKey,
}

impl TreeEntity {
    /// Deepest-level key of the entity's position.
    pub fn key(&self) -> MortonKey {
        self.key
    }

    /// Stable particle id.
    pub fn global_id(&self) -> u64 {
        self.global_id
    }

    /// Position.
    pub fn coordinates(&self) -> Coord {
        self.coordinates
    }

    /// Mass.
    pub fn mass(&self) -> f64 {
        self.mass
    }

    /// Rank owning the full particle state.
    pub fn owner(&self) -> i32 {
        self.owner
    }

    /// Locality tag.
    pub fn locality(&self) -> Locality {
        self.locality
    }

    /// Where the full state lives, if anywhere.
    pub fn slot(&self) -> BodySlot {
        self.slot
    }

    /// Key of the branch currently holding the entity.
    pub fn branch(&self) -> MortonKey {
        self.branch
    }

    /// True if this rank owns the entity.
    pub fn is_local(&self) -> bool {
        self.locality.is_local()
    }

    pub(crate) fn set_slot(&mut self, slot: BodySlot) {
        self.slot = slot;
    }

    pub(crate) fn set_locality(&mut self, locality: Locality) {
        self.locality = locality;
    }
}

/// The hashed Morton tree of one rank.
pub struct Tree {
    branches: HashMap<MortonKey, Branch>,
    entities: Vec<TreeEntity>,
    range: DomainRange,
    max_depth: u32,
    policy: TreePolicy,
}

impl Tree {
    /// Create an empty tree over the given key range. The root branch
    /// always exists.
    pub fn new(range: DomainRange, policy: TreePolicy) -> Self {
        let mut branches = HashMap::new();
        branches.insert(MortonKey::root(), Branch::new(MortonKey::root()));
        Self {
            branches,
            entities: Vec::new(),
            range,
            max_depth: 0,
            policy,
        }
    }

    /// The key range of the tree.
    pub fn range(&self) -> &DomainRange {
        &self.range
    }

    /// The refinement policy.
    pub fn policy(&self) -> TreePolicy {
        self.policy
    }

    /// Current deepest branch level.
    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Number of branches, root included.
    pub fn num_branches(&self) -> usize {
        self.branches.len()
    }

    /// The root branch.
    pub fn root(&self) -> &Branch {
        &self.branches[&MortonKey::root()]
    }

    /// Branch lookup.
    pub fn branch(&self, key: MortonKey) -> Option<&Branch> {
        self.branches.get(&key)
    }

    /// Branch lookup that must succeed. Looking up a key that is not in
    /// the tree is a programmer error.
    pub fn expect_branch(&self, key: MortonKey) -> &Branch {
        self.branches
            .get(&key)
            .unwrap_or_else(|| panic!("no branch with key {}", key))
    }

    /// The `i`-th child of a branch, if the branch has been refined.
    pub fn child(&self, key: MortonKey, i: usize) -> Option<&Branch> {
        self.branches.get(&key.push(i))
    }

    /// All entities, owned and remote.
    pub fn entities(&self) -> &[TreeEntity] {
        &self.entities
    }

    /// Entity by arena index.
    pub fn entity(&self, id: usize) -> &TreeEntity {
        &self.entities[id]
    }

    pub(crate) fn entity_mut(&mut self, id: usize) -> &mut TreeEntity {
        &mut self.entities[id]
    }

    /// Allocate an entity in the arena and return its stable index.
    /// The entity is not part of the tree until [`Tree::insert`] runs.
    pub fn make_entity(
        &mut self,
        coordinates: Coord,
        mass: f64,
        global_id: u64,
        owner: i32,
        locality: Locality,
        slot: BodySlot,
    ) -> usize {
        let key = MortonKey::from_point(&self.range, coordinates, DEEPEST_LEVEL);
        let id = self.entities.len();
        self.entities.push(TreeEntity {
            key,
            global_id,
            coordinates,
            mass,
            owner,
            locality,
            slot,
            branch: MortonKey::invalid(),
        });
        id
    }

    /// Insert an entity into the deepest existing branch on the Morton
    /// path to its key, then execute the action the branch requests.
    pub fn insert(&mut self, entity: usize) {
        let key = self.entities[entity].key;
        let mut bid = key.truncate(self.max_depth.min(key.depth()));
        while !self.branches.contains_key(&bid) {
            bid = bid.pop();
        }
        self.insert_at(entity, bid);
    }

    fn insert_at(&mut self, entity: usize, bid: MortonKey) {
        let max_leaf_size = self.policy.max_leaf_size;
        let branch = self
            .branches
            .get_mut(&bid)
            .expect("insertion target vanished");
        debug_assert!(branch.is_leaf());
        branch.insert(entity, max_leaf_size);
        let action = branch.requested_action();
        branch.reset();
        self.entities[entity].branch = bid;

        // A leaf at the deepest level is allowed to overflow; keys
        // cannot discriminate further.
        if action == Action::Refine && bid.depth() < DEEPEST_LEVEL {
            self.refine(bid);
        }
    }

    /// Split a leaf: create its children and redistribute the entities.
    fn refine(&mut self, bid: MortonKey) {
        let depth = bid.depth() + 1;

        let moved = {
            let branch = self.branches.get_mut(&bid).unwrap();
            let moved = branch.take_entities();
            branch.into_interior();
            moved
        };

        for i in 0..NCHILDREN {
            let cid = bid.push(i);
            self.branches.insert(cid, Branch::new(cid));
        }
        self.max_depth = self.max_depth.max(depth);

        // Reinsertion may cascade when every entity lands in the same
        // child; the walk-up in `insert` finds the new deepest leaf.
        for entity in moved {
            self.insert(entity);
        }
    }

    /// Remove an entity from its branch, coarsening the parent when the
    /// policy threshold is reached.
    pub fn remove(&mut self, entity: usize) {
        let bid = self.entities[entity].branch;
        assert!(
            bid.is_valid(),
            "removing entity {} that is not in the tree",
            entity
        );
        let threshold = self.policy.coarsen_threshold;
        let branch = self.branches.get_mut(&bid).unwrap();
        branch.remove(entity, threshold);
        let action = branch.requested_action();
        branch.reset();
        self.entities[entity].branch = MortonKey::invalid();

        if action == Action::Coarsen && bid.depth() > 0 {
            let parent = bid.parent();
            if self.should_coarsen(parent) {
                self.coarsen(parent);
            }
        }
    }

    fn should_coarsen(&self, parent: MortonKey) -> bool {
        self.count_entities_below(parent) <= self.policy.coarsen_threshold
    }

    fn count_entities_below(&self, bid: MortonKey) -> usize {
        let mut count = 0;
        let mut stack = vec![bid];
        while let Some(current) = stack.pop() {
            let branch = &self.branches[&current];
            if branch.is_leaf() {
                count += branch.entities().len();
            } else {
                for i in 0..NCHILDREN {
                    stack.push(current.push(i));
                }
            }
        }
        count
    }

    /// Reparent all descendant entities into `parent`, erase the
    /// descendant branches and turn `parent` back into a leaf.
    fn coarsen(&mut self, parent: MortonKey) {
        let mut gathered = Vec::new();
        let mut stack: Vec<MortonKey> = (0..NCHILDREN).map(|i| parent.push(i)).collect();
        while let Some(current) = stack.pop() {
            let branch = self
                .branches
                .remove(&current)
                .expect("incomplete sibling set during coarsening");
            if branch.is_leaf() {
                gathered.extend_from_slice(branch.entities());
            } else {
                for i in 0..NCHILDREN {
                    stack.push(current.push(i));
                }
            }
        }
        for &entity in &gathered {
            self.entities[entity].branch = parent;
        }
        self.branches.get_mut(&parent).unwrap().into_leaf(gathered);
    }

    // ------------------------------------------------------------------
    // Post-order aggregation.
    // ------------------------------------------------------------------

    /// Bottom-up recomputation of mass, center of mass, bounding box
    /// (inflated by `epsilon`) and sub-entity count. Only entities
    /// accepted by `filter` contribute; pass [`entity_filter_all`] for
    /// the full tree or [`entity_filter_local`] to prepare a local-only
    /// traversal.
    pub fn update_branches<F>(&mut self, epsilon: f64, filter: F)
    where
        F: Fn(&TreeEntity) -> bool + Copy,
    {
        self.update_branch_(MortonKey::root(), epsilon, filter);
    }

    fn update_branch_<F>(&mut self, bid: MortonKey, epsilon: f64, filter: F)
    where
        F: Fn(&TreeEntity) -> bool + Copy,
    {
        let is_leaf = self.branches[&bid].is_leaf();

        let mut mass = 0.0;
        let mut com = ZERO;
        let mut bmin = [f64::MAX; DIMENSION];
        let mut bmax = [f64::MIN; DIMENSION];
        let mut sub_entities: u64 = 0;

        if is_leaf {
            let branch = &self.branches[&bid];
            for &e in branch.entities() {
                let entity = &self.entities[e];
                if !filter(entity) {
                    continue;
                }
                sub_entities += 1;
                mass += entity.mass;
                com = add_scaled(com, entity.mass, entity.coordinates);
                for d in 0..DIMENSION {
                    bmin[d] = bmin[d].min(entity.coordinates[d] - epsilon);
                    bmax[d] = bmax[d].max(entity.coordinates[d] + epsilon);
                }
            }
        } else {
            for i in 0..NCHILDREN {
                let cid = bid.push(i);
                self.update_branch_(cid, epsilon, filter);
                let child = &self.branches[&cid];
                sub_entities += child.sub_entities();
                mass += child.mass();
                com = add_scaled(com, child.mass(), child.coordinates());
                if child.sub_entities() > 0 {
                    for d in 0..DIMENSION {
                        bmin[d] = bmin[d].min(child.bmin()[d]);
                        bmax[d] = bmax[d].max(child.bmax()[d]);
                    }
                }
            }
        }

        if mass > 0.0 {
            com = scale(com, 1.0 / mass);
        }
        self.branches
            .get_mut(&bid)
            .unwrap()
            .set_aggregates(mass, com, bmin, bmax, sub_entities);
    }

    // ------------------------------------------------------------------
    // Geometric queries, iterative stack strategy.
    // ------------------------------------------------------------------

    /// Entities within Euclidean distance `radius` of `center`.
    pub fn find_in_radius(&self, center: Coord, radius: f64) -> Vec<usize> {
        let mut hits = Vec::new();
        self.walk_radius(MortonKey::root(), center, radius, |e| hits.push(e));
        hits
    }

    /// Apply `f` to each entity within `radius` of `center` without
    /// materializing a container.
    pub fn apply_in_radius<F: FnMut(usize)>(&self, center: Coord, radius: f64, f: F) {
        self.walk_radius(MortonKey::root(), center, radius, f);
    }

    /// Entities inside the axis-aligned box `[min, max]`.
    pub fn find_in_box(&self, min: Coord, max: Coord) -> Vec<usize> {
        let mut hits = Vec::new();
        self.walk_box(MortonKey::root(), min, max, |e| hits.push(e));
        hits
    }

    /// Apply `f` to each entity inside the box `[min, max]`.
    pub fn apply_in_box<F: FnMut(usize)>(&self, min: Coord, max: Coord, f: F) {
        self.walk_box(MortonKey::root(), min, max, f);
    }

    fn walk_radius<F: FnMut(usize)>(&self, start: MortonKey, center: Coord, radius: f64, mut f: F) {
        let mut stack = vec![start];
        while let Some(bid) = stack.pop() {
            let branch = &self.branches[&bid];
            if branch.is_leaf() {
                for &e in branch.entities() {
                    if geometry::within(self.entities[e].coordinates, center, radius) {
                        f(e);
                    }
                }
            } else {
                for i in 0..NCHILDREN {
                    let cid = bid.push(i);
                    let child = &self.branches[&cid];
                    if child.sub_entities() > 0
                        && geometry::intersects_sphere_box(
                            child.bmin(),
                            child.bmax(),
                            center,
                            radius,
                        )
                    {
                        stack.push(cid);
                    }
                }
            }
        }
    }

    fn walk_box<F: FnMut(usize)>(&self, start: MortonKey, min: Coord, max: Coord, mut f: F) {
        let mut stack = vec![start];
        while let Some(bid) = stack.pop() {
            let branch = &self.branches[&bid];
            if branch.is_leaf() {
                for &e in branch.entities() {
                    if geometry::within_box(self.entities[e].coordinates, min, max) {
                        f(e);
                    }
                }
            } else {
                for i in 0..NCHILDREN {
                    let cid = bid.push(i);
                    let child = &self.branches[&cid];
                    if child.sub_entities() > 0
                        && geometry::intersects_box_box(min, max, child.bmin(), child.bmax())
                    {
                        stack.push(cid);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Geometric queries, recursive descent with ancestor pruning.
    // ------------------------------------------------------------------

    /// Deepest existing branch whose voxel contains the whole query
    /// sphere. Descending from the returned branch never misses a hit,
    /// and its siblings need not be visited.
    pub fn find_start(&self, center: Coord, radius: f64) -> MortonKey {
        if !self.range.contains(center) {
            return MortonKey::root();
        }
        let mut bid = MortonKey::from_point(&self.range, center, DEEPEST_LEVEL)
            .truncate(self.max_depth.min(DEEPEST_LEVEL));
        while !self.branches.contains_key(&bid) {
            bid = bid.pop();
        }
        while bid.depth() > 0 {
            let (vmin, vmax) = bid.voxel(&self.range);
            let mut contains_sphere = true;
            for d in 0..DIMENSION {
                if center[d] - radius < vmin[d] || center[d] + radius > vmax[d] {
                    contains_sphere = false;
                    break;
                }
            }
            if contains_sphere {
                return bid;
            }
            bid = bid.pop();
        }
        MortonKey::root()
    }

    /// Radius query by recursive descent from [`Tree::find_start`],
    /// pruning on voxel geometry instead of the stored bounding boxes.
    pub fn find_in_radius_pruned(&self, center: Coord, radius: f64) -> Vec<usize> {
        let start = self.find_start(center, radius);
        let mut hits = Vec::new();
        self.descend_radius(start, center, radius, &mut hits);
        hits
    }

    fn descend_radius(&self, bid: MortonKey, center: Coord, radius: f64, hits: &mut Vec<usize>) {
        let branch = &self.branches[&bid];
        if branch.is_leaf() {
            for &e in branch.entities() {
                if geometry::within(self.entities[e].coordinates, center, radius) {
                    hits.push(e);
                }
            }
            return;
        }
        for i in 0..NCHILDREN {
            let cid = bid.push(i);
            let (vmin, vmax) = cid.voxel(&self.range);
            if geometry::intersects_sphere_box(vmin, vmax, center, radius) {
                self.descend_radius(cid, center, radius, hits);
            }
        }
    }

    // ------------------------------------------------------------------
    // Concurrent queries.
    // ------------------------------------------------------------------

    /// Depth at which the concurrent queries hand sub-trees to the
    /// worker pool: the smallest depth whose branch count covers the
    /// thread count, plus one.
    pub fn queue_depth() -> u32 {
        let threads = rayon::current_num_threads().max(1);
        ((threads as f64).log2() / DIMENSION as f64).ceil() as u32 + 1
    }

    /// Concurrent radius query. Read-only on the tree; a single mutex
    /// guards the shared result vector.
    pub fn find_in_radius_concurrent(&self, center: Coord, radius: f64) -> Vec<usize> {
        let queue_depth = Self::queue_depth();
        let hits = Mutex::new(Vec::new());
        rayon::scope(|scope| {
            self.find_radius_concurrent_(scope, MortonKey::root(), 0, queue_depth, center, radius, &hits);
        });
        hits.into_inner().unwrap()
    }

    #[allow(clippy::too_many_arguments)]
    fn find_radius_concurrent_<'s>(
        &'s self,
        scope: &rayon::Scope<'s>,
        bid: MortonKey,
        depth: u32,
        queue_depth: u32,
        center: Coord,
        radius: f64,
        hits: &'s Mutex<Vec<usize>>,
    ) {
        if depth == queue_depth {
            scope.spawn(move |_| {
                let mut local = Vec::new();
                self.walk_radius(bid, center, radius, |e| local.push(e));
                hits.lock().unwrap().extend(local);
            });
            return;
        }
        let branch = &self.branches[&bid];
        if branch.is_leaf() {
            let mut local = Vec::new();
            for &e in branch.entities() {
                if geometry::within(self.entities[e].coordinates, center, radius) {
                    local.push(e);
                }
            }
            hits.lock().unwrap().extend(local);
            return;
        }
        for i in 0..NCHILDREN {
            let cid = bid.push(i);
            let child = &self.branches[&cid];
            if child.sub_entities() > 0
                && geometry::intersects_sphere_box(child.bmin(), child.bmax(), center, radius)
            {
                self.find_radius_concurrent_(scope, cid, depth + 1, queue_depth, center, radius, hits);
            }
        }
    }

    // ------------------------------------------------------------------
    // Work-splitting neighbor evaluation.
    // ------------------------------------------------------------------

    /// Top-down decomposition into work cells: leaves with entities,
    /// and interior branches with at most `ncritical` sub-entities.
    pub fn find_sub_cells(&self, ncritical: u64) -> Vec<MortonKey> {
        let mut cells = Vec::new();
        let mut stack = vec![MortonKey::root()];
        while let Some(bid) = stack.pop() {
            let branch = &self.branches[&bid];
            if branch.is_leaf() {
                if branch.sub_entities() > 0 {
                    cells.push(bid);
                }
            } else if branch.sub_entities() <= ncritical && branch.sub_entities() > 0 {
                cells.push(bid);
            } else {
                for i in 0..NCHILDREN {
                    let cid = bid.push(i);
                    if self.branches[&cid].sub_entities() > 0 {
                        stack.push(cid);
                    }
                }
            }
        }
        cells
    }

    /// Interaction list of a work cell: every leaf whose bounding box
    /// intersects the cell's (halo-inflated) bounding box.
    pub fn sub_cells_inter(&self, cell: MortonKey) -> Vec<MortonKey> {
        let cell_branch = self.expect_branch(cell);
        let (cmin, cmax) = (cell_branch.bmin(), cell_branch.bmax());
        let mut inter = Vec::new();
        let mut stack = vec![MortonKey::root()];
        while let Some(bid) = stack.pop() {
            let branch = &self.branches[&bid];
            if branch.is_leaf() {
                inter.push(bid);
            } else {
                for i in 0..NCHILDREN {
                    let cid = bid.push(i);
                    let child = &self.branches[&cid];
                    if child.sub_entities() > 0
                        && geometry::intersects_box_box(cmin, cmax, child.bmin(), child.bmax())
                    {
                        stack.push(cid);
                    }
                }
            }
        }
        inter
    }

    /// Local entity arena indices below `start`.
    pub fn local_entities_below(&self, start: MortonKey) -> Vec<usize> {
        let mut found = Vec::new();
        let mut stack = vec![start];
        while let Some(bid) = stack.pop() {
            let branch = &self.branches[&bid];
            if branch.is_leaf() {
                for &e in branch.entities() {
                    if self.entities[e].is_local() {
                        found.push(e);
                    }
                }
            } else {
                for i in 0..NCHILDREN {
                    let cid = bid.push(i);
                    if self.branches[&cid].sub_entities() > 0 {
                        stack.push(cid);
                    }
                }
            }
        }
        found
    }

    /// Apply `ef` exactly once to every local particle together with
    /// its neighbor list.
    ///
    /// The neighbor list holds every particle within the per-pair
    /// radius `support * max(h_a, h_b)`, ghosts included. Work is split
    /// at branches of at most `ncritical` sub-entities and runs on the
    /// worker pool; the callable must write only to its own particle.
    ///
    /// The interaction lists are computed from the cell bounding boxes,
    /// so the ε halo of the last [`Tree::update_branches`] call must
    /// cover the largest neighbor radius.
    pub fn apply_sub_cells<EF>(
        &self,
        locals: &mut [Body],
        ghosts: &[Body],
        support: f64,
        ncritical: u64,
        ef: EF,
    ) where
        EF: Fn(&mut Body, &[&Body]) + Sync,
    {
        let cells = self.find_sub_cells(ncritical);

        // Per work cell: the cell's local particles with the slots of
        // their neighbors. Read-only on the tree and the bodies.
        let per_cell: Vec<Vec<(usize, Vec<BodySlot>)>> = cells
            .par_iter()
            .map(|&cell| {
                let inter = self.sub_cells_inter(cell);
                let work = self.local_entities_below(cell);
                let mut out = Vec::with_capacity(work.len());
                for e in work {
                    let entity = &self.entities[e];
                    let BodySlot::Local(i) = entity.slot else {
                        continue;
                    };
                    let h_i = locals[i].smoothing_length;
                    let mut neighbors = Vec::new();
                    for &leaf in &inter {
                        for &n in self.branches[&leaf].entities() {
                            let other = &self.entities[n];
                            let h_n = match other.slot {
                                BodySlot::Local(j) => locals[j].smoothing_length,
                                BodySlot::Ghost(j) => ghosts[j].smoothing_length,
                                // Plain summaries sit beyond the ghost
                                // radius and never qualify.
                                BodySlot::None => continue,
                            };
                            let radius = support * h_i.max(h_n);
                            if geometry::within(other.coordinates, entity.coordinates, radius) {
                                neighbors.push(other.slot);
                            }
                        }
                    }
                    out.push((i, neighbors));
                }
                out
            })
            .collect();

        // Work cells partition the leaves, so every local particle
        // shows up exactly once.
        let mut lists: Vec<Vec<BodySlot>> = vec![Vec::new(); locals.len()];
        let mut seen = vec![false; locals.len()];
        for cell in per_cell {
            for (i, neighbors) in cell {
                debug_assert!(!seen[i], "particle {} assigned to two work cells", i);
                seen[i] = true;
                lists[i] = neighbors;
            }
        }
        debug_assert!(seen.iter().all(|&s| s), "local particle missed by traversal");

        let snapshot: Vec<Body> = locals.to_vec();
        locals.par_iter_mut().enumerate().for_each(|(i, body)| {
            let neighbors: Vec<&Body> = lists[i]
                .iter()
                .map(|slot| match slot {
                    BodySlot::Local(j) => &snapshot[*j],
                    BodySlot::Ghost(j) => &ghosts[*j],
                    BodySlot::None => unreachable!(),
                })
                .collect();
            ef(body, &neighbors);
        });
    }

    // ------------------------------------------------------------------
    // Diagnostics.
    // ------------------------------------------------------------------

    /// Dump the tree as graphviz, leaves colored by locality.
    pub fn dump_graphviz<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        writeln!(out, "digraph tree {{")?;
        let mut stack = vec![MortonKey::root()];
        while let Some(bid) = stack.pop() {
            let branch = &self.branches[&bid];
            if branch.is_leaf() {
                for &e in branch.entities() {
                    let entity = &self.entities[e];
                    let shape = match entity.locality {
                        Locality::Ghost => "shape=box,color=green",
                        Locality::NonLocal => "shape=box,color=blue",
                        _ => "shape=circle,color=black",
                    };
                    writeln!(out, "  \"{}\" -> \"p{}\"", bid, entity.global_id)?;
                    writeln!(out, "  \"p{}\" [{}]", entity.global_id, shape)?;
                }
            } else {
                for i in 0..NCHILDREN {
                    let cid = bid.push(i);
                    writeln!(out, "  \"{}\" -> \"{}\"", bid, cid)?;
                    stack.push(cid);
                }
            }
        }
        writeln!(out, "}}")
    }
}

/// Accept every entity; the standard post-order filter.
pub fn entity_filter_all(_: &TreeEntity) -> bool {
    true
}

/// Accept only entities owned by this rank; prepares the tree for the
/// purely local traversals of the multipole pass.
pub fn entity_filter_local(entity: &TreeEntity) -> bool {
    entity.is_local()
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    fn unit_range() -> DomainRange {
        DomainRange::new([0.0; DIMENSION], [1.0; DIMENSION])
    }

    fn random_bodies(n: usize, seed: u64) -> Vec<Body> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .map(|i| {
                let mut p = ZERO;
                for c in p.iter_mut() {
                    *c = rng.gen_range(0.05..0.95);
                }
                let mut b = Body::new(i as u64, p, 1.0 / n as f64, 0.1);
                b.set_key(&unit_range());
                b
            })
            .collect()
    }

    fn build_tree(bodies: &[Body]) -> Tree {
        let policy = TreePolicy {
            max_leaf_size: 8,
            coarsen_threshold: 4,
        };
        let mut tree = Tree::new(unit_range(), policy);
        for (i, b) in bodies.iter().enumerate() {
            let e = tree.make_entity(
                b.coordinates,
                b.mass,
                b.id,
                0,
                Locality::Local,
                BodySlot::Local(i),
            );
            tree.insert(e);
        }
        tree.update_branches(0.0, entity_filter_all);
        tree
    }

    fn check_structure(tree: &Tree) {
        // Every non-root branch has an interior parent; every entity
        // sits in a leaf on the path to its key.
        for (key, branch) in tree.branches.iter() {
            if key.depth() > 0 {
                let parent = tree.expect_branch(key.parent());
                assert!(!parent.is_leaf());
            }
            if branch.is_leaf() {
                for &e in branch.entities() {
                    let entity = tree.entity(e);
                    assert_eq!(entity.branch(), *key);
                    assert!(key.is_ancestor(entity.key()));
                }
            }
        }
    }

    #[test]
    fn test_insert_refines() {
        let bodies = random_bodies(200, 0);
        let tree = build_tree(&bodies);
        assert_eq!(tree.root().sub_entities(), 200);
        assert!(tree.max_depth() > 0);
        check_structure(&tree);
    }

    #[test]
    fn test_find_in_radius_matches_brute_force() {
        let bodies = random_bodies(300, 1);
        let tree = build_tree(&bodies);

        let center = [0.4; DIMENSION];
        let radius = 0.2;

        let mut expected: Vec<usize> = bodies
            .iter()
            .enumerate()
            .filter(|(_, b)| geometry::within(b.coordinates, center, radius))
            .map(|(i, _)| i)
            .collect();
        expected.sort_unstable();

        for mut hits in [
            tree.find_in_radius(center, radius),
            tree.find_in_radius_pruned(center, radius),
            tree.find_in_radius_concurrent(center, radius),
        ] {
            hits.sort_unstable();
            assert_eq!(hits, expected);
        }
    }

    #[test]
    fn test_find_in_box_matches_brute_force() {
        let bodies = random_bodies(300, 2);
        let tree = build_tree(&bodies);

        let min = [0.2; DIMENSION];
        let max = [0.7; DIMENSION];

        let mut expected: Vec<usize> = bodies
            .iter()
            .enumerate()
            .filter(|(_, b)| geometry::within_box(b.coordinates, min, max))
            .map(|(i, _)| i)
            .collect();
        expected.sort_unstable();

        let mut hits = tree.find_in_box(min, max);
        hits.sort_unstable();
        assert_eq!(hits, expected);
    }

    #[test]
    fn test_remove_coarsens() {
        let bodies = random_bodies(120, 3);
        let mut tree = build_tree(&bodies);
        let branches_before = tree.num_branches();

        for e in 0..bodies.len() {
            tree.remove(e);
        }
        assert!(tree.num_branches() < branches_before);
        tree.update_branches(0.0, entity_filter_all);
        assert_eq!(tree.root().sub_entities(), 0);
        check_structure(&tree);
    }

    #[test]
    fn test_com_idempotent() {
        let bodies = random_bodies(150, 4);
        let mut tree = build_tree(&bodies);

        tree.update_branches(0.05, entity_filter_all);
        let first: Vec<(MortonKey, f64, Coord, u64)> = {
            let mut rows: Vec<_> = tree
                .branches
                .iter()
                .map(|(k, b)| (*k, b.mass(), b.coordinates(), b.sub_entities()))
                .collect();
            rows.sort_by_key(|r| r.0);
            rows
        };

        tree.update_branches(0.05, entity_filter_all);
        let second: Vec<(MortonKey, f64, Coord, u64)> = {
            let mut rows: Vec<_> = tree
                .branches
                .iter()
                .map(|(k, b)| (*k, b.mass(), b.coordinates(), b.sub_entities()))
                .collect();
            rows.sort_by_key(|r| r.0);
            rows
        };

        // Bit-identical aggregates on an unchanged tree.
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.0, b.0);
            assert_eq!(a.1.to_bits(), b.1.to_bits());
            assert_eq!(a.3, b.3);
            for d in 0..DIMENSION {
                assert_eq!(a.2[d].to_bits(), b.2[d].to_bits());
            }
        }
    }

    #[test]
    fn test_com_mass_conservation() {
        let bodies = random_bodies(150, 5);
        let tree = build_tree(&bodies);
        let total: f64 = bodies.iter().map(|b| b.mass).sum();
        assert!((tree.root().mass() - total).abs() < 1e-12 * total.max(1.0));
    }

    #[test]
    fn test_apply_sub_cells_neighbor_completeness() {
        let mut bodies = random_bodies(200, 6);
        // Vary the smoothing lengths so the per-pair radius matters.
        for (i, b) in bodies.iter_mut().enumerate() {
            b.smoothing_length = 0.02 + 0.02 * (i % 3) as f64;
        }
        let mut tree = build_tree(&bodies);
        let h_max = bodies
            .iter()
            .map(|b| b.smoothing_length)
            .fold(0.0, f64::max);
        let support = 2.0;
        tree.update_branches(support * h_max, entity_filter_all);

        let reference = bodies.clone();
        let counts = Mutex::new(vec![0usize; bodies.len()]);
        tree.apply_sub_cells(&mut bodies, &[], support, 16, |body, neighbors| {
            // Exactly the brute-force neighborhood, no duplicates.
            let mut got: Vec<u64> = neighbors.iter().map(|n| n.id).collect();
            got.sort_unstable();
            got.dedup();
            assert_eq!(got.len(), neighbors.len());

            let mut expected: Vec<u64> = reference
                .iter()
                .filter(|other| {
                    let radius = support * body.smoothing_length.max(other.smoothing_length);
                    geometry::within(other.coordinates, body.coordinates, radius)
                })
                .map(|other| other.id)
                .collect();
            expected.sort_unstable();
            assert_eq!(got, expected);

            counts.lock().unwrap()[body.id as usize] += 1;
        });

        // Exactly one callable invocation per local particle.
        assert!(counts.into_inner().unwrap().iter().all(|&c| c == 1));
    }

    #[test]
    fn test_graphviz_dump_colors_localities() {
        let mut tree = Tree::new(unit_range(), TreePolicy::default());
        let spots = [[0.2; DIMENSION], [0.5; DIMENSION], [0.8; DIMENSION]];
        let tags = [
            (Locality::Local, BodySlot::Local(0)),
            (Locality::Ghost, BodySlot::Ghost(0)),
            (Locality::NonLocal, BodySlot::None),
        ];
        for (i, (&p, &(locality, slot))) in spots.iter().zip(tags.iter()).enumerate() {
            let e = tree.make_entity(p, 1.0, i as u64, 0, locality, slot);
            tree.insert(e);
        }
        tree.update_branches(0.0, entity_filter_all);

        let mut out = Vec::new();
        tree.dump_graphviz(&mut out).unwrap();
        let dot = String::from_utf8(out).unwrap();

        assert!(dot.starts_with("digraph tree {"));
        assert!(dot.trim_end().ends_with('}'));
        // One edge per particle, colored by locality.
        for id in 0..3 {
            assert!(dot.contains(&format!("-> \"p{}\"", id)));
        }
        assert!(dot.contains("\"p0\" [shape=circle,color=black]"));
        assert!(dot.contains("\"p1\" [shape=box,color=green]"));
        assert!(dot.contains("\"p2\" [shape=box,color=blue]"));
    }

    #[test]
    fn test_degenerate_positions_bottom_out() {
        // All particles in one voxel: the deepest leaf overflows
        // instead of refining forever.
        let n = 40;
        let bodies: Vec<Body> = (0..n)
            .map(|i| {
                let mut b = Body::new(i as u64, [0.5; DIMENSION], 1.0, 0.05);
                b.set_key(&unit_range());
                b
            })
            .collect();
        let tree = build_tree(&bodies);
        assert_eq!(tree.root().sub_entities(), n as u64);
    }
}
