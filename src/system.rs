//! The particle system: per-step control flow over the distributed
//! core.
//!
//! One value owns everything that was process-global in older SPH
//! codes: the body vector, the key range, the largest smoothing length,
//! the timestep and the iteration counter. The per-step sequence is
//!
//! sort → rebuild tree → COM → branch exchange → COM → ghosts,
//!
//! after which any number of neighbor passes (each followed by a cheap
//! ghost refresh) and optionally the multipole gravity pass run on the
//! augmented tree.

use log::{debug, info, warn};
use mpi::traits::{Communicator, CommunicatorCollectives};
use rayon::prelude::*;

use crate::body::{Body, Locality};
use crate::constants::DIMENSION;
use crate::error::Error;
use crate::exchange::{compute_range, exchange_branches, exchange_rank_boxes, GhostExchange};
use crate::fmm;
use crate::geometry::{add_scaled, dot, Coord, DomainRange, ZERO};
use crate::params::SimParams;
use crate::sort::distributed_sort;
use crate::sph;
use crate::tools::{global_count, global_max, global_min, global_sum};
use crate::tree::{entity_filter_all, entity_filter_local, BodySlot, Tree};

/// Everything that varies over a run, collected into one value.
pub struct SimulationContext {
    /// The particles this rank owns.
    pub bodies: Vec<Body>,
    /// Global particle count, fixed over the run.
    pub total_bodies: u64,
    /// Key range of the current step.
    pub range: DomainRange,
    /// Largest smoothing length in the system.
    pub h_max: f64,
    /// Current timestep.
    pub dt: f64,
    /// Simulated time.
    pub time: f64,
    /// Step counter.
    pub iteration: u64,
    /// Run parameters.
    pub params: SimParams,
}

/// Globally conserved sums, reduced over all ranks.
#[derive(Clone, Copy, Debug, Default)]
pub struct Conserved {
    /// Total mass.
    pub mass: f64,
    /// Total momentum.
    pub momentum: Coord,
    /// Total energy (internal plus kinetic).
    pub energy: f64,
}

impl Conserved {
    /// Largest relative drift of any conserved quantity against a
    /// reference, with a unit floor on the denominators.
    pub fn drift(&self, reference: &Conserved) -> f64 {
        let mut drift = (self.mass - reference.mass).abs() / reference.mass.abs().max(1.0);
        drift = drift
            .max((self.energy - reference.energy).abs() / reference.energy.abs().max(1.0));
        for d in 0..DIMENSION {
            drift = drift.max(
                (self.momentum[d] - reference.momentum[d]).abs()
                    / reference.momentum[d].abs().max(1.0),
            );
        }
        drift
    }
}

/// The distributed particle system.
pub struct ParticleSystem {
    ctx: SimulationContext,
    tree: Tree,
    ghosts: GhostExchange,
}

impl ParticleSystem {
    /// Create a system from this rank's initial particles.
    pub fn new<C: CommunicatorCollectives>(
        bodies: Vec<Body>,
        params: SimParams,
        comm: &C,
    ) -> Result<Self, Error> {
        params.validate()?;
        let total_bodies = global_count(&bodies, comm);
        if total_bodies == 0 {
            return Err(Error::EmptyParticleSet);
        }
        let dt = params.initial_dt;
        let policy = params.tree_policy();
        Ok(Self {
            ctx: SimulationContext {
                bodies,
                total_bodies,
                range: DomainRange::default(),
                h_max: 0.0,
                dt,
                time: 0.0,
                iteration: 0,
                params,
            },
            tree: Tree::new(DomainRange::default(), policy),
            ghosts: GhostExchange::default(),
        })
    }

    /// The simulation context.
    pub fn context(&self) -> &SimulationContext {
        &self.ctx
    }

    /// Mutable simulation context.
    pub fn context_mut(&mut self) -> &mut SimulationContext {
        &mut self.ctx
    }

    /// This rank's particles.
    pub fn bodies(&self) -> &[Body] {
        &self.ctx.bodies
    }

    /// The current tree.
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Number of ghosts imported this step.
    pub fn num_ghosts(&self) -> usize {
        self.ghosts.num_ghosts()
    }

    /// Redistribute the particles and rebuild the augmented tree for
    /// this step: sort, local build, COM, branch exchange, COM, ghost
    /// exchange.
    pub fn update_iteration<C: CommunicatorCollectives>(&mut self, comm: &C) {
        let rank = comm.rank();
        let support = self.ctx.params.kernel_support;

        // Largest smoothing length in the system; the exchange
        // paddings and the evaluator halo hang off it.
        let local_h = self
            .ctx
            .bodies
            .iter()
            .map(|b| b.smoothing_length)
            .fold(0.0, f64::max);
        self.ctx.h_max = global_max(local_h, comm);
        let halo = support * self.ctx.h_max;

        self.ctx.range = compute_range(&self.ctx.bodies, halo, comm);
        let range = self.ctx.range;
        debug!("rank {}: range {}", rank, range);
        self.ctx
            .bodies
            .par_iter_mut()
            .for_each(|b| b.set_key(&range));

        distributed_sort(&mut self.ctx.bodies, self.ctx.params.sort_sample_bytes, comm);

        // Rebuild the tree from the sorted, key-contiguous segment.
        self.tree = Tree::new(range, self.ctx.params.tree_policy());
        for (i, body) in self.ctx.bodies.iter().enumerate() {
            let e = self.tree.make_entity(
                body.coordinates,
                body.mass,
                body.id,
                rank,
                Locality::Local,
                BodySlot::Local(i),
            );
            self.tree.insert(e);
        }
        self.tree.update_branches(halo, entity_filter_all);
        assert_eq!(
            self.tree.root().sub_entities(),
            self.ctx.bodies.len() as u64,
            "rank {}: tree dropped particles",
            rank
        );
        debug_assert_eq!(global_count(&self.ctx.bodies, comm), self.ctx.total_bodies);

        // Publish branches into every peer's padded box, then refresh
        // the aggregates with the imported summaries in place.
        let rank_boxes = exchange_rank_boxes(&self.ctx.bodies, halo, comm);
        exchange_branches(&mut self.tree, &rank_boxes, comm);
        self.tree.update_branches(halo, entity_filter_all);

        self.ghosts
            .compute(&mut self.tree, &self.ctx.bodies, halo, comm);

        if rank == 0 {
            info!(
                "iteration {}: tree rebuilt, {} ghosts on rank 0",
                self.ctx.iteration,
                self.ghosts.num_ghosts()
            );
        }
    }

    /// Refresh the ghost payloads between physics passes. Cheap: the
    /// topology fixed by [`ParticleSystem::update_iteration`] is
    /// replayed as-is.
    pub fn update_neighbors<C: CommunicatorCollectives>(&mut self, comm: &C) {
        self.ghosts.refresh(&self.ctx.bodies, comm);
    }

    /// Apply `ef` once to every local particle with its complete
    /// neighbor list (ghosts included) within the per-pair smoothing
    /// radius.
    pub fn apply_in_smoothinglength<EF>(&mut self, ef: EF)
    where
        EF: Fn(&mut Body, &[&Body]) + Sync,
    {
        let Self { ctx, tree, ghosts } = self;
        tree.apply_sub_cells(
            &mut ctx.bodies,
            ghosts.ghosts(),
            ctx.params.kernel_support,
            ctx.params.ncritical,
            ef,
        );
    }

    /// Apply `ef` to every local particle.
    pub fn apply_all<EF>(&mut self, ef: EF)
    where
        EF: Fn(&mut Body) + Sync,
    {
        self.ctx.bodies.par_iter_mut().for_each(|b| ef(b));
    }

    /// Gravitational acceleration of every local particle by the
    /// multipole method.
    pub fn gravitation_fmm<C: CommunicatorCollectives>(&mut self, comm: &C) {
        let rank = comm.rank();
        let max_mass_cell = self.ctx.params.max_mass_cell;
        let mac_angle = self.ctx.params.mac_angle;

        // Local-only aggregates, without the halo: the sink boxes must
        // be tight and disjoint.
        self.tree.update_branches(0.0, entity_filter_local);
        assert_eq!(
            self.tree.root().sub_entities(),
            self.ctx.bodies.len() as u64,
            "rank {}: local COM pass lost particles",
            rank
        );

        let (cells, counts) = fmm::exchange_cells(&self.tree, max_mass_cell, comm);
        let contributions = fmm::compute_contributions(&self.tree, &cells, mac_angle);
        fmm::gather_cells(
            &self.tree,
            &mut self.ctx.bodies,
            &cells,
            &counts,
            &contributions,
            comm,
        );

        // Restore the halo-inflated full aggregates for the SPH passes.
        let halo = self.ctx.params.kernel_support * self.ctx.h_max;
        self.tree.update_branches(halo, entity_filter_all);

        if rank == 0 {
            info!(
                "fmm: {} global sinks, mac angle {}",
                cells.len(),
                mac_angle
            );
        }
    }

    /// Reduce the per-particle CFL estimates into the global timestep.
    /// An underflowing estimate is logged and the previous timestep is
    /// kept.
    pub fn set_adaptive_timestep<C: CommunicatorCollectives>(&mut self, comm: &C) {
        if !self.ctx.params.adaptive_timestep {
            return;
        }
        let p = &self.ctx.params;
        let local = self
            .ctx
            .bodies
            .iter()
            .map(|b| sph::timestep_estimate(b, p.cfl_factor, p.viscosity_alpha, p.viscosity_beta))
            .fold(f64::MAX, f64::min);
        let dt = global_min(local, comm);
        if !dt.is_finite() || dt <= f64::MIN_POSITIVE {
            warn!("timestep underflow ({}); keeping dt = {}", dt, self.ctx.dt);
            return;
        }
        self.ctx.dt = dt;
    }

    /// Advance the bookkeeping after a completed step.
    pub fn advance_time(&mut self) {
        self.ctx.time += self.ctx.dt;
        self.ctx.iteration += 1;
    }

    /// Globally reduced mass, momentum and energy.
    pub fn conserved_quantities<C: CommunicatorCollectives>(&self, comm: &C) -> Conserved {
        let mut mass = 0.0;
        let mut momentum = ZERO;
        let mut energy = 0.0;
        for b in &self.ctx.bodies {
            mass += b.mass;
            momentum = add_scaled(momentum, b.mass, b.velocity);
            energy += b.mass * (b.internal_energy + 0.5 * dot(b.velocity, b.velocity));
        }
        let mut global_momentum = ZERO;
        for d in 0..DIMENSION {
            global_momentum[d] = global_sum(momentum[d], comm);
        }
        Conserved {
            mass: global_sum(mass, comm),
            momentum: global_momentum,
            energy: global_sum(energy, comm),
        }
    }

    /// Check the conserved sums against a reference at a relative
    /// tolerance. Violations are logged, not fatal: the host decides.
    pub fn check_conservation<C: CommunicatorCollectives>(
        &self,
        reference: &Conserved,
        tolerance: f64,
        comm: &C,
    ) -> bool {
        let now = self.conserved_quantities(comm);
        let drift = now.drift(reference);
        if drift > tolerance {
            if comm.rank() == 0 {
                warn!(
                    "conservation drift {} exceeds tolerance {}: {:?} vs {:?}",
                    drift, tolerance, now, reference
                );
            }
            false
        } else {
            true
        }
    }
}

/// Build bodies from a flat coordinate buffer, `DIMENSION` values per
/// particle. Ids are assigned from `first_id` upward so every rank can
/// carve its own id range.
pub fn bodies_from_flat_positions(
    flat: &[f64],
    first_id: u64,
    mass: f64,
    smoothing_length: f64,
) -> Vec<Body> {
    assert_eq!(flat.len() % DIMENSION, 0);
    let coords: &[Coord] = bytemuck::cast_slice(flat);
    coords
        .iter()
        .enumerate()
        .map(|(i, &p)| Body::new(first_id + i as u64, p, mass, smoothing_length))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_conserved_drift() {
        let a = Conserved {
            mass: 10.0,
            momentum: ZERO,
            energy: 5.0,
        };
        let mut b = a;
        assert_eq!(b.drift(&a), 0.0);
        b.mass = 10.0 + 1e-8;
        assert!(b.drift(&a) > 0.0 && b.drift(&a) < 1e-8);
    }

    #[test]
    fn test_bodies_from_flat_positions() {
        let flat: Vec<f64> = (0..3 * DIMENSION).map(|i| i as f64 * 0.01).collect();
        let bodies = bodies_from_flat_positions(&flat, 100, 2.0, 0.1);
        assert_eq!(bodies.len(), 3);
        assert_eq!(bodies[0].id, 100);
        assert_eq!(bodies[2].coordinates[0], (2 * DIMENSION) as f64 * 0.01);
        assert_eq!(bodies[1].mass, 2.0);
    }
}
