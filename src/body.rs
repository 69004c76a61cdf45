//! Particle state and the wire records derived from it.

use mpi::traits::Equivalence;

use crate::geometry::{Coord, DomainRange, ZERO};
use crate::morton::MortonKey;

/// Where a tree entity's backing state lives relative to this rank.
///
/// `Local`, `Excl` and `Shared` all count as "mine". A `Ghost` is a full
/// copy of a remote particle refreshed every sub-step; `NonLocal`
/// carries only position and mass, enough for multipole acceleration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Locality {
    /// Owned by this rank.
    Local,
    /// Owned by this rank and invisible to every peer.
    Excl,
    /// Owned by this rank but exported as a ghost to at least one peer.
    Shared,
    /// Full shadow of a remote particle.
    Ghost,
    /// Remote summary: position and mass only.
    NonLocal,
}

impl Locality {
    /// True for the localities that count as owned by this rank.
    pub fn is_local(self) -> bool {
        matches!(self, Locality::Local | Locality::Excl | Locality::Shared)
    }
}

/// Full particle state. Owned by exactly one rank at each step and
/// shipped whole during the sort and the ghost exchange.
#[derive(Clone, Copy, Equivalence)]
pub struct Body {
    /// Stable 64-bit identifier, assigned at creation.
    pub id: u64,
    /// Morton key of the position, recomputed each step before the sort.
    pub key: MortonKey,
    /// Position.
    pub coordinates: Coord,
    /// Velocity.
    pub velocity: Coord,
    /// Half-step velocity of the leap-frog scheme.
    pub velocity_half: Coord,
    /// Hydrodynamic acceleration.
    pub acceleration: Coord,
    /// Gravitational acceleration, written by the FMM evaluator.
    pub gravity: Coord,
    /// Mass density.
    pub density: f64,
    /// Pressure.
    pub pressure: f64,
    /// Sound speed.
    pub soundspeed: f64,
    /// Specific internal energy.
    pub internal_energy: f64,
    /// Particle mass.
    pub mass: f64,
    /// Smoothing length.
    pub smoothing_length: f64,
    /// Largest viscosity signal `mu_ij` seen this step, adaptive-dt scratch.
    pub mumax: f64,
}

impl Default for Body {
    fn default() -> Self {
        Self {
            id: 0,
            key: MortonKey::invalid(),
            coordinates: ZERO,
            velocity: ZERO,
            velocity_half: ZERO,
            acceleration: ZERO,
            gravity: ZERO,
            density: 0.0,
            pressure: 0.0,
            soundspeed: 0.0,
            internal_energy: 0.0,
            mass: 0.0,
            smoothing_length: 0.0,
            mumax: 0.0,
        }
    }
}

impl Body {
    /// Create a particle at rest.
    pub fn new(id: u64, coordinates: Coord, mass: f64, smoothing_length: f64) -> Self {
        Self {
            id,
            coordinates,
            mass,
            smoothing_length,
            ..Self::default()
        }
    }

    /// Recompute the deepest-level key for the given range.
    pub fn set_key(&mut self, range: &DomainRange) {
        self.key = MortonKey::from_point(range, self.coordinates, crate::constants::DEEPEST_LEVEL);
    }

    /// Ordering used everywhere a deterministic particle order is
    /// needed: by key, ties broken by id.
    pub fn sort_key(&self) -> (MortonKey, u64) {
        (self.key, self.id)
    }
}

/// Remote particle summary published during the branch exchange.
///
/// Position and mass are all the multipole pass needs; the id makes the
/// ghost linkage deterministic when two particles share a voxel.
#[derive(Clone, Copy, Default, Equivalence)]
pub struct BodySummary {
    /// Deepest-level key of the particle.
    pub key: MortonKey,
    /// Stable particle id.
    pub id: u64,
    /// Position.
    pub coordinates: Coord,
    /// Mass.
    pub mass: f64,
    /// Rank owning the full state.
    pub owner: i32,
}
