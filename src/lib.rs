//! A distributed SPH and gravitational N-body engine.
//!
//! The engine is built around a hashed Morton-keyed tree that every
//! rank rebuilds per step from a globally sample-sorted particle set.
//! The tree is then augmented with remote branch summaries and ghost
//! particle copies so each rank can evaluate neighbor-kernel sums and
//! multipole gravity as if it owned the whole domain. Keeping the
//! picture consistent takes a handful of collective protocols: the
//! sort, the branch exchange, the ghost exchange with its cheap
//! per-sub-step refresh, and the FMM cell reductions.
//!
//! Physics enters only through callables: a neighbor pass is a function
//! of one particle and its neighbor list, invoked exactly once per
//! local particle by [`ParticleSystem::apply_in_smoothinglength`]. The
//! [`sph`](crate::sph) module ships the standard callables (density,
//! ideal-gas pressure, artificial-viscosity acceleration) the demos
//! use.
//!
//! ## Using the engine
//!
//! ```no_run
//! use mpi::traits::Communicator;
//! use sphtree::{Body, ParticleSystem, SimParams};
//!
//! let universe = mpi::initialize().unwrap();
//! let world = universe.world();
//!
//! // Each rank contributes its slice of the initial condition.
//! let bodies: Vec<Body> = (0..1000)
//!     .map(|i| {
//!         let x = (world.rank() as f64 + i as f64 / 1000.0) / world.size() as f64;
//!         Body::new(
//!             world.rank() as u64 * 1000 + i,
//!             [x; sphtree::constants::DIMENSION],
//!             1.0e-3,
//!             5.0e-3,
//!         )
//!     })
//!     .collect();
//!
//! let mut system = ParticleSystem::new(bodies, SimParams::default(), &world).unwrap();
//! system.update_iteration(&world);
//! system.apply_in_smoothinglength(|body, neighbors| {
//!     sphtree::sph::compute_density(body, neighbors);
//! });
//! ```
//!
//! Every collective function is generic over
//! `mpi::traits::CommunicatorCollectives`; the communicator is the only
//! ambient handle the engine touches.
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod body;
pub mod branch;
pub mod constants;
pub mod error;
pub mod exchange;
pub mod fmm;
pub mod geometry;
pub mod morton;
pub mod params;
pub mod sort;
pub mod sph;
pub mod system;
pub mod tools;
pub mod tree;

pub use crate::body::{Body, Locality};
pub use crate::error::Error;
pub use crate::morton::MortonKey;
pub use crate::params::SimParams;
pub use crate::system::{Conserved, ParticleSystem};
pub use crate::tree::{Tree, TreePolicy};
