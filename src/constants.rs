//! Compile-time configuration of the tree.
//!
//! The spatial dimension is fixed at build time, like the rest of the
//! geometric machinery that depends on it. Three dimensions is the
//! default; the `dim1` and `dim2` cargo features select the lower
//! dimensional builds used by shock-tube style problems.

/// Spatial dimension of the simulation.
#[cfg(feature = "dim1")]
pub const DIMENSION: usize = 1;

/// Spatial dimension of the simulation.
#[cfg(all(feature = "dim2", not(feature = "dim1")))]
pub const DIMENSION: usize = 2;

/// Spatial dimension of the simulation.
#[cfg(not(any(feature = "dim1", feature = "dim2")))]
pub const DIMENSION: usize = 3;

/// Number of children of an interior branch.
pub const NCHILDREN: usize = 1 << DIMENSION;

/// Deepest admissible key level.
///
/// A key stores one sentinel bit plus `DIMENSION` bits per level in a
/// `u64`, so `DIMENSION * DEEPEST_LEVEL + 1 <= 64`.
pub const DEEPEST_LEVEL: u32 = (63 / DIMENSION) as u32;

/// Default number of particles a leaf may hold before it is refined.
pub const MAX_LEAF_SIZE: usize = 64;

/// Default sub-entity count below which a branch becomes a work cell in
/// the task-splitting traversal.
pub const NCRITICAL: u64 = 32;
