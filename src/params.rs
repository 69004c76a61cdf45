//! Typed parameter store.
//!
//! Everything the engine reads at run time lives in one serde-derived
//! struct with defaults, parsed from TOML text before the first
//! collective call. How the text reaches the process (file, embedded
//! string) is the host's business.

use serde::{Deserialize, Serialize};

use crate::constants::{MAX_LEAF_SIZE, NCRITICAL};
use crate::error::Error;
use crate::tree::TreePolicy;

/// Simulation parameters with sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimParams {
    /// Number of particles a leaf may hold before refinement.
    pub max_leaf_size: usize,
    /// Subtree population at which a parent coarsens back into a leaf.
    pub coarsen_threshold: usize,
    /// Work-cell population bound of the neighbor traversal.
    pub ncritical: u64,
    /// Per-rank sample volume shipped to root by the distributed sort.
    pub sort_sample_bytes: usize,
    /// Kernel support in units of the smoothing length.
    pub kernel_support: f64,
    /// Multipole acceptance opening angle; zero disables acceptance.
    pub mac_angle: f64,
    /// Mass bound below which a cell is published as an FMM sink.
    pub max_mass_cell: f64,
    /// CFL prefactor of the adaptive timestep.
    pub cfl_factor: f64,
    /// Whether to reduce the adaptive timestep each step.
    pub adaptive_timestep: bool,
    /// Initial (and, without adaptivity, permanent) timestep.
    pub initial_dt: f64,
    /// Adiabatic index of the ideal-gas equation of state.
    pub gas_gamma: f64,
    /// Artificial viscosity α.
    pub viscosity_alpha: f64,
    /// Artificial viscosity β.
    pub viscosity_beta: f64,
    /// Artificial viscosity singularity guard ε.
    pub viscosity_epsilon: f64,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            max_leaf_size: MAX_LEAF_SIZE,
            coarsen_threshold: MAX_LEAF_SIZE / 2,
            ncritical: NCRITICAL,
            sort_sample_bytes: 256 * 1024,
            kernel_support: 2.0,
            mac_angle: 0.0,
            max_mass_cell: 1.0e-40,
            cfl_factor: 0.25,
            adaptive_timestep: false,
            initial_dt: 1.0e-3,
            gas_gamma: 5.0 / 3.0,
            viscosity_alpha: 1.0,
            viscosity_beta: 2.0,
            viscosity_epsilon: 0.01,
        }
    }
}

impl SimParams {
    /// Parse parameters from TOML text and validate them.
    pub fn from_toml_str(text: &str) -> Result<Self, Error> {
        let params: SimParams = toml::from_str(text)?;
        params.validate()?;
        Ok(params)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_leaf_size == 0 {
            return Err(Error::InvalidParameter {
                name: "max_leaf_size",
                reason: "must be positive".into(),
            });
        }
        if self.coarsen_threshold >= self.max_leaf_size {
            return Err(Error::InvalidParameter {
                name: "coarsen_threshold",
                reason: format!(
                    "must be below max_leaf_size ({})",
                    self.max_leaf_size
                ),
            });
        }
        if self.kernel_support <= 0.0 {
            return Err(Error::InvalidParameter {
                name: "kernel_support",
                reason: "must be positive".into(),
            });
        }
        if !(0.0..1.0).contains(&self.mac_angle) {
            return Err(Error::InvalidParameter {
                name: "mac_angle",
                reason: "must lie in [0, 1)".into(),
            });
        }
        if self.initial_dt <= 0.0 {
            return Err(Error::InvalidParameter {
                name: "initial_dt",
                reason: "must be positive".into(),
            });
        }
        if self.gas_gamma <= 1.0 {
            return Err(Error::InvalidParameter {
                name: "gas_gamma",
                reason: "must exceed 1".into(),
            });
        }
        Ok(())
    }

    /// The tree policy slice of the parameters.
    pub fn tree_policy(&self) -> TreePolicy {
        TreePolicy {
            max_leaf_size: self.max_leaf_size,
            coarsen_threshold: self.coarsen_threshold,
        }
    }
}
