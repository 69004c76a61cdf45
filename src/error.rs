//! Error type for configuration and setup failures.
//!
//! Only recoverable setup problems are surfaced as errors. Violated
//! runtime invariants (insert outside the key range, duplicate
//! `(key, id)` pairs, collective count mismatches) are programmer errors
//! and fail fast through assertions that carry rank and particle
//! context.

use thiserror::Error;

/// Errors reported before the first collective call.
#[derive(Debug, Error)]
pub enum Error {
    /// The parameter text could not be parsed.
    #[error("parameter parse error: {0}")]
    ParameterParse(#[from] toml::de::Error),

    /// A parameter value is outside its admissible range.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter {
        /// Name of the offending parameter.
        name: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The system was asked to run without any particles.
    #[error("no particles: the global particle set is empty")]
    EmptyParticleSet,
}
