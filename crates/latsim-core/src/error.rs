//! Simulator error types.
//!
//! Only locally recoverable conditions are expressed as errors. Broken
//! internal invariants (negative reservations, zombie threads in live
//! indices, payload drift past -1 B) are programmer errors and abort the
//! simulation with a panic carrying a diagnostic.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    /// Placement could not fit a replica given the affinity constraints and
    /// the remaining host capacity. The caller may retry with a different
    /// policy or topology.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// A scenario id, service chain, or prototype name was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The scenario references names that do not resolve, or carries values
    /// outside the accepted domain.
    #[error("invalid scenario: {0}")]
    Config(String),
}

pub type SimResult<T> = Result<T, SimError>;
