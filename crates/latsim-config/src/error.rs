//! Configuration error types.

use std::path::PathBuf;

use latsim_core::SimError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse scenario document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid scenario document: {0}")]
    Validation(String),

    #[error("simulation scenario {0} not found")]
    UnknownScenario(String),

    #[error(transparent)]
    Simulation(#[from] SimError),
}
