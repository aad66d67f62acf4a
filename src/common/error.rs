//! Error types for bicycle_mpc

use std::time::Duration;

use thiserror::Error;

use crate::common::types::{ControlInput, VehicleState};

/// Per-tick failure reported by an optimal control solver.
///
/// These are recoverable: the control loop answers them with its fallback
/// policy instead of crashing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolverError {
    /// No control sequence satisfies the constraints within tolerance
    #[error("problem is infeasible (max constraint violation {max_violation:.4})")]
    Infeasible { max_violation: f64 },
    /// Internal solver error (non-finite cost, diverged iterates, ...)
    #[error("solver failure: {0}")]
    SolverFailure(String),
    /// Iteration cap reached before convergence
    #[error("iteration limit of {iterations} exceeded")]
    IterationLimitExceeded { iterations: usize },
    /// Wall-clock budget for one solve exhausted
    #[error("solve timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },
}

/// Main error type for the MPC stack
#[derive(Debug, Error)]
pub enum MpcError {
    /// Bad horizon, bounds or model parameters at setup
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Waypoint index beyond the end of a non-circular path
    #[error("Waypoint index {index} out of range for path with {len} waypoints")]
    OutOfRange { index: usize, len: usize },
    /// Optimal control solve failed this tick
    #[error("Solver error: {0}")]
    Solver(#[from] SolverError),
    /// Simulated state became non-finite
    #[error("Integration diverged: state={state:?} control={control:?} dt={dt}")]
    IntegrationDivergence {
        state: VehicleState,
        control: ControlInput,
        dt: f64,
    },
    /// Parameter file could not be parsed
    #[error("Cannot read the parameter file: {0}")]
    ConfigLoad(#[from] toml::de::Error),
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Run log serialization error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl MpcError {
    /// Shorthand for configuration failures
    pub fn config<S: Into<String>>(msg: S) -> Self {
        MpcError::Configuration(msg.into())
    }

    /// Whether the control loop may recover from this error with a fallback command
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MpcError::Solver(_))
    }
}

/// Result type alias for MPC operations
pub type MpcResult<T> = Result<T, MpcError>;
