//! bicycle_mpc - receding-horizon path tracking for a kinematic bicycle
//!
//! A nonlinear model predictive controller follows a discretized reference
//! path with a speed profile while keeping clear of static circular
//! obstacles. The closed loop is simulated against an RK4 plant.

// Core modules
pub mod common;
pub mod config;

// Algorithm modules
pub mod path_planning;
pub mod vehicle;
pub mod control;
pub mod simulation;

// Re-export common types for convenience
pub use common::{ControlInput, Obstacle, Point2D, VehicleState};
pub use common::MotionModel;
pub use common::{MpcError, MpcResult, SolverError};
pub use config::ScenarioConfig;
pub use control::{AugmentedLagrangianSolver, MpcConfig, MpcController, NlpSolver};
pub use path_planning::{ReferencePath, Smoothing, Waypoint};
pub use simulation::{ControlLoop, LoopConfig, Simulator, Termination};
pub use vehicle::{BicycleModel, VehicleParams};
