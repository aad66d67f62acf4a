//! Model predictive control
//!
//! The horizon problem, the solvers that minimize it and the
//! receding-horizon controller that drives them tick by tick.

pub mod mpc;
pub mod problem;
pub mod solver;

pub use mpc::{ControllerStatus, MpcConfig, MpcController};
pub use problem::{ActuatorBounds, CostWeights, HorizonProblem, StateBounds};
pub use solver::{AugmentedLagrangianSolver, NlpSolver, Solution, SolverSettings};
