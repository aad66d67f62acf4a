//! Closed-loop simulation of the controller against an RK4 plant

pub mod control_loop;
pub mod run_log;
pub mod simulator;

pub use control_loop::{ControlLoop, ControlSource, LoopConfig, Termination, TickOutcome};
pub use run_log::{LogRecord, RunLog};
pub use simulator::{rk4_step, Simulator};
