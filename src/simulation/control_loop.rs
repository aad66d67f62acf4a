//! Closed-loop driver: select waypoint, solve, apply, integrate, log
//!
//! Progress along the path is the plant displacement projected onto the
//! heading of the current reference waypoint, accumulated tick by tick.
//!
//! A failed solve does not stop the vehicle on the spot. The first failure
//! holds the previous command, further consecutive failures brake with a
//! fixed deceleration while holding the steering, and after
//! `max_consecutive_failures` in a row the run terminates.

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::common::{ControlInput, MpcError, MpcResult, VehicleState};
use crate::control::{MpcController, NlpSolver};
use crate::path_planning::ReferencePath;
use crate::simulation::run_log::{LogRecord, RunLog};
use crate::simulation::simulator::Simulator;
use crate::vehicle::BicycleModel;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// hard cap on ticks, the only stop condition on circular paths without `max_laps`
    pub max_iterations: usize,
    /// stop a circular run after this many laps
    pub max_laps: Option<f64>,
    pub max_consecutive_failures: usize,
    /// deceleration commanded by the fallback brake [m/s^2]
    pub brake_deceleration: f64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 2000,
            max_laps: None,
            max_consecutive_failures: 3,
            brake_deceleration: 0.5,
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> MpcResult<()> {
        if self.max_consecutive_failures == 0 {
            return Err(MpcError::config("max_consecutive_failures must be positive"));
        }
        if !(self.brake_deceleration.is_finite() && self.brake_deceleration >= 0.0) {
            return Err(MpcError::config("brake deceleration must be non-negative"));
        }
        if let Some(laps) = self.max_laps {
            if !(laps.is_finite() && laps > 0.0) {
                return Err(MpcError::config("max_laps must be positive"));
            }
        }
        Ok(())
    }
}

/// Where the command of a tick came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSource {
    Optimal,
    /// previous command repeated after a failed solve
    HoldLast,
    Brake,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub waypoint_index: usize,
    pub control: ControlInput,
    pub source: ControlSource,
    pub state: VehicleState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// end of an open path reached
    PathCompleted,
    LapsCompleted,
    IterationLimit,
    ConsecutiveFailures { failures: usize, last_error: String },
}

pub struct ControlLoop<S: NlpSolver> {
    path: ReferencePath,
    controller: MpcController<S>,
    simulator: Simulator<BicycleModel>,
    config: LoopConfig,
    state: VehicleState,
    time: f64,
    traveled: f64,
    iterations: usize,
    last_command: ControlInput,
    consecutive_failures: usize,
    last_error: Option<String>,
    log: RunLog,
}

impl<S: NlpSolver> ControlLoop<S> {
    /// The plant is simulated with the controller's own model parameters.
    pub fn new(
        path: ReferencePath,
        controller: MpcController<S>,
        config: LoopConfig,
        initial_state: VehicleState,
    ) -> MpcResult<Self> {
        config.validate()?;
        if !path.has_speed_profile() {
            return Err(MpcError::config("reference path has no speed profile"));
        }
        if !initial_state.is_finite() {
            return Err(MpcError::config(format!("initial state {:?} is not finite", initial_state)));
        }
        let simulator = Simulator::new(controller.model().clone());
        Ok(Self {
            path,
            controller,
            simulator,
            config,
            state: initial_state,
            time: 0.0,
            traveled: 0.0,
            iterations: 0,
            last_command: ControlInput::zero(),
            consecutive_failures: 0,
            last_error: None,
            log: RunLog::new(),
        })
    }

    pub fn state(&self) -> &VehicleState {
        &self.state
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    /// Distance traveled along the path so far
    pub fn traveled_distance(&self) -> f64 {
        self.traveled
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures
    }

    pub fn path(&self) -> &ReferencePath {
        &self.path
    }

    pub fn controller(&self) -> &MpcController<S> {
        &self.controller
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    fn fallback(&self) -> (ControlInput, ControlSource) {
        let dt = self.controller.model().ts();
        // neither holding nor braking may drive the vehicle into reverse
        let stop = -self.state.vel.max(0.0) / dt;
        if self.consecutive_failures <= 1 {
            let held = ControlInput::new(self.last_command.acc.max(stop), self.last_command.delta);
            return (held, ControlSource::HoldLast);
        }
        let bounds = self.controller.actuator_bounds();
        let acc = (-self.config.brake_deceleration).max(stop).max(-bounds.acc_max);
        (ControlInput::new(acc, self.last_command.delta), ControlSource::Brake)
    }

    /// One control period.
    ///
    /// Solver failures are absorbed by the fallback policy; configuration
    /// errors and integration divergence are returned.
    pub fn tick(&mut self) -> MpcResult<TickOutcome> {
        let model = self.controller.model().clone();
        let waypoint_index = model.select_waypoint(&self.path, self.traveled);

        let (control, source) = match self.controller.get_control(&self.state, &self.path, waypoint_index) {
            Ok(u) => {
                self.consecutive_failures = 0;
                self.last_error = None;
                (u, ControlSource::Optimal)
            }
            Err(e) if e.is_recoverable() => {
                self.consecutive_failures += 1;
                let (u, source) = self.fallback();
                warn!(
                    "t={:.2}: {} (failure {} in a row), applying {:?} {:?}",
                    self.time, e, self.consecutive_failures, source, u
                );
                self.last_error = Some(e.to_string());
                (u, source)
            }
            Err(e) => return Err(e),
        };
        self.controller.record_applied(control);
        self.last_command = control;

        let dt = model.ts();
        let next = self.simulator.step(&self.state, &control, dt)?;
        let reference = self.path.get_waypoint(waypoint_index)?;
        let (sin_ref, cos_ref) = reference.psi.sin_cos();
        let progress = (next.pos_x - self.state.pos_x) * cos_ref + (next.pos_y - self.state.pos_y) * sin_ref;
        self.traveled += progress.max(0.0);

        self.state = next;
        self.time += dt;
        self.iterations += 1;
        self.log.push(LogRecord::new(self.time, &self.state, &control));

        Ok(TickOutcome { waypoint_index, control, source, state: self.state })
    }

    fn finished(&self) -> Option<Termination> {
        let length = self.path.length();
        if !self.path.is_circular() && self.traveled >= length {
            return Some(Termination::PathCompleted);
        }
        if let Some(laps) = self.config.max_laps {
            if self.path.is_circular() && self.traveled >= laps * length {
                return Some(Termination::LapsCompleted);
            }
        }
        if self.iterations >= self.config.max_iterations {
            return Some(Termination::IterationLimit);
        }
        None
    }

    /// Tick until the path is complete, the iteration cap is reached or
    /// the solver keeps failing.
    pub fn run(&mut self) -> MpcResult<Termination> {
        info!(
            "starting run on a {:.2} m {} path with {} waypoints",
            self.path.length(),
            if self.path.is_circular() { "circular" } else { "open" },
            self.path.len()
        );
        loop {
            if let Some(done) = self.finished() {
                info!(
                    "run finished after {} ticks ({:.2} s, {:.2} m): {:?}",
                    self.iterations, self.time, self.traveled, done
                );
                return Ok(done);
            }
            self.tick()?;
            if self.consecutive_failures >= self.config.max_consecutive_failures {
                let last_error = self.last_error.clone().unwrap_or_default();
                error!(
                    "{} consecutive solver failures at t={:.2}, state {:?}: {}",
                    self.consecutive_failures, self.time, self.state, last_error
                );
                return Ok(Termination::ConsecutiveFailures {
                    failures: self.consecutive_failures,
                    last_error,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{MpcError, SolverError};
    use crate::control::{HorizonProblem, MpcConfig, Solution};
    use crate::path_planning::{Smoothing, SpeedProfileConstraints};
    use crate::vehicle::VehicleParams;
    use assert_approx_eq::assert_approx_eq;

    // returns a fixed command, or fails when `fail` is set
    struct Scripted {
        control: ControlInput,
        fail: bool,
    }

    impl NlpSolver for Scripted {
        fn solve(&self, problem: &HorizonProblem, _guess: &[ControlInput]) -> Result<Solution, SolverError> {
            if self.fail {
                return Err(SolverError::Infeasible { max_violation: 0.5 });
            }
            let controls = vec![self.control; problem.horizon()];
            let states = problem.rollout(&controls);
            Ok(Solution { controls, states, cost: 0.0, max_violation: 0.0, iterations: 0, converged: true })
        }
    }

    fn straight(length: f64) -> ReferencePath {
        let mut path = ReferencePath::new(&[0.0, length], &[0.0, 0.0], 0.1, Smoothing::None, false).unwrap();
        path.compute_speed_profile(&SpeedProfileConstraints::default()).unwrap();
        path
    }

    fn control_loop(solver: Scripted, length: f64, config: LoopConfig) -> ControlLoop<Scripted> {
        let mpc_config = MpcConfig { horizon: 5, ts: 0.1, ..Default::default() };
        let controller = MpcController::new(mpc_config, VehicleParams::default(), solver).unwrap();
        ControlLoop::new(straight(length), controller, config, VehicleState::new(0.0, 0.0, 0.0, 1.0)).unwrap()
    }

    #[test]
    fn test_progress_follows_projection() {
        let solver = Scripted { control: ControlInput::zero(), fail: false };
        let mut cl = control_loop(solver, 10.0, LoopConfig::default());
        let out = cl.tick().unwrap();
        assert_eq!(out.source, ControlSource::Optimal);
        assert_eq!(out.waypoint_index, 0);
        assert_approx_eq!(cl.traveled_distance(), 0.1, 1e-9);
        assert_approx_eq!(cl.time(), 0.1);
        assert_eq!(cl.log().len(), 1);
    }

    #[test]
    fn test_open_path_completes() {
        let solver = Scripted { control: ControlInput::zero(), fail: false };
        let mut cl = control_loop(solver, 2.0, LoopConfig::default());
        assert_eq!(cl.run().unwrap(), Termination::PathCompleted);
        // 2 m at 1 m/s in 0.1 s ticks
        assert!((20..=21).contains(&cl.iterations()));
    }

    #[test]
    fn test_iteration_cap() {
        let solver = Scripted { control: ControlInput::zero(), fail: false };
        let config = LoopConfig { max_iterations: 5, ..Default::default() };
        let mut cl = control_loop(solver, 100.0, config);
        assert_eq!(cl.run().unwrap(), Termination::IterationLimit);
        assert_eq!(cl.log().len(), 5);
    }

    #[test]
    fn test_circular_run_stops_after_laps() {
        let mut path = ReferencePath::new(&[0.0, 4.0, 4.0, 0.0], &[0.0, 0.0, 4.0, 4.0], 0.1, Smoothing::None, true).unwrap();
        path.compute_speed_profile(&SpeedProfileConstraints::default()).unwrap();
        let length = path.length();
        let mpc_config = MpcConfig { horizon: 5, ts: 0.1, ..Default::default() };
        let solver = Scripted { control: ControlInput::zero(), fail: false };
        let controller = MpcController::new(mpc_config, VehicleParams::default(), solver).unwrap();
        // a fifth of the 16 m square stays on the first side
        let config = LoopConfig { max_laps: Some(0.2), ..Default::default() };
        let mut cl = ControlLoop::new(path, controller, config, VehicleState::new(0.0, 0.0, 0.0, 1.0)).unwrap();

        assert_eq!(cl.run().unwrap(), Termination::LapsCompleted);
        assert!(cl.traveled_distance() >= 0.2 * length);
        assert!(cl.iterations() < 40);
    }

    #[test]
    fn test_fallback_holds_then_brakes() {
        let solver = Scripted { control: ControlInput::new(0.0, 0.1), fail: true };
        let mut cl = control_loop(solver, 100.0, LoopConfig::default());
        cl.last_command = ControlInput::new(0.3, 0.1);

        let first = cl.tick().unwrap();
        assert_eq!(first.source, ControlSource::HoldLast);
        assert_eq!(first.control, ControlInput::new(0.3, 0.1));

        let second = cl.tick().unwrap();
        assert_eq!(second.source, ControlSource::Brake);
        assert_approx_eq!(second.control.acc, -0.5);
        assert_approx_eq!(second.control.delta, 0.1);
        assert_eq!(cl.controller().last_control(), second.control);
    }

    #[test]
    fn test_brake_does_not_reverse() {
        let solver = Scripted { control: ControlInput::zero(), fail: true };
        let mut cl = control_loop(solver, 100.0, LoopConfig::default());
        cl.state.vel = 0.02;
        cl.consecutive_failures = 1;
        let out = cl.tick().unwrap();
        assert_eq!(out.source, ControlSource::Brake);
        assert_approx_eq!(out.control.acc, -0.2);
        assert!(out.state.vel.abs() < 1e-12);
    }

    #[test]
    fn test_hold_does_not_reverse() {
        let solver = Scripted { control: ControlInput::zero(), fail: true };
        let mut cl = control_loop(solver, 100.0, LoopConfig::default());
        cl.state.vel = 0.05;
        cl.last_command = ControlInput::new(-1.0, 0.2);
        let out = cl.tick().unwrap();
        assert_eq!(out.source, ControlSource::HoldLast);
        assert_approx_eq!(out.control.acc, -0.5);
        assert_approx_eq!(out.control.delta, 0.2);
        assert!(out.state.vel.abs() < 1e-12);
    }

    #[test]
    fn test_consecutive_failures_terminate() {
        let solver = Scripted { control: ControlInput::zero(), fail: true };
        let mut cl = control_loop(solver, 100.0, LoopConfig::default());
        match cl.run().unwrap() {
            Termination::ConsecutiveFailures { failures, last_error } => {
                assert_eq!(failures, 3);
                assert!(last_error.contains("infeasible"));
            }
            other => panic!("unexpected termination {:?}", other),
        }
        assert_eq!(cl.iterations(), 3);
    }

    #[test]
    fn test_rejects_path_without_profile() {
        let path = ReferencePath::new(&[0.0, 5.0], &[0.0, 0.0], 0.1, Smoothing::None, false).unwrap();
        let controller = MpcController::new(
            MpcConfig::default(),
            VehicleParams::default(),
            Scripted { control: ControlInput::zero(), fail: false },
        )
        .unwrap();
        let result = ControlLoop::new(path, controller, LoopConfig::default(), VehicleState::origin());
        assert!(matches!(result, Err(MpcError::Configuration(_))));
    }
}
