//! Receding-horizon controller for the kinematic bicycle
//!
//! Every call to [`MpcController::get_control`] builds a [`HorizonProblem`]
//! from the current state and the next N waypoints, hands it to the
//! configured [`NlpSolver`] and returns only the first control of the
//! optimal sequence. The rest of the sequence, shifted by one stage, seeds
//! the next solve.
//!
//! An obstacle straight ahead leaves the problem symmetric, and a local
//! solver started from a straight guess settles on braking in front of it.
//! When a plan is held up by an obstacle, the controller solves again from
//! guesses that swerve to either side and switches to one of them only if
//! it gets clearly further along the path.

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::common::{ControlInput, MpcError, MpcResult, Obstacle, SolverError, VehicleState};
use crate::control::problem::{ActuatorBounds, CostWeights, HorizonProblem, StateBounds};
use crate::control::solver::{AugmentedLagrangianSolver, NlpSolver, Solution};
use crate::path_planning::{ReferencePath, Waypoint};
use crate::vehicle::{BicycleModel, VehicleParams};

// obstacle gap below which a plan counts as held up by the obstacle [m]
const BLOCKED_SLACK: f64 = 0.05;
// extra terminal progress a swerve plan needs to replace the current one [m]
const PROGRESS_GAIN: f64 = 0.1;
// steering of the swerve guesses, as a share of the steering limit
const SWERVE_STEERING: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MpcConfig {
    /// prediction horizon N [steps]
    pub horizon: usize,
    /// sampling time [s]
    pub ts: f64,
    pub weights: CostWeights,
    pub v_min: f64,
    pub v_max: f64,
    /// bound on the lateral tracking error |e_y| [m]
    pub e_y_max: f64,
    /// bound on |acc| [m/s^2]
    pub acc_max: f64,
    /// extra clearance around obstacles on top of the vehicle safety margin [m]
    pub obstacle_buffer: f64,
}

impl Default for MpcConfig {
    fn default() -> Self {
        Self {
            horizon: 30,
            ts: 0.05,
            weights: CostWeights::default(),
            v_min: 0.0,
            v_max: 1.0,
            e_y_max: 1.0,
            acc_max: 1.0,
            obstacle_buffer: 0.05,
        }
    }
}

impl MpcConfig {
    pub fn validate(&self) -> MpcResult<()> {
        if self.horizon == 0 {
            return Err(MpcError::config("horizon must be at least one step"));
        }
        if !(self.ts.is_finite() && self.ts > 0.0) {
            return Err(MpcError::config(format!("sampling time must be positive, got {}", self.ts)));
        }
        self.weights.validate()?;
        if !(self.v_min.is_finite() && self.v_max.is_finite() && self.v_min <= self.v_max) {
            return Err(MpcError::config(format!(
                "velocity bounds must satisfy v_min <= v_max, got [{}, {}]",
                self.v_min, self.v_max
            )));
        }
        if !(self.e_y_max.is_finite() && self.e_y_max > 0.0) {
            return Err(MpcError::config("e_y_max must be positive"));
        }
        if !(self.acc_max.is_finite() && self.acc_max > 0.0) {
            return Err(MpcError::config("acc_max must be positive"));
        }
        if !(self.obstacle_buffer.is_finite() && self.obstacle_buffer >= 0.0) {
            return Err(MpcError::config("obstacle buffer must be non-negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    /// built, no solve attempted yet
    Configured,
    Solving,
    /// between ticks
    Idle,
}

pub struct MpcController<S: NlpSolver = AugmentedLagrangianSolver> {
    config: MpcConfig,
    model: BicycleModel,
    solver: S,
    obstacles: Vec<Obstacle>,
    warm_start: Option<Vec<ControlInput>>,
    last_control: ControlInput,
    prediction: Option<Vec<VehicleState>>,
    status: ControllerStatus,
}

impl<S: NlpSolver> MpcController<S> {
    pub fn new(config: MpcConfig, vehicle: VehicleParams, solver: S) -> MpcResult<Self> {
        config.validate()?;
        let model = BicycleModel::new(vehicle, config.ts)?;
        Ok(Self {
            config,
            model,
            solver,
            obstacles: Vec::new(),
            warm_start: None,
            last_control: ControlInput::zero(),
            prediction: None,
            status: ControllerStatus::Configured,
        })
    }

    /// Register a static circular obstacle
    pub fn add_obstacle(&mut self, obstacle: Obstacle) -> MpcResult<()> {
        let finite = obstacle.cx.is_finite() && obstacle.cy.is_finite() && obstacle.radius.is_finite();
        if !finite || obstacle.radius < 0.0 {
            return Err(MpcError::config(format!("invalid obstacle {:?}", obstacle)));
        }
        self.obstacles.push(obstacle);
        Ok(())
    }

    pub fn with_obstacles(mut self, obstacles: &[Obstacle]) -> MpcResult<Self> {
        for &o in obstacles {
            self.add_obstacle(o)?;
        }
        Ok(self)
    }

    pub fn config(&self) -> &MpcConfig {
        &self.config
    }

    pub fn model(&self) -> &BicycleModel {
        &self.model
    }

    pub fn solver(&self) -> &S {
        &self.solver
    }

    pub fn obstacles(&self) -> &[Obstacle] {
        &self.obstacles
    }

    pub fn status(&self) -> ControllerStatus {
        self.status
    }

    pub fn actuator_bounds(&self) -> ActuatorBounds {
        ActuatorBounds {
            acc_max: self.config.acc_max,
            delta_max: self.model.steering_limit(),
        }
    }

    /// Predicted states x_0..x_N of the last successful solve
    pub fn prediction(&self) -> Option<&[VehicleState]> {
        self.prediction.as_deref()
    }

    pub fn warm_start(&self) -> Option<&[ControlInput]> {
        self.warm_start.as_deref()
    }

    pub fn last_control(&self) -> ControlInput {
        self.last_control
    }

    /// Tell the controller which command was actually applied to the plant,
    /// e.g. a fallback after a failed solve.
    pub fn record_applied(&mut self, control: ControlInput) {
        self.last_control = control;
    }

    /// Forget the warm start and the last prediction
    pub fn reset(&mut self) {
        self.warm_start = None;
        self.prediction = None;
    }

    /// Reference waypoints of stages 0..N starting at `waypoint_index`.
    ///
    /// Circular paths wrap; open paths repeat their last waypoint.
    pub fn horizon_references(&self, path: &ReferencePath, waypoint_index: usize) -> MpcResult<Vec<Waypoint>> {
        path.get_waypoint(waypoint_index)?;
        let last = path.len() - 1;
        (0..self.config.horizon)
            .map(|k| {
                let idx = waypoint_index + k;
                let idx = if path.is_circular() { idx } else { idx.min(last) };
                path.get_waypoint(idx).map(|wp| *wp)
            })
            .collect()
    }

    fn build_problem(&self, state: &VehicleState, path: &ReferencePath, waypoint_index: usize) -> MpcResult<HorizonProblem> {
        Ok(HorizonProblem {
            model: self.model.clone(),
            initial_state: *state,
            references: self.horizon_references(path, waypoint_index)?,
            weights: self.config.weights,
            state_bounds: StateBounds {
                v_min: self.config.v_min,
                v_max: self.config.v_max,
                e_y_max: self.config.e_y_max,
            },
            actuator_bounds: self.actuator_bounds(),
            obstacles: self.obstacles.clone(),
            obstacle_clearance: self.model.safety_margin() + self.config.obstacle_buffer,
            previous_control: self.last_control,
        })
    }

    /// Solve through the configured solver, rejecting malformed solutions
    fn solve_once(&self, problem: &HorizonProblem, guess: &[ControlInput]) -> Result<Solution, SolverError> {
        let solution = self.solver.solve(problem, guess)?;
        let n = problem.horizon();
        if solution.controls.len() != n || solution.states.len() != n + 1 {
            return Err(SolverError::SolverFailure(format!(
                "solution has {} controls and {} states for a horizon of {}",
                solution.controls.len(),
                solution.states.len(),
                n
            )));
        }
        Ok(solution)
    }

    /// Guesses steering to the left and to the right over the first half of
    /// the horizon and back over the second half, at constant speed.
    fn swerve_guesses(&self, guess: &[ControlInput]) -> Vec<Vec<ControlInput>> {
        let bounds = self.actuator_bounds();
        let half = guess.len() / 2;
        let steer = SWERVE_STEERING * bounds.delta_max;
        [1.0, -1.0]
            .iter()
            .map(|side| {
                guess
                    .iter()
                    .enumerate()
                    .map(|(k, u)| {
                        let offset = if k < half { side * steer } else { -side * steer };
                        bounds.clamp(&ControlInput::new(0.0, u.delta + offset))
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn solve(&self, problem: &HorizonProblem, guess: &[ControlInput]) -> Result<Solution, SolverError> {
        let primary = self.solve_once(problem, guess);
        let blocked = match &primary {
            Ok(solution) => problem.obstacle_slack(&solution.states) < BLOCKED_SLACK,
            Err(_) => !self.obstacles.is_empty(),
        };
        if !blocked {
            return primary;
        }

        let mut best = primary;
        for swerve in self.swerve_guesses(guess) {
            match self.solve_once(problem, &swerve) {
                Ok(candidate) => {
                    let better = match &best {
                        Ok(current) => {
                            problem.terminal_progress(&candidate.states)
                                > problem.terminal_progress(&current.states) + PROGRESS_GAIN
                        }
                        Err(_) => true,
                    };
                    if better {
                        debug!(
                            "switching to a swerve plan, terminal progress {:.2} m",
                            problem.terminal_progress(&candidate.states)
                        );
                        best = Ok(candidate);
                    }
                }
                Err(e) => trace!("swerve solve failed: {}", e),
            }
        }
        best
    }

    /// Keep the next velocity inside [v_min, v_max]; it is linear in `acc`
    /// over one sample.
    fn limit_speed(&self, state: &VehicleState, control: ControlInput) -> ControlInput {
        let c = &self.config;
        let lower = ((c.v_min - state.vel) / c.ts).clamp(-c.acc_max, c.acc_max);
        let upper = ((c.v_max - state.vel) / c.ts).clamp(-c.acc_max, c.acc_max);
        ControlInput::new(control.acc.min(upper).max(lower), control.delta)
    }

    /// Solve the horizon problem at `state` and return the first control.
    ///
    /// On a solver failure the warm start is discarded and the error is
    /// returned; the caller decides on a fallback command.
    pub fn get_control(&mut self, state: &VehicleState, path: &ReferencePath, waypoint_index: usize) -> MpcResult<ControlInput> {
        if !path.has_speed_profile() {
            return Err(MpcError::config("reference path has no speed profile"));
        }
        let problem = self.build_problem(state, path, waypoint_index)?;
        let n = self.config.horizon;
        let bounds = self.actuator_bounds();
        let guess: Vec<ControlInput> = match &self.warm_start {
            Some(ws) if ws.len() == n => ws.iter().map(|u| bounds.clamp(u)).collect(),
            _ => vec![bounds.clamp(&self.last_control); n],
        };

        self.status = ControllerStatus::Solving;
        let result = self.solve(&problem, &guess);
        self.status = ControllerStatus::Idle;

        match result {
            Ok(solution) => {
                let first = self.limit_speed(state, solution.controls[0]);
                let mut shifted: Vec<ControlInput> = solution.controls[1..].to_vec();
                shifted.push(solution.controls[n - 1]);
                self.warm_start = Some(shifted);
                self.prediction = Some(solution.states);
                self.last_control = first;
                debug!(
                    "waypoint {}: acc {:.3}, delta {:.3}, cost {:.4}, {} iterations",
                    waypoint_index, first.acc, first.delta, solution.cost, solution.iterations
                );
                Ok(first)
            }
            Err(e) => {
                warn!("solve failed at waypoint {}: {}", waypoint_index, e);
                self.reset();
                Err(e.into())
            }
        }
    }
}
