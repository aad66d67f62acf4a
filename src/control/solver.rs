//! Nonlinear program solvers for the receding-horizon problem
//!
//! [`AugmentedLagrangianSolver`] handles the state constraints with a
//! Powell-Hestenes-Rockafellar augmented Lagrangian and minimizes each
//! subproblem over the box-bounded controls with a spectral projected
//! gradient method (Barzilai-Borwein step, Armijo backtracking). Gradients
//! come from a backward adjoint sweep through the Euler-discretized model.
//! Controls are scaled by their bounds so that the box becomes [-1, 1].

use std::time::{Duration, Instant};

use log::{debug, trace};
use nalgebra::{DVector, Vector2, Vector4};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::common::{ControlInput, MotionModel, MpcError, SolverError, VehicleState};
use crate::control::problem::HorizonProblem;

// Armijo sufficient decrease
const ARMIJO: f64 = 1e-4;
const MIN_STEP: f64 = 1e-10;
const MIN_ALPHA: f64 = 1e-10;
const MAX_ALPHA: f64 = 1e3;

/// Optimal control sequence returned by a solver
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    /// u_0..u_{N-1}
    pub controls: Vec<ControlInput>,
    /// predicted x_0..x_N
    pub states: Vec<VehicleState>,
    /// tracking and rate cost, without constraint terms
    pub cost: f64,
    pub max_violation: f64,
    /// inner iterations over all outer updates
    pub iterations: usize,
    /// false when the last subproblem stopped on the iteration cap
    pub converged: bool,
}

/// Stateless solve of one horizon problem.
///
/// `initial_guess` holds one control per stage; implementations may not
/// keep anything between calls.
pub trait NlpSolver {
    fn solve(&self, problem: &HorizonProblem, initial_guess: &[ControlInput]) -> Result<Solution, SolverError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    /// inner iterations per augmented Lagrangian update
    pub max_iterations: usize,
    pub max_outer_iterations: usize,
    /// stationarity tolerance on the scaled projected gradient
    pub tolerance: f64,
    /// largest constraint violation accepted as feasible
    pub feasibility_tolerance: f64,
    pub initial_penalty: f64,
    pub penalty_growth: f64,
    pub max_penalty: f64,
    /// return the last iterate when the inner loop hits its cap
    pub accept_suboptimal: bool,
    /// wall-clock budget per solve [s]
    pub max_solve_time: Option<f64>,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iterations: 150,
            max_outer_iterations: 8,
            tolerance: 1e-5,
            feasibility_tolerance: 5e-3,
            initial_penalty: 10.0,
            penalty_growth: 10.0,
            max_penalty: 1e7,
            accept_suboptimal: true,
            max_solve_time: None,
        }
    }
}

impl SolverSettings {
    pub fn validate(&self) -> Result<(), MpcError> {
        if self.max_iterations == 0 || self.max_outer_iterations == 0 {
            return Err(MpcError::config("solver iteration caps must be positive"));
        }
        let positive = [self.tolerance, self.feasibility_tolerance, self.initial_penalty, self.max_penalty];
        if positive.iter().any(|v| !(v.is_finite() && *v > 0.0)) {
            return Err(MpcError::config("solver tolerances and penalties must be positive"));
        }
        if !(self.penalty_growth.is_finite() && self.penalty_growth >= 1.0) {
            return Err(MpcError::config("penalty growth must be at least 1"));
        }
        match self.max_solve_time {
            Some(t) if !(t.is_finite() && t >= 0.0) => {
                Err(MpcError::config(format!("invalid solve time budget {}", t)))
            }
            _ => Ok(()),
        }
    }
}

struct Deadline {
    start: Instant,
    budget: Option<Duration>,
}

impl Deadline {
    fn new(seconds: Option<f64>) -> Self {
        Self {
            start: Instant::now(),
            budget: seconds.map(|s| Duration::from_secs_f64(s.max(0.0))),
        }
    }

    fn check(&self) -> Result<(), SolverError> {
        match self.budget {
            Some(budget) if self.start.elapsed() >= budget => Err(SolverError::Timeout {
                elapsed: self.start.elapsed(),
            }),
            _ => Ok(()),
        }
    }
}

/// Augmented Lagrangian of a horizon problem in scaled control coordinates
struct Lagrangian<'a> {
    problem: &'a HorizonProblem,
    scale: Vector2<f64>,
    multipliers: DVector<f64>,
    penalty: f64,
}

struct Evaluation {
    value: f64,
    states: Vec<VehicleState>,
    controls: Vec<ControlInput>,
    grad_x: Vec<Vector4<f64>>,
    grad_u: Vec<Vector2<f64>>,
}

impl<'a> Lagrangian<'a> {
    fn controls(&self, z: &DVector<f64>) -> Vec<ControlInput> {
        z.as_slice()
            .chunks(2)
            .map(|c| ControlInput::new(c[0] * self.scale[0], c[1] * self.scale[1]))
            .collect()
    }

    fn scaled(&self, controls: &[ControlInput]) -> DVector<f64> {
        let mut z = Vec::with_capacity(2 * controls.len());
        for u in controls {
            z.push(u.acc / self.scale[0]);
            z.push(u.delta / self.scale[1]);
        }
        project(&DVector::from_vec(z))
    }

    fn constraint_values(&self, states: &[VehicleState], controls: &[ControlInput]) -> Vec<f64> {
        let n = controls.len();
        (1..=n)
            .flat_map(|k| {
                let u = if k < n { Some(&controls[k]) } else { None };
                self.problem.stage_constraints(k, &states[k], u)
            })
            .map(|c| c.value)
            .collect()
    }

    fn evaluate(&self, z: &DVector<f64>) -> Evaluation {
        let p = self.problem;
        let n = p.horizon();
        let controls = self.controls(z);
        let states = p.rollout(&controls);

        let (mut value, mut grad_u) = p.control_rate_cost(&controls);
        let mut grad_x = vec![Vector4::zeros(); n + 1];
        for k in 0..n {
            let c = p.stage_cost(k, &states[k], Some(&controls[k]));
            value += c.value;
            grad_x[k] += c.grad_x;
            grad_u[k] += c.grad_u;
        }
        let terminal = p.stage_cost(n, &states[n], None);
        value += terminal.value;
        grad_x[n] += terminal.grad_x;

        let m = p.constraints_per_stage();
        let rho = self.penalty;
        for k in 1..=n {
            let u = if k < n { Some(&controls[k]) } else { None };
            for (j, con) in p.stage_constraints(k, &states[k], u).iter().enumerate() {
                let lambda = self.multipliers[(k - 1) * m + j];
                let shifted = con.value + lambda / rho;
                value -= lambda * lambda / (2.0 * rho);
                if shifted > 0.0 {
                    value += 0.5 * rho * shifted * shifted;
                    grad_x[k] += con.grad_x * (rho * shifted);
                    if k < n {
                        grad_u[k] += con.grad_u * (rho * shifted);
                    }
                }
            }
        }

        Evaluation { value, states, controls, grad_x, grad_u }
    }

    fn value(&self, z: &DVector<f64>) -> f64 {
        self.evaluate(z).value
    }

    /// Value and gradient in scaled coordinates, by backward adjoint sweep
    fn value_and_gradient(&self, z: &DVector<f64>) -> (f64, DVector<f64>) {
        let eval = self.evaluate(z);
        let n = eval.controls.len();
        let dt = self.problem.dt();
        let mut grad = DVector::zeros(2 * n);
        let mut costate = eval.grad_x[n];
        for k in (0..n).rev() {
            let (a, b) = self
                .problem
                .model
                .jacobians(&eval.states[k].to_vector(), &eval.controls[k].to_vector(), dt);
            let g = eval.grad_u[k] + b.transpose() * costate;
            grad[2 * k] = g[0] * self.scale[0];
            grad[2 * k + 1] = g[1] * self.scale[1];
            costate = eval.grad_x[k] + a.transpose() * costate;
        }
        (eval.value, grad)
    }
}

fn project(z: &DVector<f64>) -> DVector<f64> {
    z.map(|v| v.clamp(-1.0, 1.0))
}

fn projected_gradient_norm(z: &DVector<f64>, g: &DVector<f64>) -> f64 {
    (project(&(z - g)) - z).amax()
}

#[derive(Debug, Clone, Default)]
pub struct AugmentedLagrangianSolver {
    pub settings: SolverSettings,
}

impl AugmentedLagrangianSolver {
    pub fn new(settings: SolverSettings) -> Self {
        Self { settings }
    }

    /// Spectral projected gradient on one subproblem.
    /// Returns the final iterate and whether it stopped on the iteration cap.
    fn minimize(
        &self,
        lagrangian: &Lagrangian,
        mut z: DVector<f64>,
        deadline: &Deadline,
        iterations: &mut usize,
    ) -> Result<(DVector<f64>, bool), SolverError> {
        let (mut f, mut g) = lagrangian.value_and_gradient(&z);
        if !f.is_finite() || g.iter().any(|v| !v.is_finite()) {
            return Err(SolverError::SolverFailure(format!("non-finite cost {} at the initial guess", f)));
        }
        let mut alpha = (1.0 / projected_gradient_norm(&z, &g).max(1e-8)).clamp(MIN_ALPHA, MAX_ALPHA);

        for _ in 0..self.settings.max_iterations {
            deadline.check()?;
            if projected_gradient_norm(&z, &g) < self.settings.tolerance {
                return Ok((z, false));
            }
            *iterations += 1;

            let d = project(&(&z - &g * alpha)) - &z;
            let slope = g.dot(&d);
            let mut t = 1.0;
            let z_new = loop {
                let candidate = &z + &d * t;
                let f_candidate = lagrangian.value(&candidate);
                if f_candidate.is_finite() && f_candidate <= f + ARMIJO * t * slope {
                    break candidate;
                }
                t *= 0.5;
                if t < MIN_STEP {
                    // no descent left at machine precision
                    return Ok((z, false));
                }
            };

            let (f_new, g_new) = lagrangian.value_and_gradient(&z_new);
            if g_new.iter().any(|v| !v.is_finite()) {
                return Err(SolverError::SolverFailure("non-finite gradient".to_string()));
            }
            let s = &z_new - &z;
            let y = &g_new - &g;
            let sy = s.dot(&y);
            alpha = if sy > 0.0 {
                (s.dot(&s) / sy).clamp(MIN_ALPHA, MAX_ALPHA)
            } else {
                MAX_ALPHA
            };
            z = z_new;
            f = f_new;
            g = g_new;
        }
        trace!("inner loop hit {} iterations at value {:.6}", self.settings.max_iterations, f);
        Ok((z, true))
    }
}

impl NlpSolver for AugmentedLagrangianSolver {
    fn solve(&self, problem: &HorizonProblem, initial_guess: &[ControlInput]) -> Result<Solution, SolverError> {
        let settings = &self.settings;
        let n = problem.horizon();
        if n == 0 {
            return Err(SolverError::SolverFailure("empty horizon".to_string()));
        }
        if initial_guess.len() != n {
            return Err(SolverError::SolverFailure(format!(
                "initial guess has {} controls for a horizon of {}",
                initial_guess.len(),
                n
            )));
        }
        let bounds = problem.actuator_bounds;
        let scale = Vector2::new(bounds.acc_max, bounds.delta_max);
        if scale.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(SolverError::SolverFailure(format!("invalid actuator bounds {:?}", bounds)));
        }

        let deadline = Deadline::new(settings.max_solve_time);
        let mut lagrangian = Lagrangian {
            problem,
            scale,
            multipliers: DVector::zeros(problem.num_constraints()),
            penalty: settings.initial_penalty,
        };
        let mut z = lagrangian.scaled(initial_guess);
        let mut iterations = 0;
        let mut hit_limit = false;
        let mut violation = f64::INFINITY;
        let mut previous_violation = f64::INFINITY;

        for outer in 0..settings.max_outer_iterations.max(1) {
            let (z_new, capped) = self.minimize(&lagrangian, z, &deadline, &mut iterations)?;
            z = z_new;
            hit_limit = capped;

            let controls = lagrangian.controls(&z);
            let states = problem.rollout(&controls);
            let g = lagrangian.constraint_values(&states, &controls);
            violation = g
                .iter()
                .map(|v| OrderedFloat(v.max(0.0)))
                .max()
                .map_or(0.0, |v| v.into_inner());
            trace!(
                "outer {}: violation {:.2e}, penalty {:.1e}, iterations {}",
                outer,
                violation,
                lagrangian.penalty,
                iterations
            );
            if violation <= settings.feasibility_tolerance {
                break;
            }

            let rho = lagrangian.penalty;
            for (lambda, gi) in lagrangian.multipliers.iter_mut().zip(g.iter()) {
                *lambda = (*lambda + rho * gi).max(0.0);
            }
            if violation > 0.25 * previous_violation {
                lagrangian.penalty = (rho * settings.penalty_growth).min(settings.max_penalty);
            }
            previous_violation = violation;
        }

        if violation > settings.feasibility_tolerance {
            return Err(SolverError::Infeasible { max_violation: violation });
        }
        if hit_limit && !settings.accept_suboptimal {
            return Err(SolverError::IterationLimitExceeded { iterations });
        }

        let controls = lagrangian.controls(&z);
        let states = problem.rollout(&controls);
        let cost = problem.objective(&states, &controls);
        if !cost.is_finite() {
            return Err(SolverError::SolverFailure(format!("non-finite cost {}", cost)));
        }
        debug!(
            "solved horizon of {} in {} iterations: cost {:.5}, violation {:.2e}",
            n, iterations, cost, violation
        );
        Ok(Solution {
            controls,
            states,
            cost,
            max_violation: violation,
            iterations,
            converged: !hit_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Obstacle;
    use crate::control::problem::{ActuatorBounds, CostWeights, StateBounds};
    use crate::path_planning::Waypoint;
    use crate::vehicle::{BicycleModel, VehicleParams};

    fn straight_problem(horizon: usize, y0: f64, obstacles: Vec<Obstacle>) -> HorizonProblem {
        let model = BicycleModel::new(VehicleParams::default(), 0.1).unwrap();
        let references = (0..horizon)
            .map(|k| Waypoint { x: 0.1 * k as f64, y: 0.0, psi: 0.0, v_ref: 1.0, kappa: 0.0 })
            .collect();
        HorizonProblem {
            actuator_bounds: ActuatorBounds { acc_max: 1.0, delta_max: model.steering_limit() },
            model,
            initial_state: VehicleState::new(0.0, y0, 0.0, 1.0),
            references,
            weights: CostWeights::default(),
            state_bounds: StateBounds { v_min: 0.0, v_max: 2.0, e_y_max: 1.0 },
            obstacles,
            obstacle_clearance: 0.1,
            previous_control: ControlInput::zero(),
        }
    }

    #[test]
    fn test_steers_back_towards_path() {
        let problem = straight_problem(15, 0.2, vec![]);
        let guess = vec![ControlInput::zero(); 15];
        let solution = AugmentedLagrangianSolver::default().solve(&problem, &guess).unwrap();

        assert!(solution.controls[0].delta < 0.0);
        assert_eq!(solution.states.len(), 16);
        let idle = problem.objective(&problem.rollout(&guess), &guess);
        assert!(solution.cost < idle);
        assert!(solution.states[15].pos_y.abs() < 0.2);
    }

    #[test]
    fn test_controls_stay_in_box() {
        let problem = straight_problem(15, 0.8, vec![]);
        let guess = vec![ControlInput::new(5.0, -3.0); 15];
        let solution = AugmentedLagrangianSolver::default().solve(&problem, &guess).unwrap();
        let b = problem.actuator_bounds;
        for u in &solution.controls {
            assert!(u.acc.abs() <= b.acc_max + 1e-12);
            assert!(u.delta.abs() <= b.delta_max + 1e-12);
        }
    }

    #[test]
    fn test_avoids_obstacle_on_path() {
        let obstacle = Obstacle::new(1.5, 0.0, 0.1);
        let problem = straight_problem(20, 0.05, vec![obstacle]);
        let settings = SolverSettings::default();
        let solution = AugmentedLagrangianSolver::new(settings)
            .solve(&problem, &vec![ControlInput::zero(); 20])
            .unwrap();

        assert!(solution.max_violation <= settings.feasibility_tolerance);
        let required = obstacle.radius + problem.obstacle_clearance - settings.feasibility_tolerance;
        for s in &solution.states[1..] {
            assert!(obstacle.center_distance(&s.position()) >= required);
        }
    }

    #[test]
    fn test_unreachable_corridor_is_infeasible() {
        let problem = straight_problem(10, 5.0, vec![]);
        let result = AugmentedLagrangianSolver::default().solve(&problem, &vec![ControlInput::zero(); 10]);
        match result {
            Err(SolverError::Infeasible { max_violation }) => assert!(max_violation > 1.0),
            other => panic!("expected infeasible, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_time_budget_times_out() {
        let problem = straight_problem(10, 0.2, vec![]);
        let settings = SolverSettings { max_solve_time: Some(0.0), ..Default::default() };
        let result = AugmentedLagrangianSolver::new(settings).solve(&problem, &vec![ControlInput::zero(); 10]);
        assert!(matches!(result, Err(SolverError::Timeout { .. })));
    }

    #[test]
    fn test_iteration_cap_without_suboptimal() {
        let problem = straight_problem(10, 0.2, vec![]);
        let settings = SolverSettings {
            max_iterations: 1,
            tolerance: 1e-14,
            accept_suboptimal: false,
            ..Default::default()
        };
        let result = AugmentedLagrangianSolver::new(settings).solve(&problem, &vec![ControlInput::zero(); 10]);
        assert_eq!(result, Err(SolverError::IterationLimitExceeded { iterations: 1 }));

        let settings = SolverSettings { accept_suboptimal: true, ..settings };
        let solution = AugmentedLagrangianSolver::new(settings)
            .solve(&problem, &vec![ControlInput::zero(); 10])
            .unwrap();
        assert!(!solution.converged);
    }

    #[test]
    fn test_settings_validation() {
        assert!(SolverSettings::default().validate().is_ok());
        let bad = SolverSettings { max_solve_time: Some(f64::INFINITY), ..Default::default() };
        assert!(bad.validate().is_err());
        let bad = SolverSettings { penalty_growth: 0.5, ..Default::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_guess_length_checked() {
        let problem = straight_problem(10, 0.2, vec![]);
        let result = AugmentedLagrangianSolver::default().solve(&problem, &[ControlInput::zero()]);
        assert!(matches!(result, Err(SolverError::SolverFailure(_))));
    }
}
