//! Finite-horizon optimal control problem for the kinematic bicycle
//!
//! A [`HorizonProblem`] is an immutable, self-contained description of one
//! solve: dynamics (through the model), initial state, the reference
//! waypoints of every stage, weights, bounds and obstacles. Controls are
//! the decision variables; states follow from an explicit Euler rollout.
//!
//! Stage k (0..N-1) costs `l(x_k, u_k, ref_k)`, the terminal state x_N is
//! compared against the last reference with zero steering lookahead.
//! Inequality constraints `g <= 0` apply to the predicted states x_1..x_N.

use nalgebra::{Vector2, Vector4};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::common::{ControlInput, MotionModel, MpcError, MpcResult, Obstacle, VehicleState};
use crate::path_planning::Waypoint;
use crate::vehicle::BicycleModel;

/// Weights of the quadratic stage cost
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostWeights {
    pub e_y: f64,
    pub e_psi: f64,
    pub vel: f64,
    pub acc: f64,
    pub delta: f64,
    /// penalty on acceleration changes between stages
    pub acc_rate: f64,
    /// penalty on steering changes between stages
    pub delta_rate: f64,
}

impl Default for CostWeights {
    fn default() -> Self {
        Self {
            e_y: 1.0,
            e_psi: 1.0,
            vel: 1.0,
            acc: 0.0,
            delta: 0.0,
            acc_rate: 0.01,
            delta_rate: 0.05,
        }
    }
}

impl CostWeights {
    pub fn validate(&self) -> MpcResult<()> {
        let all = [self.e_y, self.e_psi, self.vel, self.acc, self.delta, self.acc_rate, self.delta_rate];
        if all.iter().any(|w| !(w.is_finite() && *w >= 0.0)) {
            return Err(MpcError::config("cost weights must be finite and non-negative"));
        }
        Ok(())
    }
}

/// Hard state bounds enforced over the horizon
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateBounds {
    pub v_min: f64,
    pub v_max: f64,
    /// bound on |e_y|
    pub e_y_max: f64,
}

/// Box bounds on the actuators, symmetric around zero
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActuatorBounds {
    pub acc_max: f64,
    pub delta_max: f64,
}

impl ActuatorBounds {
    pub fn clamp(&self, u: &ControlInput) -> ControlInput {
        ControlInput::new(
            u.acc.clamp(-self.acc_max, self.acc_max),
            u.delta.clamp(-self.delta_max, self.delta_max),
        )
    }
}

/// Value and gradient of one inequality constraint `g <= 0`
#[derive(Debug, Clone, Copy)]
pub struct ConstraintEval {
    pub value: f64,
    pub grad_x: Vector4<f64>,
    pub grad_u: Vector2<f64>,
}

/// Value and gradients of one stage cost term
#[derive(Debug, Clone, Copy)]
pub struct StageCost {
    pub value: f64,
    pub grad_x: Vector4<f64>,
    pub grad_u: Vector2<f64>,
}

#[derive(Debug, Clone)]
pub struct HorizonProblem {
    pub model: BicycleModel,
    pub initial_state: VehicleState,
    /// one reference waypoint per stage, `horizon` entries
    pub references: Vec<Waypoint>,
    pub weights: CostWeights,
    pub state_bounds: StateBounds,
    pub actuator_bounds: ActuatorBounds,
    pub obstacles: Vec<Obstacle>,
    /// distance kept between the vehicle center and obstacle boundaries
    pub obstacle_clearance: f64,
    /// command applied on the previous tick, anchors the rate penalty
    pub previous_control: ControlInput,
}

impl HorizonProblem {
    pub fn horizon(&self) -> usize {
        self.references.len()
    }

    pub fn dt(&self) -> f64 {
        self.model.ts()
    }

    pub fn constraints_per_stage(&self) -> usize {
        4 + self.obstacles.len()
    }

    /// Number of inequality constraints over stages 1..=N
    pub fn num_constraints(&self) -> usize {
        self.horizon() * self.constraints_per_stage()
    }

    /// Reference of stage k; the terminal stage reuses the last one
    pub fn reference(&self, k: usize) -> &Waypoint {
        &self.references[k.min(self.horizon() - 1)]
    }

    /// Predicted states x_0..x_N under `controls`
    pub fn rollout(&self, controls: &[ControlInput]) -> Vec<VehicleState> {
        let dt = self.dt();
        let mut states = Vec::with_capacity(controls.len() + 1);
        let mut x = self.initial_state.to_vector();
        states.push(self.initial_state);
        for u in controls {
            x = self.model.propagate(&x, &u.to_vector(), dt);
            states.push(VehicleState::from(x));
        }
        states
    }

    /// Tracking cost of stage k, with gradients; `control` is `None` at the terminal stage
    pub fn stage_cost(&self, k: usize, state: &VehicleState, control: Option<&ControlInput>) -> StageCost {
        let w = &self.weights;
        let wp = self.reference(k);
        let err = self.model.tracking_error(state, control, wp);
        let jac = self.model.tracking_error_jacobian(state, control, wp);
        let dv = state.vel - wp.v_ref;

        let mut value = w.e_y * err.e_y.powi(2) + w.e_psi * err.e_psi.powi(2) + w.vel * dv.powi(2);
        let grad_x = jac.e_y_x * (2.0 * w.e_y * err.e_y)
            + jac.e_psi_x * (2.0 * w.e_psi * err.e_psi)
            + Vector4::new(0.0, 0.0, 0.0, 2.0 * w.vel * dv);
        let mut grad_u = jac.e_y_u * (2.0 * w.e_y * err.e_y) + jac.e_psi_u * (2.0 * w.e_psi * err.e_psi);

        if let Some(u) = control {
            value += w.acc * u.acc.powi(2) + w.delta * u.delta.powi(2);
            grad_u += Vector2::new(2.0 * w.acc * u.acc, 2.0 * w.delta * u.delta);
        } else {
            grad_u = Vector2::zeros();
        }

        StageCost { value, grad_x, grad_u }
    }

    /// Control-rate penalty over the whole sequence and its gradient per stage
    pub fn control_rate_cost(&self, controls: &[ControlInput]) -> (f64, Vec<Vector2<f64>>) {
        let w = Vector2::new(self.weights.acc_rate, self.weights.delta_rate);
        let mut value = 0.0;
        let mut grad = vec![Vector2::zeros(); controls.len()];
        let mut prev = self.previous_control.to_vector();
        for (k, u) in controls.iter().enumerate() {
            let d = u.to_vector() - prev;
            value += w.dot(&d.component_mul(&d));
            let g = 2.0 * w.component_mul(&d);
            grad[k] += g;
            if k > 0 {
                grad[k - 1] -= g;
            }
            prev = u.to_vector();
        }
        (value, grad)
    }

    /// Constraints on the predicted state of stage k (1..=N), in a fixed order:
    /// v <= v_max, v >= v_min, e_y <= e_y_max, e_y >= -e_y_max, then one per obstacle.
    pub fn stage_constraints(&self, k: usize, state: &VehicleState, control: Option<&ControlInput>) -> Vec<ConstraintEval> {
        let b = &self.state_bounds;
        let wp = self.reference(k);
        let err = self.model.tracking_error(state, control, wp);
        let jac = self.model.tracking_error_jacobian(state, control, wp);
        let e_v = Vector4::new(0.0, 0.0, 0.0, 1.0);
        let e_y_u = if control.is_some() { jac.e_y_u } else { Vector2::zeros() };

        let mut out = Vec::with_capacity(self.constraints_per_stage());
        out.push(ConstraintEval { value: state.vel - b.v_max, grad_x: e_v, grad_u: Vector2::zeros() });
        out.push(ConstraintEval { value: b.v_min - state.vel, grad_x: -e_v, grad_u: Vector2::zeros() });
        out.push(ConstraintEval { value: err.e_y - b.e_y_max, grad_x: jac.e_y_x, grad_u: e_y_u });
        out.push(ConstraintEval { value: -b.e_y_max - err.e_y, grad_x: -jac.e_y_x, grad_u: -e_y_u });

        for obs in &self.obstacles {
            let dx = state.pos_x - obs.cx;
            let dy = state.pos_y - obs.cy;
            let d = (dx * dx + dy * dy).sqrt();
            let (nx, ny) = if d > 1e-9 { (dx / d, dy / d) } else { (1.0, 0.0) };
            out.push(ConstraintEval {
                value: obs.radius + self.obstacle_clearance - d,
                grad_x: Vector4::new(-nx, -ny, 0.0, 0.0),
                grad_u: Vector2::zeros(),
            });
        }
        out
    }

    /// Total tracking and rate cost of a candidate, without constraint terms
    pub fn objective(&self, states: &[VehicleState], controls: &[ControlInput]) -> f64 {
        let n = controls.len();
        let stages: f64 = (0..n).map(|k| self.stage_cost(k, &states[k], Some(&controls[k])).value).sum();
        stages + self.stage_cost(n, &states[n], None).value + self.control_rate_cost(controls).0
    }

    /// Smallest gap between the predicted states x_1..x_N and the inflated
    /// obstacles, negative inside one; infinite without obstacles
    pub fn obstacle_slack(&self, states: &[VehicleState]) -> f64 {
        states
            .iter()
            .skip(1)
            .flat_map(|s| {
                self.obstacles
                    .iter()
                    .map(move |o| o.center_distance(&s.position()) - o.radius - self.obstacle_clearance)
            })
            .map(OrderedFloat)
            .min()
            .map_or(f64::INFINITY, |v| v.into_inner())
    }

    /// How far the terminal state x_N lies ahead of the last reference,
    /// measured along its heading; negative when the plan lags behind
    pub fn terminal_progress(&self, states: &[VehicleState]) -> f64 {
        let wp = self.reference(self.horizon());
        let x_n = &states[states.len() - 1];
        let (sin_ref, cos_ref) = wp.psi.sin_cos();
        (x_n.pos_x - wp.x) * cos_ref + (x_n.pos_y - wp.y) * sin_ref
    }

    /// Largest constraint violation over the horizon, zero when feasible
    pub fn max_violation(&self, states: &[VehicleState], controls: &[ControlInput]) -> f64 {
        let n = controls.len();
        (1..=n)
            .flat_map(|k| {
                let u = if k < n { Some(&controls[k]) } else { None };
                self.stage_constraints(k, &states[k], u)
            })
            .map(|c| OrderedFloat(c.value.max(0.0)))
            .max()
            .map_or(0.0, |v| v.into_inner())
    }
}
