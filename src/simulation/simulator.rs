//! Plant simulation with classical fourth-order Runge-Kutta
//!
//! The controller predicts with Euler steps; the plant is advanced with RK4
//! so that closed-loop runs see a realistic model mismatch.

use log::error;
use nalgebra::{SVector, Vector2, Vector4};

use crate::common::{ControlInput, MotionModel, MpcError, MpcResult, VehicleState};

/// Integrates a [`MotionModel`] one control interval at a time
#[derive(Debug, Clone)]
pub struct Simulator<M> {
    model: M,
}

/// One RK4 step of `model` under a constant input
pub fn rk4_step<M, const NX: usize, const NU: usize>(
    model: &M,
    x: &SVector<f64, NX>,
    u: &SVector<f64, NU>,
    dt: f64,
) -> SVector<f64, NX>
where
    M: MotionModel<NX, NU>,
{
    let k1 = model.derivatives(x, u);
    let k2 = model.derivatives(&(x + k1 * (dt / 2.0)), u);
    let k3 = model.derivatives(&(x + k2 * (dt / 2.0)), u);
    let k4 = model.derivatives(&(x + k3 * dt), u);
    x + (k1 + k2 * 2.0 + k3 * 2.0 + k4) * (dt / 6.0)
}

impl<M: MotionModel<4, 2>> Simulator<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Advance `state` by `dt` holding `control` constant.
    pub fn step(&self, state: &VehicleState, control: &ControlInput, dt: f64) -> MpcResult<VehicleState> {
        if !(dt.is_finite() && dt > 0.0) {
            return Err(MpcError::config(format!("integration step must be positive, got {}", dt)));
        }
        let x: Vector4<f64> = state.to_vector();
        let u: Vector2<f64> = control.to_vector();
        let next = VehicleState::from(rk4_step(&self.model, &x, &u, dt));
        if !next.is_finite() {
            error!("integration diverged from {:?} under {:?} with dt {}", state, control, dt);
            return Err(MpcError::IntegrationDivergence {
                state: *state,
                control: *control,
                dt,
            });
        }
        Ok(next)
    }
}
