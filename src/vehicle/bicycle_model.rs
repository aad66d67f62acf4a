//! Kinematic bicycle model
//!
//! State [pos_x, pos_y, psi, vel], input [acc, delta]:
//!
//! ```text
//! d(pos_x)/dt = vel * cos(psi)
//! d(pos_y)/dt = vel * sin(psi)
//! d(psi)/dt   = vel / L * tan(delta)
//! d(vel)/dt   = acc
//! ```
//!
//! Tracking errors against a reference waypoint are projected one sample
//! `ts` ahead with a forward-Euler step, so the controller corrects for the
//! heading change the chosen steering is about to produce.

use std::f64::consts::FRAC_PI_2;

use nalgebra::{Matrix4, Matrix4x2, Vector2, Vector4};
use serde::{Deserialize, Serialize};

use crate::common::{normalize_angle, ControlInput, MotionModel, MpcError, MpcResult, VehicleState};
use crate::path_planning::{ReferencePath, Waypoint};

/// Geometric and actuator parameters of the vehicle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleParams {
    /// wheelbase L [m]
    pub wheelbase: f64,
    /// body width [m]
    pub width: f64,
    /// maximum steering angle delta_max [rad]
    pub max_steering_angle: f64,
}

impl Default for VehicleParams {
    fn default() -> Self {
        Self {
            wheelbase: 1.0,
            width: 0.6,
            max_steering_angle: 0.5,
        }
    }
}

/// Lateral and heading error relative to a reference waypoint
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingError {
    pub e_psi: f64,
    pub e_y: f64,
}

/// Partial derivatives of the tracking errors
#[derive(Debug, Clone, Copy)]
pub struct TrackingErrorJacobian {
    pub e_psi_x: Vector4<f64>,
    pub e_psi_u: Vector2<f64>,
    pub e_y_x: Vector4<f64>,
    pub e_y_u: Vector2<f64>,
}

#[derive(Debug, Clone)]
pub struct BicycleModel {
    params: VehicleParams,
    ts: f64,
}

impl BicycleModel {
    /// Create a model sampled every `ts` seconds
    pub fn new(params: VehicleParams, ts: f64) -> MpcResult<Self> {
        if !(params.wheelbase.is_finite() && params.wheelbase > 0.0) {
            return Err(MpcError::config(format!("wheelbase must be positive, got {}", params.wheelbase)));
        }
        if !(params.width.is_finite() && params.width >= 0.0) {
            return Err(MpcError::config(format!("vehicle width must be non-negative, got {}", params.width)));
        }
        if !(ts.is_finite() && ts > 0.0) {
            return Err(MpcError::config(format!("sample time must be positive, got {}", ts)));
        }
        if !(params.max_steering_angle > 0.0 && params.max_steering_angle < FRAC_PI_2) {
            return Err(MpcError::config(format!(
                "max steering angle must lie in (0, pi/2), got {}",
                params.max_steering_angle
            )));
        }
        let model = BicycleModel { params, ts };
        // tan(delta) in the dynamics is singular at pi/2
        if model.steering_limit() >= FRAC_PI_2 {
            return Err(MpcError::config(format!(
                "steering bound tan(delta_max)/L = {:.3} rad reaches pi/2; increase the wheelbase or reduce delta_max",
                model.steering_limit()
            )));
        }
        Ok(model)
    }

    pub fn params(&self) -> &VehicleParams {
        &self.params
    }

    pub fn wheelbase(&self) -> f64 {
        self.params.wheelbase
    }

    pub fn ts(&self) -> f64 {
        self.ts
    }

    /// Actuator bound on |delta|: tan(delta_max) / L
    pub fn steering_limit(&self) -> f64 {
        self.params.max_steering_angle.tan() / self.params.wheelbase
    }

    /// Clearance added to obstacle radii, from an ellipse around the body
    pub fn safety_margin(&self) -> f64 {
        self.params.width / 2f64.sqrt()
    }

    /// Continuous-time state derivative
    pub fn state_derivative(&self, state: &VehicleState, control: &ControlInput) -> Vector4<f64> {
        self.derivatives(&state.to_vector(), &control.to_vector())
    }

    /// Tracking errors against `waypoint`, projected one sample ahead.
    ///
    /// `e_y` is the offset normal to the waypoint heading,
    /// `-(x - x_ref) sin(psi_ref) + (y - y_ref) cos(psi_ref)`, so on a path
    /// along the x axis it reduces to `pos_y - y_ref`. Without a control
    /// (terminal stage) the projection assumes zero steering.
    pub fn tracking_error(&self, state: &VehicleState, control: Option<&ControlInput>, waypoint: &Waypoint) -> TrackingError {
        let delta = control.map_or(0.0, |u| u.delta);
        let e_psi = normalize_angle(state.psi - waypoint.psi) + state.vel / self.params.wheelbase * delta.tan() * self.ts;
        let (sin_ref, cos_ref) = waypoint.psi.sin_cos();
        let lateral = -(state.pos_x - waypoint.x) * sin_ref + (state.pos_y - waypoint.y) * cos_ref;
        let e_y = lateral + state.vel * e_psi.sin() * self.ts;
        TrackingError { e_psi, e_y }
    }

    /// Gradients of [`BicycleModel::tracking_error`] with respect to state and control
    pub fn tracking_error_jacobian(
        &self,
        state: &VehicleState,
        control: Option<&ControlInput>,
        waypoint: &Waypoint,
    ) -> TrackingErrorJacobian {
        let l = self.params.wheelbase;
        let ts = self.ts;
        let v = state.vel;
        let delta = control.map_or(0.0, |u| u.delta);
        let err = self.tracking_error(state, control, waypoint);
        let (sin_e, cos_e) = err.e_psi.sin_cos();
        let (sin_ref, cos_ref) = waypoint.psi.sin_cos();

        let de_psi_dv = delta.tan() * ts / l;
        let de_psi_ddelta = if control.is_some() { v * ts / (l * delta.cos().powi(2)) } else { 0.0 };

        let e_psi_x = Vector4::new(0.0, 0.0, 1.0, de_psi_dv);
        let e_psi_u = Vector2::new(0.0, de_psi_ddelta);
        let e_y_x = Vector4::new(
            -sin_ref,
            cos_ref,
            v * cos_e * ts,
            sin_e * ts + v * cos_e * ts * de_psi_dv,
        );
        let e_y_u = Vector2::new(0.0, v * cos_e * ts * de_psi_ddelta);

        TrackingErrorJacobian { e_psi_x, e_psi_u, e_y_x, e_y_u }
    }

    /// Waypoint index closest to the distance traveled along `path`
    pub fn select_waypoint(&self, path: &ReferencePath, traveled_distance: f64) -> usize {
        path.closest_waypoint(traveled_distance)
    }
}

impl MotionModel<4, 2> for BicycleModel {
    fn derivatives(&self, x: &Vector4<f64>, u: &Vector2<f64>) -> Vector4<f64> {
        let (psi, vel) = (x[2], x[3]);
        let (acc, delta) = (u[0], u[1]);
        Vector4::new(
            vel * psi.cos(),
            vel * psi.sin(),
            vel / self.params.wheelbase * delta.tan(),
            acc,
        )
    }

    fn jacobians(&self, x: &Vector4<f64>, u: &Vector2<f64>, dt: f64) -> (Matrix4<f64>, Matrix4x2<f64>) {
        let (psi, v) = (x[2], x[3]);
        let delta = u[1];
        let l = self.params.wheelbase;

        let a = Matrix4::new(
            1.0, 0.0, -dt * v * psi.sin(), dt * psi.cos(),
            0.0, 1.0, dt * v * psi.cos(), dt * psi.sin(),
            0.0, 0.0, 1.0, dt * delta.tan() / l,
            0.0, 0.0, 0.0, 1.0,
        );
        let b = Matrix4x2::new(
            0.0, 0.0,
            0.0, 0.0,
            0.0, dt * v / (l * delta.cos().powi(2)),
            dt, 0.0,
        );
        (a, b)
    }
}
