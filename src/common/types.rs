//! Common types used throughout bicycle_mpc

use std::f64::consts::PI;

use nalgebra::{Vector2, Vector4};
use serde::{Deserialize, Serialize};

/// 2D point representation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}

impl Point2D {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn origin() -> Self {
        Self { x: 0.0, y: 0.0 }
    }

    pub fn distance(&self, other: &Point2D) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    /// Linear interpolation towards `other`, `t` in [0, 1]
    pub fn lerp(&self, other: &Point2D, t: f64) -> Point2D {
        Point2D::new(self.x + (other.x - self.x) * t, self.y + (other.y - self.y) * t)
    }

    pub fn to_vector(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }
}

impl From<(f64, f64)> for Point2D {
    fn from(tuple: (f64, f64)) -> Self {
        Self { x: tuple.0, y: tuple.1 }
    }
}

impl From<Vector2<f64>> for Point2D {
    fn from(v: Vector2<f64>) -> Self {
        Self { x: v[0], y: v[1] }
    }
}

/// Kinematic bicycle state [pos_x, pos_y, psi, vel]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub pos_x: f64,
    pub pos_y: f64,
    /// heading [rad]
    pub psi: f64,
    /// longitudinal velocity [m/s]
    pub vel: f64,
}

impl VehicleState {
    pub fn new(pos_x: f64, pos_y: f64, psi: f64, vel: f64) -> Self {
        Self { pos_x, pos_y, psi, vel }
    }

    pub fn origin() -> Self {
        Self::new(0.0, 0.0, 0.0, 0.0)
    }

    pub fn position(&self) -> Point2D {
        Point2D::new(self.pos_x, self.pos_y)
    }

    pub fn is_finite(&self) -> bool {
        self.pos_x.is_finite() && self.pos_y.is_finite() && self.psi.is_finite() && self.vel.is_finite()
    }

    pub fn to_vector(&self) -> Vector4<f64> {
        Vector4::new(self.pos_x, self.pos_y, self.psi, self.vel)
    }
}

impl From<Vector4<f64>> for VehicleState {
    fn from(v: Vector4<f64>) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

/// Actuator command for the bicycle model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlInput {
    /// longitudinal acceleration [m/s^2]
    pub acc: f64,
    /// steering angle [rad]
    pub delta: f64,
}

impl ControlInput {
    pub fn new(acc: f64, delta: f64) -> Self {
        Self { acc, delta }
    }

    pub fn zero() -> Self {
        Self { acc: 0.0, delta: 0.0 }
    }

    pub fn to_vector(&self) -> Vector2<f64> {
        Vector2::new(self.acc, self.delta)
    }
}

impl Default for ControlInput {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<Vector2<f64>> for ControlInput {
    fn from(v: Vector2<f64>) -> Self {
        Self { acc: v[0], delta: v[1] }
    }
}

/// Static circular exclusion zone
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    pub cx: f64,
    pub cy: f64,
    pub radius: f64,
}

impl Obstacle {
    pub fn new(cx: f64, cy: f64, radius: f64) -> Self {
        Self { cx, cy, radius }
    }

    pub fn center(&self) -> Point2D {
        Point2D::new(self.cx, self.cy)
    }

    /// Distance from `p` to the obstacle center
    pub fn center_distance(&self, p: &Point2D) -> f64 {
        self.center().distance(p)
    }
}

/// Normalize angle to [-pi, pi]
pub fn normalize_angle(angle: f64) -> f64 {
    let mut a = angle % (2.0 * PI);
    if a > PI {
        a -= 2.0 * PI;
    } else if a < -PI {
        a += 2.0 * PI;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point2d_distance() {
        let p1 = Point2D::new(0.0, 0.0);
        let p2 = Point2D::new(3.0, 4.0);
        assert!((p1.distance(&p2) - 5.0).abs() < 1e-10);
    }

    #[test]
    fn test_normalize_angle() {
        assert!((normalize_angle(3.0 * PI) - PI).abs() < 1e-10);
        assert!((normalize_angle(-0.5 * PI - 2.0 * PI) + 0.5 * PI).abs() < 1e-10);
        assert!((normalize_angle(0.3) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_vehicle_state_vector_roundtrip() {
        let s = VehicleState::new(1.0, -2.0, 0.5, 3.0);
        assert_eq!(VehicleState::from(s.to_vector()), s);
        assert!(!VehicleState::new(f64::NAN, 0.0, 0.0, 0.0).is_finite());
    }
}
