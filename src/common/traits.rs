//! Common traits defining interfaces between models, solvers and simulators

use nalgebra::{SMatrix, SVector};

/// Continuous-time motion model with `NX` states and `NU` inputs
pub trait MotionModel<const NX: usize, const NU: usize> {
    /// State derivative dx/dt = f(x, u)
    fn derivatives(&self, x: &SVector<f64, NX>, u: &SVector<f64, NU>) -> SVector<f64, NX>;

    /// One explicit Euler step, the discretization used over the prediction horizon
    fn propagate(&self, x: &SVector<f64, NX>, u: &SVector<f64, NU>, dt: f64) -> SVector<f64, NX> {
        x + self.derivatives(x, u) * dt
    }

    /// Jacobians of `propagate` with respect to state and input
    fn jacobians(
        &self,
        x: &SVector<f64, NX>,
        u: &SVector<f64, NU>,
        dt: f64,
    ) -> (SMatrix<f64, NX, NX>, SMatrix<f64, NX, NU>);
}
