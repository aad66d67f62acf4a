//! Scenario parameters
//!
//! Every parameter group deserializes from TOML with per-field defaults, so
//! a scenario file only needs to list what it changes:
//!
//! ```toml
//! [mpc]
//! horizon = 25
//! ts = 0.1
//!
//! [path]
//! wp_x = [0.0, 10.0, 10.0, 0.0]
//! wp_y = [0.0, 0.0, 10.0, 10.0]
//! circular = true
//! smoothing = { method = "moving_average", window = 51 }
//!
//! [[obstacles]]
//! cx = 10.0
//! cy = 5.0
//! radius = 0.3
//! ```

use std::fs::read_to_string;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::common::{MpcError, MpcResult, Obstacle, VehicleState};
use crate::control::{AugmentedLagrangianSolver, MpcConfig, MpcController, SolverSettings};
use crate::path_planning::{ReferencePath, Smoothing, SpeedProfileConstraints};
use crate::simulation::{ControlLoop, LoopConfig};
use crate::vehicle::VehicleParams;

/// Coarse waypoints and how to turn them into a reference path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    pub wp_x: Vec<f64>,
    pub wp_y: Vec<f64>,
    /// waypoint spacing of the discretized path [m]
    pub resolution: f64,
    pub smoothing: Smoothing,
    pub circular: bool,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            wp_x: vec![0.0, 10.0, 10.0, 0.0],
            wp_y: vec![0.0, 0.0, 10.0, 10.0],
            resolution: 0.05,
            smoothing: Smoothing::MovingAverage { window: 101 },
            circular: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub vehicle: VehicleParams,
    pub mpc: MpcConfig,
    pub solver: SolverSettings,
    pub speed_profile: SpeedProfileConstraints,
    pub control_loop: LoopConfig,
    pub path: PathConfig,
    pub obstacles: Vec<Obstacle>,
    /// defaults to standing still on the first waypoint
    pub initial_state: Option<VehicleState>,
}

/// Parse a scenario from TOML text
pub fn from_toml_str(s: &str) -> MpcResult<ScenarioConfig> {
    let config: ScenarioConfig = toml::from_str(s)?;
    config.validate()?;
    Ok(config)
}

/// Load a scenario file
pub fn load<P: AsRef<Path>>(path: P) -> MpcResult<ScenarioConfig> {
    let text = read_to_string(path.as_ref())?;
    let config = from_toml_str(&text)?;
    info!("loaded scenario from {:?}", path.as_ref());
    Ok(config)
}

impl ScenarioConfig {
    pub fn validate(&self) -> MpcResult<()> {
        self.mpc.validate()?;
        self.solver.validate()?;
        self.speed_profile.validate()?;
        self.control_loop.validate()?;
        if self.path.wp_x.len() != self.path.wp_y.len() {
            return Err(MpcError::config("wp_x and wp_y must have the same length"));
        }
        Ok(())
    }

    /// Discretize the waypoints and attach the speed profile
    pub fn build_path(&self) -> MpcResult<ReferencePath> {
        let p = &self.path;
        let mut path = ReferencePath::new(&p.wp_x, &p.wp_y, p.resolution, p.smoothing, p.circular)?;
        path.compute_speed_profile(&self.speed_profile)?;
        Ok(path)
    }

    /// Wire path, controller and plant into a ready-to-run loop
    pub fn build(&self) -> MpcResult<ControlLoop<AugmentedLagrangianSolver>> {
        self.validate()?;
        let path = self.build_path()?;
        let controller = MpcController::new(self.mpc, self.vehicle, AugmentedLagrangianSolver::new(self.solver))?
            .with_obstacles(&self.obstacles)?;
        let initial_state = match self.initial_state {
            Some(s) => s,
            None => {
                let start = path.get_waypoint(0)?;
                VehicleState::new(start.x, start.y, start.psi, 0.0)
            }
        };
        ControlLoop::new(path, controller, self.control_loop, initial_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
        [vehicle]
        wheelbase = 0.8

        [mpc]
        horizon = 12
        ts = 0.1
        e_y_max = 2.0

        [mpc.weights]
        e_y = 2.0

        [solver]
        max_solve_time = 0.5

        [control_loop]
        max_iterations = 40

        [path]
        wp_x = [0.0, 5.0, 5.0]
        wp_y = [0.0, 0.0, 5.0]
        resolution = 0.1
        circular = false
        smoothing = { method = "moving_average", window = 7 }

        [[obstacles]]
        cx = 5.0
        cy = 2.5
        radius = 0.2

        [[obstacles]]
        cx = 2.0
        cy = 1.5
        radius = 0.1
    "#;

    #[test]
    fn test_parse_overrides_and_defaults() {
        let c = from_toml_str(SCENARIO).unwrap();
        assert_eq!(c.vehicle.wheelbase, 0.8);
        assert_eq!(c.vehicle.width, VehicleParams::default().width);
        assert_eq!(c.mpc.horizon, 12);
        assert_eq!(c.mpc.weights.e_y, 2.0);
        assert_eq!(c.mpc.weights.e_psi, 1.0);
        assert_eq!(c.solver.max_solve_time, Some(0.5));
        assert_eq!(c.control_loop.max_iterations, 40);
        assert_eq!(c.control_loop.max_consecutive_failures, 3);
        assert_eq!(c.path.smoothing, Smoothing::MovingAverage { window: 7 });
        assert_eq!(c.obstacles, vec![Obstacle::new(5.0, 2.5, 0.2), Obstacle::new(2.0, 1.5, 0.1)]);
        assert!(c.initial_state.is_none());
    }

    #[test]
    fn test_empty_file_is_default() {
        let c = from_toml_str("").unwrap();
        assert_eq!(c, ScenarioConfig::default());
        assert_eq!(c.solver.max_solve_time, None);
    }

    #[test]
    fn test_syntax_error_reported() {
        let result = from_toml_str("[mpc\nhorizon = 3");
        assert!(matches!(result, Err(MpcError::ConfigLoad(_))));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = from_toml_str("[mpc]\nhorizon = 0");
        assert!(matches!(result, Err(MpcError::Configuration(_))));
        let result = from_toml_str("[path]\nwp_x = [0.0, 1.0]\nwp_y = [0.0]");
        assert!(matches!(result, Err(MpcError::Configuration(_))));
    }

    #[test]
    fn test_build_starts_on_first_waypoint() {
        let c = from_toml_str(SCENARIO).unwrap();
        let cl = c.build().unwrap();
        let start = cl.path().get_waypoint(0).unwrap();
        assert_eq!(cl.state().pos_x, start.x);
        assert_eq!(cl.state().psi, start.psi);
        assert_eq!(cl.state().vel, 0.0);
        assert_eq!(cl.controller().obstacles().len(), 2);
        assert!(cl.path().has_speed_profile());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(load("/nonexistent/scenario.toml"), Err(MpcError::Io(_))));
    }
}
