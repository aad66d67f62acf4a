//! Velocity profile along a discretized reference path
//!
//! The profile is the pointwise minimum of the speed limit and the
//! lateral-acceleration limit at each waypoint, smoothed by a backward pass
//! (braking into constrained points) and a forward pass (accelerating out of
//! them).

use log::debug;
use serde::{Deserialize, Serialize};

use crate::common::{MpcError, MpcResult};

// below this curvature a waypoint is treated as straight
const KAPPA_EPS: f64 = 1e-9;

// circular paths need at most a couple of laps to settle
const MAX_LAPS: usize = 3;

/// Bounds used to compute the speed profile
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedProfileConstraints {
    /// maximum deceleration, must be <= 0 [m/s^2]
    pub a_min: f64,
    /// maximum acceleration, must be >= 0 [m/s^2]
    pub a_max: f64,
    pub v_min: f64,
    pub v_max: f64,
    /// maximum lateral acceleration [m/s^2]
    pub ay_max: f64,
}

impl Default for SpeedProfileConstraints {
    fn default() -> Self {
        Self {
            a_min: -0.1,
            a_max: 0.5,
            v_min: 0.0,
            v_max: 1.0,
            ay_max: 4.0,
        }
    }
}

impl SpeedProfileConstraints {
    pub fn validate(&self) -> MpcResult<()> {
        let finite = [self.a_min, self.a_max, self.v_min, self.v_max, self.ay_max]
            .iter()
            .all(|v| v.is_finite());
        if !finite {
            return Err(MpcError::config("speed profile constraints must be finite"));
        }
        if self.a_min > 0.0 || self.a_max < 0.0 {
            return Err(MpcError::config(format!(
                "speed profile needs a_min <= 0 <= a_max, got [{}, {}]",
                self.a_min, self.a_max
            )));
        }
        if self.v_min < 0.0 || self.v_min > self.v_max {
            return Err(MpcError::config(format!(
                "speed profile needs 0 <= v_min <= v_max, got [{}, {}]",
                self.v_min, self.v_max
            )));
        }
        if self.ay_max <= 0.0 {
            return Err(MpcError::config("ay_max must be positive"));
        }
        Ok(())
    }

    /// Speed limit at a point of curvature `kappa`, before longitudinal smoothing
    fn pointwise_limit(&self, kappa: f64) -> f64 {
        let lateral = if kappa.abs() > KAPPA_EPS {
            (self.ay_max / kappa.abs()).sqrt()
        } else {
            f64::INFINITY
        };
        self.v_max.min(lateral).max(self.v_min)
    }
}

/// Compute the target velocity of every waypoint.
///
/// `segment_lengths[i]` is the distance from waypoint `i` to its successor;
/// on circular paths the last entry closes the loop.
pub fn compute_speed_profile(
    curvature: &[f64],
    segment_lengths: &[f64],
    circular: bool,
    constraints: &SpeedProfileConstraints,
) -> MpcResult<Vec<f64>> {
    constraints.validate()?;
    let n = curvature.len();
    let expected_segments = if circular { n } else { n.saturating_sub(1) };
    if segment_lengths.len() != expected_segments {
        return Err(MpcError::config(format!(
            "expected {} segment lengths for {} waypoints, got {}",
            expected_segments,
            n,
            segment_lengths.len()
        )));
    }

    let mut v: Vec<f64> = curvature.iter().map(|&k| constraints.pointwise_limit(k)).collect();
    if n < 2 {
        return Ok(v);
    }

    // pairs (i, i + 1) in path order, including the closing pair on loops
    let pairs: Vec<(usize, usize)> = (0..expected_segments).map(|i| (i, (i + 1) % n)).collect();
    let laps = if circular { MAX_LAPS } else { 1 };

    for lap in 0..laps {
        let mut changed = false;
        for &(i, j) in pairs.iter().rev() {
            let reachable = (v[j].powi(2) - 2.0 * constraints.a_min * segment_lengths[i]).sqrt();
            if reachable < v[i] {
                v[i] = reachable;
                changed = true;
            }
        }
        if !changed && lap > 0 {
            break;
        }
    }

    for lap in 0..laps {
        let mut changed = false;
        for &(i, j) in pairs.iter() {
            let reachable = (v[i].powi(2) + 2.0 * constraints.a_max * segment_lengths[i]).sqrt();
            if reachable < v[j] {
                v[j] = reachable;
                changed = true;
            }
        }
        if !changed && lap > 0 {
            break;
        }
    }

    debug!(
        "speed profile over {} waypoints: min {:.3} m/s, max {:.3} m/s",
        n,
        v.iter().cloned().fold(f64::INFINITY, f64::min),
        v.iter().cloned().fold(0.0, f64::max)
    );
    Ok(v)
}
