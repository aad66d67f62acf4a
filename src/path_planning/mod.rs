//! Reference path handling
//!
//! Discretized path construction, waypoint lookup and speed profile.

pub mod cubic_spline;
pub mod reference_path;
pub mod speed_profile;

pub use cubic_spline::Spline2D;
pub use reference_path::{ReferencePath, Smoothing, Waypoint};
pub use speed_profile::{compute_speed_profile, SpeedProfileConstraints};
