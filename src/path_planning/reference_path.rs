//! Discretized reference path with heading, curvature and speed profile
//!
//! A path is built once from coarse waypoints: densified to the requested
//! resolution, optionally smoothed, then resampled so that consecutive
//! waypoints are (almost) exactly `resolution` apart. The only later
//! mutation is [`ReferencePath::compute_speed_profile`], which fills the
//! `v_ref` of every waypoint.

use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::common::{normalize_angle, MpcError, MpcResult, Point2D};
use crate::path_planning::cubic_spline::Spline2D;
use crate::path_planning::speed_profile::{compute_speed_profile, SpeedProfileConstraints};

// points closer than this are considered duplicates
const DUPLICATE_EPS: f64 = 1e-9;

/// A single reference point along the path
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Waypoint {
    pub x: f64,
    pub y: f64,
    /// path heading [rad]
    pub psi: f64,
    /// target velocity, zero until a speed profile is computed [m/s]
    pub v_ref: f64,
    /// signed curvature [1/m]
    pub kappa: f64,
}

impl Waypoint {
    pub fn position(&self) -> Point2D {
        Point2D::new(self.x, self.y)
    }
}

/// How the densified waypoint polygon is smoothed before resampling
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Smoothing {
    None,
    /// centered moving average over `window` densified points
    MovingAverage { window: usize },
    /// natural cubic spline through the coarse waypoints, open paths only
    CubicSpline,
}

impl Default for Smoothing {
    fn default() -> Self {
        Smoothing::MovingAverage { window: 5 }
    }
}

#[derive(Debug, Clone)]
pub struct ReferencePath {
    waypoints: Vec<Waypoint>,
    /// distance from waypoint i to its successor
    segment_lengths: Vec<f64>,
    /// arclength of waypoint i measured from waypoint 0
    cumulative_lengths: Vec<f64>,
    circular: bool,
    has_speed_profile: bool,
}

impl ReferencePath {
    /// Build a path from coarse waypoint coordinates.
    pub fn new(
        wp_x: &[f64],
        wp_y: &[f64],
        resolution: f64,
        smoothing: Smoothing,
        circular: bool,
    ) -> MpcResult<Self> {
        if wp_x.len() != wp_y.len() {
            return Err(MpcError::config(format!(
                "waypoint coordinate lengths differ: {} x vs {} y",
                wp_x.len(),
                wp_y.len()
            )));
        }
        let points: Vec<Point2D> = wp_x.iter().zip(wp_y.iter()).map(|(&x, &y)| Point2D::new(x, y)).collect();
        Self::from_points(&points, resolution, smoothing, circular)
    }

    pub fn from_points(
        points: &[Point2D],
        resolution: f64,
        smoothing: Smoothing,
        circular: bool,
    ) -> MpcResult<Self> {
        if !(resolution.is_finite() && resolution > 0.0) {
            return Err(MpcError::config(format!("path resolution must be positive, got {}", resolution)));
        }
        if points.iter().any(|p| !(p.x.is_finite() && p.y.is_finite())) {
            return Err(MpcError::config("waypoints must be finite"));
        }
        let coarse = dedup_points(points, circular);
        let min_points = if circular { 3 } else { 2 };
        if coarse.len() < min_points {
            return Err(MpcError::config(format!(
                "need at least {} distinct waypoints, got {}",
                min_points,
                coarse.len()
            )));
        }

        let path = match smoothing {
            Smoothing::CubicSpline => {
                if circular {
                    return Err(MpcError::config("cubic spline smoothing supports open paths only"));
                }
                Self::from_spline(&coarse, resolution)?
            }
            Smoothing::None => {
                let dense = densify(&coarse, resolution, circular);
                Self::from_samples(resample(&dense, resolution, circular), circular)?
            }
            Smoothing::MovingAverage { window } => {
                if window == 0 {
                    return Err(MpcError::config("smoothing window must be positive"));
                }
                let dense = densify(&coarse, resolution, circular);
                let smoothed = moving_average(&dense, window, circular);
                Self::from_samples(resample(&smoothed, resolution, circular), circular)?
            }
        };

        debug!(
            "reference path: {} waypoints, length {:.3} m, circular {}",
            path.len(),
            path.length(),
            circular
        );
        Ok(path)
    }

    fn from_spline(coarse: &[Point2D], resolution: f64) -> MpcResult<Self> {
        let spline = Spline2D::new(coarse)?;
        let total = spline.length();
        let m = ((total / resolution).round() as usize).max(1);
        let stations: Vec<f64> = (0..=m).map(|k| total * k as f64 / m as f64).collect();
        let points: Vec<Point2D> = stations.iter().map(|&s| spline.calc_position(s)).collect();
        let mut path = Self::from_samples(points, false)?;
        for (wp, &s) in path.waypoints.iter_mut().zip(stations.iter()) {
            wp.psi = spline.calc_yaw(s);
            wp.kappa = spline.calc_curvature(s);
        }
        Ok(path)
    }

    /// Derive segment lengths, heading and curvature from resampled points
    fn from_samples(points: Vec<Point2D>, circular: bool) -> MpcResult<Self> {
        let points = dedup_points(&points, circular);
        let n = points.len();
        if n < 2 || (circular && n < 3) {
            return Err(MpcError::config("path degenerates to fewer than the minimum waypoints"));
        }

        let mut segment_lengths: Vec<f64> = points.iter().tuple_windows().map(|(a, b)| a.distance(b)).collect();
        if circular {
            segment_lengths.push(points[n - 1].distance(&points[0]));
        }
        let mut cumulative_lengths = Vec::with_capacity(n);
        cumulative_lengths.push(0.0);
        for i in 1..n {
            cumulative_lengths.push(cumulative_lengths[i - 1] + segment_lengths[i - 1]);
        }

        let neighbours = |i: usize| -> (usize, usize) {
            if circular {
                ((i + n - 1) % n, (i + 1) % n)
            } else {
                (i.saturating_sub(1), (i + 1).min(n - 1))
            }
        };

        let psi: Vec<f64> = (0..n)
            .map(|i| {
                let (prev, next) = neighbours(i);
                (points[next].y - points[prev].y).atan2(points[next].x - points[prev].x)
            })
            .collect();

        let waypoints = (0..n)
            .map(|i| {
                let (prev, next) = neighbours(i);
                let arc = if circular {
                    segment_lengths[prev] + segment_lengths[i]
                } else {
                    cumulative_lengths[next] - cumulative_lengths[prev]
                };
                Waypoint {
                    x: points[i].x,
                    y: points[i].y,
                    psi: psi[i],
                    v_ref: 0.0,
                    kappa: normalize_angle(psi[next] - psi[prev]) / arc,
                }
            })
            .collect();

        Ok(ReferencePath {
            waypoints,
            segment_lengths,
            cumulative_lengths,
            circular,
            has_speed_profile: false,
        })
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn is_circular(&self) -> bool {
        self.circular
    }

    pub fn has_speed_profile(&self) -> bool {
        self.has_speed_profile
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub fn segment_lengths(&self) -> &[f64] {
        &self.segment_lengths
    }

    pub fn cumulative_lengths(&self) -> &[f64] {
        &self.cumulative_lengths
    }

    /// Total path length, including the closing segment on circular paths
    pub fn length(&self) -> f64 {
        self.segment_lengths.iter().sum()
    }

    /// Arclength of the waypoint at `index` (wrapped on circular paths)
    pub fn arclength(&self, index: usize) -> MpcResult<f64> {
        Ok(self.cumulative_lengths[self.resolve_index(index)?])
    }

    fn resolve_index(&self, index: usize) -> MpcResult<usize> {
        if self.circular {
            Ok(index % self.len())
        } else if index < self.len() {
            Ok(index)
        } else {
            Err(MpcError::OutOfRange { index, len: self.len() })
        }
    }

    /// Waypoint at `index`, modulo the path length on circular paths
    pub fn get_waypoint(&self, index: usize) -> MpcResult<&Waypoint> {
        Ok(&self.waypoints[self.resolve_index(index)?])
    }

    /// Index of the waypoint whose arclength is closest to `traveled_distance`.
    ///
    /// The bracketing waypoints are found by binary search over the
    /// cumulative lengths. On an exact tie the later waypoint wins. Circular
    /// paths wrap the distance by the lap length; open paths clamp to the
    /// first/last waypoint.
    pub fn closest_waypoint(&self, traveled_distance: f64) -> usize {
        let n = self.len();
        let total = self.length();
        let s = if self.circular && total > 0.0 {
            traveled_distance.rem_euclid(total)
        } else {
            traveled_distance
        };

        let next = self.cumulative_lengths.partition_point(|&c| c <= s);
        if next == 0 {
            return 0;
        }
        let prev = next - 1;
        let (next_index, s_next) = if next < n {
            (next, self.cumulative_lengths[next])
        } else if self.circular {
            (0, total)
        } else {
            return n - 1;
        };

        if (s - s_next).abs() <= (s - self.cumulative_lengths[prev]).abs() {
            next_index
        } else {
            prev
        }
    }

    /// Fill `v_ref` of every waypoint from the path curvature.
    pub fn compute_speed_profile(&mut self, constraints: &SpeedProfileConstraints) -> MpcResult<()> {
        let kappa: Vec<f64> = self.waypoints.iter().map(|wp| wp.kappa).collect();
        let v = compute_speed_profile(&kappa, &self.segment_lengths, self.circular, constraints)?;
        for (wp, v_ref) in self.waypoints.iter_mut().zip(v) {
            wp.v_ref = v_ref;
        }
        self.has_speed_profile = true;
        Ok(())
    }
}

/// Drop consecutive duplicates, and the closing point of a loop that repeats the start
fn dedup_points(points: &[Point2D], circular: bool) -> Vec<Point2D> {
    let mut out: Vec<Point2D> = points
        .iter()
        .copied()
        .coalesce(|a, b| if a.distance(&b) < DUPLICATE_EPS { Ok(a) } else { Err((a, b)) })
        .collect();
    if circular {
        while out.len() > 1 && out[out.len() - 1].distance(&out[0]) < DUPLICATE_EPS {
            out.pop();
        }
    }
    out
}

/// Insert evenly spaced points so no gap exceeds `resolution`
fn densify(points: &[Point2D], resolution: f64, circular: bool) -> Vec<Point2D> {
    let closing = if circular { Some((points[points.len() - 1], points[0])) } else { None };
    let mut dense = Vec::new();
    for (a, b) in points.iter().copied().tuple_windows().chain(closing) {
        let n_sub = ((a.distance(&b) / resolution).ceil() as usize).max(1);
        dense.extend((0..n_sub).map(|k| a.lerp(&b, k as f64 / n_sub as f64)));
    }
    if !circular {
        dense.push(points[points.len() - 1]);
    }
    dense
}

fn moving_average(points: &[Point2D], window: usize, circular: bool) -> Vec<Point2D> {
    let n = points.len();
    let half = window / 2;
    (0..n)
        .map(|i| {
            // open paths shrink the window near the ends so endpoints stay fixed
            let h = if circular { half.min((n - 1) / 2) } else { half.min(i).min(n - 1 - i) };
            let (mut sx, mut sy) = (0.0, 0.0);
            for k in 0..=2 * h {
                let p = points[(i + n + k - h) % n];
                sx += p.x;
                sy += p.y;
            }
            let count = (2 * h + 1) as f64;
            Point2D::new(sx / count, sy / count)
        })
        .collect()
}

/// Resample a polyline at (nearly) uniform arclength spacing
fn resample(points: &[Point2D], resolution: f64, circular: bool) -> Vec<Point2D> {
    let mut poly = points.to_vec();
    if circular {
        poly.push(points[0]);
    }
    let mut cum = Vec::with_capacity(poly.len());
    cum.push(0.0);
    for (i, (a, b)) in poly.iter().tuple_windows().enumerate() {
        cum.push(cum[i] + a.distance(b));
    }
    let total = cum[cum.len() - 1];
    let m = ((total / resolution).round() as usize).max(1);
    let count = if circular { m } else { m + 1 };

    let mut seg = 0;
    (0..count)
        .map(|k| {
            let s = total * k as f64 / m as f64;
            while seg + 2 < cum.len() && cum[seg + 1] < s {
                seg += 1;
            }
            let ds = cum[seg + 1] - cum[seg];
            let t = if ds > 0.0 { ((s - cum[seg]) / ds).clamp(0.0, 1.0) } else { 0.0 };
            poly[seg].lerp(&poly[seg + 1], t)
        })
        .collect()
}
