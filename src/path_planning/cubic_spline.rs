// Cubic spline through coarse waypoints, used to smooth open reference paths
//
// https://github.com/AtsushiSakai/PythonRobotics/tree/master/PathPlanning/CubicSpline
// https://github.com/onlytailei/CppRobotics/blob/master/include/cubic_spline.h

use nalgebra::{DMatrix, DVector};

use crate::common::{MpcError, MpcResult, Point2D};

#[derive(Debug, Clone)]
struct Spline {
    a: Vec<f64>,
    b: Vec<f64>,
    c: Vec<f64>,
    d: Vec<f64>,
    x: Vec<f64>,
}

impl Spline {
    fn new(x: &[f64], y: &[f64]) -> MpcResult<Spline> {
        let nx = x.len();
        let h: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();
        if h.iter().any(|&hi| hi <= 0.0) {
            return Err(MpcError::config("spline knots must be strictly increasing"));
        }
        let a = y.to_vec();
        let a_mat = Self::calc_a(&h);
        let b_mat = Self::calc_b(&h, &a);

        let c_na = a_mat
            .lu()
            .solve(&b_mat)
            .ok_or_else(|| MpcError::config("singular spline system"))?;
        let c: Vec<f64> = c_na.iter().copied().collect();

        let mut b = Vec::with_capacity(nx - 1);
        let mut d = Vec::with_capacity(nx - 1);
        for i in 0..nx - 1 {
            d.push((c[i + 1] - c[i]) / (3.0 * h[i]));
            b.push((a[i + 1] - a[i]) / h[i] - h[i] * (c[i + 1] + 2.0 * c[i]) / 3.0);
        }

        Ok(Spline { a, b, c, d, x: x.to_vec() })
    }

    fn calc(&self, t: f64) -> f64 {
        let i = self.search_index(t);
        let dx = t - self.x[i];
        self.a[i] + self.b[i] * dx + self.c[i] * dx.powi(2) + self.d[i] * dx.powi(3)
    }

    fn calcd(&self, t: f64) -> f64 {
        let i = self.search_index(t);
        let dx = t - self.x[i];
        self.b[i] + 2.0 * self.c[i] * dx + 3.0 * self.d[i] * dx.powi(2)
    }

    fn calcdd(&self, t: f64) -> f64 {
        let i = self.search_index(t);
        let dx = t - self.x[i];
        2.0 * self.c[i] + 6.0 * self.d[i] * dx
    }

    // segment index, clamped to the last segment
    fn search_index(&self, t: f64) -> usize {
        let i = self.x.partition_point(|&xi| xi <= t);
        i.saturating_sub(1).min(self.x.len() - 2)
    }

    fn calc_a(h: &[f64]) -> DMatrix<f64> {
        let nx = h.len() + 1;
        let mut a = DMatrix::zeros(nx, nx);
        a[(0, 0)] = 1.0;
        for i in 0..nx - 1 {
            if i != nx - 2 {
                a[(i + 1, i + 1)] = 2.0 * (h[i] + h[i + 1]);
            }
            a[(i + 1, i)] = h[i];
            a[(i, i + 1)] = h[i];
        }
        a[(0, 1)] = 0.0;
        a[(nx - 1, nx - 2)] = 0.0;
        a[(nx - 1, nx - 1)] = 1.0;
        a
    }

    fn calc_b(h: &[f64], a: &[f64]) -> DVector<f64> {
        let nx = h.len() + 1;
        let mut b = DVector::zeros(nx);
        for i in 0..nx.saturating_sub(2) {
            b[i + 1] = 3.0 * (a[i + 2] - a[i + 1]) / h[i + 1] - 3.0 * (a[i + 1] - a[i]) / h[i];
        }
        b
    }
}

/// Natural cubic spline parameterized by chord length
#[derive(Debug, Clone)]
pub struct Spline2D {
    s: Vec<f64>,
    sx: Spline,
    sy: Spline,
}

impl Spline2D {
    pub fn new(points: &[Point2D]) -> MpcResult<Spline2D> {
        if points.len() < 2 {
            return Err(MpcError::config("spline needs at least 2 points"));
        }
        let mut s = Vec::with_capacity(points.len());
        s.push(0.0);
        for w in points.windows(2) {
            let last = s[s.len() - 1];
            s.push(last + w[0].distance(&w[1]));
        }
        let x: Vec<f64> = points.iter().map(|p| p.x).collect();
        let y: Vec<f64> = points.iter().map(|p| p.y).collect();
        let sx = Spline::new(&s, &x)?;
        let sy = Spline::new(&s, &y)?;
        Ok(Spline2D { s, sx, sy })
    }

    /// Chord length of the knot polygon
    pub fn length(&self) -> f64 {
        self.s[self.s.len() - 1]
    }

    pub fn calc_position(&self, s: f64) -> Point2D {
        Point2D::new(self.sx.calc(s), self.sy.calc(s))
    }

    pub fn calc_yaw(&self, s: f64) -> f64 {
        self.sy.calcd(s).atan2(self.sx.calcd(s))
    }

    pub fn calc_curvature(&self, s: f64) -> f64 {
        let dx = self.sx.calcd(s);
        let ddx = self.sx.calcdd(s);
        let dy = self.sy.calcd(s);
        let ddy = self.sy.calcdd(s);
        (ddy * dx - ddx * dy) / (dx.powi(2) + dy.powi(2)).powf(1.5)
    }
}
