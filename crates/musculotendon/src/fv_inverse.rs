//! Singularity-free inverse of the force-velocity curve
//!
//! The inverse v(fv) is a monotone piecewise cubic Hermite interpolant built
//! once from control points of the forward curve. Control points combine a
//! Chebyshev-Lobatto spacing on [-1, 1], which clusters them where the forward
//! curve flattens and the inverse gets steep, with points evenly spaced in
//! multiplier, which covers the steep isometric region.

use crate::curves::MuscleCurve;
use crate::error::{MuscleError, Result};

/// Control points per spacing family used by [`ForceVelocityInverseCurve::from_curve`]
pub const DEFAULT_CONTROL_POINTS: usize = 64;

/// Result of evaluating the inverse
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InverseEvaluation {
    /// Normalized fiber velocity in [-1, 1]
    pub velocity: f64,
    /// True when the requested multiplier lay outside the curve's range and
    /// was clamped to the nearest end
    pub clamped: bool,
}

#[derive(Debug, Clone)]
pub struct ForceVelocityInverseCurve {
    // Knots in multiplier space, strictly increasing
    multipliers: Vec<f64>,
    velocities: Vec<f64>,
    // dv/dfv at each knot
    slopes: Vec<f64>,
}

impl ForceVelocityInverseCurve {
    pub fn from_curve<C: MuscleCurve + ?Sized>(curve: &C) -> Result<Self> {
        Self::with_control_points(curve, DEFAULT_CONTROL_POINTS)
    }

    pub fn with_control_points<C: MuscleCurve + ?Sized>(curve: &C, n_points: usize) -> Result<Self> {
        if n_points < 4 {
            return Err(MuscleError::InvalidCurve(format!(
                "force-velocity inverse needs at least 4 control points, got {}",
                n_points
            )));
        }

        let f_min = curve.evaluate(-1.0);
        let f_max = curve.evaluate(1.0);
        if !(f_max > f_min) {
            return Err(MuscleError::InvalidCurve(format!(
                "force-velocity curve must increase over [-1, 1], got fv(-1) = {} and fv(1) = {}",
                f_min, f_max
            )));
        }

        // Chebyshev-Lobatto knots in velocity, knots evenly spaced in multiplier,
        // and the isometric point where the two branches of the curve meet
        let mut velocities = Vec::with_capacity(2 * n_points + 1);
        for i in 0..n_points {
            let theta = std::f64::consts::PI * i as f64 / (n_points - 1) as f64;
            velocities.push(-theta.cos());
        }
        for j in 1..n_points - 1 {
            let target = f_min + (f_max - f_min) * j as f64 / (n_points - 1) as f64;
            velocities.push(bisect_forward(curve, target));
        }
        velocities.push(0.0);
        velocities.sort_by(|a, b| a.total_cmp(b));
        velocities.dedup_by(|a, b| (*a - *b).abs() < 1e-12);

        let n_points = velocities.len();
        let multipliers: Vec<f64> = velocities.iter().map(|&v| curve.evaluate(v)).collect();

        for (i, pair) in multipliers.windows(2).enumerate() {
            if !(pair[1] > pair[0]) {
                return Err(MuscleError::InvalidCurve(format!(
                    "force-velocity curve is not strictly increasing between v = {} and v = {}",
                    velocities[i],
                    velocities[i + 1]
                )));
            }
        }

        let secants: Vec<f64> = (0..n_points - 1)
            .map(|i| (velocities[i + 1] - velocities[i]) / (multipliers[i + 1] - multipliers[i]))
            .collect();

        // Exact inverse slopes where the forward slope is usable, secants otherwise
        let mut slopes: Vec<f64> = (0..n_points)
            .map(|i| {
                let forward = curve.derivative(velocities[i]);
                if forward > 1e-12 {
                    1.0 / forward
                } else if i == 0 {
                    secants[0]
                } else if i == n_points - 1 {
                    secants[n_points - 2]
                } else {
                    0.5 * (secants[i - 1] + secants[i])
                }
            })
            .collect();

        // Fritsch-Carlson limiter keeps each cubic monotone
        for (i, &secant) in secants.iter().enumerate() {
            let alpha = slopes[i] / secant;
            let beta = slopes[i + 1] / secant;
            let magnitude = alpha.hypot(beta);
            if magnitude > 3.0 {
                let tau = 3.0 / magnitude;
                slopes[i] = tau * alpha * secant;
                slopes[i + 1] = tau * beta * secant;
            }
        }

        Ok(ForceVelocityInverseCurve {
            multipliers,
            velocities,
            slopes,
        })
    }

    /// Smallest multiplier the inverse covers
    pub fn min_multiplier(&self) -> f64 {
        self.multipliers[0]
    }

    /// Largest multiplier the inverse covers
    pub fn max_multiplier(&self) -> f64 {
        self.multipliers[self.multipliers.len() - 1]
    }

    // Interval index and Hermite parameter for an in-range multiplier
    fn locate(&self, fv: f64) -> (usize, f64, f64) {
        let last = self.multipliers.len() - 2;
        let i = self.multipliers.partition_point(|&x| x <= fv).saturating_sub(1).min(last);
        let h = self.multipliers[i + 1] - self.multipliers[i];
        let t = (fv - self.multipliers[i]) / h;
        (i, h, t)
    }

    /// Normalized fiber velocity whose force-velocity multiplier is `fv`
    pub fn evaluate(&self, fv: f64) -> InverseEvaluation {
        if fv.is_nan() {
            return InverseEvaluation {
                velocity: 0.0,
                clamped: true,
            };
        }
        if fv <= self.min_multiplier() {
            return InverseEvaluation {
                velocity: self.velocities[0],
                clamped: fv < self.min_multiplier(),
            };
        }
        if fv >= self.max_multiplier() {
            return InverseEvaluation {
                velocity: self.velocities[self.velocities.len() - 1],
                clamped: fv > self.max_multiplier(),
            };
        }

        let (i, h, t) = self.locate(fv);
        let t2 = t * t;
        let t3 = t2 * t;

        let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
        let h10 = t3 - 2.0 * t2 + t;
        let h01 = -2.0 * t3 + 3.0 * t2;
        let h11 = t3 - t2;

        let velocity = h00 * self.velocities[i]
            + h10 * h * self.slopes[i]
            + h01 * self.velocities[i + 1]
            + h11 * h * self.slopes[i + 1];

        InverseEvaluation {
            velocity: velocity.clamp(-1.0, 1.0),
            clamped: false,
        }
    }

    /// dv/dfv of the interpolant; zero outside the covered range
    pub fn derivative(&self, fv: f64) -> f64 {
        if !(fv > self.min_multiplier() && fv < self.max_multiplier()) {
            return 0.0;
        }

        let (i, h, t) = self.locate(fv);
        let t2 = t * t;

        let d00 = 6.0 * t2 - 6.0 * t;
        let d10 = 3.0 * t2 - 4.0 * t + 1.0;
        let d01 = -6.0 * t2 + 6.0 * t;
        let d11 = 3.0 * t2 - 2.0 * t;

        (d00 * self.velocities[i] + d01 * self.velocities[i + 1]) / h
            + d10 * self.slopes[i]
            + d11 * self.slopes[i + 1]
    }
}

// Velocity in [-1, 1] whose forward multiplier is `target`; build time only
fn bisect_forward<C: MuscleCurve + ?Sized>(curve: &C, target: f64) -> f64 {
    let mut lo = -1.0;
    let mut hi = 1.0;
    for _ in 0..80 {
        let mid = 0.5 * (lo + hi);
        if curve.evaluate(mid) < target {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}
