//! Fiber velocity at a fixed fiber length
//!
//! Solves the normalized force balance
//!
//! ```text
//! a * fal * fv(v) + fpe + beta * v = fse / cos(phi)
//! ```
//!
//! for the normalized fiber velocity `v` in [-1, 1]. Without damping the
//! balance is inverted in closed form through the force-velocity inverse and
//! then polished with Newton steps. With damping it is solved by a damped
//! Newton iteration that starts from the isometric guess, switches to the
//! undamped closed-form seed when Newton stalls, and falls back to bisection
//! whenever a step leaves the current bracket.

use serde::{Deserialize, Serialize};

use crate::curves::MuscleCurve;
use crate::error::{MuscleError, Result};
use crate::fv_inverse::ForceVelocityInverseCurve;

/// Tolerances and caps for the inner velocity solve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FiberVelocitySolverConfig {
    /// Residual tolerance in units of maximum isometric force
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Non-improving Newton steps tolerated before switching to the closed-form seed
    pub fallback_after: usize,
    /// Smallest a*fal the closed-form solve divides by
    pub activation_floor: f64,
}

impl Default for FiberVelocitySolverConfig {
    fn default() -> Self {
        FiberVelocitySolverConfig {
            tolerance: 1e-9,
            max_iterations: 50,
            fallback_after: 3,
            activation_floor: 1e-8,
        }
    }
}

impl FiberVelocitySolverConfig {
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }
}

/// Normalized force balance at one fiber length
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForceBalance {
    pub activation: f64,
    pub active_force_length: f64,
    pub passive_force_length: f64,
    pub tendon_force_multiplier: f64,
    pub cos_pennation: f64,
    pub damping: f64,
}

impl ForceBalance {
    /// Tendon force carried along the fiber direction (normalized)
    pub fn target(&self) -> f64 {
        self.tendon_force_multiplier / self.cos_pennation
    }

    /// Scale on fv(v) in the balance
    pub fn active_scale(&self) -> f64 {
        self.activation * self.active_force_length
    }

    /// Fiber force minus tendon force along the fiber, normalized by fiso
    pub fn residual<C: MuscleCurve + ?Sized>(&self, force_velocity: &C, velocity: f64) -> f64 {
        self.active_scale() * force_velocity.evaluate(velocity) + self.passive_force_length + self.damping * velocity
            - self.target()
    }

    pub fn residual_derivative<C: MuscleCurve + ?Sized>(&self, force_velocity: &C, velocity: f64) -> f64 {
        self.active_scale() * force_velocity.derivative(velocity) + self.damping
    }

    /// fv that balances the fiber without damping
    pub fn undamped_force_velocity_multiplier(&self) -> f64 {
        (self.target() - self.passive_force_length) / self.active_scale()
    }
}

/// Outcome of the inner velocity solve
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FiberVelocitySolution {
    /// Normalized fiber velocity in [-1, 1]
    pub normalized_fiber_velocity: f64,
    /// fv at the returned velocity
    pub force_velocity_multiplier: f64,
    /// Balance residual at the returned velocity
    pub residual: f64,
    pub converged: bool,
    /// The balance has no root in [-1, 1]; the velocity sits at the nearer end
    pub clamped: bool,
    pub iterations: usize,
}

/// Inner solver borrowing the force-velocity curve and its inverse
pub struct DampedFiberVelocitySolver<'a, C: MuscleCurve + ?Sized> {
    force_velocity: &'a C,
    inverse: &'a ForceVelocityInverseCurve,
    config: FiberVelocitySolverConfig,
}

impl<'a, C: MuscleCurve + ?Sized> DampedFiberVelocitySolver<'a, C> {
    pub fn new(
        force_velocity: &'a C,
        inverse: &'a ForceVelocityInverseCurve,
        config: FiberVelocitySolverConfig,
    ) -> Self {
        DampedFiberVelocitySolver {
            force_velocity,
            inverse,
            config,
        }
    }

    pub fn config(&self) -> &FiberVelocitySolverConfig {
        &self.config
    }

    /// Normalized fiber velocity that balances `balance`.
    ///
    /// Only the undamped solve can fail, with `ActivationSingularity` when
    /// a*fal is below the configured floor. Non-convergence is reported through
    /// `converged` rather than as an error.
    pub fn solve(&self, balance: &ForceBalance) -> Result<FiberVelocitySolution> {
        if balance.damping > 0.0 {
            Ok(self.solve_damped(balance))
        } else {
            self.solve_undamped(balance)
        }
    }

    fn solve_undamped(&self, balance: &ForceBalance) -> Result<FiberVelocitySolution> {
        let scale = balance.active_scale();
        if !(scale > self.config.activation_floor) {
            return Err(MuscleError::ActivationSingularity {
                scale,
                floor: self.config.activation_floor,
            });
        }

        let seed = self.inverse.evaluate(balance.undamped_force_velocity_multiplier());
        if seed.clamped {
            return Ok(self.finish(balance, seed.velocity, false, true, 0));
        }
        Ok(self.refine(balance, seed.velocity, None))
    }

    fn solve_damped(&self, balance: &ForceBalance) -> FiberVelocitySolution {
        // The closed-form seed only exists while a*fal is usable
        let fallback = if balance.active_scale() > self.config.activation_floor {
            let seed = self.inverse.evaluate(balance.undamped_force_velocity_multiplier());
            Some(seed.velocity)
        } else {
            None
        };
        self.refine(balance, 0.0, fallback)
    }

    // Safeguarded Newton on a residual that increases monotonically with velocity
    fn refine(&self, balance: &ForceBalance, seed: f64, mut fallback: Option<f64>) -> FiberVelocitySolution {
        let tol = self.config.tolerance;
        let g = |v: f64| balance.residual(self.force_velocity, v);

        let r_lo = g(-1.0);
        if r_lo > tol {
            return self.finish(balance, -1.0, false, true, 0);
        }
        let r_hi = g(1.0);
        if r_hi < -tol {
            return self.finish(balance, 1.0, false, true, 0);
        }

        let mut lo = -1.0;
        let mut hi = 1.0;
        let mut v = seed.clamp(-1.0, 1.0);
        let mut r = g(v);
        let mut stalled = 0;

        for iteration in 0..self.config.max_iterations {
            if r.abs() <= tol {
                return self.finish(balance, v, true, false, iteration);
            }
            if r > 0.0 {
                hi = v;
            } else {
                lo = v;
            }

            let slope = balance.residual_derivative(self.force_velocity, v);
            let mut next = if slope > 0.0 { v - r / slope } else { f64::NAN };

            // Halve the Newton step while it fails to reduce the residual
            if next > lo && next < hi {
                let mut step = next - v;
                for _ in 0..3 {
                    if g(v + step).abs() < r.abs() {
                        break;
                    }
                    step *= 0.5;
                }
                next = v + step;
            } else {
                next = 0.5 * (lo + hi);
            }

            let r_next = g(next);
            if r_next.abs() >= r.abs() {
                stalled += 1;
            } else {
                stalled = 0;
            }

            if stalled >= self.config.fallback_after {
                if let Some(seed) = fallback.take() {
                    if seed > lo && seed < hi && g(seed).abs() < r_next.abs() {
                        next = seed;
                    }
                }
                stalled = 0;
            }

            v = next;
            r = g(v);
        }

        self.finish(balance, v, r.abs() <= tol, false, self.config.max_iterations)
    }

    fn finish(
        &self,
        balance: &ForceBalance,
        velocity: f64,
        converged: bool,
        clamped: bool,
        iterations: usize,
    ) -> FiberVelocitySolution {
        FiberVelocitySolution {
            normalized_fiber_velocity: velocity,
            force_velocity_multiplier: self.force_velocity.evaluate(velocity),
            residual: balance.residual(self.force_velocity, velocity),
            converged,
            clamped,
            iterations,
        }
    }
}
