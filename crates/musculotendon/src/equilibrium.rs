//! Fiber-length equilibrium estimator
//!
//! Newton-Raphson on fiber length driving
//!
//! ```text
//! ferr(lce) = F_fiber(lce) * cos(phi(lce)) - F_tendon(path_length - lce * cos(phi(lce)))
//! ```
//!
//! to zero. Static equilibrium holds the fiber isometric. Dynamic
//! equilibrium splits the path lengthening speed between fiber and tendon as
//! two springs in series, so the stiffer element takes the smaller share.
//! The fiber never goes below the muscle's minimum fiber length; a fiber
//! pushed against that bound is reported as clamped.

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::curves::MuscleCurve;
use crate::error::Result;
use crate::fiber_velocity::ForceBalance;
use crate::force::{FiberMultipliers, ForceAndStiffnessEngine};
use crate::muscle::DampedMuscle;
use crate::pennation::PennationGeometry;

/// Tolerances and caps for the outer fiber-length solve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EquilibriumSolverConfig {
    /// Force error tolerance relative to the maximum isometric force
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Largest Newton step as a fraction of the optimal fiber length
    pub max_step_fraction: f64,
    /// Step halvings tried before a non-improving step is taken anyway
    pub max_backtracks: usize,
}

impl Default for EquilibriumSolverConfig {
    fn default() -> Self {
        EquilibriumSolverConfig {
            tolerance: 1e-8,
            max_iterations: 200,
            max_step_fraction: 0.25,
            max_backtracks: 4,
        }
    }
}

impl EquilibriumSolverConfig {
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EquilibriumMode {
    /// Fiber held isometric
    Static,
    /// Path lengthening speed shared between fiber and tendon
    Dynamic,
}

/// Boundary conditions for one equilibrium solve
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EquilibriumInputs {
    pub activation: f64,
    /// Path length (m)
    pub path_length: f64,
    /// Path lengthening speed (m/s)
    pub path_lengthening_speed: f64,
    /// Normalized fiber damping coefficient
    pub damping: f64,
    pub mode: EquilibriumMode,
    /// Starting fiber length; a geometric guess is used when absent or unusable
    pub initial_fiber_length: Option<f64>,
}

/// Fiber state the estimator settles on
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FiberState {
    /// m
    pub fiber_length: f64,
    /// m/s
    pub fiber_velocity: f64,
    /// rad
    pub pennation_angle: f64,
    /// N
    pub tendon_force: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EquilibriumReport {
    pub iterations: usize,
    /// |fiber force along tendon - tendon force| / fiso
    pub solution_error: f64,
    pub state: FiberState,
}

/// Outcome of the outer solve. Every variant carries the state reached.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SolveStatus {
    Converged(EquilibriumReport),
    /// Fiber held at the minimum fiber length while still pulling shorter
    ClampedAtLowerBound(EquilibriumReport),
    /// Iteration cap hit; carries the best state found
    MaxIterationsReached(EquilibriumReport),
}

impl SolveStatus {
    pub fn report(&self) -> &EquilibriumReport {
        match self {
            SolveStatus::Converged(report)
            | SolveStatus::ClampedAtLowerBound(report)
            | SolveStatus::MaxIterationsReached(report) => report,
        }
    }

    pub fn state(&self) -> &FiberState {
        &self.report().state
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, SolveStatus::Converged(_))
    }

    pub fn is_clamped(&self) -> bool {
        matches!(self, SolveStatus::ClampedAtLowerBound(_))
    }

    /// Converged or clamped, both of which leave a usable state
    pub fn is_usable(&self) -> bool {
        !matches!(self, SolveStatus::MaxIterationsReached(_))
    }
}

// Everything the Newton iteration needs at one trial fiber length
#[derive(Debug, Clone, Copy)]
struct TrialPoint {
    geometry: PennationGeometry,
    tendon_force_multiplier: f64,
    active_force_length: f64,
    passive_force_length: f64,
    normalized_fiber_velocity: f64,
    tendon_force: f64,
    residual: f64,
    residual_derivative: f64,
}

/// Outer Newton solve over fiber length for one muscle
pub struct FiberLengthEquilibriumEstimator<'a> {
    muscle: &'a DampedMuscle,
    config: EquilibriumSolverConfig,
}

impl<'a> FiberLengthEquilibriumEstimator<'a> {
    pub fn new(muscle: &'a DampedMuscle) -> Self {
        FiberLengthEquilibriumEstimator {
            muscle,
            config: muscle.config().equilibrium,
        }
    }

    pub fn with_config(mut self, config: EquilibriumSolverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EquilibriumSolverConfig {
        &self.config
    }

    fn engine(&self, inputs: &EquilibriumInputs) -> ForceAndStiffnessEngine {
        ForceAndStiffnessEngine {
            damping: inputs.damping,
            ..*self.muscle.engine()
        }
    }

    /// Solve for the fiber state consistent with `inputs`.
    ///
    /// Errors are limited to geometry and configuration failures; running out
    /// of iterations is a [`SolveStatus::MaxIterationsReached`] outcome.
    pub fn estimate(&self, inputs: &EquilibriumInputs) -> Result<SolveStatus> {
        if self.muscle.config().ignore_tendon_compliance {
            return self.rigid_tendon(inputs);
        }

        let fiso = self.muscle.config().max_isometric_force;
        let min_lce = self.muscle.minimum_fiber_length();
        let max_step = self.config.max_step_fraction * self.muscle.config().optimal_fiber_length;
        let stiffness_floor = 1e-10 * fiso / self.muscle.config().optimal_fiber_length;

        let mut lce = self.initial_guess(inputs)?;
        let mut point = self.evaluate(lce, inputs)?;
        let mut best = (lce, point);

        for iteration in 0..self.config.max_iterations {
            let error = point.residual.abs() / fiso;
            trace!(
                "equilibrium iter {}: lce = {:.9} m, ferr = {:.3e} N, dferr = {:.3e} N/m",
                iteration, lce, point.residual, point.residual_derivative
            );

            if error < self.config.tolerance {
                debug!("equilibrium converged in {} iterations: lce = {:.9} m", iteration, lce);
                return Ok(SolveStatus::Converged(self.report(lce, &point, inputs, iteration)?));
            }
            if lce <= min_lce && point.residual > 0.0 {
                warn!(
                    "fiber clamped at minimum length {:.6} m (force error {:.3e})",
                    min_lce, error
                );
                return Ok(SolveStatus::ClampedAtLowerBound(self.report(min_lce, &point, inputs, iteration)?));
            }

            let mut step = if point.residual_derivative > stiffness_floor {
                -point.residual / point.residual_derivative
            } else {
                -point.residual.signum() * max_step
            };
            step = step.clamp(-max_step, max_step);

            // Backtrack on |ferr|; the last halving is taken even if it does not improve
            let mut trial_lce = (lce + step).max(min_lce);
            let mut trial = self.evaluate(trial_lce, inputs)?;
            for _ in 0..self.config.max_backtracks {
                if trial.residual.abs() < point.residual.abs() {
                    break;
                }
                step *= 0.5;
                trial_lce = (lce + step).max(min_lce);
                trial = self.evaluate(trial_lce, inputs)?;
            }

            lce = trial_lce;
            point = trial;
            if point.residual.abs() < best.1.residual.abs() {
                best = (lce, point);
            }
        }

        let error = point.residual.abs() / fiso;
        if error < self.config.tolerance {
            return Ok(SolveStatus::Converged(self.report(lce, &point, inputs, self.config.max_iterations)?));
        }
        // Last step may have landed on the bound
        if lce <= min_lce && point.residual > 0.0 {
            warn!(
                "fiber clamped at minimum length {:.6} m on the final iteration (force error {:.3e})",
                min_lce, error
            );
            return Ok(SolveStatus::ClampedAtLowerBound(self.report(
                min_lce,
                &point,
                inputs,
                self.config.max_iterations,
            )?));
        }
        warn!(
            "equilibrium did not converge in {} iterations (best force error {:.3e})",
            self.config.max_iterations,
            best.1.residual.abs() / fiso
        );
        let (best_lce, best_point) = best;
        Ok(SolveStatus::MaxIterationsReached(self.report(
            best_lce,
            &best_point,
            inputs,
            self.config.max_iterations,
        )?))
    }

    fn initial_guess(&self, inputs: &EquilibriumInputs) -> Result<f64> {
        let min_lce = self.muscle.minimum_fiber_length();
        if let Some(lce) = inputs.initial_fiber_length {
            if lce.is_finite() && lce >= min_lce {
                return Ok(lce);
            }
        }
        let along_tendon = (inputs.path_length - 1.01 * self.muscle.config().tendon_slack_length)
            .max(self.muscle.minimum_fiber_length_along_tendon());
        let geometry = self.muscle.pennation().fiber_length_from_pennation(along_tendon)?;
        Ok(geometry.fiber_length.max(min_lce))
    }

    // Normalized fiber velocity implied by the path speed at this fiber length
    fn kinematic_velocity(
        &self,
        inputs: &EquilibriumInputs,
        geometry: &PennationGeometry,
        tendon_stiffness: f64,
        multipliers: &FiberMultipliers,
        engine: &ForceAndStiffnessEngine,
    ) -> f64 {
        if inputs.mode == EquilibriumMode::Static {
            return 0.0;
        }

        // Series split with the fiber's isometric stiffness
        let isometric = FiberMultipliers {
            force_velocity: 1.0,
            ..*multipliers
        };
        let fiber_force = engine.fiber_forces(inputs.activation, &isometric, 0.0).total;
        let fiber_stiffness = engine.fiber_stiffness(inputs.activation, &isometric);
        let kf_at = engine
            .fiber_stiffness_along_tendon(fiber_force, fiber_stiffness, geometry)
            .max(0.0);
        let kt = tendon_stiffness.max(0.0);

        let tendon_velocity = if kf_at + kt > f64::EPSILON * engine.max_isometric_force {
            kf_at / (kf_at + kt) * inputs.path_lengthening_speed
        } else {
            0.0
        };
        let along_tendon = inputs.path_lengthening_speed - tendon_velocity;
        let pennation = self.muscle.pennation();
        let fiber_velocity = pennation.fiber_velocity_from_tendon_frame(along_tendon, geometry.cos_pennation);
        (fiber_velocity / (engine.max_contraction_velocity * engine.optimal_fiber_length)).clamp(-1.0, 1.0)
    }

    fn evaluate(&self, lce: f64, inputs: &EquilibriumInputs) -> Result<TrialPoint> {
        let muscle = self.muscle;
        let curves = muscle.curves();
        let engine = self.engine(inputs);

        let geometry = muscle.pennation().geometry_at(lce)?;
        let tendon_length = muscle.pennation().tendon_length(inputs.path_length, &geometry);
        let normalized_tendon_length = tendon_length / engine.tendon_slack_length;
        let fse = curves.tendon_force_length.evaluate(normalized_tendon_length);
        let tendon_stiffness = engine.tendon_stiffness(curves.tendon_force_length.derivative(normalized_tendon_length));

        let normalized_fiber_length = lce / engine.optimal_fiber_length;
        let length_only = FiberMultipliers::evaluate(curves, normalized_fiber_length, 0.0);
        let dlce_n = self.kinematic_velocity(inputs, &geometry, tendon_stiffness, &length_only, &engine);
        let multipliers = FiberMultipliers::evaluate(curves, normalized_fiber_length, dlce_n);

        let fiber_forces = engine.fiber_forces(inputs.activation, &multipliers, dlce_n);
        let tendon_force = engine.tendon_force(fse);
        let fiber_stiffness = engine.fiber_stiffness(inputs.activation, &multipliers);

        let d_fiber = engine.d_fiber_force_along_tendon_d_fiber_length(fiber_forces.total, fiber_stiffness, &geometry);
        let d_tendon = engine.d_tendon_force_d_fiber_length(tendon_stiffness, geometry.cos_pennation);

        Ok(TrialPoint {
            geometry,
            tendon_force_multiplier: fse,
            active_force_length: multipliers.active_force_length,
            passive_force_length: multipliers.passive_force_length,
            normalized_fiber_velocity: dlce_n,
            tendon_force,
            residual: fiber_forces.total * geometry.cos_pennation - tendon_force,
            residual_derivative: d_fiber - d_tendon,
        })
    }

    // Dynamic solutions have their velocity refined against the local force balance
    fn report(
        &self,
        lce: f64,
        point: &TrialPoint,
        inputs: &EquilibriumInputs,
        iterations: usize,
    ) -> Result<EquilibriumReport> {
        let config = self.muscle.config();
        let mut dlce_n = point.normalized_fiber_velocity;

        if inputs.mode == EquilibriumMode::Dynamic {
            let balance = ForceBalance {
                activation: inputs.activation,
                active_force_length: point.active_force_length,
                passive_force_length: point.passive_force_length,
                tendon_force_multiplier: point.tendon_force_multiplier,
                cos_pennation: point.geometry.cos_pennation,
                damping: inputs.damping,
            };
            match self.muscle.velocity_solver().solve(&balance) {
                Ok(solution) if solution.converged => dlce_n = solution.normalized_fiber_velocity,
                Ok(solution) => trace!(
                    "velocity refinement did not converge (residual {:.3e}); keeping kinematic velocity",
                    solution.residual
                ),
                Err(e) => trace!("velocity refinement skipped: {}", e),
            }
        }

        let at_lower_bound = lce <= self.muscle.minimum_fiber_length();
        if at_lower_bound && dlce_n < 0.0 {
            dlce_n = 0.0;
        }

        Ok(EquilibriumReport {
            iterations,
            solution_error: point.residual.abs() / config.max_isometric_force,
            state: FiberState {
                fiber_length: lce,
                fiber_velocity: dlce_n * config.max_contraction_velocity * config.optimal_fiber_length,
                pennation_angle: point.geometry.pennation_angle,
                tendon_force: point.tendon_force,
            },
        })
    }

    // Inextensible tendon: geometry alone fixes the fiber
    fn rigid_tendon(&self, inputs: &EquilibriumInputs) -> Result<SolveStatus> {
        let muscle = self.muscle;
        let config = muscle.config();
        let engine = self.engine(inputs);
        let pennation = muscle.pennation();

        let along_tendon = inputs.path_length - config.tendon_slack_length;
        let clamped = along_tendon <= muscle.minimum_fiber_length_along_tendon();
        let geometry = if clamped {
            pennation.geometry_at(muscle.minimum_fiber_length())?
        } else {
            let g = pennation.fiber_length_from_pennation(along_tendon)?;
            if g.fiber_length < muscle.minimum_fiber_length() {
                pennation.geometry_at(muscle.minimum_fiber_length())?
            } else {
                g
            }
        };

        let mut dlce_n = match inputs.mode {
            EquilibriumMode::Static => 0.0,
            EquilibriumMode::Dynamic => {
                let fiber_velocity =
                    pennation.fiber_velocity_from_tendon_frame(inputs.path_lengthening_speed, geometry.cos_pennation);
                (fiber_velocity / (config.max_contraction_velocity * config.optimal_fiber_length)).clamp(-1.0, 1.0)
            }
        };
        if clamped && dlce_n < 0.0 {
            dlce_n = 0.0;
        }

        let multipliers = FiberMultipliers::evaluate(muscle.curves(), geometry.fiber_length / config.optimal_fiber_length, dlce_n);
        let forces = engine.fiber_forces(inputs.activation, &multipliers, dlce_n);

        let report = EquilibriumReport {
            iterations: 0,
            solution_error: 0.0,
            state: FiberState {
                fiber_length: geometry.fiber_length,
                fiber_velocity: dlce_n * config.max_contraction_velocity * config.optimal_fiber_length,
                pennation_angle: geometry.pennation_angle,
                tendon_force: forces.total * geometry.cos_pennation,
            },
        };
        if clamped {
            debug!("rigid-tendon fiber held at minimum length {:.6} m", geometry.fiber_length);
            Ok(SolveStatus::ClampedAtLowerBound(report))
        } else {
            Ok(SolveStatus::Converged(report))
        }
    }
}
