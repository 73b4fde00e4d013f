//! Host-facing damped Hill muscle
//!
//! [`DampedMuscle`] owns the validated configuration and the objects built
//! from it once (pennation model, force-velocity inverse, force engine) and
//! answers queries over a [`MuscleState`] snapshot. The only state variable it
//! needs from the host is the fiber length; the fiber velocity follows from
//! the damped force balance at that length.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use simcore::MuscleState;

use crate::curves::{CurveSet, ForceVelocityCurve, MuscleCurve};
use crate::equilibrium::{
    EquilibriumInputs, EquilibriumMode, EquilibriumSolverConfig, FiberLengthEquilibriumEstimator, SolveStatus,
};
use crate::error::{MuscleError, Result};
use crate::fiber_velocity::{DampedFiberVelocitySolver, FiberVelocitySolverConfig, ForceBalance};
use crate::force::{FiberForces, FiberMultipliers, ForceAndStiffnessEngine};
use crate::fv_inverse::ForceVelocityInverseCurve;
use crate::pennation::{PennationGeometry, PennationModel};

/// Smallest nonzero fiber damping accepted
pub const MIN_FIBER_DAMPING: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuscleConfig {
    /// N
    pub max_isometric_force: f64,
    /// m
    pub optimal_fiber_length: f64,
    /// m
    pub tendon_slack_length: f64,
    /// rad
    pub pennation_angle_at_optimal: f64,
    /// rad
    pub maximum_pennation_angle: f64,
    /// Optimal fiber lengths per second
    pub max_contraction_velocity: f64,
    /// Normalized damping coefficient; 0 disables fiber damping
    pub fiber_damping: f64,
    pub minimum_activation: f64,
    pub default_activation: f64,
    /// m
    pub default_fiber_length: f64,
    /// Treat the tendon as inextensible
    pub ignore_tendon_compliance: bool,
    pub curves: CurveSet,
    pub equilibrium: EquilibriumSolverConfig,
    pub fiber_velocity: FiberVelocitySolverConfig,
}

impl Default for MuscleConfig {
    fn default() -> Self {
        MuscleConfig {
            max_isometric_force: 1000.0,
            optimal_fiber_length: 0.1,
            tendon_slack_length: 0.2,
            pennation_angle_at_optimal: 0.0,
            maximum_pennation_angle: (0.1_f64).acos(),
            max_contraction_velocity: 10.0,
            fiber_damping: 0.1,
            minimum_activation: 0.01,
            default_activation: 0.05,
            default_fiber_length: 0.1,
            ignore_tendon_compliance: false,
            curves: CurveSet::default(),
            equilibrium: EquilibriumSolverConfig::default(),
            fiber_velocity: FiberVelocitySolverConfig::default(),
        }
    }
}

impl MuscleConfig {
    pub fn with_max_isometric_force(mut self, force: f64) -> Self {
        self.max_isometric_force = force;
        self
    }

    pub fn with_optimal_fiber_length(mut self, length: f64) -> Self {
        self.optimal_fiber_length = length;
        self
    }

    pub fn with_tendon_slack_length(mut self, length: f64) -> Self {
        self.tendon_slack_length = length;
        self
    }

    pub fn with_pennation_angle_at_optimal(mut self, angle: f64) -> Self {
        self.pennation_angle_at_optimal = angle;
        self
    }

    pub fn with_maximum_pennation_angle(mut self, angle: f64) -> Self {
        self.maximum_pennation_angle = angle;
        self
    }

    pub fn with_max_contraction_velocity(mut self, velocity: f64) -> Self {
        self.max_contraction_velocity = velocity;
        self
    }

    pub fn with_fiber_damping(mut self, damping: f64) -> Self {
        self.fiber_damping = damping;
        self
    }

    pub fn with_minimum_activation(mut self, activation: f64) -> Self {
        self.minimum_activation = activation;
        self
    }

    pub fn with_default_activation(mut self, activation: f64) -> Self {
        self.default_activation = activation;
        self
    }

    pub fn with_default_fiber_length(mut self, length: f64) -> Self {
        self.default_fiber_length = length;
        self
    }

    pub fn with_ignore_tendon_compliance(mut self, ignore: bool) -> Self {
        self.ignore_tendon_compliance = ignore;
        self
    }

    pub fn with_curves(mut self, curves: CurveSet) -> Self {
        self.curves = curves;
        self
    }

    pub fn with_equilibrium(mut self, equilibrium: EquilibriumSolverConfig) -> Self {
        self.equilibrium = equilibrium;
        self
    }

    pub fn with_fiber_velocity_solver(mut self, solver: FiberVelocitySolverConfig) -> Self {
        self.fiber_velocity = solver;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_isometric_force", self.max_isometric_force),
            ("optimal_fiber_length", self.optimal_fiber_length),
            ("tendon_slack_length", self.tendon_slack_length),
            ("max_contraction_velocity", self.max_contraction_velocity),
            ("default_fiber_length", self.default_fiber_length),
            ("equilibrium.tolerance", self.equilibrium.tolerance),
            ("equilibrium.max_step_fraction", self.equilibrium.max_step_fraction),
            ("fiber_velocity.tolerance", self.fiber_velocity.tolerance),
            ("fiber_velocity.activation_floor", self.fiber_velocity.activation_floor),
        ];
        for (name, value) in positive {
            if !(value > 0.0 && value.is_finite()) {
                return Err(MuscleError::InvalidConfig(format!(
                    "{} must be positive and finite, got {}",
                    name, value
                )));
            }
        }

        if !(0.0 <= self.pennation_angle_at_optimal
            && self.pennation_angle_at_optimal < self.maximum_pennation_angle
            && self.maximum_pennation_angle < std::f64::consts::FRAC_PI_2)
        {
            return Err(MuscleError::InvalidConfig(format!(
                "pennation angles must satisfy 0 <= {} < {} < pi/2",
                self.pennation_angle_at_optimal, self.maximum_pennation_angle
            )));
        }
        if !(self.fiber_damping == 0.0 || (self.fiber_damping >= MIN_FIBER_DAMPING && self.fiber_damping.is_finite())) {
            return Err(MuscleError::InvalidConfig(format!(
                "fiber_damping must be 0 or at least {}, got {}",
                MIN_FIBER_DAMPING, self.fiber_damping
            )));
        }
        if !(self.minimum_activation > 0.0 && self.minimum_activation < 1.0) {
            return Err(MuscleError::InvalidConfig(format!(
                "minimum_activation must lie in (0, 1), got {}",
                self.minimum_activation
            )));
        }
        if !self.default_activation.is_finite() {
            return Err(MuscleError::InvalidConfig("default_activation must be finite".into()));
        }
        if self.fiber_velocity.max_iterations == 0 {
            return Err(MuscleError::InvalidConfig(
                "fiber_velocity.max_iterations must be at least 1".into(),
            ));
        }
        self.curves.validate()
    }
}

/// Fiber and tendon lengths with the multipliers that depend on them
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MuscleLengthInfo {
    pub fiber_length: f64,
    pub fiber_length_along_tendon: f64,
    pub normalized_fiber_length: f64,
    pub tendon_length: f64,
    pub normalized_tendon_length: f64,
    pub tendon_strain: f64,
    pub pennation_angle: f64,
    pub sin_pennation: f64,
    pub cos_pennation: f64,
    pub active_force_length: f64,
    pub active_force_length_derivative: f64,
    pub passive_force_length: f64,
    pub passive_force_length_derivative: f64,
    pub tendon_force_length: f64,
    pub tendon_force_length_derivative: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FiberVelocityInfo {
    /// m/s
    pub fiber_velocity: f64,
    pub fiber_velocity_along_tendon: f64,
    pub normalized_fiber_velocity: f64,
    /// rad/s
    pub pennation_angular_velocity: f64,
    pub tendon_velocity: f64,
    pub force_velocity_multiplier: f64,
    /// The force balance had no root inside the velocity domain
    pub fiber_velocity_clamped: bool,
    pub converged: bool,
}

/// Forces, stiffnesses and powers at one state
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MuscleDynamicsInfo {
    pub activation: f64,
    pub fiber_forces: FiberForces,
    pub fiber_forces_along_tendon: FiberForces,
    pub tendon_force: f64,
    /// N/m
    pub fiber_stiffness: f64,
    pub fiber_stiffness_along_tendon: f64,
    /// Absent when the tendon is treated as inextensible
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tendon_stiffness: Option<f64>,
    pub musculotendon_stiffness: f64,
    /// N s/m
    pub fiber_damping: f64,
    /// W, positive when the element does work on the path
    pub fiber_active_power: f64,
    pub fiber_passive_power: f64,
    pub tendon_power: f64,
    pub musculotendon_power: f64,
}

/// Elastic energy stored in the fiber and tendon (J)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MusclePotentialEnergyInfo {
    pub fiber_potential_energy: f64,
    pub tendon_potential_energy: f64,
    pub musculotendon_potential_energy: f64,
}

/// Fiber state that reproduces a prescribed tendon force and force rate
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundaryFiberState {
    /// Not limited to the activation range
    pub activation: f64,
    pub normalized_fiber_length: f64,
    /// rad
    pub pennation_angle: f64,
    pub normalized_fiber_velocity: f64,
}

#[derive(Debug, Clone)]
pub struct DampedMuscle {
    config: MuscleConfig,
    pennation: PennationModel,
    fv_inverse: ForceVelocityInverseCurve,
    engine: ForceAndStiffnessEngine,
    minimum_fiber_length: f64,
    minimum_fiber_length_along_tendon: f64,
}

impl DampedMuscle {
    pub fn new(config: MuscleConfig) -> Result<Self> {
        config.validate()?;

        let pennation = PennationModel::new(
            config.optimal_fiber_length,
            config.pennation_angle_at_optimal,
            config.maximum_pennation_angle,
        )?;
        let fv_inverse = ForceVelocityInverseCurve::from_curve(&config.curves.force_velocity)?;
        let engine = ForceAndStiffnessEngine {
            max_isometric_force: config.max_isometric_force,
            optimal_fiber_length: config.optimal_fiber_length,
            tendon_slack_length: config.tendon_slack_length,
            max_contraction_velocity: config.max_contraction_velocity,
            damping: config.fiber_damping,
        };

        let active_support = config.curves.active_force_length.min_normalized_length * config.optimal_fiber_length;
        let minimum_fiber_length = pennation.minimum_fiber_length().max(active_support);
        let minimum_fiber_length_along_tendon = pennation.geometry_at(minimum_fiber_length)?.fiber_length_along_tendon();

        debug!(
            "built muscle: fiber width {:.6} m, minimum fiber length {:.6} m",
            pennation.fiber_width(),
            minimum_fiber_length
        );

        Ok(DampedMuscle {
            config,
            pennation,
            fv_inverse,
            engine,
            minimum_fiber_length,
            minimum_fiber_length_along_tendon,
        })
    }

    pub fn config(&self) -> &MuscleConfig {
        &self.config
    }

    pub fn curves(&self) -> &CurveSet {
        &self.config.curves
    }

    pub fn pennation(&self) -> &PennationModel {
        &self.pennation
    }

    pub fn engine(&self) -> &ForceAndStiffnessEngine {
        &self.engine
    }

    pub fn force_velocity_inverse(&self) -> &ForceVelocityInverseCurve {
        &self.fv_inverse
    }

    /// Larger of the geometric bound and the active-force-length support bound
    pub fn minimum_fiber_length(&self) -> f64 {
        self.minimum_fiber_length
    }

    pub fn minimum_fiber_length_along_tendon(&self) -> f64 {
        self.minimum_fiber_length_along_tendon
    }

    pub fn velocity_solver(&self) -> DampedFiberVelocitySolver<'_, ForceVelocityCurve> {
        DampedFiberVelocitySolver::new(&self.config.curves.force_velocity, &self.fv_inverse, self.config.fiber_velocity)
    }

    pub fn estimator(&self) -> FiberLengthEquilibriumEstimator<'_> {
        FiberLengthEquilibriumEstimator::new(self)
    }

    /// Activation limited to [minimum_activation, 1]
    pub fn clamp_activation(&self, activation: f64) -> f64 {
        if activation.is_nan() {
            return self.config.minimum_activation;
        }
        activation.clamp(self.config.minimum_activation, 1.0)
    }

    /// State at the configured default activation and fiber length
    pub fn default_state(&self, path_length: f64, path_lengthening_speed: f64) -> MuscleState {
        MuscleState::new(
            self.config.default_activation,
            self.config.default_fiber_length,
            path_length,
            path_lengthening_speed,
        )
    }

    pub fn equilibrium_inputs(&self, state: &MuscleState, mode: EquilibriumMode) -> EquilibriumInputs {
        EquilibriumInputs {
            activation: self.clamp_activation(state.activation),
            path_length: state.path_length,
            path_lengthening_speed: state.path_lengthening_speed,
            damping: self.config.fiber_damping,
            mode,
            initial_fiber_length: Some(state.fiber_length),
        }
    }

    /// Static equilibrium from a geometric initial guess, written into `state`
    pub fn compute_initial_fiber_equilibrium(&self, state: &mut MuscleState) -> Result<SolveStatus> {
        let mut inputs = self.equilibrium_inputs(state, EquilibriumMode::Static);
        inputs.initial_fiber_length = None;
        self.apply_equilibrium(state, &inputs)
    }

    /// Equilibrium starting from the state's fiber length, written into `state`.
    ///
    /// Fails with `CannotEquilibrate` when the estimator runs out of
    /// iterations; `state` is left untouched in that case.
    pub fn compute_fiber_equilibrium(&self, state: &mut MuscleState, solve_for_velocity: bool) -> Result<SolveStatus> {
        let mode = if solve_for_velocity {
            EquilibriumMode::Dynamic
        } else {
            EquilibriumMode::Static
        };
        let inputs = self.equilibrium_inputs(state, mode);
        self.apply_equilibrium(state, &inputs)
    }

    fn apply_equilibrium(&self, state: &mut MuscleState, inputs: &EquilibriumInputs) -> Result<SolveStatus> {
        let status = self.estimator().estimate(inputs)?;
        match status {
            SolveStatus::MaxIterationsReached(report) => {
                warn!(
                    "cannot equilibrate muscle: error {:.3e} after {} iterations",
                    report.solution_error, report.iterations
                );
                Err(MuscleError::CannotEquilibrate {
                    iterations: report.iterations,
                    solution_error: report.solution_error,
                    fiber_length: report.state.fiber_length,
                })
            }
            SolveStatus::Converged(report) | SolveStatus::ClampedAtLowerBound(report) => {
                state.fiber_length = report.state.fiber_length;
                Ok(status)
            }
        }
    }

    // Fiber length the muscle actually uses for this state
    fn effective_fiber_length(&self, state: &MuscleState) -> Result<PennationGeometry> {
        if self.config.ignore_tendon_compliance {
            let along_tendon = state.path_length - self.config.tendon_slack_length;
            if along_tendon <= self.minimum_fiber_length_along_tendon {
                return self.pennation.geometry_at(self.minimum_fiber_length);
            }
            let geometry = self.pennation.fiber_length_from_pennation(along_tendon)?;
            if geometry.fiber_length < self.minimum_fiber_length {
                return self.pennation.geometry_at(self.minimum_fiber_length);
            }
            return Ok(geometry);
        }
        self.pennation
            .geometry_at(state.fiber_length.max(self.minimum_fiber_length))
    }

    fn at_lower_bound(&self, fiber_length: f64) -> bool {
        fiber_length <= self.minimum_fiber_length
    }

    pub fn length_info(&self, state: &MuscleState) -> Result<MuscleLengthInfo> {
        let curves = &self.config.curves;
        let geometry = self.effective_fiber_length(state)?;
        let tendon_length = if self.config.ignore_tendon_compliance {
            self.config.tendon_slack_length
        } else {
            self.pennation.tendon_length(state.path_length, &geometry)
        };
        let normalized_fiber_length = geometry.fiber_length / self.config.optimal_fiber_length;
        let normalized_tendon_length = tendon_length / self.config.tendon_slack_length;

        Ok(MuscleLengthInfo {
            fiber_length: geometry.fiber_length,
            fiber_length_along_tendon: geometry.fiber_length_along_tendon(),
            normalized_fiber_length,
            tendon_length,
            normalized_tendon_length,
            tendon_strain: normalized_tendon_length - 1.0,
            pennation_angle: geometry.pennation_angle,
            sin_pennation: geometry.sin_pennation,
            cos_pennation: geometry.cos_pennation,
            active_force_length: curves.active_force_length.evaluate(normalized_fiber_length),
            active_force_length_derivative: curves.active_force_length.derivative(normalized_fiber_length),
            passive_force_length: curves.fiber_force_length.evaluate(normalized_fiber_length),
            passive_force_length_derivative: curves.fiber_force_length.derivative(normalized_fiber_length),
            tendon_force_length: curves.tendon_force_length.evaluate(normalized_tendon_length),
            tendon_force_length_derivative: curves.tendon_force_length.derivative(normalized_tendon_length),
        })
    }

    pub fn velocity_info(&self, state: &MuscleState) -> Result<FiberVelocityInfo> {
        let length = self.length_info(state)?;
        self.velocity_info_at(state, &length)
    }

    fn velocity_info_at(&self, state: &MuscleState, length: &MuscleLengthInfo) -> Result<FiberVelocityInfo> {
        let velocity_scale = self.config.max_contraction_velocity * self.config.optimal_fiber_length;

        let (mut dlce_n, clamped, converged) = if self.config.ignore_tendon_compliance {
            let dlce = self
                .pennation
                .fiber_velocity_from_tendon_frame(state.path_lengthening_speed, length.cos_pennation);
            let dlce_n = dlce / velocity_scale;
            (dlce_n.clamp(-1.0, 1.0), dlce_n.abs() > 1.0, true)
        } else {
            let balance = ForceBalance {
                activation: self.clamp_activation(state.activation),
                active_force_length: length.active_force_length,
                passive_force_length: length.passive_force_length,
                tendon_force_multiplier: length.tendon_force_length,
                cos_pennation: length.cos_pennation,
                damping: self.config.fiber_damping,
            };
            let solution = self.velocity_solver().solve(&balance)?;
            (solution.normalized_fiber_velocity, solution.clamped, solution.converged)
        };

        // A fully shortened fiber may only lengthen
        if self.at_lower_bound(length.fiber_length) && dlce_n < 0.0 {
            dlce_n = 0.0;
        }

        let fiber_velocity = dlce_n * velocity_scale;
        let fiber_velocity_along_tendon = self.pennation.velocity_along_tendon(fiber_velocity, length.cos_pennation);
        let geometry = self.pennation.geometry_at(length.fiber_length)?;

        Ok(FiberVelocityInfo {
            fiber_velocity,
            fiber_velocity_along_tendon,
            normalized_fiber_velocity: dlce_n,
            pennation_angular_velocity: self.pennation.pennation_angular_velocity(&geometry, fiber_velocity),
            tendon_velocity: state.path_lengthening_speed - fiber_velocity_along_tendon,
            force_velocity_multiplier: self.config.curves.force_velocity.evaluate(dlce_n),
            fiber_velocity_clamped: clamped,
            converged,
        })
    }

    pub fn dynamics_info(&self, state: &MuscleState) -> Result<MuscleDynamicsInfo> {
        let length = self.length_info(state)?;
        let velocity = self.velocity_info_at(state, &length)?;
        let activation = self.clamp_activation(state.activation);
        let engine = &self.engine;

        let multipliers = FiberMultipliers::evaluate(
            &self.config.curves,
            length.normalized_fiber_length,
            velocity.normalized_fiber_velocity,
        );
        let fiber_forces = engine.fiber_forces(activation, &multipliers, velocity.normalized_fiber_velocity);
        let fiber_forces_along_tendon = fiber_forces.along_tendon(length.cos_pennation);

        let geometry = self.pennation.geometry_at(length.fiber_length)?;
        let fiber_stiffness = engine.fiber_stiffness(activation, &multipliers);
        let fiber_stiffness_along_tendon = engine.fiber_stiffness_along_tendon(fiber_forces.total, fiber_stiffness, &geometry);

        let (tendon_force, tendon_stiffness, musculotendon_stiffness) = if self.config.ignore_tendon_compliance {
            (fiber_forces_along_tendon.total, None, fiber_stiffness_along_tendon)
        } else {
            let kt = engine.tendon_stiffness(length.tendon_force_length_derivative);
            (
                engine.tendon_force(length.tendon_force_length),
                Some(kt),
                engine.musculotendon_stiffness(fiber_stiffness_along_tendon, kt),
            )
        };

        Ok(MuscleDynamicsInfo {
            activation,
            fiber_forces,
            fiber_forces_along_tendon,
            tendon_force,
            fiber_stiffness,
            fiber_stiffness_along_tendon,
            tendon_stiffness,
            musculotendon_stiffness,
            fiber_damping: engine.fiber_damping(activation, &multipliers),
            fiber_active_power: -fiber_forces.active * velocity.fiber_velocity,
            fiber_passive_power: -fiber_forces.passive() * velocity.fiber_velocity,
            tendon_power: -tendon_force * velocity.tendon_velocity,
            musculotendon_power: -tendon_force * state.path_lengthening_speed,
        })
    }

    pub fn potential_energy_info(&self, state: &MuscleState) -> Result<MusclePotentialEnergyInfo> {
        let length = self.length_info(state)?;
        let curves = &self.config.curves;
        let fiso = self.config.max_isometric_force;

        let fiber_potential_energy =
            fiso * self.config.optimal_fiber_length * curves.fiber_force_length.integral(length.normalized_fiber_length);
        let tendon_potential_energy = if self.config.ignore_tendon_compliance {
            0.0
        } else {
            fiso * self.config.tendon_slack_length * curves.tendon_force_length.integral(length.normalized_tendon_length)
        };

        Ok(MusclePotentialEnergyInfo {
            fiber_potential_energy,
            tendon_potential_energy,
            musculotendon_potential_energy: fiber_potential_energy + tendon_potential_energy,
        })
    }

    /// Activation and fiber kinematics that make the tendon carry
    /// `tendon_force` (N) changing at `tendon_force_rate` (N/s) for the given
    /// path length (m) and lengthening speed (m/s).
    ///
    /// The tendon length comes from inverting the tendon curve, and the
    /// tendon velocity from the force rate over the tendon stiffness. A slack
    /// tendon takes no velocity.
    pub fn fiber_state_given_boundary_conditions(
        &self,
        path_length: f64,
        path_lengthening_speed: f64,
        tendon_force: f64,
        tendon_force_rate: f64,
    ) -> Result<BoundaryFiberState> {
        let config = &self.config;
        let curves = &config.curves;

        let (tendon_length, tendon_velocity) = if config.ignore_tendon_compliance {
            (config.tendon_slack_length, 0.0)
        } else {
            let normalized = curves
                .tendon_force_length
                .length_at(tendon_force / config.max_isometric_force);
            let kt = self
                .engine
                .tendon_stiffness(curves.tendon_force_length.derivative(normalized));
            let velocity = if kt > f64::EPSILON * config.max_isometric_force {
                tendon_force_rate / kt
            } else {
                0.0
            };
            (normalized * config.tendon_slack_length, velocity)
        };

        let along_tendon = path_length - tendon_length;
        if along_tendon < self.minimum_fiber_length_along_tendon {
            return Err(MuscleError::geometry(format!(
                "fiber length along tendon {} m is below the minimum {} m",
                along_tendon, self.minimum_fiber_length_along_tendon
            )));
        }
        let geometry = self.pennation.fiber_length_from_pennation(along_tendon)?;

        let fiber_velocity = self
            .pennation
            .fiber_velocity_from_tendon_frame(path_lengthening_speed - tendon_velocity, geometry.cos_pennation);
        let dlce_n = (fiber_velocity / (config.max_contraction_velocity * config.optimal_fiber_length)).clamp(-1.0, 1.0);
        let normalized_fiber_length = geometry.fiber_length / config.optimal_fiber_length;

        let multipliers = FiberMultipliers::evaluate(curves, normalized_fiber_length, dlce_n);
        let activation = self.engine.activation_for_tendon_force(
            tendon_force,
            &multipliers,
            dlce_n,
            geometry.cos_pennation,
            config.fiber_velocity.activation_floor,
        )?;

        Ok(BoundaryFiberState {
            activation,
            normalized_fiber_length,
            pennation_angle: geometry.pennation_angle,
            normalized_fiber_velocity: dlce_n,
        })
    }

    /// Tensile force the actuator applies to the path (N)
    pub fn compute_actuation(&self, state: &MuscleState) -> Result<f64> {
        if self.config.ignore_tendon_compliance {
            return Ok(self.dynamics_info(state)?.tendon_force);
        }
        let length = self.length_info(state)?;
        Ok(self.engine.tendon_force(length.tendon_force_length))
    }

    pub fn tendon_force_multiplier(&self, state: &MuscleState) -> Result<f64> {
        Ok(self.length_info(state)?.tendon_force_length)
    }

    /// m/s
    pub fn fiber_velocity(&self, state: &MuscleState) -> Result<f64> {
        Ok(self.velocity_info(state)?.fiber_velocity)
    }

    /// Time derivative of the fiber-length state variable
    pub fn fiber_length_derivative(&self, state: &MuscleState) -> Result<f64> {
        if self.config.ignore_tendon_compliance {
            return Ok(0.0);
        }
        self.fiber_velocity(state)
    }

    pub fn fiber_stiffness_along_tendon(&self, state: &MuscleState) -> Result<f64> {
        Ok(self.dynamics_info(state)?.fiber_stiffness_along_tendon)
    }

    pub fn passive_fiber_elastic_force(&self, state: &MuscleState) -> Result<f64> {
        Ok(self.dynamics_info(state)?.fiber_forces.passive_elastic)
    }

    pub fn passive_fiber_elastic_force_along_tendon(&self, state: &MuscleState) -> Result<f64> {
        Ok(self.dynamics_info(state)?.fiber_forces_along_tendon.passive_elastic)
    }

    pub fn passive_fiber_damping_force(&self, state: &MuscleState) -> Result<f64> {
        Ok(self.dynamics_info(state)?.fiber_forces.passive_damping)
    }

    pub fn passive_fiber_damping_force_along_tendon(&self, state: &MuscleState) -> Result<f64> {
        Ok(self.dynamics_info(state)?.fiber_forces_along_tendon.passive_damping)
    }

    /// Fiber force contributions at an explicit activation, length (m) and velocity (m/s)
    pub fn fiber_force_at(&self, activation: f64, fiber_length: f64, fiber_velocity: f64) -> Result<FiberForces> {
        let dlce_n = fiber_velocity / (self.config.max_contraction_velocity * self.config.optimal_fiber_length);
        let multipliers = FiberMultipliers::evaluate(
            &self.config.curves,
            fiber_length / self.config.optimal_fiber_length,
            dlce_n,
        );
        Ok(self.engine.fiber_forces(self.clamp_activation(activation), &multipliers, dlce_n))
    }

    /// a * fal * fv * fiso projected onto the tendon
    pub fn active_fiber_force_along_tendon(&self, activation: f64, fiber_length: f64, fiber_velocity: f64) -> Result<f64> {
        let geometry = self.pennation.geometry_at(fiber_length)?;
        let forces = self.fiber_force_at(activation, fiber_length, fiber_velocity)?;
        Ok(forces.active * geometry.cos_pennation)
    }

    /// Active fiber force along the tendon if the tendon were rigid at its slack length
    pub fn inextensible_tendon_active_fiber_force(&self, state: &MuscleState, activation: f64) -> Result<f64> {
        let along_tendon = state.path_length - self.config.tendon_slack_length;
        let geometry = if along_tendon <= self.minimum_fiber_length_along_tendon {
            self.pennation.geometry_at(self.minimum_fiber_length)?
        } else {
            self.pennation.fiber_length_from_pennation(along_tendon)?
        };
        let fiber_velocity = self
            .pennation
            .fiber_velocity_from_tendon_frame(state.path_lengthening_speed, geometry.cos_pennation);
        self.active_fiber_force_along_tendon(activation, geometry.fiber_length, fiber_velocity)
    }

    /// Activation that makes the fiber carry `tendon_force` at the given
    /// fiber length (m) and velocity (m/s). Not clamped to the activation range.
    pub fn activation_for_tendon_force(&self, tendon_force: f64, fiber_length: f64, fiber_velocity: f64) -> Result<f64> {
        let geometry = self.pennation.geometry_at(fiber_length)?;
        let dlce_n = fiber_velocity / (self.config.max_contraction_velocity * self.config.optimal_fiber_length);
        let multipliers = FiberMultipliers::evaluate(
            &self.config.curves,
            fiber_length / self.config.optimal_fiber_length,
            dlce_n,
        );
        self.engine.activation_for_tendon_force(
            tendon_force,
            &multipliers,
            dlce_n,
            geometry.cos_pennation,
            self.config.fiber_velocity.activation_floor,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_invalid_configs_rejected() {
        let bad = [
            MuscleConfig::default().with_max_isometric_force(0.0),
            MuscleConfig::default().with_optimal_fiber_length(f64::NAN),
            MuscleConfig::default().with_fiber_damping(0.0005),
            MuscleConfig::default().with_fiber_damping(-0.1),
            MuscleConfig::default().with_minimum_activation(0.0),
            MuscleConfig::default().with_pennation_angle_at_optimal(1.5),
            MuscleConfig::default().with_maximum_pennation_angle(std::f64::consts::FRAC_PI_2),
        ];
        for config in bad {
            let err = DampedMuscle::new(config).unwrap_err();
            assert!(matches!(err, MuscleError::InvalidConfig(_)), "{:?}", config);
        }

        let mut rigid_linear = CurveSet::default();
        rigid_linear.tendon_force_length.linear_strain = 0.0;
        let mut no_span = CurveSet::default();
        no_span.fiber_force_length.reference_length = 0.5;
        let mut no_curvature = CurveSet::default();
        no_curvature.force_velocity.concentric_curvature = -0.25;
        for curves in [rigid_linear, no_span, no_curvature] {
            let err = DampedMuscle::new(MuscleConfig::default().with_curves(curves)).unwrap_err();
            assert!(matches!(err, MuscleError::InvalidCurve(_)), "{:?}", curves);
        }
        assert!(DampedMuscle::new(MuscleConfig::default().with_fiber_damping(0.0)).is_ok());
    }

    #[test]
    fn test_minimum_fiber_length_uses_larger_bound() {
        let parallel = DampedMuscle::new(MuscleConfig::default()).unwrap();
        assert_relative_eq!(parallel.minimum_fiber_length(), 0.05);

        // Steep pennation pushes the geometric bound past the active support bound
        let pennate = DampedMuscle::new(
            MuscleConfig::default()
                .with_pennation_angle_at_optimal(0.6)
                .with_maximum_pennation_angle(0.7),
        )
        .unwrap();
        let geometric = 0.1 * 0.6_f64.sin() / 0.7_f64.sin();
        assert_relative_eq!(pennate.minimum_fiber_length(), geometric, epsilon = 1e-12);
        assert!(pennate.minimum_fiber_length() > 0.05);
    }

    #[test]
    fn test_activation_is_clamped_to_range() {
        let muscle = DampedMuscle::new(MuscleConfig::default()).unwrap();
        assert_eq!(muscle.clamp_activation(-1.0), 0.01);
        assert_eq!(muscle.clamp_activation(2.0), 1.0);
        assert_eq!(muscle.clamp_activation(f64::NAN), 0.01);
        assert_eq!(muscle.clamp_activation(0.4), 0.4);
    }

    #[test]
    fn test_dynamics_decomposition_is_consistent() {
        let muscle = DampedMuscle::new(MuscleConfig::default().with_pennation_angle_at_optimal(0.3)).unwrap();
        let mut state = MuscleState::new(0.7, 0.1, 0.31, 0.05);
        muscle.compute_fiber_equilibrium(&mut state, true).unwrap();

        let info = muscle.dynamics_info(&state).unwrap();
        let length = muscle.length_info(&state).unwrap();
        assert_relative_eq!(
            info.fiber_forces_along_tendon.total,
            info.fiber_forces.total * length.cos_pennation,
            max_relative = 1e-12
        );
        // At equilibrium the tendon carries the fiber force along the tendon
        assert_relative_eq!(info.tendon_force, info.fiber_forces_along_tendon.total, max_relative = 1e-6);
        assert!(info.musculotendon_stiffness < info.tendon_stiffness.unwrap());
        assert!(info.fiber_damping > 0.0);
        assert_relative_eq!(
            muscle.passive_fiber_damping_force_along_tendon(&state).unwrap(),
            info.fiber_forces.passive_damping * length.cos_pennation,
            max_relative = 1e-12
        );
        assert_relative_eq!(muscle.compute_actuation(&state).unwrap(), info.tendon_force);
    }

    #[test]
    fn test_activation_for_tendon_force_round_trip() {
        let muscle = DampedMuscle::new(MuscleConfig::default().with_pennation_angle_at_optimal(0.2)).unwrap();
        let (a, lce, dlce) = (0.45, 0.095, -0.1);
        let geometry = muscle.pennation().geometry_at(lce).unwrap();
        let force = muscle.fiber_force_at(a, lce, dlce).unwrap().total * geometry.cos_pennation;
        let recovered = muscle.activation_for_tendon_force(force, lce, dlce).unwrap();
        assert_relative_eq!(recovered, a, epsilon = 1e-12);
    }

    #[test]
    fn test_fiber_at_lower_bound_does_not_shorten() {
        let muscle = DampedMuscle::new(MuscleConfig::default()).unwrap();
        // Slack tendon, shortest fiber: the balance asks for shortening
        let state = MuscleState::new(1.0, muscle.minimum_fiber_length(), 0.2, -0.5);
        let info = muscle.velocity_info(&state).unwrap();
        assert_eq!(info.fiber_velocity, 0.0);
        assert_eq!(muscle.fiber_length_derivative(&state).unwrap(), 0.0);
    }

    #[test]
    fn test_rigid_tendon_carries_fiber_force() {
        let muscle = DampedMuscle::new(MuscleConfig::default().with_ignore_tendon_compliance(true)).unwrap();
        let state = MuscleState::new(0.5, 0.0, 0.3, 0.0);
        let info = muscle.dynamics_info(&state).unwrap();
        let length = muscle.length_info(&state).unwrap();
        assert_relative_eq!(length.fiber_length, 0.1, epsilon = 1e-12);
        assert_relative_eq!(info.tendon_force, 500.0 + info.fiber_forces.passive_elastic, max_relative = 1e-9);
        assert_eq!(info.musculotendon_stiffness, info.fiber_stiffness_along_tendon);
        assert_eq!(info.tendon_stiffness, None);
        assert_relative_eq!(
            muscle.inextensible_tendon_active_fiber_force(&state, 0.5).unwrap(),
            500.0,
            max_relative = 1e-9
        );
    }

    #[test]
    fn test_potential_energy_derivatives_are_elastic_forces() {
        let muscle = DampedMuscle::new(MuscleConfig::default().with_pennation_angle_at_optimal(0.2)).unwrap();
        let state = MuscleState::new(0.6, 0.115, 0.325, 0.0);
        let h = 1e-7;

        // Fiber energy depends on fiber length only
        let mut longer = state;
        longer.fiber_length += h;
        let mut shorter = state;
        shorter.fiber_length -= h;
        let d_fiber = (muscle.potential_energy_info(&longer).unwrap().fiber_potential_energy
            - muscle.potential_energy_info(&shorter).unwrap().fiber_potential_energy)
            / (2.0 * h);
        let passive = muscle.passive_fiber_elastic_force(&state).unwrap();
        assert!(passive > 0.0);
        assert_relative_eq!(d_fiber, passive, max_relative = 1e-5);

        // With the fiber fixed, path length moves the tendon one for one
        let mut stretched = state;
        stretched.path_length += h;
        let mut relaxed = state;
        relaxed.path_length -= h;
        let d_tendon = (muscle.potential_energy_info(&stretched).unwrap().tendon_potential_energy
            - muscle.potential_energy_info(&relaxed).unwrap().tendon_potential_energy)
            / (2.0 * h);
        let tendon_force = muscle.compute_actuation(&state).unwrap();
        assert!(tendon_force > 0.0);
        assert_relative_eq!(d_tendon, tendon_force, max_relative = 1e-5);

        let info = muscle.potential_energy_info(&state).unwrap();
        assert_relative_eq!(
            info.musculotendon_potential_energy,
            info.fiber_potential_energy + info.tendon_potential_energy
        );
    }

    #[test]
    fn test_slack_muscle_stores_no_energy() {
        let muscle = DampedMuscle::new(MuscleConfig::default()).unwrap();
        let state = MuscleState::new(0.5, 0.08, 0.27, 0.0);
        let info = muscle.potential_energy_info(&state).unwrap();
        assert_eq!(info.fiber_potential_energy, 0.0);
        assert_eq!(info.tendon_potential_energy, 0.0);
    }

    #[test]
    fn test_boundary_conditions_recover_equilibrium_state() {
        let muscle = DampedMuscle::new(MuscleConfig::default().with_pennation_angle_at_optimal(0.3)).unwrap();
        let mut state = MuscleState::new(0.7, 0.1, 0.31, 0.05);
        muscle.compute_fiber_equilibrium(&mut state, true).unwrap();

        let dynamics = muscle.dynamics_info(&state).unwrap();
        let velocity = muscle.velocity_info(&state).unwrap();
        let length = muscle.length_info(&state).unwrap();
        let tendon_force_rate = dynamics.tendon_stiffness.unwrap() * velocity.tendon_velocity;

        let fiber = muscle
            .fiber_state_given_boundary_conditions(
                state.path_length,
                state.path_lengthening_speed,
                dynamics.tendon_force,
                tendon_force_rate,
            )
            .unwrap();
        assert_relative_eq!(fiber.normalized_fiber_length, length.normalized_fiber_length, epsilon = 1e-9);
        assert_relative_eq!(fiber.pennation_angle, length.pennation_angle, epsilon = 1e-9);
        assert_relative_eq!(fiber.normalized_fiber_velocity, velocity.normalized_fiber_velocity, epsilon = 1e-9);
        assert_relative_eq!(fiber.activation, 0.7, max_relative = 1e-6);
    }

    #[test]
    fn test_boundary_conditions_reject_short_path() {
        let muscle = DampedMuscle::new(MuscleConfig::default()).unwrap();
        let err = muscle
            .fiber_state_given_boundary_conditions(0.21, 0.0, 500.0, 0.0)
            .unwrap_err();
        assert!(matches!(err, MuscleError::Geometry { .. }));
    }

    #[test]
    fn test_rigid_tendon_dynamics_omit_tendon_stiffness_in_json() {
        let rigid = DampedMuscle::new(MuscleConfig::default().with_ignore_tendon_compliance(true)).unwrap();
        let state = MuscleState::new(0.5, 0.0, 0.3, 0.0);
        let json = serde_json::to_value(rigid.dynamics_info(&state).unwrap()).unwrap();
        assert!(json.get("tendon_stiffness").is_none());

        let compliant = DampedMuscle::new(MuscleConfig::default()).unwrap();
        let mut state = MuscleState::new(0.5, 0.1, 0.31, 0.0);
        compliant.compute_initial_fiber_equilibrium(&mut state).unwrap();
        let json = serde_json::to_value(compliant.dynamics_info(&state).unwrap()).unwrap();
        assert!(json["tendon_stiffness"].as_f64().unwrap() > 0.0);
    }
}
