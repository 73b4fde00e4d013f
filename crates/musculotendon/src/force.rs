//! Fiber force decomposition and stiffness
//!
//! Forces are in newtons and stiffnesses in N/m. The fiber force is
//! `fiso * (a * fal * fv + fpe + beta * v)` with `v` the normalized fiber
//! velocity; the terms are reported separately so hosts can split elastic and
//! damping contributions.

use serde::{Deserialize, Serialize};

use crate::curves::{CurveSet, MuscleCurve};
use crate::error::{MuscleError, Result};
use crate::pennation::PennationGeometry;

/// Curve values and slopes at one normalized fiber length and velocity
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FiberMultipliers {
    pub active_force_length: f64,
    pub active_force_length_derivative: f64,
    pub passive_force_length: f64,
    pub passive_force_length_derivative: f64,
    pub force_velocity: f64,
    pub force_velocity_derivative: f64,
}

impl FiberMultipliers {
    pub fn evaluate(curves: &CurveSet, normalized_fiber_length: f64, normalized_fiber_velocity: f64) -> Self {
        FiberMultipliers {
            active_force_length: curves.active_force_length.evaluate(normalized_fiber_length),
            active_force_length_derivative: curves.active_force_length.derivative(normalized_fiber_length),
            passive_force_length: curves.fiber_force_length.evaluate(normalized_fiber_length),
            passive_force_length_derivative: curves.fiber_force_length.derivative(normalized_fiber_length),
            force_velocity: curves.force_velocity.evaluate(normalized_fiber_velocity),
            force_velocity_derivative: curves.force_velocity.derivative(normalized_fiber_velocity),
        }
    }
}

/// Fiber force split into its contributions (N)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FiberForces {
    pub total: f64,
    pub active: f64,
    pub passive_elastic: f64,
    pub passive_damping: f64,
}

impl FiberForces {
    pub fn passive(&self) -> f64 {
        self.passive_elastic + self.passive_damping
    }

    /// Every contribution projected onto the tendon
    pub fn along_tendon(&self, cos_pennation: f64) -> FiberForces {
        FiberForces {
            total: self.total * cos_pennation,
            active: self.active * cos_pennation,
            passive_elastic: self.passive_elastic * cos_pennation,
            passive_damping: self.passive_damping * cos_pennation,
        }
    }
}

/// Scales that turn normalized multipliers into forces and stiffnesses
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForceAndStiffnessEngine {
    pub max_isometric_force: f64,
    pub optimal_fiber_length: f64,
    pub tendon_slack_length: f64,
    /// Maximum contraction velocity in optimal fiber lengths per second
    pub max_contraction_velocity: f64,
    /// Normalized fiber damping coefficient beta
    pub damping: f64,
}

impl ForceAndStiffnessEngine {
    pub fn fiber_forces(&self, activation: f64, m: &FiberMultipliers, normalized_fiber_velocity: f64) -> FiberForces {
        let fiso = self.max_isometric_force;
        let active = fiso * activation * m.active_force_length * m.force_velocity;
        let passive_elastic = fiso * m.passive_force_length;
        let passive_damping = fiso * self.damping * normalized_fiber_velocity;
        FiberForces {
            total: active + passive_elastic + passive_damping,
            active,
            passive_elastic,
            passive_damping,
        }
    }

    /// dF/dlce at fixed activation and velocity (N/m)
    pub fn fiber_stiffness(&self, activation: f64, m: &FiberMultipliers) -> f64 {
        self.max_isometric_force / self.optimal_fiber_length
            * (activation * m.active_force_length_derivative * m.force_velocity + m.passive_force_length_derivative)
    }

    /// dF/d(normalized fiber velocity) (N)
    pub fn d_fiber_force_d_normalized_fiber_velocity(&self, activation: f64, m: &FiberMultipliers) -> f64 {
        self.max_isometric_force * (activation * m.active_force_length * m.force_velocity_derivative + self.damping)
    }

    /// dF/d(fiber velocity) (N s/m)
    pub fn fiber_damping(&self, activation: f64, m: &FiberMultipliers) -> f64 {
        self.d_fiber_force_d_normalized_fiber_velocity(activation, m)
            / (self.max_contraction_velocity * self.optimal_fiber_length)
    }

    /// d(F cos(phi))/dlce, including the change of pennation with length
    pub fn d_fiber_force_along_tendon_d_fiber_length(
        &self,
        fiber_force: f64,
        fiber_stiffness: f64,
        geometry: &PennationGeometry,
    ) -> f64 {
        let sin = geometry.sin_pennation;
        let cos = geometry.cos_pennation;
        fiber_stiffness * cos + fiber_force * sin * sin / (cos * geometry.fiber_length)
    }

    /// d(F cos(phi))/d(lce cos(phi)), the fiber stiffness seen by the tendon
    pub fn fiber_stiffness_along_tendon(&self, fiber_force: f64, fiber_stiffness: f64, geometry: &PennationGeometry) -> f64 {
        self.d_fiber_force_along_tendon_d_fiber_length(fiber_force, fiber_stiffness, geometry) * geometry.cos_pennation
    }

    pub fn tendon_force(&self, tendon_force_multiplier: f64) -> f64 {
        self.max_isometric_force * tendon_force_multiplier
    }

    /// dFt/dlt (N/m) from the slope of the tendon curve
    pub fn tendon_stiffness(&self, tendon_force_multiplier_derivative: f64) -> f64 {
        self.max_isometric_force / self.tendon_slack_length * tendon_force_multiplier_derivative
    }

    /// dFt/dlce with the path length held fixed
    pub fn d_tendon_force_d_fiber_length(&self, tendon_stiffness: f64, cos_pennation: f64) -> f64 {
        -tendon_stiffness / cos_pennation
    }

    /// Fiber and tendon acting as springs in series
    pub fn musculotendon_stiffness(&self, fiber_stiffness_along_tendon: f64, tendon_stiffness: f64) -> f64 {
        let sum = fiber_stiffness_along_tendon + tendon_stiffness;
        if sum.abs() < f64::EPSILON * self.max_isometric_force {
            return 0.0;
        }
        fiber_stiffness_along_tendon * tendon_stiffness / sum
    }

    /// Activation that makes the fiber carry `tendon_force` at a fixed length
    /// and velocity. Fails when fal*fv is at or below `floor`.
    pub fn activation_for_tendon_force(
        &self,
        tendon_force: f64,
        m: &FiberMultipliers,
        normalized_fiber_velocity: f64,
        cos_pennation: f64,
        floor: f64,
    ) -> Result<f64> {
        let scale = m.active_force_length * m.force_velocity;
        if !(scale > floor) {
            return Err(MuscleError::ActivationSingularity { scale, floor });
        }
        let fiber_force = tendon_force / (self.max_isometric_force * cos_pennation);
        Ok((fiber_force - m.passive_force_length - self.damping * normalized_fiber_velocity) / scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pennation::PennationModel;
    use approx::assert_relative_eq;

    fn engine() -> ForceAndStiffnessEngine {
        ForceAndStiffnessEngine {
            max_isometric_force: 1000.0,
            optimal_fiber_length: 0.1,
            tendon_slack_length: 0.2,
            max_contraction_velocity: 10.0,
            damping: 0.1,
        }
    }

    fn force_at(curves: &CurveSet, e: &ForceAndStiffnessEngine, a: f64, lce: f64, v: f64) -> f64 {
        let m = FiberMultipliers::evaluate(curves, lce / e.optimal_fiber_length, v);
        e.fiber_forces(a, &m, v).total
    }

    #[test]
    fn test_decomposition_sums_to_total() {
        let curves = CurveSet::default();
        let e = engine();
        let m = FiberMultipliers::evaluate(&curves, 1.5, 0.2);
        let forces = e.fiber_forces(0.6, &m, 0.2);
        assert_relative_eq!(forces.total, forces.active + forces.passive(), epsilon = 1e-9);
        assert!(forces.passive_elastic > 0.0);
        assert_relative_eq!(forces.passive_damping, 1000.0 * 0.1 * 0.2, epsilon = 1e-9);

        let along = forces.along_tendon(0.5);
        assert_relative_eq!(along.total, 0.5 * forces.total);
    }

    #[test]
    fn test_isometric_optimal_force_is_activation_times_fiso() {
        let curves = CurveSet::default();
        let e = engine();
        let m = FiberMultipliers::evaluate(&curves, 1.0, 0.0);
        let forces = e.fiber_forces(0.8, &m, 0.0);
        assert_relative_eq!(forces.active, 800.0, epsilon = 1e-9);
        assert_relative_eq!(forces.total, 800.0, epsilon = 1e-9);
    }

    #[test]
    fn test_fiber_stiffness_matches_finite_difference() {
        let curves = CurveSet::default();
        let e = engine();
        let (a, lce, v) = (0.7, 0.115, -0.1);
        let m = FiberMultipliers::evaluate(&curves, lce / 0.1, v);
        let h = 1e-7;
        let fd = (force_at(&curves, &e, a, lce + h, v) - force_at(&curves, &e, a, lce - h, v)) / (2.0 * h);
        assert_relative_eq!(e.fiber_stiffness(a, &m), fd, max_relative = 1e-5);
    }

    #[test]
    fn test_velocity_derivative_matches_finite_difference() {
        let curves = CurveSet::default();
        let e = engine();
        let (a, lce, v) = (0.4, 0.095, 0.3);
        let m = FiberMultipliers::evaluate(&curves, lce / 0.1, v);
        let h = 1e-7;
        let fd = (force_at(&curves, &e, a, lce, v + h) - force_at(&curves, &e, a, lce, v - h)) / (2.0 * h);
        assert_relative_eq!(e.d_fiber_force_d_normalized_fiber_velocity(a, &m), fd, max_relative = 1e-5);
        assert_relative_eq!(e.fiber_damping(a, &m), fd / (10.0 * 0.1), max_relative = 1e-5);
    }

    #[test]
    fn test_stiffness_along_tendon_includes_pennation_change() {
        let curves = CurveSet::default();
        let e = engine();
        let pennation = PennationModel::new(0.1, 0.4, (0.1_f64).acos()).unwrap();
        let a = 0.9;
        let lce = 0.105;

        let along_tendon = |l: f64| {
            let g = pennation.geometry_at(l).unwrap();
            (g.fiber_length_along_tendon(), force_at(&curves, &e, a, l, 0.0) * g.cos_pennation)
        };
        let h = 1e-7;
        let (x_hi, f_hi) = along_tendon(lce + h);
        let (x_lo, f_lo) = along_tendon(lce - h);

        let geometry = pennation.geometry_at(lce).unwrap();
        let m = FiberMultipliers::evaluate(&curves, lce / 0.1, 0.0);
        let force = e.fiber_forces(a, &m, 0.0).total;
        let kf = e.fiber_stiffness(a, &m);

        assert_relative_eq!(
            e.d_fiber_force_along_tendon_d_fiber_length(force, kf, &geometry),
            (f_hi - f_lo) / (2.0 * h),
            max_relative = 1e-5
        );
        assert_relative_eq!(
            e.fiber_stiffness_along_tendon(force, kf, &geometry),
            (f_hi - f_lo) / (x_hi - x_lo),
            max_relative = 1e-5
        );
    }

    #[test]
    fn test_series_stiffness_is_softer_than_either_element() {
        let e = engine();
        let k = e.musculotendon_stiffness(2.0e4, 5.0e4);
        assert!(k < 2.0e4 && k < 5.0e4);
        assert_relative_eq!(1.0 / k, 1.0 / 2.0e4 + 1.0 / 5.0e4, max_relative = 1e-12);
        assert_eq!(e.musculotendon_stiffness(0.0, 0.0), 0.0);
        assert_relative_eq!(e.d_tendon_force_d_fiber_length(3.0e4, 0.5), -6.0e4);
    }

    #[test]
    fn test_activation_inversion_recovers_activation() {
        let curves = CurveSet::default();
        let e = engine();
        let (a, v, cos) = (0.35, -0.2, 0.9);
        let m = FiberMultipliers::evaluate(&curves, 0.92, v);
        let tendon_force = e.fiber_forces(a, &m, v).total * cos;
        let recovered = e.activation_for_tendon_force(tendon_force, &m, v, cos, 1e-8).unwrap();
        assert_relative_eq!(recovered, a, epsilon = 1e-12);
    }

    #[test]
    fn test_activation_inversion_rejects_vanishing_multiplier() {
        let curves = CurveSet::default();
        let e = engine();
        // fv(-1) = 0 at maximum shortening
        let m = FiberMultipliers::evaluate(&curves, 1.0, -1.0);
        let err = e.activation_for_tendon_force(100.0, &m, -1.0, 1.0, 1e-8).unwrap_err();
        assert!(matches!(err, MuscleError::ActivationSingularity { .. }));
    }
}
