//! Normalized muscle curves
//!
//! Provides:
//! - A capability trait shared by every curve (`evaluate`, `derivative`)
//! - Active and passive fiber force-length curves
//! - Tendon force-length curve (power-law toe region, then linear)
//! - Force-velocity curve (Hill hyperbola with eccentric enhancement)
//!
//! Shapes follow Haeufle et al. (2014), "Hill-type muscle model with serial
//! damping and eccentric force-velocity relation", J. Biomech. 47(6).
//! All inputs are normalized: fiber lengths by the optimal fiber length,
//! tendon lengths by the tendon slack length, fiber velocities by the maximum
//! contraction velocity.

use serde::{Deserialize, Serialize};

use crate::error::{MuscleError, Result};

/// Scalar curve with an analytic first derivative.
pub trait MuscleCurve: Send + Sync {
    /// Curve value at `x`
    fn evaluate(&self, x: f64) -> f64;

    /// First derivative at `x`
    fn derivative(&self, x: f64) -> f64;
}

/// Active force-length multiplier `fal(l) = exp(-(|l - 1| / width)^exponent)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActiveForceLengthCurve {
    /// Width of the ascending limb (normalized length)
    pub width_ascending: f64,
    /// Exponent of the ascending limb
    pub exponent_ascending: f64,
    /// Width of the descending limb (normalized length)
    pub width_descending: f64,
    /// Exponent of the descending limb
    pub exponent_descending: f64,
    /// Shortest normalized fiber length the curve supports. The muscle never
    /// lets the fiber go below this length.
    pub min_normalized_length: f64,
}

impl Default for ActiveForceLengthCurve {
    fn default() -> Self {
        ActiveForceLengthCurve {
            width_ascending: 0.45,
            exponent_ascending: 3.0,
            width_descending: 0.45,
            exponent_descending: 1.5,
            min_normalized_length: 0.5,
        }
    }
}

impl ActiveForceLengthCurve {
    fn limb(&self, normalized_length: f64) -> (f64, f64) {
        if normalized_length < 1.0 {
            (self.width_ascending, self.exponent_ascending)
        } else {
            (self.width_descending, self.exponent_descending)
        }
    }
}

impl MuscleCurve for ActiveForceLengthCurve {
    fn evaluate(&self, normalized_length: f64) -> f64 {
        let (width, exponent) = self.limb(normalized_length);
        let x = (normalized_length - 1.0).abs() / width;
        (-x.powf(exponent)).exp()
    }

    fn derivative(&self, normalized_length: f64) -> f64 {
        let (width, exponent) = self.limb(normalized_length);
        let offset = normalized_length - 1.0;
        let x = offset.abs() / width;
        if x == 0.0 {
            return 0.0;
        }
        -exponent * x.powf(exponent - 1.0) * offset.signum() / width * self.evaluate(normalized_length)
    }
}

/// Passive (parallel elastic) fiber force-length multiplier.
///
/// Zero below `slack_length`, then `force_at_reference * s^exponent` where
/// `s = (l - slack_length) / (reference_length - slack_length)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FiberForceLengthCurve {
    pub slack_length: f64,
    pub reference_length: f64,
    pub force_at_reference: f64,
    pub exponent: f64,
}

impl Default for FiberForceLengthCurve {
    fn default() -> Self {
        FiberForceLengthCurve {
            slack_length: 0.9,
            reference_length: 1.45,
            force_at_reference: 2.0,
            exponent: 2.5,
        }
    }
}

impl FiberForceLengthCurve {
    /// Area under the curve from slack to `normalized_length`
    pub fn integral(&self, normalized_length: f64) -> f64 {
        if normalized_length <= self.slack_length {
            return 0.0;
        }
        let span = self.reference_length - self.slack_length;
        let s = (normalized_length - self.slack_length) / span;
        self.force_at_reference * span * s.powf(self.exponent + 1.0) / (self.exponent + 1.0)
    }
}

impl MuscleCurve for FiberForceLengthCurve {
    fn evaluate(&self, normalized_length: f64) -> f64 {
        if normalized_length <= self.slack_length {
            return 0.0;
        }
        let span = self.reference_length - self.slack_length;
        self.force_at_reference * ((normalized_length - self.slack_length) / span).powf(self.exponent)
    }

    fn derivative(&self, normalized_length: f64) -> f64 {
        if normalized_length <= self.slack_length {
            return 0.0;
        }
        let span = self.reference_length - self.slack_length;
        let s = (normalized_length - self.slack_length) / span;
        self.force_at_reference * self.exponent * s.powf(self.exponent - 1.0) / span
    }
}

/// Tendon force-length multiplier over normalized tendon length.
///
/// Strain `e = l - 1`. Toe region `F0 * (e / e_toe)^(e_toe / e_lin)` up to
/// `e_toe`, then linear with slope `F0 / e_lin`. The exponent makes the joint
/// C1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TendonForceLengthCurve {
    /// Strain at the end of the toe region
    pub toe_strain: f64,
    /// Strain that adds `force_at_toe` along the linear region
    pub linear_strain: f64,
    /// Normalized force at the end of the toe region
    pub force_at_toe: f64,
}

impl Default for TendonForceLengthCurve {
    fn default() -> Self {
        TendonForceLengthCurve {
            toe_strain: 0.0425,
            linear_strain: 0.017,
            force_at_toe: 0.4,
        }
    }
}

impl TendonForceLengthCurve {
    fn toe_exponent(&self) -> f64 {
        self.toe_strain / self.linear_strain
    }

    /// Area under the curve from slack to `normalized_length`
    pub fn integral(&self, normalized_length: f64) -> f64 {
        let strain = normalized_length - 1.0;
        let nu = self.toe_exponent();
        if strain <= 0.0 {
            0.0
        } else if strain < self.toe_strain {
            self.force_at_toe * self.toe_strain * (strain / self.toe_strain).powf(nu + 1.0) / (nu + 1.0)
        } else {
            let toe = self.force_at_toe * self.toe_strain / (nu + 1.0);
            let beyond = strain - self.toe_strain;
            toe + self.force_at_toe * (beyond + 0.5 * beyond * beyond / self.linear_strain)
        }
    }

    /// Normalized length carrying `multiplier`; slack length for a nonpositive multiplier
    pub fn length_at(&self, multiplier: f64) -> f64 {
        if multiplier <= 0.0 {
            1.0
        } else if multiplier < self.force_at_toe {
            1.0 + self.toe_strain * (multiplier / self.force_at_toe).powf(1.0 / self.toe_exponent())
        } else {
            1.0 + self.toe_strain + self.linear_strain * (multiplier / self.force_at_toe - 1.0)
        }
    }
}

impl MuscleCurve for TendonForceLengthCurve {
    fn evaluate(&self, normalized_length: f64) -> f64 {
        let strain = normalized_length - 1.0;
        if strain <= 0.0 {
            0.0
        } else if strain < self.toe_strain {
            self.force_at_toe * (strain / self.toe_strain).powf(self.toe_exponent())
        } else {
            self.force_at_toe * (1.0 + (strain - self.toe_strain) / self.linear_strain)
        }
    }

    fn derivative(&self, normalized_length: f64) -> f64 {
        let strain = normalized_length - 1.0;
        if strain <= 0.0 {
            0.0
        } else if strain < self.toe_strain {
            let nu = self.toe_exponent();
            self.force_at_toe * nu / self.toe_strain * (strain / self.toe_strain).powf(nu - 1.0)
        } else {
            self.force_at_toe / self.linear_strain
        }
    }
}

/// Force-velocity multiplier on normalized fiber velocity in [-1, 1].
///
/// - Shortening (v < 0): `(1 + v) / (1 - v / curvature)`, zero at v = -1
/// - Lengthening (v > 0): rises toward `eccentric_force_max`, slope matched at 0
///
/// Inputs outside [-1, 1] are clamped; the derivative is zero there.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForceVelocityCurve {
    pub concentric_curvature: f64,
    pub eccentric_force_max: f64,
}

impl Default for ForceVelocityCurve {
    fn default() -> Self {
        ForceVelocityCurve {
            concentric_curvature: 0.25,
            eccentric_force_max: 1.5,
        }
    }
}

impl ForceVelocityCurve {
    /// Slope at the isometric point
    pub fn isometric_slope(&self) -> f64 {
        1.0 + 1.0 / self.concentric_curvature
    }

    fn eccentric_scale(&self) -> f64 {
        (self.eccentric_force_max - 1.0) / self.isometric_slope()
    }

    /// Multiplier at maximum shortening velocity
    pub fn min_multiplier(&self) -> f64 {
        self.evaluate(-1.0)
    }

    /// Multiplier at maximum lengthening velocity
    pub fn max_multiplier(&self) -> f64 {
        self.evaluate(1.0)
    }
}

impl MuscleCurve for ForceVelocityCurve {
    fn evaluate(&self, normalized_velocity: f64) -> f64 {
        let v = normalized_velocity.clamp(-1.0, 1.0);
        if v <= 0.0 {
            (1.0 + v) / (1.0 - v / self.concentric_curvature)
        } else {
            let c = self.eccentric_scale();
            (1.0 + self.eccentric_force_max * v / c) / (1.0 + v / c)
        }
    }

    fn derivative(&self, normalized_velocity: f64) -> f64 {
        let v = normalized_velocity;
        if !(-1.0..=1.0).contains(&v) {
            return 0.0;
        }
        if v <= 0.0 {
            let d = 1.0 - v / self.concentric_curvature;
            self.isometric_slope() / (d * d)
        } else {
            let c = self.eccentric_scale();
            let d = 1.0 + v / c;
            (self.eccentric_force_max - 1.0) / c / (d * d)
        }
    }
}

/// The four curves a muscle is built from
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CurveSet {
    pub active_force_length: ActiveForceLengthCurve,
    pub fiber_force_length: FiberForceLengthCurve,
    pub tendon_force_length: TendonForceLengthCurve,
    pub force_velocity: ForceVelocityCurve,
}

impl CurveSet {
    /// Reject parameters that make any curve or its derivative non-finite
    pub fn validate(&self) -> Result<()> {
        let fal = &self.active_force_length;
        let fpe = &self.fiber_force_length;
        let fse = &self.tendon_force_length;
        let fv = &self.force_velocity;

        let positive = [
            ("active_force_length.width_ascending", fal.width_ascending),
            ("active_force_length.exponent_ascending", fal.exponent_ascending),
            ("active_force_length.width_descending", fal.width_descending),
            ("active_force_length.exponent_descending", fal.exponent_descending),
            ("fiber_force_length.force_at_reference", fpe.force_at_reference),
            ("tendon_force_length.toe_strain", fse.toe_strain),
            ("tendon_force_length.linear_strain", fse.linear_strain),
            ("tendon_force_length.force_at_toe", fse.force_at_toe),
            ("force_velocity.concentric_curvature", fv.concentric_curvature),
        ];
        for (name, value) in positive {
            if !(value > 0.0 && value.is_finite()) {
                return Err(MuscleError::InvalidCurve(format!(
                    "{} must be positive and finite, got {}",
                    name, value
                )));
            }
        }

        if !(fal.min_normalized_length > 0.0 && fal.min_normalized_length < 1.0) {
            return Err(MuscleError::InvalidCurve(format!(
                "active_force_length.min_normalized_length must lie in (0, 1), got {}",
                fal.min_normalized_length
            )));
        }
        if !(fpe.slack_length.is_finite() && fpe.reference_length.is_finite() && fpe.reference_length > fpe.slack_length) {
            return Err(MuscleError::InvalidCurve(format!(
                "fiber_force_length.reference_length {} must exceed slack_length {}",
                fpe.reference_length, fpe.slack_length
            )));
        }
        // Exponents below one give an unbounded slope at slack
        if !(fpe.exponent >= 1.0 && fpe.exponent.is_finite()) {
            return Err(MuscleError::InvalidCurve(format!(
                "fiber_force_length.exponent must be at least 1, got {}",
                fpe.exponent
            )));
        }
        if fse.toe_exponent() < 1.0 {
            return Err(MuscleError::InvalidCurve(format!(
                "tendon_force_length.toe_strain {} must be at least linear_strain {}",
                fse.toe_strain, fse.linear_strain
            )));
        }
        if !(fv.eccentric_force_max > 1.0 && fv.eccentric_force_max.is_finite()) {
            return Err(MuscleError::InvalidCurve(format!(
                "force_velocity.eccentric_force_max must exceed 1, got {}",
                fv.eccentric_force_max
            )));
        }
        Ok(())
    }
}
