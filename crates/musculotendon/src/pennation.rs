//! Fixed-width pennation model
//!
//! Fibers are arranged as a parallelogram of constant width
//! `w = optimal_fiber_length * sin(pennation_at_optimal)`, so for a fiber of
//! length `l` the pennation angle satisfies `l * sin(phi) = w` and the fiber's
//! projection onto the tendon is `l * cos(phi) = sqrt(l^2 - w^2)`.

use crate::error::{MuscleError, Result};

/// Fiber lengths below this are treated as degenerate
pub const MIN_FIBER_LENGTH_FLOOR: f64 = 1e-9;

/// Pennation angle and its trigonometric values at one fiber length
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PennationGeometry {
    pub fiber_length: f64,
    pub pennation_angle: f64,
    pub sin_pennation: f64,
    pub cos_pennation: f64,
}

impl PennationGeometry {
    /// Fiber length projected onto the tendon (m)
    pub fn fiber_length_along_tendon(&self) -> f64 {
        self.fiber_length * self.cos_pennation
    }

    /// Rate of change of the pennation angle with fiber length (rad/m)
    pub fn d_pennation_d_fiber_length(&self) -> f64 {
        -self.sin_pennation / (self.cos_pennation * self.fiber_length)
    }
}

/// Stateless mapping between fiber-frame and tendon-frame quantities
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PennationModel {
    fiber_width: f64,
    maximum_pennation_angle: f64,
    minimum_fiber_length: f64,
}

impl PennationModel {
    /// Build the model from the optimal fiber length and the pennation angle at
    /// that length, bounded by `maximum_pennation_angle`.
    pub fn new(
        optimal_fiber_length: f64,
        pennation_angle_at_optimal: f64,
        maximum_pennation_angle: f64,
    ) -> Result<Self> {
        if !(optimal_fiber_length > 0.0 && optimal_fiber_length.is_finite()) {
            return Err(MuscleError::InvalidConfig(format!(
                "optimal fiber length must be positive, got {}",
                optimal_fiber_length
            )));
        }
        if !(0.0..std::f64::consts::FRAC_PI_2).contains(&maximum_pennation_angle) {
            return Err(MuscleError::InvalidConfig(format!(
                "maximum pennation angle must lie in [0, pi/2), got {}",
                maximum_pennation_angle
            )));
        }
        if !(0.0..=maximum_pennation_angle).contains(&pennation_angle_at_optimal) {
            return Err(MuscleError::InvalidConfig(format!(
                "pennation angle at optimal fiber length ({}) must lie in [0, {}]",
                pennation_angle_at_optimal, maximum_pennation_angle
            )));
        }

        let fiber_width = optimal_fiber_length * pennation_angle_at_optimal.sin();
        let minimum_fiber_length = if fiber_width > 0.0 {
            fiber_width / maximum_pennation_angle.sin()
        } else {
            0.0
        };

        Ok(PennationModel {
            fiber_width,
            maximum_pennation_angle,
            minimum_fiber_length: minimum_fiber_length.max(MIN_FIBER_LENGTH_FLOOR),
        })
    }

    pub fn fiber_width(&self) -> f64 {
        self.fiber_width
    }

    pub fn maximum_pennation_angle(&self) -> f64 {
        self.maximum_pennation_angle
    }

    /// Smallest fiber length whose pennation angle stays within the maximum
    pub fn minimum_fiber_length(&self) -> f64 {
        self.minimum_fiber_length
    }

    /// Projection of the minimum fiber length onto the tendon
    pub fn minimum_fiber_length_along_tendon(&self) -> f64 {
        self.minimum_fiber_length * self.maximum_pennation_angle.cos()
    }

    /// Pennation angle for a fiber of the given length
    pub fn pennation_angle(&self, fiber_length: f64) -> Result<f64> {
        Ok(self.geometry_at(fiber_length)?.pennation_angle)
    }

    /// Pennation angle, sine and cosine for a fiber of the given length.
    ///
    /// Fails when the fiber is shorter than the fiber width, which would
    /// require sin(phi) > 1.
    pub fn geometry_at(&self, fiber_length: f64) -> Result<PennationGeometry> {
        if !fiber_length.is_finite() || fiber_length <= 0.0 {
            return Err(MuscleError::geometry(format!(
                "fiber length must be positive and finite, got {}",
                fiber_length
            )));
        }
        if fiber_length < self.fiber_width {
            return Err(MuscleError::geometry(format!(
                "fiber length {} m is shorter than the fiber width {} m",
                fiber_length, self.fiber_width
            )));
        }

        let sin_pennation = self.fiber_width / fiber_length;
        let cos_pennation = ((1.0 - sin_pennation) * (1.0 + sin_pennation)).sqrt();

        Ok(PennationGeometry {
            fiber_length,
            pennation_angle: sin_pennation.atan2(cos_pennation),
            sin_pennation,
            cos_pennation,
        })
    }

    /// Fiber length and pennation for a fiber whose projection onto the tendon
    /// is `length_along_tendon`.
    pub fn fiber_length_from_pennation(&self, length_along_tendon: f64) -> Result<PennationGeometry> {
        if !length_along_tendon.is_finite() || length_along_tendon < 0.0 {
            return Err(MuscleError::geometry(format!(
                "fiber length along tendon must be non-negative, got {}",
                length_along_tendon
            )));
        }
        let fiber_length = length_along_tendon.hypot(self.fiber_width);
        if fiber_length <= 0.0 {
            return Err(MuscleError::geometry("zero-length fiber with zero fiber width"));
        }

        Ok(PennationGeometry {
            fiber_length,
            pennation_angle: self.fiber_width.atan2(length_along_tendon),
            sin_pennation: self.fiber_width / fiber_length,
            cos_pennation: length_along_tendon / fiber_length,
        })
    }

    /// Tendon length left over once the fiber's projection is removed from the path
    pub fn tendon_length(&self, path_length: f64, geometry: &PennationGeometry) -> f64 {
        path_length - geometry.fiber_length_along_tendon()
    }

    /// Fiber velocity projected onto the tendon, dropping the angular-velocity
    /// cross term.
    pub fn velocity_along_tendon(&self, fiber_velocity: f64, cos_pennation: f64) -> f64 {
        fiber_velocity * cos_pennation
    }

    /// Inverse of [`Self::velocity_along_tendon`]
    pub fn fiber_velocity_from_tendon_frame(&self, velocity_along_tendon: f64, cos_pennation: f64) -> f64 {
        velocity_along_tendon / cos_pennation
    }

    /// d(phi)/dt implied by the fixed-width constraint
    pub fn pennation_angular_velocity(&self, geometry: &PennationGeometry, fiber_velocity: f64) -> f64 {
        geometry.d_pennation_d_fiber_length() * fiber_velocity
    }
}
