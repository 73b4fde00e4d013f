//! Error types for musculotendon queries.

use thiserror::Error;

/// Errors raised by the musculotendon solvers and the host-facing muscle.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MuscleError {
    /// The requested configuration cannot be realized by the fixed-width
    /// pennation model.
    #[error("infeasible pennation geometry: {reason}")]
    Geometry {
        /// What made the configuration infeasible.
        reason: String,
    },

    /// The multiplier dividing the force balance fell below the numeric floor.
    #[error("activation singularity: scale {scale:e} is below the numeric floor {floor:e}")]
    ActivationSingularity {
        /// Offending product (a·fal for the velocity solve, fal·fv for the
        /// activation inversion).
        scale: f64,
        /// Floor it was compared against.
        floor: f64,
    },

    /// Equilibration was requested and the estimator hit its iteration cap.
    #[error(
        "cannot equilibrate muscle after {iterations} iterations \
         (relative force error {solution_error:e}, fiber length {fiber_length} m)"
    )]
    CannotEquilibrate {
        /// Newton iterations used.
        iterations: usize,
        /// Final |fiber force along tendon - tendon force| / fiso.
        solution_error: f64,
        /// Best fiber length found (m).
        fiber_length: f64,
    },

    /// A configuration value was rejected when the muscle was built.
    #[error("invalid muscle configuration: {0}")]
    InvalidConfig(String),

    /// A curve does not satisfy the monotonicity needed for inversion.
    #[error("invalid curve: {0}")]
    InvalidCurve(String),
}

impl MuscleError {
    pub(crate) fn geometry(reason: impl Into<String>) -> Self {
        MuscleError::Geometry {
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MuscleError>;
