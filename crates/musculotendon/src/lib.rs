//! Hill-type musculotendon model with serial fiber damping
//!
//! A contractile fiber (active, passive elastic and linear damping
//! contributions) acts in series with an elastic tendon through a fixed-width
//! pennation geometry. Given activation, path length and path lengthening
//! speed, the crate finds the fiber length and velocity at which the fiber
//! force projected onto the tendon equals the tendon force, and reports the
//! forces, stiffnesses and damping a host dynamics engine needs.

pub mod bank;
pub mod curves;
pub mod equilibrium;
pub mod error;
pub mod fiber_velocity;
pub mod force;
pub mod fv_inverse;
pub mod muscle;
pub mod pennation;

pub use bank::MuscleBank;
pub use curves::{
    ActiveForceLengthCurve, CurveSet, FiberForceLengthCurve, ForceVelocityCurve, MuscleCurve, TendonForceLengthCurve,
};
pub use equilibrium::{
    EquilibriumInputs, EquilibriumMode, EquilibriumReport, EquilibriumSolverConfig, FiberLengthEquilibriumEstimator,
    FiberState, SolveStatus,
};
pub use error::{MuscleError, Result};
pub use fiber_velocity::{DampedFiberVelocitySolver, FiberVelocitySolution, FiberVelocitySolverConfig, ForceBalance};
pub use force::{FiberForces, FiberMultipliers, ForceAndStiffnessEngine};
pub use fv_inverse::{ForceVelocityInverseCurve, InverseEvaluation};
pub use muscle::{
    BoundaryFiberState, DampedMuscle, FiberVelocityInfo, MuscleConfig, MuscleDynamicsInfo, MuscleLengthInfo,
    MusclePotentialEnergyInfo,
};
pub use pennation::{PennationGeometry, PennationModel};
