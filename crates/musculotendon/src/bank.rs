use log::warn;
use nalgebra::DVector;
use simcore::{ActuatorModel, ActuatorOutput, Model, MuscleState, SimContext, SimState};

use crate::equilibrium::SolveStatus;
use crate::error::{MuscleError, Result};
use crate::muscle::{DampedMuscle, MuscleConfig};

/// Independent muscles evaluated side by side, one per actuator slot
#[derive(Debug, Clone, Default)]
pub struct MuscleBank {
    pub muscles: Vec<DampedMuscle>,
}

impl MuscleBank {
    pub fn add_muscle(&mut self, config: MuscleConfig) -> Result<()> {
        self.muscles.push(DampedMuscle::new(config)?);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.muscles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.muscles.is_empty()
    }

    /// Tensile force of every muscle; NaN where the state is missing or the query failed
    pub fn tensile_forces(&self, states: &[MuscleState]) -> DVector<f64> {
        DVector::from_fn(self.muscles.len(), |i, _| {
            let Some(state) = states.get(i) else {
                warn!("no state supplied for muscle {}", i);
                return f64::NAN;
            };
            self.muscles[i].compute_actuation(state).unwrap_or_else(|e| {
                warn!("actuation query failed for muscle {}: {}", i, e);
                f64::NAN
            })
        })
    }

    /// Equilibrate each state against its muscle, stopping at the first failure
    pub fn equilibrate(&self, states: &mut [MuscleState], solve_for_velocity: bool) -> Result<Vec<SolveStatus>> {
        self.check_state_count(states)?;
        self.muscles
            .iter()
            .zip(states.iter_mut())
            .map(|(muscle, state)| muscle.compute_fiber_equilibrium(state, solve_for_velocity))
            .collect()
    }

    /// Static equilibrium from scratch for each state
    pub fn initialize(&self, states: &mut [MuscleState]) -> Result<Vec<SolveStatus>> {
        self.check_state_count(states)?;
        self.muscles
            .iter()
            .zip(states.iter_mut())
            .map(|(muscle, state)| muscle.compute_initial_fiber_equilibrium(state))
            .collect()
    }

    fn check_state_count(&self, states: &[MuscleState]) -> Result<()> {
        if states.len() != self.muscles.len() {
            return Err(MuscleError::InvalidConfig(format!(
                "bank holds {} muscles but {} states were supplied",
                self.muscles.len(),
                states.len()
            )));
        }
        Ok(())
    }

    fn output(muscle: &DampedMuscle, state: &MuscleState) -> Result<ActuatorOutput> {
        let info = muscle.dynamics_info(state)?;
        Ok(ActuatorOutput {
            tensile_force: info.tendon_force,
            fiber_velocity: muscle.fiber_velocity(state)?,
            fiber_stiffness_along_tendon: info.fiber_stiffness_along_tendon,
        })
    }
}

impl Model for MuscleBank {
    fn reset(&mut self) {
        self.muscles.clear();
    }
}

impl ActuatorModel for MuscleBank {
    fn step_actuation(&mut self, _ctx: SimContext, state: &mut SimState) {
        state.actuators.resize(self.muscles.len(), ActuatorOutput::default());
        for (i, muscle) in self.muscles.iter().enumerate() {
            let Some(muscle_state) = state.muscles.get(i) else {
                warn!("no state supplied for muscle {}", i);
                state.actuators[i] = ActuatorOutput {
                    tensile_force: f64::NAN,
                    fiber_velocity: f64::NAN,
                    fiber_stiffness_along_tendon: f64::NAN,
                };
                continue;
            };
            state.actuators[i] = Self::output(muscle, muscle_state).unwrap_or_else(|e| {
                warn!("actuation query failed for muscle {}: {}", i, e);
                ActuatorOutput {
                    tensile_force: f64::NAN,
                    fiber_velocity: f64::NAN,
                    fiber_stiffness_along_tendon: f64::NAN,
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank() -> MuscleBank {
        let mut bank = MuscleBank::default();
        bank.add_muscle(MuscleConfig::default()).unwrap();
        bank.add_muscle(
            MuscleConfig::default()
                .with_max_isometric_force(2500.0)
                .with_pennation_angle_at_optimal(0.25),
        )
        .unwrap();
        bank
    }

    #[test]
    fn test_step_writes_one_output_per_muscle() {
        let mut bank = bank();
        let mut states = vec![MuscleState::new(0.5, 0.1, 0.3, 0.0), MuscleState::new(0.8, 0.1, 0.3, 0.02)];
        bank.initialize(&mut states).unwrap();

        let mut sim = SimState::with_muscles(states.clone());
        bank.step_actuation(SimContext { dt: 1e-3, t: 0.0 }, &mut sim);

        assert_eq!(sim.actuators.len(), 2);
        let forces = bank.tensile_forces(&states);
        for (i, output) in sim.actuators.iter().enumerate() {
            assert!(output.tensile_force > 0.0);
            assert!((output.tensile_force - forces[i]).abs() < 1e-9);
        }
    }

    #[test]
    fn test_missing_state_yields_nan() {
        let mut bank = bank();
        let mut sim = SimState::with_muscles(vec![MuscleState::new(0.5, 0.1, 0.3, 0.0)]);
        bank.step_actuation(SimContext { dt: 1e-3, t: 0.0 }, &mut sim);
        assert!(sim.actuators[0].tensile_force.is_finite());
        assert!(sim.actuators[1].tensile_force.is_nan());
    }

    #[test]
    fn test_tensile_forces_tolerates_short_state_slice() {
        let bank = bank();
        let mut states = vec![MuscleState::new(0.5, 0.1, 0.3, 0.0)];
        bank.muscles[0].compute_initial_fiber_equilibrium(&mut states[0]).unwrap();

        let forces = bank.tensile_forces(&states);
        assert_eq!(forces.len(), 2);
        assert!(forces[0].is_finite());
        assert!(forces[1].is_nan());
    }

    #[test]
    fn test_state_count_mismatch_is_rejected() {
        let bank = bank();
        let mut short = vec![MuscleState::new(0.5, 0.1, 0.3, 0.0)];
        assert!(matches!(bank.initialize(&mut short), Err(MuscleError::InvalidConfig(_))));
        assert!(matches!(bank.equilibrate(&mut short, true), Err(MuscleError::InvalidConfig(_))));
        // Nothing was written
        assert_eq!(short[0].fiber_length, 0.1);

        let mut long = vec![MuscleState::new(0.5, 0.1, 0.3, 0.0); 3];
        assert!(matches!(bank.equilibrate(&mut long, false), Err(MuscleError::InvalidConfig(_))));
    }

    #[test]
    fn test_reset_clears_muscles() {
        let mut bank = bank();
        bank.reset();
        assert!(bank.is_empty());
    }
}
