use serde::{Deserialize, Serialize};

// Musculotendon state supplied by the host dynamics engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MuscleState {
    pub activation: f64,
    pub fiber_length: f64,
    pub path_length: f64,
    pub path_lengthening_speed: f64,
}

impl MuscleState {
    pub fn new(activation: f64, fiber_length: f64, path_length: f64, path_lengthening_speed: f64) -> Self {
        MuscleState {
            activation,
            fiber_length,
            path_length,
            path_lengthening_speed,
        }
    }
}

// Quantities handed back to the host after an actuation query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActuatorOutput {
    pub tensile_force: f64,
    pub fiber_velocity: f64,
    pub fiber_stiffness_along_tendon: f64,
}

impl Default for ActuatorOutput {
    fn default() -> Self {
        ActuatorOutput {
            tensile_force: 0.0,
            fiber_velocity: 0.0,
            fiber_stiffness_along_tendon: 0.0,
        }
    }
}

#[derive(Debug, Default)]
pub struct SimState {
    pub muscles: Vec<MuscleState>,
    pub actuators: Vec<ActuatorOutput>,
}

impl SimState {
    pub fn with_muscles(muscles: Vec<MuscleState>) -> Self {
        let actuators = vec![ActuatorOutput::default(); muscles.len()];
        SimState { muscles, actuators }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SimContext {
    pub dt: f64,
    pub t: f64,
}

pub trait Model {
    fn reset(&mut self);
}

pub trait ActuatorModel: Model {
    fn step_actuation(&mut self, ctx: SimContext, state: &mut SimState);
}
