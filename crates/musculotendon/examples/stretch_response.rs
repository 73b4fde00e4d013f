use musculotendon::{MuscleBank, MuscleConfig};
use simcore::{ActuatorModel, MuscleState, SimContext, SimState};
use std::fs::File;
use std::io::Write;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut bank = MuscleBank::default();
    bank.add_muscle(MuscleConfig::default().with_pennation_angle_at_optimal(0.2))?;

    let config = *bank.muscles[0].config();
    let rest_length = config.tendon_slack_length + config.optimal_fiber_length;

    let mut states = vec![MuscleState::new(0.5, config.optimal_fiber_length, rest_length, 0.0)];
    bank.initialize(&mut states)?;
    let mut bus = SimState::with_muscles(states);

    // Sim settings
    let dt = 1e-4;
    let t_end = 1.0;
    let stretch_start = 0.2;
    let stretch_speed = 0.05; // m/s
    let stretch_duration = 0.2;

    let mut csv = File::create("stretch_response.csv")?;
    writeln!(csv, "t,path_length,fiber_length,fiber_velocity,tendon_force,fiber_stiffness_at")?;

    let mut t = 0.0;
    while t <= t_end {
        let speed = if t >= stretch_start && t < stretch_start + stretch_duration {
            stretch_speed
        } else {
            0.0
        };
        bus.muscles[0].path_lengthening_speed = speed;
        bank.step_actuation(SimContext { dt, t }, &mut bus);

        let muscle = &bank.muscles[0];
        let state = bus.muscles[0];
        let output = bus.actuators[0];
        writeln!(
            csv,
            "{:.6},{:.6},{:.6},{:.6},{:.6},{:.3}",
            t, state.path_length, state.fiber_length, output.fiber_velocity, output.tensile_force, output.fiber_stiffness_along_tendon
        )?;

        // Explicit Euler on the path and the fiber-length state
        let fiber_velocity = muscle.fiber_length_derivative(&state)?;
        bus.muscles[0].fiber_length += fiber_velocity * dt;
        bus.muscles[0].path_length += speed * dt;

        t += dt;
    }

    println!("Wrote stretch_response.csv");
    Ok(())
}
