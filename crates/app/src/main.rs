use log::{info, warn, LevelFilter};
use musculotendon::{DampedMuscle, MuscleConfig, MuscleDynamicsInfo, MusclePotentialEnergyInfo, SolveStatus};
use serde::Serialize;
use simcore::MuscleState;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use std::fs;

#[derive(Serialize)]
struct SweepPoint {
    activation: f64,
    path_length: f64,
    path_lengthening_speed: f64,
    status: SolveStatus,
    dynamics: MuscleDynamicsInfo,
    energy: MusclePotentialEnergyInfo,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    TermLogger::init(LevelFilter::Info, Config::default(), TerminalMode::Mixed, ColorChoice::Auto)?;

    // Optional muscle config as JSON; defaults otherwise
    let config: MuscleConfig = match std::env::args().nth(1) {
        Some(path) => serde_json::from_str(&fs::read_to_string(&path)?)?,
        None => MuscleConfig::default(),
    };
    let muscle = DampedMuscle::new(config)?;
    let slack = config.tendon_slack_length;
    let optimal = config.optimal_fiber_length;

    let activations = [config.minimum_activation, 0.25, 0.5, 1.0];
    let path_lengths = [0.8, 0.9, 1.0, 1.1, 1.2].map(|k| slack + k * optimal);
    let path_speed = 0.5 * optimal;

    info!(
        "{:>6} {:>8} {:>9} {:>10} {:>10} {:>11} {:>5}",
        "a", "lmt [m]", "lce [m]", "vce [m/s]", "Ft [N]", "Kmt [N/m]", "iter"
    );

    let mut points = Vec::new();
    for &activation in &activations {
        for &path_length in &path_lengths {
            let mut state = MuscleState::new(activation, optimal, path_length, path_speed);
            if let Err(e) = muscle.compute_initial_fiber_equilibrium(&mut state) {
                warn!("a = {}, lmt = {}: {}", activation, path_length, e);
                continue;
            }
            let status = match muscle.compute_fiber_equilibrium(&mut state, true) {
                Ok(status) => status,
                Err(e) => {
                    warn!("a = {}, lmt = {}: {}", activation, path_length, e);
                    continue;
                }
            };
            let dynamics = muscle.dynamics_info(&state)?;
            let velocity = muscle.fiber_velocity(&state)?;
            let energy = muscle.potential_energy_info(&state)?;

            info!(
                "{:>6.3} {:>8.4} {:>9.5} {:>10.5} {:>10.3} {:>11.1} {:>5}{}",
                activation,
                path_length,
                state.fiber_length,
                velocity,
                dynamics.tendon_force,
                dynamics.musculotendon_stiffness,
                status.report().iterations,
                if status.is_clamped() { " (clamped)" } else { "" }
            );

            points.push(SweepPoint {
                activation,
                path_length,
                path_lengthening_speed: path_speed,
                status,
                dynamics,
                energy,
            });
        }
    }

    println!("{}", serde_json::to_string_pretty(&points)?);
    Ok(())
}
