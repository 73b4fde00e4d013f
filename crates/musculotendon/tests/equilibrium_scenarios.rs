use approx::assert_relative_eq;
use musculotendon::{
    DampedMuscle, EquilibriumInputs, EquilibriumMode, EquilibriumSolverConfig, ForceVelocityCurve, MuscleConfig,
    MuscleCurve, MuscleError, SolveStatus,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use simcore::MuscleState;

fn reference_muscle() -> DampedMuscle {
    // fiso = 1000 N, lopt = 0.1 m, tsl = 0.2 m, parallel fibers
    DampedMuscle::new(MuscleConfig::default()).unwrap()
}

#[test]
fn test_isometric_reference_scenario() {
    let muscle = reference_muscle();
    let mut state = MuscleState::new(1.0, 0.1, 0.3, 0.0);
    let status = muscle.compute_initial_fiber_equilibrium(&mut state).unwrap();
    assert!(status.is_converged(), "{:?}", status);

    let report = status.report();
    assert_eq!(report.state.fiber_velocity, 0.0);
    assert_eq!(report.state.pennation_angle, 0.0);
    assert!(report.solution_error < 1e-8);

    let length = muscle.length_info(&state).unwrap();
    assert!(length.active_force_length > 0.95);
    // Tendon carries the isometric fiber force: fiso * a * fal * fv(0) plus passive
    let expected = 1000.0 * length.active_force_length + 1000.0 * length.passive_force_length;
    assert_relative_eq!(report.state.tendon_force, expected, max_relative = 1e-6);
    assert_relative_eq!(muscle.compute_actuation(&state).unwrap(), expected, max_relative = 1e-6);
}

#[test]
fn test_minimum_activation_stays_finite() {
    let muscle = reference_muscle();
    for damping in [0.0, 0.1] {
        let muscle_with_damping = DampedMuscle::new(MuscleConfig::default().with_fiber_damping(damping)).unwrap();
        for muscle in [&muscle, &muscle_with_damping] {
            let mut state = MuscleState::new(0.01, 0.1, 0.3, 0.0);
            let status = muscle.compute_fiber_equilibrium(&mut state, true).unwrap();
            assert!(status.is_converged() || status.is_clamped(), "{:?}", status);

            let info = muscle.dynamics_info(&state).unwrap();
            assert!(state.fiber_length.is_finite());
            assert!(info.tendon_force.is_finite());
            assert!(info.fiber_stiffness_along_tendon.is_finite());
            assert!(muscle.fiber_velocity(&state).unwrap().is_finite());
        }
    }
}

#[test]
fn test_activation_below_minimum_is_raised() {
    let muscle = reference_muscle();
    let mut zero = MuscleState::new(0.0, 0.1, 0.3, 0.0);
    let mut minimum = MuscleState::new(0.01, 0.1, 0.3, 0.0);
    muscle.compute_initial_fiber_equilibrium(&mut zero).unwrap();
    muscle.compute_initial_fiber_equilibrium(&mut minimum).unwrap();
    assert_eq!(zero.fiber_length, minimum.fiber_length);
}

#[test]
fn test_short_path_clamps_exactly_at_minimum() {
    let muscle = reference_muscle();

    let mut slack = MuscleState::new(1.0, 0.1, 0.2, 0.0);
    let status = muscle.compute_initial_fiber_equilibrium(&mut slack).unwrap();
    assert!(matches!(status, SolveStatus::ClampedAtLowerBound(_)), "{:?}", status);
    assert_eq!(slack.fiber_length, muscle.minimum_fiber_length());

    // Newton walks down from a long fiber and lands on the bound
    let mut walking = MuscleState::new(1.0, 0.1, 0.24, 0.0);
    let status = muscle.compute_fiber_equilibrium(&mut walking, false).unwrap();
    assert!(status.is_clamped(), "{:?}", status);
    assert_eq!(walking.fiber_length, muscle.minimum_fiber_length());
    assert!(status.report().iterations > 0);
}

#[test]
fn test_clamped_fiber_may_lengthen() {
    let muscle = reference_muscle();
    let mut state = MuscleState::new(1.0, 0.1, 0.2, 0.3);
    let status = muscle.compute_fiber_equilibrium(&mut state, true).unwrap();
    assert!(status.is_clamped());
    assert!(status.state().fiber_velocity >= 0.0);
}

#[test]
fn test_equilibration_is_idempotent() {
    let muscle = DampedMuscle::new(MuscleConfig::default().with_pennation_angle_at_optimal(0.35)).unwrap();
    for solve_for_velocity in [false, true] {
        let mut state = MuscleState::new(0.6, 0.1, 0.305, 0.08);
        let first = muscle.compute_fiber_equilibrium(&mut state, solve_for_velocity).unwrap();
        let second = muscle.compute_fiber_equilibrium(&mut state, solve_for_velocity).unwrap();

        assert_eq!(second.report().iterations, 0);
        assert_relative_eq!(second.state().fiber_length, first.state().fiber_length, epsilon = 1e-12);
        assert_relative_eq!(second.state().fiber_velocity, first.state().fiber_velocity, epsilon = 1e-9);
    }
}

#[test]
fn test_fiber_velocity_increases_with_path_speed() {
    let muscle = DampedMuscle::new(MuscleConfig::default().with_pennation_angle_at_optimal(0.2)).unwrap();
    let mut base = MuscleState::new(0.5, 0.1, 0.3, 0.0);
    muscle.compute_initial_fiber_equilibrium(&mut base).unwrap();

    let mut previous = f64::NEG_INFINITY;
    for i in -10..=10 {
        let mut state = base;
        state.path_lengthening_speed = 0.02 * i as f64;
        let status = muscle.compute_fiber_equilibrium(&mut state, true).unwrap();
        let velocity = status.state().fiber_velocity;
        assert!(
            velocity >= previous - 1e-9,
            "fiber velocity fell from {} to {} at path speed {}",
            previous,
            velocity,
            state.path_lengthening_speed
        );
        assert!(velocity.signum() == state.path_lengthening_speed.signum() || velocity.abs() < 1e-6);
        previous = velocity;
    }
}

#[test]
fn test_damping_slows_the_fiber() {
    let undamped = DampedMuscle::new(MuscleConfig::default().with_fiber_damping(0.0)).unwrap();
    let damped = DampedMuscle::new(MuscleConfig::default().with_fiber_damping(0.1)).unwrap();

    // Same fiber length and path: same tendon force target, once lengthening, once shortening
    for path_length in [0.302, 0.298] {
        let state = MuscleState::new(1.0, 0.0865, path_length, 0.1);
        let free = undamped.velocity_info(&state).unwrap();
        let resisted = damped.velocity_info(&state).unwrap();
        assert!(free.converged && resisted.converged);
        assert!(!free.fiber_velocity_clamped);
        assert!(resisted.fiber_velocity.abs() < free.fiber_velocity.abs());
        assert_eq!(resisted.fiber_velocity.signum(), free.fiber_velocity.signum());
        assert_relative_eq!(
            undamped.tendon_force_multiplier(&state).unwrap(),
            damped.tendon_force_multiplier(&state).unwrap()
        );
    }
}

#[test]
fn test_iteration_cap_raises_cannot_equilibrate() {
    let config = MuscleConfig::default().with_equilibrium(EquilibriumSolverConfig::default().with_max_iterations(1));
    let muscle = DampedMuscle::new(config).unwrap();
    let mut state = MuscleState::new(1.0, 0.16, 0.3, 0.0);
    let err = muscle.compute_fiber_equilibrium(&mut state, false).unwrap_err();
    match err {
        MuscleError::CannotEquilibrate {
            iterations,
            solution_error,
            fiber_length,
        } => {
            assert_eq!(iterations, 1);
            assert!(solution_error > 1e-8);
            assert!(fiber_length.is_finite());
        }
        other => panic!("unexpected error {:?}", other),
    }
    // State is left as it was
    assert_eq!(state.fiber_length, 0.16);
}

#[test]
fn test_clamp_reached_on_last_iteration_updates_state() {
    let config = MuscleConfig::default().with_equilibrium(EquilibriumSolverConfig::default().with_max_iterations(1));
    let muscle = DampedMuscle::new(config).unwrap();
    let mut state = MuscleState::new(1.0, 0.06, 0.2, 0.0);
    let status = muscle.compute_fiber_equilibrium(&mut state, false).unwrap();
    assert!(status.is_clamped(), "{:?}", status);
    assert_eq!(state.fiber_length, muscle.minimum_fiber_length());
}

#[test]
fn test_degenerate_tendon_curve_rejected_from_json() {
    let json = r#"{ "curves": { "tendon_force_length": { "linear_strain": 0.0 } } }"#;
    let config: MuscleConfig = serde_json::from_str(json).unwrap();
    let err = DampedMuscle::new(config).unwrap_err();
    assert!(matches!(err, MuscleError::InvalidCurve(_)), "{:?}", err);
}

#[test]
fn test_random_states_respect_invariants() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..200 {
        let pennation = rng.gen_range(0.0..0.5);
        let config = MuscleConfig::default()
            .with_pennation_angle_at_optimal(pennation)
            .with_fiber_damping(if rng.gen_bool(0.5) { 0.0 } else { 0.1 });
        let muscle = DampedMuscle::new(config).unwrap();

        let inputs = EquilibriumInputs {
            activation: rng.gen_range(0.01..=1.0),
            path_length: rng.gen_range(0.26..0.34),
            path_lengthening_speed: rng.gen_range(-0.3..0.3),
            damping: config.fiber_damping,
            mode: EquilibriumMode::Dynamic,
            initial_fiber_length: None,
        };
        let status = muscle.estimator().estimate(&inputs).unwrap();
        let report = status.report();

        assert!(status.is_usable(), "{:?} for {:?}", status, inputs);
        assert!(report.state.fiber_length >= muscle.minimum_fiber_length());
        assert!(report.state.fiber_velocity.is_finite());
        assert!(report.state.tendon_force.is_finite());
        assert!(report.state.pennation_angle <= config.maximum_pennation_angle);
        match status {
            SolveStatus::Converged(r) => assert!(r.solution_error < config.equilibrium.tolerance),
            SolveStatus::ClampedAtLowerBound(r) => {
                assert_eq!(r.state.fiber_length, muscle.minimum_fiber_length());
                assert!(r.state.fiber_velocity >= 0.0);
            }
            SolveStatus::MaxIterationsReached(_) => unreachable!(),
        }
    }
}

#[test]
fn test_rigid_tendon_matches_path_geometry() {
    let muscle = DampedMuscle::new(
        MuscleConfig::default()
            .with_ignore_tendon_compliance(true)
            .with_pennation_angle_at_optimal(0.3),
    )
    .unwrap();
    let mut state = MuscleState::new(0.7, 0.0, 0.29, -0.05);
    let status = muscle.compute_fiber_equilibrium(&mut state, true).unwrap();
    assert_eq!(status.report().iterations, 0);

    let length = muscle.length_info(&state).unwrap();
    assert_relative_eq!(length.fiber_length_along_tendon, 0.09, epsilon = 1e-12);
    assert_relative_eq!(length.tendon_length, 0.2);

    let velocity = muscle.velocity_info(&state).unwrap();
    assert_relative_eq!(velocity.fiber_velocity_along_tendon, -0.05, epsilon = 1e-12);
    assert_relative_eq!(velocity.tendon_velocity, 0.0, epsilon = 1e-12);
}

#[test]
fn test_config_round_trips_through_json() {
    let json = r#"{
        "max_isometric_force": 2500.0,
        "optimal_fiber_length": 0.06,
        "tendon_slack_length": 0.25,
        "pennation_angle_at_optimal": 0.2,
        "fiber_damping": 0.0,
        "curves": { "force_velocity": { "eccentric_force_max": 1.6 } },
        "equilibrium": { "tolerance": 1e-9 }
    }"#;
    let config: MuscleConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.max_isometric_force, 2500.0);
    assert_eq!(config.curves.force_velocity.eccentric_force_max, 1.6);
    assert_eq!(config.curves.force_velocity.concentric_curvature, 0.25);
    assert_eq!(config.equilibrium.tolerance, 1e-9);
    assert_eq!(config.equilibrium.max_iterations, 200);
    assert_eq!(config.minimum_activation, 0.01);

    let muscle = DampedMuscle::new(config).unwrap();
    assert!(muscle.curves().force_velocity.max_multiplier() > ForceVelocityCurve::default().max_multiplier());
    assert_relative_eq!(muscle.force_velocity_inverse().max_multiplier(), muscle.curves().force_velocity.evaluate(1.0));

    let back: MuscleConfig = serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
    assert_eq!(back, config);
}
