//! Cross-algorithm equivalence on the reference rotation scenario.
//!
//! All four algorithms are driven through the same sequence the CLI uses —
//! prediction from the first observation, rollback to step 1, filtering,
//! smoothing — and must agree on every trajectory.

use approx::assert_relative_eq;
use kalman_core::{Algorithm, DVec, Kalman};
use parscan::{Runtime, RuntimeConfig};
use sim::rotation::{RotationScenario, STEPS};
use std::sync::Arc;

struct Trajectories {
    predicted: Vec<DVec>,
    filtered: Vec<DVec>,
    smoothed: Vec<DVec>,
    smoothed_cov: Vec<Vec<f64>>,
}

/// Replays the CLI's drive sequence for one algorithm.
fn run(algorithm: Algorithm, runtime: Arc<Runtime>) -> Trajectories {
    let scenario = RotationScenario::reference();
    let zero = DVec::zeros(2);
    let mut kalman = Kalman::with_runtime(algorithm, runtime);

    let mut predicted = Vec::with_capacity(STEPS);
    kalman.evolve(2, None, None, None, None);
    kalman.observe(
        Some(&scenario.g),
        Some(&scenario.observations[0]),
        Some(&scenario.observation_noise),
    );
    predicted.push(kalman.estimate(0));
    for i in 1..STEPS {
        kalman.evolve(
            2,
            Some(&scenario.h),
            Some(&scenario.f),
            Some(&zero),
            Some(&scenario.evolution_noise),
        );
        kalman.observe(None, None, None);
        predicted.push(kalman.estimate(i as i64));
    }

    kalman.rollback(1);
    kalman.observe(
        Some(&scenario.g),
        Some(&scenario.observations[1]),
        Some(&scenario.observation_noise),
    );
    let mut filtered = Vec::with_capacity(STEPS);
    filtered.push(kalman.estimate(0));
    filtered.push(kalman.estimate(1));
    for i in 2..STEPS {
        kalman.evolve(
            2,
            Some(&scenario.h),
            Some(&scenario.f),
            Some(&zero),
            Some(&scenario.evolution_noise),
        );
        kalman.observe(
            Some(&scenario.g),
            Some(&scenario.observations[i]),
            Some(&scenario.observation_noise),
        );
        filtered.push(kalman.estimate(i as i64));
    }

    kalman.smooth();
    let smoothed = (0..STEPS).map(|i| kalman.estimate(i as i64)).collect();
    let cov0 = kalman.covariance(0).explicit();
    let smoothed_cov = (0..cov0.nrows())
        .map(|r| (0..cov0.ncols()).map(|c| cov0[(r, c)]).collect())
        .collect();

    Trajectories {
        predicted,
        filtered,
        smoothed,
        smoothed_cov,
    }
}

fn assert_trajectories_match(a: &[DVec], b: &[DVec], what: &str) {
    assert_eq!(a.len(), b.len(), "{what}: trajectory lengths differ");
    for (va, vb) in a.iter().zip(b) {
        for r in 0..va.len() {
            assert_relative_eq!(va[r], vb[r], epsilon = 1e-9, max_relative = 1e-9);
        }
    }
}

#[test]
fn all_algorithms_agree_on_the_reference_scenario() {
    let runtime = Arc::new(Runtime::new(RuntimeConfig {
        nthreads: Some(2),
        blocksize: 4,
    }));
    let reference = run(Algorithm::Ultimate, runtime.clone());
    for algorithm in [
        Algorithm::Conventional,
        Algorithm::OddEven,
        Algorithm::Associative,
    ] {
        let other = run(algorithm, runtime.clone());
        assert_trajectories_match(&reference.predicted, &other.predicted, "predicted");
        assert_trajectories_match(&reference.filtered, &other.filtered, "filtered");
        assert_trajectories_match(&reference.smoothed, &other.smoothed, "smoothed");
        for (ra, rb) in reference.smoothed_cov.iter().zip(&other.smoothed_cov) {
            for (ca, cb) in ra.iter().zip(rb) {
                assert_relative_eq!(*ca, *cb, epsilon = 1e-9, max_relative = 1e-6);
            }
        }
    }
}

#[test]
fn predictions_follow_the_rotation() {
    let runtime = Arc::new(Runtime::serial());
    let scenario = RotationScenario::reference();
    let out = run(Algorithm::Ultimate, runtime);

    // The prediction phase sees only the first observation; every later
    // estimate is the rotated first observation.
    let mut expected = scenario.observations[0].clone();
    assert_relative_eq!(out.predicted[0][0], expected[0], epsilon = 1e-12);
    for i in 1..STEPS {
        expected = &scenario.f * expected;
        assert_relative_eq!(out.predicted[i][0], expected[0], epsilon = 1e-9);
        assert_relative_eq!(out.predicted[i][1], expected[1], epsilon = 1e-9);
    }
}

#[test]
fn smoothing_beats_filtering_against_ground_truth() {
    let runtime = Arc::new(Runtime::serial());
    let scenario = RotationScenario::reference();
    let out = run(Algorithm::Ultimate, runtime);

    let rmse = |estimates: &[DVec]| -> f64 {
        estimates
            .iter()
            .zip(&scenario.states)
            .map(|(e, t)| (e - t).norm_squared())
            .sum::<f64>()
            .sqrt()
    };
    assert!(rmse(&out.smoothed) < rmse(&out.filtered));
}

#[test]
fn smoothing_twice_changes_nothing() {
    let runtime = Arc::new(Runtime::serial());
    let scenario = RotationScenario::reference();
    let zero = DVec::zeros(2);
    let mut kalman = Kalman::with_runtime(Algorithm::Ultimate, runtime);

    kalman.evolve(2, None, None, None, None);
    kalman.observe(
        Some(&scenario.g),
        Some(&scenario.observations[0]),
        Some(&scenario.observation_noise),
    );
    for i in 1..STEPS {
        kalman.evolve(
            2,
            Some(&scenario.h),
            Some(&scenario.f),
            Some(&zero),
            Some(&scenario.evolution_noise),
        );
        kalman.observe(
            Some(&scenario.g),
            Some(&scenario.observations[i]),
            Some(&scenario.observation_noise),
        );
    }
    kalman.smooth();
    let first: Vec<DVec> = (0..STEPS).map(|i| kalman.estimate(i as i64)).collect();
    kalman.smooth();
    for (i, state) in first.iter().enumerate() {
        assert_eq!(&kalman.estimate(i as i64), state);
    }
}
