//! Seeded random linear Gaussian scenarios.
//!
//! Mirrors the shape of the reference rotation scenario but with freshly
//! drawn deviates from a ChaCha8 stream, so equivalence tests and benches
//! can sweep dimensions and lengths while staying reproducible per seed.

use kalman_core::{CovarianceFactor, DMat, DVec};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Configuration of a generated scenario.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinearScenarioConfig {
    /// State (and observation) dimension.
    pub dim: usize,
    /// Number of steps.
    pub steps: usize,
    /// Per-step rotation angle of the block-diagonal evolution.
    pub angle: f64,
    pub evolution_std: f64,
    pub observation_std: f64,
    pub seed: u64,
}

impl Default for LinearScenarioConfig {
    fn default() -> Self {
        Self {
            dim: 2,
            steps: 32,
            angle: 2.0 * std::f64::consts::PI / 16.0,
            evolution_std: 1e-3,
            observation_std: 1e-1,
            seed: 42,
        }
    }
}

/// A generated scenario: system matrices, noise factors, ground truth and
/// observations.
#[derive(Clone, Debug)]
pub struct LinearScenario {
    pub config: LinearScenarioConfig,
    pub f: DMat,
    pub h: DMat,
    pub g: DMat,
    pub evolution_noise: CovarianceFactor,
    pub observation_noise: CovarianceFactor,
    pub states: Vec<DVec>,
    pub observations: Vec<DVec>,
}

impl LinearScenario {
    pub fn generate(config: LinearScenarioConfig) -> Self {
        let n = config.dim;
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);

        // Block-diagonal rotation; an odd trailing dimension keeps an
        // identity row.
        let mut f = DMat::identity(n, n);
        let (s, c) = config.angle.sin_cos();
        for b in 0..n / 2 {
            let i = 2 * b;
            f[(i, i)] = c;
            f[(i, i + 1)] = -s;
            f[(i + 1, i)] = s;
            f[(i + 1, i + 1)] = c;
        }
        let h = DMat::identity(n, n);
        let g = DMat::identity(n, n);

        let mut states = Vec::with_capacity(config.steps);
        let first = DVec::from_fn(n, |i, _| if i == 0 { 1.0 } else { 0.0 });
        states.push(first);
        for i in 1..config.steps {
            let noise = gaussian_vector(&mut rng, n) * config.evolution_std;
            states.push(&f * &states[i - 1] + noise);
        }

        let observations = states
            .iter()
            .map(|state| &g * state + gaussian_vector(&mut rng, n) * config.observation_std)
            .collect();

        Self {
            f,
            h,
            g,
            evolution_noise: CovarianceFactor::Whitening(
                DMat::identity(n, n) * (1.0 / config.evolution_std),
            ),
            observation_noise: CovarianceFactor::Whitening(
                DMat::identity(n, n) * (1.0 / config.observation_std),
            ),
            states,
            observations,
            config,
        }
    }
}

/// Standard normal draws via Box–Muller on the uniform stream.
fn gaussian_vector(rng: &mut ChaCha8Rng, n: usize) -> DVec {
    DVec::from_fn(n, |_, _| {
        let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
        let u2: f64 = rng.gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
