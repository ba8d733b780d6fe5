//! The reference rotation scenario: a unit vector rotating by 2π/16 per
//! step, observed through the identity, with pre-drawn Gaussian deviates so
//! every run (and every implementation) sees the same trajectory.
//!
//! The deviate tables were generated by MATLAB with
//! `rng(5); for j=2:16; evolErrs(1:2,j-1) = randn(2,1); end;
//! for j=1:16; obsErrs(1:2,j) = randn(2,1); end`.

use kalman_core::{CovarianceFactor, DMat, DVec};

pub const STEPS: usize = 16;
pub const STATE_DIM: usize = 2;
pub const EVOLUTION_STD: f64 = 1e-3;
pub const OBSERVATION_STD: f64 = 1e-1;

#[rustfmt::skip]
const EVOL_ERRS_ROWWISE: [f64; 30] = [
    -0.343003152130103, -0.766711794483284, -0.016814112314737,  0.684339759945504, -1.401783282955619,
    -1.521660304521858, -0.127785244107286,  0.602860572524585, -0.139677982915557,  0.407768714902350,
     0.397539533883833, -0.317539749169638, -0.779285825610984, -1.935513755513929,  0.678730596165904,
     1.666349045016822,  2.635481573310387,  0.304155468427342,  0.055808274805755, -1.360112379179931,
     1.054743814037827, -1.410338023439304, -0.456929290517258, -0.983310072206319,  0.242994841538368,
    -0.175692485792199, -1.101615186229668, -1.762205119649466,  1.526915548584107, -2.277161011565906,
];

#[rustfmt::skip]
const OBS_ERRS_ROWWISE: [f64; 32] = [
    -1.428567988496096,  0.913205695955837, -1.576872295738796, -1.888336147279610,  1.116853507009928,
     1.615888145666843, -0.102585012191329, -0.192732954692481,  0.160906008337421, -0.024849020282298,
    -1.001561909251739, -0.314462113181954,  0.276865687293751,  0.175430340572582,  0.746792737753047,
     1.648965874319728,
    -1.114618464565160,  0.976371425014641,  0.204080086636545,  0.736193913185726,  0.743379272133998,
    -1.666530392059792,  0.622727541956653,  0.794595441386172,  0.539084689771962, -2.548385761079745,
    -1.161623730001803,  1.066876935479899,  1.748562141782206,  0.362976707912966,  0.842263598054067,
     1.725578381396231,
];

/// The reference scenario: system matrices, noise factors, ground-truth
/// states and the observations fed to the smoothers.
#[derive(Clone, Debug)]
pub struct RotationScenario {
    pub f: DMat,
    pub h: DMat,
    pub g: DMat,
    /// Evolution noise as a whitening factor (`diag(1/σ_evol)`, tag `'W'`).
    pub evolution_noise: CovarianceFactor,
    /// Observation noise as a whitening factor (`diag(1/σ_obs)`, tag `'W'`).
    pub observation_noise: CovarianceFactor,
    pub states: Vec<DVec>,
    pub observations: Vec<DVec>,
}

impl RotationScenario {
    /// Build the scenario with the shipped deviates; 16 steps, state₀ =
    /// (1, 0)ᵀ.
    pub fn reference() -> Self {
        let alpha = 2.0 * std::f64::consts::PI / STEPS as f64;
        let f = DMat::from_row_slice(
            2,
            2,
            &[alpha.cos(), -alpha.sin(), alpha.sin(), alpha.cos()],
        );
        let h = DMat::identity(2, 2);
        let g = DMat::identity(2, 2);

        let evol_errs = DMat::from_row_slice(2, STEPS - 1, &EVOL_ERRS_ROWWISE);
        let obs_errs = DMat::from_row_slice(2, STEPS, &OBS_ERRS_ROWWISE);

        let mut states = Vec::with_capacity(STEPS);
        states.push(DVec::from_vec(vec![1.0, 0.0]));
        for i in 1..STEPS {
            let state =
                &f * &states[i - 1] + EVOLUTION_STD * evol_errs.column(i - 1).into_owned();
            states.push(state);
        }

        let observations = (0..STEPS)
            .map(|i| &g * &states[i] + OBSERVATION_STD * obs_errs.column(i).into_owned())
            .collect();

        Self {
            f,
            h,
            g,
            evolution_noise: CovarianceFactor::Whitening(
                DMat::identity(2, 2) * (1.0 / EVOLUTION_STD),
            ),
            observation_noise: CovarianceFactor::Whitening(
                DMat::identity(2, 2) * (1.0 / OBSERVATION_STD),
            ),
            states,
            observations,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
