//! `kalman_core` — Kalman filtering and smoothing of discrete-time, linear,
//! time-varying state-space systems.
//!
//! State dimensions may vary per step and the evolution/observation blocks
//! may be rectangular or rank deficient. The flagship engine works entirely
//! through orthogonal (QR) transformations on concatenated weighted
//! least-squares blocks — no Riccati recursion and no covariance inverses on
//! the hot path — which keeps it stable on singular and ill-conditioned
//! problems.
//!
//! # Module layout
//! - [`types`]        — Matrix/vector aliases, step indices, [`Algorithm`]
//! - [`cov`]          — Covariance factors (tagged representations + weighing)
//! - `matrix`         — Dense kernel helpers over nalgebra's QR/LU/solves
//! - `log`            — Append-and-trim step log with a sliding index window
//! - `equations`      — Raw step equations + shared covariance-form recursion
//! - `ultimate`       — Sequential Paige–Saunders engine
//! - `conventional`   — Covariance-form filter + RTS smoother
//! - `associative`    — Associative-element smoother (two prefix scans)
//!
//! # Example
//! ```
//! use kalman_core::{Algorithm, CovarianceFactor, DMat, DVec, Kalman};
//!
//! let mut kalman = Kalman::new(Algorithm::Ultimate);
//! kalman.evolve(2, None, None, None, None); // first step: dimension only
//! let g = DMat::identity(2, 2);
//! let o = DVec::from_vec(vec![3.0, 4.0]);
//! let c = CovarianceFactor::Whitening(DMat::identity(2, 2) * 10.0);
//! kalman.observe(Some(&g), Some(&o), Some(&c));
//! assert!((kalman.estimate(0)[0] - 3.0).abs() < 1e-12);
//! ```

pub mod cov;
pub mod types;

mod associative;
mod conventional;
mod engine;
mod equations;
mod log;
mod matrix;
mod ultimate;

pub use cov::CovarianceFactor;
pub use types::{Algorithm, DMat, DVec, StepIndex};

use associative::AssociativeEngine;
use conventional::ConventionalEngine;
use engine::Engine;
use parscan::{Runtime, ScanSchedule};
use std::sync::Arc;
use ultimate::UltimateEngine;

/// A filter/smoother over one state-space system.
///
/// Drive it with alternating [`Kalman::evolve`] / [`Kalman::observe`] calls,
/// read estimates at any live step, and call [`Kalman::smooth`] for
/// full-information retrospective estimates. [`Kalman::rollback`] truncates
/// the tail (reopening the rolled-back step), [`Kalman::forget`] truncates
/// the head.
pub struct Kalman {
    engine: Box<dyn Engine>,
}

impl Kalman {
    /// Create a smoother using the given algorithm and a default parallel
    /// runtime.
    pub fn new(algorithm: Algorithm) -> Self {
        Self::with_runtime(algorithm, Arc::new(Runtime::default()))
    }

    /// Create a smoother whose batch passes run on `runtime`. The runtime is
    /// only consulted by the batch engines (`OddEven`, `Associative`).
    pub fn with_runtime(algorithm: Algorithm, runtime: Arc<Runtime>) -> Self {
        let engine: Box<dyn Engine> = match algorithm {
            Algorithm::Ultimate => Box::new(UltimateEngine::new()),
            Algorithm::Conventional => Box::new(ConventionalEngine::new()),
            Algorithm::OddEven => {
                Box::new(AssociativeEngine::new(runtime, ScanSchedule::OddEven))
            }
            Algorithm::Associative => {
                Box::new(AssociativeEngine::new(runtime, ScanSchedule::Blocked))
            }
        };
        Self { engine }
    }

    /// Logical index of the earliest live step, `-1` when empty.
    pub fn earliest(&self) -> StepIndex {
        self.engine.earliest()
    }

    /// Logical index of the latest live step, `-1` when empty.
    pub fn latest(&self) -> StepIndex {
        self.engine.latest()
    }

    /// Open the next step with state dimension `n_i`, absorbing the
    /// evolution `H·u_i = F·u_{i-1} + c + ε` with `Cov(ε)` given by `k`.
    ///
    /// On the very first step the equation arguments are ignored and may be
    /// `None` (there is no predecessor to evolve from). On later steps `f`,
    /// `c` and `k` are required; a missing `h` stands for the `[I | 0]`
    /// block that equates the leading state components.
    pub fn evolve(
        &mut self,
        n_i: usize,
        h: Option<&DMat>,
        f: Option<&DMat>,
        c: Option<&DVec>,
        k: Option<&CovarianceFactor>,
    ) {
        self.engine.evolve(n_i, h, f, c, k);
    }

    /// Seal the open step. With `o` present, absorbs the observation
    /// `o = G·u_i + δ` with `Cov(δ)` given by `c`; with all arguments
    /// `None`, records a step without observations.
    pub fn observe(
        &mut self,
        g: Option<&DMat>,
        o: Option<&DVec>,
        c: Option<&CovarianceFactor>,
    ) {
        self.engine.observe(g, o, c);
    }

    /// The estimate of the state of `step` (`-1` ⇒ latest): filtered after
    /// `observe`, smoothed after `smooth`. NaN entries mark underdetermined
    /// or out-of-window steps.
    pub fn estimate(&self, step: StepIndex) -> DVec {
        self.engine.estimate(step)
    }

    /// The covariance of the estimate of `step`, as a tagged factor (see
    /// [`Kalman::covariance_type`]).
    pub fn covariance(&self, step: StepIndex) -> CovarianceFactor {
        self.engine.covariance(step)
    }

    /// Representation tag of the factors returned by [`Kalman::covariance`].
    pub fn covariance_type(&self, step: StepIndex) -> char {
        self.engine.covariance_type(step)
    }

    /// Replace all live estimates with smoothed (full-information) ones.
    pub fn smooth(&mut self) {
        self.engine.smooth();
    }

    /// Drop all steps after `step`, then reopen `step` as if its `observe`
    /// had not yet happened. Out-of-window indices are no-ops.
    pub fn rollback(&mut self, step: StepIndex) {
        self.engine.rollback(step);
    }

    /// Drop all steps up to and including `step` (`-1` ⇒ all but the
    /// latest). The latest step is never dropped.
    pub fn forget(&mut self, step: StepIndex) {
        self.engine.forget(step);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
