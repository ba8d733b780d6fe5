//! The capability set every smoother/filter variant implements.
//!
//! The public [`crate::Kalman`] front-end dispatches through this trait; the
//! variants differ in how they store per-step information and in how
//! `smooth` traverses it, not in the call surface.

use crate::cov::CovarianceFactor;
use crate::types::{DMat, DVec, StepIndex};

pub(crate) trait Engine: Send {
    /// Logical index of the earliest live step, `-1` when empty.
    fn earliest(&self) -> StepIndex;

    /// Logical index of the latest live step, `-1` when empty.
    fn latest(&self) -> StepIndex;

    /// Open step `i` with state dimension `n_i` and, from step 1 on, absorb
    /// the evolution `H·u_i = F·u_{i-1} + c + ε` with `Cov(ε)` given by `k`.
    /// All equation arguments may be absent on the first step only; a
    /// missing `H` stands for the `[I | 0]` block.
    fn evolve(
        &mut self,
        n_i: usize,
        h: Option<&DMat>,
        f: Option<&DMat>,
        c: Option<&DVec>,
        k: Option<&CovarianceFactor>,
    );

    /// Seal the open step, absorbing the observation `o = G·u_i + δ` with
    /// `Cov(δ)` given by `c`. All-`None` arguments record a step without
    /// observations.
    fn observe(&mut self, g: Option<&DMat>, o: Option<&DVec>, c: Option<&CovarianceFactor>);

    /// The current estimate of the state of `step` (`-1` ⇒ latest). NaN
    /// entries mark an underdetermined or out-of-window step.
    fn estimate(&self, step: StepIndex) -> DVec;

    /// The covariance of the estimate of `step`, in the representation
    /// reported by [`Engine::covariance_type`].
    fn covariance(&self, step: StepIndex) -> CovarianceFactor;

    fn covariance_type(&self, step: StepIndex) -> char;

    /// Replace all live estimates by smoothed ones (all observations
    /// through `latest`).
    fn smooth(&mut self);

    /// Drop steps after `step` and reopen `step` as if its `observe` had
    /// not yet happened. Out-of-window indices are ignored.
    fn rollback(&mut self, step: StepIndex);

    /// Drop steps up to and including `step` (`-1` ⇒ all but the latest).
    /// The latest step is never dropped.
    fn forget(&mut self, step: StepIndex);
}
