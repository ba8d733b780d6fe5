//! Conventional engine: covariance-form Kalman filter with a
//! Rauch–Tung–Striebel backward smoother.
//!
//! The evolution is folded through `H⁻¹` (`F̂ = H⁻¹F`, `ĉ = H⁻¹c`,
//! `Q̂ = H⁻¹·K·H⁻ᵀ`); each step stores `F̂`, the predicted pair `(m⁻, P⁻)`
//! and the filtered pair `(m, P)`, and `smooth` runs the classical backward
//! recursion `G = P·F̂ᵀ·(P⁻)⁻¹`. Mathematically equivalent to the orthogonal engine on
//! well-conditioned problems; it inverts covariances, so it is the baseline
//! the QR formulation is measured against, not a replacement for it.

use crate::cov::CovarianceFactor;
use crate::engine::Engine;
use crate::equations::{fold_h, initial_belief, predict_belief, update_belief, Belief};
use crate::log::StepLog;
use crate::matrix::{nan_matrix, nan_vector};
use crate::types::{DMat, DVec, StepIndex};
use tracing::warn;

#[derive(Debug, Default)]
struct Step {
    index: StepIndex,
    dimension: usize,
    /// H-folded evolution matrix into this step (absent on the head step);
    /// the backward pass needs it for the smoother gain.
    f: Option<DMat>,
    predicted: Option<Belief>,
    filtered: Option<Belief>,
    smoothed: Option<Belief>,
}

impl Step {
    fn best(&self) -> Option<&Belief> {
        self.smoothed.as_ref().or(self.filtered.as_ref())
    }
}

#[derive(Debug, Default)]
pub(crate) struct ConventionalEngine {
    steps: StepLog<Step>,
    current: Option<Step>,
}

impl ConventionalEngine {
    pub fn new() -> Self {
        Self {
            steps: StepLog::new(),
            current: None,
        }
    }

    fn nearest_dimension(&self, si: StepIndex) -> usize {
        let probe = if si < self.earliest() {
            self.steps.first()
        } else {
            self.steps.last()
        };
        probe.map_or(0, |s| s.dimension)
    }
}

impl Engine for ConventionalEngine {
    fn earliest(&self) -> StepIndex {
        self.steps.first_index().unwrap_or(-1)
    }

    fn latest(&self) -> StepIndex {
        self.steps.last_index().unwrap_or(-1)
    }

    fn evolve(
        &mut self,
        n_i: usize,
        h: Option<&DMat>,
        f: Option<&DMat>,
        c: Option<&DVec>,
        k: Option<&CovarianceFactor>,
    ) {
        if self.steps.is_empty() {
            self.current = Some(Step {
                index: 0,
                dimension: n_i,
                ..Step::default()
            });
            return;
        }
        let prev = self.steps.last().expect("non-empty log");
        let mut cur = Step {
            index: prev.index + 1,
            dimension: n_i,
            ..Step::default()
        };

        let f = f.expect("evolve after the first step requires F");
        let c = c.expect("evolve after the first step requires c");
        let k = k.expect("evolve after the first step requires an evolution covariance");

        let (ff, fc, fq) = fold_h(h, f, c, &k.explicit());
        cur.predicted = prev
            .filtered
            .as_ref()
            .map(|b| predict_belief(b, &ff, &fc, &fq));
        cur.f = Some(ff);

        self.current = Some(cur);
    }

    fn observe(&mut self, g: Option<&DMat>, o: Option<&DVec>, c: Option<&CovarianceFactor>) {
        let mut cur = self
            .current
            .take()
            .expect("observe requires a preceding evolve");
        let n_i = cur.dimension;

        cur.filtered = match o {
            Some(o) => {
                let g = g.expect("an observation requires G");
                let cov = c.expect("an observation requires its covariance");
                if cur.predicted.is_none() && self.steps.is_empty() {
                    // Head of the run: no prior, the observation alone
                    // determines the state.
                    Some(initial_belief(g, o, cov))
                } else {
                    match &cur.predicted {
                        Some(pred) => Some(update_belief(pred, g, o, &cov.explicit())),
                        None => Some(Belief::nan(n_i)),
                    }
                }
            }
            // No observation: the prediction is the estimate. A head step
            // without an observation stays undetermined.
            None => cur.predicted.clone(),
        };

        self.steps.append(cur);
    }

    fn estimate(&self, step: StepIndex) -> DVec {
        if self.steps.is_empty() {
            warn!("estimate on an empty filter");
            return DVec::zeros(0);
        }
        let si = if step < 0 { self.latest() } else { step };
        match self.steps.get(si) {
            Some(s) => s
                .best()
                .map(|b| b.mean.clone())
                .unwrap_or_else(|| nan_vector(s.dimension)),
            None => {
                warn!(step = si, "estimate outside the live window");
                nan_vector(self.nearest_dimension(si))
            }
        }
    }

    fn covariance(&self, step: StepIndex) -> CovarianceFactor {
        if self.steps.is_empty() {
            warn!("covariance on an empty filter");
            return CovarianceFactor::Explicit(DMat::zeros(0, 0));
        }
        let si = if step < 0 { self.latest() } else { step };
        match self.steps.get(si) {
            Some(s) => CovarianceFactor::Explicit(
                s.best()
                    .map(|b| b.cov.clone())
                    .unwrap_or_else(|| nan_matrix(s.dimension, s.dimension)),
            ),
            None => {
                warn!(step = si, "covariance outside the live window");
                let n = self.nearest_dimension(si);
                CovarianceFactor::Explicit(nan_matrix(n, n))
            }
        }
    }

    fn covariance_type(&self, _step: StepIndex) -> char {
        'C'
    }

    fn smooth(&mut self) {
        if self.steps.is_empty() {
            return;
        }
        let first = self.earliest();
        let last = self.latest();

        // Last step: smoothed = filtered.
        {
            let step = self.steps.get_mut(last).expect("index in window");
            step.smoothed = step.filtered.clone();
        }

        for si in (first..last).rev() {
            // Everything needed from step i+1, copied out before mutating i.
            let next = self.steps.get(si + 1).expect("index in window");
            let next_inputs = match (&next.f, &next.predicted, &next.smoothed) {
                (Some(f), Some(pred), Some(sm)) => {
                    Some((f.clone(), pred.clone(), sm.clone()))
                }
                _ => None,
            };

            let step = self.steps.get_mut(si).expect("index in window");
            let n = step.dimension;
            step.smoothed = Some(match (&step.filtered, next_inputs) {
                (Some(filt), Some((f_next, pred_next, sm_next))) => {
                    match pred_next.cov.clone().try_inverse() {
                        Some(p_pred_inv) => {
                            let gain = &filt.cov * f_next.transpose() * p_pred_inv;
                            Belief {
                                mean: &filt.mean + &gain * (&sm_next.mean - &pred_next.mean),
                                cov: &filt.cov
                                    + &gain * (&sm_next.cov - &pred_next.cov) * gain.transpose(),
                            }
                        }
                        None => Belief::nan(n),
                    }
                }
                _ => Belief::nan(n),
            });
        }
    }

    fn rollback(&mut self, step: StepIndex) {
        if self.steps.is_empty() {
            return;
        }
        if step > self.latest() || step < self.earliest() {
            return;
        }
        while let Some(mut s) = self.steps.drop_last() {
            if s.index == step {
                // Back to the post-evolve state: the prediction survives,
                // the update does not.
                s.filtered = None;
                s.smoothed = None;
                self.current = Some(s);
                break;
            }
        }
    }

    fn forget(&mut self, step: StepIndex) {
        if self.steps.is_empty() {
            return;
        }
        let last = self.latest();
        let si = if step < 0 { last - 1 } else { step };
        if si > last - 1 || si < self.earliest() {
            return;
        }
        while self.steps.first().map_or(false, |s| s.index <= si) {
            self.steps.drop_first();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ultimate::UltimateEngine;
    use approx::assert_abs_diff_eq;

    fn whitening(std: f64, n: usize) -> CovarianceFactor {
        CovarianceFactor::Whitening(DMat::identity(n, n) * (1.0 / std))
    }

    fn drive<E: Engine>(engine: &mut E, obs: &[Option<DVec>]) {
        let f = DMat::from_row_slice(2, 2, &[0.98, -0.2, 0.2, 0.98]);
        let h = DMat::identity(2, 2);
        let zero = DVec::zeros(2);
        let kcov = whitening(1e-3, 2);
        let ocov = whitening(1e-1, 2);
        let g = DMat::identity(2, 2);

        for (i, o) in obs.iter().enumerate() {
            if i == 0 {
                engine.evolve(2, None, None, None, None);
            } else {
                engine.evolve(2, Some(&h), Some(&f), Some(&zero), Some(&kcov));
            }
            engine.observe(o.as_ref().map(|_| &g), o.as_ref(), o.as_ref().map(|_| &ocov));
        }
    }

    fn noisy_observations(n: usize) -> Vec<Option<DVec>> {
        (0..n)
            .map(|i| {
                let t = i as f64;
                Some(DVec::from_vec(vec![
                    (0.2 * t).cos() + 0.03 * (1.7 * t).sin(),
                    (0.2 * t).sin() - 0.02 * (2.3 * t).cos(),
                ]))
            })
            .collect()
    }

    #[test]
    fn filtered_estimates_match_the_orthogonal_engine() {
        let obs = noisy_observations(8);
        let mut conventional = ConventionalEngine::new();
        let mut ultimate = UltimateEngine::new();
        drive(&mut conventional, &obs);
        drive(&mut ultimate, &obs);

        for s in 0..=conventional.latest() {
            assert_abs_diff_eq!(
                conventional.estimate(s),
                ultimate.estimate(s),
                epsilon = 1e-9
            );
            assert_abs_diff_eq!(
                conventional.covariance(s).explicit(),
                ultimate.covariance(s).explicit(),
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn smoothed_estimates_match_the_orthogonal_engine() {
        let obs = noisy_observations(8);
        let mut conventional = ConventionalEngine::new();
        let mut ultimate = UltimateEngine::new();
        drive(&mut conventional, &obs);
        drive(&mut ultimate, &obs);
        conventional.smooth();
        ultimate.smooth();

        for s in 0..=conventional.latest() {
            assert_abs_diff_eq!(
                conventional.estimate(s),
                ultimate.estimate(s),
                epsilon = 1e-9
            );
            assert_abs_diff_eq!(
                conventional.covariance(s).explicit(),
                ultimate.covariance(s).explicit(),
                epsilon = 1e-8
            );
        }
    }

    #[test]
    fn prediction_only_steps_propagate() {
        let mut obs = noisy_observations(1);
        obs.extend((0..5).map(|_| None));
        let mut engine = ConventionalEngine::new();
        drive(&mut engine, &obs);

        let f = DMat::from_row_slice(2, 2, &[0.98, -0.2, 0.2, 0.98]);
        let mut expected = obs[0].clone().unwrap();
        for _ in 0..5 {
            expected = &f * expected;
        }
        assert_abs_diff_eq!(engine.estimate(5), expected, epsilon = 1e-9);
    }

    #[test]
    fn rollback_reopens_the_step() {
        let obs = noisy_observations(6);
        let mut engine = ConventionalEngine::new();
        drive(&mut engine, &obs);
        let reference: Vec<DVec> = (0..=engine.latest()).map(|s| engine.estimate(s)).collect();

        engine.rollback(3);
        assert_eq!(engine.latest(), 2);
        let f = DMat::from_row_slice(2, 2, &[0.98, -0.2, 0.2, 0.98]);
        let h = DMat::identity(2, 2);
        let zero = DVec::zeros(2);
        let kcov = whitening(1e-3, 2);
        let ocov = whitening(1e-1, 2);
        let g = DMat::identity(2, 2);
        for (i, o) in obs.iter().enumerate().skip(3) {
            if i > 3 {
                engine.evolve(2, Some(&h), Some(&f), Some(&zero), Some(&kcov));
            }
            engine.observe(Some(&g), o.as_ref(), Some(&ocov));
        }
        for s in 0..=engine.latest() {
            assert_abs_diff_eq!(engine.estimate(s), reference[s as usize], epsilon = 1e-10);
        }
    }

    #[test]
    fn head_step_without_observation_is_undetermined() {
        let mut engine = ConventionalEngine::new();
        engine.evolve(2, None, None, None, None);
        engine.observe(None, None, None);
        assert!(engine.estimate(0).iter().all(|x| x.is_nan()));
    }
}
