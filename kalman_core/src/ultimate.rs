//! Sequential Paige–Saunders engine.
//!
//! The running state is a block-bidiagonal upper-triangular factor of the
//! accumulated weighted least-squares system: per sealed step `i`, the
//! diagonal block `Rdiag[i]`, the super-diagonal block `Rsupdiag[i]` linking
//! it to step `i+1`, and the transformed right-hand side `y[i]`. The open
//! step carries the leftover rows `Rbar`/`ybar` that the last QR could not
//! consume; they are merged with the next observation.
//!
//! Absorbing an evolution, absorbing an observation, and retrospective
//! smoothing are all local QR updates of adjacent blocks. No covariance is
//! ever inverted on this path, which keeps the engine stable on
//! rank-deficient and ill-conditioned systems.
//!
//! # Block layout of one evolution
//!
//! ```text
//!        u_{i-1}      u_i          rhs
//!   [ Rdiag[i-1]        0   ]   [ y[i-1] ]
//!   [   -V·F_i        V·H_i ]   [ V·c_i  ]
//! ```
//!
//! QR on the left column block seals step `i-1`; rows spilling past
//! `n_{i-1}` become the new step's `Rbar`/`ybar`.

use crate::cov::CovarianceFactor;
use crate::engine::Engine;
use crate::log::StepLog;
use crate::matrix::{
    eye_block, nan_matrix, nan_vector, qr_reduce, qr_reduce_rhs, solve_upper, vconcat,
    vconcat_opt, vconcat_vec, vconcat_vec_opt,
};
use crate::types::{DMat, DVec, StepIndex};
use tracing::warn;

#[derive(Debug, Default)]
struct Step {
    index: StepIndex,
    dimension: usize,
    rdiag: Option<DMat>,
    rsupdiag: Option<DMat>,
    y: Option<DVec>,
    rbar: Option<DMat>,
    ybar: Option<DVec>,
    state: Option<DVec>,
    /// Upper-triangular factor whose inverse Gram is the covariance ('W').
    covariance: Option<DMat>,
}

impl Step {
    fn new(index: StepIndex, dimension: usize) -> Self {
        Self {
            index,
            dimension,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct UltimateEngine {
    steps: StepLog<Step>,
    /// The step opened by `evolve` and not yet sealed by `observe`.
    current: Option<Step>,
}

impl UltimateEngine {
    pub fn new() -> Self {
        Self {
            steps: StepLog::new(),
            current: None,
        }
    }
}

impl Engine for UltimateEngine {
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
            // First step: only the dimension and index are recorded; the
            // first information arrives with the first observation.
            self.current = Some(Step::new(0, n_i));
            return;
        }

        let prev_index = self.steps.last().map(|s| s.index).unwrap_or(0);
        let mut cur = Step::new(prev_index + 1, n_i);

        let f = f.expect("evolve after the first step requires F");
        let c = c.expect("evolve after the first step requires c");
        let k = k.expect("evolve after the first step requires an evolution covariance");
        let fallback_h;
        let h = match h {
            Some(h) => h,
            None => {
                fallback_h = eye_block(f.nrows(), n_i);
                &fallback_h
            }
        };

        let vh = k.weigh(h);
        let vf = -k.weigh(f);
        let vc = k.weigh_vec(c);

        let prev = self.steps.last_mut().expect("non-empty log");
        let n_imo = prev.dimension;
        let (a, mut b, mut y) = match (prev.rdiag.take(), prev.y.take()) {
            (Some(rdiag), Some(y_prev)) => {
                let z = rdiag.nrows();
                (
                    vconcat(&rdiag, &vf),
                    vconcat(&DMat::zeros(z, n_i), &vh),
                    vconcat_vec(&y_prev, &vc),
                )
            }
            // The predecessor carries no information yet (undetermined head).
            _ => (vf, vh, vc),
        };

        let r = qr_reduce(a, &mut b, &mut y);

        let rows = b.nrows();
        if rows > n_imo {
            cur.rbar = Some(b.rows(n_imo, rows - n_imo).into_owned());
            cur.ybar = Some(y.rows(n_imo, rows - n_imo).into_owned());
        }

        // Seal block row i-1: freshly factored blocks move back into the
        // predecessor's slots.
        let keep = rows.min(n_imo);
        prev.rdiag = Some(r);
        prev.rsupdiag = Some(b.rows(0, keep).into_owned());
        prev.y = Some(y.rows(0, keep).into_owned());

        self.current = Some(cur);
    }

    fn observe(
        &mut self,
        g: Option<&DMat>,
        o: Option<&DVec>,
        c: Option<&CovarianceFactor>,
    ) {
        let mut cur = self
            .current
            .take()
            .expect("observe requires a preceding evolve");
        let n_i = cur.dimension;

        let (wg, wo) = match o {
            Some(o) => {
                let g = g.expect("an observation requires G");
                let cov = c.expect("an observation requires its covariance");
                (Some(cov.weigh(g)), Some(cov.weigh_vec(o)))
            }
            None => (None, None),
        };

        // Rbar/ybar stay in the step so a later rollback can reopen it.
        let a = vconcat_opt(cur.rbar.as_ref(), wg.as_ref());
        let y = vconcat_vec_opt(cur.ybar.as_ref(), wo.as_ref());

        if let (Some(a), Some(mut y)) = (a, y) {
            if a.nrows() >= a.ncols() {
                let r = qr_reduce_rhs(a, &mut y);
                let keep = r.nrows();
                cur.rdiag = Some(r);
                cur.y = Some(y.rows(0, keep).into_owned());
            } else {
                // Flat block: nothing to factor, the step stays
                // underdetermined.
                cur.rdiag = Some(a);
                cur.y = Some(y);
            }

            let rdiag = cur.rdiag.as_ref().expect("just assigned");
            cur.state = Some(if rdiag.nrows() == n_i {
                let y = cur.y.as_ref().expect("just assigned");
                solve_upper(rdiag, y).unwrap_or_else(|| nan_vector(n_i))
            } else {
                nan_vector(n_i)
            });
            cur.covariance = Some(rdiag.clone());
        }

        self.steps.append(cur);
    }

    fn estimate(&self, step: StepIndex) -> DVec {
        if self.steps.is_empty() {
            warn!("estimate on an empty smoother");
            return DVec::zeros(0);
        }
        let si = if step < 0 { self.latest() } else { step };
        match self.steps.get(si) {
            Some(s) => s
                .state
                .clone()
                .unwrap_or_else(|| nan_vector(s.dimension)),
            None => {
                warn!(step = si, "estimate outside the live window");
                let n = self.nearest_dimension(si);
                nan_vector(n)
            }
        }
    }

    fn covariance(&self, step: StepIndex) -> CovarianceFactor {
        if self.steps.is_empty() {
            warn!("covariance on an empty smoother");
            return CovarianceFactor::Whitening(DMat::zeros(0, 0));
        }
        let si = if step < 0 { self.latest() } else { step };
        match self.steps.get(si) {
            Some(s) => {
                let determined = s
                    .rdiag
                    .as_ref()
                    .map_or(false, |r| r.nrows() == s.dimension);
                if determined {
                    CovarianceFactor::Whitening(
                        s.covariance.clone().unwrap_or_else(|| {
                            nan_matrix(s.dimension, s.dimension)
                        }),
                    )
                } else {
                    CovarianceFactor::Whitening(nan_matrix(s.dimension, s.dimension))
                }
            }
            None => {
                warn!(step = si, "covariance outside the live window");
                let n = self.nearest_dimension(si);
                CovarianceFactor::Whitening(nan_matrix(n, n))
            }
        }
    }

    fn covariance_type(&self, _step: StepIndex) -> char {
        'W'
    }

    fn smooth(&mut self) {
        if self.steps.is_empty() {
            return;
        }
        let first = self.earliest();
        let last = self.latest();

        // State pass: back-substitute the block-bidiagonal system from the
        // latest step toward the earliest.
        let mut next_state: Option<DVec> = None;
        for si in (first..=last).rev() {
            let step = self.steps.get_mut(si).expect("index in window");
            let mut v = match &step.y {
                Some(y) => y.clone(),
                None => {
                    step.state = Some(nan_vector(step.dimension));
                    next_state = step.state.clone();
                    continue;
                }
            };
            if si < last {
                match (&step.rsupdiag, &next_state) {
                    (Some(rsup), Some(ns)) if rsup.ncols() == ns.len() => v -= rsup * ns,
                    _ => v = nan_vector(v.len()),
                }
            }
            let state = match &step.rdiag {
                Some(r) if r.nrows() == step.dimension => {
                    solve_upper(r, &v).unwrap_or_else(|| nan_vector(step.dimension))
                }
                _ => nan_vector(step.dimension),
            };
            next_state = Some(state.clone());
            step.state = Some(state);
        }

        // Covariance pass, same direction: propagate a running triangle.
        let mut running: Option<DMat> = None;
        let mut n_ipo = 0usize;
        for si in (first..=last).rev() {
            if si == last {
                let step = self.steps.get_mut(si).expect("index in window");
                match &step.rdiag {
                    Some(r) if r.nrows() == step.dimension => {
                        n_ipo = r.nrows();
                        running = Some(r.clone());
                        step.covariance = Some(r.clone());
                    }
                    _ => {
                        step.covariance =
                            Some(nan_matrix(step.dimension, step.dimension));
                        running = None;
                    }
                }
                continue;
            }
            let step = self.steps.get_mut(si).expect("index in window");
            let compatible = match (&step.rdiag, &step.rsupdiag, &running) {
                (Some(rdiag), Some(rsup), Some(r)) => {
                    rdiag.nrows() == step.dimension && rsup.ncols() == r.ncols()
                }
                _ => false,
            };
            if !compatible {
                step.covariance = Some(nan_matrix(step.dimension, step.dimension));
                running = None;
                continue;
            }
            let rdiag = step.rdiag.as_ref().expect("checked above");
            let rsup = step.rsupdiag.as_ref().expect("checked above");
            let r = running.as_ref().expect("checked above");

            let n_i = rdiag.nrows();
            let a = vconcat(rsup, r);
            let mut s = vconcat(rdiag, &DMat::zeros(r.nrows(), rdiag.ncols()));
            let qr = a.qr();
            qr.q_tr_mul(&mut s);
            let cov = s.view((n_ipo, 0), (n_i, n_i)).into_owned();

            step.covariance = Some(cov.clone());
            running = Some(cov);
            n_ipo = n_i;
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
                // Back to the state right after this step's evolve: only the
                // leftover rows survive.
                s.rdiag = None;
                s.rsupdiag = None;
                s.y = None;
                s.state = None;
                s.covariance = None;
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

impl UltimateEngine {
    fn nearest_dimension(&self, si: StepIndex) -> usize {
        let probe = if si < self.earliest() {
            self.steps.first()
        } else {
            self.steps.last()
        };
        probe.map_or(0, |s| s.dimension)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
