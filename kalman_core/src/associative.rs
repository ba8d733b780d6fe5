//! Associative (parallel) smoother.
//!
//! Re-expresses forward filtering and backward smoothing as two inclusive
//! prefix scans over per-step elements, after Särkkä & García-Fernández,
//! *Temporal Parallelization of Bayesian Smoothers*, IEEE TAC 66(1), 2021.
//!
//! Streaming calls (`evolve`/`observe`) only record the raw step equations
//! and keep the covariance-form recursion running so `estimate` answers
//! between observations; `smooth` snapshots the equations into contiguous
//! element arrays, runs the two scans on the [`parscan::Runtime`], and
//! writes the smoothed states and explicit covariances back.
//!
//! The element payloads: filtering elements carry `(A, b, Z, e, J)` —
//! `Z` is the matrix the article calls `C`, renamed because `C` is already
//! the observation covariance — and smoothing elements carry `(E, g, L)`.

use crate::cov::CovarianceFactor;
use crate::engine::Engine;
use crate::equations::{
    fold_h, initial_belief, predict_belief, update_belief, Belief, StepEquations,
};
use crate::log::StepLog;
use crate::matrix::{mldivide, nan_matrix, nan_vector};
use crate::types::{DMat, DVec, StepIndex};
use parscan::{Runtime, ScanSchedule, Stride};
use std::sync::Arc;
use tracing::warn;

// ---------------------------------------------------------------------------
// Elements
// ---------------------------------------------------------------------------

/// Filtering element: the affine-plus-information parametrization of one
/// step's conditional. `e`/`J` are absent on observation-free steps (zero
/// information).
#[derive(Clone, Debug)]
struct FilterElement {
    a: DMat,
    b: DVec,
    z: DMat,
    e: Option<DVec>,
    j: Option<DMat>,
}

impl FilterElement {
    fn nan(n: usize) -> Self {
        Self {
            a: nan_matrix(n, n),
            b: nan_vector(n),
            z: nan_matrix(n, n),
            e: None,
            j: None,
        }
    }
}

/// Smoothing element: the affine map `x_i = E·x_{i+1} + g` with residual
/// covariance `L`.
#[derive(Clone, Debug)]
struct SmoothElement {
    e: DMat,
    g: DVec,
    l: DMat,
}

/// Filtering combiner `⊕_f`. `si` is the accumulated prefix, `sj` the next
/// element in scan order.
fn combine_filter(si: &FilterElement, sj: &FilterElement) -> FilterElement {
    let n = si.b.len();
    let (x, y) = match &sj.j {
        Some(jj) => {
            // X = A_j·(I + Z_i·J_j)⁻¹ and Y = A_iᵀ·(I + J_j·Z_i)⁻¹, both via
            // the transposed solve so the dense LU path applies.
            let m = DMat::identity(n, n) + &si.z * jj;
            let x = match mldivide(&m.transpose(), &sj.a.transpose()) {
                Some(xt) => xt.transpose(),
                None => return FilterElement::nan(n),
            };
            let m = DMat::identity(n, n) + jj * &si.z;
            let y = match mldivide(&m.transpose(), &si.a) {
                Some(yt) => yt.transpose(),
                None => return FilterElement::nan(n),
            };
            (x, y)
        }
        None => (sj.a.clone(), si.a.transpose()),
    };

    let a = &x * &si.a;
    let b = match &sj.e {
        Some(ej) => &x * (&si.z * ej + &si.b) + &sj.b,
        None => &x * &si.b + &sj.b,
    };
    let z = &x * &si.z * sj.a.transpose() + &sj.z;

    let (e, j) = match (&sj.e, &sj.j) {
        (Some(ej), Some(jj)) => {
            let cols = si.a.ncols();
            let e_i = si.e.clone().unwrap_or_else(|| DVec::zeros(cols));
            let j_i = si.j.clone().unwrap_or_else(|| DMat::zeros(cols, cols));
            let e = &y * (ej - jj * &si.b) + e_i;
            let j = &y * jj * &si.a + j_i;
            (Some(e), Some(j))
        }
        // The later element carries no information rows; the prefix's pass
        // through unchanged.
        _ => (si.e.clone(), si.j.clone()),
    };

    FilterElement { a, b, z, e, j }
}

/// Smoothing combiner `⊕_s`; `si` accumulates the later steps.
fn combine_smooth(si: &SmoothElement, sj: &SmoothElement) -> SmoothElement {
    SmoothElement {
        e: &sj.e * &si.e,
        g: &sj.e * &si.g + &sj.g,
        l: &sj.e * &si.l * sj.e.transpose() + &sj.l,
    }
}

// ---------------------------------------------------------------------------
// Element construction
// ---------------------------------------------------------------------------

/// Everything the parallel element build needs from one step's equations.
#[derive(Clone, Debug)]
struct EqSnapshot {
    dimension: usize,
    f: DMat,
    c: DVec,
    k: CovarianceFactor,
    observation: Option<(DMat, DVec, CovarianceFactor)>,
}

fn build_filter_element(
    snap: &EqSnapshot,
    is_second_step: bool,
    head: &Belief,
) -> FilterElement {
    let n = snap.dimension;
    let f = &snap.f;
    let c = &snap.c;

    let mut k_expl = snap.k.explicit();
    if is_second_step {
        // Augment the evolution covariance with the prior's contribution.
        k_expl += f * &head.cov * f.transpose();
    }

    match &snap.observation {
        None => FilterElement {
            a: if is_second_step {
                DMat::zeros(n, n)
            } else {
                f.clone()
            },
            b: if is_second_step { &head.mean + c } else { c.clone() },
            z: k_expl,
            e: None,
            j: None,
        },
        Some((g, o, obs_cov)) => {
            let c_expl = obs_cov.explicit();
            let s = g * &k_expl * g.transpose() + c_expl;
            // Gᵀ·S⁻¹ through the transposed solve.
            let gt_sinv = match mldivide(&s.transpose(), g) {
                Some(solved) => solved.transpose(),
                None => return FilterElement::nan(n),
            };
            let gain = &k_expl * &gt_sinv;

            let (a, b, z) = if is_second_step {
                let m1 = f * &head.mean + c;
                (
                    DMat::zeros(n, n),
                    &m1 + &gain * (o - g * &m1),
                    &k_expl - &gain * &s * gain.transpose(),
                )
            } else {
                (
                    f - &gain * g * f,
                    c + &gain * (o - g * c),
                    &k_expl - &gain * g * &k_expl,
                )
            };

            let ft_gt_sinv = f.transpose() * &gt_sinv;
            let e = &ft_gt_sinv * (o - g * c);
            let j = &ft_gt_sinv * g * f;

            FilterElement {
                a,
                b,
                z,
                e: Some(e),
                j: Some(j),
            }
        }
    }
}

fn build_smooth_element(
    filtered: &Belief,
    next: Option<&EqSnapshot>,
) -> SmoothElement {
    let n = filtered.mean.len();
    match next {
        // Last step: the smoothed estimate is the filtered one.
        None => SmoothElement {
            e: DMat::zeros(n, n),
            g: filtered.mean.clone(),
            l: filtered.cov.clone(),
        },
        Some(snap) => {
            let f = &snap.f;
            let q = snap.k.explicit();
            let p = &filtered.cov;

            let pft = p * f.transpose();
            let fpft_q = f * &pft + q;
            // E = P·Fᵀ·(F·P·Fᵀ + Q)⁻¹ through the transposed solve.
            let e = match mldivide(&fpft_q.transpose(), &pft.transpose()) {
                Some(et) => et.transpose(),
                None => {
                    return SmoothElement {
                        e: nan_matrix(n, n),
                        g: nan_vector(n),
                        l: nan_matrix(n, n),
                    }
                }
            };
            let g = &filtered.mean - &e * (f * &filtered.mean + &snap.c);
            let l = p - &e * f * p;
            SmoothElement { e, g, l }
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Step {
    index: StepIndex,
    dimension: usize,
    eq: StepEquations,
    predicted: Option<Belief>,
    filtered: Option<Belief>,
    smoothed: Option<Belief>,
}

impl Step {
    fn best(&self) -> Option<&Belief> {
        self.smoothed.as_ref().or(self.filtered.as_ref())
    }
}

pub(crate) struct AssociativeEngine {
    steps: StepLog<Step>,
    current: Option<Step>,
    runtime: Arc<Runtime>,
    schedule: ScanSchedule,
}

impl AssociativeEngine {
    pub fn new(runtime: Arc<Runtime>, schedule: ScanSchedule) -> Self {
        Self {
            steps: StepLog::new(),
            current: None,
            runtime,
            schedule,
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

    /// Snapshot of the equations evolving *into* the step at window offset
    /// `j + 1` (snapshots are indexed by the scan the filter runs, which
    /// starts at the second live step).
    fn snapshot(&self, offset: usize) -> Option<EqSnapshot> {
        let first = self.steps.first_index()?;
        let step = self.steps.get(first + offset as i64 + 1)?;
        let (f, c, k) = match (&step.eq.f, &step.eq.c, &step.eq.k) {
            (Some(f), Some(c), Some(k)) => (f.clone(), c.clone(), k.clone()),
            _ => return None,
        };
        let observation = match (&step.eq.g, &step.eq.o, &step.eq.obs_cov) {
            (Some(g), Some(o), Some(cov)) => Some((g.clone(), o.clone(), cov.clone())),
            _ => None,
        };
        Some(EqSnapshot {
            dimension: step.dimension,
            f,
            c,
            k,
            observation,
        })
    }
}

impl Engine for AssociativeEngine {
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

        // The element formulas assume an identity H; fold it away up front
        // so both the scans and the streaming recursion see the same
        // evolution.
        let (ff, fc, fq) = fold_h(h, f, c, &k.explicit());
        cur.predicted = prev
            .filtered
            .as_ref()
            .map(|b| predict_belief(b, &ff, &fc, &fq));
        cur.eq.f = Some(ff);
        cur.eq.c = Some(fc);
        cur.eq.k = Some(CovarianceFactor::Explicit(fq));

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
                cur.eq.g = Some(g.clone());
                cur.eq.o = Some(o.clone());
                cur.eq.obs_cov = Some(cov.clone());
                if cur.predicted.is_none() && self.steps.is_empty() {
                    Some(initial_belief(g, o, cov))
                } else {
                    match &cur.predicted {
                        Some(pred) => Some(update_belief(pred, g, o, &cov.explicit())),
                        None => Some(Belief::nan(n_i)),
                    }
                }
            }
            None => cur.predicted.clone(),
        };

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
            warn!("covariance on an empty smoother");
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
        let l = self.steps.len();
        if l == 0 {
            return;
        }
        let first = self.earliest();

        // The head belief comes from the earliest step's own observation;
        // without one the whole batch is undetermined.
        let head = {
            let head_step = self.steps.get(first).expect("index in window");
            match (&head_step.eq.g, &head_step.eq.o, &head_step.eq.obs_cov) {
                (Some(g), Some(o), Some(cov)) => initial_belief(g, o, cov),
                _ => {
                    warn!("earliest step has no observation; smoothing yields NaN");
                    Belief::nan(head_step.dimension)
                }
            }
        };
        if l == 1 {
            let step = self.steps.get_mut(first).expect("index in window");
            step.smoothed = Some(head);
            return;
        }

        // Snapshot the equations of steps first+1 .. last so the parallel
        // phases never touch the log.
        let snaps: Vec<Option<EqSnapshot>> = (0..l - 1).map(|j| self.snapshot(j)).collect();

        // Build the filtering elements, one worker per index.
        let mut elements: Vec<Option<FilterElement>> = vec![None; l - 1];
        self.runtime
            .for_each_chunks_mut(&mut elements, |offset, chunk| {
                for (d, slot) in chunk.iter_mut().enumerate() {
                    let j = offset + d;
                    *slot = Some(match &snaps[j] {
                        Some(snap) => build_filter_element(snap, j == 0, &head),
                        None => FilterElement::nan(head.mean.len()),
                    });
                }
            });
        let elements: Vec<FilterElement> = elements
            .into_iter()
            .map(|e| e.expect("element build covers every index"))
            .collect();

        // Forward scan: position k is the filtered pair of step first+k+1.
        let filtered_scan =
            self.runtime
                .prefix_scan(&elements, Stride::Forward, self.schedule, combine_filter);
        let mut filtered: Vec<Belief> = Vec::with_capacity(l);
        filtered.push(head);
        filtered.extend(filtered_scan.iter().map(|fe| Belief {
            mean: fe.b.clone(),
            cov: fe.z.clone(),
        }));

        // Build the smoothing elements from the filtered pairs and the
        // following step's evolution.
        let mut smooth_elements: Vec<Option<SmoothElement>> = vec![None; l];
        self.runtime
            .for_each_chunks_mut(&mut smooth_elements, |offset, chunk| {
                for (d, slot) in chunk.iter_mut().enumerate() {
                    let j = offset + d;
                    let next = if j + 1 < l {
                        snaps[j].as_ref()
                    } else {
                        None
                    };
                    *slot = Some(build_smooth_element(&filtered[j], next));
                }
            });
        let smooth_elements: Vec<SmoothElement> = smooth_elements
            .into_iter()
            .map(|e| e.expect("element build covers every index"))
            .collect();

        // Reverse scan: position k (scan order) is the smoothed pair of step
        // last−k.
        let smoothed_scan = self.runtime.prefix_scan(
            &smooth_elements,
            Stride::Reverse,
            self.schedule,
            combine_smooth,
        );

        for j in 0..l {
            let belief = if j == l - 1 {
                filtered[l - 1].clone()
            } else {
                let se = &smoothed_scan[l - 1 - j];
                Belief {
                    mean: se.g.clone(),
                    cov: se.l.clone(),
                }
            };
            let step = self
                .steps
                .get_mut(first + j as i64)
                .expect("index in window");
            step.smoothed = Some(belief);
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
                s.eq.clear_observation();
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

    fn engine(schedule: ScanSchedule) -> AssociativeEngine {
        AssociativeEngine::new(Arc::new(Runtime::serial()), schedule)
    }

    fn drive<E: Engine>(engine: &mut E, obs: &[Option<DVec>]) {
        let f = DMat::from_row_slice(2, 2, &[0.95, -0.3, 0.3, 0.95]);
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

    fn observations(n: usize) -> Vec<Option<DVec>> {
        (0..n)
            .map(|i| {
                let t = i as f64;
                Some(DVec::from_vec(vec![
                    (0.3 * t).cos() + 0.02 * (1.3 * t).sin(),
                    (0.3 * t).sin() + 0.01 * (0.7 * t).cos(),
                ]))
            })
            .collect()
    }

    #[test]
    fn filtered_estimates_match_the_orthogonal_engine() {
        let obs = observations(7);
        let mut assoc = engine(ScanSchedule::Blocked);
        let mut ultimate = UltimateEngine::new();
        drive(&mut assoc, &obs);
        drive(&mut ultimate, &obs);
        for s in 0..=assoc.latest() {
            assert_abs_diff_eq!(assoc.estimate(s), ultimate.estimate(s), epsilon = 1e-9);
        }
    }

    #[test]
    fn smoothed_estimates_match_the_orthogonal_engine() {
        for schedule in [ScanSchedule::Serial, ScanSchedule::Blocked, ScanSchedule::OddEven] {
            let obs = observations(9);
            let mut assoc = engine(schedule);
            let mut ultimate = UltimateEngine::new();
            drive(&mut assoc, &obs);
            drive(&mut ultimate, &obs);
            assoc.smooth();
            ultimate.smooth();
            for s in 0..=assoc.latest() {
                assert_abs_diff_eq!(assoc.estimate(s), ultimate.estimate(s), epsilon = 1e-9);
                assert_abs_diff_eq!(
                    assoc.covariance(s).explicit(),
                    ultimate.covariance(s).explicit(),
                    epsilon = 1e-8
                );
            }
        }
    }

    #[test]
    fn smoothing_handles_observation_free_interior_steps() {
        let mut obs = observations(8);
        obs[3] = None;
        obs[4] = None;
        let mut assoc = engine(ScanSchedule::Blocked);
        let mut ultimate = UltimateEngine::new();
        drive(&mut assoc, &obs);
        drive(&mut ultimate, &obs);
        assoc.smooth();
        ultimate.smooth();
        for s in 0..=assoc.latest() {
            assert_abs_diff_eq!(assoc.estimate(s), ultimate.estimate(s), epsilon = 1e-9);
        }
    }

    #[test]
    fn smoothing_is_idempotent() {
        let obs = observations(6);
        let mut assoc = engine(ScanSchedule::Blocked);
        drive(&mut assoc, &obs);
        assoc.smooth();
        let states: Vec<DVec> = (0..=assoc.latest()).map(|s| assoc.estimate(s)).collect();
        assoc.smooth();
        for s in 0..=assoc.latest() {
            assert_abs_diff_eq!(assoc.estimate(s), states[s as usize], epsilon = 1e-12);
        }
    }

    #[test]
    fn single_step_smooth_uses_the_observation_alone() {
        let mut assoc = engine(ScanSchedule::Serial);
        let g = DMat::identity(2, 2);
        let o = DVec::from_vec(vec![3.0, 4.0]);
        let cov = whitening(1e-1, 2);
        assoc.evolve(2, None, None, None, None);
        assoc.observe(Some(&g), Some(&o), Some(&cov));
        assoc.smooth();
        assert_abs_diff_eq!(assoc.estimate(0), o, epsilon = 1e-12);
        assert_eq!(assoc.covariance_type(0), 'C');
    }

    #[test]
    fn combiner_composes_pure_predictions_exactly() {
        // With no information rows, ⊕_f must reduce to composition of the
        // affine prediction maps.
        let a1 = DMat::from_row_slice(2, 2, &[1.0, 0.5, 0.0, 1.0]);
        let a2 = DMat::from_row_slice(2, 2, &[2.0, 0.0, 1.0, 1.0]);
        let s1 = FilterElement {
            a: a1.clone(),
            b: DVec::from_vec(vec![1.0, -1.0]),
            z: DMat::identity(2, 2) * 0.1,
            e: None,
            j: None,
        };
        let s2 = FilterElement {
            a: a2.clone(),
            b: DVec::from_vec(vec![0.5, 0.5]),
            z: DMat::identity(2, 2) * 0.2,
            e: None,
            j: None,
        };
        let s12 = combine_filter(&s1, &s2);
        assert_abs_diff_eq!(s12.a, &a2 * &a1, epsilon = 1e-14);
        assert_abs_diff_eq!(s12.b, &a2 * &s1.b + &s2.b, epsilon = 1e-14);
        assert_abs_diff_eq!(
            s12.z,
            &a2 * &s1.z * a2.transpose() + &s2.z,
            epsilon = 1e-14
        );
        assert!(s12.e.is_none() && s12.j.is_none());
    }
}
