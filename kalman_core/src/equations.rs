//! Raw step equations and the covariance-form recursion shared by the
//! conventional and batch engines.
//!
//! A step is described by the evolution equation
//! `H·u_i = F·u_{i-1} + c + ε`, `Cov(ε) = K`, and the observation equation
//! `o = G·u_i + δ`, `Cov(δ) = C`. The batch engines keep these equations
//! verbatim; the covariance-form helpers below turn them into the classical
//! predict/update recursion used for streaming estimates.

use crate::cov::CovarianceFactor;
use crate::matrix::{nan_matrix, nan_vector, qr_reduce_rhs, solve_upper};
use crate::types::{DMat, DVec};

/// The raw equations of one step, as handed to `evolve`/`observe`. The
/// batch engines consume the evolution with `H` already folded away (their
/// element formulas assume `u_i = F·u_{i-1} + c + ε`).
#[derive(Clone, Debug, Default)]
pub(crate) struct StepEquations {
    pub f: Option<DMat>,
    pub c: Option<DVec>,
    pub k: Option<CovarianceFactor>,
    pub g: Option<DMat>,
    pub o: Option<DVec>,
    pub obs_cov: Option<CovarianceFactor>,
}

impl StepEquations {
    pub fn clear_observation(&mut self) {
        self.g = None;
        self.o = None;
        self.obs_cov = None;
    }
}

/// A mean and explicit covariance pair.
#[derive(Clone, Debug)]
pub(crate) struct Belief {
    pub mean: DVec,
    pub cov: DMat,
}

impl Belief {
    pub fn nan(n: usize) -> Self {
        Self {
            mean: nan_vector(n),
            cov: nan_matrix(n, n),
        }
    }
}

/// Estimate a state from a single observation and no prior: whiten, QR,
/// back-substitute. `P = (RᵀR)⁻¹`.
pub(crate) fn initial_belief(g: &DMat, o: &DVec, cov: &CovarianceFactor) -> Belief {
    let n = g.ncols();
    let wg = cov.weigh(g);
    let mut wo = cov.weigh_vec(o);
    if wg.nrows() < n {
        return Belief::nan(n);
    }
    let r = qr_reduce_rhs(wg, &mut wo);
    let mean = match solve_upper(&r, &wo.rows(0, n).into_owned()) {
        Some(m) => m,
        None => return Belief::nan(n),
    };
    let cov = (r.transpose() * &r)
        .try_inverse()
        .unwrap_or_else(|| nan_matrix(n, n));
    Belief { mean, cov }
}

/// Covariance-form predict: `m⁻ = F·m + c`, `P⁻ = F·P·Fᵀ + Q`.
pub(crate) fn predict_belief(prev: &Belief, f: &DMat, c: &DVec, q: &DMat) -> Belief {
    Belief {
        mean: f * &prev.mean + c,
        cov: f * &prev.cov * f.transpose() + q,
    }
}

/// Joseph-form measurement update against an explicit observation
/// covariance. A singular innovation covariance degrades to NaN.
pub(crate) fn update_belief(pred: &Belief, g: &DMat, o: &DVec, c_expl: &DMat) -> Belief {
    let n = pred.mean.len();
    let s = g * &pred.cov * g.transpose() + c_expl;
    let s_inv = match s.try_inverse() {
        Some(inv) => inv,
        None => return Belief::nan(n),
    };
    let gain = &pred.cov * g.transpose() * s_inv;
    let innovation = o - g * &pred.mean;
    let mean = &pred.mean + &gain * innovation;
    let i_kg = DMat::identity(n, n) - &gain * g;
    let cov = &i_kg * &pred.cov * i_kg.transpose() + &gain * c_expl * gain.transpose();
    Belief { mean, cov }
}

/// Fold `H⁻¹` into the evolution so it reads `u_i = F̂·u_{i-1} + ĉ + ε̂`.
/// A missing `H` stands for the identity; a non-square or singular `H`
/// yields NaN blocks (the covariance-form engines cannot express it).
pub(crate) fn fold_h(
    h: Option<&DMat>,
    f: &DMat,
    c: &DVec,
    q: &DMat,
) -> (DMat, DVec, DMat) {
    match h {
        None => (f.clone(), c.clone(), q.clone()),
        Some(h) if h.nrows() == h.ncols() => match h.clone().try_inverse() {
            Some(hi) => (&hi * f, &hi * c, &hi * q * hi.transpose()),
            None => nan_evolution(f, c, q),
        },
        Some(_) => nan_evolution(f, c, q),
    }
}

fn nan_evolution(f: &DMat, c: &DVec, q: &DMat) -> (DMat, DVec, DMat) {
    (
        nan_matrix(f.nrows(), f.ncols()),
        nan_vector(c.len()),
        nan_matrix(q.nrows(), q.ncols()),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
