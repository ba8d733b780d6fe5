//! Dense matrix kernel: the handful of composite operations the engines are
//! built from, expressed over nalgebra's QR, triangular-solve and LU
//! primitives.
//!
//! All functions return freshly allocated matrices; in-place mutation is
//! limited to the `Qᵀ·rhs` applications inside [`qr_reduce`]. Singular solves
//! return `None`; callers translate that into NaN fills, never into panics.

use crate::types::{DMat, DVec};

/// Stack `top` over `bottom`. Column counts must agree.
pub(crate) fn vconcat(top: &DMat, bottom: &DMat) -> DMat {
    assert_eq!(
        top.ncols(),
        bottom.ncols(),
        "vertical concatenation requires equal column counts"
    );
    let mut out = DMat::zeros(top.nrows() + bottom.nrows(), top.ncols());
    out.rows_mut(0, top.nrows()).copy_from(top);
    out.rows_mut(top.nrows(), bottom.nrows()).copy_from(bottom);
    out
}

/// Stack `top` over `bottom` (column vectors).
pub(crate) fn vconcat_vec(top: &DVec, bottom: &DVec) -> DVec {
    let mut out = DVec::zeros(top.len() + bottom.len());
    out.rows_mut(0, top.len()).copy_from(top);
    out.rows_mut(top.len(), bottom.len()).copy_from(bottom);
    out
}

/// Stack whichever of the two blocks are present; `None` when both are absent.
pub(crate) fn vconcat_opt(top: Option<&DMat>, bottom: Option<&DMat>) -> Option<DMat> {
    match (top, bottom) {
        (Some(t), Some(b)) => Some(vconcat(t, b)),
        (Some(t), None) => Some(t.clone()),
        (None, Some(b)) => Some(b.clone()),
        (None, None) => None,
    }
}

pub(crate) fn vconcat_vec_opt(top: Option<&DVec>, bottom: Option<&DVec>) -> Option<DVec> {
    match (top, bottom) {
        (Some(t), Some(b)) => Some(vconcat_vec(t, b)),
        (Some(t), None) => Some(t.clone()),
        (None, Some(b)) => Some(b.clone()),
        (None, None) => None,
    }
}

/// QR-factor `a` and left-apply `Qᵀ` (the full square factor) to `b` and `y`
/// in place. Returns the upper-trapezoidal `R` with `min(rows, cols)` rows.
pub(crate) fn qr_reduce(a: DMat, b: &mut DMat, y: &mut DVec) -> DMat {
    let qr = a.qr();
    qr.q_tr_mul(b);
    qr.q_tr_mul(y);
    qr.r()
}

/// QR-factor `a` and left-apply `Qᵀ` to `y` alone.
pub(crate) fn qr_reduce_rhs(a: DMat, y: &mut DVec) -> DMat {
    let qr = a.qr();
    qr.q_tr_mul(y);
    qr.r()
}

/// Solve `R·x = y` with `R` square upper-triangular. `None` on a zero
/// diagonal element.
pub(crate) fn solve_upper(r: &DMat, y: &DVec) -> Option<DVec> {
    r.solve_upper_triangular(y)
}

/// MATLAB-style `a \ b` for square `a`, via LU. `None` when `a` is singular.
pub(crate) fn mldivide(a: &DMat, b: &DMat) -> Option<DMat> {
    a.clone().lu().solve(b)
}

/// `rows × cols` identity block: ones on the leading diagonal, zeros
/// elsewhere ("[I | 0]" when wider than tall).
pub(crate) fn eye_block(rows: usize, cols: usize) -> DMat {
    DMat::identity(rows, cols)
}

pub(crate) fn nan_matrix(rows: usize, cols: usize) -> DMat {
    DMat::from_element(rows, cols, f64::NAN)
}

pub(crate) fn nan_vector(len: usize) -> DVec {
    DVec::from_element(len, f64::NAN)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
