//! Covariance factors: a covariance matrix together with the representation
//! it is stored in, as a tagged variant.
//!
//! The engines never invert covariances on the hot path; they *weigh*
//! (whiten) equation blocks with a factor of the covariance. Which operation
//! "weigh" means depends on the representation, so the representation travels
//! with the matrix:
//!
//! | variant | tag | `weigh(A)` | represented covariance |
//! |---|---|---|---|
//! | `Whitening`         | `'W'` | `K·A`              | `(KᵀK)⁻¹` |
//! | `UpperFactor`       | `'U'` | `K \ A` (triangular) | `K·Kᵀ` |
//! | `DiagonalWhitening` | `'w'` | row-scale by `K`   | `diag(1/K²)` |
//! | `Explicit`          | `'C'` | Cholesky, then solve | `K` |
//!
//! Singular or non-positive-definite inputs degrade to NaN results; no
//! variant ever panics on numeric content.

use crate::matrix::{nan_matrix, nan_vector};
use crate::types::{DMat, DVec};
use nalgebra::Cholesky;

/// A covariance matrix in one of four representations.
#[derive(Clone, Debug)]
pub enum CovarianceFactor {
    /// The explicit covariance matrix (tag `'C'`).
    Explicit(DMat),
    /// A whitening factor: left-multiplying by it whitens (tag `'W'`).
    Whitening(DMat),
    /// An upper-triangular factor; whitening is a triangular solve
    /// (tag `'U'`, with `'F'` accepted as an alias on construction).
    UpperFactor(DMat),
    /// A diagonal whitening factor stored as a column vector (tag `'w'`).
    DiagonalWhitening(DVec),
}

impl CovarianceFactor {
    /// Construct from a matrix and a representation tag character.
    /// Panics on an unknown tag — the tag is part of the call contract.
    pub fn from_tag(matrix: DMat, tag: char) -> Self {
        match tag {
            'C' => Self::Explicit(matrix),
            'W' => Self::Whitening(matrix),
            'U' | 'F' => Self::UpperFactor(matrix),
            'w' => {
                assert_eq!(matrix.ncols(), 1, "diagonal whitening factor must be a column");
                Self::DiagonalWhitening(matrix.column(0).into_owned())
            }
            _ => panic!("unknown covariance representation tag {tag:?}"),
        }
    }

    /// The `'W'` factor whose represented covariance is the given symmetric
    /// positive-definite matrix (inverse of the lower Cholesky factor).
    pub fn whitening_from_explicit(cov: &DMat) -> Self {
        let n = cov.nrows();
        match Cholesky::new(cov.clone()) {
            Some(chol) => match chol.l().solve_lower_triangular(&DMat::identity(n, n)) {
                Some(w) => Self::Whitening(w),
                None => Self::Whitening(nan_matrix(n, n)),
            },
            None => Self::Whitening(nan_matrix(n, n)),
        }
    }

    /// Representation tag character.
    pub fn tag(&self) -> char {
        match self {
            Self::Explicit(_) => 'C',
            Self::Whitening(_) => 'W',
            Self::UpperFactor(_) => 'U',
            Self::DiagonalWhitening(_) => 'w',
        }
    }

    /// The raw stored representation (a column for `'w'`).
    pub fn matrix(&self) -> DMat {
        match self {
            Self::Explicit(m) | Self::Whitening(m) | Self::UpperFactor(m) => m.clone(),
            Self::DiagonalWhitening(v) => DMat::from_column_slice(v.len(), 1, v.as_slice()),
        }
    }

    /// Apply the whitening transform to `a`.
    pub fn weigh(&self, a: &DMat) -> DMat {
        match self {
            Self::Whitening(k) => {
                assert_eq!(k.ncols(), a.nrows(), "whitening factor/block shape mismatch");
                k * a
            }
            Self::UpperFactor(k) => k
                .solve_upper_triangular(a)
                .unwrap_or_else(|| nan_matrix(a.nrows(), a.ncols())),
            Self::DiagonalWhitening(w) => {
                assert_eq!(w.len(), a.nrows(), "diagonal factor/block shape mismatch");
                let mut out = a.clone();
                for i in 0..out.nrows() {
                    for j in 0..out.ncols() {
                        out[(i, j)] *= w[i];
                    }
                }
                out
            }
            Self::Explicit(c) => match Cholesky::new(c.clone()) {
                Some(chol) => chol
                    .l()
                    .solve_lower_triangular(a)
                    .unwrap_or_else(|| nan_matrix(a.nrows(), a.ncols())),
                None => nan_matrix(a.nrows(), a.ncols()),
            },
        }
    }

    /// Apply the whitening transform to a column vector.
    pub fn weigh_vec(&self, v: &DVec) -> DVec {
        match self {
            Self::Whitening(k) => k * v,
            Self::UpperFactor(k) => k
                .solve_upper_triangular(v)
                .unwrap_or_else(|| nan_vector(v.len())),
            Self::DiagonalWhitening(w) => v.component_mul(w),
            Self::Explicit(c) => match Cholesky::new(c.clone()) {
                Some(chol) => chol
                    .l()
                    .solve_lower_triangular(v)
                    .unwrap_or_else(|| nan_vector(v.len())),
                None => nan_vector(v.len()),
            },
        }
    }

    /// The explicit covariance matrix this factor represents.
    pub fn explicit(&self) -> DMat {
        match self {
            Self::Explicit(c) => c.clone(),
            Self::Whitening(k) => {
                let gram = k.transpose() * k;
                let n = gram.nrows();
                gram.try_inverse().unwrap_or_else(|| nan_matrix(n, n))
            }
            Self::UpperFactor(k) => k * k.transpose(),
            Self::DiagonalWhitening(w) => {
                DMat::from_diagonal(&w.map(|wi| 1.0 / (wi * wi)))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn spd_matrix() -> DMat {
        // AᵀA + I is symmetric positive definite.
        let a = DMat::from_row_slice(3, 3, &[1.0, 2.0, 0.0, -1.0, 0.5, 1.0, 0.0, 1.0, 2.0]);
        a.transpose() * &a + DMat::identity(3, 3)
    }

    #[test]
    fn weigh_round_trips_through_the_inverse_factor() {
        let k = DMat::from_row_slice(2, 2, &[2.0, 1.0, 0.0, 3.0]);
        let a = DMat::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let forward = CovarianceFactor::Whitening(k.clone());
        let backward = CovarianceFactor::Whitening(k.try_inverse().unwrap());
        assert_abs_diff_eq!(backward.weigh(&forward.weigh(&a)), a, epsilon = 1e-12);
    }

    #[test]
    fn whitening_from_explicit_round_trips() {
        let e = spd_matrix();
        let w = CovarianceFactor::whitening_from_explicit(&e);
        assert_eq!(w.tag(), 'W');
        assert_abs_diff_eq!(w.explicit(), e, epsilon = 1e-10);
    }

    #[test]
    fn upper_factor_weigh_is_a_triangular_solve() {
        let u = DMat::from_row_slice(2, 2, &[2.0, 1.0, 0.0, 4.0]);
        let a = DMat::from_row_slice(2, 2, &[2.0, 0.0, 4.0, 8.0]);
        let f = CovarianceFactor::from_tag(u.clone(), 'U');
        assert_abs_diff_eq!(&u * f.weigh(&a), a, epsilon = 1e-12);
        // Represented covariance is U·Uᵀ: whitening it gives the identity.
        let c = f.explicit();
        let w = f.weigh(&c);
        let white = f.weigh(&w.transpose()).transpose();
        assert_abs_diff_eq!(white, DMat::identity(2, 2), epsilon = 1e-12);
    }

    #[test]
    fn diagonal_whitening_row_scales() {
        let f = CovarianceFactor::from_tag(DMat::from_column_slice(2, 1, &[2.0, 0.5]), 'w');
        assert_eq!(f.tag(), 'w');
        let a = DMat::from_row_slice(2, 2, &[1.0, 2.0, 4.0, 8.0]);
        let wa = f.weigh(&a);
        assert_abs_diff_eq!(wa[(0, 1)], 4.0);
        assert_abs_diff_eq!(wa[(1, 0)], 2.0);
        assert_abs_diff_eq!(f.explicit()[(0, 0)], 0.25);
        assert_abs_diff_eq!(f.explicit()[(1, 1)], 4.0);
    }

    #[test]
    fn explicit_weigh_whitens_through_cholesky() {
        let e = spd_matrix();
        let f = CovarianceFactor::Explicit(e.clone());
        // W·E·Wᵀ = I for the implied whitening W.
        let we = f.weigh(&e);
        let wewt = f.weigh(&we.transpose()).transpose();
        assert_abs_diff_eq!(wewt, DMat::identity(3, 3), epsilon = 1e-10);
        assert_abs_diff_eq!(f.explicit(), e, epsilon = 1e-12);
    }

    #[test]
    fn non_positive_definite_explicit_degrades_to_nan() {
        let bad = DMat::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -1.0]);
        let f = CovarianceFactor::Explicit(bad);
        assert!(f.weigh(&DMat::identity(2, 2)).iter().all(|x| x.is_nan()));
    }
}
