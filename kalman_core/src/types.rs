//! Fundamental types shared across the crate.

use nalgebra::{DMatrix, DVector};

// ---------------------------------------------------------------------------
// Scalar type: f64 throughout for numerical precision.
// ---------------------------------------------------------------------------

/// Generic dynamic-size matrix (evolution, observation and factor blocks).
pub type DMat = DMatrix<f64>;

/// Generic dynamic-size column vector (states, right-hand sides).
pub type DVec = DVector<f64>;

/// Logical step index. Steps are numbered from 0; negative values select a
/// default (`-1` means "latest" for reads and "all but last" for `forget`).
pub type StepIndex = i64;

/// Smoother/filter engine selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    /// Sequential Paige–Saunders engine over a block-bidiagonal QR factor.
    Ultimate,
    /// Covariance-form Kalman filter with a Rauch–Tung–Striebel smoother.
    Conventional,
    /// Associative-element smoother with an odd-even scan schedule.
    OddEven,
    /// Associative-element smoother with a blocked parallel scan.
    Associative,
}
