//! `sim` — scenario generation for the smoother drivers, tests and benches.
//!
//! # Module layout
//! - [`rotation`] — the fixed reference rotation scenario (pre-drawn
//!   Gaussian deviates, bit-compatible with the reference driver)
//! - [`linear`]   — seeded random linear Gaussian scenarios

pub mod linear;
pub mod rotation;

pub use linear::{LinearScenario, LinearScenarioConfig};
pub use rotation::RotationScenario;
