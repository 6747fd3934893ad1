//! Frequency stability statistics.

pub mod adev;
pub mod edf;

pub use adev::{allan_deviation, AdevCurve, AdevPoint, LogPoint, TauGrid};
