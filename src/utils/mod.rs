//! Convergence tracking and solve statistics.

pub mod convergence;

pub use convergence::{ConvergenceCheck, DriftTracker, SolveStats};
