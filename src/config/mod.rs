//! Solver configuration.

pub mod options;

pub use options::{BlockAggregate, ReliablePolicy, ResidualType, SolverOptions};
