//! mpcg: mixed-precision CG and BlockCGrQ over an abstract field contract

pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod matrix;
pub mod solver;
pub mod utils;

// Re-exports for convenience
pub use crate::config::options::{BlockAggregate, ReliablePolicy, ResidualType, SolverOptions};
pub use crate::context::SolveContext;
pub use crate::core::traits::{Field, LinearMap, OverlapWorker, Precision};
pub use crate::core::wrappers::DenseField;
pub use crate::error::SolverError;
pub use crate::matrix::dense::DenseOperator;
pub use crate::matrix::herm::SquareMat;
pub use crate::solver::{BlockCgSolver, CgSolver};

// Re-export SolveStats at the crate root for convenience
pub use crate::utils::convergence::SolveStats;
