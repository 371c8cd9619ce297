//! Core contracts and their reference implementations.

pub mod traits;
pub mod wrappers;

pub use traits::{Field, LinearMap, OverlapWorker, Precision};
pub use wrappers::DenseField;
