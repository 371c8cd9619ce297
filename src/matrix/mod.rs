//! Matrix types: the dense reference operator and the small host-side
//! complex matrices of the block solver.

pub mod dense;
pub mod herm;

pub use dense::DenseOperator;
pub use herm::SquareMat;
