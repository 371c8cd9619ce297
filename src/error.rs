use thiserror::Error;

// Unified error type for mpcg.
//
// Only usage errors and unrecoverable numerical breakdowns surface here.
// Soft failures (iteration cap, exhausted drift budget) are reported through
// `SolveStats` with `converged == false` and a `log::warn!` record.

#[derive(Error, Debug)]
pub enum SolverError {
    #[error("unsupported number of right-hand sides: {0}")]
    UnsupportedBlockSize(usize),
    #[error("zero right-hand side in block column {0}; undefined for the block solver")]
    ZeroSourceBlock(usize),
    #[error("numerical breakdown: {0}")]
    NumericalBreakdown(String),
    #[error("{0} not supported in the block solver")]
    UnsupportedInBlock(&'static str),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
}
