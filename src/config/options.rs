//! Solver options for the mixed-precision CG cores.
//!
//! This module provides the `SolverOptions` struct, which collects the
//! recognized parameters of the single-RHS and block solvers: stopping
//! tolerances, the reliable-update threshold and drift budgets, precision
//! tags for the reference and sloppy operators, and the block-solver
//! tunables. Two compile-time switches of the original solver are exposed
//! as configuration enumerations instead: the reliable-update policy
//! (classical vs. alternative) and the block residual aggregation
//! (min vs. max).

use bitflags::bitflags;

use crate::core::traits::Precision;

bitflags! {
    /// Which residuals must converge for the solve to be declared done.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct ResidualType: u32 {
        /// Relative L2 residual, `‖b − A x‖² ≤ tol²·‖b‖²`.
        const L2 = 0b01;
        /// Heavy-quark residual against `tol_hq`.
        const HEAVY_QUARK = 0b10;
    }
}

/// Reliable-update trigger policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReliablePolicy {
    /// Trigger on decrease of the iterated residual past `delta` relative
    /// to the residual at the last update (`maxrx`/`maxrr` bookkeeping).
    Classical,
    /// Trigger on the accumulated rounding-error bound estimators
    /// `d`/`d_new`/`dinit` built from the machine epsilons of the two
    /// precisions and an operator-norm estimate.
    Alternative,
}

/// Aggregation of per-column residual norms for the block reliable-update
/// test.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockAggregate {
    /// Smallest column residual: update as soon as any column gets small.
    Min,
    /// Largest column residual: update only when every column is small,
    /// consistent with the stopping condition.
    Max,
}

/// Parameters recognized by the solver cores.
#[derive(Clone, Debug)]
pub struct SolverOptions {
    /// L2 stopping tolerance, relative to `‖b‖`.
    pub tol: f64,
    /// Heavy-quark residual stopping tolerance.
    pub tol_hq: f64,
    /// Which residuals must converge.
    pub residual_type: ResidualType,
    /// Iteration cap. Reaching it is a warning, not an error.
    pub maxiter: usize,
    /// Reliable-update trigger threshold, `0 ≤ delta ≤ 1`; `0` disables
    /// reliable updates.
    pub delta: f64,
    /// Tolerated consecutive true-residual growth events before abort.
    pub max_res_increase: u32,
    /// Tolerated cumulative true-residual growth events before abort.
    pub max_res_increase_total: u32,
    /// Precision of the reference operator and the outer fields.
    pub precision: Precision,
    /// Working precision of the inner loop.
    pub precision_sloppy: Precision,
    /// When true, `x_sloppy` is a separate sloppy accumulator; when false
    /// it aliases `x`.
    pub use_sloppy_partial_accumulator: bool,
    /// Fuse the `pAp` reduction with `‖r‖²` and `‖Ap‖²` (single-RHS path).
    pub pipeline: bool,
    /// Recompute `b − A x` in reference precision after the solve and
    /// report it in the stats.
    pub compute_true_res: bool,
    /// Proceed on a zero right-hand side instead of returning `x = b`
    /// (null-vector computation).
    pub compute_null_vector: bool,
    /// Number of right-hand sides; `1` selects the single-RHS core.
    pub num_src: usize,
    /// How often (in iterations) to recompute the heavy-quark residual.
    pub heavy_quark_check: usize,
    /// Reliable-update trigger policy.
    pub reliable_policy: ReliablePolicy,
    /// Block-mode residual aggregation for the reliable-update test.
    pub block_aggregate: BlockAggregate,
    /// Explicitly re-Hermitize `pAp ← ½(pAp + pAp*)` every block step.
    pub hermitize_pap: bool,
    /// Explicitly restore `Q* P = I` after a block reliable update.
    pub reorthogonalize_qp: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            tol: 1e-8,
            tol_hq: 1e-3,
            residual_type: ResidualType::L2,
            maxiter: 10_000,
            delta: 0.1,
            max_res_increase: 1,
            max_res_increase_total: 10,
            precision: Precision::Double,
            precision_sloppy: Precision::Double,
            use_sloppy_partial_accumulator: false,
            pipeline: false,
            compute_true_res: true,
            compute_null_vector: false,
            num_src: 1,
            heavy_quark_check: 10,
            reliable_policy: ReliablePolicy::Classical,
            block_aggregate: BlockAggregate::Max,
            hermitize_pap: false,
            reorthogonalize_qp: false,
        }
    }
}
