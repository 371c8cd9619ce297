//! Convergence predicates, drift budgets, and solve statistics.

use crate::config::options::ResidualType;

/// Stopping thresholds for one solve (or one block column).
///
/// The predicates are pure: they carry no counters and may be evaluated any
/// number of times per iteration.
#[derive(Copy, Clone, Debug)]
pub struct ConvergenceCheck {
    /// L2 stopping threshold on `‖r‖²`, i.e. `tol²·‖b‖²`.
    pub stop: f64,
    /// Heavy-quark stopping threshold.
    pub tol_hq: f64,
    pub residual_type: ResidualType,
}

impl ConvergenceCheck {
    pub fn new(tol: f64, b2: f64, tol_hq: f64, residual_type: ResidualType) -> Self {
        Self { stop: tol * tol * b2, tol_hq, residual_type }
    }

    /// L2 criterion, true when L2 convergence is not requested.
    pub fn l2_converged(&self, r2: f64) -> bool {
        !self.residual_type.contains(ResidualType::L2) || r2 <= self.stop
    }

    /// Heavy-quark criterion, true when it is not requested.
    pub fn hq_converged(&self, hq_res: f64) -> bool {
        !self.residual_type.contains(ResidualType::HEAVY_QUARK) || hq_res <= self.tol_hq
    }

    pub fn converged(&self, r2: f64, hq_res: f64) -> bool {
        self.l2_converged(r2) && self.hq_converged(hq_res)
    }
}

/// Budget of tolerated true-residual growth events across reliable updates.
///
/// A growth event after a reliable update means the mixed-precision drift
/// has reached the resolution of the sloppy precision; a bounded number of
/// consecutive and cumulative events is tolerated before the solver gives
/// up (or falls back to the heavy-quark-only phase).
#[derive(Clone, Debug)]
pub struct DriftTracker {
    res_increase: u32,
    res_increase_total: u32,
    hq_res_increase: u32,
    max_res_increase: u32,
    max_res_increase_total: u32,
    hq_max_res_increase: u32,
}

impl DriftTracker {
    pub fn new(max_res_increase: u32, max_res_increase_total: u32) -> Self {
        Self {
            res_increase: 0,
            res_increase_total: 0,
            hq_res_increase: 0,
            max_res_increase,
            max_res_increase_total,
            // Zero would abort on the first heavy-quark wobble.
            hq_max_res_increase: max_res_increase + 1,
        }
    }

    /// Record a true-residual increase; returns true when the budget is
    /// exhausted.
    pub fn record_increase(&mut self) -> bool {
        self.res_increase += 1;
        self.res_increase_total += 1;
        self.res_increase > self.max_res_increase
            || self.res_increase_total > self.max_res_increase_total
    }

    /// A clean reliable update resets the consecutive counter.
    pub fn record_clean(&mut self) {
        self.res_increase = 0;
    }

    /// Record a heavy-quark residual increase; returns true when its
    /// budget is exhausted.
    pub fn record_hq_increase(&mut self) -> bool {
        self.hq_res_increase += 1;
        self.hq_res_increase > self.hq_max_res_increase
    }

    pub fn total_increases(&self) -> u32 {
        self.res_increase_total
    }
}

/// Statistics reported at the end of a solve.
#[derive(Clone, Debug, Default)]
pub struct SolveStats {
    pub iterations: usize,
    pub converged: bool,
    /// Wall-clock seconds spent in the iteration loop.
    pub secs: f64,
    /// Operator GFLOP count (not a rate) accumulated over the solve.
    pub gflops: f64,
    /// Relative true residual `‖b − A x‖/‖b‖`, when requested.
    pub true_res: f64,
    /// Heavy-quark true residual, when requested.
    pub true_res_hq: f64,
    /// Per-column true residuals (block mode).
    pub true_res_offset: Vec<f64>,
    /// Per-column heavy-quark true residuals (block mode).
    pub true_res_hq_offset: Vec<f64>,
    /// Number of reliable updates performed.
    pub reliable_updates: usize,
}
