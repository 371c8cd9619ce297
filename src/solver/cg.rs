//! Mixed-precision conjugate gradient with reliable updates.
//!
//! The inner loop runs in the sloppy precision with the Polak–Ribière
//! flavoured "alternative β" (`σ/r²_old` instead of `r²_new/r²_old`), which
//! is more stable under mixed precision. Periodically the iterated residual
//! is replaced by a freshly computed `b − A y` in the reference precision
//! (a reliable update), bounding the accumulated rounding drift. Two
//! trigger policies are implemented: the classical one based on residual
//! decrease since the last update, and an alternative one based on running
//! rounding-error bounds. An auxiliary heavy-quark residual can be tracked
//! alongside L2, with a restart fallback when L2 convergence stagnates.

use std::time::Instant;

use log::{debug, info, warn};

use crate::config::options::{ReliablePolicy, ResidualType, SolverOptions};
use crate::core::traits::{Field, LinearMap};
use crate::error::SolverError;
use crate::solver::workspace::CgWorkspace;
use crate::utils::convergence::{ConvergenceCheck, DriftTracker, SolveStats};

/// Reference-precision application `out ← A·input`. A missing `tmp3`
/// means the operator receives the shared sloppy scratch in its place.
fn high_apply<O: LinearMap>(
    op: &O,
    out: &mut O::Field,
    input: &O::Field,
    scratch: &mut O::Field,
    tmp3: Option<&mut O::Field>,
    tmp: &mut O::Field,
) {
    match tmp3 {
        Some(t3) => op.apply_with(out, input, scratch, t3),
        None => op.apply_with(out, input, scratch, tmp),
    }
}

/// Sloppy application; a missing `tmp2` means the operator gets only `tmp`.
fn sloppy_apply<O: LinearMap>(
    op: &O,
    out: &mut O::Field,
    input: &O::Field,
    tmp: &mut O::Field,
    tmp2: Option<&mut O::Field>,
) {
    match tmp2 {
        Some(t2) => op.apply_with(out, input, tmp, t2),
        None => op.apply(out, input, tmp),
    }
}

pub struct CgSolver<F: Field> {
    pub opts: SolverOptions,
    ws: Option<CgWorkspace<F>>,
}

impl<F: Field> CgSolver<F> {
    pub fn new(opts: SolverOptions) -> Self {
        Self { opts, ws: None }
    }

    /// Overwrite `x` with an approximate solution of `A x = b`; on entry
    /// `x` holds the initial guess.
    pub fn solve<O>(
        &mut self,
        mat: &O,
        mat_sloppy: &O,
        x: &mut F,
        b: &F,
    ) -> Result<SolveStats, SolverError>
    where
        O: LinearMap<Field = F>,
    {
        let opts = self.opts.clone();
        let alternative = opts.reliable_policy == ReliablePolicy::Alternative;
        let use_hq = opts.residual_type.contains(ResidualType::HEAVY_QUARK);

        let mut stats = SolveStats::default();

        let mut b2 = b.norm2();
        if b2 == 0.0 && !opts.compute_null_vector {
            warn!("CG: inverting on zero-field source");
            x.assign(b);
            stats.converged = true;
            return Ok(stats);
        }

        if self.ws.is_none() {
            self.ws = Some(CgWorkspace::new(x, &opts, mat.is_staggered()));
        }
        let CgWorkspace { r, y, ap, tmp, tmp2, tmp3, r_sloppy, x_sloppy, p } =
            self.ws.as_mut().unwrap();

        // Rounding-error bound state for the alternative reliable policy.
        let u = opts.precision_sloppy.unit_roundoff();
        let uhigh = opts.precision.unit_roundoff();
        let deps = u.sqrt();
        const DFAC: f64 = 1.1;
        let mut d = 0.0;
        let mut d_new = 0.0;
        let mut dinit = 0.0;
        let mut xnorm = 0.0;
        let mut pnorm = 0.0;
        let mut ppnorm = 0.0;
        let mut a_norm = 0.0;

        if alternative {
            // Operator-norm estimate from a single application on b.
            high_apply(mat, r, b, y, tmp3.as_mut(), tmp);
            a_norm = (r.norm2() / b2).sqrt();
        }

        // Initial residual r = b − A x.
        high_apply(mat, r, x, y, tmp3.as_mut(), tmp);
        let mut r2 = r.xmy_norm(b);
        if b2 == 0.0 {
            b2 = r2;
        }

        if let Some(rs) = r_sloppy.as_mut() {
            rs.assign(r);
        }
        p.assign(r_sloppy.as_ref().unwrap_or(&*r));
        if let Some(xs) = x_sloppy.as_mut() {
            y.assign(x);
            xs.set_zero();
        } else {
            y.set_zero();
        }

        let conv = ConvergenceCheck::new(opts.tol, b2, opts.tol_hq, opts.residual_type);

        let mut heavy_quark_res = if use_hq {
            F::heavy_quark_residual_norm(x, r).2.sqrt()
        } else {
            0.0
        };
        let mut heavy_quark_res_old = heavy_quark_res;
        let mut heavy_quark_restart = false;
        let heavy_quark_check = opts.heavy_quark_check.max(1);

        let mut alpha = 0.0f64;
        let mut p_ap;
        let mut r_update = 0usize;

        let mut r_norm = r2.sqrt();
        let mut r0_norm = r_norm;
        let mut maxrx = r_norm;
        let mut maxrr = r_norm;
        let mut delta = opts.delta;

        // In heavy-quark mode the L2 drift budget is spent immediately; the
        // heavy-quark budget is one event larger.
        let mut drift = DriftTracker::new(
            if use_hq { 0 } else { opts.max_res_increase },
            opts.max_res_increase_total,
        );
        let mut l2_breakdown = false;

        let mut k = 0usize;
        let mut steps_since_reliable = 1usize;

        debug!(
            "CG: {} iterations, <r,r> = {:e}, |r|/|b| = {:e}",
            k,
            r2,
            (r2 / b2).sqrt()
        );
        let mut converged = conv.converged(r2, heavy_quark_res);

        if alternative {
            dinit = uhigh * (r_norm + a_norm * xnorm);
            d = dinit;
        }

        let timer = Instant::now();

        while !converged && k < opts.maxiter {
            sloppy_apply(mat_sloppy, ap, p, tmp, tmp2.as_mut());

            let r2_old;
            let mut sigma;
            let mut breakdown = false;

            if opts.pipeline {
                let ap2;
                {
                    let rs: &F = r_sloppy.as_ref().unwrap_or(&*r);
                    if alternative {
                        let quad = F::quadruple_cg_reduction(rs, ap, p);
                        r2 = quad.0;
                        ap2 = quad.1;
                        p_ap = quad.2;
                        ppnorm = quad.3;
                    } else {
                        let triple = F::triple_cg_reduction(rs, ap, p);
                        r2 = triple.0;
                        ap2 = triple.1;
                        p_ap = triple.2;
                    }
                }
                r2_old = r2;
                alpha = r2 / p_ap;
                sigma = alpha * (alpha * ap2 - p_ap);
                if sigma < 0.0 || sigma.is_nan() || steps_since_reliable == 0 {
                    // The fused estimate broke down; fall back to the
                    // unfused residual update.
                    let rs = r_sloppy.as_mut().unwrap_or(&mut *r);
                    r2 = rs.axpy_norm(-alpha, ap);
                    sigma = r2;
                    breakdown = true;
                }
                r2 = sigma;
            } else {
                r2_old = r2;
                p_ap = p.dot_re(ap);
                if alternative {
                    ppnorm = p.norm2();
                }
                alpha = r2 / p_ap;

                // Alternative β numerator alongside the residual update.
                let rs = r_sloppy.as_mut().unwrap_or(&mut *r);
                let (new_r2, cross) = rs.axpy_cg_norm(-alpha, ap);
                r2 = new_r2;
                // Fall back to r² when ⟨r_new, r_new − r_old⟩ breaks down.
                sigma = if cross >= 0.0 { cross } else { r2 };
            }

            r_norm = r2.sqrt();
            let mut update_x;
            let update_r;
            if alternative {
                update_x = ((d <= deps * r2_old.sqrt()) || (DFAC * dinit > deps * r0_norm))
                    && (d_new > deps * r_norm)
                    && (d_new > DFAC * dinit);
                update_r = false;
            } else {
                if r_norm > maxrx {
                    maxrx = r_norm;
                }
                if r_norm > maxrr {
                    maxrr = r_norm;
                }
                update_x = r_norm < delta * r0_norm && r0_norm <= maxrx;
                update_r = (r_norm < delta * maxrr && r0_norm <= maxrr) || update_x;

                // Force a reliable update once inside the target tolerance,
                // so the accumulator reflects the true residual. The
                // alternative policy ignores the force.
                if conv.converged(r2, heavy_quark_res) && opts.delta >= opts.tol {
                    update_x = true;
                }
                if use_hq
                    && l2_breakdown
                    && conv.hq_converged(heavy_quark_res)
                    && opts.delta >= opts.tol
                {
                    update_x = true;
                }
            }

            if !(update_r || update_x) {
                let beta = sigma / r2_old;

                if opts.pipeline && !breakdown {
                    let rs = r_sloppy.as_mut().unwrap_or(&mut *r);
                    let xs = x_sloppy.as_mut().unwrap_or(&mut *x);
                    F::triple_cg_update(alpha, beta, ap, xs, rs, p);
                } else {
                    let xs = x_sloppy.as_mut().unwrap_or(&mut *x);
                    let rs: &F = r_sloppy.as_ref().unwrap_or(&*r);
                    F::axpy_zpbx(alpha, p, xs, rs, beta);
                }

                if use_hq && k % heavy_quark_check == 0 {
                    if let Some(xs) = x_sloppy.as_ref() {
                        tmp.assign(y);
                        let rs: &F = r_sloppy.as_ref().unwrap_or(&*r);
                        heavy_quark_res =
                            F::xpy_heavy_quark_residual_norm(xs, tmp, rs).2.sqrt();
                    } else {
                        if let Some(rs) = r_sloppy.as_ref() {
                            r.assign(rs);
                        }
                        heavy_quark_res = F::xpy_heavy_quark_residual_norm(x, y, r).2.sqrt();
                    }
                }

                if alternative {
                    d = d_new;
                    pnorm += alpha * alpha * ppnorm;
                    xnorm = pnorm.sqrt();
                    d_new = d + u * r_norm + uhigh * a_norm * xnorm;
                }
                steps_since_reliable += 1;
            } else {
                // Reliable update: flush the sloppy accumulator and replace
                // the residual in the reference precision.
                {
                    let xs = x_sloppy.as_mut().unwrap_or(&mut *x);
                    xs.axpy(alpha, p);
                }
                if let Some(xs) = x_sloppy.as_ref() {
                    x.assign(xs);
                }
                y.xpy(x);
                high_apply(mat, r, y, x, tmp3.as_mut(), tmp);
                r2 = r.xmy_norm(b);

                if let Some(rs) = r_sloppy.as_mut() {
                    rs.assign(r);
                }
                if let Some(xs) = x_sloppy.as_mut() {
                    xs.set_zero();
                } else {
                    x.set_zero();
                }

                if use_hq {
                    heavy_quark_res = F::heavy_quark_residual_norm(y, r).2.sqrt();
                }

                // Precision-limit check against the residual at the
                // previous reliable update.
                let new_r_norm = r2.sqrt();
                let mut exhausted = false;
                if new_r_norm > r0_norm && update_x {
                    if drift.record_increase() {
                        exhausted = true;
                    }
                    warn!(
                        "CG: new reliable residual norm {:e} is greater than previous reliable residual norm {:e} (total #inc {})",
                        new_r_norm,
                        r0_norm,
                        drift.total_increases()
                    );
                } else {
                    drift.record_clean();
                }
                if exhausted {
                    if use_hq {
                        l2_breakdown = true;
                    } else {
                        warn!("CG: solver exiting due to too many true residual norm increases");
                        break;
                    }
                }

                if alternative {
                    dinit = uhigh * (r2.sqrt() + a_norm * y.norm2().sqrt());
                    d = d_new;
                    xnorm = 0.0;
                    pnorm = 0.0;
                    d_new = dinit;
                    r0_norm = r2.sqrt();
                } else {
                    r_norm = r2.sqrt();
                    maxrr = r_norm;
                    maxrx = r_norm;
                    r0_norm = r_norm;
                }

                // Once L2 has broken down, chase the heavy-quark residual
                // without reliable updates.
                if use_hq && l2_breakdown {
                    delta = 0.0;
                    warn!("CG: restarting without reliable updates for heavy-quark residual");
                    heavy_quark_restart = true;
                    if heavy_quark_res > heavy_quark_res_old {
                        warn!(
                            "CG: new reliable HQ residual norm {:e} is greater than previous reliable residual norm {:e}",
                            heavy_quark_res, heavy_quark_res_old
                        );
                        if drift.record_hq_increase() {
                            warn!(
                                "CG: solver exiting due to too many heavy quark residual norm increases"
                            );
                            break;
                        }
                    }
                }

                if use_hq && heavy_quark_restart {
                    p.assign(r_sloppy.as_ref().unwrap_or(&*r));
                    heavy_quark_restart = false;
                } else {
                    // Explicitly restore the orthogonality of the gradient
                    // vector before re-forming the direction.
                    let rs: &F = r_sloppy.as_ref().unwrap_or(&*r);
                    let rp = rs.dot_c(p) / r2;
                    p.caxpy(-rp, rs);
                    let beta = r2 / r2_old;
                    p.xpay(rs, beta);
                }

                steps_since_reliable = 0;
                r_update += 1;
                heavy_quark_res_old = heavy_quark_res;
            }

            k += 1;
            debug!(
                "CG: {} iterations, <r,r> = {:e}, |r|/|b| = {:e}",
                k,
                r2,
                (r2 / b2).sqrt()
            );

            converged = conv.converged(r2, heavy_quark_res);
            if use_hq {
                // L2 done, or its precision is maxed out; the HQ residual
                // must additionally come from a recent reliable update.
                let l2_done = l2_breakdown || conv.l2_converged(r2);
                let hq_done = (steps_since_reliable == 0 && opts.delta > 0.0)
                    && conv.hq_converged(heavy_quark_res);
                converged = l2_done && hq_done;
            }
        }

        if let Some(xs) = x_sloppy.as_ref() {
            x.assign(xs);
        }
        x.xpy(y);

        stats.secs = timer.elapsed().as_secs_f64();
        stats.gflops = (mat.flops() + mat_sloppy.flops()) as f64 * 1e-9;
        stats.iterations = k;
        stats.converged = converged;
        stats.reliable_updates = r_update;

        if k == opts.maxiter {
            warn!("CG: exceeded maximum iterations {}", opts.maxiter);
        }
        debug!("CG: reliable updates = {}", r_update);

        if opts.compute_true_res {
            high_apply(mat, r, x, y, tmp3.as_mut(), tmp);
            let true_r2 = r.xmy_norm(b);
            stats.true_res = (true_r2 / b2).sqrt();
            stats.true_res_hq = F::heavy_quark_residual_norm(x, r).2.sqrt();
        }

        info!(
            "CG: convergence in {} iterations, {:.6} seconds, GFLOPS = {:.3}, reliable updates = {}",
            k,
            stats.secs,
            if stats.secs > 0.0 { stats.gflops / stats.secs } else { 0.0 },
            r_update
        );

        Ok(stats)
    }
}
