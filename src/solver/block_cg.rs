//! BlockCGrQ: block conjugate gradient with orthonormalized residuals.
//!
//! Solves `A X = B` for several right-hand sides at once. The residual
//! block is kept in thin-QR form `R = Q C` with `Q` orthonormal and `C`
//! upper triangular: every step re-orthonormalizes `Q` through a Cholesky
//! factorization of its Gram matrix and accumulates the triangular factor
//! into `C`, which is substantially more stable than naïve block CG. The
//! reliable-update machinery of the single-RHS solver carries over in
//! matrix form, and the `X ← X + P α` update of a non-reliable iteration is
//! deferred and overlapped with the next operator application through the
//! operator's compute-overlap callback.

use std::time::Instant;

use log::{debug, info, warn};
use num_complex::Complex64;

use crate::config::options::{BlockAggregate, ResidualType, SolverOptions};
use crate::core::traits::{Field, LinearMap, OverlapWorker};
use crate::error::SolverError;
use crate::matrix::herm::SquareMat;
use crate::solver::workspace::BlockWorkspace;
use crate::utils::convergence::{ConvergenceCheck, SolveStats};

/// Deferred `X ← X + P α` update, partitioned over the columns of `P` into
/// `n_update` slices so that each slice fits in one of the operator's
/// comms/compute overlap windows. The coefficient matrix does not need any
/// reshuffling because the partition runs over its rows.
struct BlockCgUpdate<'a, F: Field> {
    x_sloppy: &'a mut [F],
    p: &'a [F],
    alpha: &'a SquareMat,
    n_rhs: usize,
    n_update: usize,
    count: usize,
}

impl<'a, F: Field> BlockCgUpdate<'a, F> {
    fn new(x_sloppy: &'a mut [F], p: &'a [F], alpha: &'a SquareMat, n_update: usize) -> Self {
        let n_rhs = p.len();
        Self { x_sloppy, p, alpha, n_rhs, n_update, count: 0 }
    }
}

impl<F: Field> OverlapWorker for BlockCgUpdate<'_, F> {
    fn apply(&mut self) {
        let per_apply = self.n_rhs / self.n_update;
        let leftover = self.n_rhs - self.n_update * per_apply;

        if (self.count != self.n_update - 1 && per_apply != 0) || leftover == 0 {
            let lo = self.count * per_apply;
            F::block_caxpy_rows(self.alpha, &self.p[lo..lo + per_apply], self.x_sloppy, lo);
        } else if self.count == self.n_update - 1 {
            // Leftover columns ride along with the final slice.
            let lo = self.count * per_apply;
            F::block_caxpy_rows(self.alpha, &self.p[lo..], self.x_sloppy, lo);
        }

        self.count += 1;
        if self.count == self.n_update {
            self.count = 0;
        }
    }
}

/// Run `f` on the sloppy accumulator block, which is either a saved buffer
/// or the caller's `x` when the two alias.
fn with_accumulator<F: Field>(
    saved: &mut Option<Vec<F>>,
    x: &mut [F],
    f: impl FnOnce(&mut [F]),
) {
    match saved.as_mut() {
        Some(v) => f(v),
        None => f(x),
    }
}

fn high_block_apply<O: LinearMap>(
    op: &O,
    out: &mut [O::Field],
    input: &[O::Field],
    tmp3: Option<&mut O::Field>,
    tmp_op: &mut O::Field,
) {
    match tmp3 {
        Some(t3) => op.apply_block(out, input, t3, None, None),
        None => op.apply_block(out, input, tmp_op, None, None),
    }
}

pub struct BlockCgSolver<F: Field> {
    pub opts: SolverOptions,
    ws: Option<BlockWorkspace<F>>,
}

impl<F: Field> BlockCgSolver<F> {
    pub fn new(opts: SolverOptions) -> Self {
        Self { opts, ws: None }
    }

    /// Overwrite the columns of `x` with an approximate solution of
    /// `A X = B`; on entry `x` holds the initial guesses.
    pub fn solve<O>(
        &mut self,
        mat: &O,
        mat_sloppy: &O,
        x: &mut [F],
        b: &[F],
    ) -> Result<SolveStats, SolverError>
    where
        O: LinearMap<Field = F>,
    {
        let opts = self.opts.clone();
        let n = x.len();
        if n == 0 || n != b.len() {
            return Err(SolverError::ShapeMismatch(format!(
                "{} solution columns against {} right-hand sides",
                n,
                b.len()
            )));
        }
        if opts.residual_type.contains(ResidualType::HEAVY_QUARK) {
            return Err(SolverError::UnsupportedInBlock("heavy-quark residual"));
        }

        let mut stats = SolveStats::default();

        let mut b2 = vec![0.0f64; n];
        let mut b2avg = 0.0;
        for i in 0..n {
            b2[i] = b[i].norm2();
            b2avg += b2[i];
            if b2[i] == 0.0 {
                return Err(SolverError::ZeroSourceBlock(i));
            }
        }
        b2avg /= n as f64;

        if self.ws.is_none() {
            self.ws = Some(BlockWorkspace::new(x, &opts, mat.is_staggered()));
        }
        let BlockWorkspace { r, y, x_sloppy_saved, p, q, ap, tmp, tmp_op, tmp2, tmp3 } =
            self.ws.as_mut().unwrap();

        // R = B − A X, Y = X, zero the sloppy accumulator. When the
        // accumulator aliases x, the initial guess has just been saved
        // into Y, so zeroing x is safe.
        high_block_apply(mat, r, x, tmp3.as_mut(), tmp_op);
        for (ri, bi) in r.iter_mut().zip(b) {
            ri.xpay(bi, -1.0);
        }
        for (yi, xi) in y.iter_mut().zip(x.iter()) {
            yi.assign(xi);
        }
        with_accumulator(x_sloppy_saved, &mut *x, |xs| {
            for f in xs.iter_mut() {
                f.set_zero();
            }
        });

        let mut h = SquareMat::zeros(n);
        let mut pap = SquareMat::zeros(n);
        let mut alpha = SquareMat::zeros(n);
        let mut c = SquareMat::zeros(n);
        let mut c_old;
        let mut s;
        let mut linv;

        // H = R† R.
        F::h_dot_product(&mut h, &r[..], &r[..]);
        let mut r2avg = 0.0;
        for i in 0..n {
            r2avg += h[(i, i)].re;
            debug!("Block-CG: r2[{}] = {:e}", i, h[(i, i)].re);
        }

        let checks: Vec<ConvergenceCheck> = b2
            .iter()
            .map(|&b2i| ConvergenceCheck::new(opts.tol, b2i, opts.tol_hq, opts.residual_type))
            .collect();

        let aggregate_seed = match opts.block_aggregate {
            BlockAggregate::Min => f64::INFINITY,
            BlockAggregate::Max => 0.0,
        };
        let fold = |acc: f64, v: f64| match opts.block_aggregate {
            BlockAggregate::Min => acc.min(v),
            BlockAggregate::Max => acc.max(v),
        };

        debug!(
            "Block-CG: {} iterations, <r,r> = {:e}, |r|/|b| = {:e}",
            0,
            r2avg / n as f64,
            (r2avg / (n as f64 * b2avg)).sqrt()
        );

        let mut converged_cols = vec![false; n];
        let mut allconverged = true;
        let mut r_norm = aggregate_seed;
        for i in 0..n {
            converged_cols[i] = checks[i].converged(h[(i, i)].re, 0.0);
            allconverged = allconverged && converged_cols[i];
            r_norm = fold(r_norm, h[(i, i)].re.sqrt());
        }
        let mut maxrx = r_norm;
        let mut maxrr = r_norm;
        let delta = opts.delta;
        debug!("Block-CG: reliable update delta = {delta:.8}");

        let mut r_update = 0usize;
        let mut k = 0usize;
        let mut just_reliable_updated = false;

        let timer = Instant::now();

        if !allconverged {
            // Cholesky H = L L†; C = L†; Q = R C⁻¹ is the thin QR of R.
            let l = h.cholesky_lower()?;
            c = l.adjoint();
            linv = c.inverse()?;
            for qi in q.iter_mut() {
                qi.set_zero();
            }
            // R is outer precision, Q sloppy; stage through the sloppy
            // temporary before the triangular caxpy.
            for (ti, ri) in tmp.iter_mut().zip(r.iter()) {
                ti.assign(ri);
            }
            F::block_caxpy_upper(&linv, &tmp[..], &mut q[..]);
            // P = Q; S starts as the identity.
            for (pi, qi) in p.iter_mut().zip(q.iter()) {
                pi.assign(qi);
            }

            while !allconverged && k < opts.maxiter {
                // Ap = A P. Except on the first iteration and right after
                // a reliable update, the previous iteration's X update
                // rides in the operator's overlap windows; `tmp` still
                // holds the P it was computed against.
                {
                    let use_worker = k > 0 && !just_reliable_updated;
                    just_reliable_updated = false;
                    if use_worker {
                        let mut fire = |xs: &mut [F]| {
                            let mut worker = BlockCgUpdate::new(
                                xs,
                                &tmp[..],
                                &alpha,
                                mat_sloppy.overlap_slices(),
                            );
                            mat_sloppy.apply_block(
                                &mut ap[..],
                                &p[..],
                                tmp_op,
                                tmp2.as_mut(),
                                Some(&mut worker),
                            );
                        };
                        match x_sloppy_saved.as_mut() {
                            Some(v) => fire(v),
                            None => fire(&mut *x),
                        }
                    } else {
                        mat_sloppy.apply_block(&mut ap[..], &p[..], tmp_op, tmp2.as_mut(), None);
                    }
                }

                // pAp = P† A P.
                F::h_dot_product_anorm(&mut pap, &p[..], &ap[..]);
                if opts.hermitize_pap {
                    pap.hermitize();
                }

                // β = −pAp⁻¹; α = −β C. The minus sign on β is bookkeeping
                // so the Q update below is a plain caxpy.
                let beta = -&pap.inverse()?;
                alpha = -&(&beta * &c);

                // Q ← Q + Ap β.
                F::block_caxpy(&beta, &ap[..], &mut q[..]);

                // Re-orthonormalize Q through a thin QR: H = Q†Q = L L†,
                // S = L†, Q ← Q S⁻¹ (triangular caxpy into the temporary,
                // then a buffer swap).
                F::h_dot_product(&mut h, &q[..], &q[..]);
                let l = h.cholesky_lower()?;
                s = l.adjoint();
                linv = s.inverse()?;
                for ti in tmp.iter_mut() {
                    ti.set_zero();
                }
                F::block_caxpy_upper(&linv, &q[..], &mut tmp[..]);
                std::mem::swap(q, tmp); // tmp now holds the pre-update Q

                // C accumulates the triangular factors; keep the previous
                // value for a possible reliable update.
                c_old = c.clone();
                c = &s * &c;

                // Per-column residual norms are the squared column norms
                // of C; the aggregate drives the reliable-update test.
                let mut r2 = aggregate_seed;
                r2avg = 0.0;
                for j in 0..n {
                    let cj = c.col_norm2(j);
                    h[(j, j)] = Complex64::new(cj, 0.0);
                    r2avg += cj;
                    r2 = fold(r2, cj);
                }

                r_norm = r2.sqrt();
                if r_norm > maxrx {
                    maxrx = r_norm;
                }
                if r_norm > maxrr {
                    maxrr = r_norm;
                }
                let did_reliable = r_norm < delta * maxrr;

                if did_reliable {
                    debug!("Block-CG: triggered a reliable update on iteration {k}");

                    // The deferred X update has to happen now, before P is
                    // rebuilt from the replaced residuals.
                    with_accumulator(x_sloppy_saved, &mut *x, |xs| {
                        F::block_caxpy(&alpha, &p[..], xs);
                    });
                    match x_sloppy_saved.as_mut() {
                        Some(v) => {
                            for (yi, xsi) in y.iter_mut().zip(v.iter()) {
                                yi.xpy(xsi);
                            }
                        }
                        None => {
                            for (yi, xsi) in y.iter_mut().zip(x.iter()) {
                                yi.xpy(xsi);
                            }
                        }
                    }

                    // R = B − A Y in reference precision.
                    high_block_apply(mat, r, y, tmp3.as_mut(), tmp_op);
                    for (ri, bi) in r.iter_mut().zip(b) {
                        ri.xpay(bi, -1.0);
                    }
                    with_accumulator(x_sloppy_saved, &mut *x, |xs| {
                        for f in xs.iter_mut() {
                            f.set_zero();
                        }
                    });

                    // Rebuild H, C, and Q from the replaced residuals.
                    F::h_dot_product(&mut h, &r[..], &r[..]);
                    r2avg = 0.0;
                    for i in 0..n {
                        r2avg += h[(i, i)].re;
                        debug!("Block-CG: r2[{}] = {:e}", i, h[(i, i)].re);
                    }
                    let l = h.cholesky_lower()?;
                    c = l.adjoint();
                    linv = c.inverse()?;
                    for qi in q.iter_mut() {
                        qi.set_zero();
                    }
                    for (ti, ri) in tmp.iter_mut().zip(r.iter()) {
                        ti.assign(ri);
                    }
                    F::block_caxpy_upper(&linv, &tmp[..], &mut q[..]);

                    // S = C C_old⁻¹ restores the recurrence for P.
                    s = &c * &c_old.inverse()?;

                    r_norm = aggregate_seed;
                    allconverged = true;
                    for i in 0..n {
                        converged_cols[i] = checks[i].converged(h[(i, i)].re, 0.0);
                        allconverged = allconverged && converged_cols[i];
                        r_norm = fold(r_norm, h[(i, i)].re.sqrt());
                    }
                    maxrx = r_norm;
                    maxrr = r_norm;
                    r_update += 1;
                    just_reliable_updated = true;
                }

                // P ← Q + P S† (lower-triangular caxpyz into the
                // temporary, then a buffer swap; tmp keeps the previous P
                // for the deferred X update).
                let sdagger = s.adjoint();
                F::block_caxpyz_lower(&sdagger, &p[..], &q[..], &mut tmp[..]);
                std::mem::swap(p, tmp);

                if opts.reorthogonalize_qp && did_reliable {
                    // Explicitly restore Q† P = I.
                    let mut o = SquareMat::zeros(n);
                    F::c_dot_product_block(&mut o, &q[..], &p[..]);
                    let o = &SquareMat::identity(n) + &(-&o);
                    F::block_caxpy(&o, &q[..], &mut p[..]);
                }

                k += 1;
                debug!(
                    "Block-CG: {} iterations, <r,r> = {:e}, |r|/|b| = {:e}",
                    k,
                    r2avg / n as f64,
                    (r2avg / (n as f64 * b2avg)).sqrt()
                );

                // H carries the right diagonal whether or not a reliable
                // update was triggered.
                allconverged = true;
                for i in 0..n {
                    converged_cols[i] = checks[i].converged(h[(i, i)].re, 0.0);
                    allconverged = allconverged && converged_cols[i];
                }
            }
        }

        // The overlapped X update trails the iteration by one step; on
        // exit without a trailing reliable update it is still pending,
        // against the saved previous P.
        if !just_reliable_updated {
            with_accumulator(x_sloppy_saved, &mut *x, |xs| {
                F::block_caxpy(&alpha, &tmp[..], xs);
            });
        }
        match x_sloppy_saved.as_mut() {
            Some(v) => {
                for (yi, xsi) in y.iter_mut().zip(v.iter()) {
                    yi.xpy(xsi);
                }
            }
            None => {
                for (yi, xsi) in y.iter_mut().zip(x.iter()) {
                    yi.xpy(xsi);
                }
            }
        }
        for (xi, yi) in x.iter_mut().zip(y.iter()) {
            xi.assign(yi);
        }

        stats.secs = timer.elapsed().as_secs_f64();
        stats.gflops = (mat.flops() + mat_sloppy.flops()) as f64 * 1e-9;
        stats.iterations = k;
        stats.converged = allconverged;
        stats.reliable_updates = r_update;

        if k == opts.maxiter {
            warn!("Block-CG: exceeded maximum iterations {}", opts.maxiter);
        }
        debug!("Block-CG: reliable updates = {r_update}");

        if opts.compute_true_res {
            high_block_apply(mat, r, x, tmp3.as_mut(), tmp_op);
            stats.true_res_offset = Vec::with_capacity(n);
            stats.true_res_hq_offset = Vec::with_capacity(n);
            for i in 0..n {
                let true_r2 = r[i].xmy_norm(&b[i]);
                let true_res = (true_r2 / b2[i]).sqrt();
                let true_res_hq = F::heavy_quark_residual_norm(&x[i], &r[i]).2.sqrt();
                stats.true_res = true_res;
                stats.true_res_hq = true_res_hq;
                stats.true_res_offset.push(true_res);
                stats.true_res_hq_offset.push(true_res_hq);
            }
        }

        for i in 0..n {
            info!(
                "Block-CG {}: convergence in {} iterations, relative residual <r,r>/<b,b> = {:e}",
                i,
                k,
                h[(i, i)].re / b2[i]
            );
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::Precision;
    use crate::core::wrappers::DenseField;
    use crate::matrix::dense::DenseOperator;

    #[test]
    fn residual_block_stays_orthonormal() {
        let n = 12;
        let a = faer::Mat::from_fn(n, n, |i, j| {
            if i == j {
                2.0 + i as f64
            } else if i.abs_diff(j) == 1 {
                0.5
            } else {
                0.0
            }
        });
        let mat = DenseOperator::new(a.clone(), Precision::Double);
        let mat_sloppy = DenseOperator::new(a, Precision::Double);
        let b: Vec<DenseField> = (0..3)
            .map(|c| {
                DenseField::from_real(
                    &(0..n).map(|i| ((i + 2 * c + 1) as f64).sin()).collect::<Vec<_>>(),
                    Precision::Double,
                )
            })
            .collect();
        let mut x: Vec<DenseField> =
            b.iter().map(|_| DenseField::new(n, Precision::Double)).collect();
        let opts =
            SolverOptions { num_src: 3, tol: 1e-10, delta: 0.2, ..SolverOptions::default() };
        let mut solver = BlockCgSolver::new(opts);
        let stats = solver.solve(&mat, &mat_sloppy, &mut x, &b).unwrap();
        assert!(stats.converged);

        let ws = solver.ws.as_ref().unwrap();
        let mut gram = SquareMat::zeros(3);
        DenseField::h_dot_product(&mut gram, &ws.q[..], &ws.q[..]);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (gram[(i, j)].re - expected).abs() < 1e-12
                        && gram[(i, j)].im.abs() < 1e-12,
                    "Q* Q deviates at ({i},{j}): {:?}",
                    gram[(i, j)]
                );
            }
        }
    }
}
