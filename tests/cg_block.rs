//! End-to-end tests for the BlockCGrQ multi-RHS core.

use approx::assert_abs_diff_eq;
use faer::Mat;
use mpcg::{
    BlockAggregate, BlockCgSolver, CgSolver, DenseField, DenseOperator, Field, Precision,
    SolverError, SolverOptions,
};
use rand::Rng;

fn random_spd(n: usize) -> Mat<f64> {
    let mut rng = rand::thread_rng();
    let data: Vec<f64> = (0..n * n).map(|_| rng.r#gen()).collect();
    let m = Mat::from_fn(n, n, |i, j| data[j * n + i]);
    let m_t = m.transpose();
    &m_t * &m + Mat::<f64>::identity(n, n)
}

fn random_unit_field(n: usize, precision: Precision) -> DenseField {
    let mut rng = rand::thread_rng();
    let mut v: Vec<f64> = (0..n).map(|_| rng.r#gen::<f64>() - 0.5).collect();
    let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    for x in &mut v {
        *x /= norm;
    }
    DenseField::from_real(&v, precision)
}

fn block_solve(
    a: &Mat<f64>,
    b: &[DenseField],
    opts: SolverOptions,
) -> (Vec<DenseField>, Result<mpcg::SolveStats, SolverError>) {
    let mat = DenseOperator::new(a.clone(), opts.precision);
    let mat_sloppy = DenseOperator::new(a.clone(), opts.precision_sloppy);
    let mut x: Vec<DenseField> =
        b.iter().map(|c| DenseField::new(c.len(), opts.precision)).collect();
    let mut solver = BlockCgSolver::new(opts);
    let result = solver.solve(&mat, &mat_sloppy, &mut x, b);
    (x, result)
}

#[test]
fn four_sources_on_diagonal_spectrum() {
    // diag(1..16) with four random unit sources: the block Krylov space
    // covers the spectrum in well under the single-RHS iteration count.
    let n = 16;
    let a = Mat::from_fn(n, n, |i, j| if i == j { (i + 1) as f64 } else { 0.0 });
    let b: Vec<DenseField> = (0..4).map(|_| random_unit_field(n, Precision::Double)).collect();
    let opts = SolverOptions { num_src: 4, tol: 1e-10, delta: 0.0, ..SolverOptions::default() };
    let (_, result) = block_solve(&a, &b, opts);
    let stats = result.unwrap();
    assert!(stats.converged);
    assert!(stats.iterations <= 16, "took {} iterations", stats.iterations);
    for (i, res) in stats.true_res_offset.iter().enumerate() {
        assert!(*res <= 1e-10, "column {i} residual {res:e}");
    }
}

#[test]
fn block_matches_single_rhs_solutions() {
    let n = 24;
    let a = random_spd(n);
    let b: Vec<DenseField> = (0..2).map(|_| random_unit_field(n, Precision::Double)).collect();

    let opts = SolverOptions { num_src: 2, tol: 1e-10, delta: 0.0, ..SolverOptions::default() };
    let (x_block, result) = block_solve(&a, &b, opts);
    assert!(result.unwrap().converged);

    let single_opts = SolverOptions { tol: 1e-10, delta: 0.0, ..SolverOptions::default() };
    let mat = DenseOperator::new(a.clone(), Precision::Double);
    let mat_sloppy = DenseOperator::new(a.clone(), Precision::Double);
    for (bi, xb) in b.iter().zip(x_block.iter()) {
        let mut x = DenseField::new(n, Precision::Double);
        let mut solver = CgSolver::new(single_opts.clone());
        let stats = solver.solve(&mat, &mat_sloppy, &mut x, bi).unwrap();
        assert!(stats.converged);
        for (zs, zb) in x.components().iter().zip(xb.components()) {
            assert_abs_diff_eq!(zs.re, zb.re, epsilon = 1e-7);
            assert_abs_diff_eq!(zs.im, zb.im, epsilon = 1e-7);
        }
    }
}

#[test]
fn identical_sources_detect_rank_deficiency() {
    // Two identical right-hand sides make the residual Gram matrix exactly
    // rank one; the Cholesky step must report it instead of dividing by
    // zero.
    let n = 16;
    let a = random_spd(n);
    let b0 = random_unit_field(n, Precision::Double);
    let b = vec![b0.clone(), b0];
    let opts = SolverOptions { num_src: 2, tol: 1e-10, ..SolverOptions::default() };
    let (_, result) = block_solve(&a, &b, opts);
    match result {
        Err(SolverError::NumericalBreakdown(_)) => {}
        Ok(stats) => assert!(stats.converged, "must converge if it completes"),
        Err(e) => panic!("unexpected error: {e}"),
    }
}

#[test]
fn zero_source_column_is_fatal() {
    let n = 8;
    let a = random_spd(n);
    let b = vec![random_unit_field(n, Precision::Double), DenseField::new(n, Precision::Double)];
    let opts = SolverOptions { num_src: 2, ..SolverOptions::default() };
    let (_, result) = block_solve(&a, &b, opts);
    assert!(matches!(result, Err(SolverError::ZeroSourceBlock(1))));
}

#[test]
fn mixed_precision_block_with_reliable_updates() {
    let n = 64;
    let a = random_spd(n);
    let b: Vec<DenseField> = (0..4).map(|_| random_unit_field(n, Precision::Double)).collect();
    let opts = SolverOptions {
        num_src: 4,
        tol: 1e-8,
        delta: 0.1,
        precision: Precision::Double,
        precision_sloppy: Precision::Single,
        use_sloppy_partial_accumulator: true,
        ..SolverOptions::default()
    };
    let (_, result) = block_solve(&a, &b, opts);
    let stats = result.unwrap();
    assert!(stats.converged);
    assert!(stats.reliable_updates >= 1);
    for res in &stats.true_res_offset {
        assert!(*res <= 1.01e-8, "residual {res:e}");
    }
}

#[test]
fn min_aggregate_policy_converges() {
    let n = 32;
    let a = random_spd(n);
    let b: Vec<DenseField> = (0..3).map(|_| random_unit_field(n, Precision::Double)).collect();
    let opts = SolverOptions {
        num_src: 3,
        tol: 1e-9,
        delta: 0.2,
        block_aggregate: BlockAggregate::Min,
        hermitize_pap: true,
        reorthogonalize_qp: true,
        ..SolverOptions::default()
    };
    let (_, result) = block_solve(&a, &b, opts);
    let stats = result.unwrap();
    assert!(stats.converged);
    for res in &stats.true_res_offset {
        assert!(*res <= 1e-8, "residual {res:e}");
    }
}

#[test]
fn staggered_operator_partitions_overlap_in_two() {
    // Three sources on a staggered operator: the overlap worker update
    // splits into two slices with a leftover column.
    let n = 32;
    let a = random_spd(n);
    let b: Vec<DenseField> = (0..3).map(|_| random_unit_field(n, Precision::Double)).collect();
    let opts = SolverOptions { num_src: 3, tol: 1e-9, delta: 0.15, ..SolverOptions::default() };
    let mat = DenseOperator::new(a.clone(), Precision::Double).staggered(true);
    let mat_sloppy = DenseOperator::new(a.clone(), Precision::Double).staggered(true);
    let mut x: Vec<DenseField> =
        b.iter().map(|c| DenseField::new(c.len(), Precision::Double)).collect();
    let mut solver = BlockCgSolver::new(opts);
    let stats = solver.solve(&mat, &mat_sloppy, &mut x, &b).unwrap();
    assert!(stats.converged);
    for res in &stats.true_res_offset {
        assert!(*res <= 1e-8, "residual {res:e}");
    }
}

#[test]
fn block_solving_twice_is_idempotent() {
    let n = 24;
    let a = random_spd(n);
    let b: Vec<DenseField> = (0..2).map(|_| random_unit_field(n, Precision::Double)).collect();
    let opts = SolverOptions { num_src: 2, tol: 1e-9, delta: 0.1, ..SolverOptions::default() };
    let mat = DenseOperator::new(a.clone(), Precision::Double);
    let mat_sloppy = DenseOperator::new(a.clone(), Precision::Double);
    let mut x: Vec<DenseField> =
        b.iter().map(|c| DenseField::new(c.len(), Precision::Double)).collect();
    let mut solver = BlockCgSolver::new(opts);
    let first = solver.solve(&mat, &mat_sloppy, &mut x, &b).unwrap();
    assert!(first.converged);
    let second = solver.solve(&mat, &mat_sloppy, &mut x, &b).unwrap();
    assert_eq!(second.iterations, 0);
    assert!(second.converged);
}
