// Example: mixed-precision CG solve of a random SPD system, compared
// against the uniform-precision run.

use faer::Mat;
use mpcg::{DenseField, DenseOperator, Precision, SolveContext, SolverOptions};
use rand::Rng;

fn main() {
    let n = 200;
    // Build a random SPD matrix: A = MᵀM + I
    let mut rng = rand::thread_rng();
    let data: Vec<f64> = (0..n * n).map(|_| rng.r#gen()).collect();
    let m = Mat::from_fn(n, n, |i, j| data[j * n + i]);
    let m_t = m.transpose();
    let mut a = &m_t * &m;
    // a = a + I
    for i in 0..n {
        a[(i, i)] = a[(i, i)] + 1.0;
    }

    // Right-hand side
    let b_data: Vec<f64> = (0..n).map(|_| rng.r#gen()).collect();
    let b = vec![DenseField::from_real(&b_data, Precision::Double)];

    // Mixed precision: double reference, single sloppy, reliable updates.
    let opts = SolverOptions {
        tol: 1e-10,
        delta: 0.1,
        precision: Precision::Double,
        precision_sloppy: Precision::Single,
        use_sloppy_partial_accumulator: true,
        ..SolverOptions::default()
    };
    let mut ctx = SolveContext::new(
        DenseOperator::new(a.clone(), Precision::Double),
        DenseOperator::new(a.clone(), Precision::Single),
        opts,
    );
    let mut x = vec![DenseField::new(n, Precision::Double)];
    let stats = ctx.solve(&mut x, &b).unwrap();
    println!(
        "mixed precision: {} iterations, {} reliable updates, true_res = {:e}",
        stats.iterations, stats.reliable_updates, stats.true_res
    );

    // Uniform double for comparison.
    let opts = SolverOptions { tol: 1e-10, delta: 0.0, ..SolverOptions::default() };
    let mut ctx = SolveContext::new(
        DenseOperator::new(a.clone(), Precision::Double),
        DenseOperator::new(a, Precision::Double),
        opts,
    );
    let mut x = vec![DenseField::new(n, Precision::Double)];
    let stats = ctx.solve(&mut x, &b).unwrap();
    println!(
        "uniform double:  {} iterations, {} reliable updates, true_res = {:e}",
        stats.iterations, stats.reliable_updates, stats.true_res
    );
}
