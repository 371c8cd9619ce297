use criterion::{Criterion, black_box, criterion_group, criterion_main};
use faer::Mat;
use faer::linalg::solvers::SolveCore;
use mpcg::{CgSolver, DenseField, DenseOperator, Precision, SolverOptions};

fn bench_cg_vs_faer(c: &mut Criterion) {
    let n = 200;
    let data: Vec<f64> = (0..n * n).map(|i| (i as f64).sin()).collect();
    let m = Mat::from_fn(n, n, |i, j| data[j * n + i]);
    let m_t = m.transpose();
    let a = &m_t * &m + Mat::<f64>::identity(n, n);
    let b: Vec<f64> = (0..n).map(|i| (i as f64).cos()).collect();

    c.bench_function("mpcg mixed-precision CG", |ben| {
        let opts = SolverOptions {
            tol: 1e-10,
            delta: 0.1,
            precision: Precision::Double,
            precision_sloppy: Precision::Single,
            use_sloppy_partial_accumulator: true,
            ..SolverOptions::default()
        };
        let mat = DenseOperator::new(a.clone(), Precision::Double);
        let mat_sloppy = DenseOperator::new(a.clone(), Precision::Single);
        let bf = DenseField::from_real(&b, Precision::Double);
        let mut solver = CgSolver::new(opts);
        ben.iter(|| {
            let mut x = DenseField::new(n, Precision::Double);
            let _stats =
                solver.solve(black_box(&mat), black_box(&mat_sloppy), &mut x, black_box(&bf));
        })
    });

    c.bench_function("faer raw LU", |ben| {
        ben.iter(|| {
            let factor = faer::linalg::solvers::FullPivLu::new(a.as_ref());
            let mut y = b.clone();
            let n = y.len();
            let y_mat = faer::MatMut::from_column_major_slice_mut(&mut y, n, 1);
            factor.solve_in_place_with_conj(faer::Conj::No, y_mat);
        })
    });
}

criterion_group!(benches, bench_cg_vs_faer);
criterion_main!(benches);
