//! Solve context: owns the operator pair and dispatches on `num_src`.

use crate::config::options::SolverOptions;
use crate::core::traits::LinearMap;
use crate::error::SolverError;
use crate::solver::{BlockCgSolver, CgSolver};
use crate::utils::convergence::SolveStats;

/// Block sizes the block path accepts.
const SUPPORTED_NUM_SRC: [usize; 20] =
    [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 24, 32, 48, 64];

pub struct SolveContext<O: LinearMap> {
    pub mat: O,
    pub mat_sloppy: O,
    cg: CgSolver<O::Field>,
    block: BlockCgSolver<O::Field>,
}

impl<O: LinearMap> SolveContext<O> {
    pub fn new(mat: O, mat_sloppy: O, opts: SolverOptions) -> Self {
        Self {
            cg: CgSolver::new(opts.clone()),
            block: BlockCgSolver::new(opts),
            mat,
            mat_sloppy,
        }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.cg.opts
    }

    /// Solve `A X = B` for `num_src` right-hand sides, dispatching to the
    /// single-RHS core for `num_src == 1` and to BlockCGrQ otherwise.
    pub fn solve(
        &mut self,
        x: &mut [O::Field],
        b: &[O::Field],
    ) -> Result<SolveStats, SolverError> {
        let num_src = self.cg.opts.num_src;
        if !SUPPORTED_NUM_SRC.contains(&num_src) {
            return Err(SolverError::UnsupportedBlockSize(num_src));
        }
        if x.len() != num_src || b.len() != num_src {
            return Err(SolverError::ShapeMismatch(format!(
                "num_src = {} with {} solution and {} source columns",
                num_src,
                x.len(),
                b.len()
            )));
        }
        if num_src == 1 {
            self.cg.solve(&self.mat, &self.mat_sloppy, &mut x[0], &b[0])
        } else {
            self.block.solve(&self.mat, &self.mat_sloppy, x, b)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::Precision;
    use crate::core::wrappers::DenseField;
    use crate::matrix::dense::DenseOperator;

    #[test]
    fn rejects_unsupported_block_size() {
        let opts = SolverOptions { num_src: 17, ..SolverOptions::default() };
        let mat = DenseOperator::diagonal(&[1.0, 2.0], Precision::Double);
        let mat_sloppy = DenseOperator::diagonal(&[1.0, 2.0], Precision::Double);
        let mut ctx = SolveContext::new(mat, mat_sloppy, opts);
        let b: Vec<DenseField> =
            (0..17).map(|_| DenseField::from_real(&[1.0, 1.0], Precision::Double)).collect();
        let mut x: Vec<DenseField> =
            (0..17).map(|_| DenseField::new(2, Precision::Double)).collect();
        assert!(matches!(
            ctx.solve(&mut x, &b),
            Err(SolverError::UnsupportedBlockSize(17))
        ));
    }

    #[test]
    fn rejects_shape_mismatch() {
        let opts = SolverOptions { num_src: 2, ..SolverOptions::default() };
        let mat = DenseOperator::diagonal(&[1.0, 2.0], Precision::Double);
        let mat_sloppy = DenseOperator::diagonal(&[1.0, 2.0], Precision::Double);
        let mut ctx = SolveContext::new(mat, mat_sloppy, opts);
        let b = vec![DenseField::from_real(&[1.0, 1.0], Precision::Double)];
        let mut x = vec![DenseField::new(2, Precision::Double)];
        assert!(matches!(ctx.solve(&mut x, &b), Err(SolverError::ShapeMismatch(_))));
    }
}
