//! Dense reference operator on top of Faer.
//!
//! `DenseOperator` wraps a real symmetric positive-definite `faer::Mat<f64>`
//! and applies it componentwise to complex fields; a real SPD matrix is
//! Hermitian positive-definite on the complex space, which is all the CG
//! cores require. It carries the precision and staggered tags of the
//! operator contract and a FLOP counter that resets on read.

use std::cell::Cell;

use faer::Mat;
use num_complex::Complex64;

use crate::core::traits::{Field, LinearMap, Precision};
use crate::core::wrappers::DenseField;

pub struct DenseOperator {
    a: Mat<f64>,
    precision: Precision,
    staggered: bool,
    flops: Cell<u64>,
}

impl DenseOperator {
    pub fn new(a: Mat<f64>, precision: Precision) -> Self {
        assert_eq!(a.nrows(), a.ncols());
        Self { a, precision, staggered: false, flops: Cell::new(0) }
    }

    /// Mark the operator as staggered, which narrows its scratch needs and
    /// halves its comms/compute overlap windows.
    pub fn staggered(mut self, staggered: bool) -> Self {
        self.staggered = staggered;
        self
    }

    /// Diagonal operator, convenient for small reference systems.
    pub fn diagonal(entries: &[f64], precision: Precision) -> Self {
        let n = entries.len();
        Self::new(Mat::from_fn(n, n, |i, j| if i == j { entries[i] } else { 0.0 }), precision)
    }

    pub fn matrix(&self) -> &Mat<f64> {
        &self.a
    }

    pub fn dim(&self) -> usize {
        self.a.nrows()
    }
}

impl LinearMap for DenseOperator {
    type Field = DenseField;

    fn apply(&self, out: &mut DenseField, input: &DenseField, _tmp: &mut DenseField) {
        let n = self.a.nrows();
        assert_eq!(input.len(), n);
        assert_eq!(out.len(), n);
        let xs = input.components();
        let mut result = vec![Complex64::new(0.0, 0.0); n];
        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            result.par_iter_mut().enumerate().for_each(|(i, acc)| {
                let mut re = 0.0;
                let mut im = 0.0;
                for j in 0..n {
                    let aij = self.a[(i, j)];
                    re += aij * xs[j].re;
                    im += aij * xs[j].im;
                }
                *acc = Complex64::new(re, im);
            });
        }
        #[cfg(not(feature = "parallel"))]
        {
            for (i, acc) in result.iter_mut().enumerate() {
                let mut re = 0.0;
                let mut im = 0.0;
                for j in 0..n {
                    let aij = self.a[(i, j)];
                    re += aij * xs[j].re;
                    im += aij * xs[j].im;
                }
                *acc = Complex64::new(re, im);
            }
        }
        *out = DenseField::from_components(result, out.precision());
        // One real multiply-add per matrix entry and complex component.
        self.flops.set(self.flops.get() + (4 * n * n) as u64);
    }

    fn flops(&self) -> u64 {
        self.flops.replace(0)
    }

    fn is_staggered(&self) -> bool {
        self.staggered
    }

    fn precision(&self) -> Precision {
        self.precision
    }
}
