//! Small dense complex matrices for the block solver's host-side algebra.
//!
//! The block core keeps a handful of `n×n` complex matrices (Gram matrix,
//! Cholesky factors, accumulated-norm factor) with `n` equal to the number
//! of right-hand sides. Storage is row-major so coefficient blocks can be
//! handed to the multi-RHS field kernels as-is. All factorizations here are
//! host work and cost `O(n³)`.

use std::ops::{Add, Index, IndexMut, Mul, Neg};

use num_complex::Complex64;

use crate::error::SolverError;

/// Dense complex `n×n` matrix, row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct SquareMat {
    n: usize,
    data: Vec<Complex64>,
}

impl SquareMat {
    pub fn zeros(n: usize) -> Self {
        Self { n, data: vec![Complex64::new(0.0, 0.0); n * n] }
    }

    pub fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n);
        for i in 0..n {
            m[(i, i)] = Complex64::new(1.0, 0.0);
        }
        m
    }

    pub fn from_fn(n: usize, f: impl Fn(usize, usize) -> Complex64) -> Self {
        let mut m = Self::zeros(n);
        for i in 0..n {
            for j in 0..n {
                m[(i, j)] = f(i, j);
            }
        }
        m
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Row-major view of the coefficients, the layout the block field
    /// kernels expect.
    pub fn as_slice(&self) -> &[Complex64] {
        &self.data
    }

    /// Conjugate transpose.
    pub fn adjoint(&self) -> SquareMat {
        SquareMat::from_fn(self.n, |i, j| self[(j, i)].conj())
    }

    /// `½(self + self*)`, forcing Hermiticity.
    pub fn hermitize(&mut self) {
        let adj = self.adjoint();
        for i in 0..self.n {
            for j in 0..self.n {
                self[(i, j)] = 0.5 * (self[(i, j)] + adj[(i, j)]);
            }
        }
    }

    /// Squared L2 norm of column `j`.
    pub fn col_norm2(&self, j: usize) -> f64 {
        (0..self.n).map(|i| self[(i, j)].norm_sqr()).sum()
    }

    /// Lower-triangular Cholesky factor `L` with `L L* = self`, for
    /// Hermitian positive-definite input.
    ///
    /// A non-positive, NaN, or (relative to the largest diagonal entry)
    /// negligible pivot reports rank deficiency instead of dividing by it.
    pub fn cholesky_lower(&self) -> Result<SquareMat, SolverError> {
        let n = self.n;
        let diag_max = (0..n).map(|i| self[(i, i)].re).fold(0.0, f64::max);
        let floor = diag_max * (n as f64) * f64::EPSILON;
        let mut l = SquareMat::zeros(n);
        for j in 0..n {
            let mut d = self[(j, j)].re;
            for k in 0..j {
                d -= l[(j, k)].norm_sqr();
            }
            if !(d > floor) {
                return Err(SolverError::NumericalBreakdown(format!(
                    "non-positive Cholesky pivot {d:e} at column {j}"
                )));
            }
            let ljj = d.sqrt();
            l[(j, j)] = Complex64::new(ljj, 0.0);
            for i in (j + 1)..n {
                let mut s = self[(i, j)];
                for k in 0..j {
                    s -= l[(i, k)] * l[(j, k)].conj();
                }
                l[(i, j)] = s / ljj;
            }
        }
        Ok(l)
    }

    /// Inverse by Gauss-Jordan elimination with partial pivoting.
    pub fn inverse(&self) -> Result<SquareMat, SolverError> {
        let n = self.n;
        let mut a = self.clone();
        let mut inv = SquareMat::identity(n);
        for col in 0..n {
            let pivot_row = (col..n)
                .max_by(|&p, &q| {
                    a[(p, col)].norm_sqr().total_cmp(&a[(q, col)].norm_sqr())
                })
                .unwrap_or(col);
            let pivot = a[(pivot_row, col)];
            if !(pivot.norm_sqr() > 0.0) || !pivot.norm_sqr().is_finite() {
                return Err(SolverError::NumericalBreakdown(format!(
                    "singular matrix: zero pivot in column {col}"
                )));
            }
            if pivot_row != col {
                for j in 0..n {
                    let (x, y) = (a[(col, j)], a[(pivot_row, j)]);
                    a[(col, j)] = y;
                    a[(pivot_row, j)] = x;
                    let (x, y) = (inv[(col, j)], inv[(pivot_row, j)]);
                    inv[(col, j)] = y;
                    inv[(pivot_row, j)] = x;
                }
            }
            let scale = Complex64::new(1.0, 0.0) / pivot;
            for j in 0..n {
                a[(col, j)] *= scale;
                inv[(col, j)] *= scale;
            }
            for i in 0..n {
                if i == col {
                    continue;
                }
                let factor = a[(i, col)];
                if factor.norm_sqr() == 0.0 {
                    continue;
                }
                for j in 0..n {
                    let ac = a[(col, j)];
                    let ic = inv[(col, j)];
                    a[(i, j)] -= factor * ac;
                    inv[(i, j)] -= factor * ic;
                }
            }
        }
        Ok(inv)
    }
}

impl Index<(usize, usize)> for SquareMat {
    type Output = Complex64;
    fn index(&self, (i, j): (usize, usize)) -> &Complex64 {
        &self.data[i * self.n + j]
    }
}

impl IndexMut<(usize, usize)> for SquareMat {
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut Complex64 {
        &mut self.data[i * self.n + j]
    }
}

impl Mul<&SquareMat> for &SquareMat {
    type Output = SquareMat;
    fn mul(self, rhs: &SquareMat) -> SquareMat {
        assert_eq!(self.n, rhs.n);
        SquareMat::from_fn(self.n, |i, j| {
            (0..self.n).map(|k| self[(i, k)] * rhs[(k, j)]).sum()
        })
    }
}

impl Add<&SquareMat> for &SquareMat {
    type Output = SquareMat;
    fn add(self, rhs: &SquareMat) -> SquareMat {
        assert_eq!(self.n, rhs.n);
        SquareMat::from_fn(self.n, |i, j| self[(i, j)] + rhs[(i, j)])
    }
}

impl Neg for &SquareMat {
    type Output = SquareMat;
    fn neg(self) -> SquareMat {
        SquareMat::from_fn(self.n, |i, j| -self[(i, j)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    #[test]
    fn cholesky_of_hermitian_pd() {
        // H = L₀ L₀* for a fixed lower-triangular L₀ with positive diagonal.
        let l0 = SquareMat::from_fn(3, |i, j| match (i, j) {
            (0, 0) => c(2.0, 0.0),
            (1, 0) => c(0.5, -0.25),
            (1, 1) => c(1.5, 0.0),
            (2, 0) => c(-0.75, 1.0),
            (2, 1) => c(0.25, 0.5),
            (2, 2) => c(1.25, 0.0),
            _ => c(0.0, 0.0),
        });
        let h = &l0 * &l0.adjoint();
        let l = h.cholesky_lower().unwrap();
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(l[(i, j)].re, l0[(i, j)].re, epsilon = 1e-12);
                assert_abs_diff_eq!(l[(i, j)].im, l0[(i, j)].im, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn cholesky_rejects_rank_deficiency() {
        // Gram matrix of two identical vectors is exactly rank one.
        let h = SquareMat::from_fn(2, |_, _| c(3.0, 0.0));
        assert!(h.cholesky_lower().is_err());
    }

    #[test]
    fn inverse_round_trip() {
        let m = SquareMat::from_fn(3, |i, j| {
            c(1.0 + (i * 3 + j) as f64, (i as f64) - (j as f64))
        });
        // Make it comfortably nonsingular.
        let mut m = m;
        for i in 0..3 {
            m[(i, i)] += c(10.0, 0.0);
        }
        let inv = m.inverse().unwrap();
        let prod = &m * &inv;
        let id = SquareMat::identity(3);
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(prod[(i, j)].re, id[(i, j)].re, epsilon = 1e-12);
                assert_abs_diff_eq!(prod[(i, j)].im, id[(i, j)].im, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn inverse_rejects_singular() {
        let m = SquareMat::from_fn(2, |i, _| c(i as f64 + 1.0, 0.0));
        assert!(m.inverse().is_err());
    }

    #[test]
    fn hermitize_symmetrizes() {
        let mut m = SquareMat::from_fn(2, |i, j| c((i + 2 * j) as f64, 1.0));
        m.hermitize();
        for i in 0..2 {
            for j in 0..2 {
                let a = m[(i, j)];
                let b = m[(j, i)].conj();
                assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-15);
                assert_abs_diff_eq!(a.im, b.im, epsilon = 1e-15);
            }
        }
    }
}
