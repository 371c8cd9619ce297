// Reference implementation of the field kernel contract for dense
// in-memory vectors.
//
// Storage is always f64 pairs; the precision tag is emulated by rounding
// the output of every mutating kernel to the tagged precision (f32
// rounding for single, 10-bit-mantissa rounding for half). Reductions
// accumulate in f64 regardless of the storage tag, which is what the
// device kernels guarantee as well.

use num_complex::Complex64;

use crate::core::traits::{Field, Precision};
use crate::matrix::herm::SquareMat;

/// Dense complex field with an emulated element precision.
#[derive(Clone, Debug)]
pub struct DenseField {
    data: Vec<Complex64>,
    precision: Precision,
}

fn round_component(v: f64, precision: Precision) -> f64 {
    match precision {
        Precision::Double => v,
        Precision::Single => v as f32 as f64,
        Precision::Half => {
            // f32 with the mantissa truncated to 10 bits.
            let bits = (v as f32).to_bits();
            f32::from_bits(bits & 0xFFFF_E000) as f64
        }
    }
}

fn round_c(z: Complex64, precision: Precision) -> Complex64 {
    match precision {
        Precision::Double => z,
        _ => Complex64::new(
            round_component(z.re, precision),
            round_component(z.im, precision),
        ),
    }
}

impl DenseField {
    pub fn new(len: usize, precision: Precision) -> Self {
        Self { data: vec![Complex64::new(0.0, 0.0); len], precision }
    }

    pub fn from_components(data: Vec<Complex64>, precision: Precision) -> Self {
        let mut f = Self { data, precision };
        f.round_in_place();
        f
    }

    pub fn from_real(values: &[f64], precision: Precision) -> Self {
        Self::from_components(
            values.iter().map(|&v| Complex64::new(v, 0.0)).collect(),
            precision,
        )
    }

    pub fn components(&self) -> &[Complex64] {
        &self.data
    }

    fn round_in_place(&mut self) {
        if self.precision != Precision::Double {
            for z in &mut self.data {
                *z = round_c(*z, self.precision);
            }
        }
    }
}

impl Field for DenseField {
    fn precision(&self) -> Precision {
        self.precision
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn new_like(&self, precision: Precision) -> Self {
        Self::new(self.data.len(), precision)
    }

    fn assign(&mut self, src: &Self) {
        assert_eq!(self.data.len(), src.data.len());
        for (d, s) in self.data.iter_mut().zip(&src.data) {
            *d = round_c(*s, self.precision);
        }
    }

    fn set_zero(&mut self) {
        for z in &mut self.data {
            *z = Complex64::new(0.0, 0.0);
        }
    }

    fn norm2(&self) -> f64 {
        self.data.iter().map(|z| z.norm_sqr()).sum()
    }

    fn dot_re(&self, other: &Self) -> f64 {
        assert_eq!(self.data.len(), other.data.len());
        self.data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a.conj() * *b).re)
            .sum()
    }

    fn dot_c(&self, other: &Self) -> Complex64 {
        assert_eq!(self.data.len(), other.data.len());
        self.data.iter().zip(&other.data).map(|(a, b)| a.conj() * *b).sum()
    }

    fn xmy_norm(&mut self, x: &Self) -> f64 {
        assert_eq!(self.data.len(), x.data.len());
        let mut norm = 0.0;
        for (s, xi) in self.data.iter_mut().zip(&x.data) {
            let v = round_c(*xi - *s, self.precision);
            norm += v.norm_sqr();
            *s = v;
        }
        norm
    }

    fn axpy(&mut self, a: f64, x: &Self) {
        assert_eq!(self.data.len(), x.data.len());
        for (s, xi) in self.data.iter_mut().zip(&x.data) {
            *s = round_c(*s + a * *xi, self.precision);
        }
    }

    fn xpy(&mut self, x: &Self) {
        assert_eq!(self.data.len(), x.data.len());
        for (s, xi) in self.data.iter_mut().zip(&x.data) {
            *s = round_c(*s + *xi, self.precision);
        }
    }

    fn xpay(&mut self, x: &Self, a: f64) {
        assert_eq!(self.data.len(), x.data.len());
        for (s, xi) in self.data.iter_mut().zip(&x.data) {
            *s = round_c(*xi + a * *s, self.precision);
        }
    }

    fn caxpy(&mut self, a: Complex64, x: &Self) {
        assert_eq!(self.data.len(), x.data.len());
        for (s, xi) in self.data.iter_mut().zip(&x.data) {
            *s = round_c(*s + a * *xi, self.precision);
        }
    }

    fn axpy_norm(&mut self, a: f64, x: &Self) -> f64 {
        assert_eq!(self.data.len(), x.data.len());
        let mut norm = 0.0;
        for (s, xi) in self.data.iter_mut().zip(&x.data) {
            let v = round_c(*s + a * *xi, self.precision);
            norm += v.norm_sqr();
            *s = v;
        }
        norm
    }

    fn axpy_cg_norm(&mut self, a: f64, x: &Self) -> (f64, f64) {
        assert_eq!(self.data.len(), x.data.len());
        let mut norm = 0.0;
        let mut cross = 0.0;
        for (s, xi) in self.data.iter_mut().zip(&x.data) {
            let old = *s;
            let new = round_c(old + a * *xi, self.precision);
            norm += new.norm_sqr();
            cross += (new.conj() * (new - old)).re;
            *s = new;
        }
        (norm, cross)
    }

    fn axpy_zpbx(a: f64, p: &mut Self, x: &mut Self, r: &Self, b: f64) {
        assert_eq!(p.data.len(), x.data.len());
        assert_eq!(p.data.len(), r.data.len());
        for i in 0..p.data.len() {
            let pi = p.data[i];
            x.data[i] = round_c(x.data[i] + a * pi, x.precision);
            p.data[i] = round_c(r.data[i] + b * pi, p.precision);
        }
    }

    fn triple_cg_reduction(r: &Self, ap: &Self, p: &Self) -> (f64, f64, f64) {
        let mut r2 = 0.0;
        let mut ap2 = 0.0;
        let mut p_ap = 0.0;
        for i in 0..r.data.len() {
            r2 += r.data[i].norm_sqr();
            ap2 += ap.data[i].norm_sqr();
            p_ap += (p.data[i].conj() * ap.data[i]).re;
        }
        (r2, ap2, p_ap)
    }

    fn quadruple_cg_reduction(r: &Self, ap: &Self, p: &Self) -> (f64, f64, f64, f64) {
        let (r2, ap2, p_ap) = Self::triple_cg_reduction(r, ap, p);
        (r2, ap2, p_ap, p.norm2())
    }

    fn triple_cg_update(a: f64, b: f64, ap: &Self, x: &mut Self, r: &mut Self, p: &mut Self) {
        for i in 0..p.data.len() {
            let pi = p.data[i];
            x.data[i] = round_c(x.data[i] + a * pi, x.precision);
            let ri = round_c(r.data[i] - a * ap.data[i], r.precision);
            r.data[i] = ri;
            p.data[i] = round_c(ri + b * pi, p.precision);
        }
    }

    fn heavy_quark_residual_norm(x: &Self, r: &Self) -> (f64, f64, f64) {
        assert_eq!(x.data.len(), r.data.len());
        let mut x2 = 0.0;
        let mut r2 = 0.0;
        let mut hq = 0.0;
        for i in 0..x.data.len() {
            let xs = x.data[i].norm_sqr();
            let rs = r.data[i].norm_sqr();
            x2 += xs;
            r2 += rs;
            if xs > 0.0 {
                hq += rs / xs;
            }
        }
        let volume = x.data.len().max(1) as f64;
        (x2, r2, hq / volume)
    }

    fn xpy_heavy_quark_residual_norm(x: &Self, y: &Self, r: &Self) -> (f64, f64, f64) {
        assert_eq!(x.data.len(), y.data.len());
        assert_eq!(x.data.len(), r.data.len());
        let mut x2 = 0.0;
        let mut r2 = 0.0;
        let mut hq = 0.0;
        for i in 0..x.data.len() {
            let xs = (x.data[i] + y.data[i]).norm_sqr();
            let rs = r.data[i].norm_sqr();
            x2 += xs;
            r2 += rs;
            if xs > 0.0 {
                hq += rs / xs;
            }
        }
        let volume = x.data.len().max(1) as f64;
        (x2, r2, hq / volume)
    }

    fn h_dot_product(out: &mut SquareMat, x: &[Self], y: &[Self]) {
        let n = x.len();
        debug_assert_eq!(out.n(), n);
        debug_assert_eq!(y.len(), n);
        for i in 0..n {
            for j in i..n {
                let d = x[i].dot_c(&y[j]);
                out[(i, j)] = d;
                if i != j {
                    out[(j, i)] = d.conj();
                }
            }
        }
    }

    fn h_dot_product_anorm(out: &mut SquareMat, x: &[Self], y: &[Self]) {
        // The A-weighting is already carried by `y`, which holds A·x.
        Self::h_dot_product(out, x, y);
    }

    fn c_dot_product_block(out: &mut SquareMat, x: &[Self], y: &[Self]) {
        let n = x.len();
        debug_assert_eq!(out.n(), n);
        debug_assert_eq!(y.len(), n);
        for i in 0..n {
            for j in 0..n {
                out[(i, j)] = x[i].dot_c(&y[j]);
            }
        }
    }

    fn block_caxpy_rows(a: &SquareMat, x: &[Self], y: &mut [Self], row_offset: usize) {
        for (j, yj) in y.iter_mut().enumerate() {
            for (i, xi) in x.iter().enumerate() {
                let c = a[(row_offset + i, j)];
                for (yc, xc) in yj.data.iter_mut().zip(&xi.data) {
                    *yc += c * *xc;
                }
            }
            yj.round_in_place();
        }
    }

    fn block_caxpy_upper(a: &SquareMat, x: &[Self], y: &mut [Self]) {
        for (j, yj) in y.iter_mut().enumerate() {
            for (i, xi) in x.iter().enumerate().take(j + 1) {
                let c = a[(i, j)];
                for (yc, xc) in yj.data.iter_mut().zip(&xi.data) {
                    *yc += c * *xc;
                }
            }
            yj.round_in_place();
        }
    }

    fn block_caxpyz_lower(a: &SquareMat, x: &[Self], y: &[Self], z: &mut [Self]) {
        for (j, zj) in z.iter_mut().enumerate() {
            zj.data.copy_from_slice(&y[j].data);
            for (i, xi) in x.iter().enumerate().skip(j) {
                let c = a[(i, j)];
                for (zc, xc) in zj.data.iter_mut().zip(&xi.data) {
                    *zc += c * *xc;
                }
            }
            zj.round_in_place();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn field(vals: &[(f64, f64)], precision: Precision) -> DenseField {
        DenseField::from_components(
            vals.iter().map(|&(re, im)| Complex64::new(re, im)).collect(),
            precision,
        )
    }

    #[test]
    fn xmy_norm_forms_residual() {
        let b = field(&[(1.0, 0.0), (2.0, 0.0)], Precision::Double);
        let mut r = field(&[(0.25, 0.0), (0.5, 0.0)], Precision::Double);
        let r2 = r.xmy_norm(&b);
        assert_abs_diff_eq!(r2, 0.75 * 0.75 + 1.5 * 1.5, epsilon = 1e-15);
        assert_abs_diff_eq!(r.components()[0].re, 0.75, epsilon = 1e-15);
    }

    #[test]
    fn axpy_cg_norm_matches_unfused() {
        let ap = field(&[(0.5, 0.25), (-1.0, 0.75)], Precision::Double);
        let mut r = field(&[(1.0, -0.5), (2.0, 0.0)], Precision::Double);
        let r_old = r.clone();
        let (r2, cross) = r.axpy_cg_norm(-0.3, &ap);
        assert_abs_diff_eq!(r2, r.norm2(), epsilon = 1e-15);
        let mut diff = r.clone();
        for (d, o) in diff.data.iter_mut().zip(&r_old.data) {
            *d -= *o;
        }
        assert_abs_diff_eq!(cross, r.dot_c(&diff).re, epsilon = 1e-12);
    }

    #[test]
    fn single_precision_rounds_storage() {
        let mut r = field(&[(1.0, 0.0)], Precision::Single);
        r.axpy(1e-12, &field(&[(1.0, 0.0)], Precision::Single));
        // The increment is below single-precision resolution at 1.0.
        assert_abs_diff_eq!(r.components()[0].re, 1.0, epsilon = 0.0);
    }

    #[test]
    fn half_precision_is_coarser_than_single() {
        let v = 1.0 + 1e-4;
        let single = round_component(v, Precision::Single);
        let half = round_component(v, Precision::Half);
        assert!((single - v).abs() < 1e-7);
        assert!((half - v).abs() > 1e-7);
    }

    #[test]
    fn block_caxpy_upper_respects_triangle() {
        let x = vec![
            field(&[(1.0, 0.0)], Precision::Double),
            field(&[(10.0, 0.0)], Precision::Double),
        ];
        let mut y = vec![
            field(&[(0.0, 0.0)], Precision::Double),
            field(&[(0.0, 0.0)], Precision::Double),
        ];
        let a = SquareMat::from_fn(2, |_, _| Complex64::new(1.0, 0.0));
        DenseField::block_caxpy_upper(&a, &x, &mut y);
        // Column 0 only sees x_0; column 1 sees both.
        assert_abs_diff_eq!(y[0].components()[0].re, 1.0, epsilon = 1e-15);
        assert_abs_diff_eq!(y[1].components()[0].re, 11.0, epsilon = 1e-15);
    }

    #[test]
    fn block_caxpyz_lower_respects_triangle() {
        let x = vec![
            field(&[(1.0, 0.0)], Precision::Double),
            field(&[(10.0, 0.0)], Precision::Double),
        ];
        let y = vec![
            field(&[(0.5, 0.0)], Precision::Double),
            field(&[(0.5, 0.0)], Precision::Double),
        ];
        let mut z = vec![
            field(&[(0.0, 0.0)], Precision::Double),
            field(&[(0.0, 0.0)], Precision::Double),
        ];
        let a = SquareMat::from_fn(2, |_, _| Complex64::new(1.0, 0.0));
        DenseField::block_caxpyz_lower(&a, &x, &y, &mut z);
        // Column 0 sees x_0 and x_1; column 1 only x_1.
        assert_abs_diff_eq!(z[0].components()[0].re, 11.5, epsilon = 1e-15);
        assert_abs_diff_eq!(z[1].components()[0].re, 10.5, epsilon = 1e-15);
    }

    #[test]
    fn hermitian_gram_fills_lower_triangle() {
        let x = vec![
            field(&[(1.0, 1.0), (0.0, 0.0)], Precision::Double),
            field(&[(0.0, 0.0), (2.0, -1.0)], Precision::Double),
        ];
        let mut h = SquareMat::zeros(2);
        DenseField::h_dot_product(&mut h, &x, &x);
        assert_abs_diff_eq!(h[(0, 0)].re, 2.0, epsilon = 1e-15);
        assert_abs_diff_eq!(h[(1, 1)].re, 5.0, epsilon = 1e-15);
        let a = h[(0, 1)];
        let b = h[(1, 0)].conj();
        assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-15);
        assert_abs_diff_eq!(a.im, b.im, epsilon = 1e-15);
    }
}
