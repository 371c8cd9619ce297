//! Core field and operator contracts for mpcg.

use num_complex::Complex64;

use crate::matrix::herm::SquareMat;

/// Element precision of a field.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precision {
    Half,
    Single,
    Double,
}

impl Precision {
    /// Unit roundoff of the precision, used by the alternative
    /// reliable-update error bounds.
    pub fn unit_roundoff(self) -> f64 {
        match self {
            Precision::Double => f64::EPSILON / 2.0,
            Precision::Single => f32::EPSILON as f64 / 2.0,
            Precision::Half => 2f64.powi(-13),
        }
    }
}

/// A vector in a complex Hilbert space, together with the fused kernels the
/// CG cores are written against.
///
/// Reductions return host scalars and are collective: on a distributed
/// implementation every one of them implies a global allreduce. All fields
/// passed to one reduction must share the logical length. Precision
/// conversion happens only in `assign` and at allocation (`new_like`).
///
/// Multi-RHS kernels take coefficient blocks as row-major `n×n` matrices
/// with the row index addressing `x` components and the column index `y`
/// components: `y_j ← y_j + Σ_i a(i,j)·x_i`.
pub trait Field: Sized {
    fn precision(&self) -> Precision;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate a zero-initialized field of the same shape at `precision`.
    fn new_like(&self, precision: Precision) -> Self;
    /// Overwrite with `src`, converting precision. No-op level cost when
    /// shapes and precisions already match is up to the implementation.
    fn assign(&mut self, src: &Self);
    fn set_zero(&mut self);

    /// `‖self‖²`.
    fn norm2(&self) -> f64;
    /// `Re⟨self, other⟩`.
    fn dot_re(&self, other: &Self) -> f64;
    /// `⟨self, other⟩`.
    fn dot_c(&self, other: &Self) -> Complex64;
    /// `self ← x − self`; returns `‖self‖²`.
    fn xmy_norm(&mut self, x: &Self) -> f64;
    /// `self ← self + a·x`.
    fn axpy(&mut self, a: f64, x: &Self);
    /// `self ← self + x`.
    fn xpy(&mut self, x: &Self);
    /// `self ← x + a·self`.
    fn xpay(&mut self, x: &Self, a: f64);
    /// `self ← self + a·x`, complex coefficient.
    fn caxpy(&mut self, a: Complex64, x: &Self);
    /// `self ← self + a·x`; returns `‖self‖²`.
    fn axpy_norm(&mut self, a: f64, x: &Self) -> f64;
    /// `self ← self + a·x`; returns the packed pair
    /// `(‖self_new‖², Re⟨self_new, self_new − self_old⟩)`.
    ///
    /// The second component is the Polak–Ribière numerator driving the
    /// alternative β.
    fn axpy_cg_norm(&mut self, a: f64, x: &Self) -> (f64, f64);
    /// Fused `x ← x + a·p; p ← r + b·p`.
    fn axpy_zpbx(a: f64, p: &mut Self, x: &mut Self, r: &Self, b: f64);
    /// Packed `(‖r‖², ‖ap‖², Re⟨p, ap⟩)`.
    fn triple_cg_reduction(r: &Self, ap: &Self, p: &Self) -> (f64, f64, f64);
    /// Packed `(‖r‖², ‖ap‖², Re⟨p, ap⟩, ‖p‖²)`.
    fn quadruple_cg_reduction(r: &Self, ap: &Self, p: &Self) -> (f64, f64, f64, f64);
    /// Fused `x ← x + a·p; r ← r − a·ap; p ← r + b·p`.
    fn triple_cg_update(a: f64, b: f64, ap: &Self, x: &mut Self, r: &mut Self, p: &mut Self);
    /// Packed `(‖x‖², ‖r‖², hq)` where `hq` is the volume average of the
    /// per-site ratio `‖r_site‖²/‖x_site‖²`. The residual is the third
    /// component.
    fn heavy_quark_residual_norm(x: &Self, r: &Self) -> (f64, f64, f64);
    /// As `heavy_quark_residual_norm`, evaluated on `(x + y, r)`.
    fn xpy_heavy_quark_residual_norm(x: &Self, y: &Self, r: &Self) -> (f64, f64, f64);

    /// Hermitian block Gram: `out(i,j) = ⟨x_i, y_j⟩` for `j ≥ i`, lower
    /// triangle filled by conjugation.
    fn h_dot_product(out: &mut SquareMat, x: &[Self], y: &[Self]);
    /// Hermitian block Gram of the `A`-weighted inner product; `y` holds
    /// `A·x`, the fill convention is that of `h_dot_product`.
    fn h_dot_product_anorm(out: &mut SquareMat, x: &[Self], y: &[Self]);
    /// Full (non-Hermitian) block dot product, `out(i,j) = ⟨x_i, y_j⟩`.
    fn c_dot_product_block(out: &mut SquareMat, x: &[Self], y: &[Self]);
    /// `y_j ← y_j + Σ_i a(row_offset + i, j)·x_i` for every column `j`.
    ///
    /// The offset addresses coefficient rows when `x` is a slice of a
    /// larger block, which is how the overlap worker partitions its update.
    fn block_caxpy_rows(a: &SquareMat, x: &[Self], y: &mut [Self], row_offset: usize);
    /// `y_j ← y_j + Σ_i a(i,j)·x_i`.
    fn block_caxpy(a: &SquareMat, x: &[Self], y: &mut [Self]) {
        Self::block_caxpy_rows(a, x, y, 0);
    }
    /// Upper-triangular coefficients: `y_j ← y_j + Σ_{i ≤ j} a(i,j)·x_i`.
    fn block_caxpy_upper(a: &SquareMat, x: &[Self], y: &mut [Self]);
    /// Lower-triangular caxpyz: `z_j ← y_j + Σ_{i ≥ j} a(i,j)·x_i`.
    fn block_caxpyz_lower(a: &SquareMat, x: &[Self], y: &[Self], z: &mut [Self]);
}

/// Cooperative hook invoked by the operator between its communication and
/// compute phases, used to overlap an unrelated block update with the
/// operator's own latency.
///
/// Contract: during one `apply_block` call the operator invokes the worker
/// exactly `overlap_slices()` times, in order, all before returning. The
/// worker carries no state across operator calls other than its own slice
/// cursor, which it resets after issuing the final slice.
pub trait OverlapWorker {
    fn apply(&mut self);
}

/// A Hermitian positive-definite linear map on fields.
///
/// Two instances participate in a solve: the reference-precision operator
/// and the sloppy-precision one. Both keep a cumulative FLOP counter that
/// the solver reads (and thereby resets) at solve boundaries.
pub trait LinearMap {
    type Field: Field;

    /// `out ← A·input`. `tmp` is operator scratch.
    fn apply(&self, out: &mut Self::Field, input: &Self::Field, tmp: &mut Self::Field);

    /// Variant with a second scratch field, needed by multi-process
    /// Wilson-like kernels. The default forwards to `apply`.
    fn apply_with(
        &self,
        out: &mut Self::Field,
        input: &Self::Field,
        tmp: &mut Self::Field,
        _tmp2: &mut Self::Field,
    ) {
        self.apply(out, input, tmp);
    }

    /// Columnwise block application. When `worker` is present it is invoked
    /// exactly `overlap_slices()` times, interleaved with the per-column
    /// work; see [`OverlapWorker`].
    fn apply_block(
        &self,
        out: &mut [Self::Field],
        input: &[Self::Field],
        tmp: &mut Self::Field,
        mut tmp2: Option<&mut Self::Field>,
        mut worker: Option<&mut dyn OverlapWorker>,
    ) {
        let slices = self.overlap_slices();
        let cols = out.len().max(1);
        let mut fired = 0;
        for (j, (o, i)) in out.iter_mut().zip(input.iter()).enumerate() {
            if let Some(w) = worker.as_deref_mut() {
                let due = (slices * (j + 1)).div_ceil(cols).min(slices);
                while fired < due {
                    w.apply();
                    fired += 1;
                }
            }
            match tmp2.as_deref_mut() {
                Some(t2) => self.apply_with(o, i, tmp, t2),
                None => self.apply(o, i, tmp),
            }
        }
        if let Some(w) = worker.as_deref_mut() {
            while fired < slices {
                w.apply();
                fired += 1;
            }
        }
    }

    /// FLOPs performed since the previous call; reading resets the counter.
    fn flops(&self) -> u64;
    fn is_staggered(&self) -> bool;
    fn precision(&self) -> Precision;

    /// Number of overlap-worker slices per block application: staggered
    /// operators expose two comms/compute windows, Wilson-like ones four.
    fn overlap_slices(&self) -> usize {
        if self.is_staggered() { 2 } else { 4 }
    }
}
