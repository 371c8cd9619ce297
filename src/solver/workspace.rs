//! Mixed-precision buffer management for the CG cores.
//!
//! Buffers are allocated on the first solve and reused afterwards. Aliasing
//! is resolved here, once, and encoded in the types: every logical name
//! that may alias another buffer is an `Option`, and `None` means "use the
//! aliasing target". Copies and zeroes on aliased names thereby become
//! no-ops by construction:
//!
//! - `r_sloppy` aliases `r` iff the sloppy precision equals the outer
//!   precision;
//! - `x_sloppy` aliases the caller's `x` iff the precisions match or no
//!   sloppy partial accumulator was requested;
//! - `tmp2` is only needed by non-staggered (Wilson-like multi-process)
//!   operators, otherwise the operator receives just `tmp`;
//! - `tmp3` (outer precision) is only needed when the precisions differ
//!   and the operator is non-staggered.

use crate::config::options::SolverOptions;
use crate::core::traits::{Field, Precision};

/// Buffer set for the single-RHS core.
pub struct CgWorkspace<F: Field> {
    /// Outer-precision residual.
    pub r: F,
    /// Outer-precision partial solution accumulated over reliable updates.
    pub y: F,
    /// Sloppy `A·p`.
    pub ap: F,
    /// Sloppy operator scratch.
    pub tmp: F,
    /// Second sloppy operator scratch; `None` ⇒ aliases `tmp`.
    pub tmp2: Option<F>,
    /// Outer-precision operator scratch; `None` ⇒ aliases `tmp`.
    pub tmp3: Option<F>,
    /// Sloppy residual; `None` ⇒ aliases `r`.
    pub r_sloppy: Option<F>,
    /// Sloppy solution accumulator; `None` ⇒ aliases the caller's `x`.
    pub x_sloppy: Option<F>,
    /// Search direction.
    pub p: F,
}

impl<F: Field> CgWorkspace<F> {
    pub fn new(x: &F, opts: &SolverOptions, staggered: bool) -> Self {
        let high = opts.precision;
        let sloppy = opts.precision_sloppy;
        let uniform = sloppy == x.precision();
        Self {
            r: x.new_like(high),
            y: x.new_like(high),
            ap: x.new_like(sloppy),
            tmp: x.new_like(sloppy),
            tmp2: (!staggered).then(|| x.new_like(sloppy)),
            tmp3: (high != sloppy && !staggered).then(|| x.new_like(high)),
            r_sloppy: (!uniform).then(|| x.new_like(sloppy)),
            x_sloppy: (!uniform && opts.use_sloppy_partial_accumulator)
                .then(|| x.new_like(sloppy)),
            p: x.new_like(sloppy),
        }
    }

    pub fn r_aliases_sloppy(&self) -> bool {
        self.r_sloppy.is_none()
    }

    pub fn x_aliases_sloppy(&self) -> bool {
        self.x_sloppy.is_none()
    }
}

/// Buffer set for the block core. All blocks carry `num_src` columns.
pub struct BlockWorkspace<F: Field> {
    /// Outer-precision residual block.
    pub r: Vec<F>,
    /// Outer-precision partial solution block.
    pub y: Vec<F>,
    /// Saved sloppy accumulator block, used only when it does not alias
    /// the caller's `x`.
    pub x_sloppy_saved: Option<Vec<F>>,
    /// Search directions.
    pub p: Vec<F>,
    /// Orthonormalized residual block.
    pub q: Vec<F>,
    /// Sloppy `A·P`.
    pub ap: Vec<F>,
    /// Swap temporary: alternately holds the previous `Q` and the previous
    /// `P` across the triangular updates; also the deferred-update source.
    pub tmp: Vec<F>,
    /// Sloppy operator scratch (single column).
    pub tmp_op: F,
    /// Second sloppy operator scratch; `None` ⇒ operator gets only
    /// `tmp_op`.
    pub tmp2: Option<F>,
    /// Outer-precision operator scratch; `None` ⇒ operator gets `tmp_op`.
    pub tmp3: Option<F>,
}

fn block_like<F: Field>(x: &[F], precision: Precision) -> Vec<F> {
    x.iter().map(|c| c.new_like(precision)).collect()
}

impl<F: Field> BlockWorkspace<F> {
    pub fn new(x: &[F], opts: &SolverOptions, staggered: bool) -> Self {
        let high = opts.precision;
        let sloppy = opts.precision_sloppy;
        let uniform = sloppy == x[0].precision();
        Self {
            r: block_like(x, high),
            y: block_like(x, high),
            x_sloppy_saved: (!uniform && opts.use_sloppy_partial_accumulator)
                .then(|| block_like(x, sloppy)),
            p: block_like(x, sloppy),
            q: block_like(x, sloppy),
            ap: block_like(x, sloppy),
            tmp: block_like(x, sloppy),
            tmp_op: x[0].new_like(sloppy),
            tmp2: (!staggered).then(|| x[0].new_like(sloppy)),
            tmp3: (high != sloppy && !staggered).then(|| x[0].new_like(high)),
        }
    }

    pub fn x_aliases_sloppy(&self) -> bool {
        self.x_sloppy_saved.is_none()
    }
}
