//! Exact squared Euclidean distance transform (lower envelope of parabolas,
//! Felzenszwalb & Huttenlocher 2012), applied separably to rows and columns.

use rayon::prelude::*;

use crate::{error::try_vec_from_fn, error::SimulationError, floating_type_mod::FT};

/// Squared distance used for "no feature here".
pub const EDT_INF: FT = 1e20;

/// Reusable per-worker buffers for `dt1d`.
#[derive(Default)]
pub struct Envelope {
    // indices of the parabolas in the lower envelope (strictly increasing)
    v: Vec<usize>,
    // boundaries between consecutive envelope parabolas
    z: Vec<FT>,
}

/// One-dimensional transform: `out[q] = min_p (q - p)^2 + f[p]`.
pub fn dt1d(f: &[FT], out: &mut [FT], envelope: &mut Envelope) {
    let n = f.len();
    debug_assert_eq!(out.len(), n);
    if n == 0 {
        return;
    }

    let Envelope { v, z } = envelope;
    v.clear();
    v.resize(n, 0);
    z.clear();
    z.resize(n + 1, 0.);

    // intersection of the parabolas rooted at q and p, needs q > p
    let intersection = |q: usize, p: usize| -> FT {
        let qf = q as FT;
        let pf = p as FT;
        ((f[q] + qf * qf) - (f[p] + pf * pf)) / (2. * (qf - pf))
    };

    let mut k = 0;
    z[0] = FT::NEG_INFINITY;
    z[1] = FT::INFINITY;

    for q in 1..n {
        let mut s = intersection(q, v[k]);
        while s <= z[k] {
            k -= 1;
            s = intersection(q, v[k]);
        }
        k += 1;
        v[k] = q;
        z[k] = s;
        z[k + 1] = FT::INFINITY;
    }

    k = 0;
    for (q, out_q) in out.iter_mut().enumerate() {
        while z[k + 1] < q as FT {
            k += 1;
        }
        let p = v[k];
        let dq = q as FT - p as FT;
        *out_q = dq * dq + f[p];
    }
}

/// Squared distance (in pixels) of every cell of a `width x height` row-major
/// feature image to its nearest feature cell. Feature cells hold 0, all other
/// cells `EDT_INF`.
pub fn edt2d_squared(width: usize, height: usize, f: &[FT]) -> Result<Vec<FT>, SimulationError> {
    assert_eq!(f.len(), width * height);

    // rows
    let mut rows = try_vec_from_fn(width * height, "distance transform buffer", |_| 0.)?;
    rows.par_chunks_mut(width)
        .zip(f.par_chunks(width))
        .for_each_init(Envelope::default, |envelope, (out, row)| dt1d(row, out, envelope));

    // columns, on a transposed copy so every column is contiguous
    let columns = try_vec_from_fn(width * height, "distance transform buffer", |i| {
        let (x, y) = (i / height, i % height);
        rows[y * width + x]
    })?;
    let mut columns_out = rows;
    columns_out
        .par_chunks_mut(height)
        .zip(columns.par_chunks(height))
        .for_each_init(Envelope::default, |envelope, (out, column)| dt1d(column, out, envelope));

    try_vec_from_fn(width * height, "distance transform buffer", |i| {
        let (x, y) = (i % width, i / width);
        columns_out[x * height + y]
    })
}
