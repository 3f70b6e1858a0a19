//! Delta reducer: `Delta[r] = sum_c O[r, c] * dO[r, c]`.

use evoattn_tiles::{UNIT_THREADS, element::Element, global::GlobalView, plane};

/// Lanes cooperating on one row when a unit of [`UNIT_THREADS`] threads
/// covers `block_i` rows at a time.
pub fn threads_per_row(block_i: usize) -> usize {
    (UNIT_THREADS / block_i).max(1)
}

/// Computes Delta for the unit's `num_queries` rows into `out`.
///
/// Each row is striped over [`threads_per_row`] lanes and finished with a
/// butterfly reduction. Rows past `num_queries` are not touched.
pub fn compute_delta<E: Element>(
    o: &GlobalView<'_, E>,
    d_o: &GlobalView<'_, E>,
    num_queries: usize,
    head_dim_value: usize,
    block_i: usize,
    out: &mut [f32],
) {
    let lanes = threads_per_row(block_i);
    for (row, delta) in out.iter_mut().enumerate().take(num_queries) {
        let (o_row, d_o_row) = (o.row(row, head_dim_value), d_o.row(row, head_dim_value));
        *delta = plane::striped_row_dot(o_row, d_o_row, lanes);
    }
}
