use crate::{
    element::Element,
    gemm::StoreMode,
    global::GlobalViewMut,
    tiles::{Dim, Rt},
};

/// Writes `alpha * src` into the leading `rows` x `cols` block of `dst`.
///
/// With [`StoreMode::Accumulate`] the destination is read, added to and
/// rewritten in its own element type.
pub fn store_rt<E: Element, R: Dim, C: Dim>(
    src: &Rt<f32, R, C>,
    dst: &mut GlobalViewMut<'_, E>,
    rows: usize,
    cols: usize,
    alpha: f32,
    mode: StoreMode,
) {
    let rows = rows.min(R::VALUE);
    let cols = cols.min(C::VALUE);

    for r in 0..rows {
        let src_row = &src.row(r)[..cols];
        let dst_row = dst.row_mut(r, cols);
        match mode {
            StoreMode::Overwrite => {
                for (d, &s) in dst_row.iter_mut().zip(src_row) {
                    *d = E::from_f32(alpha * s);
                }
            }
            StoreMode::Accumulate => {
                for (d, &s) in dst_row.iter_mut().zip(src_row) {
                    *d = E::from_f32(d.to_f32() + alpha * s);
                }
            }
        }
    }
}

/// Sets the leading `rows` x `cols` block of `dst` to `value`.
pub fn fill_rows<E: Element>(dst: &mut GlobalViewMut<'_, E>, rows: usize, cols: usize, value: E) {
    for r in 0..rows {
        dst.row_mut(r, cols).fill(value);
    }
}
