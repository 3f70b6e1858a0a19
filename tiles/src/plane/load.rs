use crate::{element::Element, global::GlobalView, tiles::{Dim, St}};

/// Loads the leading `rows` x `cols` block of `src` into `dst`, widening to
/// `f32`. Everything outside that block is zero-filled so partial tiles never
/// leak stale values into the next product.
pub fn load_st_direct<E: Element, R: Dim, C: Dim>(
    dst: &mut St<f32, R, C>,
    src: &GlobalView<'_, E>,
    rows: usize,
    cols: usize,
) {
    let rows = rows.min(R::VALUE);
    let cols = cols.min(C::VALUE);

    for r in 0..R::VALUE {
        let dst_row = dst.row_mut(r);
        if r < rows {
            for (d, s) in dst_row.iter_mut().zip(src.row(r, cols)) {
                *d = s.to_f32();
            }
            dst_row[cols..].fill(0.0);
        } else {
            dst_row.fill(0.0);
        }
    }
}

/// Loads `len` consecutive `f32` values, padding the rest of `dst` with `pad`.
pub fn load_rv(dst: &mut [f32], src: &[f32], len: usize, pad: f32) {
    let len = len.min(dst.len());
    dst[..len].copy_from_slice(&src[..len]);
    dst[len..].fill(pad);
}
