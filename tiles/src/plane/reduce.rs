use crate::{
    element::Element,
    tiles::{Dim, St},
};

/// XOR butterfly over a bundle of lanes. On return every lane holds the sum
/// of all lanes. The lane count must be a power of two.
pub fn butterfly_sum(lanes: &mut [f32]) -> f32 {
    let n = lanes.len();
    debug_assert!(n.is_power_of_two(), "lane count {n} is not a power of two");

    let mut partner = vec![0.0f32; n];
    let mut mask = 1;
    while mask < n {
        partner.copy_from_slice(lanes);
        for (lane, value) in lanes.iter_mut().enumerate() {
            *value += partner[lane ^ mask];
        }
        mask <<= 1;
    }
    lanes[0]
}

/// Dot product of two rows, striped over `lanes` lanes: lane `l` owns
/// columns `l, l + lanes, ...`, then the lanes are combined with
/// [`butterfly_sum`].
pub fn striped_row_dot<E: Element>(a: &[E], b: &[E], lanes: usize) -> f32 {
    let mut partial = vec![0.0f32; lanes];
    for (col, (x, y)) in a.iter().zip(b).enumerate() {
        partial[col % lanes] += x.to_f32() * y.to_f32();
    }
    butterfly_sum(&mut partial)
}

/// Adds the column sums over the leading `rows` rows of `tile` into `out`.
/// `out` may be shorter than a tile row; extra columns are ignored.
pub fn reduce_st_cols<R: Dim, C: Dim>(tile: &St<f32, R, C>, rows: usize, out: &mut [f32]) {
    let cols = out.len().min(C::VALUE);
    for r in 0..rows.min(R::VALUE) {
        for (o, &v) in out[..cols].iter_mut().zip(tile.row(r)) {
            *o += v;
        }
    }
}
