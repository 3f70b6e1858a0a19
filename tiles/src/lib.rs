//! Tile primitives for fused attention kernels.
//!
//! The types here mirror the layout of a GPU compute unit: `St` is a tile
//! in on-chip scratch memory shared by the unit, `Rt` is an accumulator
//! fragment, and the `plane` module holds the cooperative load, store and
//! reduction routines a unit uses to move data between global memory and
//! its tiles. Tile contents are always `f32`; global memory may hold any
//! [`Element`](element::Element).

#![allow(
    clippy::len_without_is_empty,
    reason = "Empty tiles aren't a thing, so this method would be confusing"
)]
#![allow(clippy::needless_range_loop)]

pub mod element;
pub mod gemm;
pub mod global;
pub mod plane;
pub mod tiles;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// We could parametrize this
// but right now it's not worth the effort
pub const LINE_SIZE: usize = 4;

/// Lanes in one execution bundle.
pub const PLANE_DIM: usize = 32;

/// Threads in one compute unit (four bundles).
pub const UNIT_THREADS: usize = 4 * PLANE_DIM;

/// Rounds `value` up to the next multiple of `multiple`.
pub const fn align_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}
