use num_traits::Float;

use super::dim::{Dim, DimPhantom};

/// An accumulator fragment, `R` rows by `C` columns, row-major.
///
/// On a GPU this is spread over the registers of the unit's threads; here it
/// is one contiguous buffer. It is the output operand of every `mma_*`.
#[derive(Clone, Debug)]
pub struct Rt<F: Float, R: Dim, C: Dim> {
    data: Vec<F>,
    _phantom: DimPhantom<R, C>,
}

impl<F: Float, R: Dim, C: Dim> Rt<F, R, C> {
    pub const ROWS: usize = R::VALUE;
    pub const COLS: usize = C::VALUE;
    pub const SIZE: usize = R::VALUE * C::VALUE;

    pub fn new() -> Self {
        Self {
            data: vec![F::zero(); Self::SIZE],
            _phantom: DimPhantom::default(),
        }
    }

    pub fn len(&self) -> usize {
        Self::SIZE
    }

    pub fn zero(&mut self) {
        self.data.fill(F::zero());
    }

    #[inline]
    pub fn at(&self, r: usize, c: usize) -> F {
        self.data[r * C::VALUE + c]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, value: F) {
        self.data[r * C::VALUE + c] = value;
    }

    #[inline]
    pub fn row(&self, r: usize) -> &[F] {
        &self.data[r * C::VALUE..(r + 1) * C::VALUE]
    }

    #[inline]
    pub fn row_mut(&mut self, r: usize) -> &mut [F] {
        &mut self.data[r * C::VALUE..(r + 1) * C::VALUE]
    }

    pub fn as_slice(&self) -> &[F] {
        &self.data
    }

    /// Reloads the fragment from a row-major buffer of exactly `SIZE` elements.
    pub fn copy_from_slice(&mut self, src: &[F]) {
        self.data.copy_from_slice(src);
    }

    /// Parks the fragment in a row-major buffer of exactly `SIZE` elements.
    pub fn copy_to_slice(&self, dst: &mut [F]) {
        dst.copy_from_slice(&self.data);
    }
}

impl<F: Float, R: Dim, C: Dim> Default for Rt<F, R, C> {
    fn default() -> Self {
        Self::new()
    }
}
