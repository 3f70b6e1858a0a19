use num_traits::Float;

use super::dim::{Dim, DimPhantom};

/// A tile in on-chip scratch memory, `R` rows by `C` columns, row-major.
///
/// Scratch tiles are shared by every bundle of a compute unit. They are
/// written between barriers and read by the stage that follows.
#[derive(Clone, Debug)]
pub struct St<F: Float, R: Dim, C: Dim> {
    data: Vec<F>,
    _phantom: DimPhantom<R, C>,
}

impl<F: Float, R: Dim, C: Dim> St<F, R, C> {
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

    pub fn as_mut_slice(&mut self) -> &mut [F] {
        &mut self.data
    }

    pub fn fill(&mut self, value: F) {
        self.data.fill(value);
    }

    pub fn copy_from(&mut self, other: &St<F, R, C>) {
        self.data.copy_from_slice(&other.data);
    }

    pub fn mul_scalar(&mut self, value: F) {
        for a in &mut self.data {
            *a = *a * value;
        }
    }
}

impl<F: Float, R: Dim, C: Dim> Default for St<F, R, C> {
    fn default() -> Self {
        Self::new()
    }
}
