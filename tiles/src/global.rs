//! Strided views of global (device) memory.
//!
//! A view addresses a 2-D region: rows are `row_stride` elements apart and
//! columns are contiguous. Tensor-level strides (batch, head) are folded into
//! the view's base offset by the scheduler.

use std::marker::PhantomData;

use crate::element::Element;

/// Read-only view into a global tensor.
#[derive(Clone, Copy, Debug)]
pub struct GlobalView<'a, E> {
    data: &'a [E],
    offset: usize,
    row_stride: usize,
}

impl<'a, E: Element> GlobalView<'a, E> {
    pub fn new(data: &'a [E], offset: usize, row_stride: usize) -> Self {
        Self {
            data,
            offset,
            row_stride,
        }
    }

    /// The same tensor viewed from entry `(row, col)`.
    pub fn sub_view(self, row: usize, col: usize) -> Self {
        Self {
            offset: self.offset + row * self.row_stride + col,
            ..self
        }
    }

    /// The first `len` elements of row `r`.
    #[inline]
    pub fn row(&self, r: usize, len: usize) -> &'a [E] {
        let start = self.offset + r * self.row_stride;
        &self.data[start..start + len]
    }

    #[inline]
    pub fn at(&self, r: usize, c: usize) -> E {
        self.data[self.offset + r * self.row_stride + c]
    }
}

/// A mutable global buffer shared by every compute unit of a launch.
///
/// Units write disjoint elements of the same tensor (heads interleave inside
/// rows), which a `&mut [E]` cannot express. The buffer hands out
/// [`GlobalViewMut`]s whose disjointness is the caller's obligation.
pub struct RawBuffer<'a, E> {
    ptr: *mut E,
    len: usize,
    _marker: PhantomData<&'a mut [E]>,
}

impl<E> std::fmt::Debug for RawBuffer<'_, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawBuffer").field("len", &self.len).finish()
    }
}

// SAFETY: the buffer is only a handle to memory borrowed mutably for 'a.
// Element access goes through `GlobalViewMut`, whose constructor requires the
// caller to guarantee that concurrently live views never touch the same
// element.
unsafe impl<E: Send> Send for RawBuffer<'_, E> {}
unsafe impl<E: Send> Sync for RawBuffer<'_, E> {}

impl<'a, E: Element> RawBuffer<'a, E> {
    pub fn new(data: &'a mut [E]) -> Self {
        Self {
            ptr: data.as_mut_ptr(),
            len: data.len(),
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Opens a writable view starting at `offset`.
    ///
    /// # Safety
    ///
    /// Every element written through the returned view must not be read or
    /// written through any other view that is live at the same time.
    pub unsafe fn view(&self, offset: usize, row_stride: usize) -> GlobalViewMut<'_, E> {
        GlobalViewMut {
            ptr: self.ptr,
            len: self.len,
            offset,
            row_stride,
            _marker: PhantomData,
        }
    }
}

/// Writable view into a [`RawBuffer`]. Every access is bounds-checked against
/// the whole buffer.
pub struct GlobalViewMut<'b, E> {
    ptr: *mut E,
    len: usize,
    offset: usize,
    row_stride: usize,
    _marker: PhantomData<&'b mut [E]>,
}

// SAFETY: see `RawBuffer`; a view is moved into exactly one compute unit.
unsafe impl<E: Send> Send for GlobalViewMut<'_, E> {}

impl<E: Element> GlobalViewMut<'_, E> {
    /// Reborrows the same tensor viewed from entry `(row, col)`.
    pub fn sub_view(&mut self, row: usize, col: usize) -> GlobalViewMut<'_, E> {
        GlobalViewMut {
            ptr: self.ptr,
            len: self.len,
            offset: self.offset + row * self.row_stride + col,
            row_stride: self.row_stride,
            _marker: PhantomData,
        }
    }

    /// The first `len` elements of row `r`.
    #[inline]
    pub fn row_mut(&mut self, r: usize, len: usize) -> &mut [E] {
        let start = self.offset + r * self.row_stride;
        assert!(
            start + len <= self.len,
            "row {r} [{start}, {}) out of bounds for buffer of {}",
            start + len,
            self.len
        );
        // SAFETY: the range is in bounds of the borrowed buffer, and the
        // constructor contract guarantees no other live view aliases it.
        // `&mut self` prevents a second slice from this view.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(start), len) }
    }
}
