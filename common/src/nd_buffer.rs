use std::ops::{Index, IndexMut};

/// Dense N-dimensional buffer in row-major order (last axis contiguous).
#[derive(Debug, Clone, PartialEq)]
pub struct NdBuffer<T> {
    data: Vec<T>,
    shape: Vec<usize>,
}

pub fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

impl<T> NdBuffer<T> {
    pub fn new(shape: Vec<usize>, data: Vec<T>) -> Self {
        assert_eq!(
            data.len(),
            shape.iter().product::<usize>(),
            "data length must equal the product of the shape"
        );
        Self { data, shape }
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn strides(&self) -> Vec<usize> {
        row_major_strides(&self.shape)
    }

    #[inline]
    pub fn offset_of(&self, coords: &[usize]) -> usize {
        debug_assert_eq!(coords.len(), self.shape.len());
        let strides = self.strides();
        coords
            .iter()
            .zip(strides.iter())
            .map(|(c, s)| c * s)
            .sum()
    }

    #[inline]
    pub fn get(&self, coords: &[usize]) -> &T {
        debug_assert!(coords.iter().zip(self.shape.iter()).all(|(c, s)| c < s));
        &self.data[self.offset_of(coords)]
    }

    #[inline]
    pub fn get_mut(&mut self, coords: &[usize]) -> &mut T {
        debug_assert!(coords.iter().zip(self.shape.iter()).all(|(c, s)| c < s));
        let offset = self.offset_of(coords);
        &mut self.data[offset]
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    #[inline]
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Reinterprets the buffer with a new shape of the same total length.
    pub fn reshape(self, shape: Vec<usize>) -> Self {
        assert_eq!(
            self.data.len(),
            shape.iter().product::<usize>(),
            "reshape must preserve the element count"
        );
        Self {
            data: self.data,
            shape,
        }
    }
}

impl<T: Default + Clone> NdBuffer<T> {
    pub fn new_default(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            data: vec![T::default(); len],
            shape,
        }
    }
}

impl<T: Clone> NdBuffer<T> {
    pub fn new_filled(shape: Vec<usize>, value: T) -> Self {
        let len = shape.iter().product();
        Self {
            data: vec![value; len],
            shape,
        }
    }
}

impl<T: Copy> NdBuffer<T> {
    /// Copies out the axis-aligned window `[start, start + size)`.
    pub fn sub_window(&self, start: &[usize], size: &[usize]) -> NdBuffer<T> {
        assert_eq!(start.len(), self.shape.len());
        assert_eq!(size.len(), self.shape.len());
        assert!(
            start
                .iter()
                .zip(size.iter())
                .zip(self.shape.iter())
                .all(|((st, sz), dim)| st + sz <= *dim),
            "window out of bounds"
        );

        let mut data = Vec::with_capacity(size.iter().product());
        if size.iter().all(|&s| s > 0) {
            let strides = self.strides();
            let base: usize = start
                .iter()
                .zip(strides.iter())
                .map(|(c, s)| c * s)
                .sum();
            gather_window(&self.data, &strides, base, size, &mut data);
        }
        NdBuffer {
            data,
            shape: size.to_vec(),
        }
    }

    /// Copies the window `[src_start, src_start + size)` of `src` into
    /// `[dst_start, dst_start + size)` of `self`.
    pub fn copy_window_from(
        &mut self,
        src: &NdBuffer<T>,
        src_start: &[usize],
        dst_start: &[usize],
        size: &[usize],
    ) {
        copy_window(
            &src.data, &src.shape, src_start, &mut self.data, &self.shape, dst_start, size,
        );
    }
}

/// Copies an axis-aligned window between two row-major buffers, innermost
/// dimension as one contiguous run.
pub fn copy_window<T: Copy>(
    src: &[T],
    src_shape: &[usize],
    src_start: &[usize],
    dst: &mut [T],
    dst_shape: &[usize],
    dst_start: &[usize],
    size: &[usize],
) {
    assert_eq!(src_shape.len(), dst_shape.len());
    assert_eq!(src_shape.len(), size.len());
    assert!(src_start
        .iter()
        .zip(size.iter())
        .zip(src_shape.iter())
        .all(|((st, sz), dim)| st + sz <= *dim));
    assert!(dst_start
        .iter()
        .zip(size.iter())
        .zip(dst_shape.iter())
        .all(|((st, sz), dim)| st + sz <= *dim));

    if size.iter().any(|&s| s == 0) {
        return;
    }
    if size.is_empty() {
        dst[0] = src[0];
        return;
    }

    let src_strides = row_major_strides(src_shape);
    let dst_strides = row_major_strides(dst_shape);
    let src_base: usize = src_start
        .iter()
        .zip(src_strides.iter())
        .map(|(c, s)| c * s)
        .sum();
    let dst_base: usize = dst_start
        .iter()
        .zip(dst_strides.iter())
        .map(|(c, s)| c * s)
        .sum();

    copy_window_rec(
        src,
        &src_strides,
        src_base,
        dst,
        &dst_strides,
        dst_base,
        size,
    );
}

fn gather_window<T: Copy>(
    src: &[T],
    strides: &[usize],
    base: usize,
    size: &[usize],
    out: &mut Vec<T>,
) {
    if size.is_empty() {
        out.push(src[base]);
        return;
    }
    if size.len() == 1 {
        out.extend_from_slice(&src[base..base + size[0]]);
        return;
    }
    for i in 0..size[0] {
        gather_window(src, &strides[1..], base + i * strides[0], &size[1..], out);
    }
}

fn copy_window_rec<T: Copy>(
    src: &[T],
    src_strides: &[usize],
    src_base: usize,
    dst: &mut [T],
    dst_strides: &[usize],
    dst_base: usize,
    size: &[usize],
) {
    if size.len() == 1 {
        let run = size[0];
        dst[dst_base..dst_base + run].copy_from_slice(&src[src_base..src_base + run]);
        return;
    }
    for i in 0..size[0] {
        copy_window_rec(
            src,
            &src_strides[1..],
            src_base + i * src_strides[0],
            dst,
            &dst_strides[1..],
            dst_base + i * dst_strides[0],
            &size[1..],
        );
    }
}

impl<T> Index<&[usize]> for NdBuffer<T> {
    type Output = T;

    #[inline]
    fn index(&self, coords: &[usize]) -> &Self::Output {
        self.get(coords)
    }
}

impl<T> IndexMut<&[usize]> for NdBuffer<T> {
    #[inline]
    fn index_mut(&mut self, coords: &[usize]) -> &mut Self::Output {
        self.get_mut(coords)
    }
}

impl<T> From<NdBuffer<T>> for Vec<T> {
    #[inline]
    fn from(buffer: NdBuffer<T>) -> Self {
        buffer.data
    }
}
