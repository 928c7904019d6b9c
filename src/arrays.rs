use aligned_vec::{AVec, ConstAlign};
use std::ops::{Index, IndexMut, Range};
use thiserror::Error;

const ALIGN: usize = 64;

#[derive(Debug, Eq, PartialEq, Error)]
pub enum ArrayError {
    #[error("region ({x}, {y}) {width}x{height} out of bounds of {bound_width}x{bound_height}")]
    RegionOutOfBounds {
        x: usize,
        y: usize,
        width: usize,
        height: usize,
        bound_width: usize,
        bound_height: usize,
    },
    #[error("dimension mismatch: expected {expected} elements, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("empty array")]
    Empty,
}

fn check_region(
    x: usize,
    y: usize,
    width: usize,
    height: usize,
    bound_width: usize,
    bound_height: usize,
) -> Result<(), ArrayError> {
    if width == 0 || height == 0 || x + width > bound_width || y + height > bound_height {
        return Err(ArrayError::RegionOutOfBounds {
            x,
            y,
            width,
            height,
            bound_width,
            bound_height,
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Array2D<T> {
    pub data: AVec<T, ConstAlign<ALIGN>>,
    pub width: usize,
    pub height: usize,
}

impl<T> Array2D<T> {
    pub fn from_slice(data: &[T], width: usize, height: usize) -> Result<Self, ArrayError>
    where
        T: Clone,
    {
        if data.len() != width * height {
            return Err(ArrayError::DimensionMismatch {
                expected: width * height,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data: AVec::from_slice(ALIGN, data),
        })
    }

    pub fn from_fill(value: T, width: usize, height: usize) -> Self
    where
        T: Clone + Copy,
    {
        let data: AVec<T, ConstAlign<ALIGN>> =
            AVec::from_iter(ALIGN, (0..width * height).map(|_| value));
        Self {
            width,
            height,
            data,
        }
    }

    pub fn fill(&mut self, value: T)
    where
        T: Clone,
    {
        self.data.fill(value)
    }

    #[inline(always)]
    pub fn get_row(&self, row: usize) -> &[T] {
        debug_assert!(row < self.height);
        &self.data[(self.width * row)..(self.width * row + self.width)]
    }

    pub fn get_row_mut(&mut self, row: usize) -> &mut [T] {
        debug_assert!(row < self.height);
        &mut self.data[(self.width * row)..(self.width * row + self.width)]
    }

    /// Inclusive `left..=right` part of a row.
    #[inline(always)]
    pub fn get_row_part(&self, row: usize, left: usize, right: usize) -> &[T] {
        debug_assert!(
            row < self.height,
            "Out-of-bounds row {row} < {}",
            self.height
        );
        debug_assert!(
            right < self.width,
            "Out-of-bounds right {right} < {}",
            self.width
        );
        &self.data[(self.width * row + left)..(self.width * row + right) + 1]
    }

    #[inline(always)]
    pub fn get_index(&self, x: usize, y: usize) -> usize {
        debug_assert!(self.width > x, "x={x} >= width={}", self.width);
        debug_assert!(self.height > y, "y={y} >= height={}", self.height);
        self.width * y + x
    }

    pub fn get_x_y_index(&self, ind: usize) -> (usize, usize) {
        debug_assert!(ind < self.data.len());
        (ind % self.width, ind / self.width)
    }

    /// Copies out a `width` x `height` window starting at (`x`, `y`).
    pub fn crop(&self, x: usize, y: usize, width: usize, height: usize) -> Result<Self, ArrayError>
    where
        T: Clone,
    {
        check_region(x, y, width, height, self.width, self.height)?;
        let data = AVec::from_iter(
            ALIGN,
            (y..y + height).flat_map(|row| self.get_row_part(row, x, x + width - 1).iter().cloned()),
        );
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Splits the array into disjoint mutable row bands. `ranges` must be consecutive and cover
    /// all rows (see `common::split_length_to_ranges`).
    pub fn split_rows_mut(&mut self, ranges: Vec<Range<usize>>) -> Vec<(Range<usize>, &mut [T])> {
        debug_assert_eq!(ranges.first().map(|r| r.start), Some(0));
        debug_assert_eq!(ranges.last().map(|r| r.end), Some(self.height));
        let width = self.width;
        let mut rest: &mut [T] = self.data.as_mut_slice();
        let mut bands = Vec::with_capacity(ranges.len());
        for rows in ranges {
            let (band, tail) = rest.split_at_mut(rows.len() * width);
            rest = tail;
            bands.push((rows, band));
        }
        bands
    }
}

impl<T> Index<(usize, usize)> for Array2D<T> {
    type Output = T;
    fn index(&self, (x, y): (usize, usize)) -> &Self::Output {
        &self.data[self.get_index(x, y)]
    }
}

impl<T> IndexMut<(usize, usize)> for Array2D<T> {
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut Self::Output {
        let idx = self.get_index(x, y);
        &mut self.data[idx]
    }
}

/// Band-interleaved raster buffer. Pixel (x, y) occupies `bands` consecutive `f32` values.
#[derive(Debug, Clone)]
pub struct MultiBandImage {
    pub data: AVec<f32, ConstAlign<ALIGN>>,
    pub width: usize,
    pub height: usize,
    pub bands: usize,
}

impl MultiBandImage {
    pub fn from_iter<I>(values: I, width: usize, height: usize, bands: usize) -> Result<Self, ArrayError>
    where
        I: IntoIterator<Item = f32>,
    {
        if width == 0 || height == 0 || bands == 0 {
            return Err(ArrayError::Empty);
        }
        let data = AVec::from_iter(ALIGN, values);
        if data.len() != width * height * bands {
            return Err(ArrayError::DimensionMismatch {
                expected: width * height * bands,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            bands,
        })
    }

    /// Image with every band of every pixel set to `value`.
    pub fn from_fill(value: f32, width: usize, height: usize, bands: usize) -> Self {
        Self {
            data: AVec::from_iter(ALIGN, (0..width * height * bands).map(|_| value)),
            width,
            height,
            bands,
        }
    }

    #[inline(always)]
    pub fn get_index(&self, x: usize, y: usize) -> usize {
        debug_assert!(self.width > x);
        debug_assert!(self.height > y);
        (self.width * y + x) * self.bands
    }

    #[inline(always)]
    pub fn get_pixel(&self, x: usize, y: usize) -> &[f32] {
        let idx = self.get_index(x, y);
        &self.data[idx..idx + self.bands]
    }

    #[inline(always)]
    pub fn get_row(&self, row: usize) -> &[f32] {
        debug_assert!(row < self.height);
        let stride = self.width * self.bands;
        &self.data[stride * row..stride * row + stride]
    }

    /// Copies out the window `width` x `height` starting at (`x`, `y`).
    pub fn window(&self, x: usize, y: usize, width: usize, height: usize) -> Result<Self, ArrayError> {
        check_region(x, y, width, height, self.width, self.height)?;
        let bands = self.bands;
        let data = AVec::from_iter(
            ALIGN,
            (y..y + height).flat_map(|row| {
                let start = self.get_index(x, row);
                self.data[start..start + width * bands].iter().copied()
            }),
        );
        Ok(Self {
            data,
            width,
            height,
            bands,
        })
    }
}

impl Index<(usize, usize)> for MultiBandImage {
    type Output = [f32];
    fn index(&self, (x, y): (usize, usize)) -> &Self::Output {
        self.get_pixel(x, y)
    }
}
