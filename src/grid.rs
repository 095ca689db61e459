//! Patch grid planning.
//!
//! A [`GridLayout`] partitions an [`Extent`] into square patches of a nominal
//! size, enumerated row-major. Patches in the last column and row are clipped
//! to the image boundary rather than padded, so the patches tile the extent
//! exactly.
//!
//! ```rust
//! use slidefetch::{Extent, GridLayout};
//!
//! let extent = Extent::new(20_000, 10_000).unwrap();
//! let grid = GridLayout::plan(extent, 8192).unwrap();
//! assert_eq!((grid.columns, grid.rows), (3, 2));
//! assert_eq!(grid.patches()[2].width(), 3616);
//! ```

use crate::casting::ceil_div;
use crate::error::{FetchError, Result};
use crate::geometry::Extent;

/// One rectangular region of the grid, `start` inclusive and `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatchDescriptor {
    /// Position in row-major order
    pub index: usize,
    pub row: usize,
    pub column: usize,
    /// Top-left pixel (x, y)
    pub start: (usize, usize),
    /// Bottom-right pixel (x, y), exclusive
    pub end: (usize, usize),
}

impl PatchDescriptor {
    #[inline]
    #[must_use]
    pub fn width(&self) -> usize {
        self.end.0 - self.start.0
    }

    #[inline]
    #[must_use]
    pub fn height(&self) -> usize {
        self.end.1 - self.start.1
    }

    #[must_use]
    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    /// Whether two patches share at least one pixel.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start.0 < other.end.0
            && other.start.0 < self.end.0
            && self.start.1 < other.end.1
            && other.start.1 < self.end.1
    }
}

/// Row-major patch sequence covering an extent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridLayout {
    pub extent: Extent,
    pub patch_size: usize,
    pub rows: usize,
    pub columns: usize,
    patches: Vec<PatchDescriptor>,
}

impl GridLayout {
    /// Plan the grid for `extent` with square patches of `patch_size` pixels.
    ///
    /// # Errors
    /// Returns [`FetchError::InvalidGrid`] if `patch_size` is zero.
    pub fn plan(extent: Extent, patch_size: usize) -> Result<Self> {
        if patch_size == 0 {
            return Err(FetchError::InvalidGrid("patch size must be positive".to_string()));
        }

        let columns = ceil_div(extent.width, patch_size);
        let rows = ceil_div(extent.height, patch_size);
        let mut patches = Vec::with_capacity(rows * columns);

        for row in 0..rows {
            let y = row * patch_size;
            let end_y = (y + patch_size).min(extent.height);
            for column in 0..columns {
                let x = column * patch_size;
                let end_x = (x + patch_size).min(extent.width);
                patches.push(PatchDescriptor {
                    index: patches.len(),
                    row,
                    column,
                    start: (x, y),
                    end: (end_x, end_y),
                });
            }
        }

        Ok(Self {
            extent,
            patch_size,
            rows,
            columns,
            patches,
        })
    }

    /// Patches in row-major order.
    #[must_use]
    pub fn patches(&self) -> &[PatchDescriptor] {
        &self.patches
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Patch at a grid position.
    #[must_use]
    pub fn get(&self, row: usize, column: usize) -> Option<&PatchDescriptor> {
        if row >= self.rows || column >= self.columns {
            return None;
        }
        self.patches.get(row * self.columns + column)
    }

    /// Patches of one grid row, left to right.
    #[must_use]
    pub fn row(&self, row: usize) -> &[PatchDescriptor] {
        let start = (row * self.columns).min(self.patches.len());
        let end = (start + self.columns).min(self.patches.len());
        &self.patches[start..end]
    }
}

impl<'a> IntoIterator for &'a GridLayout {
    type Item = &'a PatchDescriptor;
    type IntoIter = std::slice::Iter<'a, PatchDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.patches.iter()
    }
}
