//! Pixel-space geometry: image extents and physical resolution.

pub mod resolution;

use crate::casting::{buffer_len, scale_to_level};
use crate::error::{FetchError, Result};

/// Size of an image in pixels at one pyramid level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    pub width: usize,
    pub height: usize,
}

impl Extent {
    /// Create an extent, rejecting empty dimensions.
    ///
    /// # Errors
    /// Returns [`FetchError::InvalidGrid`] if either dimension is zero.
    pub fn new(width: usize, height: usize) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(FetchError::InvalidGrid(format!(
                "extent must be positive, got {width}x{height}"
            )));
        }
        Ok(Self { width, height })
    }

    /// Scale a full-resolution extent down to `level`, rounding up.
    ///
    /// # Errors
    /// Returns [`FetchError::Metadata`] if the level cannot be applied or the
    /// result is empty.
    pub fn at_level(full_width: u64, full_height: u64, level: u32) -> Result<Self> {
        let width = scale_to_level(full_width, level).map_err(FetchError::Metadata)?;
        let height = scale_to_level(full_height, level).map_err(FetchError::Metadata)?;
        Self::new(width, height).map_err(|_| {
            FetchError::Metadata(format!(
                "full extent {full_width}x{full_height} is empty at level {level}"
            ))
        })
    }

    /// Number of pixels covered.
    #[must_use]
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Byte length of an interleaved 8-bit buffer of this extent.
    ///
    /// # Errors
    /// Returns [`FetchError::Assembly`] on overflow.
    pub fn buffer_len(&self, channels: usize) -> Result<usize> {
        buffer_len(self.width, self.height, channels).map_err(FetchError::Assembly)
    }
}

impl std::fmt::Display for Extent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
