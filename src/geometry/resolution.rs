//! Physical pixel size and output resolution.
//!
//! Origins report the physical size of one pixel per pyramid level in
//! micrometers. The output file stores the inverse, a pixel density, using
//! `pixels_per_mm = 1e6 / micrometers_per_pixel`.

use serde::Deserialize;
use tracing::warn;

use crate::error::{FetchError, Result};

/// Pixel density used when the origin reports no usable pixel size.
pub const DEFAULT_FALLBACK_PIXELS_PER_MM: f64 = 4000.0;

const MICRONS_SCALE: f64 = 1_000_000.0;

/// Physical size of one pixel, in micrometers, on both axes.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct VoxelSize {
    pub x: f64,
    pub y: f64,
}

/// Pixel density on both axes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelsPerMm {
    pub x: f64,
    pub y: f64,
}

impl PixelsPerMm {
    /// Same density on both axes.
    #[must_use]
    pub fn uniform(value: f64) -> Self {
        Self { x: value, y: value }
    }

    /// Invert a physical pixel size into a pixel density.
    ///
    /// # Errors
    /// Returns [`FetchError::Resolution`] for zero, negative or non-finite
    /// sizes, which would otherwise produce an infinite or negative density.
    pub fn from_voxel_size(voxel: &VoxelSize) -> Result<Self> {
        Ok(Self {
            x: microns_to_pixels_per_mm('x', voxel.x)?,
            y: microns_to_pixels_per_mm('y', voxel.y)?,
        })
    }

    /// Back to micrometers per pixel.
    #[must_use]
    pub fn to_voxel_size(&self) -> VoxelSize {
        VoxelSize {
            x: MICRONS_SCALE / self.x,
            y: MICRONS_SCALE / self.y,
        }
    }

    /// Density per centimeter, the unit TIFF resolution tags are written in.
    #[must_use]
    pub fn per_centimeter(&self) -> (f64, f64) {
        (self.x * 10.0, self.y * 10.0)
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.x > 0.0 && self.y > 0.0
    }
}

fn microns_to_pixels_per_mm(axis: char, microns: f64) -> Result<f64> {
    if !microns.is_finite() || microns <= 0.0 {
        return Err(FetchError::Resolution { axis, value: microns });
    }
    Ok(MICRONS_SCALE / microns)
}

/// Choose the resolution written to the output file.
///
/// An unknown pixel size, or one reported as exactly zero on either axis, is
/// replaced by `fallback` and the substitution is logged. Negative or
/// non-finite sizes are errors.
///
/// # Errors
/// Returns [`FetchError::Resolution`] for negative or non-finite sizes, and
/// [`FetchError::Config`] if `fallback` itself is not a positive density.
pub fn output_resolution(voxel: Option<&VoxelSize>, fallback: f64) -> Result<PixelsPerMm> {
    let fallback = PixelsPerMm::uniform(fallback);
    if !fallback.is_valid() {
        return Err(FetchError::Config(format!(
            "fallback resolution must be a positive density, got {}",
            fallback.x
        )));
    }

    match voxel {
        None => {
            warn!(fallback_pixels_per_mm = fallback.x, "Pixel size unknown, using fallback resolution");
            Ok(fallback)
        }
        Some(v) if v.x == 0.0 || v.y == 0.0 => {
            warn!(
                voxel_x = v.x,
                voxel_y = v.y,
                fallback_pixels_per_mm = fallback.x,
                "Origin reported zero pixel size, using fallback resolution"
            );
            Ok(fallback)
        }
        Some(v) => PixelsPerMm::from_voxel_size(v),
    }
}
