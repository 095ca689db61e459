//! Checked numeric conversions for slide-sized rasters.
//!
//! Whole-slide images routinely exceed 100 000 pixels per side, so pixel buffer
//! sizes are computed with checked arithmetic and narrowed explicitly where the
//! TIFF container needs 32-bit dimensions.
//!
//! # Assumptions
//!
//! ## Dimensions (`u64` ↔ `usize`)
//! Extents reported by an origin are parsed as `u64`. Buffer lengths must fit
//! `usize`; on 32-bit targets a large canvas fails here instead of wrapping.
//!
//! ## TIFF dimensions (`usize` → `u32`)
//! `ImageWidth`/`ImageLength` are 32-bit fields even in BigTIFF.

use std::convert::TryFrom;

/// Convert a `u64` to `usize`, failing on 32-bit overflow.
///
/// # Errors
/// Returns an error string if the value exceeds `usize::MAX`.
#[inline]
pub fn u64_to_usize(value: u64) -> Result<usize, String> {
    usize::try_from(value).map_err(|_| {
        format!("Value {value} exceeds maximum addressable size on this platform")
    })
}

/// Convert a `usize` to `u32`, failing on 64-bit overflow.
///
/// # Errors
/// Returns an error string if the value exceeds `u32::MAX`.
#[inline]
pub fn usize_to_u32(value: usize) -> Result<u32, String> {
    u32::try_from(value).map_err(|_| format!("Value {value} exceeds u32 maximum"))
}

/// Integer division rounding up. `divisor` must be non-zero.
#[inline]
#[must_use]
pub fn ceil_div(value: usize, divisor: usize) -> usize {
    value.div_ceil(divisor)
}

/// Dimension of a full-resolution axis at a power-of-two pyramid level,
/// rounded up: `ceil(full / 2^level)`.
///
/// # Errors
/// Returns an error string if the level is too deep to express as a shift or
/// the result does not fit `usize`.
pub fn scale_to_level(full: u64, level: u32) -> Result<usize, String> {
    let divisor = 1u64
        .checked_shl(level)
        .ok_or_else(|| format!("Pyramid level {level} is too deep"))?;
    u64_to_usize(full.div_ceil(divisor))
}

/// Length in bytes of an interleaved 8-bit pixel buffer.
///
/// # Errors
/// Returns an error string if `width * height * channels` overflows.
pub fn buffer_len(width: usize, height: usize, channels: usize) -> Result<usize, String> {
    width
        .checked_mul(height)
        .and_then(|n| n.checked_mul(channels))
        .ok_or_else(|| format!("Pixel buffer {width}x{height}x{channels} overflows usize"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u64_to_usize() {
        assert!(u64_to_usize(0).is_ok());
        assert!(u64_to_usize(1000).is_ok());
        #[cfg(target_pointer_width = "64")]
        assert!(u64_to_usize(u64::MAX).is_ok());
    }

    #[test]
    fn test_usize_to_u32() {
        assert_eq!(usize_to_u32(0), Ok(0));
        assert_eq!(usize_to_u32(200_000), Ok(200_000));
        #[cfg(target_pointer_width = "64")]
        assert!(usize_to_u32(u32::MAX as usize + 1).is_err());
    }

    #[test]
    fn test_ceil_div() {
        assert_eq!(ceil_div(20_000, 8192), 3);
        assert_eq!(ceil_div(16_384, 8192), 2);
        assert_eq!(ceil_div(1, 8192), 1);
        assert_eq!(ceil_div(0, 8192), 0);
    }

    #[test]
    fn test_scale_to_level() {
        assert_eq!(scale_to_level(100_001, 0), Ok(100_001));
        assert_eq!(scale_to_level(100_001, 1), Ok(50_001));
        assert_eq!(scale_to_level(100_000, 4), Ok(6_250));
        assert_eq!(scale_to_level(100_001, 4), Ok(6_251));
        assert_eq!(scale_to_level(5, 10), Ok(1));
        assert!(scale_to_level(5, 64).is_err());
    }

    #[test]
    fn test_buffer_len() {
        assert_eq!(buffer_len(4, 3, 3), Ok(36));
        assert!(buffer_len(usize::MAX, 2, 1).is_err());
    }
}
