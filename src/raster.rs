//! In-memory 8-bit rasters.
//!
//! [`RasterBuffer`] holds one decoded patch, [`Canvas`] the full assembled
//! image. Both store interleaved samples (`RGBRGB...`), row-major, with no row
//! padding.

use std::io::Cursor;

use image::{DynamicImage, ImageReader, ImageResult, Limits};

use crate::error::{FetchError, Result};
use crate::geometry::Extent;

/// Widest decoded sample layout: 16-bit RGBA.
const MAX_DECODED_BYTES_PER_PIXEL: u64 = 8;
/// Room for codec working buffers on top of the decoded pixels.
const DECODE_ALLOC_MARGIN: u64 = 64 * 1024 * 1024;

/// Decoder limits that admit a `width` x `height` image at any bit depth.
///
/// Never tighter than the codec defaults, so small patches keep the usual
/// allowance.
#[must_use]
pub fn patch_limits(width: usize, height: usize) -> Limits {
    let mut limits = Limits::default();
    let pixels = (width as u64).saturating_mul(height as u64);
    let needed = pixels
        .saturating_mul(MAX_DECODED_BYTES_PER_PIXEL)
        .saturating_add(DECODE_ALLOC_MARGIN);
    limits.max_alloc = Some(needed.max(limits.max_alloc.unwrap_or(0)));
    limits
}

/// Decoded pixels of a single patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterBuffer {
    pub width: usize,
    pub height: usize,
    /// 1 = gray, 2 = gray + alpha, 3 = RGB, 4 = RGBA
    pub channels: usize,
    pub pixels: Vec<u8>,
}

impl RasterBuffer {
    /// Wrap raw interleaved pixels, checking the buffer length.
    ///
    /// # Errors
    /// Returns [`FetchError::Assembly`] if `pixels` does not hold exactly
    /// `width * height * channels` bytes.
    pub fn new(width: usize, height: usize, channels: usize, pixels: Vec<u8>) -> Result<Self> {
        let expected = crate::casting::buffer_len(width, height, channels).map_err(FetchError::Assembly)?;
        if pixels.len() != expected {
            return Err(FetchError::Assembly(format!(
                "{width}x{height}x{channels} raster needs {expected} bytes, got {}",
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            pixels,
        })
    }

    /// Decode a compressed still image (JPEG, PNG, TIFF) into 8-bit samples.
    ///
    /// Higher bit depths are reduced to 8 bits; the channel layout is kept.
    ///
    /// # Errors
    /// Returns the codec error when the bytes are not a supported image.
    pub fn decode(bytes: &[u8]) -> ImageResult<Self> {
        Self::decode_with_limits(bytes, Limits::default())
    }

    /// Decode a patch whose size is known up front; allocation limits scale
    /// with that size instead of the codec defaults.
    pub fn decode_sized(bytes: &[u8], width: usize, height: usize) -> ImageResult<Self> {
        Self::decode_with_limits(bytes, patch_limits(width, height))
    }

    pub fn decode_with_limits(bytes: &[u8], limits: Limits) -> ImageResult<Self> {
        let mut reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
        reader.limits(limits);
        Ok(Self::from_dynamic(reader.decode()?))
    }

    /// Convert any decoded image into an 8-bit buffer with the same channel count.
    #[must_use]
    pub fn from_dynamic(image: DynamicImage) -> Self {
        let width = image.width() as usize;
        let height = image.height() as usize;
        let (channels, pixels) = match image.color().channel_count() {
            1 => (1, image.into_luma8().into_raw()),
            2 => (2, image.into_luma_alpha8().into_raw()),
            3 => (3, image.into_rgb8().into_raw()),
            _ => (4, image.into_rgba8().into_raw()),
        };
        Self {
            width,
            height,
            channels,
            pixels,
        }
    }

    /// Bytes in one row.
    #[inline]
    #[must_use]
    pub fn stride(&self) -> usize {
        self.width * self.channels
    }
}

/// Full-size output raster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Canvas {
    extent: Extent,
    channels: usize,
    pixels: Vec<u8>,
}

impl Canvas {
    /// Allocate a zero-filled (black) canvas.
    ///
    /// # Errors
    /// Returns [`FetchError::Assembly`] if the buffer size overflows or the
    /// channel count is not 1 to 4.
    pub fn zeroed(extent: Extent, channels: usize) -> Result<Self> {
        if !(1..=4).contains(&channels) {
            return Err(FetchError::Assembly(format!(
                "canvas channel count must be 1-4, got {channels}"
            )));
        }
        let len = extent.buffer_len(channels)?;
        Ok(Self {
            extent,
            channels,
            pixels: vec![0; len],
        })
    }

    /// Wrap an already assembled buffer.
    ///
    /// # Errors
    /// Returns [`FetchError::Assembly`] if the buffer length does not match.
    pub fn from_raster(raster: RasterBuffer) -> Result<Self> {
        let extent = Extent::new(raster.width, raster.height)?;
        if !(1..=4).contains(&raster.channels) {
            return Err(FetchError::Assembly(format!(
                "canvas channel count must be 1-4, got {}",
                raster.channels
            )));
        }
        let expected = extent.buffer_len(raster.channels)?;
        if raster.pixels.len() != expected {
            return Err(FetchError::Assembly(format!(
                "{extent} canvas needs {expected} bytes, got {}",
                raster.pixels.len()
            )));
        }
        Ok(Self {
            extent,
            channels: raster.channels,
            pixels: raster.pixels,
        })
    }

    #[must_use]
    pub fn extent(&self) -> Extent {
        self.extent
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.extent.width
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.extent.height
    }

    #[must_use]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Bytes in one row.
    #[inline]
    #[must_use]
    pub fn stride(&self) -> usize {
        self.extent.width * self.channels
    }

    /// One row of the canvas.
    #[inline]
    #[must_use]
    pub fn row(&self, y: usize) -> &[u8] {
        let stride = self.stride();
        &self.pixels[y * stride..(y + 1) * stride]
    }

    /// Copy `patch` into the canvas with its top-left corner at `origin`.
    ///
    /// # Errors
    /// Returns [`FetchError::Assembly`] if the channel counts differ or the
    /// patch would extend past the canvas.
    pub fn blit(&mut self, origin: (usize, usize), patch: &RasterBuffer) -> Result<()> {
        let (x, y) = origin;
        if patch.channels != self.channels {
            return Err(FetchError::Assembly(format!(
                "patch at ({x}, {y}) has {} channels, canvas has {}",
                patch.channels, self.channels
            )));
        }
        if x + patch.width > self.extent.width || y + patch.height > self.extent.height {
            return Err(FetchError::Assembly(format!(
                "{}x{} patch at ({x}, {y}) exceeds canvas {}",
                patch.width, patch.height, self.extent
            )));
        }

        let stride = self.stride();
        let patch_stride = patch.stride();
        if patch_stride == 0 {
            return Ok(());
        }
        let offset = x * self.channels;
        for (row, src) in patch.pixels.chunks_exact(patch_stride).enumerate() {
            let start = (y + row) * stride + offset;
            self.pixels[start..start + patch_stride].copy_from_slice(src);
        }
        Ok(())
    }

    /// Halve both dimensions (rounding up) with a 2x2 box filter.
    ///
    /// Edge pixels without a full 2x2 neighborhood average what is available.
    #[must_use]
    pub fn downsample_half(&self) -> Self {
        let src_w = self.extent.width;
        let src_h = self.extent.height;
        let dst_w = src_w.div_ceil(2);
        let dst_h = src_h.div_ceil(2);
        let c = self.channels;
        let mut pixels = vec![0u8; dst_w * dst_h * c];

        for dy in 0..dst_h {
            let y0 = dy * 2;
            let y1 = (y0 + 1).min(src_h - 1);
            for dx in 0..dst_w {
                let x0 = dx * 2;
                let x1 = (x0 + 1).min(src_w - 1);
                for ch in 0..c {
                    let sum = u32::from(self.pixels[(y0 * src_w + x0) * c + ch])
                        + u32::from(self.pixels[(y0 * src_w + x1) * c + ch])
                        + u32::from(self.pixels[(y1 * src_w + x0) * c + ch])
                        + u32::from(self.pixels[(y1 * src_w + x1) * c + ch]);
                    // Rounded mean of four u8 values always fits u8
                    #[allow(clippy::cast_possible_truncation)]
                    let mean = ((sum + 2) / 4) as u8;
                    pixels[(dy * dst_w + dx) * c + ch] = mean;
                }
            }
        }

        Self {
            extent: Extent {
                width: dst_w,
                height: dst_h,
            },
            channels: c,
            pixels,
        }
    }
}
