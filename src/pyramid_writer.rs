//! Pyramidal BigTIFF writer for assembled canvases
//!
//! This module writes a [`Canvas`] as a tiled, multi-resolution, JPEG-compressed
//! BigTIFF, the layout whole-slide viewers expect. Every pyramid level is its
//! own IFD in the main chain; reduced levels are marked with
//! `NewSubfileType = 1`. Physical resolution is stored in pixels per
//! centimeter.
//!
//! # Example
//!
//! ```rust,no_run
//! use slidefetch::{Canvas, Extent, PyramidWriter, VoxelSize, WriterOptions};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let canvas = Canvas::zeroed(Extent::new(4096, 2048)?, 3)?;
//!
//!     PyramidWriter::new(&canvas)
//!         .voxel_size(Some(VoxelSize { x: 250.0, y: 250.0 }))
//!         .options(WriterOptions { rgb_jpeg: true, ..Default::default() })
//!         .write_atomic("slide.tif")?;
//!     Ok(())
//! }
//! ```

use std::borrow::Cow;
use std::io::{BufWriter, Cursor, Seek, Write};
use std::path::Path;

use jpeg_encoder::{ColorType, Encoder, SamplingFactor};
use serde::Deserialize;
use tiff::encoder::{Rational, TiffEncoder, TiffKind};
use tiff::tags::Tag;
use tracing::{debug, info};

use crate::casting::{ceil_div, usize_to_u32};
use crate::error::{FetchError, Result};
use crate::geometry::resolution::{output_resolution, PixelsPerMm, VoxelSize, DEFAULT_FALLBACK_PIXELS_PER_MM};
use crate::raster::Canvas;

// Tag IDs without a named variant in the tiff crate
const TAG_YCBCR_SUBSAMPLING: u16 = 530;

// Tag values
const COMPRESSION_JPEG: u16 = 7;
const PHOTOMETRIC_BLACK_IS_ZERO: u16 = 1;
const PHOTOMETRIC_RGB: u16 = 2;
const PHOTOMETRIC_YCBCR: u16 = 6;
const PLANAR_CHUNKY: u16 = 1;
const RESOLUTION_UNIT_CENTIMETER: u16 = 3;
const SUBFILE_REDUCED_RESOLUTION: u32 = 1;

// APP14 "Adobe" segment, version 100, transform 0: components are stored
// as given, without a color transform
const ADOBE_APP14: &[u8] = b"Adobe\x00\x64\x00\x00\x00\x00\x00";
const JPEG_APP0: [u8; 2] = [0xFF, 0xE0];

const SOFTWARE: &str = concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"));

/// Output encoding options
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WriterOptions {
    /// Tile edge in pixels, a multiple of 16
    pub tile_size: u32,
    /// JPEG quality, 1-100
    pub quality: u8,
    /// Store tile components as RGB instead of YCbCr
    pub rgb_jpeg: bool,
    /// Density written when the source pixel size is unknown or zero
    pub fallback_pixels_per_mm: f64,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            tile_size: 256,
            quality: 75,
            rgb_jpeg: false,
            fallback_pixels_per_mm: DEFAULT_FALLBACK_PIXELS_PER_MM,
        }
    }
}

impl WriterOptions {
    /// # Errors
    /// Returns [`FetchError::Config`] for unusable tile sizes, qualities or
    /// fallback densities.
    pub fn validate(&self) -> Result<()> {
        if self.tile_size < 16 || self.tile_size % 16 != 0 || self.tile_size > u32::from(u16::MAX) {
            return Err(FetchError::Config(format!(
                "tile_size must be a positive multiple of 16 below 65536, got {}",
                self.tile_size
            )));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(FetchError::Config(format!(
                "quality must be between 1 and 100, got {}",
                self.quality
            )));
        }
        if !(self.fallback_pixels_per_mm.is_finite() && self.fallback_pixels_per_mm > 0.0) {
            return Err(FetchError::Config(format!(
                "fallback_pixels_per_mm must be positive, got {}",
                self.fallback_pixels_per_mm
            )));
        }
        Ok(())
    }

    /// Photometric interpretation for a given number of stored samples.
    fn photometric(&self, samples: usize) -> u16 {
        match (samples, self.rgb_jpeg) {
            (1, _) => PHOTOMETRIC_BLACK_IS_ZERO,
            (_, true) => PHOTOMETRIC_RGB,
            (_, false) => PHOTOMETRIC_YCBCR,
        }
    }
}

/// Builder for writing one canvas
pub struct PyramidWriter<'a> {
    canvas: &'a Canvas,
    voxel_size: Option<VoxelSize>,
    resolution: Option<PixelsPerMm>,
    options: WriterOptions,
}

impl<'a> PyramidWriter<'a> {
    #[must_use]
    pub fn new(canvas: &'a Canvas) -> Self {
        Self {
            canvas,
            voxel_size: None,
            resolution: None,
            options: WriterOptions::default(),
        }
    }

    /// Physical pixel size of the canvas; `None` or zero falls back to the
    /// configured density.
    #[must_use]
    pub fn voxel_size(mut self, voxel_size: Option<VoxelSize>) -> Self {
        self.voxel_size = voxel_size;
        self
    }

    /// Write an already resolved density, bypassing the pixel size.
    #[must_use]
    pub fn resolution(mut self, resolution: PixelsPerMm) -> Self {
        self.resolution = Some(resolution);
        self
    }

    #[must_use]
    pub fn options(mut self, options: WriterOptions) -> Self {
        self.options = options;
        self
    }

    /// Write to `path` through a temporary file in the same directory.
    ///
    /// The file only appears at `path` once it is complete; on failure the
    /// temporary file is removed and `path` is left untouched.
    pub fn write_atomic<P: AsRef<Path>>(self, path: P) -> Result<()> {
        let path = path.as_ref();
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut temp = tempfile::Builder::new()
            .prefix(".slidefetch-")
            .suffix(".tif.partial")
            .tempfile_in(parent)?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            self.write_to(&mut writer)?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| FetchError::Io(e.error))?;
        info!(path = %path.display(), "Pyramid written");
        Ok(())
    }

    /// Write to any writer that implements Write + Seek
    pub fn write_to<W: Write + Seek>(self, writer: W) -> Result<()> {
        self.options.validate()?;
        let resolution = match self.resolution {
            Some(resolution) if resolution.is_valid() => resolution,
            Some(resolution) => {
                return Err(FetchError::Config(format!(
                    "output resolution must be positive, got {} x {} px/mm",
                    resolution.x, resolution.y
                )))
            }
            None => output_resolution(self.voxel_size.as_ref(), self.options.fallback_pixels_per_mm)?,
        };
        let tile = self.options.tile_size as usize;

        let mut encoder = TiffEncoder::new_big(writer)?;
        let mut level: Cow<'_, Canvas> = Cow::Borrowed(self.canvas);
        let mut index = 0u32;
        loop {
            let scale = f64::from(1u32 << index.min(31));
            let level_resolution = PixelsPerMm {
                x: resolution.x / scale,
                y: resolution.y / scale,
            };
            self.write_level(&mut encoder, &level, index, level_resolution)?;

            if level.width() <= tile && level.height() <= tile {
                break;
            }
            level = Cow::Owned(level.downsample_half());
            index += 1;
        }
        debug!(levels = index + 1, "Pyramid levels encoded");
        Ok(())
    }

    /// Encode into an in-memory BigTIFF.
    pub fn to_bytes(self) -> Result<Vec<u8>> {
        let mut buffer = Cursor::new(Vec::new());
        self.write_to(&mut buffer)?;
        Ok(buffer.into_inner())
    }

    fn write_level<W: Write + Seek, K: TiffKind>(
        &self,
        encoder: &mut TiffEncoder<W, K>,
        level: &Canvas,
        index: u32,
        resolution: PixelsPerMm,
    ) -> Result<()> {
        let width = usize_to_u32(level.width()).map_err(FetchError::Assembly)?;
        let height = usize_to_u32(level.height()).map_err(FetchError::Assembly)?;
        let tile = self.options.tile_size as usize;
        let samples = stored_samples(level.channels());
        let photometric = self.options.photometric(samples);
        let tile_edge = u16::try_from(self.options.tile_size)
            .map_err(|_| FetchError::Config(format!("tile_size {} does not fit a JPEG frame", self.options.tile_size)))?;

        let mut dir = encoder.image_directory()?;

        if index > 0 {
            dir.write_tag(Tag::NewSubfileType, SUBFILE_REDUCED_RESOLUTION)?;
        }
        dir.write_tag(Tag::ImageWidth, width)?;
        dir.write_tag(Tag::ImageLength, height)?;

        let bits_per_sample: Vec<u16> = vec![8; samples];
        dir.write_tag(Tag::BitsPerSample, bits_per_sample.as_slice())?;
        dir.write_tag(Tag::Compression, COMPRESSION_JPEG)?;
        dir.write_tag(Tag::PhotometricInterpretation, photometric)?;
        // samples is 1 or 3
        #[allow(clippy::cast_possible_truncation)]
        dir.write_tag(Tag::SamplesPerPixel, samples as u16)?;
        dir.write_tag(Tag::PlanarConfiguration, PLANAR_CHUNKY)?;
        dir.write_tag(Tag::TileWidth, self.options.tile_size)?;
        dir.write_tag(Tag::TileLength, self.options.tile_size)?;
        if photometric == PHOTOMETRIC_YCBCR {
            // Tiles are encoded without chroma subsampling
            dir.write_tag(Tag::Unknown(TAG_YCBCR_SUBSAMPLING), [1u16, 1u16].as_slice())?;
        }

        let (per_cm_x, per_cm_y) = resolution.per_centimeter();
        dir.write_tag(Tag::XResolution, to_rational(per_cm_x))?;
        dir.write_tag(Tag::YResolution, to_rational(per_cm_y))?;
        dir.write_tag(Tag::ResolutionUnit, RESOLUTION_UNIT_CENTIMETER)?;
        dir.write_tag(Tag::Software, SOFTWARE)?;

        let tiles_across = ceil_div(level.width(), tile);
        let tiles_down = ceil_div(level.height(), tile);
        let mut offsets: Vec<u64> = Vec::with_capacity(tiles_across * tiles_down);
        let mut byte_counts: Vec<u64> = Vec::with_capacity(tiles_across * tiles_down);
        let mut tile_pixels = vec![0u8; tile * tile * samples];

        for ty in 0..tiles_down {
            for tx in 0..tiles_across {
                extract_tile(level, tx * tile, ty * tile, tile, samples, &mut tile_pixels);
                let jpeg = encode_jpeg(&tile_pixels, tile_edge, photometric, self.options.quality)?;
                offsets.push(dir.write_data(jpeg.as_slice())?);
                byte_counts.push(jpeg.len() as u64);
            }
        }

        dir.write_tag(Tag::TileOffsets, offsets.as_slice())?;
        dir.write_tag(Tag::TileByteCounts, byte_counts.as_slice())?;
        dir.finish()?;

        debug!(
            level = index,
            width,
            height,
            tiles = tiles_across * tiles_down,
            "Pyramid level written"
        );
        Ok(())
    }
}

impl Canvas {
    /// Write this canvas as a pyramidal BigTIFF with default options.
    pub fn write_pyramid<P: AsRef<Path>>(&self, path: P, voxel_size: Option<VoxelSize>) -> Result<()> {
        PyramidWriter::new(self).voxel_size(voxel_size).write_atomic(path)
    }

    /// Get a pyramid writer builder for more control over output options.
    #[must_use]
    pub fn pyramid_writer(&self) -> PyramidWriter<'_> {
        PyramidWriter::new(self)
    }
}

/// Samples stored per pixel: gray stays gray, alpha is dropped.
fn stored_samples(channels: usize) -> usize {
    if channels <= 2 {
        1
    } else {
        3
    }
}

/// Copy one tile into `out`, replicating edge pixels past the canvas boundary.
fn extract_tile(canvas: &Canvas, x0: usize, y0: usize, tile: usize, samples: usize, out: &mut [u8]) {
    let channels = canvas.channels();
    let last_x = canvas.width() - 1;
    let last_y = canvas.height() - 1;
    for ty in 0..tile {
        let row = canvas.row((y0 + ty).min(last_y));
        for tx in 0..tile {
            let src = (x0 + tx).min(last_x) * channels;
            let dst = (ty * tile + tx) * samples;
            out[dst..dst + samples].copy_from_slice(&row[src..src + samples]);
        }
    }
}

/// Encode one square tile.
///
/// YCbCr tiles go through the usual RGB to YCbCr transform. RGB tiles keep
/// their samples as the JPEG components and carry an Adobe transform-0
/// marker instead of a JFIF header, so decoders do not convert them back.
fn encode_jpeg(pixels: &[u8], tile: u16, photometric: u16, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder = Encoder::new(&mut out, quality);
    encoder.set_sampling_factor(SamplingFactor::F_1_1);
    let color = match photometric {
        PHOTOMETRIC_BLACK_IS_ZERO => ColorType::Luma,
        PHOTOMETRIC_RGB => {
            encoder.add_app_segment(14, ADOBE_APP14)?;
            ColorType::Ycbcr
        }
        _ => ColorType::Rgb,
    };
    encoder.encode(pixels, tile, tile, color)?;

    if photometric == PHOTOMETRIC_RGB {
        strip_jfif_header(&mut out);
    }
    Ok(out)
}

/// Remove the APP0 segment that follows SOI, if any.
fn strip_jfif_header(jpeg: &mut Vec<u8>) {
    if jpeg.len() < 6 || jpeg[2..4] != JPEG_APP0 {
        return;
    }
    let length = usize::from(u16::from_be_bytes([jpeg[4], jpeg[5]]));
    if 4 + length <= jpeg.len() {
        jpeg.drain(2..4 + length);
    }
}

/// Express a positive density as a TIFF rational with as much precision as fits.
fn to_rational(value: f64) -> Rational {
    for d in [10_000u32, 1_000, 100, 10, 1] {
        let n = (value * f64::from(d)).round();
        if n <= f64::from(u32::MAX) {
            // Bounded above and value is positive
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            return Rational { n: n as u32, d };
        }
    }
    Rational { n: u32::MAX, d: 1 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use crate::geometry::Extent;
    use crate::raster::RasterBuffer;
    use tiff::decoder::ifd::Value;
    use tiff::decoder::Decoder;

    fn gradient_canvas(width: usize, height: usize, channels: usize) -> Canvas {
        let pixels = (0..width * height * channels).map(|i| (i % 251) as u8).collect();
        Canvas::from_raster(RasterBuffer::new(width, height, channels, pixels).unwrap()).unwrap()
    }

    fn rational<R: std::io::Read + Seek>(decoder: &mut Decoder<R>, tag: Tag) -> (u32, u32) {
        match decoder.get_tag(tag).unwrap() {
            Value::Rational(n, d) => (n, d),
            other => panic!("{tag:?} is not a rational: {other:?}"),
        }
    }

    /// JPEG segments as (marker, payload) up to and including SOS, plus the
    /// entropy-coded data that follows.
    fn jpeg_segments(jpeg: &[u8]) -> (Vec<(u8, &[u8])>, &[u8]) {
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let mut segments = Vec::new();
        let mut i = 2;
        loop {
            assert_eq!(jpeg[i], 0xFF);
            let marker = jpeg[i + 1];
            let length = usize::from(u16::from_be_bytes([jpeg[i + 2], jpeg[i + 3]]));
            segments.push((marker, &jpeg[i + 4..i + 2 + length]));
            i += 2 + length;
            if marker == 0xDA {
                return (segments, &jpeg[i..]);
            }
        }
    }

    struct BitReader<'a> {
        data: &'a [u8],
        pos: usize,
        bit: u8,
    }

    impl BitReader<'_> {
        fn read_bit(&mut self) -> u16 {
            let byte = self.data[self.pos];
            let value = u16::from((byte >> (7 - self.bit)) & 1);
            self.bit += 1;
            if self.bit == 8 {
                self.bit = 0;
                // 0xFF in entropy data is followed by a stuffed 0x00
                self.pos += if byte == 0xFF { 2 } else { 1 };
            }
            value
        }

        fn read_bits(&mut self, count: u8) -> u16 {
            (0..count).fold(0, |acc, _| (acc << 1) | self.read_bit())
        }

        fn decode(&mut self, table: &HashMap<(u8, u16), u8>) -> u8 {
            let mut code = 0u16;
            for length in 1..=16u8 {
                code = (code << 1) | self.read_bit();
                if let Some(&symbol) = table.get(&(length, code)) {
                    return symbol;
                }
            }
            panic!("invalid Huffman code");
        }
    }

    fn huffman_table(counts: &[u8], symbols: &[u8]) -> HashMap<(u8, u16), u8> {
        let mut table = HashMap::new();
        let mut code = 0u16;
        let mut next = symbols.iter();
        for (length, &count) in (1..=16u8).zip(counts) {
            for _ in 0..count {
                table.insert((length, code), *next.next().unwrap());
                code += 1;
            }
            code <<= 1;
        }
        table
    }

    /// Sample value of each component's first 8x8 block, reconstructed from
    /// its DC coefficient. Exact enough for flat blocks at high quality.
    fn first_block_components(jpeg: &[u8]) -> Vec<u8> {
        let (segments, entropy) = jpeg_segments(jpeg);
        let mut dc_quant = HashMap::new();
        let mut dc_tables = HashMap::new();
        let mut ac_tables = HashMap::new();
        let mut frame_quant = Vec::new();
        let mut scan = Vec::new();
        for (marker, payload) in segments {
            match marker {
                0xDB => {
                    for table in payload.chunks(65) {
                        dc_quant.insert(table[0] & 0x0F, u16::from(table[1]));
                    }
                }
                0xC0 => {
                    for component in payload[6..].chunks(3) {
                        assert_eq!(component[1], 0x11, "chroma is subsampled");
                        frame_quant.push(component[2]);
                    }
                }
                0xC4 => {
                    let mut rest = payload;
                    while !rest.is_empty() {
                        let class_id = rest[0];
                        let counts = &rest[1..17];
                        let total: usize = counts.iter().map(|&c| usize::from(c)).sum();
                        let table = huffman_table(counts, &rest[17..17 + total]);
                        if class_id >> 4 == 0 {
                            dc_tables.insert(class_id & 0x0F, table);
                        } else {
                            ac_tables.insert(class_id & 0x0F, table);
                        }
                        rest = &rest[17 + total..];
                    }
                }
                0xDA => {
                    scan = payload[1..1 + 2 * usize::from(payload[0])]
                        .chunks(2)
                        .map(|c| (c[1] >> 4, c[1] & 0x0F))
                        .collect();
                }
                _ => {}
            }
        }

        let mut bits = BitReader { data: entropy, pos: 0, bit: 0 };
        let mut values = Vec::new();
        for (component, (dc_table, ac_table)) in scan.into_iter().enumerate() {
            let size = bits.decode(&dc_tables[&dc_table]);
            let raw = i32::from(bits.read_bits(size));
            let diff = if size > 0 && raw < 1 << (size - 1) { raw - (1 << size) + 1 } else { raw };
            let quant = i32::from(dc_quant[&frame_quant[component]]);
            values.push((diff * quant / 8 + 128).clamp(0, 255) as u8);

            let mut k = 1;
            while k < 64 {
                let symbol = bits.decode(&ac_tables[&ac_table]);
                if symbol == 0x00 {
                    break;
                }
                bits.read_bits(symbol & 0x0F);
                k += usize::from(symbol >> 4) + 1;
            }
        }
        values
    }

    fn first_tile(bytes: &[u8]) -> Vec<u8> {
        let mut decoder = Decoder::new(Cursor::new(bytes)).unwrap();
        let offset = decoder.get_tag_u64_vec(Tag::TileOffsets).unwrap()[0] as usize;
        let count = decoder.get_tag_u64_vec(Tag::TileByteCounts).unwrap()[0] as usize;
        bytes[offset..offset + count].to_vec()
    }

    fn flat_canvas(pixel: [u8; 3]) -> Canvas {
        let pixels = pixel.iter().copied().cycle().take(32 * 32 * 3).collect();
        Canvas::from_raster(RasterBuffer::new(32, 32, 3, pixels).unwrap()).unwrap()
    }

    fn rgb_options() -> WriterOptions {
        WriterOptions {
            rgb_jpeg: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_writes_bigtiff_header() {
        let canvas = gradient_canvas(64, 64, 3);
        let bytes = PyramidWriter::new(&canvas).to_bytes().unwrap();

        assert!(bytes.len() > 16);
        assert_eq!(&bytes[0..2], b"II");
        // BigTIFF version 43, offset size 8
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 43);
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 8);
    }

    #[test]
    fn test_pyramid_levels_halve_until_one_tile() {
        let canvas = gradient_canvas(600, 300, 3);
        let bytes = PyramidWriter::new(&canvas).options(rgb_options()).to_bytes().unwrap();

        let mut decoder = Decoder::new(Cursor::new(bytes)).unwrap();
        let mut dims = vec![decoder.dimensions().unwrap()];
        while decoder.more_images() {
            decoder.next_image().unwrap();
            dims.push(decoder.dimensions().unwrap());
        }
        assert_eq!(dims, vec![(600, 300), (300, 150), (150, 75)]);
    }

    #[test]
    fn test_level_tags() {
        let canvas = gradient_canvas(300, 200, 3);
        let bytes = PyramidWriter::new(&canvas)
            .voxel_size(Some(VoxelSize { x: 250.0, y: 500.0 }))
            .options(rgb_options())
            .to_bytes()
            .unwrap();

        let mut decoder = Decoder::new(Cursor::new(bytes)).unwrap();
        assert_eq!(decoder.get_tag_u32(Tag::TileWidth).unwrap(), 256);
        assert_eq!(decoder.get_tag_u32(Tag::TileLength).unwrap(), 256);
        assert_eq!(decoder.get_tag_u32(Tag::Compression).unwrap(), u32::from(COMPRESSION_JPEG));
        assert_eq!(
            decoder.get_tag_u32(Tag::PhotometricInterpretation).unwrap(),
            u32::from(PHOTOMETRIC_RGB)
        );
        assert_eq!(
            decoder.get_tag_u32(Tag::ResolutionUnit).unwrap(),
            u32::from(RESOLUTION_UNIT_CENTIMETER)
        );
        // 250 µm -> 4000 px/mm -> 40000 px/cm
        assert_eq!(rational(&mut decoder, Tag::XResolution), (400_000_000, 10_000));
        assert_eq!(rational(&mut decoder, Tag::YResolution), (200_000_000, 10_000));
        assert!(decoder.find_tag(Tag::NewSubfileType).unwrap().is_none());

        decoder.next_image().unwrap();
        assert_eq!(decoder.get_tag_u32(Tag::NewSubfileType).unwrap(), SUBFILE_REDUCED_RESOLUTION);
        assert_eq!(rational(&mut decoder, Tag::XResolution), (200_000_000, 10_000));
    }

    #[test]
    fn test_zero_pixel_size_uses_fallback() {
        let canvas = gradient_canvas(32, 32, 3);
        let bytes = PyramidWriter::new(&canvas)
            .voxel_size(Some(VoxelSize { x: 0.0, y: 0.0 }))
            .options(rgb_options())
            .to_bytes()
            .unwrap();

        let mut decoder = Decoder::new(Cursor::new(bytes)).unwrap();
        // 4000 px/mm fallback -> 40000 px/cm
        assert_eq!(rational(&mut decoder, Tag::XResolution), (400_000_000, 10_000));
    }

    #[test]
    fn test_negative_pixel_size_fails() {
        let canvas = gradient_canvas(32, 32, 3);
        let result = PyramidWriter::new(&canvas)
            .voxel_size(Some(VoxelSize { x: -1.0, y: 1.0 }))
            .to_bytes();
        assert!(matches!(result, Err(FetchError::Resolution { .. })));
    }

    #[test]
    fn test_grayscale_canvas() {
        let canvas = gradient_canvas(40, 20, 1);
        let bytes = PyramidWriter::new(&canvas).to_bytes().unwrap();
        let mut decoder = Decoder::new(Cursor::new(bytes)).unwrap();
        assert_eq!(decoder.get_tag_u32(Tag::SamplesPerPixel).unwrap(), 1);
        assert_eq!(
            decoder.get_tag_u32(Tag::PhotometricInterpretation).unwrap(),
            u32::from(PHOTOMETRIC_BLACK_IS_ZERO)
        );
    }

    #[test]
    fn test_photometric_selection() {
        let ycbcr = WriterOptions::default();
        assert_eq!(ycbcr.photometric(3), PHOTOMETRIC_YCBCR);
        assert_eq!(ycbcr.photometric(1), PHOTOMETRIC_BLACK_IS_ZERO);
        assert_eq!(rgb_options().photometric(3), PHOTOMETRIC_RGB);
        assert_eq!(stored_samples(4), 3);
        assert_eq!(stored_samples(2), 1);
    }

    #[test]
    fn test_tiles_are_jpeg_streams() {
        let canvas = gradient_canvas(300, 20, 3);
        let bytes = PyramidWriter::new(&canvas).to_bytes().unwrap();
        let mut decoder = Decoder::new(Cursor::new(bytes.clone())).unwrap();

        let offsets = decoder.get_tag_u64_vec(Tag::TileOffsets).unwrap();
        let counts = decoder.get_tag_u64_vec(Tag::TileByteCounts).unwrap();
        assert_eq!(offsets.len(), 2);
        for (offset, count) in offsets.iter().zip(&counts) {
            let start = *offset as usize;
            let tile = &bytes[start..start + *count as usize];
            assert_eq!(&tile[..2], &[0xFF, 0xD8]);
            let decoded = image::load_from_memory(tile).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (256, 256));
        }
    }

    #[test]
    fn test_rgb_tiles_store_untransformed_samples() {
        let canvas = flat_canvas([200, 60, 20]);
        let options = WriterOptions { quality: 100, ..rgb_options() };
        let tile = first_tile(&PyramidWriter::new(&canvas).options(options).to_bytes().unwrap());

        let components = first_block_components(&tile);
        assert_eq!(components.len(), 3);
        for (stored, expected) in components.iter().zip([200u8, 60, 20]) {
            assert!(stored.abs_diff(expected) <= 2, "{components:?}");
        }
    }

    #[test]
    fn test_ycbcr_tiles_store_luma_first() {
        let canvas = flat_canvas([200, 60, 20]);
        let options = WriterOptions { quality: 100, ..Default::default() };
        let tile = first_tile(&PyramidWriter::new(&canvas).options(options).to_bytes().unwrap());

        // Y = 0.299 R + 0.587 G + 0.114 B
        let components = first_block_components(&tile);
        assert!(components[0].abs_diff(97) <= 2, "{components:?}");
        assert!(components[2] > 128, "{components:?}");
    }

    #[test]
    fn test_rgb_tiles_carry_adobe_marker() {
        let canvas = flat_canvas([10, 20, 30]);
        let tile = first_tile(&PyramidWriter::new(&canvas).options(rgb_options()).to_bytes().unwrap());
        let (segments, _) = jpeg_segments(&tile);

        assert!(segments.iter().all(|(marker, _)| *marker != 0xE0));
        let adobe = segments
            .iter()
            .find(|(marker, payload)| *marker == 0xEE && payload.starts_with(b"Adobe"))
            .map(|(_, payload)| *payload)
            .unwrap();
        assert_eq!(adobe[11], 0, "color transform");

        let ycbcr = first_tile(&PyramidWriter::new(&canvas).to_bytes().unwrap());
        let (segments, _) = jpeg_segments(&ycbcr);
        assert!(segments.iter().all(|(marker, _)| *marker != 0xEE));
    }

    #[test]
    fn test_strip_jfif_header_only_touches_app0() {
        let mut jpeg = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x04, 0xAA, 0xBB, 0xFF, 0xD9];
        strip_jfif_header(&mut jpeg);
        assert_eq!(jpeg, vec![0xFF, 0xD8, 0xFF, 0xD9]);

        let mut other = vec![0xFF, 0xD8, 0xFF, 0xDB, 0x00, 0x02, 0xFF, 0xD9];
        strip_jfif_header(&mut other);
        assert_eq!(other.len(), 8);
    }

    #[test]
    fn test_edge_tiles_replicate_border() {
        let canvas = gradient_canvas(3, 2, 3);
        let mut out = vec![0u8; 4 * 4 * 3];
        extract_tile(&canvas, 0, 0, 4, 3, &mut out);
        // column 3 repeats column 2, row 2 and 3 repeat row 1
        assert_eq!(&out[9..12], &canvas.row(0)[6..9]);
        assert_eq!(&out[(3 * 4 + 3) * 3..(3 * 4 + 3) * 3 + 3], &canvas.row(1)[6..9]);
    }

    #[test]
    fn test_write_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slide.tif");
        let canvas = gradient_canvas(64, 64, 3);

        canvas.write_pyramid(&path, Some(VoxelSize { x: 250.0, y: 250.0 })).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_failed_write_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slide.tif");
        let canvas = gradient_canvas(64, 64, 3);

        let result = canvas
            .pyramid_writer()
            .voxel_size(Some(VoxelSize { x: f64::NAN, y: 1.0 }))
            .write_atomic(&path);
        assert!(result.is_err());
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_options_validation() {
        assert!(WriterOptions::default().validate().is_ok());
        let bad_tile = WriterOptions { tile_size: 100, ..Default::default() };
        assert!(bad_tile.validate().is_err());
        let huge_tile = WriterOptions { tile_size: 65_536, ..Default::default() };
        assert!(huge_tile.validate().is_err());
        let bad_quality = WriterOptions { quality: 0, ..Default::default() };
        assert!(bad_quality.validate().is_err());
        let bad_fallback = WriterOptions { fallback_pixels_per_mm: -1.0, ..Default::default() };
        assert!(bad_fallback.validate().is_err());
    }

    #[test]
    fn test_to_rational_precision() {
        let r = to_rational(40_000.0);
        assert_eq!((r.n, r.d), (400_000_000, 10_000));
        let r = to_rational(1.0e8);
        assert_eq!((r.n, r.d), (1_000_000_000, 10));
    }

    #[test]
    fn test_extent_of_written_image() {
        let canvas = Canvas::zeroed(Extent::new(257, 1).unwrap(), 3).unwrap();
        let bytes = canvas.pyramid_writer().options(rgb_options()).to_bytes().unwrap();
        let decoder = Decoder::new(Cursor::new(bytes));
        assert_eq!(decoder.unwrap().dimensions().unwrap(), (257, 1));
    }
}
