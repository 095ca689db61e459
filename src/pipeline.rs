//! End-to-end fetch, assemble and write.
//!
//! [`run`] resolves the requested level, plans the patch grid, fetches every
//! patch through a bounded pool, hands patches to the configured assembler
//! in row-major order and writes the pyramidal BigTIFF atomically. The first
//! fatal error aborts the run: in-flight requests are dropped and no output
//! file is produced.

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};
use image::{ImageFormat, ImageReader};
use tiff::decoder::ifd::Value;
use tiff::decoder::Decoder;
use tiff::tags::{ResolutionUnit, Tag};
use tracing::{debug, info, warn};

use crate::assemble::{create_assembler, Assembler};
use crate::config::FetchConfig;
use crate::error::{FetchError, Result};
use crate::geometry::resolution::{output_resolution, PixelsPerMm};
use crate::grid::GridLayout;
use crate::metadata::ResolvedLevel;
use crate::origin::{with_retry, Origin, RegionRequest, RetryPolicy};
use crate::pyramid_writer::{PyramidWriter, WriterOptions};
use crate::raster::{Canvas, RasterBuffer};

/// An assembled image that has not been written yet.
#[derive(Debug)]
pub struct FetchedImage {
    pub level: ResolvedLevel,
    pub grid: GridLayout,
    /// Density the output will carry, fallback already applied
    pub resolution: PixelsPerMm,
    pub canvas: Canvas,
}

/// What a completed run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub output: PathBuf,
    pub level: ResolvedLevel,
    pub patches: usize,
    pub resolution: PixelsPerMm,
}

/// Fetch and assemble, then write the pyramid to `config.output_path()`.
///
/// # Errors
/// Any error from configuration, metadata, a patch, assembly or the writer.
/// On error nothing is left at the output path.
pub async fn run<O: Origin>(config: &FetchConfig, origin: &O) -> Result<RunSummary> {
    let fetched = fetch_image(config, origin).await?;
    let output = config.output_path();

    let FetchedImage {
        level,
        grid,
        resolution,
        canvas,
    } = fetched;
    let options = config.writer.clone();
    let path = output.clone();
    info!(output = %output.display(), extent = %canvas.extent(), "Writing pyramid");
    blocking(move || {
        PyramidWriter::new(&canvas)
            .resolution(resolution)
            .options(options)
            .write_atomic(&path)
    })
    .await?;

    Ok(RunSummary {
        output,
        level,
        patches: grid.len(),
        resolution,
    })
}

/// Resolve, plan, fetch and assemble without writing.
///
/// # Errors
/// Returns the first fatal error; authentication and metadata failures
/// surface before any region is requested.
pub async fn fetch_image<O: Origin>(config: &FetchConfig, origin: &O) -> Result<FetchedImage> {
    config.validate()?;
    let policy = RetryPolicy::from_config(config);

    let metadata = with_retry(&policy, "metadata", || {
        origin.fetch_metadata(&config.project, &config.image)
    })
    .await?;
    let level = metadata.resolve(config.level, config.api_variant)?;
    let resolution = output_resolution(Some(&level.voxel_size), config.writer.fallback_pixels_per_mm)?;
    let grid = GridLayout::plan(level.extent, config.patch_size)?;

    info!(
        image = %config.image,
        level = level.requested,
        extent = %level.extent,
        columns = grid.columns,
        rows = grid.rows,
        patches = grid.len(),
        assembly = ?config.assembly,
        "Patch grid planned"
    );

    let assembler = create_assembler(
        config.assembly,
        &grid,
        config.canvas_channels,
        config.scratch_dir.as_deref(),
    )?;
    let assembler = fetch_patches(config, origin, &level, &grid, assembler).await?;

    let canvas = blocking(move || assembler.finish()).await?;
    Ok(FetchedImage {
        level,
        grid,
        resolution,
        canvas,
    })
}

/// Fetch every grid cell through a pool of `config.concurrency` requests and
/// hand the patches to `assembler` in row-major order.
///
/// Assembly runs on the blocking pool; the assembler moves there and back
/// for each patch.
async fn fetch_patches<O: Origin>(
    config: &FetchConfig,
    origin: &O,
    level: &ResolvedLevel,
    grid: &GridLayout,
    mut assembler: Box<dyn Assembler>,
) -> Result<Box<dyn Assembler>> {
    let policy = RetryPolicy::from_config(config);
    let total = grid.len();
    let mut fetched = stream::iter(grid.patches().iter().copied())
        .map(|patch| {
            let request = RegionRequest::for_patch(config, level, &patch);
            let what = format!("patch {}", patch.index);
            let policy = &policy;
            async move {
                let raster = with_retry(policy, &what, || origin.fetch_region(&request)).await?;
                Ok::<_, FetchError>((patch, raster))
            }
        })
        .buffered(config.concurrency);

    let mut done = 0usize;
    while let Some(result) = fetched.next().await {
        let (patch, raster) = result?;
        debug!(
            index = patch.index,
            row = patch.row,
            column = patch.column,
            width = raster.width,
            height = raster.height,
            "Patch fetched"
        );
        assembler = blocking(move || {
            assembler.accept(&patch, raster)?;
            Ok(assembler)
        })
        .await?;
        done += 1;
        info!(done, total, "Patch {done}/{total} assembled");
    }
    Ok(assembler)
}

/// Convert a local image file into a pyramidal BigTIFF.
///
/// TIFF inputs keep the density from their resolution tags. Other formats,
/// and TIFFs without an absolute resolution unit, get the configured
/// fallback density.
///
/// # Errors
/// Returns [`FetchError::Image`] if the input cannot be decoded, or any
/// writer error.
pub fn convert_file(input: &Path, output: &Path, options: &WriterOptions) -> Result<()> {
    let mut reader = ImageReader::open(input)?.with_guessed_format()?;
    // Local inputs are trusted and may be whole slides
    reader.no_limits();
    let is_tiff = reader.format() == Some(ImageFormat::Tiff);
    let canvas = Canvas::from_raster(RasterBuffer::from_dynamic(reader.decode()?))?;
    let resolution = if is_tiff { tiff_resolution(input)? } else { None };
    info!(
        input = %input.display(),
        output = %output.display(),
        extent = %canvas.extent(),
        "Converting"
    );

    let mut writer = PyramidWriter::new(&canvas).options(options.clone());
    if let Some(resolution) = resolution {
        writer = writer.resolution(resolution);
    }
    writer.write_atomic(output)
}

/// Density declared by a TIFF's XResolution, YResolution and ResolutionUnit.
///
/// `None` when either resolution is missing or unusable, or the unit is not
/// inch or centimeter.
fn tiff_resolution(input: &Path) -> Result<Option<PixelsPerMm>> {
    let mut decoder = Decoder::new(BufReader::new(File::open(input)?))?;
    let x = rational_tag(&mut decoder, Tag::XResolution)?;
    let y = rational_tag(&mut decoder, Tag::YResolution)?;
    // TIFF defaults to inches when the unit tag is absent
    let unit = decoder
        .find_tag_unsigned::<u16>(Tag::ResolutionUnit)?
        .unwrap_or(ResolutionUnit::Inch.to_u16());
    let mm_per_unit = match ResolutionUnit::from_u16(unit) {
        Some(ResolutionUnit::Inch) => 25.4,
        Some(ResolutionUnit::Centimeter) => 10.0,
        _ => {
            debug!(unit, "TIFF resolution has no absolute unit");
            return Ok(None);
        }
    };

    let (Some(x), Some(y)) = (x, y) else {
        return Ok(None);
    };
    let resolution = PixelsPerMm {
        x: x / mm_per_unit,
        y: y / mm_per_unit,
    };
    if resolution.is_valid() {
        Ok(Some(resolution))
    } else {
        warn!(x, y, "Ignoring unusable TIFF resolution");
        Ok(None)
    }
}

fn rational_tag<R: Read + Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Result<Option<f64>> {
    Ok(match decoder.find_tag(tag)? {
        Some(Value::Rational(n, d)) if d != 0 => Some(f64::from(n) / f64::from(d)),
        Some(Value::Double(value)) => Some(value),
        _ => None,
    })
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FetchError::Io(std::io::Error::other(e)))?
}
