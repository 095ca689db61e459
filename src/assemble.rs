//! Patch assembly into a full canvas.
//!
//! Two strategies share the [`Assembler`] contract:
//!
//! - [`DirectAssembler`] preallocates the whole canvas and copies each patch
//!   into place as it arrives. Memory scales with the extent.
//! - [`JoinAssembler`] writes each patch to a scoped temporary directory and
//!   joins them into a canvas only once every grid cell has landed. Memory
//!   is not held during the fetch; disk use scales with total patch bytes.
//!
//! Both produce identical canvases for the same patch sequence.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::error::{FetchError, Result};
use crate::grid::{GridLayout, PatchDescriptor};
use crate::raster::{Canvas, RasterBuffer};

const PATCH_DIR_PREFIX: &str = "slidefetch-patches-";

/// Which assembler a run uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssemblyStrategy {
    /// Composite into a preallocated in-memory canvas
    #[default]
    Direct,
    /// Persist patches to disk, join after the last one
    Join,
}

impl std::str::FromStr for AssemblyStrategy {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "join" => Ok(Self::Join),
            other => Err(FetchError::Config(format!(
                "unknown assembly strategy \"{other}\" (expected direct or join)"
            ))),
        }
    }
}

/// Consumes fetched patches and produces the assembled canvas.
pub trait Assembler: Send {
    /// Take ownership of one fetched patch.
    ///
    /// # Errors
    /// Returns [`FetchError::Assembly`] if the patch does not fit its cell, or
    /// [`FetchError::Io`] if it cannot be persisted.
    fn accept(&mut self, patch: &PatchDescriptor, raster: RasterBuffer) -> Result<()>;

    /// Produce the canvas once all patches are accepted.
    ///
    /// # Errors
    /// Returns [`FetchError::Assembly`] if any grid cell is missing.
    fn finish(self: Box<Self>) -> Result<Canvas>;
}

/// Build the assembler selected by `strategy`.
///
/// # Errors
/// Returns an error if the canvas cannot be allocated or the temporary
/// directory cannot be created.
pub fn create_assembler(
    strategy: AssemblyStrategy,
    grid: &GridLayout,
    canvas_channels: usize,
    scratch_dir: Option<&Path>,
) -> Result<Box<dyn Assembler>> {
    Ok(match strategy {
        AssemblyStrategy::Direct => Box::new(DirectAssembler::new(grid, canvas_channels)?),
        AssemblyStrategy::Join => Box::new(JoinAssembler::new(grid, scratch_dir)?),
    })
}

/// Reject patches outside the grid before anything is written.
fn check_index(patch: &PatchDescriptor, cells: usize) -> Result<()> {
    if patch.index >= cells {
        return Err(FetchError::Assembly(format!(
            "patch index {} outside the grid of {cells} cells",
            patch.index
        )));
    }
    Ok(())
}

fn check_fits(patch: &PatchDescriptor, raster: &RasterBuffer) -> Result<()> {
    if (raster.width, raster.height) != (patch.width(), patch.height()) {
        return Err(FetchError::Assembly(format!(
            "patch {} is {}x{}, grid cell is {}x{}",
            patch.index,
            raster.width,
            raster.height,
            patch.width(),
            patch.height()
        )));
    }
    Ok(())
}

/// Composites patches straight into a preallocated canvas.
pub struct DirectAssembler {
    canvas: Canvas,
    accepted: Vec<bool>,
}

impl DirectAssembler {
    /// Allocate a zero-filled canvas for `grid`.
    ///
    /// # Errors
    /// Returns [`FetchError::Assembly`] if the canvas cannot be sized.
    pub fn new(grid: &GridLayout, channels: usize) -> Result<Self> {
        let canvas = Canvas::zeroed(grid.extent, channels)?;
        debug!(extent = %grid.extent, channels, bytes = canvas.pixels().len(), "Canvas allocated");
        Ok(Self {
            canvas,
            accepted: vec![false; grid.len()],
        })
    }
}

impl Assembler for DirectAssembler {
    fn accept(&mut self, patch: &PatchDescriptor, raster: RasterBuffer) -> Result<()> {
        check_index(patch, self.accepted.len())?;
        check_fits(patch, &raster)?;
        self.canvas.blit(patch.start, &raster)?;
        self.accepted[patch.index] = true;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Canvas> {
        if let Some(missing) = self.accepted.iter().position(|seen| !seen) {
            return Err(FetchError::Assembly(format!("patch {missing} was never composited")));
        }
        Ok(self.canvas)
    }
}

/// Persists patches to a temporary directory and joins them at the end.
///
/// The directory is removed when the assembler is dropped, on success and
/// failure alike.
pub struct JoinAssembler {
    grid: GridLayout,
    dir: TempDir,
    channels: Option<usize>,
    files: Vec<Option<PathBuf>>,
}

impl JoinAssembler {
    /// Create the scratch directory, under `parent` if given.
    ///
    /// # Errors
    /// Returns [`FetchError::Io`] if the directory cannot be created.
    pub fn new(grid: &GridLayout, parent: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(PATCH_DIR_PREFIX);
        let dir = match parent {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };
        debug!(dir = %dir.path().display(), patches = grid.len(), "Patch scratch directory created");
        Ok(Self {
            grid: grid.clone(),
            dir,
            channels: None,
            files: vec![None; grid.len()],
        })
    }

    /// Directory holding the persisted patches.
    #[must_use]
    pub fn scratch_path(&self) -> &Path {
        self.dir.path()
    }

    fn patch_path(&self, index: usize) -> PathBuf {
        self.dir.path().join(format!("{index:06}.patch"))
    }
}

impl Assembler for JoinAssembler {
    fn accept(&mut self, patch: &PatchDescriptor, raster: RasterBuffer) -> Result<()> {
        check_index(patch, self.files.len())?;
        check_fits(patch, &raster)?;
        match self.channels {
            None => self.channels = Some(raster.channels),
            Some(c) if c != raster.channels => {
                return Err(FetchError::Assembly(format!(
                    "patch {} has {} channels, earlier patches have {c}",
                    patch.index, raster.channels
                )))
            }
            Some(_) => {}
        }

        let path = self.patch_path(patch.index);
        let mut writer = BufWriter::new(File::create(&path)?);
        writer.write_all(&raster.pixels)?;
        writer.flush()?;

        self.files[patch.index] = Some(path);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Canvas> {
        if let Some(missing) = self.files.iter().position(Option::is_none) {
            return Err(FetchError::Assembly(format!("patch {missing} never reached storage")));
        }
        let channels = self
            .channels
            .ok_or_else(|| FetchError::Assembly("no patches to join".to_string()))?;

        info!(
            patches = self.files.len(),
            columns = self.grid.columns,
            rows = self.grid.rows,
            "Joining persisted patches"
        );

        let mut canvas = Canvas::zeroed(self.grid.extent, channels)?;
        for row in 0..self.grid.rows {
            for patch in self.grid.row(row) {
                let path = self.files[patch.index]
                    .as_ref()
                    .ok_or_else(|| FetchError::Assembly(format!("patch {} missing", patch.index)))?;
                let len = crate::casting::buffer_len(patch.width(), patch.height(), channels)
                    .map_err(FetchError::Assembly)?;
                let mut pixels = Vec::with_capacity(len);
                BufReader::new(File::open(path)?).read_to_end(&mut pixels)?;
                let raster = RasterBuffer::new(patch.width(), patch.height(), channels, pixels)?;
                canvas.blit(patch.start, &raster)?;
            }
        }
        Ok(canvas)
    }
}
