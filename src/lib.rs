#![doc = include_str!("../README.md")]
//!
//! ## Architecture
//!
//! The library is organized into several modules, leaf-first:
//!
//! - [`metadata`]: Origin metadata parsing and level resolution via [`ImageMetadata::resolve`]
//! - [`grid`]: Patch grid planning with [`GridLayout::plan`]
//! - [`origin`]: The [`Origin`] trait and its HTTP implementation [`OriginClient`]
//! - [`assemble`]: Direct and join assembly behind the [`Assembler`] trait
//! - [`pyramid_writer`]: Pyramidal BigTIFF output with [`PyramidWriter`]
//! - [`pipeline`]: End-to-end [`run`] and the local [`convert_file`]
//! - [`geometry`]: Extents and physical resolution
//! - [`raster`]: Patch buffers and the assembled [`Canvas`]
//! - [`config`]: [`FetchConfig`] loaded from TOML or built in code
//! - [`error`]: The [`FetchError`] taxonomy

// ============================================================================
// Public modules
// ============================================================================

pub mod assemble;
pub mod casting;
pub mod config;
pub mod error;
pub mod geometry;
pub mod grid;
pub mod metadata;
pub mod origin;
pub mod pipeline;
pub mod pyramid_writer;
pub mod raster;

// ============================================================================
// Configuration & Errors
// ============================================================================

pub use config::{
    Credentials,
    FetchConfig,
};

pub use error::{
    FetchError,
    Result,
};

// ============================================================================
// Level Resolution & Grid Planning
// ============================================================================

pub use metadata::{
    ApiVariant,
    ImageMetadata,
    ResolvedLevel,
    reversed_level,
};

pub use grid::{
    GridLayout,
    PatchDescriptor,
};

pub use geometry::Extent;
pub use geometry::resolution::{
    PixelsPerMm,
    VoxelSize,
    output_resolution,
};

// ============================================================================
// Origin Access
// ============================================================================
// Primary API: OriginClient::new(&config)?.fetch_region(&request).await

pub use origin::{
    Origin,
    OriginClient,
    RegionRequest,
    RetryPolicy,
};

// ============================================================================
// Assembly
// ============================================================================

pub use assemble::{
    Assembler,
    AssemblyStrategy,
    DirectAssembler,
    JoinAssembler,
    create_assembler,
};

pub use raster::{
    Canvas,
    RasterBuffer,
    patch_limits,
};

// ============================================================================
// Pyramid Writing
// ============================================================================
// Primary API: PyramidWriter::new(&canvas).voxel_size(..).write_atomic(path)

pub use pyramid_writer::{
    PyramidWriter,
    WriterOptions,
};

// ============================================================================
// Pipeline
// ============================================================================

pub use pipeline::{
    FetchedImage,
    RunSummary,
    convert_file,
    fetch_image,
    run,
};
