//! Image metadata and pyramid level resolution.
//!
//! Origins describe an image with a JSON document listing per-level physical
//! pixel sizes and either a full-resolution extent or a per-level extent table.
//! Two API generations are in the wild and they disagree on how a region
//! request addresses a pyramid level:
//!
//! | Variant              | Extent source                 | Region level          |
//! |----------------------|-------------------------------|-----------------------|
//! | [`ApiVariant::Current`] | `extent`, scaled by `2^level` | requested level        |
//! | [`ApiVariant::Legacy`]  | `ml_extent[level]`            | `total - level - 1`    |
//!
//! In both, `voxelsizes` is ordered coarsest level first.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{FetchError, Result};
use crate::geometry::resolution::VoxelSize;
use crate::geometry::Extent;

/// Origin API generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiVariant {
    /// Full-resolution `extent`, pass-through region levels, `start/size` URLs
    Current,
    /// Per-level `ml_extent` table, reversed region levels, inclusive `start/end` URLs
    Legacy,
}

/// Status values an origin returns in place of metadata for rejected credentials.
const UNAUTHENTICATED_STATUSES: [&str; 2] = ["unauthenticated", "unauthorized"];

/// Parsed metadata snapshot for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMetadata {
    /// Physical pixel size per level, coarsest first
    pub voxel_sizes: Vec<VoxelSize>,
    /// Full-resolution extent (current API)
    pub extent: Option<(u64, u64)>,
    /// Extent per requested level, finest first (legacy API)
    pub level_extents: Option<Vec<(u64, u64)>>,
}

/// Result of resolving a requested level against a metadata snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedLevel {
    /// Level as requested by the caller, 0 = finest
    pub requested: u32,
    /// Level to put in region requests
    pub region_level: u32,
    /// Number of pyramid levels the origin reports
    pub total_levels: u32,
    pub extent: Extent,
    pub voxel_size: VoxelSize,
    pub variant: ApiVariant,
}

/// Translate between client-facing and reversed (coarsest-first) level indices.
///
/// Applying it twice with the same total returns the original level.
///
/// # Errors
/// Returns [`FetchError::Metadata`] if `level` is not below `total_levels`.
pub fn reversed_level(level: u32, total_levels: u32) -> Result<u32> {
    if level >= total_levels {
        return Err(FetchError::Metadata(format!(
            "level {level} requested but the origin only has {total_levels} levels"
        )));
    }
    Ok(total_levels - level - 1)
}

impl ImageMetadata {
    /// Parse an origin metadata document.
    ///
    /// A document without `voxelsizes` whose `status` reports missing
    /// credentials is an authentication failure, not a malformed payload.
    ///
    /// # Errors
    /// Returns [`FetchError::Authentication`] or [`FetchError::Metadata`].
    pub fn from_json(url: &str, document: &Value) -> Result<Self> {
        let object = document
            .as_object()
            .ok_or_else(|| FetchError::Metadata(format!("expected a JSON object from {url}")))?;

        let Some(voxel_sizes) = object.get("voxelsizes") else {
            let status = object.get("status").and_then(Value::as_str);
            return Err(match status {
                Some(s) if UNAUTHENTICATED_STATUSES.contains(&s) => FetchError::Authentication {
                    url: url.to_string(),
                    reason: format!("origin reported status \"{s}\"; check username and password"),
                },
                Some(s) => FetchError::Metadata(format!("no voxelsizes in response (status \"{s}\")")),
                None => FetchError::Metadata("no voxelsizes in response".to_string()),
            });
        };

        let voxel_sizes: Vec<VoxelSize> = serde_json::from_value(voxel_sizes.clone())
            .map_err(|e| FetchError::Metadata(format!("malformed voxelsizes: {e}")))?;
        if voxel_sizes.is_empty() {
            return Err(FetchError::Metadata("voxelsizes is empty".to_string()));
        }

        let extent = object.get("extent").map(parse_pair).transpose()?;
        let level_extents = object
            .get("ml_extent")
            .map(|table| {
                table
                    .as_array()
                    .ok_or_else(|| FetchError::Metadata("ml_extent is not an array".to_string()))?
                    .iter()
                    .map(parse_pair)
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;

        if extent.is_none() && level_extents.is_none() {
            return Err(FetchError::Metadata("neither extent nor ml_extent present".to_string()));
        }

        Ok(Self {
            voxel_sizes,
            extent,
            level_extents,
        })
    }

    /// Number of pyramid levels.
    #[must_use]
    pub fn level_count(&self) -> u32 {
        u32::try_from(self.voxel_sizes.len()).unwrap_or(u32::MAX)
    }

    /// API generation implied by the document's fields.
    #[must_use]
    pub fn detect_variant(&self) -> ApiVariant {
        if self.level_extents.is_some() {
            ApiVariant::Legacy
        } else {
            ApiVariant::Current
        }
    }

    /// Resolve `level` into an extent, pixel size and region level.
    ///
    /// `variant` overrides detection when the origin's generation is known.
    ///
    /// # Errors
    /// Returns [`FetchError::Metadata`] if the level is out of range or the
    /// fields the variant needs are missing.
    pub fn resolve(&self, level: u32, variant: Option<ApiVariant>) -> Result<ResolvedLevel> {
        let variant = variant.unwrap_or_else(|| self.detect_variant());
        let total_levels = self.level_count();
        let voxel_index = reversed_level(level, total_levels)?;
        let voxel_size = self.voxel_sizes[voxel_index as usize];

        let (extent, region_level) = match variant {
            ApiVariant::Current => {
                let (width, height) = self.extent.ok_or_else(|| {
                    FetchError::Metadata("current API requires a full-resolution extent".to_string())
                })?;
                (Extent::at_level(width, height, level)?, level)
            }
            ApiVariant::Legacy => {
                let table = self.level_extents.as_ref().ok_or_else(|| {
                    FetchError::Metadata("legacy API requires an ml_extent table".to_string())
                })?;
                let &(width, height) = table.get(level as usize).ok_or_else(|| {
                    FetchError::Metadata(format!(
                        "ml_extent has {} entries, level {level} requested",
                        table.len()
                    ))
                })?;
                (Extent::at_level(width, height, 0)?, voxel_index)
            }
        };

        debug!(
            level,
            region_level,
            total_levels,
            ?variant,
            %extent,
            "Resolved pyramid level"
        );

        Ok(ResolvedLevel {
            requested: level,
            region_level,
            total_levels,
            extent,
            voxel_size,
            variant,
        })
    }
}

/// Parse `[w, h, ...]`, ignoring trailing axes.
fn parse_pair(value: &Value) -> Result<(u64, u64)> {
    let dims = value
        .as_array()
        .filter(|a| a.len() >= 2)
        .ok_or_else(|| FetchError::Metadata(format!("expected [width, height], got {value}")))?;
    Ok((parse_dim(&dims[0])?, parse_dim(&dims[1])?))
}

fn parse_dim(value: &Value) -> Result<u64> {
    if let Some(n) = value.as_u64() {
        return Ok(n);
    }
    match value.as_f64() {
        // Allow float precision loss: extents are far below 2^53
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Some(f) if f.is_finite() && f >= 0.0 => Ok(f.ceil() as u64),
        _ => Err(FetchError::Metadata(format!("invalid dimension {value}"))),
    }
}
