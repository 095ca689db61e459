//! Origin access: metadata and pixel-region retrieval over HTTP.
//!
//! The pipeline talks to an origin through the [`Origin`] trait, so it can run
//! against the HTTP [`OriginClient`] or any in-process source. Region requests
//! are retried with [`with_retry`] according to a [`RetryPolicy`].

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::config::{Credentials, FetchConfig};
use crate::error::{FetchError, Result};
use crate::grid::PatchDescriptor;
use crate::metadata::{ApiVariant, ImageMetadata, ResolvedLevel};
use crate::raster::RasterBuffer;

/// Upper bound for a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A source of image metadata and decoded pixel regions.
pub trait Origin: Send + Sync {
    /// Fetch and parse the metadata document of one image.
    fn fetch_metadata(&self, project: &str, image: &str) -> impl Future<Output = Result<ImageMetadata>> + Send;

    /// Fetch and decode one region.
    fn fetch_region(&self, request: &RegionRequest) -> impl Future<Output = Result<RasterBuffer>> + Send;
}

/// One region of one z-plane at one origin level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionRequest {
    pub project: String,
    pub image: String,
    /// Level as the origin indexes it
    pub level: u32,
    pub z: u32,
    /// Top-left pixel (x, y)
    pub start: (usize, usize),
    /// Bottom-right pixel (x, y), exclusive
    pub end: (usize, usize),
    pub variant: ApiVariant,
}

impl RegionRequest {
    /// Request for one grid patch of a resolved image.
    #[must_use]
    pub fn for_patch(config: &FetchConfig, resolved: &ResolvedLevel, patch: &PatchDescriptor) -> Self {
        Self {
            project: config.project.clone(),
            image: config.image.clone(),
            level: resolved.region_level,
            z: config.z,
            start: patch.start,
            end: patch.end,
            variant: resolved.variant,
        }
    }

    /// Requested size (width, height).
    #[must_use]
    pub fn size(&self) -> (usize, usize) {
        (self.end.0 - self.start.0, self.end.1 - self.start.1)
    }

    /// Path below the API root.
    ///
    /// The current API addresses a region by start and size with `z` after
    /// the start coordinates; the legacy API puts `z` after the level and
    /// uses an inclusive end corner.
    #[must_use]
    pub fn path(&self) -> String {
        let (x, y) = self.start;
        let prefix = format!("projects/{}/images/{}/region/{}", self.project, self.image, self.level);
        match self.variant {
            ApiVariant::Current => {
                let (w, h) = self.size();
                format!("{prefix}/start/{x}/{y}/{}/size/{w}/{h}", self.z)
            }
            ApiVariant::Legacy => format!(
                "{prefix}/{}/start/{x}/{y}/end/{}/{}",
                self.z,
                self.end.0 - 1,
                self.end.1 - 1
            ),
        }
    }
}

/// Bounded exponential backoff for retryable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_backoff(),
        }
    }

    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Run `op`, retrying retryable errors up to `policy.max_retries` times.
///
/// # Errors
/// Returns the first non-retryable error, or the last error once retries are
/// exhausted.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                attempt += 1;
                warn!(
                    what,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Retrying after network failure"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Map an HTTP status to the error taxonomy. Success statuses pass.
///
/// # Errors
/// 401 and 403 are [`FetchError::Authentication`]; any other non-success
/// status is a retryable [`FetchError::Network`].
pub fn check_status(url: &str, status: StatusCode) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(FetchError::Authentication {
            url: url.to_string(),
            reason: format!("HTTP {status}"),
        });
    }
    Err(FetchError::Network {
        url: url.to_string(),
        status: Some(status.as_u16()),
        message: status.canonical_reason().unwrap_or("unexpected status").to_string(),
    })
}

/// Decode a region response, checking it matches the requested size.
///
/// # Errors
/// Returns [`FetchError::Decode`] with the URL, status and raw body when the
/// body is not an image or has the wrong dimensions.
pub fn decode_region(url: &str, status: u16, body: Bytes, expected: (usize, usize)) -> Result<RasterBuffer> {
    let raster = match RasterBuffer::decode_sized(&body, expected.0, expected.1) {
        Ok(raster) => raster,
        Err(e) => {
            return Err(FetchError::Decode {
                url: url.to_string(),
                status,
                body,
                message: e.to_string(),
            })
        }
    };
    if (raster.width, raster.height) != expected {
        return Err(FetchError::Decode {
            url: url.to_string(),
            status,
            body,
            message: format!(
                "expected a {}x{} region, got {}x{}",
                expected.0, expected.1, raster.width, raster.height
            ),
        });
    }
    Ok(raster)
}

/// HTTP client for a tile origin using basic authentication.
#[derive(Debug, Clone)]
pub struct OriginClient {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<Credentials>,
}

impl OriginClient {
    /// Build a client from the run configuration.
    ///
    /// # Errors
    /// Returns [`FetchError::Network`] if the HTTP client cannot be built.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials: config.credentials.clone(),
        })
    }

    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    #[must_use]
    pub fn metadata_url(&self, project: &str, image: &str) -> String {
        self.url(&format!("projects/{project}/images/{image}"))
    }

    async fn get(&self, url: &str) -> Result<(StatusCode, Bytes)> {
        let mut request = self.client.get(url);
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        Ok((status, body))
    }
}

impl Origin for OriginClient {
    async fn fetch_metadata(&self, project: &str, image: &str) -> Result<ImageMetadata> {
        let url = self.metadata_url(project, image);
        let (status, body) = self.get(&url).await?;
        check_status(&url, status)?;

        let document: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| FetchError::Metadata(format!("response from {url} is not JSON: {e}")))?;
        ImageMetadata::from_json(&url, &document)
    }

    async fn fetch_region(&self, request: &RegionRequest) -> Result<RasterBuffer> {
        let url = self.url(&request.path());
        let (status, body) = self.get(&url).await?;
        check_status(&url, status)?;
        debug!(url = %url, bytes = body.len(), "Region received");

        let expected = request.size();
        let status = status.as_u16();
        tokio::task::spawn_blocking(move || decode_region(&url, status, body, expected))
            .await
            .map_err(|e| FetchError::Io(std::io::Error::other(e)))?
    }
}
