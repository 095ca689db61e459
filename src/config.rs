//! Run configuration.
//!
//! A [`FetchConfig`] is built once at startup, either in code with the `with_*`
//! builders or from a TOML file, and passed by reference to every stage.
//!
//! ```toml
//! base_url = "https://histoapp.mevis.fraunhofer.de/api/v1"
//! project = "project"
//! image = "slide.sqreg"
//! level = 4
//! z = 0
//! patch_size = 8192
//! concurrency = 4
//! assembly = "join"
//!
//! [credentials]
//! username = "user"
//! password = "secret"
//!
//! [writer]
//! tile_size = 256
//! quality = 75
//! rgb_jpeg = false
//! fallback_pixels_per_mm = 4000.0
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::assemble::AssemblyStrategy;
use crate::error::{FetchError, Result};
use crate::metadata::ApiVariant;
use crate::pyramid_writer::WriterOptions;

pub const DEFAULT_BASE_URL: &str = "https://histoapp.mevis.fraunhofer.de/api/v1";
pub const DEFAULT_PATCH_SIZE: usize = 8192;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// HTTP basic credentials.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything one fetch-and-assemble run needs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    /// Origin API root, e.g. `https://host/api/v1`
    pub base_url: String,
    pub project: String,
    pub image: String,
    /// Requested pyramid level, 0 = finest
    pub level: u32,
    /// Axial plane passed through to region requests
    pub z: u32,
    /// Nominal square patch edge in pixels
    pub patch_size: usize,
    pub credentials: Option<Credentials>,
    /// Force an origin API generation instead of detecting it
    pub api_variant: Option<ApiVariant>,
    /// Maximum in-flight region requests
    pub concurrency: usize,
    /// Retries per region after a network failure
    pub max_retries: u32,
    /// First retry delay; doubles per attempt
    pub retry_backoff_ms: u64,
    pub request_timeout_secs: u64,
    pub assembly: AssemblyStrategy,
    /// Channels of the preallocated canvas (direct assembly)
    pub canvas_channels: usize,
    /// Parent for the join strategy's temporary directory
    pub scratch_dir: Option<PathBuf>,
    /// Output file; defaults to `{image}_{level}_{z}.tif`
    pub output: Option<PathBuf>,
    pub writer: WriterOptions,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            project: String::new(),
            image: String::new(),
            level: 0,
            z: 0,
            patch_size: DEFAULT_PATCH_SIZE,
            credentials: None,
            api_variant: None,
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: 500,
            request_timeout_secs: 120,
            assembly: AssemblyStrategy::default(),
            canvas_channels: 3,
            scratch_dir: None,
            output: None,
            writer: WriterOptions::default(),
        }
    }
}

impl FetchConfig {
    /// Configuration for one image with default settings.
    pub fn new(base_url: impl Into<String>, project: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            project: project.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    /// Returns [`FetchError::Config`] on syntax errors or unknown keys.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| FetchError::Config(e.to_string()))
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    /// Returns [`FetchError::Io`] if the file cannot be read, or
    /// [`FetchError::Config`] if it does not parse.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text).map_err(|e| match e {
            FetchError::Config(msg) => {
                FetchError::Config(format!("{}: {msg}", path.as_ref().display()))
            }
            other => other,
        })
    }

    #[must_use]
    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }

    #[must_use]
    pub fn with_z(mut self, z: u32) -> Self {
        self.z = z;
        self
    }

    #[must_use]
    pub fn with_patch_size(mut self, patch_size: usize) -> Self {
        self.patch_size = patch_size;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    #[must_use]
    pub fn with_api_variant(mut self, variant: ApiVariant) -> Self {
        self.api_variant = Some(variant);
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_assembly(mut self, assembly: AssemblyStrategy) -> Self {
        self.assembly = assembly;
        self
    }

    #[must_use]
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_writer(mut self, writer: WriterOptions) -> Self {
        self.writer = writer;
        self
    }

    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Output path, falling back to `{image}_{level}_{z}.tif` in the working directory.
    #[must_use]
    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}_{}_{}.tif", self.image, self.level, self.z)))
    }

    /// Check values that would otherwise fail deep inside a run.
    ///
    /// # Errors
    /// Returns [`FetchError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(FetchError::Config(msg.to_string()));

        if self.base_url.trim().is_empty() {
            return fail("base_url must not be empty");
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return fail("base_url must be an http(s) URL");
        }
        if self.project.is_empty() || self.image.is_empty() {
            return fail("project and image must be set");
        }
        if self.patch_size == 0 {
            return fail("patch_size must be positive");
        }
        if self.concurrency == 0 {
            return fail("concurrency must be at least 1");
        }
        if !(1..=4).contains(&self.canvas_channels) {
            return fail("canvas_channels must be between 1 and 4");
        }
        self.writer.validate()
    }
}
