//! Error taxonomy for the fetch-and-assemble pipeline.
//!
//! Every stage reports through [`FetchError`]. Only [`FetchError::Network`] is
//! retryable; everything else aborts the run.

use bytes::Bytes;
use thiserror::Error;

/// Maximum number of body bytes rendered in error messages.
const BODY_PREVIEW_BYTES: usize = 512;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FetchError>;

#[derive(Debug, Error)]
pub enum FetchError {
    /// Credentials were rejected by the origin.
    #[error("authentication failed for {url}: {reason}")]
    Authentication { url: String, reason: String },

    /// Metadata payload is malformed or lacks a required field.
    #[error("invalid image metadata: {0}")]
    Metadata(String),

    /// Transport failure or non-success HTTP status.
    #[error("request to {url} failed{}: {message}", status_suffix(.status))]
    Network {
        url: String,
        status: Option<u16>,
        message: String,
    },

    /// Response body could not be decoded as an image.
    #[error(
        "could not decode response from {url} (HTTP {status}): {message}; body: {}",
        body_preview(.body)
    )]
    Decode {
        url: String,
        status: u16,
        body: Bytes,
        message: String,
    },

    /// Physical pixel size that cannot be converted to a resolution.
    #[error("invalid physical pixel size on {axis} axis: {value} µm")]
    Resolution { axis: char, value: f64 },

    #[error("invalid patch grid: {0}")]
    InvalidGrid(String),

    #[error("assembly failed: {0}")]
    Assembly(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TIFF encoding error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JPEG tile encoding error: {0}")]
    Jpeg(#[from] jpeg_encoder::EncodingError),
}

impl FetchError {
    /// Whether a retry of the same request may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    /// URL of the request that caused this error, if any.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Authentication { url, .. }
            | Self::Network { url, .. }
            | Self::Decode { url, .. } => Some(url),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network {
            url: e.url().map(ToString::to_string).unwrap_or_default(),
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" with HTTP {s}")).unwrap_or_default()
}

fn body_preview(body: &Bytes) -> String {
    if body.is_empty() {
        return "<empty>".to_string();
    }
    let shown = &body[..body.len().min(BODY_PREVIEW_BYTES)];
    let mut preview = String::from_utf8_lossy(shown).into_owned();
    if body.len() > BODY_PREVIEW_BYTES {
        preview.push_str(&format!("... ({} bytes total)", body.len()));
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_is_retryable() {
        let network = FetchError::Network {
            url: "http://origin/x".to_string(),
            status: Some(503),
            message: "unavailable".to_string(),
        };
        assert!(network.is_retryable());

        let auth = FetchError::Authentication {
            url: "http://origin/x".to_string(),
            reason: "HTTP 401".to_string(),
        };
        assert!(!auth.is_retryable());
        assert!(!FetchError::Metadata("missing extent".to_string()).is_retryable());
    }

    #[test]
    fn test_decode_error_carries_url_and_body() {
        let err = FetchError::Decode {
            url: "http://origin/region".to_string(),
            status: 200,
            body: Bytes::from_static(b"<html>Internal error</html>"),
            message: "unsupported format".to_string(),
        };
        assert_eq!(err.url(), Some("http://origin/region"));
        let text = err.to_string();
        assert!(text.contains("http://origin/region"));
        assert!(text.contains("HTTP 200"));
        assert!(text.contains("<html>Internal error</html>"));
    }

    #[test]
    fn test_body_preview_truncates() {
        let body = Bytes::from(vec![b'a'; BODY_PREVIEW_BYTES * 2]);
        let preview = body_preview(&body);
        assert!(preview.ends_with(&format!("({} bytes total)", BODY_PREVIEW_BYTES * 2)));
        assert_eq!(body_preview(&Bytes::new()), "<empty>");
    }

    #[test]
    fn test_network_message_with_and_without_status() {
        let with = FetchError::Network {
            url: "u".to_string(),
            status: Some(502),
            message: "bad gateway".to_string(),
        };
        assert_eq!(with.to_string(), "request to u failed with HTTP 502: bad gateway");

        let without = FetchError::Network {
            url: "u".to_string(),
            status: None,
            message: "connection reset".to_string(),
        };
        assert_eq!(without.to_string(), "request to u failed: connection reset");
    }
}
